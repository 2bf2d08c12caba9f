//! End-to-end calling scenarios driven through the full caller loop.

use rust_htslib::bam::record::{Cigar, CigarString};

use nautilus::calling::caller::{Caller, CallerParameters, RefCallType};
use nautilus::calling::individual::{IndividualCallerParameters, IndividualCallerStrategy};
use nautilus::calling::trio::{TrioCallerParameters, TrioCallerStrategy};
use nautilus::candidates::{CandidateGenerator, CandidateGeneratorConfig};
use nautilus::genome::GenomicRegion;
use nautilus::model::priors::{CoalescentModel, GenotypePriorModel};
use nautilus::reads::pipe::{ReadMap, ReadPipe, ReadPipeConfig};
use nautilus::reads::{AlignedRead, ReadFlags};
use nautilus::reference::{AmbiguityPolicy, Reference};

fn reference(contig: &str, sequence: &[u8]) -> Reference {
    Reference::from_sequences(
        vec![(contig.to_owned(), sequence.to_vec())],
        AmbiguityPolicy::Maintain,
    )
}

fn dummy_pipe() -> ReadPipe {
    ReadPipe::new(Vec::new(), 1, ReadPipeConfig::default())
}

fn matched_read(contig: &str, begin: u64, sequence: &[u8], name: String) -> AlignedRead {
    AlignedRead::new(
        GenomicRegion::new(contig, begin, begin + sequence.len() as u64),
        name.into_bytes(),
        sequence.to_vec(),
        vec![30; sequence.len()],
        CigarString(vec![Cigar::Match(sequence.len() as u32)]),
        60,
        ReadFlags::default(),
        0,
    )
}

fn candidate_config() -> CandidateGeneratorConfig {
    CandidateGeneratorConfig {
        assembly_candidates: false,
        ..Default::default()
    }
}

#[test]
fn het_snv_is_called_and_genotyped() {
    // half the reads support the reference, half an SNV at position 104
    let mut sequence = vec![b'C'; 200];
    sequence[100..108].copy_from_slice(b"ACGTACGT");
    let reference = reference("chr1", &sequence);
    let pipe = dummy_pipe();
    let mut reads = ReadMap::new();
    let mut sample_reads = Vec::new();
    for i in 0..10 {
        sample_reads.push(matched_read("chr1", 100, b"ACGTACGT", format!("ref{}", i)));
        sample_reads.push(matched_read("chr1", 100, b"ACGTTCGT", format!("alt{}", i)));
    }
    sample_reads.sort();
    reads.insert("s1".to_owned(), sample_reads);
    let strategy = IndividualCallerStrategy::new(
        "s1".to_owned(),
        GenotypePriorModel::Coalescent(CoalescentModel::default()),
        IndividualCallerParameters::default(),
    );
    let mut caller = Caller::new(
        &reference,
        &pipe,
        CandidateGenerator::new(candidate_config()),
        strategy,
        CallerParameters::default(),
    );
    let records = caller
        .call_with_reads(&GenomicRegion::new("chr1", 90, 120), reads)
        .unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.pos, 104);
    assert_eq!(record.ref_allele, b"A");
    assert_eq!(record.alt_alleles, vec![b"T".to_vec()]);
    assert!(record.qual >= 30.0);
    let sample = &record.samples[0];
    assert!(sample.genotype_quality >= 30);
    // heterozygous: one reference and one alternative chromosome
    let mut genotype = sample.genotype.clone();
    genotype.sort();
    assert_eq!(genotype, vec![b"A".to_vec(), b"T".to_vec()]);
}

#[test]
fn homozygous_insertion_gets_anchor_padding() {
    let mut sequence = vec![b'C'; 40];
    sequence[10..14].copy_from_slice(b"AAAA");
    let reference = reference("chr1", &sequence);
    let pipe = dummy_pipe();
    let mut reads = ReadMap::new();
    let mut sample_reads = Vec::new();
    for i in 0..30 {
        // AA G AA over the AAAA block: an insertion of G after position 11
        let read = AlignedRead::new(
            GenomicRegion::new("chr1", 10, 14),
            format!("ins{}", i).into_bytes(),
            b"AAGAA".to_vec(),
            vec![30; 5],
            CigarString(vec![Cigar::Match(2), Cigar::Ins(1), Cigar::Match(2)]),
            60,
            ReadFlags::default(),
            0,
        );
        sample_reads.push(read);
    }
    sample_reads.sort();
    reads.insert("s1".to_owned(), sample_reads);
    let strategy = IndividualCallerStrategy::new(
        "s1".to_owned(),
        GenotypePriorModel::Coalescent(CoalescentModel::default()),
        IndividualCallerParameters::default(),
    );
    let mut caller = Caller::new(
        &reference,
        &pipe,
        CandidateGenerator::new(candidate_config()),
        strategy,
        CallerParameters::default(),
    );
    let records = caller
        .call_with_reads(&GenomicRegion::new("chr1", 5, 20), reads)
        .unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    // the insertion is anchored on the base before it
    assert_eq!(record.pos, 11);
    assert_eq!(record.ref_allele, b"A");
    assert_eq!(record.alt_alleles, vec![b"AG".to_vec()]);
    let sample = &record.samples[0];
    assert_eq!(sample.genotype, vec![b"AG".to_vec(), b"AG".to_vec()]);
    assert!(sample
        .genotype
        .iter()
        .all(|allele| !allele.contains(&b'*')));
}

#[test]
fn trio_denovo_snv_is_tagged() {
    let mut sequence = vec![b'A'; 100];
    sequence[40..60].copy_from_slice(b"GGCATCGATCCGGCTACGTT");
    let reference = reference("chr2", &sequence);
    let pipe = dummy_pipe();
    let site = 50; // the C in GATCC..
    let mut alt_sequence = sequence.clone();
    alt_sequence[site] = b'T';
    let mut reads = ReadMap::new();
    let window = 40..60;
    let make = |source: &[u8], n: usize, tag: &str| {
        let mut result = Vec::new();
        for i in 0..n {
            result.push(matched_read(
                "chr2",
                window.start as u64,
                &source[window.clone()],
                format!("{}{}", tag, i),
            ));
        }
        result.sort();
        result
    };
    reads.insert("mother".to_owned(), make(&sequence, 30, "m"));
    reads.insert("father".to_owned(), make(&sequence, 30, "f"));
    let mut child_reads = make(&sequence, 15, "cr");
    child_reads.extend(make(&alt_sequence, 15, "ca"));
    child_reads.sort();
    reads.insert("child".to_owned(), child_reads);
    let strategy = TrioCallerStrategy::new(
        "mother".to_owned(),
        "father".to_owned(),
        "child".to_owned(),
        GenotypePriorModel::Coalescent(CoalescentModel::default()),
        TrioCallerParameters::default(),
    )
    .unwrap();
    let mut caller = Caller::new(
        &reference,
        &pipe,
        CandidateGenerator::new(candidate_config()),
        strategy,
        CallerParameters::default(),
    );
    let records = caller
        .call_with_reads(&GenomicRegion::new("chr2", 30, 70), reads)
        .unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.pos, site as u64);
    assert_eq!(record.alt_alleles, vec![b"T".to_vec()]);
    let denovo = record.denovo.expect("expected a de novo tag");
    assert!(denovo >= 20.0);
}

#[test]
fn empty_region_emits_nothing() {
    let reference = reference("chr1", &vec![b'A'; 100]);
    let pipe = dummy_pipe();
    let strategy = IndividualCallerStrategy::new(
        "s1".to_owned(),
        GenotypePriorModel::Coalescent(CoalescentModel::default()),
        IndividualCallerParameters::default(),
    );
    let mut caller = Caller::new(
        &reference,
        &pipe,
        CandidateGenerator::new(candidate_config()),
        strategy,
        CallerParameters::default(),
    );
    let records = caller
        .call_with_reads(&GenomicRegion::new("chr1", 0, 100), ReadMap::new())
        .unwrap();
    assert!(records.is_empty());
}

#[test]
fn records_are_ordered_within_contig() {
    let mut sequence = vec![b'C'; 200];
    sequence[100..120].copy_from_slice(b"ACGTACGTACGTACGTACGT");
    let reference = reference("chr1", &sequence);
    let pipe = dummy_pipe();
    let mut with_two_snvs = sequence[100..120].to_vec();
    with_two_snvs[4] = b'T'; // position 104
    with_two_snvs[14] = b'A'; // position 114
    let mut reads = ReadMap::new();
    let mut sample_reads = Vec::new();
    for i in 0..10 {
        sample_reads.push(matched_read(
            "chr1",
            100,
            &sequence[100..120],
            format!("ref{}", i),
        ));
        sample_reads.push(matched_read("chr1", 100, &with_two_snvs, format!("alt{}", i)));
    }
    sample_reads.sort();
    reads.insert("s1".to_owned(), sample_reads);
    let strategy = IndividualCallerStrategy::new(
        "s1".to_owned(),
        GenotypePriorModel::Coalescent(CoalescentModel::default()),
        IndividualCallerParameters::default(),
    );
    let mut caller = Caller::new(
        &reference,
        &pipe,
        CandidateGenerator::new(candidate_config()),
        strategy,
        CallerParameters::default(),
    );
    let records = caller
        .call_with_reads(&GenomicRegion::new("chr1", 90, 130), reads)
        .unwrap();
    assert_eq!(records.len(), 2);
    assert!(records[0].pos < records[1].pos);
    // both sites phased into the same set when jointly resolved
    for record in records.iter() {
        assert_eq!(record.alt_alleles.len(), 1);
    }
}

#[test]
fn refcall_blocks_cover_uncalled_intervals() {
    let mut sequence = vec![b'C'; 60];
    sequence[20..28].copy_from_slice(b"ACGTACGT");
    let reference = reference("chr1", &sequence);
    let pipe = dummy_pipe();
    let mut reads = ReadMap::new();
    let mut sample_reads = Vec::new();
    for i in 0..10 {
        sample_reads.push(matched_read("chr1", 20, b"ACGTACGT", format!("r{}", i)));
        sample_reads.push(matched_read("chr1", 20, b"ACGTTCGT", format!("a{}", i)));
    }
    sample_reads.sort();
    reads.insert("s1".to_owned(), sample_reads);
    let strategy = IndividualCallerStrategy::new(
        "s1".to_owned(),
        GenotypePriorModel::Coalescent(CoalescentModel::default()),
        IndividualCallerParameters::default(),
    );
    let mut caller = Caller::new(
        &reference,
        &pipe,
        CandidateGenerator::new(candidate_config()),
        strategy,
        CallerParameters {
            refcall_type: RefCallType::Blocked,
            ..Default::default()
        },
    );
    let records = caller
        .call_with_reads(&GenomicRegion::new("chr1", 15, 35), reads)
        .unwrap();
    // the variant record plus at least one reference block
    assert!(records.len() >= 2);
    assert!(records.iter().any(|r| !r.alt_alleles.is_empty()));
    assert!(records.iter().any(|r| r.alt_alleles.is_empty()));
}
