//! Aligned reads and the fetch pipeline that prepares them for calling.

use std::cmp::Ordering;

use rust_htslib::bam;
use rust_htslib::bam::record::{Cigar, CigarString};

use crate::genome::GenomicRegion;

pub mod downsampler;
pub mod filters;
pub mod pipe;
pub mod transforms;

pub use downsampler::Downsampler;
pub use filters::ReadFilter;
pub use pipe::ReadPipe;
pub use transforms::ReadTransform;

/// Flags relevant to filtering and bias measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ReadFlags {
    pub duplicate: bool,
    pub secondary: bool,
    pub supplementary: bool,
    pub qc_fail: bool,
    pub unmapped: bool,
    pub mate_unmapped: bool,
    pub paired: bool,
    pub reverse_strand: bool,
    pub first_in_template: bool,
}

impl ReadFlags {
    fn from_record(record: &bam::Record) -> Self {
        ReadFlags {
            duplicate: record.is_duplicate(),
            secondary: record.is_secondary(),
            supplementary: record.is_supplementary(),
            qc_fail: record.is_quality_check_failed(),
            unmapped: record.is_unmapped(),
            mate_unmapped: record.is_mate_unmapped(),
            paired: record.is_paired(),
            reverse_strand: record.is_reverse(),
            first_in_template: record.is_first_in_template(),
        }
    }

    fn sort_key(&self) -> u16 {
        (self.duplicate as u16)
            | (self.secondary as u16) << 1
            | (self.supplementary as u16) << 2
            | (self.qc_fail as u16) << 3
            | (self.unmapped as u16) << 4
            | (self.mate_unmapped as u16) << 5
            | (self.paired as u16) << 6
            | (self.reverse_strand as u16) << 7
            | (self.first_in_template as u16) << 8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignedRead {
    region: GenomicRegion,
    name: Vec<u8>,
    sequence: Vec<u8>,
    base_qualities: Vec<u8>,
    cigar: CigarString,
    mapping_quality: u8,
    flags: ReadFlags,
    /// Signed template length as reported by the aligner.
    template_length: i64,
}

impl AlignedRead {
    pub fn new(
        region: GenomicRegion,
        name: Vec<u8>,
        sequence: Vec<u8>,
        base_qualities: Vec<u8>,
        cigar: CigarString,
        mapping_quality: u8,
        flags: ReadFlags,
        template_length: i64,
    ) -> Self {
        assert_eq!(sequence.len(), base_qualities.len());
        AlignedRead {
            region,
            name,
            sequence,
            base_qualities,
            cigar,
            mapping_quality,
            flags,
            template_length,
        }
    }

    pub fn from_record(contig: &str, record: &bam::Record) -> Self {
        let begin = record.pos().max(0) as u64;
        let end = record.cigar().end_pos().max(record.pos()) as u64;
        AlignedRead {
            region: GenomicRegion::new(contig, begin, end),
            name: record.qname().to_vec(),
            sequence: record.seq().as_bytes(),
            base_qualities: record.qual().to_vec(),
            cigar: CigarString(record.cigar().iter().cloned().collect()),
            mapping_quality: record.mapq(),
            flags: ReadFlags::from_record(record),
            template_length: record.insert_size(),
        }
    }

    pub fn region(&self) -> &GenomicRegion {
        &self.region
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn name_mut(&mut self) -> &mut Vec<u8> {
        &mut self.name
    }

    pub fn sequence(&self) -> &[u8] {
        &self.sequence
    }

    pub fn base_qualities(&self) -> &[u8] {
        &self.base_qualities
    }

    pub fn base_qualities_mut(&mut self) -> &mut Vec<u8> {
        &mut self.base_qualities
    }

    pub fn cigar(&self) -> &CigarString {
        &self.cigar
    }

    pub fn mapping_quality(&self) -> u8 {
        self.mapping_quality
    }

    pub fn flags(&self) -> &ReadFlags {
        &self.flags
    }

    pub fn flags_mut(&mut self) -> &mut ReadFlags {
        &mut self.flags
    }

    pub fn template_length(&self) -> i64 {
        self.template_length
    }

    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    /// Length of the soft clip at the given end of the read.
    pub fn soft_clip_len(&self, front: bool) -> usize {
        let op = if front {
            self.cigar.iter().find(|op| !matches!(op, Cigar::HardClip(_)))
        } else {
            self.cigar
                .iter()
                .rev()
                .find(|op| !matches!(op, Cigar::HardClip(_)))
        };
        match op {
            Some(Cigar::SoftClip(n)) => *n as usize,
            _ => 0,
        }
    }

    pub fn count_bases_with_quality_at_least(&self, quality: u8) -> usize {
        self.base_qualities
            .iter()
            .filter(|&&q| q >= quality)
            .count()
    }
}

impl PartialOrd for AlignedRead {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AlignedRead {
    fn cmp(&self, other: &Self) -> Ordering {
        self.region
            .cmp(&other.region)
            .then_with(|| self.flags.sort_key().cmp(&other.flags.sort_key()))
            .then_with(|| self.name.cmp(&other.name))
    }
}

/// Positional coverage of sorted reads over a region.
pub fn positional_coverage(reads: &[AlignedRead], region: &GenomicRegion) -> Vec<u32> {
    let mut coverage = vec![0u32; region.size() as usize];
    for read in reads {
        if !read.region().overlaps(region) {
            continue;
        }
        let begin = read.region().begin().max(region.begin()) - region.begin();
        let end = read.region().end().min(region.end()) - region.begin();
        for slot in &mut coverage[begin as usize..end as usize] {
            *slot += 1;
        }
    }
    coverage
}

/// Smallest region covering all reads, or `None` when there are none.
pub fn encompassing_region(reads: &[AlignedRead]) -> Option<GenomicRegion> {
    let mut result: Option<GenomicRegion> = None;
    for read in reads {
        result = Some(match result {
            None => read.region().clone(),
            Some(r) if r.same_contig(read.region()) => r.encompassing(read.region()),
            Some(r) => r,
        });
    }
    result
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub fn mock_read(
        contig: &str,
        begin: u64,
        sequence: &[u8],
        base_quality: u8,
    ) -> AlignedRead {
        let region = GenomicRegion::new(contig, begin, begin + sequence.len() as u64);
        AlignedRead::new(
            region,
            format!("read-{}-{}", begin, sequence.len()).into_bytes(),
            sequence.to_vec(),
            vec![base_quality; sequence.len()],
            CigarString(vec![Cigar::Match(sequence.len() as u32)]),
            60,
            ReadFlags::default(),
            0,
        )
    }

    #[test]
    fn test_positional_coverage() {
        let reads = vec![
            mock_read("chr1", 0, b"ACGT", 30),
            mock_read("chr1", 2, b"GTAC", 30),
        ];
        let region = GenomicRegion::new("chr1", 0, 6);
        assert_eq!(positional_coverage(&reads, &region), vec![1, 1, 2, 2, 1, 1]);
    }

    #[test]
    fn test_sort_order_is_region_flags_name() {
        let mut a = mock_read("chr1", 5, b"ACGT", 30);
        let b = mock_read("chr1", 3, b"ACGT", 30);
        a.flags.reverse_strand = true;
        let mut reads = vec![a.clone(), b.clone()];
        reads.sort();
        assert_eq!(reads[0], b);
    }
}
