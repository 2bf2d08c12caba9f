//! Per-sample read-to-haplotype likelihood matrices with caching.

use std::collections::HashMap;

use bio::stats::LogProb;

use crate::genome::GenomicRegion;
use crate::reads::pipe::ReadMap;
use crate::reads::AlignedRead;
use crate::variants::Haplotype;
use crate::SampleName;

pub mod filter;
pub mod pairhmm;

pub use pairhmm::{FlankClearance, GapParams, PairHmm};

/// The active/inactive breakdown of the haplotype region, in reference
/// coordinates. Bases on inactive flanks are scored leniently because the
/// flanks carry their own error mass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlankState {
    pub active_region: GenomicRegion,
    pub left_flank: GenomicRegion,
    pub right_flank: GenomicRegion,
}

impl FlankState {
    /// Translate the reference-space flanks into haplotype-local prefix and
    /// suffix lengths.
    fn clearance(&self, haplotype: &Haplotype) -> FlankClearance {
        let left = haplotype
            .expressed(&self.left_flank)
            .map_or(0, |s| s.len());
        let right = haplotype
            .expressed(&self.right_flank)
            .map_or(0, |s| s.len());
        FlankClearance { left, right }
    }
}

/// Identity of a read for caching purposes.
type ReadKey = (Vec<u8>, GenomicRegion);

fn read_key(read: &AlignedRead) -> ReadKey {
    (read.name().to_vec(), read.region().clone())
}

/// Cached log-likelihoods for the active haplotype set, one matrix row per
/// haplotype, one column per read of a sample.
pub struct HaplotypeLikelihoodArray {
    hmm: PairHmm,
    samples: Vec<SampleName>,
    matrices: HashMap<SampleName, Vec<Vec<LogProb>>>,
    haplotypes: Vec<Haplotype>,
    cache: HashMap<(Haplotype, ReadKey), LogProb>,
    primed: Option<SampleName>,
}

impl HaplotypeLikelihoodArray {
    pub fn new(samples: Vec<SampleName>) -> Self {
        HaplotypeLikelihoodArray {
            hmm: PairHmm::default(),
            samples,
            matrices: HashMap::new(),
            haplotypes: Vec::new(),
            cache: HashMap::new(),
            primed: None,
        }
    }

    pub fn samples(&self) -> &[SampleName] {
        &self.samples
    }

    pub fn haplotypes(&self) -> &[Haplotype] {
        &self.haplotypes
    }

    /// Fill the matrices for the given reads and haplotypes. Previously
    /// computed (read, haplotype) pairs are reused from the cache.
    pub fn populate(
        &mut self,
        reads: &ReadMap,
        haplotypes: &[Haplotype],
        flank_state: Option<&FlankState>,
    ) {
        self.matrices.clear();
        self.haplotypes = haplotypes.to_vec();
        for sample in &self.samples {
            let sample_reads: &[AlignedRead] =
                reads.get(sample).map_or(&[], |reads| reads.as_slice());
            let mut matrix = Vec::with_capacity(haplotypes.len());
            for haplotype in haplotypes {
                let clearance = flank_state
                    .map(|fs| fs.clearance(haplotype))
                    .unwrap_or_default();
                let mut row = Vec::with_capacity(sample_reads.len());
                for read in sample_reads {
                    let key = (haplotype.clone(), read_key(read));
                    let likelihood = match self.cache.get(&key) {
                        Some(cached) => *cached,
                        None => {
                            let computed = self.hmm.likelihood(
                                haplotype.sequence(),
                                read.sequence(),
                                read.base_qualities(),
                                clearance,
                            );
                            self.cache.insert(key, computed);
                            computed
                        }
                    };
                    row.push(likelihood);
                }
                matrix.push(row);
            }
            self.matrices.insert(sample.clone(), matrix);
        }
    }

    /// Restrict subsequent primed queries to this sample's reads.
    pub fn prime(&mut self, sample: &SampleName) {
        self.primed = Some(sample.clone());
    }

    pub fn unprime(&mut self) {
        self.primed = None;
    }

    /// Likelihood row of the primed sample for a haplotype index.
    pub fn primed_row(&self, haplotype_index: usize) -> &[LogProb] {
        let sample = self
            .primed
            .as_ref()
            .expect("likelihood array queried without priming");
        &self.matrices[sample][haplotype_index]
    }

    pub fn row(&self, sample: &SampleName, haplotype_index: usize) -> &[LogProb] {
        &self.matrices[sample][haplotype_index]
    }

    pub fn num_reads(&self, sample: &SampleName) -> usize {
        self.matrices
            .get(sample)
            .and_then(|m| m.first())
            .map_or(0, |row| row.len())
    }

    /// Drop the rows of removed haplotypes, keeping the remaining rows in
    /// haplotype order.
    pub fn erase(&mut self, removed: &[Haplotype]) {
        if removed.is_empty() {
            return;
        }
        let keep: Vec<bool> = self
            .haplotypes
            .iter()
            .map(|h| !removed.contains(h))
            .collect();
        for matrix in self.matrices.values_mut() {
            let mut index = 0;
            matrix.retain(|_| {
                let result = keep[index];
                index += 1;
                result
            });
        }
        let mut index = 0;
        self.haplotypes.retain(|_| {
            let result = keep[index];
            index += 1;
            result
        });
    }

    /// Forget everything, including the cross-window cache.
    pub fn clear(&mut self) {
        self.matrices.clear();
        self.haplotypes.clear();
        self.cache.clear();
        self.primed = None;
    }
}

/// Collapse sequence-identical haplotypes, keeping the least complex
/// representative (fewest applied alleles, i.e. the highest prior under a
/// mutation-counting model). Returns the number removed.
pub fn remove_duplicate_haplotypes(haplotypes: &mut Vec<Haplotype>) -> usize {
    let before = haplotypes.len();
    haplotypes.sort_by(|a, b| {
        a.region()
            .cmp(b.region())
            .then_with(|| a.sequence().cmp(b.sequence()))
            .then_with(|| a.num_alleles().cmp(&b.num_alleles()))
    });
    haplotypes.dedup_by(|a, b| a.region() == b.region() && a.sequence() == b.sequence());
    before - haplotypes.len()
}

#[cfg(test)]
pub mod tests_support {
    use super::*;
    use crate::reads::tests::mock_read;
    use crate::reference::tests::mock_reference;
    use crate::variants::Allele;

    /// A two-haplotype array (reference and an SNV alternative) populated
    /// with two reference-supporting reads.
    pub fn populated_array() -> (Vec<Haplotype>, HaplotypeLikelihoodArray) {
        let reference = mock_reference("chr1", b"ACGTACGT");
        let region = GenomicRegion::new("chr1", 0, 8);
        let reference_hap = Haplotype::reference(region.clone(), &reference).unwrap();
        let alt = Haplotype::build(
            region,
            vec![Allele::new(GenomicRegion::new("chr1", 4, 5), b"T".to_vec())],
            &reference,
        )
        .unwrap();
        let mut reads: Vec<_> = (0..2)
            .map(|i| {
                let mut read = mock_read("chr1", 0, b"ACGTACGT", 30);
                read.name_mut().push(b'0' + i as u8);
                read
            })
            .collect();
        reads.sort();
        let mut map = ReadMap::new();
        map.insert("s1".to_owned(), reads);
        let haplotypes = vec![reference_hap, alt];
        let mut array = HaplotypeLikelihoodArray::new(vec!["s1".to_owned()]);
        array.populate(&map, &haplotypes, None);
        (haplotypes, array)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reads::tests::mock_read;
    use crate::reference::tests::mock_reference;
    use crate::variants::Allele;

    fn haplotypes() -> (Haplotype, Haplotype) {
        let reference = mock_reference("chr1", b"ACGTACGT");
        let region = GenomicRegion::new("chr1", 0, 8);
        let reference_hap = Haplotype::reference(region.clone(), &reference).unwrap();
        let alt = Haplotype::build(
            region,
            vec![Allele::new(GenomicRegion::new("chr1", 4, 5), b"T".to_vec())],
            &reference,
        )
        .unwrap();
        (reference_hap, alt)
    }

    fn read_map(sample: &str, sequences: &[&[u8]]) -> ReadMap {
        let mut reads: Vec<_> = sequences
            .iter()
            .enumerate()
            .map(|(i, seq)| {
                let mut read = mock_read("chr1", 0, seq, 30);
                read.name_mut().push(b'0' + i as u8);
                read
            })
            .collect();
        reads.sort();
        let mut map = ReadMap::new();
        map.insert(sample.to_owned(), reads);
        map
    }

    #[test]
    fn test_populate_and_query() {
        let (reference_hap, alt) = haplotypes();
        let reads = read_map("s1", &[b"ACGTACGT", b"ACGTTCGT"]);
        let mut array = HaplotypeLikelihoodArray::new(vec!["s1".to_owned()]);
        array.populate(&reads, &[reference_hap.clone(), alt.clone()], None);
        let ref_row = array.row(&"s1".to_owned(), 0);
        let alt_row = array.row(&"s1".to_owned(), 1);
        assert_eq!(ref_row.len(), 2);
        // each read is better explained by its own haplotype
        assert!(ref_row[0] > alt_row[0]);
        assert!(alt_row[1] > ref_row[1]);
    }

    #[test]
    fn test_erase_removes_rows() {
        let (reference_hap, alt) = haplotypes();
        let reads = read_map("s1", &[b"ACGTACGT"]);
        let mut array = HaplotypeLikelihoodArray::new(vec!["s1".to_owned()]);
        array.populate(&reads, &[reference_hap.clone(), alt.clone()], None);
        array.erase(&[reference_hap]);
        assert_eq!(array.haplotypes().len(), 1);
        assert_eq!(array.haplotypes()[0], alt);
        assert_eq!(array.row(&"s1".to_owned(), 0).len(), 1);
    }

    #[test]
    fn test_duplicate_haplotypes_collapse_to_least_complex() {
        let reference = mock_reference("chr1", b"ACGTACGT");
        let region = GenomicRegion::new("chr1", 0, 8);
        // applying the reference base as an "allele" produces a duplicate of
        // the plain reference haplotype with more alleles
        let redundant = Haplotype::build(
            region.clone(),
            vec![Allele::new(GenomicRegion::new("chr1", 4, 5), b"A".to_vec())],
            &reference,
        )
        .unwrap();
        let plain = Haplotype::reference(region, &reference).unwrap();
        let mut haplotypes = vec![redundant, plain];
        let removed = remove_duplicate_haplotypes(&mut haplotypes);
        assert_eq!(removed, 1);
        assert_eq!(haplotypes.len(), 1);
        assert!(haplotypes[0].is_reference());
    }
}
