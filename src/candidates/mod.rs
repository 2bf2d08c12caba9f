//! Candidate variant generation.
//!
//! The composite generator unions its sub-generators and enforces the
//! output contract: sorted, unique, left-aligned, parsimonious, and bounded
//! by the maximum variant size. Generation is idempotent for fixed inputs.

use std::path::PathBuf;

use anyhow::Result;

use crate::genome::GenomicRegion;
use crate::reads::AlignedRead;
use crate::reference::Reference;
use crate::variants::{normalise, Variant};

pub mod assembler;
pub mod cigar_scanner;
pub mod source;

pub use assembler::{AssemblerOptions, LocalReassembler};
pub use cigar_scanner::{CigarScanner, CigarScannerOptions};
pub use source::SourceVariants;

#[derive(Debug, Clone)]
pub struct CandidateGeneratorConfig {
    pub raw_cigar_candidates: bool,
    pub assembly_candidates: bool,
    pub candidates_from_source: Option<PathBuf>,
    /// Only call variants present in the source call set.
    pub regenotype: bool,
    pub min_base_quality: u8,
    pub min_assembler_base_quality: u8,
    pub kmer_sizes: Vec<usize>,
    pub min_supporting_reads: usize,
    pub max_variant_size: u64,
}

impl Default for CandidateGeneratorConfig {
    fn default() -> Self {
        CandidateGeneratorConfig {
            raw_cigar_candidates: true,
            assembly_candidates: true,
            candidates_from_source: None,
            regenotype: false,
            min_base_quality: crate::constants::DEFAULT_MIN_BASE_QUALITY,
            min_assembler_base_quality: 10,
            kmer_sizes: crate::constants::DEFAULT_KMER_SIZES.to_vec(),
            min_supporting_reads: crate::constants::DEFAULT_MIN_SUPPORTING_READS,
            max_variant_size: crate::constants::DEFAULT_MAX_VARIANT_SIZE,
        }
    }
}

pub struct CandidateGenerator {
    cigar: Option<CigarScanner>,
    assembler: Option<LocalReassembler>,
    source: Option<SourceVariants>,
    regenotype: bool,
    min_supporting_reads: usize,
    max_variant_size: u64,
}

impl CandidateGenerator {
    pub fn new(config: CandidateGeneratorConfig) -> Self {
        let min_supporting_reads = if config.min_supporting_reads == 0 {
            warn!("min-supporting-reads of 0 clamped to 1");
            1
        } else {
            config.min_supporting_reads
        };
        let use_reads = !config.regenotype;
        CandidateGenerator {
            cigar: (use_reads && config.raw_cigar_candidates).then(|| {
                CigarScanner::new(CigarScannerOptions {
                    min_base_quality: config.min_base_quality,
                    max_variant_size: config.max_variant_size,
                })
            }),
            assembler: (use_reads && config.assembly_candidates).then(|| {
                LocalReassembler::new(AssemblerOptions {
                    kmer_sizes: config.kmer_sizes.clone(),
                    mask_threshold: config.min_assembler_base_quality,
                    min_supporting_reads,
                    max_variant_size: config.max_variant_size,
                    ..Default::default()
                })
            }),
            source: config.candidates_from_source.map(SourceVariants::new),
            regenotype: config.regenotype,
            min_supporting_reads,
            max_variant_size: config.max_variant_size,
        }
    }

    /// Whether candidate discovery needs the region's reads.
    pub fn requires_reads(&self) -> bool {
        self.cigar.is_some() || self.assembler.is_some()
    }

    pub fn add_read(&mut self, read: &AlignedRead, reference: &Reference) -> Result<()> {
        if let Some(cigar) = &mut self.cigar {
            cigar.add_read(read, reference)?;
        }
        if let Some(assembler) = &mut self.assembler {
            assembler.add_read(read);
        }
        Ok(())
    }

    pub fn generate(
        &mut self,
        region: &GenomicRegion,
        reference: &Reference,
    ) -> Result<Vec<Variant>> {
        let mut raw: Vec<Variant> = Vec::new();
        if let Some(cigar) = &self.cigar {
            raw.extend(
                cigar
                    .generate(region)
                    .into_iter()
                    .filter(|(_, support)| *support >= self.min_supporting_reads)
                    .map(|(variant, _)| variant),
            );
        }
        if let Some(assembler) = &self.assembler {
            raw.extend(
                assembler
                    .generate(region, reference)?
                    .into_iter()
                    .map(|(variant, _)| variant),
            );
        }
        if let Some(source) = &self.source {
            let from_source = source.generate(region)?;
            if self.regenotype {
                // regenotype mode restricts calling to the supplied set;
                // an empty intersection leaves the region silent
                raw = from_source;
            } else {
                raw.extend(from_source);
            }
        }
        let mut candidates = Vec::with_capacity(raw.len());
        for variant in raw {
            let normalised = normalise(variant, reference)?;
            if normalised.size() <= self.max_variant_size {
                candidates.push(normalised);
            }
        }
        candidates.sort();
        candidates.dedup();
        Ok(candidates)
    }

    pub fn clear(&mut self) {
        if let Some(cigar) = &mut self.cigar {
            cigar.clear();
        }
        if let Some(assembler) = &mut self.assembler {
            assembler.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reads::tests::mock_read;
    use crate::reference::tests::mock_reference;

    fn config() -> CandidateGeneratorConfig {
        CandidateGeneratorConfig {
            assembly_candidates: false,
            min_supporting_reads: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_generation_is_idempotent() {
        let reference = mock_reference("chr1", b"ACGTACGTACGT");
        let mut generator = CandidateGenerator::new(config());
        for i in 0..3 {
            let mut read = mock_read("chr1", 0, b"ACGTTCGTACGT", 30);
            read.name_mut().push(b'0' + i);
            generator.add_read(&read, &reference).unwrap();
        }
        let region = GenomicRegion::new("chr1", 0, 12);
        let first = generator.generate(&region, &reference).unwrap();
        let second = generator.generate(&region, &reference).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
    }

    #[test]
    fn test_support_threshold() {
        let reference = mock_reference("chr1", b"ACGTACGTACGT");
        let mut generator = CandidateGenerator::new(config());
        let read = mock_read("chr1", 0, b"ACGTTCGTACGT", 30);
        generator.add_read(&read, &reference).unwrap();
        let region = GenomicRegion::new("chr1", 0, 12);
        assert!(generator.generate(&region, &reference).unwrap().is_empty());
    }

    #[test]
    fn test_output_sorted_unique() {
        let reference = mock_reference("chr1", b"ACGTACGTACGT");
        let mut generator = CandidateGenerator::new(CandidateGeneratorConfig {
            min_supporting_reads: 1,
            assembly_candidates: false,
            ..Default::default()
        });
        for (i, seq) in [b"ACGTTCGTACGT", b"ACGTACGTAAGT"].iter().enumerate() {
            let mut read = mock_read("chr1", 0, *seq, 30);
            read.name_mut().push(b'0' + i as u8);
            generator.add_read(&read, &reference).unwrap();
        }
        let region = GenomicRegion::new("chr1", 0, 12);
        let candidates = generator.generate(&region, &reference).unwrap();
        assert_eq!(candidates.len(), 2);
        assert!(candidates.windows(2).all(|w| w[0] < w[1]));
    }
}
