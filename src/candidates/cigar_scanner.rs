//! Candidate variants from raw read alignments.

use std::collections::HashMap;

use anyhow::Result;
use rust_htslib::bam::record::Cigar;

use crate::genome::GenomicRegion;
use crate::reads::AlignedRead;
use crate::reference::Reference;
use crate::variants::Variant;

#[derive(Debug, Clone, Copy)]
pub struct CigarScannerOptions {
    /// Mismatching bases below this quality are ignored.
    pub min_base_quality: u8,
    pub max_variant_size: u64,
}

impl Default for CigarScannerOptions {
    fn default() -> Self {
        CigarScannerOptions {
            min_base_quality: crate::constants::DEFAULT_MIN_BASE_QUALITY,
            max_variant_size: crate::constants::DEFAULT_MAX_VARIANT_SIZE,
        }
    }
}

/// Extracts mismatches and indels directly from CIGAR operations. Adjacent
/// mismatches are merged into one substitution.
pub struct CigarScanner {
    options: CigarScannerOptions,
    observed: HashMap<Variant, usize>,
}

impl CigarScanner {
    pub fn new(options: CigarScannerOptions) -> Self {
        CigarScanner {
            options,
            observed: HashMap::new(),
        }
    }

    pub fn add_read(&mut self, read: &AlignedRead, reference: &Reference) -> Result<()> {
        let contig = read.region().contig().to_owned();
        let ref_window = reference.fetch(read.region())?;
        let window_begin = read.region().begin();
        let mut ref_pos = read.region().begin();
        let mut read_pos = 0usize;
        // an open run of adjacent mismatching bases
        let mut mismatch: Option<(u64, Vec<u8>, Vec<u8>)> = None;
        for op in read.cigar().iter() {
            match op {
                Cigar::Match(n) | Cigar::Equal(n) | Cigar::Diff(n) => {
                    for i in 0..*n as usize {
                        let ref_base =
                            ref_window[(ref_pos - window_begin) as usize + i].to_ascii_uppercase();
                        let read_base = read.sequence()[read_pos + i].to_ascii_uppercase();
                        let quality = read.base_qualities()[read_pos + i];
                        let is_mismatch = read_base != ref_base
                            && quality >= self.options.min_base_quality
                            && matches!(read_base, b'A' | b'C' | b'G' | b'T');
                        if is_mismatch {
                            match &mut mismatch {
                                Some((begin, ref_seq, alt_seq))
                                    if *begin + ref_seq.len() as u64 == ref_pos + i as u64 =>
                                {
                                    ref_seq.push(ref_base);
                                    alt_seq.push(read_base);
                                }
                                _ => {
                                    self.flush_mismatch(&contig, &mut mismatch);
                                    mismatch =
                                        Some((ref_pos + i as u64, vec![ref_base], vec![read_base]));
                                }
                            }
                        } else {
                            self.flush_mismatch(&contig, &mut mismatch);
                        }
                    }
                    ref_pos += u64::from(*n);
                    read_pos += *n as usize;
                }
                Cigar::Ins(n) => {
                    self.flush_mismatch(&contig, &mut mismatch);
                    let inserted = &read.sequence()[read_pos..read_pos + *n as usize];
                    let qualities = &read.base_qualities()[read_pos..read_pos + *n as usize];
                    if u64::from(*n) <= self.options.max_variant_size
                        && qualities
                            .iter()
                            .all(|&q| q >= self.options.min_base_quality)
                    {
                        let region = GenomicRegion::new(contig.clone(), ref_pos, ref_pos);
                        self.observe(Variant::new(
                            crate::variants::Allele::new(region.clone(), Vec::new()),
                            crate::variants::Allele::new(region, inserted.to_vec()),
                        ));
                    }
                    read_pos += *n as usize;
                }
                Cigar::Del(n) => {
                    self.flush_mismatch(&contig, &mut mismatch);
                    if u64::from(*n) <= self.options.max_variant_size {
                        let begin = (ref_pos - window_begin) as usize;
                        let deleted = ref_window[begin..begin + *n as usize].to_vec();
                        let region =
                            GenomicRegion::new(contig.clone(), ref_pos, ref_pos + u64::from(*n));
                        self.observe(Variant::new(
                            crate::variants::Allele::new(region.clone(), deleted),
                            crate::variants::Allele::new(region, Vec::new()),
                        ));
                    }
                    ref_pos += u64::from(*n);
                }
                Cigar::SoftClip(n) => {
                    self.flush_mismatch(&contig, &mut mismatch);
                    read_pos += *n as usize;
                }
                Cigar::RefSkip(n) => {
                    self.flush_mismatch(&contig, &mut mismatch);
                    ref_pos += u64::from(*n);
                }
                Cigar::HardClip(_) | Cigar::Pad(_) => {}
            }
        }
        self.flush_mismatch(&contig, &mut mismatch);
        Ok(())
    }

    fn flush_mismatch(&mut self, contig: &str, open: &mut Option<(u64, Vec<u8>, Vec<u8>)>) {
        if let Some((begin, ref_seq, alt_seq)) = open.take() {
            if ref_seq.len() as u64 <= self.options.max_variant_size {
                self.observe(Variant::from_sequences(contig, begin, ref_seq, alt_seq));
            }
        }
    }

    fn observe(&mut self, variant: Variant) {
        *self.observed.entry(variant).or_insert(0) += 1;
    }

    /// Variants within `region` with their support counts.
    pub fn generate(&self, region: &GenomicRegion) -> Vec<(Variant, usize)> {
        let mut result: Vec<(Variant, usize)> = self
            .observed
            .iter()
            .filter(|(v, _)| v.region().overlaps(region))
            .map(|(v, n)| (v.clone(), *n))
            .collect();
        result.sort_by(|a, b| a.0.cmp(&b.0));
        result
    }

    pub fn clear(&mut self) {
        self.observed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reads::tests::mock_read;
    use crate::reads::{AlignedRead, ReadFlags};
    use crate::reference::tests::mock_reference;
    use rust_htslib::bam::record::CigarString;

    #[test]
    fn test_snv_extraction() {
        let reference = mock_reference("chr1", b"ACGTACGT");
        let mut scanner = CigarScanner::new(CigarScannerOptions::default());
        let read = mock_read("chr1", 0, b"ACGTTCGT", 30);
        scanner.add_read(&read, &reference).unwrap();
        let candidates = scanner.generate(&GenomicRegion::new("chr1", 0, 8));
        assert_eq!(candidates.len(), 1);
        let (variant, support) = &candidates[0];
        assert_eq!(variant.region().begin(), 4);
        assert_eq!(variant.ref_allele().sequence(), b"A");
        assert_eq!(variant.alt_allele().sequence(), b"T");
        assert_eq!(*support, 1);
    }

    #[test]
    fn test_low_quality_mismatch_ignored() {
        let reference = mock_reference("chr1", b"ACGTACGT");
        let mut scanner = CigarScanner::new(CigarScannerOptions::default());
        let read = mock_read("chr1", 0, b"ACGTTCGT", 10);
        scanner.add_read(&read, &reference).unwrap();
        assert!(scanner.generate(&GenomicRegion::new("chr1", 0, 8)).is_empty());
    }

    #[test]
    fn test_adjacent_mismatches_merge() {
        let reference = mock_reference("chr1", b"ACGTACGT");
        let mut scanner = CigarScanner::new(CigarScannerOptions::default());
        let read = mock_read("chr1", 0, b"ACTGACGT", 30);
        scanner.add_read(&read, &reference).unwrap();
        let candidates = scanner.generate(&GenomicRegion::new("chr1", 0, 8));
        assert_eq!(candidates.len(), 1);
        let (variant, _) = &candidates[0];
        assert_eq!(variant.ref_allele().sequence(), b"GT");
        assert_eq!(variant.alt_allele().sequence(), b"TG");
    }

    #[test]
    fn test_indel_extraction() {
        let reference = mock_reference("chr1", b"ACGTACGT");
        let mut scanner = CigarScanner::new(CigarScannerOptions::default());
        let read = AlignedRead::new(
            GenomicRegion::new("chr1", 0, 8),
            b"r1".to_vec(),
            b"ACGTGGACGT".to_vec(),
            vec![30; 10],
            CigarString(vec![
                Cigar::Match(4),
                Cigar::Ins(2),
                Cigar::Match(4),
            ]),
            60,
            ReadFlags::default(),
            0,
        );
        scanner.add_read(&read, &reference).unwrap();
        let candidates = scanner.generate(&GenomicRegion::new("chr1", 0, 8));
        assert_eq!(candidates.len(), 1);
        let (variant, _) = &candidates[0];
        assert!(variant.alt_allele().is_insertion());
        assert_eq!(variant.alt_allele().sequence(), b"GG");
        assert_eq!(variant.region().begin(), 4);
    }

    #[test]
    fn test_support_accumulates_over_reads() {
        let reference = mock_reference("chr1", b"ACGTACGT");
        let mut scanner = CigarScanner::new(CigarScannerOptions::default());
        for i in 0..3 {
            let mut read = mock_read("chr1", 0, b"ACGTTCGT", 30);
            read.name_mut().push(b'0' + i);
            scanner.add_read(&read, &reference).unwrap();
        }
        let candidates = scanner.generate(&GenomicRegion::new("chr1", 0, 8));
        assert_eq!(candidates[0].1, 3);
    }
}
