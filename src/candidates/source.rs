//! Candidate variants parsed from a supplied call set.

use std::path::PathBuf;

use anyhow::Result;
use rust_htslib::bcf::{self, Read};

use crate::errors;
use crate::genome::GenomicRegion;
use crate::variants::{Allele, Variant};

pub struct SourceVariants {
    path: PathBuf,
}

impl SourceVariants {
    pub fn new(path: PathBuf) -> Self {
        SourceVariants { path }
    }

    /// All well-formed, non-symbolic variants intersecting `region`, with
    /// VCF padding bases trimmed.
    pub fn generate(&self, region: &GenomicRegion) -> Result<Vec<Variant>> {
        let mut reader = bcf::IndexedReader::from_path(&self.path).map_err(|e| {
            errors::Error::MalformedFile {
                path: self.path.clone(),
                msg: e.to_string(),
            }
        })?;
        let rid = match reader.header().name2rid(region.contig().as_bytes()) {
            Ok(rid) => rid,
            Err(_) => return Ok(Vec::new()),
        };
        if reader.fetch(rid, region.begin(), Some(region.end())).is_err() {
            return Ok(Vec::new());
        }
        let mut result = Vec::new();
        let mut previous_pos: Option<u64> = None;
        for record in reader.records() {
            let record = record.map_err(|e| errors::Error::MalformedFile {
                path: self.path.clone(),
                msg: e.to_string(),
            })?;
            let pos = record.pos().max(0) as u64;
            if let Some(previous) = previous_pos {
                if pos < previous {
                    return Err(errors::Error::UnsortedCandidateFile {
                        previous: format!("{}:{}", region.contig(), previous),
                        current: format!("{}:{}", region.contig(), pos),
                    }
                    .into());
                }
            }
            previous_pos = Some(pos);
            let alleles = record.alleles();
            if alleles.len() < 2 {
                continue;
            }
            let ref_seq = alleles[0].to_ascii_uppercase();
            for alt in &alleles[1..] {
                if alt.first().map_or(true, |b| *b == b'<' || *b == b'*') {
                    continue;
                }
                let alt_seq = alt.to_ascii_uppercase();
                if alt_seq == ref_seq {
                    continue;
                }
                result.push(strip_padding(region.contig(), pos, &ref_seq, &alt_seq));
            }
        }
        result.sort();
        result.dedup();
        Ok(result)
    }
}

/// Drop the shared leading padding base that VCF indel records carry.
fn strip_padding(contig: &str, pos: u64, ref_seq: &[u8], alt_seq: &[u8]) -> Variant {
    let mut shared = 0;
    while shared < ref_seq.len().min(alt_seq.len()) && ref_seq[shared] == alt_seq[shared] {
        shared += 1;
    }
    let begin = pos + shared as u64;
    let region = GenomicRegion::new(
        contig,
        begin,
        begin + (ref_seq.len() - shared) as u64,
    );
    Variant::new(
        Allele::new(region.clone(), ref_seq[shared..].to_vec()),
        Allele::new(region, alt_seq[shared..].to_vec()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_padding_insertion() {
        let variant = strip_padding("chr1", 10, b"A", b"AG");
        assert!(variant.alt_allele().is_insertion());
        assert_eq!(variant.region().begin(), 11);
        assert_eq!(variant.alt_allele().sequence(), b"G");
    }

    #[test]
    fn test_strip_padding_deletion() {
        let variant = strip_padding("chr1", 10, b"ACG", b"A");
        assert!(variant.alt_allele().is_deletion());
        assert_eq!(variant.region().begin(), 11);
        assert_eq!(variant.ref_allele().sequence(), b"CG");
    }

    #[test]
    fn test_snv_unchanged() {
        let variant = strip_padding("chr1", 10, b"A", b"T");
        assert_eq!(variant.region().begin(), 10);
        assert_eq!(variant.ref_allele().sequence(), b"A");
        assert_eq!(variant.alt_allele().sequence(), b"T");
    }
}
