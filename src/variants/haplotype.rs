//! Reference-anchored haplotypes over a local window.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use anyhow::Result;

use crate::genome::GenomicRegion;
use crate::reference::Reference;
use crate::variants::Allele;

/// A sequence over a window, formed by applying a consistent (sorted,
/// non-overlapping) set of alleles to the reference. Uncovered subregions
/// equal the reference by construction.
#[derive(Debug, Clone)]
pub struct Haplotype {
    region: GenomicRegion,
    sequence: Vec<u8>,
    alleles: Vec<Allele>,
}

impl Haplotype {
    /// Apply `alleles` (sorted by region, at most one per site) to the
    /// reference over `region`.
    pub fn build(
        region: GenomicRegion,
        alleles: Vec<Allele>,
        reference: &Reference,
    ) -> Result<Self> {
        debug_assert!(alleles.windows(2).all(|w| {
            w[0].region() <= w[1].region() && w[0].region().end() <= w[1].region().begin()
        }));
        let mut sequence = Vec::with_capacity(region.size() as usize);
        let mut cursor = region.begin();
        for allele in &alleles {
            debug_assert!(region.contains(allele.region()));
            if allele.region().begin() > cursor {
                let gap = GenomicRegion::new(
                    region.contig().to_owned(),
                    cursor,
                    allele.region().begin(),
                );
                sequence.extend_from_slice(&reference.fetch(&gap)?);
            }
            sequence.extend_from_slice(allele.sequence());
            cursor = allele.region().end();
        }
        if cursor < region.end() {
            let gap = GenomicRegion::new(region.contig().to_owned(), cursor, region.end());
            sequence.extend_from_slice(&reference.fetch(&gap)?);
        }
        Ok(Haplotype {
            region,
            sequence,
            alleles,
        })
    }

    /// The reference haplotype over `region`.
    pub fn reference(region: GenomicRegion, reference: &Reference) -> Result<Self> {
        Haplotype::build(region, Vec::new(), reference)
    }

    pub fn region(&self) -> &GenomicRegion {
        &self.region
    }

    pub fn sequence(&self) -> &[u8] {
        &self.sequence
    }

    pub fn alleles(&self) -> &[Allele] {
        &self.alleles
    }

    /// Number of applied (non-reference) alleles; used as a complexity
    /// measure when collapsing sequence-identical haplotypes.
    pub fn num_alleles(&self) -> usize {
        self.alleles.len()
    }

    pub fn is_reference(&self) -> bool {
        self.alleles.is_empty()
    }

    /// The sequence this haplotype expresses over a reference subregion, or
    /// `None` when the subregion is outside the haplotype window.
    ///
    /// Insertions are attributed to positions strictly inside the query,
    /// except that a zero-sized query selects exactly the insertion applied
    /// at its position.
    pub fn expressed(&self, query: &GenomicRegion) -> Option<Vec<u8>> {
        if !self.region.contains(query) {
            return None;
        }
        if query.is_empty() {
            let insertion = self
                .alleles
                .iter()
                .find(|a| a.region().is_empty() && a.region().begin() == query.begin());
            return Some(insertion.map_or_else(Vec::new, |a| a.sequence().to_vec()));
        }
        let mut result = Vec::new();
        let mut cursor = query.begin();
        for allele in &self.alleles {
            let a = allele.region();
            let included = if a.is_empty() {
                a.begin() > query.begin() && a.begin() < query.end()
            } else {
                a.begin() < query.end() && a.end() > query.begin()
            };
            if !included {
                continue;
            }
            // partially overlapping alleles make the expressed sequence
            // ambiguous; clamp to the overlapped reference span
            if a.begin() > cursor {
                result.extend_from_slice(&self.reference_slice(cursor, a.begin()));
            }
            if a.begin() >= query.begin() && a.end() <= query.end() {
                result.extend_from_slice(allele.sequence());
            }
            cursor = a.end().min(query.end()).max(cursor);
        }
        if cursor < query.end() {
            result.extend_from_slice(&self.reference_slice(cursor, query.end()));
        }
        Some(result)
    }

    /// Copy reference-identical bases from the haplotype's own sequence.
    /// `[begin, end)` must not intersect any applied allele.
    fn reference_slice(&self, begin: u64, end: u64) -> Vec<u8> {
        let offset = |pos: u64| -> usize {
            let mut delta: i64 = 0;
            for allele in &self.alleles {
                if allele.region().end() <= pos {
                    delta += allele.sequence().len() as i64 - allele.region().size() as i64;
                } else {
                    break;
                }
            }
            ((pos - self.region.begin()) as i64 + delta) as usize
        };
        self.sequence[offset(begin)..offset(end)].to_vec()
    }

    /// Whether the haplotype expresses exactly this allele over its region.
    pub fn contains(&self, allele: &Allele) -> bool {
        self.expressed(allele.region())
            .map_or(false, |s| s == allele.sequence())
    }

    /// Like [`Haplotype::contains`], but tolerant of representation
    /// ambiguity at indel boundaries: an indel allele is also included when
    /// it is a member of the applied set at the same coordinates.
    pub fn includes(&self, allele: &Allele) -> bool {
        if !allele.is_indel() {
            return self.contains(allele);
        }
        self.alleles.iter().any(|a| a == allele) || self.contains(allele)
    }

    /// The allele this haplotype expresses over `region`.
    pub fn expressed_allele(&self, region: &GenomicRegion) -> Option<Allele> {
        self.expressed(region)
            .map(|sequence| Allele::new(region.clone(), sequence))
    }
}

impl PartialEq for Haplotype {
    fn eq(&self, other: &Self) -> bool {
        self.region == other.region && self.sequence == other.sequence
    }
}

impl Eq for Haplotype {}

impl Hash for Haplotype {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.region.hash(state);
        self.sequence.hash(state);
    }
}

impl PartialOrd for Haplotype {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Haplotype {
    fn cmp(&self, other: &Self) -> Ordering {
        self.region
            .cmp(&other.region)
            .then_with(|| self.sequence.cmp(&other.sequence))
    }
}

impl fmt::Display for Haplotype {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {}",
            self.region,
            String::from_utf8_lossy(&self.sequence)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::tests::mock_reference;

    fn snv(contig: &str, pos: u64, base: u8) -> Allele {
        Allele::new(GenomicRegion::new(contig, pos, pos + 1), vec![base])
    }

    #[test]
    fn test_reference_haplotype() {
        let reference = mock_reference("chr1", b"ACGTACGT");
        let hap = Haplotype::reference(GenomicRegion::new("chr1", 2, 6), &reference).unwrap();
        assert_eq!(hap.sequence(), b"GTAC");
        assert!(hap.is_reference());
    }

    #[test]
    fn test_snv_application_and_faithfulness() {
        let reference = mock_reference("chr1", b"ACGTACGT");
        let region = GenomicRegion::new("chr1", 0, 8);
        let allele = snv("chr1", 4, b'T');
        let hap = Haplotype::build(region.clone(), vec![allele.clone()], &reference).unwrap();
        assert_eq!(hap.sequence(), b"ACGTTCGT");
        assert!(hap.contains(&allele));
        assert!(!hap.contains(&snv("chr1", 4, b'G')));
        // uncovered subregions equal the reference
        assert_eq!(
            hap.expressed(&GenomicRegion::new("chr1", 0, 4)).unwrap(),
            b"ACGT"
        );
    }

    #[test]
    fn test_insertion_expression() {
        let reference = mock_reference("chr1", b"AAAA");
        let region = GenomicRegion::new("chr1", 0, 4);
        let insertion = Allele::new(GenomicRegion::new("chr1", 2, 2), b"G".to_vec());
        let hap = Haplotype::build(region, vec![insertion.clone()], &reference).unwrap();
        assert_eq!(hap.sequence(), b"AAGAA");
        assert!(hap.contains(&insertion));
        assert!(hap.includes(&insertion));
        assert_eq!(
            hap.expressed(&GenomicRegion::new("chr1", 1, 3)).unwrap(),
            b"AGA"
        );
        // a different inserted sequence is not contained
        let other = Allele::new(GenomicRegion::new("chr1", 2, 2), b"T".to_vec());
        assert!(!hap.contains(&other));
    }

    #[test]
    fn test_deletion_expression() {
        let reference = mock_reference("chr1", b"ACGTACGT");
        let region = GenomicRegion::new("chr1", 0, 8);
        let deletion = Allele::new(GenomicRegion::new("chr1", 2, 4), Vec::new());
        let hap = Haplotype::build(region, vec![deletion.clone()], &reference).unwrap();
        assert_eq!(hap.sequence(), b"ACACGT");
        assert!(hap.contains(&deletion));
        // bases after the deletion still map correctly
        assert_eq!(
            hap.expressed(&GenomicRegion::new("chr1", 4, 8)).unwrap(),
            b"ACGT"
        );
    }

    #[test]
    fn test_at_most_one_allele_per_site() {
        let reference = mock_reference("chr1", b"ACGTACGT");
        let region = GenomicRegion::new("chr1", 0, 8);
        let hap = Haplotype::build(
            region,
            vec![snv("chr1", 1, b'T'), snv("chr1", 5, b'A')],
            &reference,
        )
        .unwrap();
        assert_eq!(hap.num_alleles(), 2);
        assert_eq!(hap.sequence(), b"ATGTAAGT");
    }
}
