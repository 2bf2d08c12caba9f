//! Alleles and variants, including the normalisation contract that every
//! candidate generator must satisfy: left-aligned, parsimonious, unique,
//! sorted, and size-bounded.

use std::cmp::Ordering;
use std::fmt;

use anyhow::Result;

use crate::genome::GenomicRegion;
use crate::reference::Reference;

pub mod genotype;
pub mod haplotype;

pub use genotype::{CancerGenotype, Genotype, GenotypeSpace};
pub use haplotype::Haplotype;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Allele {
    region: GenomicRegion,
    sequence: Vec<u8>,
}

impl Allele {
    pub fn new(region: GenomicRegion, sequence: Vec<u8>) -> Self {
        Allele { region, sequence }
    }

    pub fn reference(region: GenomicRegion, reference: &Reference) -> Result<Self> {
        let sequence = reference.fetch(&region)?;
        Ok(Allele { region, sequence })
    }

    pub fn region(&self) -> &GenomicRegion {
        &self.region
    }

    pub fn sequence(&self) -> &[u8] {
        &self.sequence
    }

    pub fn sequence_mut(&mut self) -> &mut Vec<u8> {
        &mut self.sequence
    }

    pub fn is_insertion(&self) -> bool {
        self.region.is_empty() && !self.sequence.is_empty()
    }

    pub fn is_deletion(&self) -> bool {
        !self.region.is_empty() && self.sequence.is_empty()
    }

    pub fn is_indel(&self) -> bool {
        self.region.size() != self.sequence.len() as u64
    }
}

impl PartialOrd for Allele {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Allele {
    fn cmp(&self, other: &Self) -> Ordering {
        self.region
            .cmp(&other.region)
            .then_with(|| self.sequence.cmp(&other.sequence))
    }
}

impl fmt::Display for Allele {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}={}",
            self.region,
            if self.sequence.is_empty() {
                "<empty>".to_owned()
            } else {
                String::from_utf8_lossy(&self.sequence).into_owned()
            }
        )
    }
}

/// A reference and an alternative allele over the same region.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Variant {
    ref_allele: Allele,
    alt_allele: Allele,
}

impl Variant {
    pub fn new(ref_allele: Allele, alt_allele: Allele) -> Self {
        assert_eq!(ref_allele.region(), alt_allele.region());
        assert_ne!(ref_allele.sequence(), alt_allele.sequence());
        Variant {
            ref_allele,
            alt_allele,
        }
    }

    pub fn from_sequences<C: Into<String>>(
        contig: C,
        begin: u64,
        ref_seq: Vec<u8>,
        alt_seq: Vec<u8>,
    ) -> Self {
        let region = GenomicRegion::new(contig, begin, begin + ref_seq.len() as u64);
        Variant::new(
            Allele::new(region.clone(), ref_seq),
            Allele::new(region, alt_seq),
        )
    }

    pub fn region(&self) -> &GenomicRegion {
        self.ref_allele.region()
    }

    pub fn ref_allele(&self) -> &Allele {
        &self.ref_allele
    }

    pub fn alt_allele(&self) -> &Allele {
        &self.alt_allele
    }

    pub fn is_snv(&self) -> bool {
        self.region().size() == 1 && self.alt_allele.sequence().len() == 1
    }

    pub fn is_indel(&self) -> bool {
        self.alt_allele.is_indel()
    }

    pub fn size(&self) -> u64 {
        self.region()
            .size()
            .max(self.alt_allele.sequence().len() as u64)
    }
}

impl PartialOrd for Variant {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Variant {
    fn cmp(&self, other: &Self) -> Ordering {
        self.region()
            .cmp(other.region())
            .then_with(|| self.alt_allele.sequence().cmp(other.alt_allele.sequence()))
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {}>{}",
            self.region(),
            String::from_utf8_lossy(self.ref_allele.sequence()),
            String::from_utf8_lossy(self.alt_allele.sequence())
        )
    }
}

/// Left-align and parsimony-trim a variant against the reference.
///
/// The returned representation has no shared prefix or suffix between the
/// two alleles; a pure indel is shifted as far left as the reference allows.
pub fn normalise(variant: Variant, reference: &Reference) -> Result<Variant> {
    let contig = variant.region().contig().to_owned();
    let mut begin = variant.region().begin();
    let mut ref_seq = variant.ref_allele.sequence().to_vec();
    let mut alt_seq = variant.alt_allele.sequence().to_vec();

    // parsimony: strip the common suffix, then the common prefix
    while !ref_seq.is_empty() && !alt_seq.is_empty() && ref_seq.last() == alt_seq.last() {
        ref_seq.pop();
        alt_seq.pop();
    }
    let mut shared = 0;
    while shared < ref_seq.len().min(alt_seq.len()) && ref_seq[shared] == alt_seq[shared] {
        shared += 1;
    }
    begin += shared as u64;
    ref_seq.drain(..shared);
    alt_seq.drain(..shared);

    // left-alignment only applies to pure indels
    if ref_seq.is_empty() != alt_seq.is_empty() {
        let window_start = begin.saturating_sub(100);
        let context = reference.fetch(&GenomicRegion::new(contig.clone(), window_start, begin))?;
        let mut offset = context.len();
        let indel = if ref_seq.is_empty() {
            &mut alt_seq
        } else {
            &mut ref_seq
        };
        while offset > 0 && context[offset - 1] == *indel.last().expect("non-empty indel") {
            indel.rotate_right(1);
            indel[0] = context[offset - 1];
            offset -= 1;
            begin -= 1;
        }
    }

    let region = GenomicRegion::new(contig, begin, begin + ref_seq.len() as u64);
    Ok(Variant::new(
        Allele::new(region.clone(), ref_seq),
        Allele::new(region, alt_seq),
    ))
}

/// All alleles (reference and alternative) of the given sorted variants,
/// sorted and deduplicated.
pub fn decompose(variants: &[Variant]) -> Vec<Allele> {
    let mut alleles: Vec<Allele> = variants
        .iter()
        .flat_map(|v| vec![v.ref_allele().clone(), v.alt_allele().clone()])
        .collect();
    alleles.sort();
    alleles.dedup();
    alleles
}
