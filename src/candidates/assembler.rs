//! Local de-Bruijn-graph reassembly.
//!
//! Each window is assembled in bins. A bin is assembled at several k-mer
//! sizes; a k is usable only when the local reference spells an unambiguous
//! path through the graph. Variants are read off bubbles that leave the
//! reference path and rejoin it downstream.

use std::collections::{HashMap, HashSet};

use anyhow::Result;

use crate::constants::{
    DEFAULT_FALLBACK_KMER_INTERVAL, DEFAULT_KMER_SIZES, DEFAULT_NUM_FALLBACK_KMERS,
};
use crate::errors;
use crate::genome::GenomicRegion;
use crate::reads::AlignedRead;
use crate::reference::Reference;
use crate::variants::Variant;

#[derive(Debug, Clone)]
pub struct AssemblerOptions {
    pub kmer_sizes: Vec<usize>,
    pub num_fallbacks: usize,
    pub fallback_interval_size: usize,
    /// Bases below this quality break k-mer extraction.
    pub mask_threshold: u8,
    pub min_supporting_reads: usize,
    pub max_variant_size: u64,
    pub bin_size: u64,
}

impl Default for AssemblerOptions {
    fn default() -> Self {
        AssemblerOptions {
            kmer_sizes: DEFAULT_KMER_SIZES.to_vec(),
            num_fallbacks: DEFAULT_NUM_FALLBACK_KMERS,
            fallback_interval_size: DEFAULT_FALLBACK_KMER_INTERVAL,
            mask_threshold: 10,
            min_supporting_reads: crate::constants::DEFAULT_MIN_SUPPORTING_READS,
            max_variant_size: crate::constants::DEFAULT_MAX_VARIANT_SIZE,
            bin_size: 1000,
        }
    }
}

impl AssemblerOptions {
    fn fallback_kmer_sizes(&self) -> Vec<usize> {
        let largest = self.kmer_sizes.iter().copied().max().unwrap_or(35);
        (1..=self.num_fallbacks)
            .map(|i| largest + i * self.fallback_interval_size)
            .collect()
    }
}

pub struct LocalReassembler {
    options: AssemblerOptions,
    /// Masked read sequences keyed by the bin they fall into.
    sequences: Vec<(GenomicRegion, Vec<u8>)>,
}

impl LocalReassembler {
    pub fn new(options: AssemblerOptions) -> Self {
        LocalReassembler {
            options,
            sequences: Vec::new(),
        }
    }

    pub fn add_read(&mut self, read: &AlignedRead) {
        self.sequences
            .push((read.region().clone(), self.mask(read)));
    }

    /// Replace low-quality bases with N so they never seed k-mers.
    fn mask(&self, read: &AlignedRead) -> Vec<u8> {
        read.sequence()
            .iter()
            .zip(read.base_qualities())
            .map(|(&base, &quality)| {
                if quality < self.options.mask_threshold {
                    b'N'
                } else {
                    base.to_ascii_uppercase()
                }
            })
            .collect()
    }

    pub fn generate(
        &self,
        region: &GenomicRegion,
        reference: &Reference,
    ) -> Result<Vec<(Variant, usize)>> {
        let mut result = Vec::new();
        let mut begin = region.begin();
        let mut any_failed = false;
        while begin < region.end() {
            let end = (begin + self.options.bin_size).min(region.end());
            let bin = GenomicRegion::new(region.contig().to_owned(), begin, end);
            match self.assemble_bin(&bin, reference) {
                Ok(mut variants) => result.append(&mut variants),
                Err(_) => {
                    any_failed = true;
                }
            }
            begin = end;
        }
        if any_failed && result.is_empty() && !self.sequences.is_empty() {
            // non-fatal: callers fall back to alignment candidates
            warn!("assembly failed for all k-mer sizes in {}", region);
        }
        result.sort_by(|a, b| a.0.cmp(&b.0));
        result.dedup_by(|a, b| a.0 == b.0);
        Ok(result)
    }

    pub fn clear(&mut self) {
        self.sequences.clear();
    }

    fn assemble_bin(
        &self,
        bin: &GenomicRegion,
        reference: &Reference,
    ) -> Result<Vec<(Variant, usize)>> {
        let padded = bin.expand(self.options.kmer_sizes.iter().copied().max().unwrap_or(35) as u64);
        let padded = reference
            .contig_region(bin.contig())?
            .overlapped(&padded)
            .unwrap_or_else(|| bin.clone());
        let ref_seq: Vec<u8> = reference
            .fetch(&padded)?
            .iter()
            .map(|b| b.to_ascii_uppercase())
            .collect();
        let bin_sequences: Vec<&[u8]> = self
            .sequences
            .iter()
            .filter(|(region, _)| region.overlaps(bin))
            .map(|(_, seq)| seq.as_slice())
            .collect();
        if bin_sequences.is_empty() {
            return Ok(Vec::new());
        }
        let mut ks: Vec<usize> = self.options.kmer_sizes.clone();
        ks.extend(self.options.fallback_kmer_sizes());
        for k in ks {
            if k + 1 >= ref_seq.len() {
                continue;
            }
            if let Some(assembler) = Assembler::build(k, &ref_seq, &bin_sequences) {
                let variants =
                    assembler.variants(&padded, self.options.max_variant_size, reference)?;
                return Ok(variants
                    .into_iter()
                    .filter(|(_, support)| *support >= self.options.min_supporting_reads)
                    .collect());
            }
        }
        Err(errors::Error::AssemblyFailed {
            region: bin.to_string(),
        }
        .into())
    }
}

type Kmer = Vec<u8>;

fn is_canonical(seq: &[u8]) -> bool {
    seq.iter().all(|b| matches!(b, b'A' | b'C' | b'G' | b'T'))
}

fn base_code(base: u8) -> usize {
    match base {
        b'A' => 0,
        b'C' => 1,
        b'G' => 2,
        _ => 3,
    }
}

struct Assembler {
    k: usize,
    /// kmer -> successor base (0..4) -> observation count
    edges: HashMap<Kmer, [usize; 4]>,
    /// position of each reference k-mer on the reference path
    ref_index: HashMap<Kmer, usize>,
    ref_path: Vec<Kmer>,
}

impl Assembler {
    /// Build the graph, or `None` when the reference does not spell an
    /// unambiguous path at this k (repeated or non-ACGT reference k-mers).
    fn build(k: usize, ref_seq: &[u8], reads: &[&[u8]]) -> Option<Assembler> {
        let mut ref_path = Vec::with_capacity(ref_seq.len().saturating_sub(k));
        let mut ref_index = HashMap::new();
        for (i, window) in ref_seq.windows(k).enumerate() {
            if !is_canonical(window) {
                return None;
            }
            if ref_index.insert(window.to_vec(), i).is_some() {
                return None;
            }
            ref_path.push(window.to_vec());
        }
        let mut edges: HashMap<Kmer, [usize; 4]> = HashMap::new();
        let mut add_edges = |seq: &[u8], weight: usize| {
            for window in seq.windows(k + 1) {
                if is_canonical(window) {
                    let entry = edges.entry(window[..k].to_vec()).or_insert([0; 4]);
                    entry[base_code(window[k])] += weight;
                }
            }
        };
        for read in reads {
            add_edges(read, 1);
        }
        // the reference path itself is always traversable
        add_edges(ref_seq, 0);
        Some(Assembler {
            k,
            edges,
            ref_index,
            ref_path,
        })
    }

    /// Read variants off graph bubbles anchored on the reference path.
    fn variants(
        &self,
        window: &GenomicRegion,
        max_variant_size: u64,
        reference: &Reference,
    ) -> Result<Vec<(Variant, usize)>> {
        let mut result = Vec::new();
        let max_depth = (max_variant_size as usize + 2 * self.k).min(2000);
        for (i, anchor) in self.ref_path.iter().enumerate() {
            let successors = match self.edges.get(anchor) {
                Some(s) => s,
                None => continue,
            };
            let ref_next = self.ref_path.get(i + 1).map(|next| {
                base_code(*next.last().expect("k-mers are non-empty"))
            });
            for base in 0..4 {
                if successors[base] == 0 || Some(base) == ref_next {
                    continue;
                }
                if let Some((rejoin, alt_bases, support)) =
                    self.walk_bubble(anchor, base, i, max_depth)
                {
                    let begin = window.begin() + (i + self.k) as u64;
                    let end = window.begin() + (rejoin + self.k) as u64;
                    let region = GenomicRegion::new(window.contig().to_owned(), begin, end);
                    let ref_seq = reference.fetch(&region)?;
                    if ref_seq == alt_bases {
                        continue;
                    }
                    let variant = crate::variants::normalise(
                        Variant::new(
                            crate::variants::Allele::new(region.clone(), ref_seq),
                            crate::variants::Allele::new(region, alt_bases),
                        ),
                        reference,
                    )?;
                    if variant.size() <= max_variant_size {
                        result.push((variant, support));
                    }
                }
            }
        }
        Ok(result)
    }

    /// Follow a divergent path until it rejoins the reference downstream of
    /// the anchor. Returns the rejoin position, the spelled bases, and the
    /// minimum edge support along the path.
    fn walk_bubble(
        &self,
        anchor: &[u8],
        first_base: usize,
        anchor_pos: usize,
        max_depth: usize,
    ) -> Option<(usize, Vec<u8>, usize)> {
        let mut kmer: Kmer = anchor[1..].to_vec();
        kmer.push(unpack_base(first_base));
        let mut bases = vec![unpack_base(first_base)];
        let mut support = self.edges.get(anchor)?[first_base];
        let mut visited: HashSet<Kmer> = HashSet::new();
        visited.insert(kmer.clone());
        for _ in 0..max_depth {
            if let Some(&pos) = self.ref_index.get(&kmer) {
                if pos > anchor_pos {
                    return Some((pos, bases, support));
                }
                return None;
            }
            let successors = self.edges.get(&kmer)?;
            // follow the best-supported edge; ambiguity without support is a
            // dead end
            let (next, count) = successors
                .iter()
                .enumerate()
                .max_by_key(|(_, &c)| c)
                .map(|(b, &c)| (b, c))?;
            if count == 0 {
                return None;
            }
            support = support.min(count);
            kmer.remove(0);
            kmer.push(unpack_base(next));
            if !visited.insert(kmer.clone()) {
                return None;
            }
            bases.push(unpack_base(next));
        }
        None
    }
}

fn unpack_base(code: usize) -> u8 {
    match code {
        0 => b'A',
        1 => b'C',
        2 => b'G',
        _ => b'T',
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reads::tests::mock_read;
    use crate::reference::tests::mock_reference;

    const REF: &[u8] = b"TGCATCGATCGGCTACGGTACTTACGCATACGATCAGCTAACGTGCATCGTTGCAACTGA";

    fn options() -> AssemblerOptions {
        AssemblerOptions {
            kmer_sizes: vec![10],
            min_supporting_reads: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_assembles_snv_bubble() {
        let reference = mock_reference("chr1", REF);
        let mut alt = REF.to_vec();
        alt[30] = b'G'; // C>G at position 30
        let mut assembler = LocalReassembler::new(options());
        for i in 0..3 {
            let mut read = mock_read("chr1", 10, &alt[10..55], 30);
            read.name_mut().push(b'0' + i);
            assembler.add_read(&read);
        }
        let region = GenomicRegion::new("chr1", 0, 60);
        let variants = assembler.generate(&region, &reference).unwrap();
        assert!(variants
            .iter()
            .any(|(v, _)| v.region().begin() == 30 && v.alt_allele().sequence() == b"G"));
    }

    #[test]
    fn test_insufficient_support_is_dropped() {
        let reference = mock_reference("chr1", REF);
        let mut alt = REF.to_vec();
        alt[30] = b'G';
        let mut assembler = LocalReassembler::new(options());
        assembler.add_read(&mock_read("chr1", 10, &alt[10..55], 30));
        let region = GenomicRegion::new("chr1", 0, 60);
        let variants = assembler.generate(&region, &reference).unwrap();
        assert!(variants.is_empty());
    }

    #[test]
    fn test_reference_only_reads_yield_nothing() {
        let reference = mock_reference("chr1", REF);
        let mut assembler = LocalReassembler::new(options());
        for i in 0..3 {
            let mut read = mock_read("chr1", 5, &REF[5..50], 30);
            read.name_mut().push(b'0' + i);
            assembler.add_read(&read);
        }
        let region = GenomicRegion::new("chr1", 0, 60);
        assert!(assembler.generate(&region, &reference).unwrap().is_empty());
    }

    #[test]
    fn test_repetitive_reference_falls_back() {
        // a reference whose 10-mers repeat is unusable at k=10 but fine at
        // a larger fallback k
        let repetitive: Vec<u8> = b"ACGTACGTACGTACGTACGTACGTACGTACGTACGTACGTTTGCATCGATCGGCTACGGTACTTACGCA"
            .to_vec();
        let reference = mock_reference("chr1", &repetitive);
        let mut assembler = LocalReassembler::new(AssemblerOptions {
            kmer_sizes: vec![10],
            num_fallbacks: 4,
            fallback_interval_size: 10,
            min_supporting_reads: 1,
            ..Default::default()
        });
        assembler.add_read(&mock_read("chr1", 0, &repetitive[0..60], 30));
        let region = GenomicRegion::new("chr1", 0, repetitive.len() as u64);
        // must not error: fallback k spells a unique reference path
        assert!(assembler.generate(&region, &reference).is_ok());
    }
}
