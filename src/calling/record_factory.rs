//! Turns sorted, possibly overlapping call streams into VCF-compatible
//! records.
//!
//! Indel calls are anchored on a shared padding base, written internally as
//! '#' and resolved on emission: against the co-located substitution call
//! when one exists, otherwise against the reference. Alleles of spanning
//! calls are encoded with '*'. Calls are then segmented by begin and end so
//! each minimal block becomes one record.

use anyhow::Result;

use crate::calling::{Call, CallType};
use crate::constants::{MAX_GQ, MAX_PQ, MAX_QUAL};
use crate::errors;
use crate::genome::GenomicRegion;
use crate::reads::pipe::ReadMap;
use crate::reads::AlignedRead;
use crate::reference::Reference;
use crate::variants::Allele;
use crate::SampleName;

const PAD: u8 = b'#';

#[derive(Debug, Clone, PartialEq)]
pub struct SampleFields {
    pub sample: SampleName,
    /// Allele sequence per chromosome; "*" and "." are literal.
    pub genotype: Vec<Vec<u8>>,
    pub phased: bool,
    pub genotype_quality: i32,
    pub depth: u32,
    pub base_quality: u32,
    pub mapping_quality: u32,
    pub phase_set: Option<u64>,
    pub phase_quality: Option<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VcfRecord {
    pub chrom: String,
    /// 0-based; the writer converts to 1-based POS.
    pub pos: u64,
    pub id: String,
    pub ref_allele: Vec<u8>,
    pub alt_alleles: Vec<Vec<u8>>,
    pub qual: f64,
    pub filter: String,
    pub num_samples_with_coverage: u32,
    pub depth: u32,
    pub strand_bias: f64,
    pub base_quality: u32,
    pub mapping_quality: u32,
    pub mapq_zero: u32,
    pub model_posterior: Option<f64>,
    pub denovo: Option<f64>,
    pub somatic: Option<f64>,
    pub samples: Vec<SampleFields>,
}

pub struct RecordFactory<'a> {
    reference: &'a Reference,
    reads: &'a ReadMap,
    samples: Vec<SampleName>,
    sites_only: bool,
}

impl<'a> RecordFactory<'a> {
    pub fn new(
        reference: &'a Reference,
        reads: &'a ReadMap,
        samples: Vec<SampleName>,
        sites_only: bool,
    ) -> Self {
        RecordFactory {
            reference,
            reads,
            samples,
            sites_only,
        }
    }

    pub fn make(&self, mut calls: Vec<Call>) -> Result<Vec<VcfRecord>> {
        debug_assert!(calls.windows(2).all(|w| w[0].region() <= w[1].region()));
        self.pad_indels(&mut calls)?;
        calls.sort_by(|a, b| a.region().cmp(b.region()));
        let mut result = Vec::with_capacity(calls.len());
        let mut index = 0;
        while index < calls.len() {
            let block_end = find_block_end(&calls, index);
            if block_end == index + 1 {
                let mut call = calls[index].clone();
                self.resolve_pad_with_reference(&mut call)?;
                result.push(self.make_record(&[call])?);
            } else {
                let mut block: Vec<Call> = calls[index..block_end].to_vec();
                self.resolve_block(&mut block)?;
                for segment in segment_by_begin_then_end(block) {
                    result.push(self.make_record(&segment)?);
                }
            }
            index = block_end;
        }
        Ok(result)
    }

    /// Left-pad every indel-shaped call with the anchor base placeholder.
    fn pad_indels(&self, calls: &mut [Call]) -> Result<()> {
        for call in calls.iter_mut() {
            let needs_pad = call.reference.sequence().is_empty()
                || call.region().is_empty()
                || call
                    .genotype_calls
                    .iter()
                    .any(|(_, gc)| gc.genotype.iter().any(|a| a.sequence().is_empty()));
            if !needs_pad {
                continue;
            }
            let old_region = call.region().clone();
            if old_region.begin() == 0 {
                // no anchor to the left; leave for reference resolution
                continue;
            }
            let new_region = GenomicRegion::new(
                old_region.contig().to_owned(),
                old_region.begin() - 1,
                old_region.end(),
            );
            let mut padded_ref = vec![PAD];
            padded_ref.extend_from_slice(call.reference.sequence());
            call.reference = Allele::new(new_region.clone(), padded_ref);
            for (_, genotype_call) in call.genotype_calls.iter_mut() {
                let padded: Vec<Allele> = genotype_call
                    .genotype
                    .iter()
                    .map(|allele| {
                        let mut sequence = vec![PAD];
                        sequence.extend_from_slice(allele.sequence());
                        Allele::new(new_region.clone(), sequence)
                    })
                    .collect();
                genotype_call.genotype = padded;
                // a phase set anchored at the old begin must cover the pad
                if let Some(phase) = &mut genotype_call.phase {
                    if new_region.begins_before(&phase.region) {
                        phase.region = phase.region.expand_lhs(1);
                    }
                }
            }
        }
        Ok(())
    }

    /// Resolve '#' against the actual reference base; used for isolated
    /// calls with no co-located substitution.
    fn resolve_pad_with_reference(&self, call: &mut Call) -> Result<()> {
        if call.reference.sequence().first() != Some(&PAD) {
            return Ok(());
        }
        let anchor = self.reference.fetch_base(call.region())?;
        call.reference = replace_pad(&call.reference, anchor);
        for (_, genotype_call) in call.genotype_calls.iter_mut() {
            let resolved: Vec<Allele> = genotype_call
                .genotype
                .iter()
                .map(|allele| replace_pad(allele, anchor))
                .collect();
            genotype_call.genotype = resolved;
        }
        Ok(())
    }

    /// Resolve pads and spanning alleles inside a block of overlapping
    /// calls.
    fn resolve_block(&self, block: &mut [Call]) -> Result<()> {
        let block_begin = block[0].region().begin();
        let head_len = block
            .iter()
            .take_while(|call| call.region().begin() == block_begin)
            .count();
        // the call with a concrete reference base anchors pad resolution
        let base_index = block[..head_len]
            .iter()
            .position(|call| call.reference.sequence().first() != Some(&PAD));
        for index in 0..head_len {
            if block[index].reference.sequence().first() != Some(&PAD) {
                continue;
            }
            let anchor = self.reference.fetch_base(block[index].region())?;
            block[index].reference = replace_pad(&block[index].reference, anchor);
            for sample in &self.samples {
                let base_first: Option<Vec<Vec<u8>>> = base_index.map(|b| {
                    block[b]
                        .genotype_call(sample)
                        .map(|gc| {
                            gc.genotype
                                .iter()
                                .map(|a| a.sequence().to_vec())
                                .collect()
                        })
                        .unwrap_or_default()
                });
                if let Some(genotype_call) = block[index].genotype_call_mut(sample) {
                    let resolved: Vec<Allele> = genotype_call
                        .genotype
                        .iter()
                        .enumerate()
                        .map(|(chromosome, allele)| {
                            if allele.sequence().first() == Some(&PAD) {
                                let resolved_base = base_first
                                    .as_ref()
                                    .and_then(|bases| bases.get(chromosome))
                                    .and_then(|sequence| sequence.first().copied())
                                    .filter(|&b| b != PAD)
                                    .unwrap_or(anchor);
                                replace_pad(allele, resolved_base)
                            } else {
                                allele.clone()
                            }
                        })
                        .collect();
                    genotype_call.genotype = resolved;
                }
            }
        }
        // same-anchor calls of different widths: shorter repeats of the
        // same sample allele become spanning
        if head_len > 1 {
            for index in 1..head_len {
                for sample in &self.samples {
                    let previous: Option<Vec<Vec<u8>>> = block[index - 1]
                        .genotype_call(sample)
                        .map(|gc| gc.genotype.iter().map(|a| a.sequence().to_vec()).collect());
                    let region_size = block[index].region().size();
                    if let (Some(previous), Some(genotype_call)) =
                        (previous, block[index].genotype_call_mut(sample))
                    {
                        let resolved: Vec<Allele> = genotype_call
                            .genotype
                            .iter()
                            .enumerate()
                            .map(|(chromosome, allele)| {
                                let prev = previous.get(chromosome);
                                let spanning = prev.map_or(false, |p| {
                                    p == b"*"
                                        || (p == &allele.sequence().to_vec()
                                            && (allele.sequence().len() as u64) < region_size)
                                });
                                if spanning {
                                    Allele::new(allele.region().clone(), b"*".to_vec())
                                } else {
                                    allele.clone()
                                }
                            })
                            .collect();
                        genotype_call.genotype = resolved;
                    }
                }
            }
        }
        // calls past the block head: pads resolve against the reference,
        // alleles covered by an upstream phased call become spanning
        for index in head_len..block.len() {
            let (head, tail) = block.split_at_mut(index);
            let call = &mut tail[0];
            let call_region = call.region().clone();
            let pad_needed = call.reference.sequence().first() == Some(&PAD);
            let anchor = if pad_needed {
                let base = self.reference.fetch_base(&call_region)?;
                call.reference = replace_pad(&call.reference, base);
                Some(base)
            } else {
                None
            };
            for sample in &self.samples {
                let spanning_from: Vec<bool> = {
                    let mut spanning = Vec::new();
                    if let Some(genotype_call) = call.genotype_call(sample) {
                        for chromosome in 0..genotype_call.ploidy() {
                            let covered = head.iter().any(|earlier| {
                                let in_phase = earlier
                                    .genotype_call(sample)
                                    .and_then(|gc| gc.phase.as_ref())
                                    .map_or(false, |phase| phase.region.overlaps(&call_region));
                                let spans = earlier
                                    .genotype_call(sample)
                                    .and_then(|gc| gc.genotype.get(chromosome))
                                    .map_or(false, |allele| {
                                        allele.region().end() > call_region.begin()
                                            && allele.region().overlaps(&call_region)
                                            && is_shortening(allele)
                                    });
                                in_phase && spans
                            });
                            spanning.push(covered);
                        }
                    }
                    spanning
                };
                if let Some(genotype_call) = call.genotype_call_mut(sample) {
                    let resolved: Vec<Allele> = genotype_call
                        .genotype
                        .iter()
                        .enumerate()
                        .map(|(chromosome, allele)| {
                            if allele.sequence().is_empty() {
                                Allele::new(allele.region().clone(), b"*".to_vec())
                            } else if spanning_from.get(chromosome) == Some(&true) {
                                Allele::new(allele.region().clone(), b"*".to_vec())
                            } else if allele.sequence().first() == Some(&PAD) {
                                replace_pad(allele, anchor.unwrap_or(b'N'))
                            } else {
                                allele.clone()
                            }
                        })
                        .collect();
                    genotype_call.genotype = resolved;
                }
            }
        }
        self.check_consistency(block)?;
        Ok(())
    }

    /// Two non-reference, non-spanning alleles called for the same sample
    /// on overlapping regions cannot be emitted.
    fn check_consistency(&self, block: &[Call]) -> Result<()> {
        for sample in &self.samples {
            for (i, first) in block.iter().enumerate() {
                for second in block.iter().skip(i + 1) {
                    if !first.region().overlaps(second.region())
                        || first.region() == second.region()
                    {
                        continue;
                    }
                    let conflicting = |call: &Call| {
                        call.genotype_call(sample).map_or(false, |gc| {
                            gc.genotype.iter().any(|allele| {
                                !allele.sequence().is_empty()
                                    && allele.sequence() != call.reference.sequence()
                                    && allele.sequence().first() != Some(&b'*')
                                    && allele.region().size() != allele.sequence().len() as u64
                            })
                        })
                    };
                    if conflicting(first) && conflicting(second) {
                        return Err(errors::Error::InconsistentCall {
                            sample: sample.clone(),
                            first: first.reference.to_string(),
                            second: second.reference.to_string(),
                        }
                        .into());
                    }
                }
            }
        }
        Ok(())
    }

    fn make_record(&self, segment: &[Call]) -> Result<VcfRecord> {
        let first = &segment[0];
        let region = first.region().clone();
        let ref_sequence = first.reference.sequence().to_vec();
        // resolve each sample chromosome across the segment's calls:
        // longer, informative alleles win
        let mut sample_fields = Vec::with_capacity(self.samples.len());
        let mut alt_alleles: Vec<Vec<u8>> = Vec::new();
        for sample in &self.samples {
            let ploidy = first
                .genotype_call(sample)
                .map_or(0, |gc| gc.ploidy());
            let mut resolved: Vec<Vec<u8>> = match first.genotype_call(sample) {
                Some(gc) => gc
                    .genotype
                    .iter()
                    .map(|a| a.sequence().to_vec())
                    .collect(),
                None => vec![b".".to_vec(); ploidy],
            };
            for call in &segment[1..] {
                if let Some(gc) = call.genotype_call(sample) {
                    for (slot, allele) in resolved.iter_mut().zip(gc.genotype.iter()) {
                        let sequence = allele.sequence();
                        let uninformative = sequence.len() < slot.len()
                            || sequence.first() == Some(&b'.')
                            || sequence.first() == Some(&b'*')
                            || sequence == ref_sequence.as_slice();
                        if !uninformative {
                            *slot = sequence.to_vec();
                        }
                    }
                }
            }
            for allele in &resolved {
                if allele != &ref_sequence
                    && allele.first() != Some(&b'.')
                    && !alt_alleles.contains(allele)
                {
                    alt_alleles.push(allele.clone());
                }
            }
            let genotype_call = first.genotype_call(sample);
            let sample_reads = self.reads.get(sample);
            let (depth, base_quality, mapping_quality) =
                sample_read_stats(sample_reads, &region);
            let phase = genotype_call.and_then(|gc| gc.phase.as_ref());
            sample_fields.push(SampleFields {
                sample: sample.clone(),
                genotype: resolved,
                phased: phase.is_some(),
                genotype_quality: genotype_call
                    .map_or(0, |gc| (gc.posterior.round() as i32).min(MAX_GQ)),
                depth,
                base_quality,
                mapping_quality,
                phase_set: phase.map(|p| p.region.begin()),
                phase_quality: phase.map(|p| (p.score.round() as i32).min(MAX_PQ)),
            });
        }
        alt_alleles.sort();
        let qual = segment
            .iter()
            .map(|call| call.quality)
            .fold(f64::INFINITY, f64::min);
        let stats = region_read_stats(self.reads, &region);
        let model_posterior = segment
            .iter()
            .filter_map(|call| call.model_posterior)
            .fold(None, |acc: Option<f64>, mp| {
                Some(acc.map_or(mp, |existing| existing.max(mp)))
            });
        let denovo = segment
            .iter()
            .filter(|call| {
                matches!(
                    call.call_type,
                    CallType::Denovo | CallType::DenovoReferenceReversion
                )
            })
            .filter_map(|call| call.denovo_posterior)
            .fold(None, |acc: Option<f64>, p| {
                Some(acc.map_or(p, |existing| existing.max(p)))
            });
        let somatic = segment
            .iter()
            .filter(|call| call.call_type == CallType::Somatic)
            .filter_map(|call| call.somatic_posterior)
            .fold(None, |acc: Option<f64>, p| {
                Some(acc.map_or(p, |existing| existing.max(p)))
            });
        Ok(VcfRecord {
            chrom: region.contig().to_owned(),
            pos: region.begin(),
            id: ".".to_owned(),
            ref_allele: ref_sequence,
            alt_alleles,
            qual: round2(qual.min(MAX_QUAL)),
            filter: ".".to_owned(),
            num_samples_with_coverage: stats.samples_with_coverage,
            depth: stats.depth,
            strand_bias: stats.strand_bias,
            base_quality: stats.base_quality,
            mapping_quality: stats.mapping_quality,
            mapq_zero: stats.mapq_zero,
            model_posterior: model_posterior.map(round2),
            denovo: denovo.map(round2),
            somatic: somatic.map(round2),
            samples: if self.sites_only {
                Vec::new()
            } else {
                sample_fields
            },
        })
    }
}

fn replace_pad(allele: &Allele, base: u8) -> Allele {
    let mut sequence = allele.sequence().to_vec();
    if sequence.first() == Some(&PAD) {
        sequence[0] = base;
    }
    Allele::new(allele.region().clone(), sequence)
}

/// A deletion-shaped allele: shorter than the region it covers.
fn is_shortening(allele: &Allele) -> bool {
    (allele.sequence().len() as u64) < allele.region().size()
}

/// End of the run of transitively overlapping calls starting at `start`.
fn find_block_end(calls: &[Call], start: usize) -> usize {
    let mut end = start + 1;
    let mut span = calls[start].region().clone();
    while end < calls.len() && calls[end].region().overlaps(&span) {
        span = span.encompassing(calls[end].region());
        end += 1;
    }
    end
}

/// Split a block into per-record segments: by begin, then by end.
fn segment_by_begin_then_end(block: Vec<Call>) -> Vec<Vec<Call>> {
    let mut segments: Vec<Vec<Call>> = Vec::new();
    for call in block {
        match segments.last_mut() {
            Some(segment)
                if segment[0].region().begin() == call.region().begin()
                    && segment[0].region().end() == call.region().end() =>
            {
                segment.push(call)
            }
            _ => segments.push(vec![call]),
        }
    }
    segments
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

struct RegionReadStats {
    samples_with_coverage: u32,
    depth: u32,
    strand_bias: f64,
    base_quality: u32,
    mapping_quality: u32,
    mapq_zero: u32,
}

fn region_read_stats(reads: &ReadMap, region: &GenomicRegion) -> RegionReadStats {
    let mut samples_with_coverage = 0;
    let mut depth = 0;
    let mut forward = 0u64;
    let mut reverse = 0u64;
    let mut base_quality_sum = 0.0f64;
    let mut base_quality_count = 0u64;
    let mut mapping_quality_sum = 0.0f64;
    let mut mapping_quality_count = 0u64;
    let mut mapq_zero = 0;
    for sample_reads in reads.values() {
        let overlapping: Vec<&AlignedRead> = sample_reads
            .iter()
            .filter(|read| read.region().overlaps(region))
            .collect();
        if !overlapping.is_empty() {
            samples_with_coverage += 1;
        }
        depth += overlapping.len() as u32;
        for read in overlapping {
            if read.flags().reverse_strand {
                reverse += 1;
            } else {
                forward += 1;
            }
            for &q in read.base_qualities() {
                base_quality_sum += f64::from(q) * f64::from(q);
                base_quality_count += 1;
            }
            mapping_quality_sum +=
                f64::from(read.mapping_quality()) * f64::from(read.mapping_quality());
            mapping_quality_count += 1;
            if read.mapping_quality() == 0 {
                mapq_zero += 1;
            }
        }
    }
    let strand_bias = if forward + reverse > 0 {
        round2(forward as f64 / (forward + reverse) as f64)
    } else {
        0.0
    };
    RegionReadStats {
        samples_with_coverage,
        depth,
        strand_bias,
        base_quality: rms(base_quality_sum, base_quality_count),
        mapping_quality: rms(mapping_quality_sum, mapping_quality_count),
        mapq_zero,
    }
}

fn sample_read_stats(
    reads: Option<&Vec<AlignedRead>>,
    region: &GenomicRegion,
) -> (u32, u32, u32) {
    let mut depth = 0u32;
    let mut base_quality_sum = 0.0f64;
    let mut base_quality_count = 0u64;
    let mut mapping_quality_sum = 0.0f64;
    let mut mapping_quality_count = 0u64;
    if let Some(reads) = reads {
        for read in reads.iter().filter(|read| read.region().overlaps(region)) {
            depth += 1;
            for &q in read.base_qualities() {
                base_quality_sum += f64::from(q) * f64::from(q);
                base_quality_count += 1;
            }
            mapping_quality_sum +=
                f64::from(read.mapping_quality()) * f64::from(read.mapping_quality());
            mapping_quality_count += 1;
        }
    }
    (
        depth,
        rms(base_quality_sum, base_quality_count),
        rms(mapping_quality_sum, mapping_quality_count),
    )
}

fn rms(sum_of_squares: f64, count: u64) -> u32 {
    if count == 0 {
        0
    } else {
        (sum_of_squares / count as f64).sqrt().round() as u32
    }
}
