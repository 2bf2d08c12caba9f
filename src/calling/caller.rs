//! The shared caller driver: one loop over lagging haplotype windows,
//! parameterised by an inference strategy.

use std::sync::Arc;

use anyhow::Result;
use derive_builder::Builder;

use crate::calling::record_factory::{RecordFactory, VcfRecord};
use crate::calling::{apply_quality_cap, Call, CallerStrategy, PhaseCall};
use crate::candidates::CandidateGenerator;
use crate::errors;
use crate::genome::{intervening_regions, GenomicRegion};
use crate::hapgen::{HaplotypeGenerator, HaplotypeGeneratorConfig};
use crate::likelihood::filter::{any_finite_row, filter_to_n, removable_haplotypes};
use crate::likelihood::{
    remove_duplicate_haplotypes, FlankState, HaplotypeLikelihoodArray,
};
use crate::phaser::{PhaseSet, Phaser};
use crate::reads::pipe::{ReadMap, ReadPipe};
use crate::reads::encompassing_region;
use crate::reference::Reference;
use crate::utils::metrics::{timed, MetricsSink, NullSink};
use crate::variants::{decompose, Allele, Haplotype, Variant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefCallType {
    None,
    Blocked,
    Positional,
}

#[derive(Debug, Clone, Builder)]
#[builder(pattern = "owned", default)]
pub struct CallerParameters {
    pub max_haplotypes: usize,
    /// PHRED threshold for closing phase blocks.
    pub min_phase_score: f64,
    pub refcall_type: RefCallType,
    pub call_sites_only: bool,
    pub lagging: bool,
}

impl Default for CallerParameters {
    fn default() -> Self {
        CallerParameters {
            max_haplotypes: crate::constants::DEFAULT_MAX_HAPLOTYPES,
            min_phase_score: 10.0,
            refcall_type: RefCallType::None,
            call_sites_only: false,
            lagging: true,
        }
    }
}

pub struct Caller<'a, S: CallerStrategy> {
    reference: &'a Reference,
    read_pipe: &'a ReadPipe,
    candidate_generator: CandidateGenerator,
    strategy: S,
    parameters: CallerParameters,
    metrics: Arc<dyn MetricsSink>,
}

impl<'a, S: CallerStrategy> Caller<'a, S> {
    pub fn new(
        reference: &'a Reference,
        read_pipe: &'a ReadPipe,
        candidate_generator: CandidateGenerator,
        strategy: S,
        parameters: CallerParameters,
    ) -> Self {
        Caller {
            reference,
            read_pipe,
            candidate_generator,
            strategy,
            parameters,
            metrics: Arc::new(NullSink),
        }
    }

    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = sink;
        self
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// Call one target region, returning finished VCF records.
    pub fn call(&mut self, call_region: &GenomicRegion) -> Result<Vec<VcfRecord>> {
        let reads = self.read_pipe.fetch_reads(call_region)?;
        self.call_with_reads(call_region, reads)
    }

    /// Like [`Caller::call`], but with reads already fetched and prepared.
    pub fn call_with_reads(
        &mut self,
        call_region: &GenomicRegion,
        reads: ReadMap,
    ) -> Result<Vec<VcfRecord>> {
        let refcalls = self.parameters.refcall_type != RefCallType::None;
        if self.candidate_generator.requires_reads() {
            for sample_reads in reads.values() {
                for read in sample_reads {
                    self.candidate_generator.add_read(read, self.reference)?;
                }
            }
            if !refcalls && reads.values().all(|r| r.is_empty()) {
                debug!("no reads found in {}", call_region);
                return Ok(Vec::new());
            }
        }
        let candidate_region = self.candidate_region(call_region, &reads);
        let mut candidates = self
            .candidate_generator
            .generate(&candidate_region, self.reference)?;
        self.candidate_generator.clear();
        debug!(
            "{} candidates in {}",
            candidates.len(),
            candidate_region
        );
        if !refcalls && candidates.is_empty() {
            return Ok(Vec::new());
        }
        let calls = self.call_loop(call_region, &candidate_region, &mut candidates, &reads)?;
        let factory = RecordFactory::new(
            self.reference,
            &reads,
            self.strategy.samples().to_vec(),
            self.parameters.call_sites_only,
        );
        factory.make(calls)
    }

    fn call_loop(
        &mut self,
        call_region: &GenomicRegion,
        candidate_region: &GenomicRegion,
        candidates: &mut Vec<Variant>,
        reads: &ReadMap,
    ) -> Result<Vec<Call>> {
        let mut result: Vec<Call> = Vec::new();
        let hapgen_config = HaplotypeGeneratorConfig {
            max_haplotypes: self.parameters.max_haplotypes,
            lagging: self.parameters.lagging,
            ..Default::default()
        };
        let mut generator =
            HaplotypeGenerator::new(hapgen_config, self.reference, candidates, reads);
        let phaser = Phaser::new(self.parameters.min_phase_score);
        let mut likelihoods =
            HaplotypeLikelihoodArray::new(self.strategy.samples().to_vec());
        // leftmost position not yet covered by emitted calls or refcalls
        let mut completed_end = call_region.begin();
        let mut last_window: Option<(Vec<Haplotype>, crate::model::Latents)> = None;
        let mut cleared_at: Option<GenomicRegion> = None;
        loop {
            let (mut haplotypes, active_region) = match generator.advance()? {
                Some(progress) => progress,
                None => break,
            };
            if active_region.is_after(call_region) || haplotypes.is_empty() {
                break;
            }
            let haplotype_region = haplotypes[0].region().clone();
            remove_passed_candidates(candidates, candidate_region, &haplotype_region);
            remove_duplicate_haplotypes(&mut haplotypes);
            let active_reads = copy_overlapped(reads, &active_region);
            let flank_state =
                calculate_flank_state(&haplotype_region, &active_region, candidates);
            timed(&self.metrics, "likelihoods", || {
                likelihoods.populate(&active_reads, &haplotypes, Some(&flank_state))
            });
            let removed = filter_to_n(
                &mut haplotypes,
                &likelihoods,
                self.parameters.max_haplotypes,
            );
            if haplotypes.is_empty() {
                // every haplotype scored identically; restart the window
                // without lagging, once
                if cleared_at.as_ref() == Some(&active_region) {
                    warn!("no haplotype distinguishable in {}; skipping", active_region);
                    generator.force_forward(&active_region.tail());
                    continue;
                }
                debug!("filtered all haplotypes in {}", active_region);
                cleared_at = Some(active_region);
                generator.clear_progress();
                continue;
            }
            likelihoods.erase(&removed);
            generator.remove(&removed);
            generator.uniquely_keep(&haplotypes);
            if !any_finite_row(&likelihoods) {
                // every read assigns zero probability to every haplotype;
                // normalisation cannot succeed, so abort the region
                warn!("no finite likelihoods in {}; aborting region", active_region);
                break;
            }
            let latents = match timed(&self.metrics, "inference", || {
                self.strategy
                    .infer_latents(&haplotypes, &mut likelihoods, &active_region)
            }) {
                Ok(latents) => latents,
                Err(error) => {
                    if let Some(errors::Error::NonFinitePosterior { .. }) =
                        error.downcast_ref::<errors::Error>()
                    {
                        warn!("aborting {}: {}", active_region, error);
                        break;
                    }
                    return Err(error);
                }
            };
            let window_sites: Vec<GenomicRegion> = candidates
                .iter()
                .filter(|c| c.region().overlaps(&haplotype_region))
                .map(|c| c.region().clone())
                .collect();
            let phase_set = timed(&self.metrics, "phasing", || {
                phaser.try_phase(&haplotypes, &latents, &window_sites)
            });
            let refcall_from = completed_end;
            let mut iteration_called_regions: Vec<GenomicRegion> = Vec::new();
            let mut unphased_active = active_region.clone();
            if let Some(phase_set) = &phase_set {
                if let Some(phased_region) = &phase_set.region {
                    if active_region.overlaps(call_region) {
                        let phased_candidates: Vec<Variant> = candidates
                            .iter()
                            .filter(|c| c.region().overlaps(phased_region))
                            .cloned()
                            .collect();
                        let mut calls = self.strategy.call_variants(
                            &phased_candidates,
                            &haplotypes,
                            &latents,
                        )?;
                        apply_quality_cap(
                            &mut calls,
                            latents.estimated_lost_log_posterior_mass,
                        );
                        set_phasing(&mut calls, phase_set);
                        calls.retain(|call| call.region().overlaps(call_region));
                        iteration_called_regions
                            .extend(calls.iter().map(|call| call.region().clone()));
                        append_new(&mut result, calls);
                        let remaining = active_region.right_overhang(phased_region);
                        generator.force_forward(&remaining);
                        completed_end = completed_end.max(phased_region.end());
                        unphased_active = remaining;
                    }
                }
            }
            let mut next_active = generator.tell_next_active_region();
            if !has_passed(next_active.as_ref(), &active_region) {
                let removable = removable_haplotypes(
                    &haplotypes,
                    &latents.haplotype_posteriors,
                    &unphased_active,
                    crate::constants::MIN_HAPLOTYPE_POSTERIOR,
                );
                generator.remove(&removable);
                next_active = generator.tell_next_active_region();
            }
            let passed_region = match &next_active {
                Some(next) if active_region.begins_before(next) => {
                    Some(active_region.left_overhang(next))
                }
                None => Some(active_region.clone()),
                _ => None,
            };
            if let Some(passed_region) = passed_region {
                if !active_region.overlaps(call_region) {
                    last_window = Some((haplotypes, latents));
                    continue;
                }
                let mut uncalled_region = passed_region.clone();
                if let Some(phase_set) = &phase_set {
                    if let Some(phased) = &phase_set.region {
                        uncalled_region = passed_region.right_overhang(phased);
                    }
                }
                let uncalled_candidates: Vec<Variant> = candidates
                    .iter()
                    .filter(|c| c.region().overlaps(&uncalled_region))
                    .cloned()
                    .collect();
                let mut called_regions: Vec<GenomicRegion> = Vec::new();
                if !uncalled_candidates.is_empty() {
                    let mut calls = self.strategy.call_variants(
                        &uncalled_candidates,
                        &haplotypes,
                        &latents,
                    )?;
                    if !calls.is_empty() {
                        apply_quality_cap(
                            &mut calls,
                            latents.estimated_lost_log_posterior_mass,
                        );
                        called_regions =
                            calls.iter().map(|call| call.region().clone()).collect();
                        let forced_sites: Vec<GenomicRegion> = uncalled_candidates
                            .iter()
                            .map(|c| c.region().clone())
                            .collect();
                        let forced = phaser.force_phase(&haplotypes, &latents, &forced_sites);
                        set_phasing(&mut calls, &forced);
                        calls.retain(|call| call.region().overlaps(call_region));
                        append_new(&mut result, calls);
                    }
                }
                completed_end = completed_end.max(passed_region.end());
                if self.parameters.refcall_type != RefCallType::None {
                    let refcall_end = passed_region.end().min(call_region.end());
                    if refcall_from < refcall_end {
                        let refcall_region = GenomicRegion::new(
                            call_region.contig().to_owned(),
                            refcall_from,
                            refcall_end,
                        );
                        called_regions.extend(iteration_called_regions);
                        called_regions.sort();
                        let refcall_candidates: Vec<Variant> = candidates
                            .iter()
                            .filter(|c| c.region().overlaps(&refcall_region))
                            .cloned()
                            .collect();
                        let alleles = self.candidate_reference_alleles(
                            &refcall_region,
                            &refcall_candidates,
                            &called_regions,
                        )?;
                        let refcalls = self.strategy.call_reference(
                            &alleles,
                            &haplotypes,
                            &latents,
                            reads,
                        )?;
                        append_new(&mut result, refcalls);
                    }
                }
            }
            last_window = Some((haplotypes, latents));
        }
        // flush reference blocks over the tail the loop never reached
        if self.parameters.refcall_type != RefCallType::None
            && completed_end < call_region.end()
        {
            if let Some((haplotypes, latents)) = &last_window {
                let tail = GenomicRegion::new(
                    call_region.contig().to_owned(),
                    completed_end,
                    call_region.end(),
                );
                let alleles = self.candidate_reference_alleles(&tail, &[], &[])?;
                let refcalls =
                    self.strategy
                        .call_reference(&alleles, haplotypes, latents, reads)?;
                append_new(&mut result, refcalls);
            }
        }
        result.sort_by(|a, b| a.region().cmp(b.region()));
        Ok(result)
    }

    fn candidate_region(&self, call_region: &GenomicRegion, reads: &ReadMap) -> GenomicRegion {
        if !self.candidate_generator.requires_reads() {
            return call_region.clone();
        }
        let all_reads: Vec<crate::reads::AlignedRead> = reads
            .values()
            .flat_map(|sample_reads| sample_reads.iter().cloned())
            .collect();
        match encompassing_region(&all_reads) {
            Some(region) if region.same_contig(call_region) => region,
            _ => call_region.clone(),
        }
    }

    /// Alleles over uncalled intervals for reference calling: candidate
    /// alleles where candidates exist, reference alleles in between.
    fn candidate_reference_alleles(
        &self,
        region: &GenomicRegion,
        candidates: &[Variant],
        called_regions: &[GenomicRegion],
    ) -> Result<Vec<Allele>> {
        if region.is_empty() && candidates.is_empty() {
            return Ok(Vec::new());
        }
        let mut covered: Vec<GenomicRegion> = candidates
            .iter()
            .map(|c| c.region().clone())
            .chain(called_regions.iter().cloned())
            .collect();
        covered.sort();
        let uncovered = intervening_regions(region, &covered);
        let mut result = Vec::new();
        for gap in uncovered {
            if gap.is_empty() {
                continue;
            }
            match self.parameters.refcall_type {
                RefCallType::Blocked => {
                    result.push(Allele::reference(gap, self.reference)?);
                }
                RefCallType::Positional => {
                    for position in gap.begin()..gap.end() {
                        let base = GenomicRegion::new(gap.contig().to_owned(), position, position + 1);
                        result.push(Allele::reference(base, self.reference)?);
                    }
                }
                RefCallType::None => {}
            }
        }
        result.extend(decompose(candidates));
        result.sort();
        result.dedup();
        Ok(result)
    }
}

fn has_passed(next: Option<&GenomicRegion>, active: &GenomicRegion) -> bool {
    match next {
        Some(next) => next.is_after(active) && next != active,
        None => true,
    }
}

fn remove_passed_candidates(
    candidates: &mut Vec<Variant>,
    candidate_region: &GenomicRegion,
    haplotype_region: &GenomicRegion,
) {
    if candidate_region.begins_before(haplotype_region) {
        candidates.retain(|c| !c.region().is_before(haplotype_region));
    }
}

fn copy_overlapped(reads: &ReadMap, region: &GenomicRegion) -> ReadMap {
    reads
        .iter()
        .map(|(sample, sample_reads)| {
            (
                sample.clone(),
                sample_reads
                    .iter()
                    .filter(|read| read.region().overlaps(region))
                    .cloned()
                    .collect(),
            )
        })
        .collect()
}

/// The pair-HMM flank state: the parts of the haplotype region outside the
/// active region, trimmed to the extent of inactive candidates.
fn calculate_flank_state(
    haplotype_region: &GenomicRegion,
    active_region: &GenomicRegion,
    candidates: &[Variant],
) -> FlankState {
    let mut lhs = haplotype_region.left_overhang(active_region);
    let lhs_candidates: Vec<&Variant> = candidates
        .iter()
        .filter(|c| c.region().overlaps(&lhs))
        .collect();
    if lhs_candidates.is_empty() {
        lhs = lhs.head();
    } else {
        let rightmost = lhs_candidates
            .iter()
            .map(|c| c.region().end())
            .max()
            .expect("non-empty");
        lhs = GenomicRegion::new(lhs.contig().to_owned(), lhs.begin(), rightmost.min(lhs.end()));
    }
    let mut rhs = haplotype_region.right_overhang(active_region);
    let rhs_candidates: Vec<&Variant> = candidates
        .iter()
        .filter(|c| c.region().overlaps(&rhs))
        .collect();
    if rhs_candidates.is_empty() {
        rhs = rhs.tail();
    } else {
        let leftmost = rhs_candidates
            .iter()
            .map(|c| c.region().begin())
            .min()
            .expect("non-empty");
        rhs = GenomicRegion::new(rhs.contig().to_owned(), leftmost.max(rhs.begin()), rhs.end());
    }
    FlankState {
        active_region: active_region.clone(),
        left_flank: lhs,
        right_flank: rhs,
    }
}

fn set_phasing(calls: &mut [Call], phase_set: &PhaseSet) {
    for call in calls.iter_mut() {
        let call_region = call.region().clone();
        let samples: Vec<crate::SampleName> = call
            .genotype_calls
            .iter()
            .map(|(sample, _)| sample.clone())
            .collect();
        for sample in samples {
            if let Some(phase) = phase_set.find(&sample, &call_region) {
                call.set_phase(
                    &sample,
                    PhaseCall {
                        region: phase.region.clone(),
                        score: phase.score,
                    },
                );
            }
        }
    }
}

/// Append calls, skipping any that duplicate an already emitted region and
/// type (lagging windows can re-derive a call).
fn append_new(result: &mut Vec<Call>, calls: Vec<Call>) {
    for call in calls {
        let duplicate = result.iter().any(|existing| {
            existing.region() == call.region()
                && existing.call_type == call.call_type
                && existing.reference == call.reference
        });
        if !duplicate {
            result.push(call);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flank_state_trims_to_candidates() {
        let haplotype_region = GenomicRegion::new("chr1", 0, 100);
        let active = GenomicRegion::new("chr1", 40, 60);
        let candidates = vec![
            Variant::from_sequences("chr1", 20, b"A".to_vec(), b"T".to_vec()),
            Variant::from_sequences("chr1", 50, b"A".to_vec(), b"T".to_vec()),
            Variant::from_sequences("chr1", 80, b"A".to_vec(), b"T".to_vec()),
        ];
        let flank = calculate_flank_state(&haplotype_region, &active, &candidates);
        assert_eq!(flank.active_region, active);
        assert_eq!(flank.left_flank, GenomicRegion::new("chr1", 0, 21));
        assert_eq!(flank.right_flank, GenomicRegion::new("chr1", 80, 100));
    }

    #[test]
    fn test_flank_state_empty_without_candidates() {
        let haplotype_region = GenomicRegion::new("chr1", 0, 100);
        let active = GenomicRegion::new("chr1", 40, 60);
        let flank = calculate_flank_state(&haplotype_region, &active, &[]);
        assert!(flank.left_flank.is_empty());
        assert!(flank.right_flank.is_empty());
    }

    #[test]
    fn test_has_passed() {
        let active = GenomicRegion::new("chr1", 10, 20);
        let next = GenomicRegion::new("chr1", 30, 40);
        assert!(has_passed(Some(&next), &active));
        assert!(!has_passed(Some(&active), &active));
        assert!(has_passed(None, &active));
    }
}
