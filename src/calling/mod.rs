//! Call records and the caller strategies that produce them.

use std::collections::HashMap;

use anyhow::Result;
use bio::stats::LogProb;

use crate::genome::GenomicRegion;
use crate::likelihood::HaplotypeLikelihoodArray;
use crate::model::{GenotypePosterior, Latents};
use crate::reads::pipe::ReadMap;
use crate::utils::log_prob_false_to_phred;
use crate::variants::genotype::HaplotypeIndex;
use crate::variants::{Allele, Genotype, Haplotype, Variant};
use crate::SampleName;

pub mod caller;
pub mod cancer;
pub mod individual;
pub mod output;
pub mod population;
pub mod record_factory;
pub mod trio;

pub use caller::{Caller, CallerParameters, RefCallType};

/// Concrete kind of an emitted call; the record factory dispatches on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallType {
    GermlineVariant,
    Denovo,
    DenovoReferenceReversion,
    Somatic,
    Reference,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhaseCall {
    pub region: GenomicRegion,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct GenotypeCall {
    /// Called alleles in chromosome order; the order is consistent across
    /// the calls of one phase set because it follows the MAP haplotype
    /// assignment.
    pub genotype: Vec<Allele>,
    /// PHRED-scaled genotype quality.
    pub posterior: f64,
    pub phase: Option<PhaseCall>,
}

impl GenotypeCall {
    pub fn ploidy(&self) -> usize {
        self.genotype.len()
    }
}

#[derive(Debug, Clone)]
pub struct Call {
    pub reference: Allele,
    pub call_type: CallType,
    /// PHRED-scaled call quality.
    pub quality: f64,
    pub genotype_calls: Vec<(SampleName, GenotypeCall)>,
    pub model_posterior: Option<f64>,
    pub denovo_posterior: Option<f64>,
    pub somatic_posterior: Option<f64>,
}

impl Call {
    pub fn region(&self) -> &GenomicRegion {
        self.reference.region()
    }

    pub fn genotype_call(&self, sample: &SampleName) -> Option<&GenotypeCall> {
        self.genotype_calls
            .iter()
            .find(|(name, _)| name == sample)
            .map(|(_, call)| call)
    }

    pub fn genotype_call_mut(&mut self, sample: &SampleName) -> Option<&mut GenotypeCall> {
        self.genotype_calls
            .iter_mut()
            .find(|(name, _)| name == sample)
            .map(|(_, call)| call)
    }

    pub fn is_phased(&self, sample: &SampleName) -> bool {
        self.genotype_call(sample)
            .map_or(false, |call| call.phase.is_some())
    }

    pub fn all_phased(&self) -> bool {
        !self.genotype_calls.is_empty()
            && self.genotype_calls.iter().all(|(_, call)| call.phase.is_some())
    }

    pub fn set_phase(&mut self, sample: &SampleName, phase: PhaseCall) {
        if let Some(call) = self.genotype_call_mut(sample) {
            call.phase = Some(phase);
        }
    }
}

/// The per-caller specialisation: what the shared driver loop delegates to.
pub trait CallerStrategy {
    fn samples(&self) -> &[SampleName];

    fn call_types(&self) -> &'static [CallType];

    /// Run genotype inference over the active haplotypes.
    fn infer_latents(
        &mut self,
        haplotypes: &[Haplotype],
        likelihoods: &mut HaplotypeLikelihoodArray,
        region: &GenomicRegion,
    ) -> Result<Latents>;

    /// Turn the posterior into variant calls for the given candidates.
    fn call_variants(
        &mut self,
        candidates: &[Variant],
        haplotypes: &[Haplotype],
        latents: &Latents,
    ) -> Result<Vec<Call>>;

    /// Reference (non-variant) calls over the given alleles.
    fn call_reference(
        &mut self,
        alleles: &[Allele],
        haplotypes: &[Haplotype],
        latents: &Latents,
        reads: &ReadMap,
    ) -> Result<Vec<Call>>;
}

impl CallerStrategy for Box<dyn CallerStrategy + Send> {
    fn samples(&self) -> &[SampleName] {
        (**self).samples()
    }

    fn call_types(&self) -> &'static [CallType] {
        (**self).call_types()
    }

    fn infer_latents(
        &mut self,
        haplotypes: &[Haplotype],
        likelihoods: &mut HaplotypeLikelihoodArray,
        region: &GenomicRegion,
    ) -> Result<Latents> {
        (**self).infer_latents(haplotypes, likelihoods, region)
    }

    fn call_variants(
        &mut self,
        candidates: &[Variant],
        haplotypes: &[Haplotype],
        latents: &Latents,
    ) -> Result<Vec<Call>> {
        (**self).call_variants(candidates, haplotypes, latents)
    }

    fn call_reference(
        &mut self,
        alleles: &[Allele],
        haplotypes: &[Haplotype],
        latents: &Latents,
        reads: &ReadMap,
    ) -> Result<Vec<Call>> {
        (**self).call_reference(alleles, haplotypes, latents, reads)
    }
}

/// PHRED posterior that `allele` segregates in at least one sample,
/// under independent per-sample genotype posteriors.
pub fn allele_posterior(
    allele: &Allele,
    haplotypes: &[Haplotype],
    posteriors: &HashMap<SampleName, GenotypePosterior>,
) -> f64 {
    let contains = |genotype: &Genotype<HaplotypeIndex>| {
        genotype
            .iter()
            .any(|&h| crate::model::trio::contains_helper(&haplotypes[h as usize], allele))
    };
    let mut log_absent_everywhere = LogProb::ln_one();
    for posterior in posteriors.values() {
        log_absent_everywhere = log_absent_everywhere + posterior.prob_allele_absent(&contains);
    }
    log_prob_false_to_phred(log_absent_everywhere)
}

/// The called genotype of one sample over `region`: the MAP genotype's
/// expressed alleles, with a posterior from the mass of genotypes that
/// express the same alleles there.
pub fn call_genotype(
    region: &GenomicRegion,
    haplotypes: &[Haplotype],
    posterior: &GenotypePosterior,
) -> GenotypeCall {
    let (map_genotype, _) = match posterior.map_genotype() {
        Some(map) => map,
        None => {
            return GenotypeCall {
                genotype: Vec::new(),
                posterior: 0.0,
                phase: None,
            }
        }
    };
    // chromosome order follows the MAP genotype's haplotype order, so it is
    // consistent across every call of the window
    let called: Vec<Allele> = map_genotype
        .iter()
        .filter_map(|&h| haplotypes[h as usize].expressed_allele(region))
        .collect();
    let called_multiset = Genotype::new(called.clone());
    let mut disagreeing = Vec::new();
    for (genotype, lp) in posterior.genotypes.iter().zip(&posterior.log_posteriors) {
        let expressed: Vec<Allele> = genotype
            .iter()
            .filter_map(|&h| haplotypes[h as usize].expressed_allele(region))
            .collect();
        if Genotype::new(expressed) != called_multiset {
            disagreeing.push(*lp);
        }
    }
    let error = if disagreeing.is_empty() {
        LogProb::ln_zero()
    } else {
        LogProb::ln_sum_exp(&disagreeing)
    };
    GenotypeCall {
        genotype: called,
        posterior: log_prob_false_to_phred(error),
        phase: None,
    }
}

/// Genotype call for a reference allele. Outside the haplotype window the
/// sample is reference by construction (no candidate survived there); the
/// confidence falls back to the MAP genotype mass.
pub fn call_reference_genotype(
    allele: &Allele,
    haplotypes: &[Haplotype],
    posterior: &GenotypePosterior,
) -> GenotypeCall {
    let inside = haplotypes
        .first()
        .map_or(false, |h| h.region().contains(allele.region()));
    if inside {
        return call_genotype(allele.region(), haplotypes, posterior);
    }
    let (ploidy, confidence) = posterior.map_genotype().map_or((0, 0.0), |(genotype, lp)| {
        (
            genotype.ploidy(),
            crate::utils::prob_false_to_phred(1.0 - lp.exp()),
        )
    });
    GenotypeCall {
        genotype: vec![allele.clone(); ploidy],
        posterior: confidence,
        phase: None,
    }
}

/// Cap call qualities when genotype truncation lost posterior mass.
pub fn apply_quality_cap(calls: &mut [Call], lost_mass: Option<LogProb>) {
    if let Some(lost) = lost_mass {
        let cap = log_prob_false_to_phred(lost);
        for call in calls.iter_mut() {
            call.quality = call.quality.min(cap);
        }
    }
}

/// Find the candidate variant whose alternative allele matches.
pub fn find_variant<'a>(allele: &Allele, candidates: &'a [Variant]) -> Option<&'a Variant> {
    candidates
        .iter()
        .find(|candidate| candidate.alt_allele() == allele)
}
