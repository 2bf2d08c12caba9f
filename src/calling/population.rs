//! Joint caller for cohorts of independent samples.

use anyhow::Result;

use crate::calling::{
    allele_posterior, call_genotype, call_reference_genotype, Call, CallType, CallerStrategy,
    GenotypeCall,
};
use crate::genome::GenomicRegion;
use crate::likelihood::HaplotypeLikelihoodArray;
use crate::model::priors::GenotypePriorModel;
use crate::model::{Latents, PopulationModel};
use crate::reads::pipe::ReadMap;
use crate::variants::{Allele, Haplotype, Variant};
use crate::SampleName;

#[derive(Debug, Clone)]
pub struct PopulationCallerParameters {
    pub ploidy: usize,
    pub max_genotypes: usize,
    pub min_variant_posterior: f64,
    pub min_refcall_posterior: f64,
}

impl Default for PopulationCallerParameters {
    fn default() -> Self {
        PopulationCallerParameters {
            ploidy: crate::constants::DEFAULT_ORGANISM_PLOIDY,
            max_genotypes: crate::constants::DEFAULT_MAX_GENOTYPES,
            min_variant_posterior: 2.0,
            min_refcall_posterior: 2.0,
        }
    }
}

pub struct PopulationCallerStrategy {
    samples: Vec<SampleName>,
    model: PopulationModel,
    parameters: PopulationCallerParameters,
}

impl PopulationCallerStrategy {
    pub fn new(
        samples: Vec<SampleName>,
        prior: GenotypePriorModel,
        parameters: PopulationCallerParameters,
    ) -> Self {
        let model = PopulationModel::new(prior, parameters.ploidy, parameters.max_genotypes);
        PopulationCallerStrategy {
            samples,
            model,
            parameters,
        }
    }
}

impl CallerStrategy for PopulationCallerStrategy {
    fn samples(&self) -> &[SampleName] {
        &self.samples
    }

    fn call_types(&self) -> &'static [CallType] {
        &[CallType::GermlineVariant, CallType::Reference]
    }

    fn infer_latents(
        &mut self,
        haplotypes: &[Haplotype],
        likelihoods: &mut HaplotypeLikelihoodArray,
        region: &GenomicRegion,
    ) -> Result<Latents> {
        self.model
            .infer(haplotypes, likelihoods, &self.samples, region)
    }

    fn call_variants(
        &mut self,
        candidates: &[Variant],
        haplotypes: &[Haplotype],
        latents: &Latents,
    ) -> Result<Vec<Call>> {
        let mut calls = Vec::new();
        for candidate in candidates {
            let posterior = allele_posterior(
                candidate.alt_allele(),
                haplotypes,
                &latents.genotype_posteriors,
            );
            if posterior < self.parameters.min_variant_posterior {
                continue;
            }
            let mut genotype_calls = Vec::with_capacity(self.samples.len());
            let mut genotyped = false;
            for sample in &self.samples {
                let genotype_call = call_genotype(
                    candidate.region(),
                    haplotypes,
                    &latents.genotype_posteriors[sample],
                );
                genotyped |= genotype_call
                    .genotype
                    .iter()
                    .any(|allele| allele == candidate.alt_allele());
                genotype_calls.push((sample.clone(), genotype_call));
            }
            if !genotyped {
                continue;
            }
            calls.push(Call {
                reference: candidate.ref_allele().clone(),
                call_type: CallType::GermlineVariant,
                quality: posterior,
                genotype_calls,
                model_posterior: None,
                denovo_posterior: None,
                somatic_posterior: None,
            });
        }
        Ok(calls)
    }

    fn call_reference(
        &mut self,
        alleles: &[Allele],
        haplotypes: &[Haplotype],
        latents: &Latents,
        _reads: &ReadMap,
    ) -> Result<Vec<Call>> {
        let mut calls = Vec::new();
        for allele in alleles {
            let mut genotype_calls: Vec<(SampleName, GenotypeCall)> = Vec::new();
            let mut min_posterior = f64::INFINITY;
            let mut all_reference = true;
            for sample in &self.samples {
                let genotype_call = call_reference_genotype(
                    allele,
                    haplotypes,
                    &latents.genotype_posteriors[sample],
                );
                all_reference &= genotype_call.ploidy() > 0
                    && genotype_call
                        .genotype
                        .iter()
                        .all(|called| called.sequence() == allele.sequence());
                min_posterior = min_posterior.min(genotype_call.posterior);
                genotype_calls.push((sample.clone(), genotype_call));
            }
            if !all_reference || min_posterior < self.parameters.min_refcall_posterior {
                continue;
            }
            calls.push(Call {
                reference: allele.clone(),
                call_type: CallType::Reference,
                quality: min_posterior,
                genotype_calls,
                model_posterior: None,
                denovo_posterior: None,
                somatic_posterior: None,
            });
        }
        Ok(calls)
    }
}
