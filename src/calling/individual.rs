//! Individual (single-sample) caller strategy.

use anyhow::Result;
use bio::stats::LogProb;

use crate::calling::{
    allele_posterior, call_genotype, call_reference_genotype, Call, CallType, CallerStrategy,
    GenotypeCall,
};
use crate::genome::GenomicRegion;
use crate::likelihood::HaplotypeLikelihoodArray;
use crate::model::priors::GenotypePriorModel;
use crate::model::{GenotypePosterior, IndividualModel, Latents};
use crate::reads::pipe::ReadMap;
use crate::variants::{Allele, Haplotype, Variant};
use crate::SampleName;

#[derive(Debug, Clone)]
pub struct IndividualCallerParameters {
    pub ploidy: usize,
    pub max_genotypes: usize,
    /// PHRED thresholds.
    pub min_variant_posterior: f64,
    pub min_refcall_posterior: f64,
}

impl Default for IndividualCallerParameters {
    fn default() -> Self {
        IndividualCallerParameters {
            ploidy: crate::constants::DEFAULT_ORGANISM_PLOIDY,
            max_genotypes: crate::constants::DEFAULT_MAX_GENOTYPES,
            min_variant_posterior: 2.0,
            min_refcall_posterior: 2.0,
        }
    }
}

pub struct IndividualCallerStrategy {
    samples: Vec<SampleName>,
    model: IndividualModel,
    parameters: IndividualCallerParameters,
}

impl IndividualCallerStrategy {
    pub fn new(
        sample: SampleName,
        prior: GenotypePriorModel,
        parameters: IndividualCallerParameters,
    ) -> Self {
        let model = IndividualModel::new(prior, parameters.ploidy, parameters.max_genotypes);
        IndividualCallerStrategy {
            samples: vec![sample],
            model,
            parameters,
        }
    }

    fn sample(&self) -> &SampleName {
        &self.samples[0]
    }
}

impl CallerStrategy for IndividualCallerStrategy {
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
        likelihoods.prime(self.sample());
        let (posterior, truncated) =
            self.model
                .infer(haplotypes, likelihoods, self.sample(), region)?;
        likelihoods.unprime();
        let mut latents =
            Latents::single_sample(self.sample().clone(), posterior, haplotypes.len());
        if truncated {
            latents.estimated_lost_log_posterior_mass = Some(estimate_lost_mass(
                &latents.genotype_posteriors[self.sample()],
            ));
        }
        Ok(latents)
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
            let genotype_call = call_genotype(
                candidate.region(),
                haplotypes,
                &latents.genotype_posteriors[self.sample()],
            );
            // only emit alleles the called genotype actually carries
            if !genotype_call
                .genotype
                .iter()
                .any(|allele| allele == candidate.alt_allele())
            {
                continue;
            }
            calls.push(Call {
                reference: candidate.ref_allele().clone(),
                call_type: CallType::GermlineVariant,
                quality: posterior,
                genotype_calls: vec![(self.sample().clone(), genotype_call)],
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
        let posterior = &latents.genotype_posteriors[self.sample()];
        let mut calls = Vec::new();
        for allele in alleles {
            let genotype_call = call_reference_genotype(allele, haplotypes, posterior);
            let is_homozygous_for_allele = genotype_call.ploidy() > 0
                && genotype_call
                    .genotype
                    .iter()
                    .all(|called| called.sequence() == allele.sequence());
            if !is_homozygous_for_allele {
                continue;
            }
            if genotype_call.posterior < self.parameters.min_refcall_posterior {
                continue;
            }
            calls.push(Call {
                reference: allele.clone(),
                call_type: CallType::Reference,
                quality: genotype_call.posterior,
                genotype_calls: vec![(
                    self.sample().clone(),
                    GenotypeCall {
                        genotype: genotype_call.genotype.clone(),
                        posterior: genotype_call.posterior,
                        phase: None,
                    },
                )],
                model_posterior: None,
                denovo_posterior: None,
                somatic_posterior: None,
            });
        }
        Ok(calls)
    }
}

/// Conservative bound on the posterior mass lost to truncation: the mass of
/// the least likely retained genotype.
pub fn estimate_lost_mass(posterior: &GenotypePosterior) -> LogProb {
    posterior
        .log_posteriors
        .iter()
        .fold(LogProb::ln_one(), |min, lp| if *lp < min { *lp } else { min })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::likelihood::tests_support::populated_array;

    fn strategy() -> IndividualCallerStrategy {
        IndividualCallerStrategy::new(
            "s1".to_owned(),
            GenotypePriorModel::Uniform,
            IndividualCallerParameters::default(),
        )
    }

    #[test]
    fn test_reference_reads_give_no_variant_calls() {
        let (haplotypes, mut array) = populated_array();
        let mut strategy = strategy();
        let region = GenomicRegion::new("chr1", 0, 8);
        let latents = strategy
            .infer_latents(&haplotypes, &mut array, &region)
            .unwrap();
        let candidate = Variant::from_sequences("chr1", 4, b"A".to_vec(), b"T".to_vec());
        let calls = strategy
            .call_variants(&[candidate], &haplotypes, &latents)
            .unwrap();
        assert!(calls.is_empty());
    }

    #[test]
    fn test_reference_call_on_covered_interval() {
        let (haplotypes, mut array) = populated_array();
        let mut strategy = strategy();
        let region = GenomicRegion::new("chr1", 0, 8);
        let latents = strategy
            .infer_latents(&haplotypes, &mut array, &region)
            .unwrap();
        let allele = Allele::new(GenomicRegion::new("chr1", 0, 4), b"ACGT".to_vec());
        let refcalls = strategy
            .call_reference(&[allele], &haplotypes, &latents, &ReadMap::new())
            .unwrap();
        assert_eq!(refcalls.len(), 1);
        assert_eq!(refcalls[0].call_type, CallType::Reference);
    }
}
