//! Cancer caller strategy: germline calls plus somatic calls backed by a
//! three-way model comparison (germline / CNV / somatic).

use anyhow::Result;

use crate::calling::{
    allele_posterior, call_genotype, call_reference_genotype, Call, CallType, CallerStrategy,
    GenotypeCall,
};
use crate::genome::GenomicRegion;
use crate::likelihood::HaplotypeLikelihoodArray;
use crate::model::cnv::CnvModel;
use crate::model::priors::{GenotypePriorModel, SomaticMutationModel};
use crate::model::somatic::{model_posteriors, SomaticModel};
use crate::model::{IndividualModel, Latents};
use crate::reads::pipe::ReadMap;
use crate::utils::log_prob_false_to_phred;
use crate::variants::{Allele, Haplotype, Variant};
use crate::SampleName;

#[derive(Debug, Clone)]
pub struct CancerCallerParameters {
    pub ploidy: usize,
    pub max_genotypes: usize,
    pub min_variant_posterior: f64,
    pub min_somatic_posterior: f64,
    pub min_refcall_posterior: f64,
    pub somatic_mutation_rate: f64,
    pub call_somatics_only: bool,
}

impl Default for CancerCallerParameters {
    fn default() -> Self {
        CancerCallerParameters {
            ploidy: crate::constants::DEFAULT_ORGANISM_PLOIDY,
            max_genotypes: crate::constants::DEFAULT_MAX_GENOTYPES,
            min_variant_posterior: 2.0,
            min_somatic_posterior: 10.0,
            min_refcall_posterior: 2.0,
            somatic_mutation_rate: crate::constants::DEFAULT_SOMATIC_MUTATION_RATE,
            call_somatics_only: false,
        }
    }
}

pub struct CancerCallerStrategy {
    /// All samples; the normal sample, when present, is one of them.
    samples: Vec<SampleName>,
    normal: Option<SampleName>,
    prior: GenotypePriorModel,
    parameters: CancerCallerParameters,
    /// Result of the latest model comparison, set by `infer_latents`.
    model_posteriors: Option<crate::model::somatic::ModelPosteriors>,
}

impl CancerCallerStrategy {
    pub fn new(
        samples: Vec<SampleName>,
        normal: Option<SampleName>,
        prior: GenotypePriorModel,
        parameters: CancerCallerParameters,
    ) -> Self {
        CancerCallerStrategy {
            samples,
            normal,
            prior,
            parameters,
            model_posteriors: None,
        }
    }

    fn tumour(&self) -> &SampleName {
        self.samples
            .iter()
            .find(|sample| Some(*sample) != self.normal.as_ref())
            .unwrap_or(&self.samples[0])
    }

    fn germline_reference_sample(&self) -> &SampleName {
        self.normal.as_ref().unwrap_or_else(|| self.tumour())
    }
}

impl CallerStrategy for CancerCallerStrategy {
    fn samples(&self) -> &[SampleName] {
        &self.samples
    }

    fn call_types(&self) -> &'static [CallType] {
        &[
            CallType::GermlineVariant,
            CallType::Somatic,
            CallType::Reference,
        ]
    }

    fn infer_latents(
        &mut self,
        haplotypes: &[Haplotype],
        likelihoods: &mut HaplotypeLikelihoodArray,
        region: &GenomicRegion,
    ) -> Result<Latents> {
        let germline_model = IndividualModel::new(
            self.prior.clone(),
            self.parameters.ploidy,
            self.parameters.max_genotypes,
        );
        let cnv_model = CnvModel::new(
            self.prior.clone(),
            self.parameters.ploidy,
            self.parameters.max_genotypes,
        );
        let somatic_model = SomaticModel::new(
            self.prior.clone(),
            SomaticMutationModel::new(self.parameters.somatic_mutation_rate),
            self.parameters.ploidy,
            self.parameters.max_genotypes,
        );
        // germline posteriors per sample drive genotype calls
        let mut genotype_posteriors = std::collections::HashMap::new();
        let mut truncated = false;
        for sample in &self.samples {
            let (posterior, was_truncated) =
                germline_model.infer(haplotypes, likelihoods, sample, region)?;
            truncated |= was_truncated;
            genotype_posteriors.insert(sample.clone(), posterior);
        }
        let reference_sample = self.germline_reference_sample().clone();
        let germline_evidence = genotype_posteriors[&reference_sample].log_evidence;
        let tumour = self.tumour().clone();
        let (cnv_posterior, _) = cnv_model.infer(haplotypes, likelihoods, &tumour, region)?;
        let somatic_latents = somatic_model.infer(
            haplotypes,
            likelihoods,
            &tumour,
            self.normal.as_ref(),
            region,
        )?;
        let tumour_germline_evidence = genotype_posteriors[&tumour].log_evidence;
        let posteriors = model_posteriors(
            tumour_germline_evidence,
            cnv_posterior.log_evidence,
            somatic_latents.log_evidence,
            self.parameters.somatic_mutation_rate,
        );
        let haplotype_posteriors = crate::model::marginal_haplotype_posteriors(
            haplotypes.len(),
            genotype_posteriors.values(),
        );
        let estimated_lost_log_posterior_mass = truncated.then(|| {
            crate::calling::individual::estimate_lost_mass(
                &genotype_posteriors[&reference_sample],
            )
        });
        // stash the model comparison where call_variants can reach it
        self.model_posteriors = Some(posteriors);
        Ok(Latents {
            genotype_posteriors,
            haplotype_posteriors,
            log_evidence: germline_evidence,
            estimated_lost_log_posterior_mass,
            trio: None,
            somatic: Some(somatic_latents),
        })
    }

    fn call_variants(
        &mut self,
        candidates: &[Variant],
        haplotypes: &[Haplotype],
        latents: &Latents,
    ) -> Result<Vec<Call>> {
        let somatic_latents = match &latents.somatic {
            Some(somatic) => somatic,
            None => return Ok(Vec::new()),
        };
        let model = self
            .model_posteriors
            .unwrap_or(crate::model::somatic::ModelPosteriors {
                germline: 1.0,
                cnv: 0.0,
                somatic: 0.0,
            });
        let mut calls = Vec::new();
        for candidate in candidates {
            let alt = candidate.alt_allele();
            // somatic: mass of cancer genotypes whose somatic part carries
            // the allele while the germline does not
            let somatic_mass = somatic_latents.prob_not_somatic(|genotype| {
                let in_somatic = genotype.somatic.iter().any(|&h| {
                    crate::model::trio::contains_helper(&haplotypes[h as usize], alt)
                });
                let in_germline = genotype.germline.iter().any(|&h| {
                    crate::model::trio::contains_helper(&haplotypes[h as usize], alt)
                });
                in_somatic && !in_germline
            });
            let somatic_posterior =
                log_prob_false_to_phred(somatic_mass) * model.somatic.max(f64::MIN_POSITIVE);
            let germline_posterior = allele_posterior(
                alt,
                haplotypes,
                &latents.genotype_posteriors,
            );
            if somatic_posterior >= self.parameters.min_somatic_posterior
                && somatic_posterior >= germline_posterior
            {
                let mut genotype_calls = Vec::with_capacity(self.samples.len());
                for sample in &self.samples {
                    genotype_calls.push((
                        sample.clone(),
                        call_genotype(
                            candidate.region(),
                            haplotypes,
                            &latents.genotype_posteriors[sample],
                        ),
                    ));
                }
                calls.push(Call {
                    reference: candidate.ref_allele().clone(),
                    call_type: CallType::Somatic,
                    quality: somatic_posterior,
                    genotype_calls,
                    model_posterior: Some(model.somatic),
                    denovo_posterior: None,
                    somatic_posterior: Some(somatic_posterior),
                });
                continue;
            }
            if self.parameters.call_somatics_only {
                continue;
            }
            if germline_posterior < self.parameters.min_variant_posterior {
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
                genotyped |= genotype_call.genotype.iter().any(|allele| allele == alt);
                genotype_calls.push((sample.clone(), genotype_call));
            }
            if !genotyped {
                continue;
            }
            calls.push(Call {
                reference: candidate.ref_allele().clone(),
                call_type: CallType::GermlineVariant,
                quality: germline_posterior * model.germline.max(f64::MIN_POSITIVE),
                genotype_calls,
                model_posterior: Some(model.germline),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::priors::CoalescentModel;
    use crate::reads::tests::mock_read;
    use crate::reference::tests::mock_reference;

    fn fixture() -> (Vec<Haplotype>, HaplotypeLikelihoodArray) {
        let reference = mock_reference("chr1", b"ACGTACGTACGT");
        let region = GenomicRegion::new("chr1", 0, 12);
        let reference_hap = Haplotype::reference(region.clone(), &reference).unwrap();
        let alt = Haplotype::build(
            region,
            vec![Allele::new(GenomicRegion::new("chr1", 4, 5), b"T".to_vec())],
            &reference,
        )
        .unwrap();
        let haplotypes = vec![reference_hap, alt];
        let mut reads = ReadMap::new();
        let make = |n_ref: usize, n_alt: usize, tag: &str| {
            let mut result = Vec::new();
            for i in 0..n_ref {
                let mut read = mock_read("chr1", 0, b"ACGTACGTACGT", 30);
                read.name_mut()
                    .extend_from_slice(format!("{}r{}", tag, i).as_bytes());
                result.push(read);
            }
            for i in 0..n_alt {
                let mut read = mock_read("chr1", 0, b"ACGTTCGTACGT", 30);
                read.name_mut()
                    .extend_from_slice(format!("{}a{}", tag, i).as_bytes());
                result.push(read);
            }
            result.sort();
            result
        };
        reads.insert("tumour".to_owned(), make(24, 6, "t"));
        reads.insert("normal".to_owned(), make(30, 0, "n"));
        let mut array =
            HaplotypeLikelihoodArray::new(vec!["tumour".to_owned(), "normal".to_owned()]);
        array.populate(&reads, &haplotypes, None);
        (haplotypes, array)
    }

    #[test]
    fn test_subclonal_alt_called_somatic() {
        let (haplotypes, mut array) = fixture();
        let mut strategy = CancerCallerStrategy::new(
            vec!["tumour".to_owned(), "normal".to_owned()],
            Some("normal".to_owned()),
            GenotypePriorModel::Coalescent(CoalescentModel::default()),
            CancerCallerParameters::default(),
        );
        let region = GenomicRegion::new("chr1", 0, 12);
        let latents = strategy
            .infer_latents(&haplotypes, &mut array, &region)
            .unwrap();
        let candidate = Variant::from_sequences("chr1", 4, b"A".to_vec(), b"T".to_vec());
        let calls = strategy
            .call_variants(&[candidate], &haplotypes, &latents)
            .unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].call_type, CallType::Somatic);
        assert!(calls[0].somatic_posterior.unwrap() >= 10.0);
        assert!(calls[0].model_posterior.is_some());
    }
}
