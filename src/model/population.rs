//! Multi-sample population model.
//!
//! Given the shared haplotype set, sample genotypes are conditionally
//! independent, so the joint factorises over samples. For small genotype
//! spaces the exact factorised posterior is used directly; above a
//! threshold, haplotype frequencies are refined by expectation-maximisation
//! and genotype priors are tilted by the fitted frequencies.

use std::collections::HashMap;

use anyhow::Result;
use bio::stats::LogProb;

use crate::genome::GenomicRegion;
use crate::likelihood::HaplotypeLikelihoodArray;
use crate::model::priors::GenotypePriorModel;
use crate::model::{
    genotype_log_likelihood, marginal_haplotype_posteriors, sample_rows, GenotypePosterior,
    Latents,
};
use crate::variants::genotype::{generate_all_genotypes, HaplotypeIndex};
use crate::variants::{Genotype, Haplotype};
use crate::SampleName;

/// Genotype spaces at least this large get the EM refinement.
const EM_THRESHOLD: usize = 64;
const EM_ROUNDS: usize = 5;

pub struct PopulationModel {
    prior: GenotypePriorModel,
    ploidy: usize,
    max_genotypes: usize,
}

impl PopulationModel {
    pub fn new(prior: GenotypePriorModel, ploidy: usize, max_genotypes: usize) -> Self {
        PopulationModel {
            prior,
            ploidy,
            max_genotypes,
        }
    }

    pub fn infer(
        &self,
        haplotypes: &[Haplotype],
        likelihoods: &HaplotypeLikelihoodArray,
        samples: &[SampleName],
        region: &GenomicRegion,
    ) -> Result<Latents> {
        let (genotypes, truncated) =
            generate_all_genotypes(haplotypes.len(), self.ploidy, self.max_genotypes);
        // per-sample genotype log-likelihoods
        let mut sample_log_likelihoods: Vec<Vec<LogProb>> = Vec::with_capacity(samples.len());
        for sample in samples {
            let rows = sample_rows(likelihoods, sample);
            sample_log_likelihoods.push(
                genotypes
                    .iter()
                    .map(|genotype| genotype_log_likelihood(genotype, &rows))
                    .collect(),
            );
        }
        let base_priors: Vec<LogProb> = genotypes
            .iter()
            .map(|genotype| self.prior.log_prior(genotype, haplotypes))
            .collect();
        let frequency_priors = if genotypes.len() >= EM_THRESHOLD {
            Some(self.fit_frequencies(
                haplotypes.len(),
                &genotypes,
                &base_priors,
                &sample_log_likelihoods,
            ))
        } else {
            None
        };
        let mut genotype_posteriors = HashMap::new();
        let mut log_evidence = LogProb::ln_one();
        for (sample, log_likelihoods) in samples.iter().zip(&sample_log_likelihoods) {
            let log_joints: Vec<LogProb> = genotypes
                .iter()
                .enumerate()
                .map(|(g, genotype)| {
                    let prior = match &frequency_priors {
                        Some(frequencies) => {
                            base_priors[g] + frequency_log_prior(genotype, frequencies)
                        }
                        None => base_priors[g],
                    };
                    prior + log_likelihoods[g]
                })
                .collect();
            let posterior =
                GenotypePosterior::from_log_joints(genotypes.clone(), log_joints, region)?;
            log_evidence = log_evidence + posterior.log_evidence;
            genotype_posteriors.insert(sample.clone(), posterior);
        }
        let haplotype_posteriors =
            marginal_haplotype_posteriors(haplotypes.len(), genotype_posteriors.values());
        let estimated_lost_log_posterior_mass = truncated.then(|| {
            // conservative estimate: the truncated tail carries at most the
            // mass of the least likely retained genotype per sample
            let min_retained = genotype_posteriors
                .values()
                .flat_map(|p| p.log_posteriors.iter())
                .fold(LogProb::ln_one(), |min, lp| if *lp < min { *lp } else { min });
            min_retained
        });
        Ok(Latents {
            genotype_posteriors,
            haplotype_posteriors,
            log_evidence,
            estimated_lost_log_posterior_mass,
            trio: None,
            somatic: None,
        })
    }

    /// EM over haplotype frequencies: E-step computes per-sample genotype
    /// posteriors under current frequencies, M-step re-estimates
    /// frequencies from expected haplotype dosages.
    fn fit_frequencies(
        &self,
        num_haplotypes: usize,
        genotypes: &[Genotype<HaplotypeIndex>],
        base_priors: &[LogProb],
        sample_log_likelihoods: &[Vec<LogProb>],
    ) -> Vec<f64> {
        let mut frequencies = vec![1.0 / num_haplotypes as f64; num_haplotypes];
        for _ in 0..EM_ROUNDS {
            let mut expected = vec![1e-6f64; num_haplotypes];
            for log_likelihoods in sample_log_likelihoods {
                let mut log_joints: Vec<LogProb> = genotypes
                    .iter()
                    .enumerate()
                    .map(|(g, genotype)| {
                        base_priors[g]
                            + frequency_log_prior(genotype, &frequencies)
                            + log_likelihoods[g]
                    })
                    .collect();
                if crate::utils::normalise_log_probs(&mut log_joints).is_none() {
                    continue;
                }
                for (genotype, lp) in genotypes.iter().zip(&log_joints) {
                    let weight = lp.exp();
                    for &h in genotype.iter() {
                        expected[h as usize] += weight;
                    }
                }
            }
            let total: f64 = expected.iter().sum();
            for (f, e) in frequencies.iter_mut().zip(&expected) {
                *f = e / total;
            }
        }
        frequencies
    }
}

/// Multinomial-style log prior of a genotype under haplotype frequencies.
fn frequency_log_prior(genotype: &Genotype<HaplotypeIndex>, frequencies: &[f64]) -> LogProb {
    let mut prior = 0.0;
    for &h in genotype.iter() {
        prior += frequencies[h as usize].max(f64::MIN_POSITIVE).ln();
    }
    LogProb(prior)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::likelihood::tests_support::populated_array;

    #[test]
    fn test_factorised_posterior_normalised_per_sample() {
        let (haplotypes, array) = populated_array();
        let model = PopulationModel::new(GenotypePriorModel::Uniform, 2, 1000);
        let samples = vec!["s1".to_owned()];
        let latents = model
            .infer(
                &haplotypes,
                &array,
                &samples,
                &GenomicRegion::new("chr1", 0, 8),
            )
            .unwrap();
        for posterior in latents.genotype_posteriors.values() {
            let total: f64 = posterior.log_posteriors.iter().map(|lp| lp.exp()).sum();
            assert_relative_eq!(total, 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_haplotype_posteriors_bounded() {
        let (haplotypes, array) = populated_array();
        let model = PopulationModel::new(GenotypePriorModel::Uniform, 2, 1000);
        let samples = vec!["s1".to_owned()];
        let latents = model
            .infer(
                &haplotypes,
                &array,
                &samples,
                &GenomicRegion::new("chr1", 0, 8),
            )
            .unwrap();
        assert!(latents
            .haplotype_posteriors
            .iter()
            .all(|&p| (0.0..=1.0 + 1e-9).contains(&p)));
        // the reference haplotype is supported by every read
        assert!(latents.haplotype_posteriors[0] > 0.5);
    }

    #[test]
    fn test_frequency_prior_favours_common_haplotypes() {
        let frequencies = vec![0.9, 0.1];
        let common = Genotype::new(vec![0u32, 0]);
        let rare = Genotype::new(vec![1u32, 1]);
        assert!(frequency_log_prior(&common, &frequencies) > frequency_log_prior(&rare, &frequencies));
    }
}
