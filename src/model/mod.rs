//! Bayesian genotype models.
//!
//! All five models share one contract: given the active haplotypes and the
//! per-sample likelihood array, return a normalised posterior over
//! genotypes together with the log marginal likelihood of the reads. All
//! intermediate arithmetic happens in log space; normalisation uses
//! log-sum-exp; a truncated genotype space reports its estimated lost
//! posterior mass so emitted qualities can be capped.

use std::collections::HashMap;

use anyhow::Result;
use bio::stats::LogProb;

use crate::errors;
use crate::genome::GenomicRegion;
use crate::utils::normalise_log_probs;
use crate::variants::genotype::HaplotypeIndex;
use crate::variants::{Genotype, Haplotype};
use crate::SampleName;

pub mod cnv;
pub mod individual;
pub mod population;
pub mod priors;
pub mod somatic;
pub mod trio;

pub use individual::IndividualModel;
pub use population::PopulationModel;
pub use priors::{CoalescentModel, DeNovoModel, GenotypePriorModel, SomaticMutationModel};
pub use trio::{TrioJointPosterior, TrioModel};

/// A normalised posterior over an explicit genotype list.
#[derive(Debug, Clone)]
pub struct GenotypePosterior {
    pub genotypes: Vec<Genotype<HaplotypeIndex>>,
    pub log_posteriors: Vec<LogProb>,
    pub log_evidence: LogProb,
}

impl GenotypePosterior {
    /// Normalise joint log probabilities into a posterior, failing the
    /// region when the evidence is not finite.
    pub fn from_log_joints(
        genotypes: Vec<Genotype<HaplotypeIndex>>,
        mut log_joints: Vec<LogProb>,
        region: &GenomicRegion,
    ) -> Result<Self> {
        let log_evidence =
            normalise_log_probs(&mut log_joints).ok_or_else(|| errors::Error::NonFinitePosterior {
                region: region.to_string(),
            })?;
        Ok(GenotypePosterior {
            genotypes,
            log_posteriors: log_joints,
            log_evidence,
        })
    }

    pub fn map_genotype(&self) -> Option<(&Genotype<HaplotypeIndex>, LogProb)> {
        self.log_posteriors
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
            .map(|(index, lp)| (&self.genotypes[index], *lp))
    }

    /// Posterior probability that the called genotype contains the allele,
    /// computed as one minus the mass of non-containing genotypes.
    pub fn prob_allele_absent<F>(&self, contains: F) -> LogProb
    where
        F: Fn(&Genotype<HaplotypeIndex>) -> bool,
    {
        let non_containing: Vec<LogProb> = self
            .genotypes
            .iter()
            .zip(&self.log_posteriors)
            .filter(|(genotype, _)| !contains(genotype))
            .map(|(_, lp)| *lp)
            .collect();
        if non_containing.is_empty() {
            LogProb::ln_zero()
        } else {
            let total = LogProb::ln_sum_exp(&non_containing);
            if *total > 0.0 {
                LogProb::ln_one()
            } else {
                total
            }
        }
    }
}

/// What every caller strategy gets back from inference.
pub struct Latents {
    /// Per-sample genotype posteriors over the shared haplotype arena.
    pub genotype_posteriors: HashMap<SampleName, GenotypePosterior>,
    /// Per-haplotype probability of being present in any sample.
    pub haplotype_posteriors: Vec<f64>,
    pub log_evidence: LogProb,
    /// Upper bound on posterior mass lost to genotype-space truncation.
    pub estimated_lost_log_posterior_mass: Option<LogProb>,
    /// Joint trio posterior, present for the trio model only.
    pub trio: Option<TrioJointPosterior>,
    /// Somatic decomposition, present for the cancer model only.
    pub somatic: Option<somatic::SomaticLatents>,
}

impl Latents {
    pub fn single_sample(sample: SampleName, posterior: GenotypePosterior, num_haplotypes: usize) -> Self {
        let haplotype_posteriors =
            marginal_haplotype_posteriors(num_haplotypes, std::iter::once(&posterior));
        let log_evidence = posterior.log_evidence;
        let mut genotype_posteriors = HashMap::new();
        genotype_posteriors.insert(sample, posterior);
        Latents {
            genotype_posteriors,
            haplotype_posteriors,
            log_evidence,
            estimated_lost_log_posterior_mass: None,
            trio: None,
            somatic: None,
        }
    }
}

/// Probability each haplotype occurs in at least one sample's genotype:
/// one minus the product over samples of the non-containing mass.
pub fn marginal_haplotype_posteriors<'a, I>(num_haplotypes: usize, posteriors: I) -> Vec<f64>
where
    I: Iterator<Item = &'a GenotypePosterior>,
{
    let mut prob_not_observed = vec![1.0f64; num_haplotypes];
    for posterior in posteriors {
        for index in 0..num_haplotypes {
            let not_containing: f64 = posterior
                .genotypes
                .iter()
                .zip(&posterior.log_posteriors)
                .filter(|(genotype, _)| !genotype.contains(&(index as HaplotypeIndex)))
                .map(|(_, lp)| lp.exp())
                .sum();
            prob_not_observed[index] *= not_containing.min(1.0);
        }
    }
    prob_not_observed.into_iter().map(|p| 1.0 - p).collect()
}

/// Genotype log-likelihood of one sample's reads: each read marginalises
/// uniformly over the genotype's haplotypes.
pub fn genotype_log_likelihood(
    genotype: &Genotype<HaplotypeIndex>,
    rows: &[&[LogProb]],
) -> LogProb {
    let ploidy = genotype.ploidy();
    if ploidy == 0 || rows.is_empty() {
        return LogProb::ln_one();
    }
    let num_reads = rows[0].len();
    let ln_ploidy = LogProb((ploidy as f64).ln());
    let mut total = LogProb::ln_one();
    for read in 0..num_reads {
        let per_haplotype: Vec<LogProb> = genotype
            .iter()
            .map(|&h| rows[h as usize][read])
            .collect();
        total = total + LogProb(*LogProb::ln_sum_exp(&per_haplotype) - *ln_ploidy);
    }
    total
}

/// Build per-genotype likelihood rows view for a sample.
pub fn sample_rows<'a>(
    likelihoods: &'a crate::likelihood::HaplotypeLikelihoodArray,
    sample: &SampleName,
) -> Vec<&'a [LogProb]> {
    (0..likelihoods.haplotypes().len())
        .map(|index| likelihoods.row(sample, index))
        .collect()
}

/// Posterior probability that `haplotypes[index]` equals the reference.
pub fn reference_haplotype_index(haplotypes: &[Haplotype]) -> Option<usize> {
    haplotypes.iter().position(|h| h.is_reference())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_posterior_normalised() {
        let genotypes = vec![
            Genotype::new(vec![0u32, 0]),
            Genotype::new(vec![0u32, 1]),
            Genotype::new(vec![1u32, 1]),
        ];
        let joints = vec![LogProb(-1.0), LogProb(-2.0), LogProb(-5.0)];
        let region = GenomicRegion::new("chr1", 0, 10);
        let posterior =
            GenotypePosterior::from_log_joints(genotypes, joints, &region).unwrap();
        let total: f64 = posterior.log_posteriors.iter().map(|lp| lp.exp()).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-6);
        assert!(posterior.log_posteriors.iter().all(|lp| **lp <= 0.0));
        assert!(*posterior.log_evidence <= 0.0);
    }

    #[test]
    fn test_non_finite_evidence_is_error() {
        let genotypes = vec![Genotype::new(vec![0u32])];
        let joints = vec![LogProb::ln_zero()];
        let region = GenomicRegion::new("chr1", 0, 10);
        assert!(GenotypePosterior::from_log_joints(genotypes, joints, &region).is_err());
    }

    #[test]
    fn test_prob_allele_absent() {
        let genotypes = vec![Genotype::new(vec![0u32, 0]), Genotype::new(vec![0u32, 1])];
        let joints = vec![LogProb(0.5f64.ln()), LogProb(0.5f64.ln())];
        let region = GenomicRegion::new("chr1", 0, 10);
        let posterior =
            GenotypePosterior::from_log_joints(genotypes, joints, &region).unwrap();
        let absent = posterior.prob_allele_absent(|g| g.contains(&1));
        assert_relative_eq!(absent.exp(), 0.5, epsilon = 1e-6);
    }
}
