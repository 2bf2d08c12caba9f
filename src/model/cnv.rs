//! Copy-number-aware germline model.
//!
//! Each germline genotype is evaluated under a small set of per-haplotype
//! copy-number configurations; configurations far from the euploid state
//! pay a prior penalty. The model's evidence is compared against the plain
//! germline and somatic models by the cancer caller.

use anyhow::Result;
use bio::stats::LogProb;

use crate::genome::GenomicRegion;
use crate::likelihood::HaplotypeLikelihoodArray;
use crate::model::priors::GenotypePriorModel;
use crate::model::{sample_rows, GenotypePosterior};
use crate::variants::genotype::generate_all_genotypes;
use crate::variants::Haplotype;
use crate::SampleName;

/// Penalty (nats) per copy deviating from one copy per haplotype.
const COPY_DEVIATION_PENALTY: f64 = 3.0;

pub struct CnvModel {
    prior: GenotypePriorModel,
    ploidy: usize,
    max_genotypes: usize,
}

impl CnvModel {
    pub fn new(prior: GenotypePriorModel, ploidy: usize, max_genotypes: usize) -> Self {
        CnvModel {
            prior,
            ploidy,
            max_genotypes,
        }
    }

    pub fn infer(
        &self,
        haplotypes: &[Haplotype],
        likelihoods: &HaplotypeLikelihoodArray,
        sample: &SampleName,
        region: &GenomicRegion,
    ) -> Result<(GenotypePosterior, bool)> {
        let (genotypes, truncated) =
            generate_all_genotypes(haplotypes.len(), self.ploidy, self.max_genotypes);
        let rows = sample_rows(likelihoods, sample);
        let configurations = copy_configurations(self.ploidy);
        let log_joints: Vec<LogProb> = genotypes
            .iter()
            .map(|genotype| {
                let per_config: Vec<LogProb> = configurations
                    .iter()
                    .map(|config| {
                        let penalty: f64 = config
                            .iter()
                            .map(|&c| (c as f64 - 1.0).abs() * COPY_DEVIATION_PENALTY)
                            .sum();
                        let total: usize = config.iter().sum();
                        let mut likelihood = LogProb::ln_one();
                        let num_reads = rows.first().map_or(0, |row| row.len());
                        for read in 0..num_reads {
                            let terms: Vec<LogProb> = genotype
                                .iter()
                                .zip(config.iter())
                                .filter(|(_, &c)| c > 0)
                                .map(|(&h, &c)| {
                                    LogProb((c as f64 / total as f64).ln())
                                        + rows[h as usize][read]
                                })
                                .collect();
                            likelihood = likelihood + LogProb::ln_sum_exp(&terms);
                        }
                        LogProb(-penalty) + likelihood
                    })
                    .collect();
                self.prior.log_prior(genotype, haplotypes)
                    + LogProb::ln_sum_exp(&per_config)
            })
            .collect();
        let posterior = GenotypePosterior::from_log_joints(genotypes, log_joints, region)?;
        Ok((posterior, truncated))
    }
}

/// Copy-number states per genotype slot; always includes the euploid state.
fn copy_configurations(ploidy: usize) -> Vec<Vec<usize>> {
    match ploidy {
        0 => vec![Vec::new()],
        1 => vec![vec![1], vec![2]],
        2 => vec![
            vec![1, 1],
            vec![2, 1],
            vec![1, 2],
            vec![0, 1],
            vec![1, 0],
            vec![0, 2],
            vec![2, 0],
        ],
        _ => {
            // higher ploidies only consider single-slot gains and losses
            let mut result = vec![vec![1; ploidy]];
            for slot in 0..ploidy {
                let mut gain = vec![1; ploidy];
                gain[slot] = 2;
                result.push(gain);
                let mut loss = vec![1; ploidy];
                loss[slot] = 0;
                result.push(loss);
            }
            result
        }
    }
}
