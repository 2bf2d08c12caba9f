//! Germline-plus-somatic mixture model with a cancer-cell-fraction grid.

use anyhow::Result;
use bio::stats::LogProb;

use crate::errors;
use crate::genome::GenomicRegion;
use crate::likelihood::HaplotypeLikelihoodArray;
use crate::model::priors::{GenotypePriorModel, SomaticMutationModel};
use crate::model::sample_rows;
use crate::utils::normalise_log_probs;
use crate::variants::genotype::{generate_all_genotypes, HaplotypeIndex};
use crate::variants::{CancerGenotype, Haplotype};
use crate::SampleName;

/// Cancer-cell-fraction grid marginalised over during inference.
const FRACTIONS: [f64; 8] = [0.05, 0.1, 0.2, 0.3, 0.4, 0.5, 0.7, 0.9];

#[derive(Debug, Clone)]
pub struct SomaticLatents {
    pub genotypes: Vec<CancerGenotype>,
    pub log_posteriors: Vec<LogProb>,
    pub log_evidence: LogProb,
    /// MAP cancer cell fraction of the MAP cancer genotype.
    pub map_fraction: f64,
}

impl SomaticLatents {
    pub fn map_genotype(&self) -> Option<(&CancerGenotype, LogProb)> {
        self.log_posteriors
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
            .map(|(index, lp)| (&self.genotypes[index], *lp))
    }

    /// Mass of cancer genotypes failing the somatic predicate; the
    /// complement is the somatic confidence.
    pub fn prob_not_somatic<F>(&self, is_somatic: F) -> LogProb
    where
        F: Fn(&CancerGenotype) -> bool,
    {
        let not_somatic: Vec<LogProb> = self
            .genotypes
            .iter()
            .zip(&self.log_posteriors)
            .filter(|(genotype, _)| !is_somatic(genotype))
            .map(|(_, lp)| *lp)
            .collect();
        if not_somatic.is_empty() {
            LogProb::ln_zero()
        } else {
            let total = LogProb::ln_sum_exp(&not_somatic);
            if *total > 0.0 {
                LogProb::ln_one()
            } else {
                total
            }
        }
    }
}

pub struct SomaticModel {
    germline_prior: GenotypePriorModel,
    somatic_prior: SomaticMutationModel,
    ploidy: usize,
    max_genotypes: usize,
}

impl SomaticModel {
    pub fn new(
        germline_prior: GenotypePriorModel,
        somatic_prior: SomaticMutationModel,
        ploidy: usize,
        max_genotypes: usize,
    ) -> Self {
        SomaticModel {
            germline_prior,
            somatic_prior,
            ploidy,
            max_genotypes,
        }
    }

    /// Posterior over cancer genotypes for the tumour sample. The normal
    /// sample, when present, constrains the germline part through its own
    /// read likelihoods.
    pub fn infer(
        &self,
        haplotypes: &[Haplotype],
        likelihoods: &HaplotypeLikelihoodArray,
        tumour: &SampleName,
        normal: Option<&SampleName>,
        region: &GenomicRegion,
    ) -> Result<SomaticLatents> {
        let (germline_genotypes, _) =
            generate_all_genotypes(haplotypes.len(), self.ploidy, self.max_genotypes);
        let tumour_rows = sample_rows(likelihoods, tumour);
        let normal_rows = normal.map(|sample| sample_rows(likelihoods, sample));
        let num_tumour_reads = tumour_rows.first().map_or(0, |row| row.len());

        let mut genotypes = Vec::new();
        let mut log_joints = Vec::new();
        let mut best: Option<(usize, LogProb, f64)> = None;
        for germline in &germline_genotypes {
            for somatic in 0..haplotypes.len() as HaplotypeIndex {
                if germline.contains(&somatic) {
                    continue;
                }
                let somatic_prior =
                    self.somatic_prior.log_prob(germline, somatic, haplotypes);
                if *somatic_prior == f64::NEG_INFINITY {
                    continue;
                }
                if genotypes.len() >= self.max_genotypes {
                    break;
                }
                let germline_prior = self.germline_prior.log_prior(germline, haplotypes);
                let normal_likelihood = normal_rows
                    .as_ref()
                    .map(|rows| crate::model::genotype_log_likelihood(germline, rows))
                    .unwrap_or_else(LogProb::ln_one);
                // marginalise the cancer cell fraction over the grid
                let per_fraction: Vec<LogProb> = FRACTIONS
                    .iter()
                    .map(|&fraction| {
                        self.tumour_likelihood(
                            germline,
                            somatic,
                            fraction,
                            &tumour_rows,
                            num_tumour_reads,
                        )
                    })
                    .collect();
                let marginal = LogProb(
                    *LogProb::ln_sum_exp(&per_fraction) - (FRACTIONS.len() as f64).ln(),
                );
                let log_joint = germline_prior + somatic_prior + normal_likelihood + marginal;
                let genotype = CancerGenotype::new(germline.clone(), crate::variants::Genotype::new(vec![somatic]));
                // track the MAP fraction alongside the MAP genotype
                let (best_fraction_index, _) = per_fraction
                    .iter()
                    .enumerate()
                    .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
                    .expect("fraction grid is non-empty");
                match best {
                    Some((_, best_joint, _)) if log_joint <= best_joint => {}
                    _ => {
                        best = Some((
                            genotypes.len(),
                            log_joint,
                            FRACTIONS[best_fraction_index],
                        ))
                    }
                }
                genotypes.push(genotype);
                log_joints.push(log_joint);
            }
        }
        if genotypes.is_empty() {
            return Err(errors::Error::NonFinitePosterior {
                region: region.to_string(),
            }
            .into());
        }
        let log_evidence =
            normalise_log_probs(&mut log_joints).ok_or_else(|| errors::Error::NonFinitePosterior {
                region: region.to_string(),
            })?;
        Ok(SomaticLatents {
            genotypes,
            log_posteriors: log_joints,
            log_evidence,
            map_fraction: best.map_or(FRACTIONS[0], |(_, _, fraction)| fraction),
        })
    }

    fn tumour_likelihood(
        &self,
        germline: &crate::variants::Genotype<HaplotypeIndex>,
        somatic: HaplotypeIndex,
        fraction: f64,
        rows: &[&[LogProb]],
        num_reads: usize,
    ) -> LogProb {
        let ploidy = germline.ploidy().max(1);
        let germline_weight = LogProb(((1.0 - fraction) / ploidy as f64).ln());
        let somatic_weight = LogProb(fraction.ln());
        let mut total = LogProb::ln_one();
        for read in 0..num_reads {
            let mut terms: Vec<LogProb> = germline
                .iter()
                .map(|&h| germline_weight + rows[h as usize][read])
                .collect();
            terms.push(somatic_weight + rows[somatic as usize][read]);
            total = total + LogProb::ln_sum_exp(&terms);
        }
        total
    }
}

/// Posterior weight of each of the three explanation models given their
/// log evidences and prior weights.
#[derive(Debug, Clone, Copy)]
pub struct ModelPosteriors {
    pub germline: f64,
    pub cnv: f64,
    pub somatic: f64,
}

pub fn model_posteriors(
    germline_log_evidence: LogProb,
    cnv_log_evidence: LogProb,
    somatic_log_evidence: LogProb,
    somatic_rate: f64,
) -> ModelPosteriors {
    // the somatic model prior scales with the somatic mutation rate; CNV
    // events are rarer than diploid germline states
    let somatic_prior = (somatic_rate * 100.0).clamp(1e-10, 0.5);
    let cnv_prior = (1.0 - somatic_prior) * 0.01;
    let germline_prior = 1.0 - somatic_prior - cnv_prior;
    let joints = [
        LogProb(germline_prior.ln()) + germline_log_evidence,
        LogProb(cnv_prior.ln()) + cnv_log_evidence,
        LogProb(somatic_prior.ln()) + somatic_log_evidence,
    ];
    let norm = LogProb::ln_sum_exp(&joints);
    ModelPosteriors {
        germline: (joints[0] - norm).exp(),
        cnv: (joints[1] - norm).exp(),
        somatic: (joints[2] - norm).exp(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::likelihood::HaplotypeLikelihoodArray;
    use crate::reads::pipe::ReadMap;
    use crate::reads::tests::mock_read;
    use crate::reference::tests::mock_reference;
    use crate::variants::{Allele, Genotype, Haplotype};

    fn fixture(num_alt: usize, num_ref: usize) -> (Vec<Haplotype>, HaplotypeLikelihoodArray) {
        let reference = mock_reference("chr1", b"ACGTACGT");
        let region = GenomicRegion::new("chr1", 0, 8);
        let reference_hap = Haplotype::reference(region.clone(), &reference).unwrap();
        let alt = Haplotype::build(
            region,
            vec![Allele::new(GenomicRegion::new("chr1", 4, 5), b"T".to_vec())],
            &reference,
        )
        .unwrap();
        let haplotypes = vec![reference_hap, alt];
        let mut reads = ReadMap::new();
        let mut tumour_reads = Vec::new();
        for i in 0..num_ref {
            let mut read = mock_read("chr1", 0, b"ACGTACGT", 30);
            read.name_mut().extend_from_slice(format!("r{}", i).as_bytes());
            tumour_reads.push(read);
        }
        for i in 0..num_alt {
            let mut read = mock_read("chr1", 0, b"ACGTTCGT", 30);
            read.name_mut().extend_from_slice(format!("a{}", i).as_bytes());
            tumour_reads.push(read);
        }
        tumour_reads.sort();
        reads.insert("tumour".to_owned(), tumour_reads);
        let mut normal_reads = Vec::new();
        for i in 0..20 {
            let mut read = mock_read("chr1", 0, b"ACGTACGT", 30);
            read.name_mut().extend_from_slice(format!("n{}", i).as_bytes());
            normal_reads.push(read);
        }
        normal_reads.sort();
        reads.insert("normal".to_owned(), normal_reads);
        let mut array =
            HaplotypeLikelihoodArray::new(vec!["tumour".to_owned(), "normal".to_owned()]);
        array.populate(&reads, &haplotypes, None);
        (haplotypes, array)
    }

    #[test]
    fn test_somatic_posterior_normalised() {
        let (haplotypes, array) = fixture(5, 15);
        let model = SomaticModel::new(
            GenotypePriorModel::Uniform,
            SomaticMutationModel::new(1e-4),
            2,
            1000,
        );
        let latents = model
            .infer(
                &haplotypes,
                &array,
                &"tumour".to_owned(),
                Some(&"normal".to_owned()),
                &GenomicRegion::new("chr1", 0, 8),
            )
            .unwrap();
        let total: f64 = latents.log_posteriors.iter().map(|lp| lp.exp()).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_map_is_reference_germline_plus_somatic_alt() {
        let (haplotypes, array) = fixture(5, 15);
        let model = SomaticModel::new(
            GenotypePriorModel::Uniform,
            SomaticMutationModel::new(1e-4),
            2,
            1000,
        );
        let latents = model
            .infer(
                &haplotypes,
                &array,
                &"tumour".to_owned(),
                Some(&"normal".to_owned()),
                &GenomicRegion::new("chr1", 0, 8),
            )
            .unwrap();
        let (map, _) = latents.map_genotype().unwrap();
        assert_eq!(map.germline, Genotype::new(vec![0u32, 0]));
        assert!(map.somatic.contains(&1));
        // subclonal fraction: well below a germline het
        assert!(latents.map_fraction <= 0.5);
    }

    #[test]
    fn test_model_posteriors_sum_to_one() {
        let posteriors = model_posteriors(
            LogProb(-10.0),
            LogProb(-12.0),
            LogProb(-8.0),
            1e-4,
        );
        assert_relative_eq!(
            posteriors.germline + posteriors.cnv + posteriors.somatic,
            1.0,
            epsilon = 1e-9
        );
    }
}
