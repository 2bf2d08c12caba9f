//! Single-sample genotype model.

use anyhow::Result;
use bio::stats::LogProb;

use crate::genome::GenomicRegion;
use crate::likelihood::HaplotypeLikelihoodArray;
use crate::model::priors::GenotypePriorModel;
use crate::model::{genotype_log_likelihood, sample_rows, GenotypePosterior};
use crate::variants::genotype::{generate_all_genotypes, HaplotypeIndex};
use crate::variants::{Genotype, Haplotype};
use crate::SampleName;

pub struct IndividualModel {
    prior: GenotypePriorModel,
    ploidy: usize,
    max_genotypes: usize,
}

impl IndividualModel {
    pub fn new(prior: GenotypePriorModel, ploidy: usize, max_genotypes: usize) -> Self {
        IndividualModel {
            prior,
            ploidy,
            max_genotypes,
        }
    }

    /// Posterior over all ploidy-k genotypes of the active haplotypes.
    /// Reports whether the genotype space had to be truncated.
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
        let log_joints: Vec<LogProb> = genotypes
            .iter()
            .map(|genotype| {
                self.prior.log_prior(genotype, haplotypes)
                    + genotype_log_likelihood(genotype, &rows)
            })
            .collect();
        let posterior = GenotypePosterior::from_log_joints(genotypes, log_joints, region)?;
        Ok((posterior, truncated))
    }

    /// Evaluate an explicit genotype set instead of the full enumeration.
    pub fn infer_over(
        &self,
        genotypes: Vec<Genotype<HaplotypeIndex>>,
        haplotypes: &[Haplotype],
        likelihoods: &HaplotypeLikelihoodArray,
        sample: &SampleName,
        region: &GenomicRegion,
    ) -> Result<GenotypePosterior> {
        let rows = sample_rows(likelihoods, sample);
        let log_joints: Vec<LogProb> = genotypes
            .iter()
            .map(|genotype| {
                self.prior.log_prior(genotype, haplotypes)
                    + genotype_log_likelihood(genotype, &rows)
            })
            .collect();
        GenotypePosterior::from_log_joints(genotypes, log_joints, region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::likelihood::tests_support::populated_array;
    use crate::model::priors::CoalescentModel;

    fn region() -> GenomicRegion {
        GenomicRegion::new("chr1", 0, 8)
    }

    #[test]
    fn test_homozygous_reference_wins_on_reference_reads() {
        let (haplotypes, array) = populated_array();
        let model = IndividualModel::new(
            GenotypePriorModel::Coalescent(CoalescentModel::default()),
            2,
            1000,
        );
        let (posterior, truncated) = model
            .infer(&haplotypes, &array, &"s1".to_owned(), &region())
            .unwrap();
        assert!(!truncated);
        let (map, _) = posterior.map_genotype().unwrap();
        assert_eq!(*map, Genotype::new(vec![0u32, 0]));
    }

    #[test]
    fn test_posterior_sums_to_one() {
        let (haplotypes, array) = populated_array();
        let model = IndividualModel::new(GenotypePriorModel::Uniform, 2, 1000);
        let (posterior, _) = model
            .infer(&haplotypes, &array, &"s1".to_owned(), &region())
            .unwrap();
        let total: f64 = posterior.log_posteriors.iter().map(|lp| lp.exp()).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_perfectly_explained_read_keeps_evidence_monotone() {
        // with a single haplotype at ploidy one, a read that the haplotype
        // explains perfectly contributes a unit factor to the evidence
        use crate::likelihood::HaplotypeLikelihoodArray;
        use crate::reads::pipe::ReadMap;
        use crate::reads::tests::mock_read;
        use crate::reference::tests::mock_reference;

        let reference = mock_reference("chr1", b"ACGTACGT");
        let hap_region = GenomicRegion::new("chr1", 0, 8);
        let haplotypes =
            vec![crate::variants::Haplotype::reference(hap_region.clone(), &reference).unwrap()];
        let model = IndividualModel::new(GenotypePriorModel::Uniform, 1, 1000);
        let sample = "s1".to_owned();

        let mut with_reads = ReadMap::new();
        with_reads.insert(sample.clone(), vec![mock_read("chr1", 0, b"ACGTACGT", 60)]);
        let mut array = HaplotypeLikelihoodArray::new(vec![sample.clone()]);
        array.populate(&with_reads, &haplotypes, None);
        let (with_read, _) = model
            .infer(&haplotypes, &array, &sample, &hap_region)
            .unwrap();

        let empty = ReadMap::new();
        let mut empty_array = HaplotypeLikelihoodArray::new(vec![sample.clone()]);
        empty_array.populate(&empty, &haplotypes, None);
        let (without_read, _) = model
            .infer(&haplotypes, &empty_array, &sample, &hap_region)
            .unwrap();

        // the explained read cannot decrease the evidence by more than its
        // own (near-unit) likelihood
        assert!(*with_read.log_evidence >= *without_read.log_evidence - 0.1);
    }
}
