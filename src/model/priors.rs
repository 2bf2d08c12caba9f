//! Prior models: genotype priors, the de-novo mutation model, and the
//! somatic mutation model.

use std::collections::HashMap;

use bio::stats::LogProb;

use crate::variants::genotype::HaplotypeIndex;
use crate::variants::{Genotype, Haplotype};

/// Mutation-counting approximation of the coalescent: each distinct
/// non-reference allele carried by a genotype costs one factor of the
/// per-site heterozygosity.
#[derive(Debug, Clone)]
pub struct CoalescentModel {
    snp_heterozygosity: f64,
    indel_heterozygosity: f64,
}

impl Default for CoalescentModel {
    fn default() -> Self {
        CoalescentModel {
            snp_heterozygosity: crate::constants::DEFAULT_SNP_HETEROZYGOSITY,
            indel_heterozygosity: crate::constants::DEFAULT_INDEL_HETEROZYGOSITY,
        }
    }
}

impl CoalescentModel {
    pub fn new(snp_heterozygosity: f64, indel_heterozygosity: f64) -> Self {
        CoalescentModel {
            snp_heterozygosity,
            indel_heterozygosity,
        }
    }

    /// Unnormalised log prior of a haplotype: the product of the mutation
    /// costs of its applied alleles.
    pub fn haplotype_log_prior(&self, haplotype: &Haplotype) -> LogProb {
        let mut prior = 0.0;
        for allele in haplotype.alleles() {
            prior += if allele.is_indel() {
                self.indel_heterozygosity.ln()
            } else {
                self.snp_heterozygosity.ln()
            };
        }
        LogProb(prior)
    }

    /// Unnormalised log prior of a genotype: distinct alleles are paid for
    /// once, shared alleles are free (identity by descent).
    pub fn genotype_log_prior(
        &self,
        genotype: &Genotype<HaplotypeIndex>,
        haplotypes: &[Haplotype],
    ) -> LogProb {
        let mut distinct: Vec<&crate::variants::Allele> = genotype
            .iter()
            .flat_map(|&h| haplotypes[h as usize].alleles().iter())
            .collect();
        distinct.sort();
        distinct.dedup();
        let mut prior = 0.0;
        for allele in distinct {
            prior += if allele.is_indel() {
                self.indel_heterozygosity.ln()
            } else {
                self.snp_heterozygosity.ln()
            };
        }
        LogProb(prior)
    }
}

/// Genotype prior selection shared by all callers.
#[derive(Debug, Clone)]
pub enum GenotypePriorModel {
    Uniform,
    Coalescent(CoalescentModel),
}

impl GenotypePriorModel {
    pub fn log_prior(
        &self,
        genotype: &Genotype<HaplotypeIndex>,
        haplotypes: &[Haplotype],
    ) -> LogProb {
        match self {
            GenotypePriorModel::Uniform => LogProb::ln_one(),
            GenotypePriorModel::Coalescent(model) => {
                model.genotype_log_prior(genotype, haplotypes)
            }
        }
    }
}

/// Probability of a child haplotype arising from a parental haplotype with
/// a per-base de-novo mutation rate.
pub struct DeNovoModel {
    rate: f64,
    cache: HashMap<(HaplotypeIndex, HaplotypeIndex), LogProb>,
}

impl DeNovoModel {
    pub fn new(rate: f64) -> Self {
        DeNovoModel {
            rate,
            cache: HashMap::new(),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// log P(child haplotype | parental haplotype). Identical haplotypes
    /// pay (1 - rate) per base; differing ones pay the rate per divergent
    /// position.
    pub fn log_prob(
        &mut self,
        parent: HaplotypeIndex,
        child: HaplotypeIndex,
        haplotypes: &[Haplotype],
    ) -> LogProb {
        if let Some(&cached) = self.cache.get(&(parent, child)) {
            return cached;
        }
        let parent_hap = &haplotypes[parent as usize];
        let child_hap = &haplotypes[child as usize];
        let length = parent_hap.sequence().len().max(child_hap.sequence().len());
        let divergence = divergent_positions(parent_hap, child_hap);
        let matches = length.saturating_sub(divergence);
        let result = if self.rate <= 0.0 {
            if divergence == 0 {
                LogProb::ln_one()
            } else {
                LogProb::ln_zero()
            }
        } else {
            LogProb(divergence as f64 * self.rate.ln() + matches as f64 * (1.0 - self.rate).ln())
        };
        self.cache.insert((parent, child), result);
        result
    }
}

/// Number of allele-level differences between two haplotypes over the same
/// window.
fn divergent_positions(a: &Haplotype, b: &Haplotype) -> usize {
    let mut only_a = 0;
    for allele in a.alleles() {
        if !b.alleles().contains(allele) {
            only_a += 1;
        }
    }
    let mut only_b = 0;
    for allele in b.alleles() {
        if !a.alleles().contains(allele) {
            only_b += 1;
        }
    }
    only_a + only_b
}

/// Prior on somatic haplotypes given the germline background.
#[derive(Debug, Clone)]
pub struct SomaticMutationModel {
    rate: f64,
}

impl SomaticMutationModel {
    pub fn new(rate: f64) -> Self {
        SomaticMutationModel { rate }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// log prior of `somatic` arising somatically on top of any germline
    /// haplotype of `germline`: the rate per allele not explained by the
    /// closest germline haplotype.
    pub fn log_prob(
        &self,
        germline: &Genotype<HaplotypeIndex>,
        somatic: HaplotypeIndex,
        haplotypes: &[Haplotype],
    ) -> LogProb {
        let somatic_hap = &haplotypes[somatic as usize];
        let min_divergence = germline
            .iter()
            .map(|&g| divergent_positions(&haplotypes[g as usize], somatic_hap))
            .min()
            .unwrap_or_else(|| somatic_hap.num_alleles().max(1));
        if min_divergence == 0 {
            // a somatic haplotype identical to the germline explains nothing
            LogProb::ln_zero()
        } else {
            LogProb(min_divergence as f64 * self.rate.ln())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genome::GenomicRegion;
    use crate::reference::tests::mock_reference;
    use crate::variants::Allele;

    fn arena() -> Vec<Haplotype> {
        let reference = mock_reference("chr1", b"ACGTACGT");
        let region = GenomicRegion::new("chr1", 0, 8);
        let reference_hap = Haplotype::reference(region.clone(), &reference).unwrap();
        let snv = Haplotype::build(
            region.clone(),
            vec![Allele::new(GenomicRegion::new("chr1", 4, 5), b"T".to_vec())],
            &reference,
        )
        .unwrap();
        let indel = Haplotype::build(
            region,
            vec![Allele::new(GenomicRegion::new("chr1", 4, 5), Vec::new())],
            &reference,
        )
        .unwrap();
        vec![reference_hap, snv, indel]
    }

    #[test]
    fn test_coalescent_favours_reference() {
        let haplotypes = arena();
        let model = CoalescentModel::default();
        let hom_ref = Genotype::new(vec![0u32, 0]);
        let het_snv = Genotype::new(vec![0u32, 1]);
        let het_indel = Genotype::new(vec![0u32, 2]);
        let ref_prior = model.genotype_log_prior(&hom_ref, &haplotypes);
        let snv_prior = model.genotype_log_prior(&het_snv, &haplotypes);
        let indel_prior = model.genotype_log_prior(&het_indel, &haplotypes);
        assert!(ref_prior > snv_prior);
        assert!(snv_prior > indel_prior);
    }

    #[test]
    fn test_shared_allele_paid_once() {
        let haplotypes = arena();
        let model = CoalescentModel::default();
        let hom_snv = Genotype::new(vec![1u32, 1]);
        let het_snv = Genotype::new(vec![0u32, 1]);
        assert_relative_eq!(
            *model.genotype_log_prior(&hom_snv, &haplotypes),
            *model.genotype_log_prior(&het_snv, &haplotypes)
        );
    }

    #[test]
    fn test_denovo_zero_rate_is_mendelian_indicator() {
        let haplotypes = arena();
        let mut model = DeNovoModel::new(0.0);
        assert_eq!(model.log_prob(0, 0, &haplotypes), LogProb::ln_one());
        assert_eq!(model.log_prob(0, 1, &haplotypes), LogProb::ln_zero());
    }

    #[test]
    fn test_denovo_rate_scales_with_divergence() {
        let haplotypes = arena();
        let mut model = DeNovoModel::new(1e-8);
        let same = model.log_prob(1, 1, &haplotypes);
        let one_step = model.log_prob(0, 1, &haplotypes);
        let two_step = model.log_prob(2, 1, &haplotypes);
        assert!(same > one_step);
        assert!(one_step > two_step);
    }

    #[test]
    fn test_somatic_prior_rejects_germline_duplicates() {
        let haplotypes = arena();
        let model = SomaticMutationModel::new(1e-4);
        let germline = Genotype::new(vec![0u32, 1]);
        assert_eq!(
            model.log_prob(&germline, 1, &haplotypes),
            LogProb::ln_zero()
        );
        assert!(*model.log_prob(&germline, 2, &haplotypes) < 0.0);
    }
}
