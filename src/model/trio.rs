//! Joint trio model with Mendelian inheritance and a de-novo mutation rate.

use std::collections::HashMap;

use anyhow::Result;
use bio::stats::LogProb;
use itertools::Itertools;

use crate::errors;
use crate::genome::GenomicRegion;
use crate::likelihood::HaplotypeLikelihoodArray;
use crate::model::priors::{DeNovoModel, GenotypePriorModel};
use crate::model::{
    genotype_log_likelihood, marginal_haplotype_posteriors, sample_rows, GenotypePosterior,
    Latents,
};
use crate::variants::genotype::{generate_all_genotypes, HaplotypeIndex};
use crate::variants::{Allele, Genotype, Haplotype};
use crate::SampleName;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrioPloidies {
    pub maternal: usize,
    pub paternal: usize,
    pub child: usize,
}

impl TrioPloidies {
    pub fn validate(&self) -> Result<()> {
        let max = crate::constants::MAX_TRIO_PLOIDY;
        if self.maternal == 0 && self.paternal == 0 && self.child == 0 {
            return Err(errors::Error::AllPloidiesZero.into());
        }
        if self.child == 0 && self.maternal > 0 && self.paternal > 0 {
            return Err(errors::Error::ChildPloidyZero.into());
        }
        for ploidy in [self.maternal, self.paternal, self.child] {
            if ploidy > max {
                return Err(errors::Error::BadPloidy { ploidy, max }.into());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct JointProbability {
    pub maternal: Genotype<HaplotypeIndex>,
    pub paternal: Genotype<HaplotypeIndex>,
    pub child: Genotype<HaplotypeIndex>,
    pub probability: f64,
    pub log_probability: LogProb,
}

#[derive(Debug, Clone)]
pub struct TrioJointPosterior {
    pub joint: Vec<JointProbability>,
    pub log_evidence: LogProb,
    pub estimated_lost_log_posterior_mass: Option<LogProb>,
}

/// Which parent a child haplotype is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrawSource {
    Mother,
    Father,
    Either,
}

pub struct TrioModel {
    germline_prior: GenotypePriorModel,
    denovo: DeNovoModel,
    ploidies: TrioPloidies,
    max_genotype_combinations: usize,
}

impl TrioModel {
    pub fn new(
        germline_prior: GenotypePriorModel,
        denovo: DeNovoModel,
        ploidies: TrioPloidies,
        max_genotype_combinations: usize,
    ) -> Self {
        TrioModel {
            germline_prior,
            denovo,
            ploidies,
            max_genotype_combinations,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn infer(
        &mut self,
        haplotypes: &[Haplotype],
        likelihoods: &HaplotypeLikelihoodArray,
        mother: &SampleName,
        father: &SampleName,
        child: &SampleName,
        region: &GenomicRegion,
    ) -> Result<Latents> {
        self.ploidies.validate()?;
        let n = haplotypes.len();
        let per_sample_cap = (self.max_genotype_combinations as f64).cbrt().ceil() as usize;
        let per_sample_cap = per_sample_cap.max(4);

        let maternal_rows = sample_rows(likelihoods, mother);
        let paternal_rows = sample_rows(likelihoods, father);
        let child_rows = sample_rows(likelihoods, child);

        let (maternal, lost_m) = pruned_genotypes(n, self.ploidies.maternal, per_sample_cap, &maternal_rows);
        let (paternal, lost_p) = pruned_genotypes(n, self.ploidies.paternal, per_sample_cap, &paternal_rows);
        let (child_genotypes, lost_c) = pruned_genotypes(n, self.ploidies.child, per_sample_cap, &child_rows);
        let truncated = lost_m.is_some() || lost_p.is_some() || lost_c.is_some();

        let draws = self.draw_sources();
        // per-child-haplotype transmission probabilities, cached per parent
        // genotype
        let mut joint = Vec::new();
        let mut log_joints = Vec::new();
        for gm in &maternal {
            let prior_m = self.germline_prior.log_prior(gm, haplotypes);
            let lh_m = genotype_log_likelihood(gm, &maternal_rows);
            let mother_draw = self.transmission_table(gm, n, haplotypes);
            for gp in &paternal {
                let prior_p = self.germline_prior.log_prior(gp, haplotypes);
                let lh_p = genotype_log_likelihood(gp, &paternal_rows);
                let father_draw = self.transmission_table(gp, n, haplotypes);
                for gc in &child_genotypes {
                    let inheritance = inheritance_log_prob(
                        gc,
                        &draws,
                        &mother_draw,
                        &father_draw,
                    );
                    if *inheritance == f64::NEG_INFINITY {
                        continue;
                    }
                    let lh_c = genotype_log_likelihood(gc, &child_rows);
                    let log_joint = prior_m + prior_p + inheritance + lh_m + lh_p + lh_c;
                    joint.push((gm.clone(), gp.clone(), gc.clone()));
                    log_joints.push(log_joint);
                }
            }
        }
        let log_evidence = crate::utils::normalise_log_probs(&mut log_joints).ok_or_else(|| {
            errors::Error::NonFinitePosterior {
                region: region.to_string(),
            }
        })?;
        let joint: Vec<JointProbability> = joint
            .into_iter()
            .zip(&log_joints)
            .map(|((gm, gp, gc), lp)| JointProbability {
                maternal: gm,
                paternal: gp,
                child: gc,
                probability: lp.exp(),
                log_probability: *lp,
            })
            .collect();

        let estimated_lost_log_posterior_mass = if truncated {
            let lost = [lost_m, lost_p, lost_c]
                .into_iter()
                .flatten()
                .fold(LogProb::ln_zero(), |acc, lp| acc.ln_add_exp(lp));
            Some(if *lost > 0.0 { LogProb::ln_one() } else { lost })
        } else {
            None
        };

        // marginalise per sample, in linear space like the posteriors
        let mut genotype_posteriors = HashMap::new();
        genotype_posteriors.insert(
            mother.clone(),
            marginalise(&joint, log_evidence, region, |jp| &jp.maternal)?,
        );
        genotype_posteriors.insert(
            father.clone(),
            marginalise(&joint, log_evidence, region, |jp| &jp.paternal)?,
        );
        genotype_posteriors.insert(
            child.clone(),
            marginalise(&joint, log_evidence, region, |jp| &jp.child)?,
        );
        let haplotype_posteriors =
            marginal_haplotype_posteriors(n, genotype_posteriors.values());
        Ok(Latents {
            genotype_posteriors,
            haplotype_posteriors,
            log_evidence,
            estimated_lost_log_posterior_mass,
            trio: Some(TrioJointPosterior {
                joint,
                log_evidence,
                estimated_lost_log_posterior_mass,
            }),
            somatic: None,
        })
    }

    /// Where each of the child's haplotype draws comes from.
    fn draw_sources(&self) -> Vec<DrawSource> {
        let TrioPloidies {
            maternal,
            paternal,
            child,
        } = self.ploidies;
        if child == 0 {
            return Vec::new();
        }
        if maternal == 0 {
            return vec![DrawSource::Father; child];
        }
        if paternal == 0 {
            return vec![DrawSource::Mother; child];
        }
        match child {
            1 => vec![DrawSource::Either],
            2 => vec![DrawSource::Mother, DrawSource::Father],
            _ => {
                let mut draws = vec![DrawSource::Mother, DrawSource::Father];
                draws.resize(child, DrawSource::Either);
                draws
            }
        }
    }

    /// P(transmitted haplotype = x | parent genotype), for every x in the
    /// arena: a uniform pick from the parent's haplotypes followed by the
    /// de-novo mutation channel.
    fn transmission_table(
        &mut self,
        parent: &Genotype<HaplotypeIndex>,
        num_haplotypes: usize,
        haplotypes: &[Haplotype],
    ) -> Vec<LogProb> {
        let ploidy = parent.ploidy();
        if ploidy == 0 {
            return vec![LogProb::ln_zero(); num_haplotypes];
        }
        let ln_ploidy = LogProb((ploidy as f64).ln());
        (0..num_haplotypes as HaplotypeIndex)
            .map(|target| {
                let terms: Vec<LogProb> = parent
                    .iter()
                    .map(|&origin| self.denovo.log_prob(origin, target, haplotypes))
                    .collect();
                LogProb(*LogProb::ln_sum_exp(&terms) - *ln_ploidy)
            })
            .collect()
    }
}

/// P(child genotype | draw sources): sum over orderings of the unordered
/// child multiset, divided by the multiplicity factor.
fn inheritance_log_prob(
    child: &Genotype<HaplotypeIndex>,
    draws: &[DrawSource],
    mother_draw: &[LogProb],
    father_draw: &[LogProb],
) -> LogProb {
    if child.ploidy() != draws.len() {
        return LogProb::ln_zero();
    }
    if draws.is_empty() {
        // zero-ploidy child collapses to the empty genotype
        return if child.is_empty() {
            LogProb::ln_one()
        } else {
            LogProb::ln_zero()
        };
    }
    let draw_prob = |source: DrawSource, target: HaplotypeIndex| -> LogProb {
        match source {
            DrawSource::Mother => mother_draw[target as usize],
            DrawSource::Father => father_draw[target as usize],
            DrawSource::Either => LogProb(
                *(mother_draw[target as usize].ln_add_exp(father_draw[target as usize]))
                    - 2f64.ln(),
            ),
        }
    };
    let elements: Vec<HaplotypeIndex> = child.iter().copied().collect();
    let k = elements.len();
    let mut terms = Vec::new();
    for permutation in elements.iter().permutations(k) {
        let mut term = LogProb::ln_one();
        for (draw, &&target) in draws.iter().zip(permutation.iter()) {
            term = term + draw_prob(*draw, target);
        }
        terms.push(term);
    }
    // all k! orderings were summed; identical orderings of repeated
    // haplotypes are overcounted by the product of multiplicities' factorials
    let mut multiplicity_factor = 1.0f64;
    let mut counts: HashMap<HaplotypeIndex, usize> = HashMap::new();
    for &e in &elements {
        *counts.entry(e).or_insert(0) += 1;
    }
    for count in counts.values() {
        multiplicity_factor *= factorial(*count);
    }
    LogProb(*LogProb::ln_sum_exp(&terms) - multiplicity_factor.ln())
}

fn factorial(n: usize) -> f64 {
    (1..=n).map(|i| i as f64).product::<f64>().max(1.0)
}

/// Per-sample pruned genotype list with the log posterior mass discarded by
/// pruning (under a uniform prior), if any.
fn pruned_genotypes(
    num_haplotypes: usize,
    ploidy: usize,
    cap: usize,
    rows: &[&[LogProb]],
) -> (Vec<Genotype<HaplotypeIndex>>, Option<LogProb>) {
    let (genotypes, _) = generate_all_genotypes(num_haplotypes, ploidy, usize::MAX);
    if genotypes.len() <= cap {
        return (genotypes, None);
    }
    let mut log_likelihoods: Vec<LogProb> = genotypes
        .iter()
        .map(|genotype| genotype_log_likelihood(genotype, rows))
        .collect();
    let mut order: Vec<usize> = (0..genotypes.len()).collect();
    order.sort_by(|&a, &b| log_likelihoods[b].partial_cmp(&log_likelihoods[a]).unwrap());
    let lost = if crate::utils::normalise_log_probs(&mut log_likelihoods).is_some() {
        let dropped: Vec<LogProb> = order
            .iter()
            .skip(cap)
            .map(|&index| log_likelihoods[index])
            .collect();
        Some(LogProb::ln_sum_exp(&dropped))
    } else {
        None
    };
    let kept: Vec<Genotype<HaplotypeIndex>> = order
        .into_iter()
        .take(cap)
        .map(|index| genotypes[index].clone())
        .collect();
    (kept, lost)
}

fn marginalise<F>(
    joint: &[JointProbability],
    log_evidence: LogProb,
    region: &GenomicRegion,
    who: F,
) -> Result<GenotypePosterior>
where
    F: Fn(&JointProbability) -> &Genotype<HaplotypeIndex>,
{
    let mut accumulated: HashMap<&Genotype<HaplotypeIndex>, f64> = HashMap::new();
    for jp in joint {
        *accumulated.entry(who(jp)).or_insert(0.0) += jp.probability;
    }
    let mut genotypes = Vec::with_capacity(accumulated.len());
    let mut log_posteriors = Vec::with_capacity(accumulated.len());
    for (genotype, probability) in accumulated {
        genotypes.push(genotype.clone());
        log_posteriors.push(LogProb(probability.max(f64::MIN_POSITIVE).ln().min(0.0)));
    }
    let _ = region;
    Ok(GenotypePosterior {
        genotypes,
        log_posteriors,
        log_evidence,
    })
}

/// Occurrence-count predicate for de-novo classification.
pub fn is_denovo(
    allele: &Allele,
    maternal: &Genotype<HaplotypeIndex>,
    paternal: &Genotype<HaplotypeIndex>,
    child: &Genotype<HaplotypeIndex>,
    haplotypes: &[Haplotype],
) -> bool {
    let count = |genotype: &Genotype<HaplotypeIndex>| -> usize {
        genotype
            .iter()
            .filter(|&&h| contains_helper(&haplotypes[h as usize], allele))
            .count()
    };
    let child_occurrences = count(child);
    match child_occurrences {
        0 => false,
        1 => count(maternal) == 0 && count(paternal) == 0,
        2 => !(count(maternal) > 0 && count(paternal) > 0),
        _ => {
            let maternal_occurrences = count(maternal);
            let paternal_occurrences = count(paternal);
            !(maternal_occurrences > 0
                && paternal_occurrences > 0
                && maternal_occurrences + paternal_occurrences >= child_occurrences)
        }
    }
}

/// Indel alleles are matched with boundary-ambiguity tolerance.
pub fn contains_helper(haplotype: &Haplotype, allele: &Allele) -> bool {
    if allele.is_indel() {
        haplotype.includes(allele)
    } else {
        haplotype.contains(allele)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::likelihood::HaplotypeLikelihoodArray;
    use crate::reads::pipe::ReadMap;
    use crate::reads::tests::mock_read;
    use crate::reference::tests::mock_reference;

    fn diploid() -> TrioPloidies {
        TrioPloidies {
            maternal: 2,
            paternal: 2,
            child: 2,
        }
    }

    fn fixture(child_reads_alt: usize) -> (Vec<Haplotype>, HaplotypeLikelihoodArray) {
        let reference = mock_reference("chr1", b"ACGTACGT");
        let region = GenomicRegion::new("chr1", 0, 8);
        let reference_hap = Haplotype::reference(region.clone(), &reference).unwrap();
        let alt = Haplotype::build(
            region,
            vec![Allele::new(
                GenomicRegion::new("chr1", 4, 5),
                b"T".to_vec(),
            )],
            &reference,
        )
        .unwrap();
        let haplotypes = vec![reference_hap, alt];
        let mut reads = ReadMap::new();
        let make_reads = |n_ref: usize, n_alt: usize| {
            let mut result = Vec::new();
            for i in 0..n_ref {
                let mut read = mock_read("chr1", 0, b"ACGTACGT", 30);
                read.name_mut().extend_from_slice(format!("r{}", i).as_bytes());
                result.push(read);
            }
            for i in 0..n_alt {
                let mut read = mock_read("chr1", 0, b"ACGTTCGT", 30);
                read.name_mut().extend_from_slice(format!("a{}", i).as_bytes());
                result.push(read);
            }
            result.sort();
            result
        };
        reads.insert("mother".to_owned(), make_reads(30, 0));
        reads.insert("father".to_owned(), make_reads(30, 0));
        reads.insert(
            "child".to_owned(),
            make_reads(30 - child_reads_alt.min(30), child_reads_alt),
        );
        let mut array = HaplotypeLikelihoodArray::new(vec![
            "mother".to_owned(),
            "father".to_owned(),
            "child".to_owned(),
        ]);
        array.populate(&reads, &haplotypes, None);
        (haplotypes, array)
    }

    fn run(
        rate: f64,
        child_reads_alt: usize,
    ) -> (Vec<Haplotype>, Latents) {
        let (haplotypes, array) = fixture(child_reads_alt);
        let mut model = TrioModel::new(
            GenotypePriorModel::Uniform,
            DeNovoModel::new(rate),
            diploid(),
            10_000,
        );
        let latents = model
            .infer(
                &haplotypes,
                &array,
                &"mother".to_owned(),
                &"father".to_owned(),
                &"child".to_owned(),
                &GenomicRegion::new("chr1", 0, 8),
            )
            .unwrap();
        (haplotypes, latents)
    }

    #[test]
    fn test_joint_posterior_normalised() {
        let (_, latents) = run(1e-8, 15);
        let trio = latents.trio.unwrap();
        let total: f64 = trio.joint.iter().map(|jp| jp.probability).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_mendelian_closure_without_denovo_rate() {
        // with a zero de-novo rate every surviving joint tuple satisfies
        // Mendelian inheritance
        let (haplotypes, latents) = run(0.0, 0);
        let trio = latents.trio.unwrap();
        for jp in &trio.joint {
            if jp.probability <= 0.0 {
                continue;
            }
            for &h in jp.child.iter() {
                assert!(
                    jp.maternal.contains(&h) || jp.paternal.contains(&h),
                    "child haplotype {} not in either parent",
                    haplotypes[h as usize]
                );
            }
        }
    }

    #[test]
    fn test_denovo_child_detected() {
        let (haplotypes, latents) = run(1e-8, 15);
        let trio = latents.trio.unwrap();
        let map = trio
            .joint
            .iter()
            .max_by(|a, b| a.probability.partial_cmp(&b.probability).unwrap())
            .unwrap();
        // parents hom-ref, child het-alt
        assert_eq!(map.maternal, Genotype::new(vec![0u32, 0]));
        assert_eq!(map.paternal, Genotype::new(vec![0u32, 0]));
        assert!(map.child.contains(&1));
        let alt_allele = Allele::new(GenomicRegion::new("chr1", 4, 5), b"T".to_vec());
        assert!(is_denovo(
            &alt_allele,
            &map.maternal,
            &map.paternal,
            &map.child,
            &haplotypes
        ));
    }

    #[test]
    fn test_is_denovo_occurrence_table() {
        let (haplotypes, _) = fixture(0);
        let alt = Allele::new(GenomicRegion::new("chr1", 4, 5), b"T".to_vec());
        let g = |a: u32, b: u32| Genotype::new(vec![a, b]);
        // c = 0
        assert!(!is_denovo(&alt, &g(0, 1), &g(0, 1), &g(0, 0), &haplotypes));
        // c = 1: flagged iff absent from both parents
        assert!(is_denovo(&alt, &g(0, 0), &g(0, 0), &g(0, 1), &haplotypes));
        assert!(!is_denovo(&alt, &g(0, 1), &g(0, 0), &g(0, 1), &haplotypes));
        // c = 2: flagged unless both parents carry it
        assert!(is_denovo(&alt, &g(0, 1), &g(0, 0), &g(1, 1), &haplotypes));
        assert!(!is_denovo(&alt, &g(0, 1), &g(0, 1), &g(1, 1), &haplotypes));
    }

    #[test]
    fn test_zero_ploidy_child_collapses() {
        let (haplotypes, array) = fixture(0);
        let mut model = TrioModel::new(
            GenotypePriorModel::Uniform,
            DeNovoModel::new(1e-8),
            TrioPloidies {
                maternal: 2,
                paternal: 0,
                child: 0,
            },
            10_000,
        );
        let latents = model
            .infer(
                &haplotypes,
                &array,
                &"mother".to_owned(),
                &"father".to_owned(),
                &"child".to_owned(),
                &GenomicRegion::new("chr1", 0, 8),
            )
            .unwrap();
        let trio = latents.trio.unwrap();
        assert!(trio.joint.iter().all(|jp| jp.child.is_empty()));
        assert!(trio.joint.iter().all(|jp| jp.paternal.is_empty()));
    }

    #[test]
    fn test_bad_ploidy_rejected() {
        let ploidies = TrioPloidies {
            maternal: 4,
            paternal: 2,
            child: 2,
        };
        assert!(ploidies.validate().is_err());
    }
}
