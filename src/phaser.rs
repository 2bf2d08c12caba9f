//! Phase-set inference from genotype posteriors.
//!
//! A phase block is a run of called sites over which the sample's genotype
//! can be written as one concrete ordered assignment of alleles to
//! chromosomes with enough posterior mass behind it. Blocks never extend
//! across a site where that mass would fall below the phase-score
//! threshold.

use std::collections::HashMap;

use bio::stats::LogProb;

use crate::genome::GenomicRegion;
use crate::model::{GenotypePosterior, Latents};
use crate::utils::prob_false_to_phred;
use crate::variants::genotype::HaplotypeIndex;
use crate::variants::{Allele, Genotype, Haplotype};
use crate::SampleName;

#[derive(Debug, Clone, PartialEq)]
pub struct PhaseRegion {
    pub region: GenomicRegion,
    /// PHRED-scaled confidence that the phasing is correct.
    pub score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct PhaseSet {
    /// The span jointly phased across all samples.
    pub region: Option<GenomicRegion>,
    pub phase_regions: HashMap<SampleName, Vec<PhaseRegion>>,
}

impl PhaseSet {
    pub fn find(&self, sample: &SampleName, region: &GenomicRegion) -> Option<&PhaseRegion> {
        self.phase_regions
            .get(sample)?
            .iter()
            .find(|phase| phase.region.overlaps(region))
    }
}

pub struct Phaser {
    min_phase_score: f64,
}

impl Phaser {
    pub fn new(min_phase_score: f64) -> Self {
        Phaser { min_phase_score }
    }

    /// Phase whatever prefix of the window is already confidently
    /// resolvable in every sample. Returns `None` when no site is.
    pub fn try_phase(
        &self,
        haplotypes: &[Haplotype],
        latents: &Latents,
        sites: &[GenomicRegion],
    ) -> Option<PhaseSet> {
        if sites.is_empty() {
            return None;
        }
        let partitions = self.partition_all(haplotypes, latents, sites);
        // the jointly phased prefix: every sample must cover it with blocks
        // that meet the threshold
        let mut prefix_end: Option<u64> = None;
        for blocks in partitions.values() {
            let mut sample_end = None;
            for block in blocks {
                if block.score < self.min_phase_score {
                    break;
                }
                sample_end = Some(block.region.end());
            }
            let sample_end = sample_end?;
            prefix_end = Some(match prefix_end {
                None => sample_end,
                Some(existing) => existing.min(sample_end),
            });
        }
        let prefix_end = prefix_end?;
        let phased_sites: Vec<&GenomicRegion> =
            sites.iter().filter(|s| s.end() <= prefix_end).collect();
        if phased_sites.is_empty() {
            return None;
        }
        let region = phased_sites
            .iter()
            .fold(None::<GenomicRegion>, |acc, site| match acc {
                None => Some((*site).clone()),
                Some(region) => Some(region.encompassing(site)),
            });
        Some(PhaseSet {
            region,
            phase_regions: partitions,
        })
    }

    /// Final partition of the window, emitted regardless of the threshold;
    /// low-confidence boundaries simply become block breaks.
    pub fn force_phase(
        &self,
        haplotypes: &[Haplotype],
        latents: &Latents,
        sites: &[GenomicRegion],
    ) -> PhaseSet {
        let phase_regions = self.partition_all(haplotypes, latents, sites);
        let region = sites
            .iter()
            .fold(None::<GenomicRegion>, |acc, site| match acc {
                None => Some(site.clone()),
                Some(region) => Some(region.encompassing(site)),
            });
        PhaseSet {
            region,
            phase_regions,
        }
    }

    fn partition_all(
        &self,
        haplotypes: &[Haplotype],
        latents: &Latents,
        sites: &[GenomicRegion],
    ) -> HashMap<SampleName, Vec<PhaseRegion>> {
        latents
            .genotype_posteriors
            .iter()
            .map(|(sample, posterior)| {
                (
                    sample.clone(),
                    self.partition_sample(haplotypes, posterior, sites),
                )
            })
            .collect()
    }

    /// Greedy left-to-right block growth for one sample.
    fn partition_sample(
        &self,
        haplotypes: &[Haplotype],
        posterior: &GenotypePosterior,
        sites: &[GenomicRegion],
    ) -> Vec<PhaseRegion> {
        let mut blocks = Vec::new();
        if sites.is_empty() || posterior.genotypes.is_empty() {
            return blocks;
        }
        let mut block_start = 0usize;
        let mut previous_score = None::<f64>;
        for end in 1..=sites.len() {
            let score = self.block_score(haplotypes, posterior, &sites[block_start..end]);
            let extended_below = score < self.min_phase_score && end - block_start > 1;
            if extended_below {
                blocks.push(PhaseRegion {
                    region: span(&sites[block_start..end - 1]),
                    score: previous_score.unwrap_or(score),
                });
                block_start = end - 1;
                previous_score =
                    Some(self.block_score(haplotypes, posterior, &sites[block_start..end]));
            } else {
                previous_score = Some(score);
            }
        }
        blocks.push(PhaseRegion {
            region: span(&sites[block_start..]),
            score: previous_score.unwrap_or(0.0),
        });
        blocks
    }

    /// Posterior mass behind the MAP genotype's restriction to the block,
    /// as a PHRED score.
    fn block_score(
        &self,
        haplotypes: &[Haplotype],
        posterior: &GenotypePosterior,
        block: &[GenomicRegion],
    ) -> f64 {
        let (map_genotype, _) = match posterior.map_genotype() {
            Some(map) => map,
            None => return 0.0,
        };
        let map_restriction = restrict(map_genotype, haplotypes, block);
        let mut agreeing_mass = 0.0f64;
        for (genotype, lp) in posterior.genotypes.iter().zip(&posterior.log_posteriors) {
            if restrict(genotype, haplotypes, block) == map_restriction {
                agreeing_mass += lp.exp();
            }
        }
        prob_false_to_phred(1.0 - agreeing_mass.min(1.0))
    }
}

/// The unordered multiset of per-haplotype allele tuples over the block's
/// sites. Two genotypes with equal restrictions are indistinguishable to
/// phasing over that block.
fn restrict(
    genotype: &Genotype<HaplotypeIndex>,
    haplotypes: &[Haplotype],
    block: &[GenomicRegion],
) -> Vec<Vec<Option<Allele>>> {
    let mut tuples: Vec<Vec<Option<Allele>>> = genotype
        .iter()
        .map(|&h| {
            block
                .iter()
                .map(|site| haplotypes[h as usize].expressed_allele(site))
                .collect()
        })
        .collect();
    tuples.sort_by(|a, b| format!("{:?}", a).cmp(&format!("{:?}", b)));
    tuples
}

fn span(sites: &[GenomicRegion]) -> GenomicRegion {
    sites
        .iter()
        .skip(1)
        .fold(sites[0].clone(), |acc, site| acc.encompassing(site))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Latents;
    use crate::reference::tests::mock_reference;

    /// Two SNV sites on one window with four haplotypes covering every
    /// allele combination.
    fn fixture() -> (Vec<Haplotype>, Vec<GenomicRegion>) {
        let reference = mock_reference("chr1", b"ACGTACGTACGT");
        let window = GenomicRegion::new("chr1", 0, 12);
        let site_a = GenomicRegion::new("chr1", 2, 3);
        let site_b = GenomicRegion::new("chr1", 8, 9);
        let allele_a = Allele::new(site_a.clone(), b"T".to_vec());
        let allele_b = Allele::new(site_b.clone(), b"C".to_vec());
        let haplotypes = vec![
            Haplotype::reference(window.clone(), &reference).unwrap(),
            Haplotype::build(window.clone(), vec![allele_a.clone()], &reference).unwrap(),
            Haplotype::build(window.clone(), vec![allele_b.clone()], &reference).unwrap(),
            Haplotype::build(window, vec![allele_a, allele_b], &reference).unwrap(),
        ];
        (haplotypes, vec![site_a, site_b])
    }

    fn latents_with(genotypes: Vec<Genotype<HaplotypeIndex>>, probs: Vec<f64>) -> Latents {
        let log_posteriors: Vec<LogProb> = probs.iter().map(|p| LogProb(p.ln())).collect();
        let posterior = GenotypePosterior {
            genotypes,
            log_posteriors,
            log_evidence: LogProb(-1.0),
        };
        Latents::single_sample("s1".to_owned(), posterior, 4)
    }

    #[test]
    fn test_confident_joint_genotype_phases_both_sites() {
        let (haplotypes, sites) = fixture();
        // nearly all mass on ref/doubly-alt: cis configuration
        let latents = latents_with(
            vec![Genotype::new(vec![0u32, 3]), Genotype::new(vec![1u32, 2])],
            vec![0.999, 0.001],
        );
        let phaser = Phaser::new(20.0);
        let phase = phaser.try_phase(&haplotypes, &latents, &sites).unwrap();
        assert_eq!(
            phase.region,
            Some(GenomicRegion::new("chr1", 2, 9))
        );
        let blocks = &phase.phase_regions[&"s1".to_owned()];
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].score >= 20.0);
    }

    #[test]
    fn test_ambiguous_configuration_splits_blocks() {
        let (haplotypes, sites) = fixture();
        // cis and trans equally likely: each site is callable but their
        // joint phase is not
        let latents = latents_with(
            vec![Genotype::new(vec![0u32, 3]), Genotype::new(vec![1u32, 2])],
            vec![0.5, 0.5],
        );
        let phaser = Phaser::new(20.0);
        let forced = phaser.force_phase(&haplotypes, &latents, &sites);
        let blocks = &forced.phase_regions[&"s1".to_owned()];
        assert_eq!(blocks.len(), 2);
    }

    #[test]
    fn test_try_phase_none_when_nothing_confident() {
        let (haplotypes, sites) = fixture();
        let latents = latents_with(
            vec![
                Genotype::new(vec![0u32, 3]),
                Genotype::new(vec![1u32, 2]),
                Genotype::new(vec![0u32, 1]),
                Genotype::new(vec![2u32, 3]),
            ],
            vec![0.25, 0.25, 0.25, 0.25],
        );
        let phaser = Phaser::new(20.0);
        assert!(phaser.try_phase(&haplotypes, &latents, &sites).is_none());
    }

    #[test]
    fn test_single_site_phases_trivially() {
        let (haplotypes, sites) = fixture();
        let latents = latents_with(
            vec![Genotype::new(vec![0u32, 1]), Genotype::new(vec![0u32, 0])],
            vec![0.999, 0.001],
        );
        let phaser = Phaser::new(20.0);
        let phase = phaser
            .try_phase(&haplotypes, &latents, &sites[..1])
            .unwrap();
        assert_eq!(phase.region, Some(GenomicRegion::new("chr1", 2, 3)));
    }
}
