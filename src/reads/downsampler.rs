//! Deterministic coverage-capping downsampler.
//!
//! Reads are sampled to keep, position by position, with sampling weighted
//! toward positions that are furthest from their required coverage. The
//! generator is seeded with a fixed value so repeated runs remove the same
//! reads.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::constants::DOWNSAMPLER_SEED;
use crate::genome::GenomicRegion;
use crate::reads::{encompassing_region, positional_coverage, AlignedRead};

#[derive(Debug, Clone, Copy)]
pub struct Downsampler {
    trigger_coverage: u32,
    target_coverage: u32,
}

impl Downsampler {
    pub fn new(trigger_coverage: u32, target_coverage: u32) -> Self {
        Downsampler {
            trigger_coverage,
            target_coverage: target_coverage.min(trigger_coverage),
        }
    }

    /// Downsample `reads` (sorted) in place. Returns the number of removed
    /// reads. Positions whose original coverage never exceeded the trigger
    /// retain all their reads.
    pub fn downsample(&self, reads: &mut Vec<AlignedRead>) -> usize {
        if reads.is_empty() {
            return 0;
        }
        let span = match encompassing_region(reads) {
            Some(region) => region,
            None => return 0,
        };
        let targets = self.find_target_regions(reads, &span);
        if targets.is_empty() {
            return 0;
        }
        let mut rng = StdRng::seed_from_u64(DOWNSAMPLER_SEED);
        let before = reads.len();
        for target in &targets {
            self.sample_region(reads, target, &mut rng);
        }
        reads.sort();
        before - reads.len()
    }

    /// Regions with coverage above the trigger, joined across interconnecting
    /// positions that are above the target.
    fn find_target_regions(
        &self,
        reads: &[AlignedRead],
        span: &GenomicRegion,
    ) -> Vec<GenomicRegion> {
        let coverage = positional_coverage(reads, span);
        let above_trigger = regions_above(&coverage, span, self.trigger_coverage);
        if above_trigger.is_empty() {
            return Vec::new();
        }
        regions_above(&coverage, span, self.target_coverage)
            .into_iter()
            .filter(|joined| above_trigger.iter().any(|t| joined.contains(t)))
            .collect()
    }

    fn sample_region(
        &self,
        reads: &mut Vec<AlignedRead>,
        target: &GenomicRegion,
        rng: &mut StdRng,
    ) {
        let contained: Vec<usize> = (0..reads.len())
            .filter(|&i| target.contains(reads[i].region()))
            .collect();
        if contained.is_empty() {
            return;
        }
        let mut required: Vec<u32> = positional_coverage(
            &contained.iter().map(|&i| reads[i].clone()).collect::<Vec<_>>(),
            target,
        )
        .into_iter()
        .map(|c| c.min(self.target_coverage))
        .collect();
        let mut unsampled: Vec<usize> = contained.clone();
        let mut kept: Vec<usize> = Vec::new();
        while required.iter().any(|&c| c > 0) && !unsampled.is_empty() {
            let weights: Vec<u32> = required.clone();
            let position = match WeightedIndex::new(&weights) {
                Ok(dist) => target.begin() + dist.sample(rng) as u64,
                Err(_) => break,
            };
            let overlapping: Vec<usize> = unsampled
                .iter()
                .copied()
                .filter(|&i| {
                    reads[i].region().begin() <= position && position < reads[i].region().end()
                })
                .collect();
            if overlapping.is_empty() {
                // nothing left can satisfy this position
                let offset = (position - target.begin()) as usize;
                required[offset] = 0;
                continue;
            }
            let choice = overlapping[rng.gen_range(0..overlapping.len())];
            unsampled.retain(|&i| i != choice);
            kept.push(choice);
            let begin = reads[choice].region().begin().max(target.begin()) - target.begin();
            let end = reads[choice].region().end().min(target.end()) - target.begin();
            for slot in &mut required[begin as usize..end as usize] {
                *slot = slot.saturating_sub(1);
            }
        }
        // everything still unsampled once coverage is satisfied is removed
        let mut remove: Vec<bool> = vec![false; reads.len()];
        for i in unsampled {
            remove[i] = true;
        }
        let mut index = 0;
        reads.retain(|_| {
            let keep = !remove[index];
            index += 1;
            keep
        });
    }
}

fn regions_above(coverage: &[u32], span: &GenomicRegion, threshold: u32) -> Vec<GenomicRegion> {
    let mut result = Vec::new();
    let mut start: Option<usize> = None;
    for (i, &c) in coverage.iter().enumerate() {
        if c > threshold {
            if start.is_none() {
                start = Some(i);
            }
        } else if let Some(s) = start.take() {
            result.push(GenomicRegion::new(
                span.contig().to_owned(),
                span.begin() + s as u64,
                span.begin() + i as u64,
            ));
        }
    }
    if let Some(s) = start {
        result.push(GenomicRegion::new(
            span.contig().to_owned(),
            span.begin() + s as u64,
            span.begin() + coverage.len() as u64,
        ));
    }
    result
}
