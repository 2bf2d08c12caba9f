//! Window extension and lagging policies for the haplotype generator.

use serde::{Deserialize, Serialize};

use crate::genome::GenomicRegion;
use crate::reads::pipe::ReadMap;

/// Whether previously active (already phased) alleles to the left are
/// re-included in the next window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndicatorPolicy {
    IncludeNone,
    IncludeIfSharedWithNovel,
    IncludeIfLinkableToNovel,
    IncludeAll,
}

/// When to stop extending the active region rightwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtensionPolicy {
    WithinReadLengthOfFirstIncluded,
    IfAllSamplesSharedWithFrontier,
    IfAnySampleSharedWithFrontier,
    NoLimit,
}

/// Whether paired-read (template) linkage participates in indicator and
/// extension decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadTemplatePolicy {
    None,
    Indicators,
    Extension,
    IndicatorsAndExtension,
}

#[derive(Debug, Clone)]
pub struct WalkerConfig {
    pub max_alleles: usize,
    pub indicator_policy: IndicatorPolicy,
    pub extension_policy: ExtensionPolicy,
    pub read_template_policy: ReadTemplatePolicy,
    pub max_extension: Option<u64>,
}

impl Default for WalkerConfig {
    fn default() -> Self {
        WalkerConfig {
            max_alleles: 64,
            indicator_policy: IndicatorPolicy::IncludeIfSharedWithNovel,
            extension_policy: ExtensionPolicy::IfAnySampleSharedWithFrontier,
            read_template_policy: ReadTemplatePolicy::IndicatorsAndExtension,
            max_extension: Some(400),
        }
    }
}

/// Do any (or all) samples have a read, or optionally a read template,
/// spanning both regions?
pub fn regions_share_reads(
    reads: &ReadMap,
    a: &GenomicRegion,
    b: &GenomicRegion,
    require_all_samples: bool,
    use_templates: bool,
) -> bool {
    let sample_shares = |sample_reads: &Vec<crate::reads::AlignedRead>| {
        if sample_reads
            .iter()
            .any(|read| read.region().overlaps(a) && read.region().overlaps(b))
        {
            return true;
        }
        if !use_templates {
            return false;
        }
        // template linkage: a mate pair with one read on each region
        sample_reads.iter().any(|read| {
            read.flags().paired
                && read.region().overlaps(a)
                && template_span(read).map_or(false, |span| span.overlaps(b))
        })
    };
    if require_all_samples {
        !reads.is_empty() && reads.values().all(sample_shares)
    } else {
        reads.values().any(sample_shares)
    }
}

/// The reference span of the whole template, inferred from the reported
/// template length.
fn template_span(read: &crate::reads::AlignedRead) -> Option<GenomicRegion> {
    let tlen = read.template_length();
    if tlen == 0 {
        return None;
    }
    let region = read.region();
    Some(if tlen > 0 {
        GenomicRegion::new(
            region.contig().to_owned(),
            region.begin(),
            region.begin() + tlen as u64,
        )
    } else {
        GenomicRegion::new(
            region.contig().to_owned(),
            region.end().saturating_sub((-tlen) as u64),
            region.end(),
        )
    })
}

/// Longest read overlapping `region`, used by the within-read-length
/// extension policy.
pub fn max_read_length(reads: &ReadMap, region: &GenomicRegion) -> u64 {
    reads
        .values()
        .flat_map(|sample_reads| sample_reads.iter())
        .filter(|read| read.region().overlaps(region))
        .map(|read| read.region().size())
        .max()
        .unwrap_or(0)
}

impl WalkerConfig {
    /// Can the active window currently ending at `frontier` be extended to
    /// include `next`?
    pub fn can_extend(
        &self,
        first_included: &GenomicRegion,
        frontier: &GenomicRegion,
        next: &GenomicRegion,
        reads: &ReadMap,
    ) -> bool {
        if let Some(max_extension) = self.max_extension {
            if next.end().saturating_sub(first_included.begin()) > max_extension {
                return false;
            }
        }
        let use_templates = matches!(
            self.read_template_policy,
            ReadTemplatePolicy::Extension | ReadTemplatePolicy::IndicatorsAndExtension
        );
        match self.extension_policy {
            ExtensionPolicy::NoLimit => true,
            ExtensionPolicy::WithinReadLengthOfFirstIncluded => {
                let read_length = max_read_length(reads, first_included);
                next.end() <= first_included.begin() + read_length
            }
            ExtensionPolicy::IfAllSamplesSharedWithFrontier => {
                regions_share_reads(reads, frontier, next, true, use_templates)
            }
            ExtensionPolicy::IfAnySampleSharedWithFrontier => {
                regions_share_reads(reads, frontier, next, false, use_templates)
            }
        }
    }

    /// Should a previously active site be retained as an indicator for a
    /// window whose first novel site is `novel`?
    pub fn keep_indicator(
        &self,
        indicator: &GenomicRegion,
        novel: &GenomicRegion,
        reads: &ReadMap,
    ) -> bool {
        let use_templates = matches!(
            self.read_template_policy,
            ReadTemplatePolicy::Indicators | ReadTemplatePolicy::IndicatorsAndExtension
        );
        match self.indicator_policy {
            IndicatorPolicy::IncludeNone => false,
            IndicatorPolicy::IncludeAll => true,
            IndicatorPolicy::IncludeIfSharedWithNovel => {
                regions_share_reads(reads, indicator, novel, false, false)
            }
            IndicatorPolicy::IncludeIfLinkableToNovel => {
                regions_share_reads(reads, indicator, novel, false, use_templates)
            }
        }
    }
}
