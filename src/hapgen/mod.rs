//! Haplotype generation over a lagging active window.
//!
//! The generator walks the candidate stream left to right. Each `advance`
//! yields an active region and the haplotypes spanning it; the novel
//! frontier moves strictly forward between calls, so the walk terminates.
//! Lagging re-includes already processed sites on the left per the
//! configured indicator policy, which is what lets phase extend across
//! window boundaries.

use std::collections::HashSet;

use anyhow::Result;

use crate::genome::GenomicRegion;
use crate::reads::pipe::ReadMap;
use crate::reference::Reference;
use crate::variants::{Allele, Haplotype, Variant};

pub mod walker;

pub use walker::{ExtensionPolicy, IndicatorPolicy, ReadTemplatePolicy, WalkerConfig};

/// Bases of reference context added on each side of the active region when
/// building haplotypes; inactive flanks for the likelihood model.
const HAPLOTYPE_PADDING: u64 = 30;

#[derive(Debug, Clone)]
pub struct HaplotypeGeneratorConfig {
    pub walker: WalkerConfig,
    /// Target number of haplotypes per window; extension stops before the
    /// enumeration would overshoot this by more than the hard factor.
    pub max_haplotypes: usize,
    pub lagging: bool,
}

impl Default for HaplotypeGeneratorConfig {
    fn default() -> Self {
        HaplotypeGeneratorConfig {
            walker: WalkerConfig::default(),
            max_haplotypes: crate::constants::DEFAULT_MAX_HAPLOTYPES,
            lagging: true,
        }
    }
}

/// A cluster of overlapping candidate variants.
#[derive(Debug, Clone)]
struct Site {
    region: GenomicRegion,
    alts: Vec<Allele>,
}

struct CurrentWindow {
    active_region: GenomicRegion,
    haplotypes: Vec<Haplotype>,
    /// Site indices included in this window.
    sites: Vec<usize>,
    /// First novel site of this window, for progress rollback.
    novel_start: usize,
}

pub struct HaplotypeGenerator<'a> {
    config: HaplotypeGeneratorConfig,
    reference: &'a Reference,
    reads: &'a ReadMap,
    sites: Vec<Site>,
    frontier: usize,
    current: Option<CurrentWindow>,
    dead_alleles: HashSet<Allele>,
    lag_next: bool,
}

impl<'a> HaplotypeGenerator<'a> {
    pub fn new(
        config: HaplotypeGeneratorConfig,
        reference: &'a Reference,
        candidates: &[Variant],
        reads: &'a ReadMap,
    ) -> Self {
        let lagging = config.lagging;
        HaplotypeGenerator {
            config,
            reference,
            reads,
            sites: cluster_sites(candidates),
            frontier: 0,
            current: None,
            dead_alleles: HashSet::new(),
            lag_next: lagging,
        }
    }

    /// Advance to the next active window. Returns `None` when no candidates
    /// remain.
    pub fn advance(&mut self) -> Result<Option<(Vec<Haplotype>, GenomicRegion)>> {
        let plan = match self.plan_next() {
            Some(plan) => plan,
            None => {
                self.current = None;
                return Ok(None);
            }
        };
        let haplotype_region = self.pad(&plan.active_region)?;
        let alleles: Vec<Allele> = plan
            .sites
            .iter()
            .flat_map(|&index| self.sites[index].alts.iter())
            .filter(|allele| !self.dead_alleles.contains(*allele))
            .cloned()
            .collect();
        let cap = self.config.max_haplotypes.saturating_mul(8).max(64);
        let haplotypes =
            enumerate_haplotypes(&haplotype_region, &alleles, self.reference, cap)?;
        self.frontier = plan.novel_end;
        self.lag_next = self.config.lagging;
        let result = (haplotypes.clone(), plan.active_region.clone());
        self.current = Some(CurrentWindow {
            active_region: plan.active_region,
            haplotypes,
            sites: plan.sites,
            novel_start: plan.novel_start,
        });
        Ok(Some(result))
    }

    /// The active region the next `advance` would produce, without
    /// consuming anything.
    pub fn tell_next_active_region(&self) -> Option<GenomicRegion> {
        self.plan_next().map(|plan| plan.active_region)
    }

    /// Drop haplotypes from the current window. Alleles no longer carried
    /// by any surviving haplotype become unavailable to later windows.
    pub fn remove(&mut self, removed: &[Haplotype]) {
        let current = match &mut self.current {
            Some(current) => current,
            None => return,
        };
        if removed.is_empty() || current.haplotypes.is_empty() {
            return;
        }
        current.haplotypes.retain(|h| !removed.contains(h));
        let alive: HashSet<&Allele> = current
            .haplotypes
            .iter()
            .flat_map(|h| h.alleles().iter())
            .collect();
        for haplotype in removed {
            for allele in haplotype.alleles() {
                if !alive.contains(allele) {
                    self.dead_alleles.insert(allele.clone());
                }
            }
        }
    }

    /// Keep exactly the given haplotypes of the current window.
    pub fn uniquely_keep(&mut self, keep: &[Haplotype]) {
        if let Some(current) = &mut self.current {
            current.haplotypes.retain(|h| keep.contains(h));
        }
    }

    /// Jump the frontier forward so the next window starts at or after
    /// `region`. Indicators to the left are dropped.
    pub fn force_forward(&mut self, region: &GenomicRegion) {
        while self.frontier < self.sites.len()
            && self.sites[self.frontier].region.begin() < region.begin()
        {
            self.frontier += 1;
        }
        if let Some(current) = &mut self.current {
            current
                .sites
                .retain(|&index| self.sites[index].region.begin() >= region.begin());
        }
        self.lag_next = false;
    }

    /// Roll the frontier back to the start of the current window and retry
    /// it without lagging. Fallback for when filtering removed every
    /// haplotype.
    pub fn clear_progress(&mut self) {
        if let Some(current) = self.current.take() {
            self.frontier = current.novel_start;
        }
        self.dead_alleles.clear();
        self.lag_next = false;
    }

    fn plan_next(&self) -> Option<WindowPlan> {
        if self.frontier >= self.sites.len() {
            return None;
        }
        let novel_start = self.frontier;
        let first_novel = &self.sites[novel_start];
        let mut selected: Vec<usize> = Vec::new();
        // lagging: retain passed sites that link to the novel frontier
        if self.lag_next {
            if let Some(current) = &self.current {
                for &index in &current.sites {
                    if index < novel_start
                        && self.site_alive(index)
                        && self.config.walker.keep_indicator(
                            &self.sites[index].region,
                            &first_novel.region,
                            self.reads,
                        )
                    {
                        selected.push(index);
                    }
                }
            }
        }
        selected.push(novel_start);
        let mut num_alleles: usize = selected
            .iter()
            .map(|&index| self.live_alt_count(index))
            .sum();
        let mut estimate: usize = selected
            .iter()
            .map(|&index| self.live_alt_count(index) + 1)
            .product();
        let first_region = self.sites[selected[0]].region.clone();
        let mut novel_end = novel_start + 1;
        while novel_end < self.sites.len() {
            let next = &self.sites[novel_end];
            let alts = self.live_alt_count(novel_end);
            if num_alleles + alts > self.config.walker.max_alleles {
                break;
            }
            if estimate.saturating_mul(alts + 1) > self.config.max_haplotypes {
                break;
            }
            let frontier_region = &self.sites[novel_end - 1].region;
            if !self.config.walker.can_extend(
                &first_region,
                frontier_region,
                &next.region,
                self.reads,
            ) {
                break;
            }
            selected.push(novel_end);
            num_alleles += alts;
            estimate = estimate.saturating_mul(alts + 1);
            novel_end += 1;
        }
        let active_region = selected
            .iter()
            .map(|&index| self.sites[index].region.clone())
            .reduce(|a, b| a.encompassing(&b))
            .expect("window has at least one site");
        Some(WindowPlan {
            active_region,
            sites: selected,
            novel_start,
            novel_end,
        })
    }

    fn live_alt_count(&self, site: usize) -> usize {
        self.sites[site]
            .alts
            .iter()
            .filter(|allele| !self.dead_alleles.contains(*allele))
            .count()
    }

    fn site_alive(&self, site: usize) -> bool {
        self.live_alt_count(site) > 0
    }

    fn pad(&self, active: &GenomicRegion) -> Result<GenomicRegion> {
        let contig = self.reference.contig_region(active.contig())?;
        Ok(contig
            .overlapped(&active.expand(HAPLOTYPE_PADDING))
            .unwrap_or_else(|| active.clone()))
    }
}

struct WindowPlan {
    active_region: GenomicRegion,
    sites: Vec<usize>,
    novel_start: usize,
    novel_end: usize,
}

/// Cluster sorted candidates into overlap sites; alleles within one site
/// are mutually exclusive on a haplotype.
fn cluster_sites(candidates: &[Variant]) -> Vec<Site> {
    let mut sites: Vec<Site> = Vec::new();
    for candidate in candidates {
        let alt = candidate.alt_allele().clone();
        match sites.last_mut() {
            Some(site)
                if site.region.overlaps(candidate.region())
                    && site.region.same_contig(candidate.region()) =>
            {
                site.region = site.region.encompassing(candidate.region());
                site.alts.push(alt);
            }
            _ => sites.push(Site {
                region: candidate.region().clone(),
                alts: vec![alt],
            }),
        }
    }
    sites
}

/// All haplotypes formed by pairwise non-overlapping subsets of `alleles`
/// over `region`, reference haplotype included, capped at `max_haplotypes`.
fn enumerate_haplotypes(
    region: &GenomicRegion,
    alleles: &[Allele],
    reference: &Reference,
    max_haplotypes: usize,
) -> Result<Vec<Haplotype>> {
    let mut sorted: Vec<&Allele> = alleles.iter().collect();
    sorted.sort();
    let mut paths: Vec<Vec<&Allele>> = vec![Vec::new()];
    for allele in sorted {
        let mut extended: Vec<Vec<&Allele>> = Vec::new();
        for path in &paths {
            let compatible = path.last().map_or(true, |last| {
                last.region().end() <= allele.region().begin() && **last != *allele
            });
            if compatible && paths.len() + extended.len() < max_haplotypes {
                let mut longer = path.clone();
                longer.push(allele);
                extended.push(longer);
            }
        }
        paths.append(&mut extended);
    }
    let mut haplotypes = Vec::with_capacity(paths.len());
    for path in paths {
        let owned: Vec<Allele> = path.into_iter().cloned().collect();
        haplotypes.push(Haplotype::build(region.clone(), owned, reference)?);
    }
    Ok(haplotypes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reads::tests::mock_read;
    use crate::reference::tests::mock_reference;

    const REF: &[u8] = b"ACGTACGTACGTACGTACGTACGTACGTACGTACGTACGT";

    fn reads_covering(begin: u64, end: u64) -> ReadMap {
        let mut map = ReadMap::new();
        map.insert(
            "s1".to_owned(),
            vec![mock_read("chr1", begin, &vec![b'A'; (end - begin) as usize], 30)],
        );
        map
    }

    fn snv(pos: u64, base: u8) -> Variant {
        Variant::from_sequences("chr1", pos, vec![REF[pos as usize]], vec![base])
    }

    #[test]
    fn test_single_site_yields_ref_and_alt() {
        let reference = mock_reference("chr1", REF);
        let reads = reads_covering(0, 40);
        let candidates = vec![snv(10, b'G')];
        let mut generator = HaplotypeGenerator::new(
            HaplotypeGeneratorConfig::default(),
            &reference,
            &candidates,
            &reads,
        );
        let (haplotypes, active) = generator.advance().unwrap().unwrap();
        assert_eq!(active, GenomicRegion::new("chr1", 10, 11));
        assert_eq!(haplotypes.len(), 2);
        assert!(haplotypes.iter().any(|h| h.is_reference()));
        assert!(generator.advance().unwrap().is_none());
    }

    #[test]
    fn test_linked_sites_enumerate_jointly() {
        let reference = mock_reference("chr1", REF);
        let reads = reads_covering(0, 40);
        let candidates = vec![snv(10, b'G'), snv(20, b'C')];
        let mut generator = HaplotypeGenerator::new(
            HaplotypeGeneratorConfig::default(),
            &reference,
            &candidates,
            &reads,
        );
        let (haplotypes, active) = generator.advance().unwrap().unwrap();
        assert_eq!(active, GenomicRegion::new("chr1", 10, 21));
        // ref, A, B, AB
        assert_eq!(haplotypes.len(), 4);
    }

    #[test]
    fn test_unlinked_sites_split_windows() {
        let reference = mock_reference("chr1", REF);
        // reads only cover the first site, so the second is not linkable
        let reads = reads_covering(5, 15);
        let candidates = vec![snv(10, b'G'), snv(30, b'C')];
        let mut generator = HaplotypeGenerator::new(
            HaplotypeGeneratorConfig::default(),
            &reference,
            &candidates,
            &reads,
        );
        let (_, first) = generator.advance().unwrap().unwrap();
        assert_eq!(first, GenomicRegion::new("chr1", 10, 11));
        let (_, second) = generator.advance().unwrap().unwrap();
        assert_eq!(second.begin(), 30);
        // frontier moved strictly forward
        assert!(first.is_before(&second));
    }

    #[test]
    fn test_overlapping_candidates_share_site() {
        let reference = mock_reference("chr1", REF);
        let reads = reads_covering(0, 40);
        let candidates = vec![snv(10, b'G'), snv(10, b'C')];
        let mut generator = HaplotypeGenerator::new(
            HaplotypeGeneratorConfig::default(),
            &reference,
            &candidates,
            &reads,
        );
        let (haplotypes, _) = generator.advance().unwrap().unwrap();
        // ref, G, C: the two alts never co-occur
        assert_eq!(haplotypes.len(), 3);
    }

    #[test]
    fn test_clear_progress_rolls_back() {
        let reference = mock_reference("chr1", REF);
        let reads = reads_covering(0, 40);
        let candidates = vec![snv(10, b'G')];
        let mut generator = HaplotypeGenerator::new(
            HaplotypeGeneratorConfig::default(),
            &reference,
            &candidates,
            &reads,
        );
        let (first, _) = generator.advance().unwrap().unwrap();
        generator.clear_progress();
        let (second, _) = generator.advance().unwrap().unwrap();
        assert_eq!(first.len(), second.len());
    }

    #[test]
    fn test_force_forward_skips_sites() {
        let reference = mock_reference("chr1", REF);
        let reads = reads_covering(0, 40);
        let candidates = vec![snv(10, b'G'), snv(30, b'C')];
        let mut generator = HaplotypeGenerator::new(
            HaplotypeGeneratorConfig {
                walker: WalkerConfig {
                    extension_policy: ExtensionPolicy::NoLimit,
                    max_extension: Some(5),
                    ..Default::default()
                },
                ..Default::default()
            },
            &reference,
            &candidates,
            &reads,
        );
        generator.force_forward(&GenomicRegion::new("chr1", 20, 40));
        let (_, active) = generator.advance().unwrap().unwrap();
        assert_eq!(active.begin(), 30);
    }
}
