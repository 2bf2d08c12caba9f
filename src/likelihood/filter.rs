//! Sample-aware haplotype filtering.

use ordered_float::NotNan;

use crate::genome::GenomicRegion;
use crate::likelihood::HaplotypeLikelihoodArray;
use crate::variants::Haplotype;

/// Reduce the haplotype set to at most `max_haplotypes`, returning the
/// removed haplotypes. Haplotypes are ranked by the best over samples of
/// (posterior under a uniform prior, total likelihood); ties favour the
/// reference-like (least complex) haplotype.
///
/// When every haplotype scores identically the whole set is removed; the
/// caller is expected to clear generator progress and retry without lagging.
pub fn filter_to_n(
    haplotypes: &mut Vec<Haplotype>,
    likelihoods: &HaplotypeLikelihoodArray,
    max_haplotypes: usize,
) -> Vec<Haplotype> {
    if haplotypes.len() <= max_haplotypes {
        return Vec::new();
    }
    let scores: Vec<(NotNan<f64>, NotNan<f64>)> = (0..haplotypes.len())
        .map(|index| score(likelihoods, index))
        .collect();
    let all_equal = scores.windows(2).all(|w| w[0] == w[1]);
    if all_equal {
        let removed = std::mem::take(haplotypes);
        return removed;
    }
    let mut order: Vec<usize> = (0..haplotypes.len()).collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap()
            .then_with(|| haplotypes[a].num_alleles().cmp(&haplotypes[b].num_alleles()))
    });
    let keep: Vec<bool> = {
        let mut keep = vec![false; haplotypes.len()];
        for &index in order.iter().take(max_haplotypes) {
            keep[index] = true;
        }
        keep
    };
    let mut removed = Vec::with_capacity(haplotypes.len() - max_haplotypes);
    let mut kept = Vec::with_capacity(max_haplotypes);
    for (index, haplotype) in haplotypes.drain(..).enumerate() {
        if keep[index] {
            kept.push(haplotype);
        } else {
            removed.push(haplotype);
        }
    }
    *haplotypes = kept;
    removed
}

/// (uniform-prior posterior proxy, max single-read likelihood), maximised
/// over samples.
fn score(likelihoods: &HaplotypeLikelihoodArray, index: usize) -> (NotNan<f64>, NotNan<f64>) {
    let mut best_total = f64::NEG_INFINITY;
    let mut best_single = f64::NEG_INFINITY;
    for sample in likelihoods.samples() {
        let row = likelihoods.row(sample, index);
        if row.is_empty() {
            continue;
        }
        let total: f64 = row.iter().map(|lp| **lp).sum();
        let single = row.iter().map(|lp| **lp).fold(f64::NEG_INFINITY, f64::max);
        best_total = best_total.max(total);
        best_single = best_single.max(single);
    }
    (
        NotNan::new(best_total).unwrap_or_else(|_| NotNan::new(f64::NEG_INFINITY).unwrap()),
        NotNan::new(best_single).unwrap_or_else(|_| NotNan::new(f64::NEG_INFINITY).unwrap()),
    )
}

/// Haplotypes spanning `region` whose marginal posterior fell below the
/// threshold; removed from the generator between caller passes.
/// `posteriors` is indexed like `haplotypes`.
pub fn removable_haplotypes(
    haplotypes: &[Haplotype],
    posteriors: &[f64],
    region: &GenomicRegion,
    min_posterior: f64,
) -> Vec<Haplotype> {
    haplotypes
        .iter()
        .zip(posteriors)
        .filter(|(haplotype, &posterior)| {
            posterior < min_posterior && haplotype.region().contains(region)
        })
        .map(|(haplotype, _)| haplotype.clone())
        .collect()
}

/// Guard against degenerate likelihood matrices before inference: when
/// entries exist but every one of them is zero probability, normalisation
/// cannot produce a finite posterior. An entirely empty matrix (no reads)
/// passes, since the empty product is a valid likelihood.
pub fn any_finite_row(likelihoods: &HaplotypeLikelihoodArray) -> bool {
    let mut any_entry = false;
    for sample in likelihoods.samples() {
        for index in 0..likelihoods.haplotypes().len() {
            for lp in likelihoods.row(sample, index) {
                any_entry = true;
                if **lp > f64::NEG_INFINITY {
                    return true;
                }
            }
        }
    }
    !any_entry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genome::GenomicRegion;
    use crate::likelihood::tests_support::populated_array;

    #[test]
    fn test_no_filtering_below_cap() {
        let (mut haplotypes, array) = populated_array();
        let removed = filter_to_n(&mut haplotypes, &array, 8);
        assert!(removed.is_empty());
        assert_eq!(haplotypes.len(), 2);
    }

    #[test]
    fn test_filters_to_cap_keeping_supported() {
        let (mut haplotypes, array) = populated_array();
        // reads in the fixture support the reference haplotype only
        let removed = filter_to_n(&mut haplotypes, &array, 1);
        assert_eq!(removed.len(), 1);
        assert_eq!(haplotypes.len(), 1);
        assert!(haplotypes[0].is_reference());
    }

    #[test]
    fn test_removable_haplotypes_by_posterior() {
        let (haplotypes, _) = populated_array();
        let active = GenomicRegion::new("chr1", 4, 5);
        let removable = removable_haplotypes(&haplotypes, &[0.9, 1e-20], &active, 1e-15);
        assert_eq!(removable.len(), 1);
        assert_eq!(removable[0], haplotypes[1]);
        // nothing removable when every posterior clears the threshold
        assert!(removable_haplotypes(&haplotypes, &[0.9, 0.1], &active, 1e-15).is_empty());
    }

    #[test]
    fn test_any_finite_row() {
        let (_, array) = populated_array();
        assert!(any_finite_row(&array));
        // an empty matrix is fine: there is nothing to normalise away
        let empty = HaplotypeLikelihoodArray::new(vec!["s1".to_owned()]);
        assert!(any_finite_row(&empty));
    }
}
