//! Pure read predicates. Order of application is immaterial.

use serde::{Deserialize, Serialize};

use crate::reads::AlignedRead;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReadFilter {
    IsMapped,
    MinMappingQuality(u8),
    HasSufficientGoodQualityBases { quality: u8, count: usize },
    HasGoodBaseFraction { quality: u8, fraction: f64 },
    IsNotMarkedDuplicate,
    IsNotMarkedQcFail,
    IsNotSecondary,
    IsNotSupplementary,
    NextSegmentMapped,
    MinLength(usize),
    MaxLength(usize),
}

impl ReadFilter {
    pub fn passes(&self, read: &AlignedRead) -> bool {
        match self {
            ReadFilter::IsMapped => !read.flags().unmapped,
            ReadFilter::MinMappingQuality(q) => read.mapping_quality() >= *q,
            ReadFilter::HasSufficientGoodQualityBases { quality, count } => {
                read.count_bases_with_quality_at_least(*quality) >= *count
            }
            ReadFilter::HasGoodBaseFraction { quality, fraction } => {
                let good = read.count_bases_with_quality_at_least(*quality);
                !read.is_empty() && good as f64 / read.len() as f64 >= *fraction
            }
            ReadFilter::IsNotMarkedDuplicate => !read.flags().duplicate,
            ReadFilter::IsNotMarkedQcFail => !read.flags().qc_fail,
            ReadFilter::IsNotSecondary => !read.flags().secondary,
            ReadFilter::IsNotSupplementary => !read.flags().supplementary,
            ReadFilter::NextSegmentMapped => {
                !read.flags().paired || !read.flags().mate_unmapped
            }
            ReadFilter::MinLength(l) => read.len() >= *l,
            ReadFilter::MaxLength(l) => read.len() <= *l,
        }
    }
}

/// A conjunction of filters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadFilters {
    filters: Vec<ReadFilter>,
}

impl ReadFilters {
    pub fn new(filters: Vec<ReadFilter>) -> Self {
        ReadFilters { filters }
    }

    /// The default set applied before calling.
    pub fn standard(min_mapping_quality: u8) -> Self {
        ReadFilters::new(vec![
            ReadFilter::IsMapped,
            ReadFilter::MinMappingQuality(min_mapping_quality),
            ReadFilter::IsNotMarkedDuplicate,
            ReadFilter::IsNotMarkedQcFail,
            ReadFilter::IsNotSecondary,
            ReadFilter::IsNotSupplementary,
        ])
    }

    pub fn passes(&self, read: &AlignedRead) -> bool {
        self.filters.iter().all(|f| f.passes(read))
    }

    pub fn retain(&self, reads: &mut Vec<AlignedRead>) {
        reads.retain(|read| self.passes(read));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reads::tests::mock_read;

    #[test]
    fn test_min_mapping_quality() {
        let read = mock_read("chr1", 0, b"ACGT", 30);
        assert!(ReadFilter::MinMappingQuality(60).passes(&read));
        assert!(!ReadFilter::MinMappingQuality(61).passes(&read));
    }

    #[test]
    fn test_good_base_fraction() {
        let mut read = mock_read("chr1", 0, b"ACGT", 30);
        read.base_qualities_mut()[0] = 2;
        assert!(ReadFilter::HasGoodBaseFraction {
            quality: 20,
            fraction: 0.75
        }
        .passes(&read));
        assert!(!ReadFilter::HasGoodBaseFraction {
            quality: 20,
            fraction: 0.8
        }
        .passes(&read));
    }

    #[test]
    fn test_flag_filters() {
        let mut read = mock_read("chr1", 0, b"ACGT", 30);
        assert!(ReadFilters::standard(20).passes(&read));
        read.flags_mut().duplicate = true;
        assert!(!ReadFilters::standard(20).passes(&read));
    }

    #[test]
    fn test_length_bounds() {
        let read = mock_read("chr1", 0, b"ACGT", 30);
        assert!(ReadFilter::MinLength(4).passes(&read));
        assert!(!ReadFilter::MinLength(5).passes(&read));
        assert!(ReadFilter::MaxLength(4).passes(&read));
        assert!(!ReadFilter::MaxLength(3).passes(&read));
    }
}
