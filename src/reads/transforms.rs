//! Read transforms applied after filtering and before candidate generation.
//!
//! Transforms only touch base qualities; the alignment itself is left
//! untouched so downstream coordinates stay valid. A masked base has
//! quality zero and is ignored by the candidate generators.

use serde::{Deserialize, Serialize};

use crate::reads::AlignedRead;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReadTransform {
    /// Clamp base qualities from above.
    CapBaseQualities(u8),
    /// Zero the qualities of soft-clipped prefix/suffix bases.
    MaskSoftClippedBases,
    /// Zero the qualities of bases read past the end of the template
    /// (adapter read-through, detected from the template length).
    MaskAdapters,
    /// Zero the qualities of the last `n` bases of every read.
    MaskTails(usize),
}

impl ReadTransform {
    pub fn apply(&self, read: &mut AlignedRead) {
        match self {
            ReadTransform::CapBaseQualities(cap) => {
                for q in read.base_qualities_mut().iter_mut() {
                    *q = (*q).min(*cap);
                }
            }
            ReadTransform::MaskSoftClippedBases => {
                let front = read.soft_clip_len(true);
                let back = read.soft_clip_len(false);
                let len = read.len();
                let qualities = read.base_qualities_mut();
                for q in qualities.iter_mut().take(front) {
                    *q = 0;
                }
                for q in qualities.iter_mut().skip(len.saturating_sub(back)) {
                    *q = 0;
                }
            }
            ReadTransform::MaskAdapters => {
                let template = read.template_length().unsigned_abs() as usize;
                let len = read.len();
                if read.flags().paired && template > 0 && template < len {
                    for q in read.base_qualities_mut().iter_mut().skip(template) {
                        *q = 0;
                    }
                }
            }
            ReadTransform::MaskTails(n) => {
                let len = read.len();
                for q in read
                    .base_qualities_mut()
                    .iter_mut()
                    .skip(len.saturating_sub(*n))
                {
                    *q = 0;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadTransforms {
    transforms: Vec<ReadTransform>,
}

impl ReadTransforms {
    pub fn new(transforms: Vec<ReadTransform>) -> Self {
        ReadTransforms { transforms }
    }

    pub fn standard() -> Self {
        ReadTransforms::new(vec![
            ReadTransform::MaskSoftClippedBases,
            ReadTransform::MaskAdapters,
        ])
    }

    pub fn apply(&self, reads: &mut [AlignedRead]) {
        for read in reads.iter_mut() {
            for transform in &self.transforms {
                transform.apply(read);
            }
        }
    }
}
