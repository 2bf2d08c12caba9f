//! Pair-HMM for read-to-haplotype alignment likelihoods.
//!
//! Match/insert/delete states with affine gap penalties, semiglobal in the
//! haplotype (free start and end gaps), full consumption of the read. All
//! arithmetic is in log space.

use bio::stats::{LogProb, PHREDProb, Prob};

lazy_static! {
    /// Flat emission for bases aligned to inactive flank columns: flank
    /// errors carry their own error mass and must not differentiate
    /// haplotypes.
    static ref PROB_FLANK_EMISSION: LogProb = LogProb::from(Prob(0.25));
    static ref PROB_INSERTION_EMISSION: LogProb = LogProb::from(Prob(0.25));
}

#[derive(Debug, Clone, Copy)]
pub struct GapParams {
    pub prob_gap_open: LogProb,
    pub prob_gap_extend: LogProb,
}

impl Default for GapParams {
    fn default() -> Self {
        // Illumina-like indel error rates
        GapParams {
            prob_gap_open: LogProb::from(PHREDProb(45.0)),
            prob_gap_extend: LogProb::from(PHREDProb(10.0)),
        }
    }
}

/// Lengths (in haplotype-local coordinates) of the inactive prefix and
/// suffix of the haplotype sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlankClearance {
    pub left: usize,
    pub right: usize,
}

pub struct PairHmm {
    gap: GapParams,
    prob_no_gap: LogProb,
    prob_gap_close: LogProb,
    // rolling DP rows, reused across calls
    match_rows: [Vec<LogProb>; 2],
    insert_rows: [Vec<LogProb>; 2],
    delete_rows: [Vec<LogProb>; 2],
}

impl PairHmm {
    pub fn new(gap: GapParams) -> Self {
        let prob_no_gap = LogProb(*gap.prob_gap_open)
            .ln_add_exp(LogProb(*gap.prob_gap_open))
            .ln_one_minus_exp();
        let prob_gap_close = gap.prob_gap_extend.ln_one_minus_exp();
        PairHmm {
            gap,
            prob_no_gap,
            prob_gap_close,
            match_rows: [Vec::new(), Vec::new()],
            insert_rows: [Vec::new(), Vec::new()],
            delete_rows: [Vec::new(), Vec::new()],
        }
    }

    /// Log-likelihood of observing `read` given `haplotype`.
    pub fn likelihood(
        &mut self,
        haplotype: &[u8],
        read: &[u8],
        base_qualities: &[u8],
        flanks: FlankClearance,
    ) -> LogProb {
        debug_assert_eq!(read.len(), base_qualities.len());
        let n = haplotype.len();
        let m = read.len();
        if m == 0 || n == 0 {
            return LogProb::ln_one();
        }
        for row in 0..2 {
            self.match_rows[row].clear();
            self.match_rows[row].resize(n + 1, LogProb::ln_zero());
            self.insert_rows[row].clear();
            self.insert_rows[row].resize(n + 1, LogProb::ln_zero());
            self.delete_rows[row].clear();
            self.delete_rows[row].resize(n + 1, LogProb::ln_zero());
        }
        // virtual row 0: the empty read prefix may start at any haplotype
        // offset for free (semiglobal alignment)
        for j in 0..=n {
            self.match_rows[0][j] = LogProb::ln_one();
        }
        for i in 1..=m {
            let (prev, curr) = ((i - 1) % 2, i % 2);
            self.match_rows[curr][0] = LogProb::ln_zero();
            self.insert_rows[curr][0] = if i == 1 {
                self.gap.prob_gap_open + *PROB_INSERTION_EMISSION
            } else {
                self.insert_rows[prev][0] + self.gap.prob_gap_extend + *PROB_INSERTION_EMISSION
            };
            self.delete_rows[curr][0] = LogProb::ln_zero();
            for j in 1..=n {
                let emission = self.emission(haplotype, read, base_qualities, flanks, i, j);
                let match_score = emission
                    + (self.match_rows[prev][j - 1] + self.prob_no_gap)
                        .ln_add_exp(self.insert_rows[prev][j - 1] + self.prob_gap_close)
                        .ln_add_exp(self.delete_rows[prev][j - 1] + self.prob_gap_close);
                self.match_rows[curr][j] = match_score;
                self.insert_rows[curr][j] = *PROB_INSERTION_EMISSION
                    + (self.match_rows[prev][j] + self.gap.prob_gap_open)
                        .ln_add_exp(self.insert_rows[prev][j] + self.gap.prob_gap_extend);
                self.delete_rows[curr][j] = (self.match_rows[curr][j - 1]
                    + self.gap.prob_gap_open)
                    .ln_add_exp(self.delete_rows[curr][j - 1] + self.gap.prob_gap_extend);
            }
        }
        // free end gap: the read may end anywhere on the haplotype
        let last = m % 2;
        let mut terminals = Vec::with_capacity(2 * (n + 1));
        for j in 0..=n {
            terminals.push(self.match_rows[last][j]);
            terminals.push(self.insert_rows[last][j]);
        }
        let result = LogProb::ln_sum_exp(&terminals);
        debug_assert!(!result.is_nan());
        if *result > 0.0 {
            LogProb::ln_one()
        } else {
            result
        }
    }

    fn emission(
        &self,
        haplotype: &[u8],
        read: &[u8],
        base_qualities: &[u8],
        flanks: FlankClearance,
        i: usize,
        j: usize,
    ) -> LogProb {
        let in_flank = j - 1 < flanks.left || j - 1 >= haplotype.len() - flanks.right.min(haplotype.len());
        if in_flank {
            return *PROB_FLANK_EMISSION;
        }
        let miscall = LogProb::from(PHREDProb(f64::from(base_qualities[i - 1])));
        if read[i - 1].eq_ignore_ascii_case(&haplotype[j - 1]) {
            miscall.ln_one_minus_exp()
        } else {
            miscall + LogProb(-(3f64.ln()))
        }
    }
}

impl Default for PairHmm {
    fn default() -> Self {
        PairHmm::new(GapParams::default())
    }
}
