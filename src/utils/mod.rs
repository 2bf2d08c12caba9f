use bio::stats::{LogProb, PHREDProb, Prob};

pub mod metrics;
pub mod worker_pool;

pub const NUMERICAL_EPSILON: f64 = 1e-6;

lazy_static! {
    pub static ref PROB_05: LogProb = LogProb::from(Prob(0.5));
    pub static ref PROB_09: LogProb = LogProb::from(Prob(0.9));
    pub static ref PROB_095: LogProb = LogProb::from(Prob(0.95));
}

/// PHRED score of the complement of the given log probability, i.e. the
/// confidence that the event described by `prob_false` did not happen.
pub fn log_prob_false_to_phred(prob_false: LogProb) -> f64 {
    // normalisation overshoot can push the mass slightly above one
    let capped = if *prob_false > 0.0 {
        LogProb::ln_one()
    } else {
        prob_false
    };
    *PHREDProb::from(capped)
}

/// PHRED score for a linear-space error probability.
pub fn prob_false_to_phred(prob_false: f64) -> f64 {
    log_prob_false_to_phred(LogProb::from(Prob(prob_false.clamp(0.0, 1.0))))
}

/// Inverse of [`log_prob_false_to_phred`].
pub fn phred_to_log_prob_false(phred: f64) -> LogProb {
    LogProb::from(PHREDProb(phred))
}

/// PHRED-scaled base quality to the log probability of a miscall.
pub fn prob_base_miscall(base_quality: u8) -> LogProb {
    LogProb::from(PHREDProb(f64::from(base_quality)))
}

/// Normalise joint log probabilities in place, returning the normalisation
/// constant (the log evidence). Fails when the evidence is not finite.
pub fn normalise_log_probs(log_probs: &mut [LogProb]) -> Option<LogProb> {
    let evidence = LogProb::ln_sum_exp(log_probs);
    if evidence.is_nan() || *evidence == f64::NEG_INFINITY {
        return None;
    }
    for lp in log_probs.iter_mut() {
        *lp = LogProb(**lp - *evidence);
    }
    Some(evidence)
}

/// Number of multisets of size `k` drawn from `n` elements.
pub fn num_multisets(n: usize, k: usize) -> usize {
    if k == 0 {
        return 1;
    }
    if n == 0 {
        return 0;
    }
    // C(n + k - 1, k), computed without overflow for the ranges we see
    let mut result: u128 = 1;
    for i in 0..k {
        result = result * (n + i) as u128 / (i + 1) as u128;
    }
    result.min(usize::MAX as u128) as usize
}
