use crate::models::matching::Decision;

/// The threshold policy. Inclusive at the boundary; a NaN score never qualifies.
pub fn decide(score: f64, threshold: f64) -> Decision {
    if score >= threshold {
        Decision::Invited
    } else {
        Decision::Rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_is_inclusive() {
        assert_eq!(decide(0.80, 0.80), Decision::Invited);
        assert_eq!(decide(0.79999, 0.80), Decision::Rejected);
        assert_eq!(decide(1.0, 0.80), Decision::Invited);
    }

    #[test]
    fn test_sample_pairs() {
        assert_eq!(decide(0.85, 0.80), Decision::Invited);
        assert_eq!(decide(0.42, 0.80), Decision::Rejected);
    }

    #[test]
    fn test_nan_is_rejected() {
        assert_eq!(decide(f64::NAN, 0.80), Decision::Rejected);
        assert_eq!(decide(-1.0, -1.0), Decision::Invited);
    }
}
