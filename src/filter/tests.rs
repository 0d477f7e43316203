//! Membership Filter Tests
//!
//! ## Test Scopes
//! - **Soundness**: trained items always test positive.
//! - **Accuracy**: observed false-positive rate stays near the configured target.
//! - **Sizing**: parameters follow the analytic formulas and reject bad input.
//! - **Distribution**: encoded filters survive the trip to a client and reject corrupt bytes.

#[cfg(test)]
mod tests {
    use crate::filter::{FilterError, MembershipFilter};

    fn false_positive_rate(filter: &MembershipFilter, samples: usize) -> f64 {
        let hits = (0..samples)
            .filter(|i| filter.test(&format!("untrained-{}-{}", i, i * 31)))
            .count();
        hits as f64 / samples as f64
    }

    // ============================================================
    // SOUNDNESS
    // ============================================================

    #[test]
    fn test_small_filter_scenario() {
        let mut filter = MembershipFilter::with_rate(3, 0.05).unwrap();
        for item in ["a", "b", "c"] {
            filter.train(item);
        }

        for item in ["a", "b", "c"] {
            assert!(filter.test(item), "trained item {} must test positive", item);
        }

        let observed = false_positive_rate(&filter, 100_000);
        assert!(observed <= 0.08, "observed false positive rate {}", observed);
        assert_eq!(filter.len(), 3);
    }

    #[test]
    fn test_no_false_negatives_at_load() {
        let mut filter = MembershipFilter::with_rate(20_000, 0.01).unwrap();
        for i in 0..20_000 {
            filter.train(&format!("record_{}", i));
        }

        for i in 0..20_000 {
            assert!(filter.test(&format!("record_{}", i)));
        }
    }

    #[test]
    fn test_empty_filter_rejects_everything() {
        let filter = MembershipFilter::with_rate(1000, 0.01).unwrap();
        assert!(filter.is_empty());
        assert!(!filter.test("a"));
        assert!(!filter.test(""));
    }

    // ============================================================
    // ACCURACY
    // ============================================================

    #[test]
    fn test_false_positive_rate_near_target() {
        let mut filter = MembershipFilter::with_rate(10_000, 0.01).unwrap();
        for i in 0..10_000 {
            filter.train(&format!("member-{}", i));
        }

        let observed = false_positive_rate(&filter, 100_000);
        assert!(observed < 0.015, "observed false positive rate {}", observed);
        assert!(filter.estimated_false_positive_rate() <= 0.0105);
    }

    // ============================================================
    // SIZING
    // ============================================================

    #[test]
    fn test_sizing_follows_formula() {
        let filter = MembershipFilter::with_rate(10_000, 0.01).unwrap();

        // -n ln p / ln²2 ≈ 95851 bits, rounded up to 1498 words.
        assert_eq!(filter.bit_len(), 95_872);
        assert_eq!(filter.hash_count(), 7);
        assert_eq!(filter.bit_len() % 64, 0);
    }

    #[test]
    fn test_zero_expected_records_is_usable() {
        let mut filter = MembershipFilter::with_rate(0, 0.1).unwrap();
        filter.train("only");
        assert!(filter.test("only"));
        assert!(filter.bit_len() >= 64);
    }

    #[test]
    fn test_invalid_rate_is_rejected() {
        for rate in [0.0, 1.0, -0.5, 2.0, f64::NAN] {
            let result = MembershipFilter::with_rate(100, rate);
            assert!(matches!(result, Err(FilterError::InvalidParameters(_))), "rate {}", rate);
        }
    }

    // ============================================================
    // DISTRIBUTION
    // ============================================================

    #[test]
    fn test_encoded_filter_answers_identically() {
        let mut filter = MembershipFilter::with_rate(500, 0.02).unwrap();
        for i in 0..500 {
            filter.train(&format!("item{}", i));
        }

        let bytes = filter.to_bytes().unwrap();
        let restored = MembershipFilter::from_bytes(&bytes).unwrap();

        assert_eq!(restored, filter);
        for i in 0..2000 {
            let item = format!("item{}", i);
            assert_eq!(restored.test(&item), filter.test(&item));
        }
    }

    #[test]
    fn test_corrupt_bytes_are_rejected() {
        let filter = MembershipFilter::with_rate(10, 0.1).unwrap();
        let bytes = filter.to_bytes().unwrap();

        assert!(MembershipFilter::from_bytes(&bytes[..bytes.len() / 2]).is_err());
        assert!(MembershipFilter::from_bytes(&[]).is_err());

        let mut bad_version = bytes.clone();
        bad_version[0] = 99;
        assert!(matches!(
            MembershipFilter::from_bytes(&bad_version),
            Err(FilterError::Corrupt(_))
        ));
    }
}
