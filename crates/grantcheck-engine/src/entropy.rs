//! Integer-only empirical entropy estimation for captured token values.
//!
//! The state-entropy and user-code advisories need a guessability estimate
//! for a single observed string (`state`, `user_code`). Floating point would
//! make rule outcomes platform-sensitive, so everything here is integer
//! arithmetic in millionths of bits: `H(X) = -Σ p(x) · log₂(p(x))` over the
//! value's byte histogram, with fractional log₂ from iterated squaring.
//!
//! An empirical estimate from one short sample undershoots the generator's
//! true entropy, which is why the consuming rules are advisories with
//! thresholds well below the BCP recommendations, not hard failures.

use std::collections::BTreeMap;

const MILLION: i64 = 1_000_000;

/// Below this many observed bytes the estimate is meaningless; report zero.
const MIN_SAMPLES: u64 = 2;

// ---------------------------------------------------------------------------
// ByteEntropy
// ---------------------------------------------------------------------------

/// Byte-frequency histogram of one observed value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ByteEntropy {
    frequencies: BTreeMap<u8, u64>,
    total: u64,
    distinct: usize,
}

impl ByteEntropy {
    pub fn of(value: &str) -> Self {
        let mut est = Self::default();
        for b in value.bytes() {
            est.observe(b);
        }
        est
    }

    pub fn observe(&mut self, byte: u8) {
        let entry = self.frequencies.entry(byte).or_insert(0);
        if *entry == 0 {
            self.distinct += 1;
        }
        *entry += 1;
        self.total += 1;
    }

    pub fn total_bytes(&self) -> u64 {
        self.total
    }

    pub fn distinct_bytes(&self) -> usize {
        self.distinct
    }

    /// Empirical per-byte entropy in millionths of bits.
    ///
    /// `H(X) = log₂(n) - (1/n) · Σ cᵢ · log₂(cᵢ)`
    pub fn per_byte_millibits(&self) -> i64 {
        if self.total < MIN_SAMPLES || self.distinct <= 1 {
            return 0;
        }
        let n = self.total;
        let log2_n = integer_log2_millionths(n);

        let mut sum_ci_log2_ci: i128 = 0;
        for &count in self.frequencies.values() {
            if count > 1 {
                sum_ci_log2_ci += count as i128 * integer_log2_millionths(count) as i128;
            }
        }

        let entropy = log2_n as i128 - sum_ci_log2_ci / n as i128;
        entropy.max(0) as i64
    }

    /// Estimated total entropy of the whole value:
    /// `len · H(X)` in millionths of bits.
    pub fn total_millibits(&self) -> i64 {
        let total = self.total as i128 * self.per_byte_millibits() as i128;
        total.min(i64::MAX as i128) as i64
    }

    /// Ceiling for this alphabet: `log₂(distinct)` in millionths of bits.
    pub fn max_per_byte_millibits(&self) -> i64 {
        if self.distinct <= 1 {
            return 0;
        }
        integer_log2_millionths(self.distinct as u64)
    }
}

/// Estimated total entropy of `value` in millionths of bits.
pub fn estimated_millibits(value: &str) -> i64 {
    ByteEntropy::of(value).total_millibits()
}

// ---------------------------------------------------------------------------
// Integer math
// ---------------------------------------------------------------------------

/// Integer log₂(n) in millionths, using iterated squaring.
///
/// Decomposes n = 2^k · m with 1 ≤ m < 2, then extracts fractional bits of
/// log₂(m): square the mantissa, and if it reached 2 the next bit is 1.
/// About 20 fractional bits of precision.
fn integer_log2_millionths(n: u64) -> i64 {
    if n <= 1 {
        return 0;
    }
    let bits = 64 - n.leading_zeros();
    let integer_part = (bits - 1) as i64 * MILLION;

    let power_of_two = 1u64 << (bits - 1);
    if n == power_of_two {
        return integer_part;
    }

    // Mantissa scaled by 2^32, normalized into [2^32, 2^33).
    let mut mantissa: u64 = if bits - 1 <= 32 {
        n << (32 - (bits - 1))
    } else {
        n >> ((bits - 1) - 32)
    };
    let threshold: u64 = 1u64 << (32 + 1);

    let mut frac: i64 = 0;
    let mut bit_value: i64 = 500_000;

    for _ in 0..20 {
        mantissa = ((mantissa as u128 * mantissa as u128) >> 32) as u64;
        if mantissa >= threshold {
            frac += bit_value;
            mantissa >>= 1;
        }
        bit_value /= 2;
        if bit_value == 0 {
            break;
        }
    }

    integer_part + frac
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_symbol_uniform_value_has_one_bit_per_byte() {
        // a:2, b:2 over n=4 is exactly 1 bit per byte.
        let est = ByteEntropy::of("abab");
        assert_eq!(est.per_byte_millibits(), MILLION);
        assert_eq!(est.total_millibits(), 4 * MILLION);
    }

    #[test]
    fn constant_value_has_zero_entropy() {
        let est = ByteEntropy::of("aaaaaaaa");
        assert_eq!(est.per_byte_millibits(), 0);
        assert_eq!(est.total_millibits(), 0);
    }

    #[test]
    fn short_and_empty_values_report_zero() {
        assert_eq!(estimated_millibits(""), 0);
        assert_eq!(estimated_millibits("a"), 0);
    }

    #[test]
    fn all_distinct_bytes_approach_log2_len() {
        // Six distinct bytes, one each: H = log2(6) ≈ 2.584963 bits.
        let est = ByteEntropy::of("abc123");
        let h = est.per_byte_millibits();
        assert!((2_584_000..=2_586_000).contains(&h), "H = {h}");
        assert_eq!(est.max_per_byte_millibits(), h);
        // Total ≈ 15.5 bits: well under any realistic CSRF-token target.
        assert!(est.total_millibits() < 16 * MILLION);
    }

    #[test]
    fn random_looking_state_scores_far_above_a_weak_one() {
        let strong = estimated_millibits("n-0S6_WzA2Mj_tKQ7vnZ");
        let weak = estimated_millibits("abc123");
        assert!(strong > 2 * weak, "strong = {strong}, weak = {weak}");
    }

    #[test]
    fn log2_is_exact_on_powers_of_two() {
        // Exercised through the public surface: 2^k distinct uniform bytes.
        let est = ByteEntropy::of("abcdefgh");
        assert_eq!(est.per_byte_millibits(), 3 * MILLION);

        let est16 = ByteEntropy::of("0123456789abcdef");
        assert_eq!(est16.per_byte_millibits(), 4 * MILLION);
    }

    #[test]
    fn histogram_accumulates_across_observe_calls() {
        let mut est = ByteEntropy::default();
        for b in b"WDJB-MJHT" {
            est.observe(*b);
        }
        assert_eq!(est.total_bytes(), 9);
        assert_eq!(est.distinct_bytes(), 8);
        assert!(est.per_byte_millibits() > 2_500_000);
    }
}
