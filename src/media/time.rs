//! Timestamps and rational numbers for track timing

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A rational number (frame rates, aspect ratios, time bases)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rational {
    pub num: i64,
    pub den: i64,
}

impl Rational {
    pub const fn new(num: i64, den: i64) -> Self {
        Self { num, den }
    }

    /// Returns `None` when the denominator is zero
    pub fn to_f64(self) -> Option<f64> {
        if self.den == 0 {
            None
        } else {
            Some(self.num as f64 / self.den as f64)
        }
    }

    pub fn is_valid(self) -> bool {
        self.num > 0 && self.den > 0
    }

    /// The reciprocal (frame rate → frame duration)
    pub fn invert(self) -> Self {
        Self {
            num: self.den,
            den: self.num,
        }
    }
}

impl Default for Rational {
    fn default() -> Self {
        Rational::new(1, 1)
    }
}

impl std::fmt::Display for Rational {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.num, self.den)
    }
}

/// A media timestamp: `value / timescale` seconds
///
/// Mirrors container time representation, where each track carries its own
/// time scale. Comparison is exact across different time scales.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MediaTime {
    pub value: i64,
    pub timescale: i32,
}

impl MediaTime {
    pub const fn new(value: i64, timescale: i32) -> Self {
        Self { value, timescale }
    }

    pub const fn zero(timescale: i32) -> Self {
        Self {
            value: 0,
            timescale,
        }
    }

    /// Convert to seconds (0.0 for an invalid time scale)
    pub fn seconds(&self) -> f64 {
        if self.timescale <= 0 {
            return 0.0;
        }
        self.value as f64 / self.timescale as f64
    }

    /// Express this time in another time scale, rounding to nearest
    pub fn rescale(&self, timescale: i32) -> MediaTime {
        MediaTime {
            value: rescale_value(self.value, self.timescale, timescale),
            timescale,
        }
    }

    pub fn add(&self, other: MediaTime) -> MediaTime {
        let other = other.rescale(self.timescale);
        MediaTime {
            value: self.value + other.value,
            timescale: self.timescale,
        }
    }
}

/// Rescale `value` from time scale `from` to time scale `to`, rounding to nearest
pub fn rescale_value(value: i64, from: i32, to: i32) -> i64 {
    if from == to || from <= 0 || to <= 0 {
        return value;
    }
    let scaled = value as i128 * to as i128;
    let from = from as i128;
    let half = from / 2;
    let rounded = if scaled >= 0 {
        (scaled + half) / from
    } else {
        (scaled - half) / from
    };
    rounded as i64
}

impl PartialEq for MediaTime {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MediaTime {}

impl PartialOrd for MediaTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MediaTime {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = self.value as i128 * other.timescale as i128;
        let rhs = other.value as i128 * self.timescale as i128;
        lhs.cmp(&rhs)
    }
}

impl std::fmt::Display for MediaTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} ({:.3}s)", self.value, self.timescale, self.seconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rescale_rounds_to_nearest() {
        // 1001/30000 s expressed in 90kHz ticks
        assert_eq!(rescale_value(1001, 30000, 90000), 3003);
        assert_eq!(rescale_value(1, 3, 2), 1);
        assert_eq!(rescale_value(-1, 3, 2), -1);
        assert_eq!(rescale_value(42, 600, 600), 42);
    }

    #[test]
    fn test_ordering_across_timescales() {
        let a = MediaTime::new(1, 2);
        let b = MediaTime::new(600, 1200);
        let c = MediaTime::new(601, 1200);
        assert_eq!(a, b);
        assert!(c > a);
        assert!(MediaTime::zero(90000) < c);
    }

    #[test]
    fn test_seconds_and_add() {
        let t = MediaTime::new(3003, 90000).add(MediaTime::new(1001, 30000));
        assert_eq!(t.value, 6006);
        assert!((t.seconds() - 0.0667333).abs() < 1e-6);
        assert_eq!(MediaTime::new(5, 0).seconds(), 0.0);
    }

    #[test]
    fn test_rational_helpers() {
        let fps = Rational::new(30000, 1001);
        assert!(fps.is_valid());
        assert_eq!(fps.invert(), Rational::new(1001, 30000));
        assert!(Rational::new(1, 0).to_f64().is_none());
        assert_eq!(fps.to_string(), "30000:1001");
    }
}
