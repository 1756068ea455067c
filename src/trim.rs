//! Bounded-growth policy shared by the raw buffer and tracks.
//!
//! When a container grows past `capacity`, the oldest part is dropped in one go so
//! that the next trim is far away. The retained length is
//! `ceil(capacity * (1 - fraction))`, clamped to `1..=capacity`, which means at
//! least one entry is always removed once capacity is exceeded, even for a
//! fraction of zero.

/// Capacity and trim fraction for a bounded container.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrimPolicy {
    capacity: usize,
    fraction: f64,
}

impl TrimPolicy {
    /// Create a policy. `capacity` is raised to 1 and `fraction` clamped to `[0, 1)`.
    pub fn new(capacity: usize, fraction: f64) -> Self {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 0.999_999)
        } else {
            0.5
        };
        Self {
            capacity: capacity.max(1),
            fraction,
        }
    }

    /// Maximum number of entries before a trim happens.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Configured fraction of the capacity to drop.
    pub fn fraction(&self) -> f64 {
        self.fraction
    }

    /// Length kept after a trim.
    pub fn retained_len(&self) -> usize {
        // Absorb float noise such as 10 * 0.3 = 3.0000000000000004.
        let keep = (self.capacity as f64 * (1.0 - self.fraction) - 1e-9).ceil() as usize;
        keep.clamp(1, self.capacity)
    }

    /// Number of oldest entries to drop from a container of length `len`.
    ///
    /// Zero while `len <= capacity`.
    pub fn excess(&self, len: usize) -> usize {
        if len <= self.capacity {
            return 0;
        }
        len - self.retained_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_of_twenty() {
        let policy = TrimPolicy::new(20, 0.5);
        assert_eq!(policy.excess(20), 0);
        assert_eq!(policy.excess(21), 11);
        assert_eq!(policy.retained_len(), 10);
    }

    #[test]
    fn retained_rounds_up() {
        let policy = TrimPolicy::new(7, 0.5);
        assert_eq!(policy.retained_len(), 4);
        assert_eq!(policy.excess(8), 4);
    }

    #[test]
    fn zero_fraction_still_removes_one() {
        let policy = TrimPolicy::new(10, 0.0);
        assert_eq!(policy.retained_len(), 10);
        assert_eq!(policy.excess(11), 1);
    }

    #[test]
    fn float_noise_does_not_round_up() {
        let policy = TrimPolicy::new(10, 0.7);
        assert_eq!(policy.retained_len(), 3);
    }

    #[test]
    fn near_one_keeps_newest() {
        let policy = TrimPolicy::new(10, 0.99);
        assert_eq!(policy.retained_len(), 1);
        assert_eq!(policy.excess(11), 10);
    }

    #[test]
    fn never_exceeds_capacity_after_trim() {
        for capacity in 1..50 {
            for step in 0..10 {
                let policy = TrimPolicy::new(capacity, step as f64 / 10.0);
                let after = capacity + 1 - policy.excess(capacity + 1);
                assert!(after <= capacity);
                assert!(after >= 1);
            }
        }
    }
}
