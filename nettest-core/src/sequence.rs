//! Test-flow sequence numbers
//!
//! Senders stamp every test-flow frame with a 32-bit sequence number that
//! wraps around. Ordering is only meaningful modulo 2^32, so comparisons go
//! through a signed distance instead of plain integer ordering.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};

/// Sequence number with 32-bit wraparound semantics
///
/// Two sequence numbers compare by the shortest signed distance between them,
/// so `u32::MAX` is "before" `0`.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct SeqNumber(u32);

impl SeqNumber {
    /// Create a new sequence number
    #[inline]
    pub const fn new(value: u32) -> Self {
        SeqNumber(value)
    }

    /// Get the raw sequence number value
    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Get the next sequence number
    #[inline]
    pub const fn next(self) -> Self {
        SeqNumber(self.0.wrapping_add(1))
    }

    /// Signed distance from this sequence number to `other`
    ///
    /// Positive values mean `other` is ahead of `self`. The result is the
    /// shortest way around the 32-bit circle.
    #[inline]
    pub const fn distance_to(self, other: SeqNumber) -> i32 {
        other.0.wrapping_sub(self.0) as i32
    }

    /// Check if this sequence number is before `other`
    #[inline]
    pub const fn lt(self, other: SeqNumber) -> bool {
        self.distance_to(other) > 0
    }

    /// Check if this sequence number is after `other`
    #[inline]
    pub const fn gt(self, other: SeqNumber) -> bool {
        self.distance_to(other) < 0
    }
}

impl fmt::Debug for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SeqNumber({})", self.0)
    }
}

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SeqNumber {
    fn from(value: u32) -> Self {
        SeqNumber(value)
    }
}

impl From<SeqNumber> for u32 {
    fn from(seq: SeqNumber) -> u32 {
        seq.0
    }
}

impl Add<u32> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: u32) -> SeqNumber {
        SeqNumber(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u32> for SeqNumber {
    fn add_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl Sub<u32> for SeqNumber {
    type Output = SeqNumber;

    fn sub(self, rhs: u32) -> SeqNumber {
        SeqNumber(self.0.wrapping_sub(rhs))
    }
}

impl Sub for SeqNumber {
    type Output = i32;

    /// Signed distance between two sequence numbers
    fn sub(self, rhs: SeqNumber) -> i32 {
        rhs.distance_to(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_next_wraparound() {
        let seq = SeqNumber::new(u32::MAX);
        assert_eq!(seq.next().as_raw(), 0);
    }

    #[test]
    fn test_distance_simple() {
        let a = SeqNumber::new(100);
        let b = SeqNumber::new(200);
        assert_eq!(a.distance_to(b), 100);
        assert_eq!(b.distance_to(a), -100);
    }

    #[test]
    fn test_distance_wraparound() {
        let a = SeqNumber::new(u32::MAX - 10);
        let b = SeqNumber::new(10);
        assert_eq!(a.distance_to(b), 21);
        assert_eq!(b.distance_to(a), -21);
    }

    #[test]
    fn test_comparison_wraparound() {
        let a = SeqNumber::new(u32::MAX - 10);
        let b = SeqNumber::new(10);

        assert!(a.lt(b));
        assert!(b.gt(a));
        assert!(!a.lt(a));
    }

    #[test]
    fn test_arithmetic() {
        let seq = SeqNumber::new(u32::MAX - 10);
        assert_eq!((seq + 20).as_raw(), 9);
        assert_eq!((SeqNumber::new(10) - 20).as_raw(), u32::MAX - 9);
        assert_eq!(SeqNumber::new(200) - SeqNumber::new(100), 100);

        let mut seq = SeqNumber::new(7);
        seq += 3;
        assert_eq!(seq.as_raw(), 10);
    }

    proptest! {
        #[test]
        fn prop_distance_survives_wraparound(raw in any::<u32>(), d in 1u32..=i32::MAX as u32) {
            let a = SeqNumber::new(raw);
            let b = a + d;
            prop_assert_eq!(a.distance_to(b), d as i32);
            prop_assert!(a.lt(b));
            prop_assert!(b.gt(a));
        }
    }
}
