//! Sequence Number Handling
//!
//! Channel sequence numbers are 16-bit values that wrap around. This module
//! provides a wrapped sequence number type whose comparison and arithmetic
//! operations account for the wraparound, so ordering is preserved across the
//! wrap boundary.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};

/// Size of the sequence number space (16-bit)
pub const SEQ_SPACE: u32 = 1 << 16;

/// Sequence number with 16-bit wraparound semantics
///
/// Two sequence numbers are comparable only when they are less than half the
/// sequence space apart, which the reorder window guarantees.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct SeqNumber(u16);

impl SeqNumber {
    /// The zero sequence number, used to seed fresh channels
    pub const ZERO: SeqNumber = SeqNumber(0);

    /// Create a new sequence number
    #[inline]
    pub fn new(value: u16) -> Self {
        SeqNumber(value)
    }

    /// Get the raw sequence number value
    #[inline]
    pub fn as_raw(self) -> u16 {
        self.0
    }

    /// Increment the sequence number by 1
    #[inline]
    pub fn increment(&mut self) {
        self.0 = self.0.wrapping_add(1);
    }

    /// Get the next sequence number
    #[inline]
    pub fn next(self) -> Self {
        SeqNumber(self.0.wrapping_add(1))
    }

    /// Calculate the signed distance from this sequence number to another
    ///
    /// Positive values mean `other` is ahead of `self`, negative means it is
    /// behind. Wraparound is handled by the two's-complement cast.
    #[inline]
    pub fn distance_to(self, other: SeqNumber) -> i32 {
        other.0.wrapping_sub(self.0) as i16 as i32
    }

    /// Check if this sequence number is less than another (wrap-aware)
    #[inline]
    pub fn lt(self, other: SeqNumber) -> bool {
        self.distance_to(other) > 0
    }

    /// Check if this sequence number is less than or equal to another
    #[inline]
    pub fn le(self, other: SeqNumber) -> bool {
        self == other || self.lt(other)
    }

    /// Check if this sequence number is greater than another
    #[inline]
    pub fn gt(self, other: SeqNumber) -> bool {
        self.distance_to(other) < 0
    }

    /// Check if this sequence number is greater than or equal to another
    #[inline]
    pub fn ge(self, other: SeqNumber) -> bool {
        self == other || self.gt(other)
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

impl From<u16> for SeqNumber {
    fn from(value: u16) -> Self {
        SeqNumber(value)
    }
}

impl From<SeqNumber> for u16 {
    fn from(seq: SeqNumber) -> u16 {
        seq.0
    }
}

impl Add<u16> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: u16) -> SeqNumber {
        SeqNumber(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u16> for SeqNumber {
    fn add_assign(&mut self, rhs: u16) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl Sub for SeqNumber {
    type Output = i32;

    /// Calculate the signed distance between two sequence numbers
    fn sub(self, rhs: SeqNumber) -> i32 {
        rhs.distance_to(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new() {
        let seq = SeqNumber::new(100);
        assert_eq!(seq.as_raw(), 100);
    }

    #[test]
    fn test_increment() {
        let mut seq = SeqNumber::new(100);
        seq.increment();
        assert_eq!(seq.as_raw(), 101);
    }

    #[test]
    fn test_increment_wraparound() {
        let mut seq = SeqNumber::new(u16::MAX);
        seq.increment();
        assert_eq!(seq.as_raw(), 0);
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
        let a = SeqNumber::new(u16::MAX - 10);
        let b = SeqNumber::new(10);
        // b is 21 ahead of a (wrapping around)
        assert_eq!(a.distance_to(b), 21);
        assert_eq!(b.distance_to(a), -21);
    }

    #[test]
    fn test_comparison() {
        let a = SeqNumber::new(100);
        let b = SeqNumber::new(200);

        assert!(a.lt(b));
        assert!(a.le(b));
        assert!(b.gt(a));
        assert!(b.ge(a));
        assert!(a.le(a));
        assert!(a.ge(a));
    }

    #[test]
    fn test_comparison_wraparound() {
        let a = SeqNumber::new(u16::MAX - 10);
        let b = SeqNumber::new(10);

        assert!(a.lt(b));
        assert!(b.gt(a));
    }

    #[test]
    fn test_add_wraparound() {
        let seq = SeqNumber::new(u16::MAX - 10);
        let result = seq + 20;
        assert_eq!(result.as_raw(), 9);
    }

    #[test]
    fn test_sub_seqnumbers() {
        let a = SeqNumber::new(200);
        let b = SeqNumber::new(100);
        assert_eq!(a - b, 100);
        assert_eq!(b - a, -100);
    }
}
