//! # Interval operations for Range
//!
//! This module exports the `Interval` trait that extends the core
//! `Range` type with the interval operations the resource checks need.

use std::ops::Range;

/// A simple trait for intervals math.
///
/// We use this to extend [Range] with bounds checking for BAR register
/// accesses and DMA buffer accesses.
pub trait Interval: PartialEq {
    /// The underlying numerical type.
    type Element: Copy + Ord;

    /// Return the intersection of two intervals.
    fn intersection(&self, other: &Self) -> Self;

    /// Return true, if `other` is completely contained with the
    /// interval.
    fn contains_interval(&self, other: &Self) -> bool;
}

impl<T: Copy + Ord> Interval for Range<T> {
    type Element = T;

    fn intersection(&self, other: &Self) -> Self {
        self.start.max(other.start)..self.end.min(other.end)
    }

    fn contains_interval(&self, other: &Self) -> bool {
        self.intersection(other) == *other
    }
}
