//! Offset type for the persistent-memory heap
//!
//! This module provides the `PmemOffset` type used to identify record
//! positions in the persistent-memory heap. Offsets are byte distances from
//! the heap base; the all-ones value is reserved as the null sentinel.

use std::cmp::Ordering;
use std::fmt;

/// A position in the persistent-memory heap.
///
/// Durable records reference each other by offset rather than by address so
/// that linkage survives remapping of the heap at a different base address.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PmemOffset(u64);

impl PmemOffset {
    /// The null offset, meaning "no record".
    ///
    /// Zero is a valid heap position, so the sentinel is the all-ones value.
    pub const NULL: Self = Self(u64::MAX);

    /// Create an offset from a raw value
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw offset value
    #[inline]
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Check if this is the null offset
    #[inline]
    pub const fn is_null(&self) -> bool {
        self.0 == Self::NULL.0
    }

    /// Byte position `delta` bytes past this offset
    #[inline]
    pub const fn add(&self, delta: u64) -> Self {
        Self(self.0 + delta)
    }
}

impl Default for PmemOffset {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Debug for PmemOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "PmemOffset(NULL)")
        } else {
            write!(f, "PmemOffset({})", self.0)
        }
    }
}

impl fmt::Display for PmemOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl PartialOrd for PmemOffset {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PmemOffset {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl From<u64> for PmemOffset {
    #[inline]
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<PmemOffset> for u64 {
    #[inline]
    fn from(offset: PmemOffset) -> Self {
        offset.0
    }
}
