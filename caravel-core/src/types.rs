//! Strongly-typed counters for Raft consensus.
//!
//! Explicit wrapper types prevent bugs from mixing up a term number with a
//! log index. Both are 64-bit and zero-cost.

use std::fmt;

/// Macro to generate strongly-typed u64 wrappers.
///
/// Each wrapper provides:
/// - Type safety (a `Term` is not a `LogIndex`)
/// - Debug/Display formatting
/// - Zero-cost abstraction (same layout as a raw u64)
macro_rules! define_counter {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// The zero value, meaning "none yet" (terms and indexes start at 1).
            pub const ZERO: Self = Self(0);

            /// Creates a new value from a raw u64.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw u64 value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Returns the next value in sequence.
            ///
            /// # Panics
            /// Panics on overflow.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                assert!(self.0 < u64::MAX, "counter overflow");
                Self(self.0 + 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(value: $name) -> Self {
                value.get()
            }
        }
    };
}

define_counter!(Term, "term", "Raft term: a monotonically increasing logical clock partitioning time into at-most-one-leader epochs.");
define_counter!(LogIndex, "idx", "Position of an entry in the replicated log. The first entry has index 1; 0 means \"no entry\".");
