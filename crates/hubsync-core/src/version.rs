//! Logical clock carried by every bundle.
//!
//! A [`BundleVersion`] is an `(incarnation, generation)` pair. The
//! incarnation changes only when a producer process restarts; the generation
//! counts observable mutations within one incarnation. Versions order
//! lexicographically, so a restarted producer always outranks everything its
//! previous incarnation emitted.
//!
//! The wire encoding is `"<incarnation>.<generation>"`.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Logical version of a bundle.
///
/// Field order matters: the derived `Ord` compares `incarnation` first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BundleVersion {
    /// Producer epoch; bumped once per producer start.
    pub incarnation: u64,
    /// Mutation counter within the incarnation.
    pub generation: u64,
}

/// Result of comparing two versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VersionOrdering {
    Older,
    Same,
    Newer,
}

impl BundleVersion {
    #[must_use]
    pub const fn new(incarnation: u64, generation: u64) -> Self {
        Self {
            incarnation,
            generation,
        }
    }

    /// Compare `self` against `other`, from the point of view of `self`.
    #[must_use]
    pub fn compare(&self, other: &Self) -> VersionOrdering {
        match self.cmp(other) {
            Ordering::Less => VersionOrdering::Older,
            Ordering::Equal => VersionOrdering::Same,
            Ordering::Greater => VersionOrdering::Newer,
        }
    }

    /// `true` iff `self` is strictly newer than `other`.
    #[must_use]
    pub fn newer_than(&self, other: &Self) -> bool {
        self.compare(other) == VersionOrdering::Newer
    }

    /// `true` when `self` is newer than `other`, or when there is nothing to
    /// compare against.
    #[must_use]
    pub fn newer_than_opt(&self, other: Option<&Self>) -> bool {
        other.is_none_or(|other| self.newer_than(other))
    }

    /// Advance the generation by one.
    pub const fn bump_generation(&mut self) {
        self.generation = self.generation.saturating_add(1);
    }
}

impl fmt::Display for BundleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.incarnation, self.generation)
    }
}

/// Error returned when a version string is not `<u64>.<u64>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionParseError {
    /// The unparsable input.
    pub raw: String,
}

impl fmt::Display for VersionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid bundle version '{}': expected '<incarnation>.<generation>'",
            self.raw
        )
    }
}

impl std::error::Error for VersionParseError {}

impl FromStr for BundleVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || VersionParseError { raw: s.to_string() };
        let (incarnation, generation) = s.split_once('.').ok_or_else(err)?;
        let incarnation = incarnation.parse::<u64>().map_err(|_| err())?;
        let generation = generation.parse::<u64>().map_err(|_| err())?;
        Ok(Self::new(incarnation, generation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incarnation_dominates_generation() {
        let restarted = BundleVersion::new(2, 0);
        let busy = BundleVersion::new(1, 900);
        assert!(restarted.newer_than(&busy));
        assert!(!busy.newer_than(&restarted));
        assert_eq!(busy.compare(&restarted), VersionOrdering::Older);
    }

    #[test]
    fn generation_orders_within_incarnation() {
        let a = BundleVersion::new(3, 4);
        let b = BundleVersion::new(3, 5);
        assert_eq!(b.compare(&a), VersionOrdering::Newer);
        assert_eq!(a.compare(&b), VersionOrdering::Older);
    }

    #[test]
    fn identical_pairs_are_same_not_newer() {
        let a = BundleVersion::new(7, 7);
        assert_eq!(a.compare(&a), VersionOrdering::Same);
        assert!(!a.newer_than(&a));
    }

    #[test]
    fn newer_than_nothing() {
        assert!(BundleVersion::default().newer_than_opt(None));
        let stored = BundleVersion::new(1, 1);
        assert!(!BundleVersion::new(1, 1).newer_than_opt(Some(&stored)));
    }

    #[test]
    fn wire_encoding() {
        let v = BundleVersion::new(12, 345);
        assert_eq!(v.to_string(), "12.345");
        assert_eq!("12.345".parse::<BundleVersion>(), Ok(v));
    }

    #[test]
    fn parse_rejects_malformed() {
        for raw in ["", "1", "1.", ".1", "a.b", "1.2.3", "-1.0"] {
            assert!(raw.parse::<BundleVersion>().is_err(), "accepted {raw:?}");
        }
    }

    #[test]
    fn bump_saturates() {
        let mut v = BundleVersion::new(0, u64::MAX);
        v.bump_generation();
        assert_eq!(v.generation, u64::MAX);
    }
}
