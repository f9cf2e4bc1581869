//! Process-unique identity tokens.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Process-unique, immutable identity token for a record or aggregate.
///
/// A `Uid` is assigned once at construction and used for registry
/// membership and back-reference lookup. It is never business identity —
/// that role belongs to the configured identifier attribute.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uid(Uuid);

impl Uid {
    /// Creates a uid from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Converts to the underlying UUID.
    #[must_use]
    pub fn to_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({})", self.0)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for Uid {
    fn from(uuid: Uuid) -> Self {
        Self::from_uuid(uuid)
    }
}

/// Factory for identity tokens.
///
/// Passed explicitly through the [`Context`](crate::Context) rather than
/// hidden behind a process-wide counter, so construction stays
/// deterministic and testable.
pub trait UidSource: Send + Sync {
    /// Produces the next identity token.
    fn next_uid(&self) -> Uid;
}

/// The default source: random UUIDv4 tokens.
#[derive(Debug, Default)]
pub struct RandomUids;

impl UidSource for RandomUids {
    fn next_uid(&self) -> Uid {
        Uid(Uuid::new_v4())
    }
}

/// A deterministic source producing sequential tokens. Intended for tests.
#[derive(Debug, Default)]
pub struct SequentialUids(AtomicU64);

impl SequentialUids {
    /// Creates a source starting at 1.
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }
}

impl UidSource for SequentialUids {
    fn next_uid(&self) -> Uid {
        let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        Uid(Uuid::from_u128(u128::from(n)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_uids_are_unique() {
        let source = RandomUids;
        assert_ne!(source.next_uid(), source.next_uid());
    }

    #[test]
    fn sequential_uids_are_deterministic() {
        let a = SequentialUids::new();
        let b = SequentialUids::new();
        assert_eq!(a.next_uid(), b.next_uid());
        assert_eq!(a.next_uid(), b.next_uid());
    }

    #[test]
    fn display() {
        let uid = Uid::from_uuid(Uuid::nil());
        assert_eq!(uid.to_string(), Uuid::nil().to_string());
    }
}
