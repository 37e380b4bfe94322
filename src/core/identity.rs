//! Site identifiers and per-site sequence numbers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque, globally unique identifier for a replication site.
///
/// Carries no structure beyond equality, ordering, and hashing; allocation
/// of unique values is the caller's concern.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(u32);

impl SiteId {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SiteId({})", self.0)
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sequence number local to a site.
///
/// Starts at [`SeqNo::ZERO`]; [`SeqNo::next`] saturates instead of wrapping
/// so a sequence never collapses back below previously issued numbers.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeqNo(u32);

impl SeqNo {
    pub const ZERO: SeqNo = SeqNo(0);

    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub const fn next(self) -> SeqNo {
        SeqNo(self.0.saturating_add(1))
    }
}

impl fmt::Debug for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SeqNo({})", self.0)
    }
}

impl fmt::Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique event identifier.
///
/// The derived lexicographic order (sequence number first, then site) is the
/// deterministic global total order used by the log fold; it is compatible
/// with every site's local sequence.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId {
    pub seqno: SeqNo,
    pub site: SiteId,
}

impl EventId {
    pub const fn new(seqno: SeqNo, site: SiteId) -> Self {
        Self { seqno, site }
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({}@{})", self.seqno, self.site)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.seqno, self.site)
    }
}

/// An event body tagged with its identifier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventValue<T> {
    pub id: EventId,
    pub body: T,
}

impl<T> EventValue<T> {
    pub fn new(id: EventId, body: T) -> Self {
        Self { id, body }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seqno_next_saturates() {
        assert_eq!(SeqNo::ZERO.next(), SeqNo::new(1));
        let max = SeqNo::new(u32::MAX);
        assert_eq!(max.next(), max);
    }

    #[test]
    fn event_id_orders_by_seqno_then_site() {
        let early_high_site = EventId::new(SeqNo::new(0), SiteId::new(9));
        let late_low_site = EventId::new(SeqNo::new(1), SiteId::new(1));
        assert!(early_high_site < late_low_site);

        let same_seq_low_site = EventId::new(SeqNo::new(1), SiteId::new(0));
        assert!(same_seq_low_site < late_low_site);
    }

    #[test]
    fn display_formats_are_compact() {
        let id = EventId::new(SeqNo::new(3), SiteId::new(7));
        assert_eq!(id.to_string(), "3@7");
        assert_eq!(format!("{id:?}"), "EventId(3@7)");
    }
}
