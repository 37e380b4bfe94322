//! Site-partitioned ordered event store.

use std::cmp::Reverse;
use std::collections::btree_map;
use std::collections::{BTreeMap, BinaryHeap};
use std::iter::Peekable;

use super::{EventId, SeqNo, SiteId};

/// Append-only log of events partitioned by originating site.
///
/// Recorded bindings are never removed or rewritten: the first write for a
/// `(seqno, site)` key is authoritative and later writes for the same key
/// are dropped. Per-site sequence numbers may contain gaps; they are causal
/// holes to be filled by later inserts.
///
/// The log is a plain ordered map. The owning site serializes mutation
/// behind its mutex, and clones taken under that mutex act as snapshots.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventLog<T> {
    sites: BTreeMap<SiteId, BTreeMap<SeqNo, T>>,
}

impl<T> EventLog<T> {
    pub fn new() -> Self {
        Self {
            sites: BTreeMap::new(),
        }
    }

    /// Sites for which at least one event is recorded, ascending.
    pub fn sites(&self) -> impl Iterator<Item = SiteId> + '_ {
        self.sites.keys().copied()
    }

    /// Next sequence number expected from `site`.
    ///
    /// Strictly greater than every recorded seqno for the site; ZERO when
    /// nothing is recorded.
    pub fn expected_for(&self, site: SiteId) -> SeqNo {
        self.sites
            .get(&site)
            .and_then(|events| events.keys().next_back())
            .map(|seqno| seqno.next())
            .unwrap_or(SeqNo::ZERO)
    }

    /// Highest [`EventLog::expected_for`] across all sites.
    pub fn expected(&self) -> SeqNo {
        self.sites
            .keys()
            .map(|site| self.expected_for(*site))
            .max()
            .unwrap_or(SeqNo::ZERO)
    }

    pub fn get(&self, seqno: SeqNo, site: SiteId) -> Option<&T> {
        self.sites.get(&site).and_then(|events| events.get(&seqno))
    }

    pub fn contains(&self, seqno: SeqNo, site: SiteId) -> bool {
        self.get(seqno, site).is_some()
    }

    /// Events recorded for `site` with seqno >= `from`, ascending.
    pub fn events(&self, site: SiteId, from: SeqNo) -> impl Iterator<Item = (SeqNo, &T)> + '_ {
        self.sites
            .get(&site)
            .into_iter()
            .flat_map(move |events| events.range(from..))
            .map(|(seqno, body)| (*seqno, body))
    }

    /// First recorded event for `site` with seqno >= `from`.
    pub fn first_from(&self, site: SiteId, from: SeqNo) -> Option<(SeqNo, &T)> {
        self.events(site, from).next()
    }

    /// All events in ascending [`EventId`] order.
    pub fn iter(&self) -> LogIter<'_, T> {
        LogIter::new(&self.sites)
    }

    /// Left fold over all events in ascending [`EventId`] order.
    pub fn fold<M, F>(&self, initial: M, mut f: F) -> M
    where
        F: FnMut(M, EventId, &T) -> M,
    {
        self.iter()
            .fold(initial, |model, (id, body)| f(model, id, body))
    }

    pub fn len(&self) -> usize {
        self.sites.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Records a binding unless the key is already present.
    ///
    /// Returns true when the write was novel. A later write for an existing
    /// key is dropped regardless of body; `(seqno, site)` uniqueness is the
    /// producer's responsibility.
    pub fn insert(&mut self, seqno: SeqNo, site: SiteId, body: T) -> bool {
        match self.sites.entry(site).or_default().entry(seqno) {
            btree_map::Entry::Occupied(_) => false,
            btree_map::Entry::Vacant(slot) => {
                slot.insert(body);
                true
            }
        }
    }
}

/// Ascending [`EventId`] merge over the per-site ordered maps.
///
/// A min-heap over the head of each site's iterator yields the globally
/// smallest identifier at every step.
pub struct LogIter<'a, T> {
    heads: BinaryHeap<Reverse<EventId>>,
    iters: BTreeMap<SiteId, Peekable<btree_map::Iter<'a, SeqNo, T>>>,
}

impl<'a, T> LogIter<'a, T> {
    fn new(sites: &'a BTreeMap<SiteId, BTreeMap<SeqNo, T>>) -> Self {
        let mut heads = BinaryHeap::with_capacity(sites.len());
        let mut iters = BTreeMap::new();
        for (site, events) in sites {
            let mut events = events.iter().peekable();
            if let Some((seqno, _)) = events.peek() {
                heads.push(Reverse(EventId::new(**seqno, *site)));
            }
            iters.insert(*site, events);
        }
        Self { heads, iters }
    }
}

impl<'a, T> Iterator for LogIter<'a, T> {
    type Item = (EventId, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let Reverse(id) = self.heads.pop()?;
        let events = self.iters.get_mut(&id.site).expect("iterator for queued site");
        let (seqno, body) = events.next().expect("queued head present");
        debug_assert_eq!(*seqno, id.seqno);
        if let Some((next, _)) = events.peek() {
            self.heads.push(Reverse(EventId::new(**next, id.site)));
        }
        Some((id, body))
    }
}
