//! Dual-view container for address entries.
//!
//! Entries are owned by a primary store keyed by stable ids, with two
//! ordered secondary views kept in lockstep by every mutator:
//!
//! * **ByAddress**: ordered by `(service, is_alias)`; the canonical entry
//!   for a service sorts before its aliases, so a range scan yields the
//!   canonical first.
//! * **ByBucket**: ordered by `(table, bucket, position)`; this key is
//!   unique, which makes slot occupancy a point lookup.

use std::collections::{BTreeMap, BTreeSet};
use std::net;
use std::ops::Bound;

use crate::entry::Entry;

/// Stable identifier of an entry. Never reused within one table lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct EntryId(u64);

impl EntryId {
    /// Placeholder for statistics that are not linked to an entry yet.
    pub const NONE: EntryId = EntryId(u64::MAX);

    const MIN: EntryId = EntryId(u64::MIN);
    const MAX: EntryId = EntryId(u64::MAX);
}

/// A slot in one of the two tables.
pub(crate) type Slot = (bool, u32, u32);

#[derive(Debug, Default)]
pub(crate) struct Index {
    entries: BTreeMap<EntryId, Entry>,
    by_addr: BTreeSet<(net::SocketAddr, bool, EntryId)>,
    by_bucket: BTreeMap<Slot, EntryId>,
    next: u64,
}

impl Index {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_addr.clear();
        self.by_bucket.clear();
    }

    pub fn get(&self, id: EntryId) -> Option<&Entry> {
        self.entries.get(&id)
    }

    /// Insert a fully-bucketed entry. The target slot must be empty.
    pub fn insert(&mut self, entry: Entry) -> EntryId {
        let id = EntryId(self.next);
        self.next += 1;

        debug_assert!(!self
            .by_bucket
            .contains_key(&(entry.in_tried, entry.bucket, entry.bucket_pos)));

        self.by_addr.insert((entry.addr, entry.is_alias(), id));
        self.by_bucket
            .insert((entry.in_tried, entry.bucket, entry.bucket_pos), id);
        self.entries.insert(id, entry);

        id
    }

    /// Remove an entry from the store and both views.
    pub fn remove(&mut self, id: EntryId) -> Option<Entry> {
        let entry = self.entries.remove(&id)?;

        self.by_addr.remove(&(entry.addr, entry.is_alias(), id));
        self.by_bucket
            .remove(&(entry.in_tried, entry.bucket, entry.bucket_pos));

        Some(entry)
    }

    /// Modify an entry in place, re-indexing both views. The closure is
    /// responsible for leaving `bucket`/`bucket_pos` consistent with the
    /// other fields; the new slot must be empty.
    pub fn reindex(&mut self, id: EntryId, f: impl FnOnce(&mut Entry)) {
        let entry = self.entries.get_mut(&id).expect("Index::reindex: unknown entry");

        self.by_addr.remove(&(entry.addr, entry.stats.is_none(), id));
        self.by_bucket
            .remove(&(entry.in_tried, entry.bucket, entry.bucket_pos));

        f(entry);

        debug_assert!(!self
            .by_bucket
            .contains_key(&(entry.in_tried, entry.bucket, entry.bucket_pos)));

        self.by_addr.insert((entry.addr, entry.stats.is_none(), id));
        self.by_bucket
            .insert((entry.in_tried, entry.bucket, entry.bucket_pos), id);
    }

    /// Redirect a canonical entry to a new statistics position. Must not be
    /// used to change alias-ness; that requires [`Index::reindex`].
    pub fn set_stats_pos(&mut self, id: EntryId, pos: usize) {
        let entry = self
            .entries
            .get_mut(&id)
            .expect("Index::set_stats_pos: unknown entry");

        debug_assert!(entry.stats.is_some());
        entry.stats = Some(pos);
    }

    /// The canonical (non-alias) entry for a service, if any.
    pub fn canonical(&self, addr: &net::SocketAddr) -> Option<EntryId> {
        self.by_addr
            .range((*addr, false, EntryId::MIN)..=(*addr, false, EntryId::MAX))
            .next()
            .map(|(_, _, id)| *id)
    }

    /// The first alias entry for a service, if any.
    pub fn first_alias(&self, addr: &net::SocketAddr) -> Option<EntryId> {
        self.aliases(addr).next()
    }

    /// All alias entries for a service, in view order.
    pub fn aliases<'a>(
        &'a self,
        addr: &net::SocketAddr,
    ) -> impl Iterator<Item = EntryId> + 'a {
        self.by_addr
            .range((*addr, true, EntryId::MIN)..=(*addr, true, EntryId::MAX))
            .map(|(_, _, id)| *id)
    }

    /// Number of occurrences of a service, canonical entry included.
    pub fn multiplicity(&self, addr: &net::SocketAddr) -> usize {
        self.by_addr
            .range((
                Bound::Included((*addr, false, EntryId::MIN)),
                Bound::Included((*addr, true, EntryId::MAX)),
            ))
            .count()
    }

    /// What occupies the given slot.
    pub fn occupant(&self, in_tried: bool, bucket: u32, bucket_pos: u32) -> Option<EntryId> {
        self.by_bucket.get(&(in_tried, bucket, bucket_pos)).copied()
    }

    /// All entries in ByBucket order: the new table first, then tried.
    pub fn iter_bucket_order(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.by_bucket.values().copied()
    }

    /// All `(slot, entry)` pairs in ByBucket order.
    pub fn iter_slots(&self) -> impl Iterator<Item = (&Slot, EntryId)> + '_ {
        self.by_bucket.iter().map(|(slot, id)| (slot, *id))
    }

    /// All entries in ByAddress order: canonical entries directly followed
    /// by their aliases.
    pub fn iter_addr_order(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.by_addr.iter().map(|(_, _, id)| *id)
    }

    /// Number of distinct new-table buckets with at least one occupant.
    pub fn new_buckets_used(&self) -> usize {
        let mut buckets = 0;
        let mut last = None;

        for (in_tried, bucket, _) in self.by_bucket.keys() {
            if !in_tried && last != Some(*bucket) {
                buckets += 1;
                last = Some(*bucket);
            }
        }
        buckets
    }
}
