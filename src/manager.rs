//! The address manager core: an unsynchronized state machine over the
//! new/tried tables.
//!
//! Use [`crate::AddressBook`] for the thread-safe, self-checking wrapper.

use std::net;

use bitcoin::network::constants::ServiceFlags;

use crate::entry::{Entry, PeerAddress, Stats};
use crate::hasher::{
    BucketHasher, BUCKET_SIZE, NEW_BUCKETS_PER_ADDRESS, NEW_BUCKET_COUNT, TRIED_BUCKET_COUNT,
};
use crate::index::{EntryId, Index};
use crate::netgroup::{self, Domain, NetGroupManager};
use crate::rng::Rng;
use crate::{AddrTime, Timestamp};

/// How recent a successful connection should be before we allow an address
/// to be evicted from the tried table.
pub const REPLACEMENT_HOURS: i64 = 4;

/// The maximum number of tried collisions to store.
pub const SET_TRIED_COLLISION_SIZE: usize = 10;

/// The maximum time we'll spend trying to resolve a tried-table collision,
/// in seconds.
pub const TEST_WINDOW: i64 = 40 * 60;

/// How old a freshness stamp must be before a live connection refreshes it.
const CONNECTED_UPDATE_INTERVAL: i64 = 20 * 60;

/// Where an address sits in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressPosition {
    /// Whether the address is in the tried table.
    pub tried: bool,
    /// How many slots the address occupies (always 1 in tried).
    pub multiplicity: usize,
    /// The bucket of the canonical entry.
    pub bucket: u32,
    /// The position within that bucket.
    pub position: u32,
}

/// Manages peer network addresses.
///
/// All operations run to completion without I/O; callers supply the current
/// time. This type performs no locking and no self-checking; that is the
/// facade's job.
pub struct AddressManager {
    /// The slot table with its two views.
    pub(crate) index: Index,
    /// Statistics for every canonical entry, in random order. Doubles as the
    /// sampling pool for [`AddressManager::get_addr`].
    pub(crate) stats: Vec<Stats>,
    /// Number of unique new-table entries.
    pub(crate) count_new: usize,
    /// Number of tried-table entries.
    pub(crate) count_tried: usize,
    /// Last time any address was marked good. Starts at 1 so that "never"
    /// is strictly worse.
    pub(crate) last_good: Timestamp,
    /// Entries that collided on promotion to tried, awaiting a
    /// test-before-evict decision.
    pub(crate) collisions: std::collections::BTreeSet<EntryId>,
    pub(crate) hasher: BucketHasher,
    pub(crate) netgroup: Box<dyn NetGroupManager>,
    pub(crate) rng: Rng,
    pub(crate) consistency_check_ratio: i32,
}

/// Recompute an entry's bucket and position from its current fields.
pub(crate) fn rebucket(hasher: &BucketHasher, netgroup: &dyn NetGroupManager, entry: &mut Entry) {
    let group = netgroup.group(&entry.addr.ip());
    entry.bucket = if entry.in_tried {
        hasher.tried_bucket(&entry.addr, &group)
    } else {
        hasher.new_bucket(&group, &netgroup.group(&entry.source))
    };
    entry.bucket_pos = hasher.position(!entry.in_tried, entry.bucket, &entry.addr);
}

/// Snapshot an entry for returning to the caller.
fn snapshot(addr: net::SocketAddr, stats: &Stats) -> PeerAddress {
    PeerAddress {
        socket: addr,
        services: stats.services,
        time: stats.time,
    }
}

impl AddressManager {
    /// Create a new, empty address manager. The bucket key is drawn from the
    /// provided generator.
    pub fn new(netgroup: Box<dyn NetGroupManager>, rng: Rng, consistency_check_ratio: i32) -> Self {
        let key = rng.rand_u256();
        Self::with_key(netgroup, rng, consistency_check_ratio, key)
    }

    pub(crate) fn with_key(
        netgroup: Box<dyn NetGroupManager>,
        rng: Rng,
        consistency_check_ratio: i32,
        key: [u8; 32],
    ) -> Self {
        Self {
            index: Index::default(),
            stats: Vec::new(),
            count_new: 0,
            count_tried: 0,
            last_good: 1,
            collisions: Default::default(),
            hasher: BucketHasher::new(key),
            netgroup,
            rng,
            consistency_check_ratio,
        }
    }

    /// The number of unique addresses known.
    pub fn len(&self) -> usize {
        self.stats.len()
    }

    /// Whether any addresses are known.
    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    /// The number of unique addresses matching the given filters: by
    /// communication domain, and/or by table (`Some(true)` counts the new
    /// table only).
    pub fn size_of(&self, domain: Option<Domain>, in_new: Option<bool>) -> usize {
        self.stats
            .iter()
            .filter(|stats| {
                let entry = self.entry(stats.entry);
                domain.map_or(true, |d| Domain::for_address(&entry.addr) == d)
                    && in_new.map_or(true, |new| entry.in_tried != new)
            })
            .count()
    }

    /// The number of distinct new-table buckets currently occupied.
    pub fn new_buckets_used(&self) -> usize {
        self.index.new_buckets_used()
    }

    pub(crate) fn clear(&mut self) {
        self.index.clear();
        self.stats.clear();
        self.collisions.clear();
        self.count_new = 0;
        self.count_tried = 0;
        self.last_good = 1;
    }

    pub(crate) fn set_key(&mut self, key: [u8; 32]) {
        self.hasher = BucketHasher::new(key);
    }

    ////////////////////////////////////////////////////////////////////////////

    fn entry(&self, id: EntryId) -> &Entry {
        self.index.get(id).expect("address manager: dangling entry id")
    }

    fn stats_pos(&self, id: EntryId) -> usize {
        self.entry(id)
            .stats
            .expect("address manager: entry is not canonical")
    }

    fn bump_count(&mut self, entry: &Entry, inc: isize) {
        if !entry.is_alias() {
            if entry.in_tried {
                self.count_tried = (self.count_tried as isize + inc) as usize;
            } else {
                self.count_new = (self.count_new as isize + inc) as usize;
            }
        }
    }

    /// Swap two statistics records, fixing up the entry back-references.
    fn swap_stats(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.stats.swap(a, b);

        let id_a = self.stats[a].entry;
        let id_b = self.stats[b].entry;
        self.index.set_stats_pos(id_a, a);
        self.index.set_stats_pos(id_b, b);
    }

    /// Modify an entry in place, rebucketing it and keeping the table
    /// counters current.
    fn modify(&mut self, id: EntryId, f: impl FnOnce(&mut Entry)) {
        let before = self.entry(id).clone();
        self.bump_count(&before, -1);

        let Self {
            index,
            hasher,
            netgroup,
            ..
        } = self;
        index.reindex(id, |entry| {
            f(entry);
            rebucket(hasher, netgroup.as_ref(), entry);
        });

        let after = self.entry(id).clone();
        self.bump_count(&after, 1);
    }

    /// Bucket and insert an entry; its target slot must be free. For
    /// non-alias insertions, `stats` joins the sampling pool.
    pub(crate) fn insert_entry(&mut self, mut entry: Entry, stats: Stats, alias: bool) -> EntryId {
        rebucket(&self.hasher, self.netgroup.as_ref(), &mut entry);
        entry.stats = if alias { None } else { Some(self.stats.len()) };

        self.bump_count(&entry, 1);
        let id = self.index.insert(entry);
        if !alias {
            let mut stats = stats;
            stats.entry = id;
            self.stats.push(stats);
        }
        id
    }

    /// Remove an entry. Erasing a canonical entry that still has aliases
    /// morphs it instead: the alias's source (and slot) is transferred onto
    /// the canonical record and the alias is deleted, preserving statistics.
    pub(crate) fn erase(&mut self, id: EntryId) {
        let entry = self.entry(id).clone();

        if entry.stats.is_some() {
            if let Some(alias_id) = self.index.first_alias(&entry.addr) {
                let source = self.entry(alias_id).source;
                self.index.remove(alias_id);
                self.collisions.remove(&alias_id);
                self.modify(id, |e| e.source = source);

                log::trace!(
                    "Removed {} from new[{}][{}]",
                    entry.addr,
                    entry.bucket,
                    entry.bucket_pos
                );
                return;
            }
            let last = self.stats.len() - 1;
            let pos = entry.stats.expect("checked above");
            self.swap_stats(pos, last);
            self.stats.pop();
        }
        self.bump_count(&entry, -1);
        self.collisions.remove(&id);
        self.index.remove(id);

        log::trace!(
            "Removed {} from {}[{}][{}]",
            entry.addr,
            if entry.in_tried { "tried" } else { "new" },
            entry.bucket,
            entry.bucket_pos
        );
    }

    ////////////////////////////////////////////////////////////////////////////

    /// Add addresses learned from `source` to the new table. `time_penalty`
    /// is subtracted from each freshness stamp, except for a source
    /// announcing itself. Returns whether at least one new slot was filled.
    pub fn add(
        &mut self,
        addrs: &[PeerAddress],
        source: net::IpAddr,
        time_penalty: Timestamp,
        now: Timestamp,
    ) -> bool {
        let mut added = 0;
        for addr in addrs {
            if self.add_single(addr, source, time_penalty, now) {
                added += 1;
            }
        }
        if added > 0 {
            log::debug!(
                "Added {} addresses (of {}) from {}: {} tried, {} new",
                added,
                addrs.len(),
                source,
                self.count_tried,
                self.count_new
            );
        }
        added > 0
    }

    fn add_single(
        &mut self,
        addr: &PeerAddress,
        source: net::IpAddr,
        time_penalty: Timestamp,
        now: Timestamp,
    ) -> bool {
        if !netgroup::is_routable(&addr.socket.ip()) {
            return false;
        }
        // Do not set a penalty for a source's self-announcement.
        let time_penalty = if addr.socket.ip() == source {
            0
        } else {
            time_penalty
        };

        let alias = if let Some(id) = self.index.canonical(&addr.socket) {
            let in_tried = self.entry(id).in_tried;
            let pos = self.stats_pos(id);
            {
                let stats = &mut self.stats[pos];

                // Periodically update the freshness stamp.
                let currently_online = now - (addr.time as Timestamp) < 24 * 60 * 60;
                let update_interval: Timestamp =
                    if currently_online { 60 * 60 } else { 24 * 60 * 60 };
                if addr.time != 0
                    && (stats.time == 0
                        || (stats.time as Timestamp)
                            < addr.time as Timestamp - update_interval - time_penalty)
                {
                    stats.time = (addr.time as Timestamp - time_penalty).max(0) as AddrTime;
                }

                // Add services.
                stats.services =
                    ServiceFlags::from(stats.services.as_u64() | addr.services.as_u64());

                // Do not update if no new information is present.
                if addr.time == 0 || (stats.time != 0 && addr.time <= stats.time) {
                    return false;
                }
            }
            // Do not update if the entry was already in the tried table.
            if in_tried {
                return false;
            }
            // Do not update if the maximum number of copies is reached.
            let multiplicity = self.index.multiplicity(&addr.socket);
            if multiplicity == NEW_BUCKETS_PER_ADDRESS as usize {
                return false;
            }
            // Stochastic test: a service already occupying N slots is 2^N
            // times harder to add another copy of.
            let factor = 1u64 << multiplicity;
            if factor > 1 && self.rng.randrange(factor) != 0 {
                return false;
            }
            true
        } else {
            false
        };

        let mut entry = Entry::new(addr.socket, source);
        rebucket(&self.hasher, self.netgroup.as_ref(), &mut entry);
        let stats = Stats::new(
            (addr.time as Timestamp - time_penalty).max(0) as AddrTime,
            addr.services,
        );

        match self.index.occupant(false, entry.bucket, entry.bucket_pos) {
            None => {
                log::debug!("Added {} to new[{}][{}]", addr.socket, entry.bucket, entry.bucket_pos);
                self.insert_entry(entry, stats, alias);
                true
            }
            Some(occupant) if self.entry(occupant).addr == addr.socket => {
                // The slot already holds this service.
                false
            }
            Some(occupant) => {
                // Occupied by another service: overwrite it if its record is
                // terrible, or if a fresh (non-alias) candidate competes with
                // a multiply-present occupant.
                let occ_addr = self.entry(occupant).addr;
                let occ_canonical = self
                    .index
                    .canonical(&occ_addr)
                    .expect("every service has a canonical entry");
                let occ_stats = &self.stats[self.stats_pos(occ_canonical)];

                if occ_stats.is_terrible(now)
                    || (!alias && self.index.multiplicity(&occ_addr) > 1)
                {
                    self.erase(occupant);
                    log::debug!(
                        "Added {} to new[{}][{}], replacing {}",
                        addr.socket,
                        entry.bucket,
                        entry.bucket_pos,
                        occ_addr
                    );
                    self.insert_entry(entry, stats, alias);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Mark an address as just successfully connected, promoting it towards
    /// the tried table under the test-before-evict discipline. Returns
    /// whether the address moved to tried.
    pub fn mark_good(&mut self, addr: &net::SocketAddr, now: Timestamp) -> bool {
        self.good(addr, true, now)
    }

    pub(crate) fn good(
        &mut self,
        addr: &net::SocketAddr,
        test_before_evict: bool,
        now: Timestamp,
    ) -> bool {
        self.last_good = now;

        let id = match self.index.canonical(addr) {
            Some(id) => id,
            None => return false,
        };
        let pos = self.stats_pos(id);
        {
            let stats = &mut self.stats[pos];
            stats.last_success = now;
            stats.last_try = now;
            stats.attempts = 0;
            // The freshness stamp is not updated here, to avoid leaking
            // information about currently-connected peers.
        }
        if self.entry(id).in_tried {
            return false;
        }

        // Which tried slot the entry would move to.
        let group = self.netgroup.group(&addr.ip());
        let bucket = self.hasher.tried_bucket(addr, &group);
        let bucket_pos = self.hasher.position(false, bucket, addr);

        // Will moving this address into tried evict another entry?
        if test_before_evict && self.index.occupant(true, bucket, bucket_pos).is_some() {
            if self.collisions.len() < SET_TRIED_COLLISION_SIZE {
                self.collisions.insert(id);
            }
            log::debug!(
                "Collision at tried[{}][{}] while attempting to move {} to tried; {} collision(s)",
                bucket,
                bucket_pos,
                addr,
                self.collisions.len()
            );
            false
        } else {
            self.make_tried(id);
            log::debug!("Moved {} to tried[{}][{}]", addr, bucket, bucket_pos);
            true
        }
    }

    /// Move a canonical new-table entry to the tried table, evicting at most
    /// one existing tried entry back into new.
    fn make_tried(&mut self, id: EntryId) {
        let entry = self.entry(id).clone();
        debug_assert!(!entry.in_tried);
        let stats = self.stats[self.stats_pos(id)].clone();

        // Remove every copy of the service from the new table.
        while let Some(eid) = self.index.canonical(&entry.addr) {
            self.erase(eid);
        }

        let mut promoted = Entry::new(entry.addr, entry.source);
        promoted.in_tried = true;
        rebucket(&self.hasher, self.netgroup.as_ref(), &mut promoted);

        // First make space: an existing tried entry there is moved back to
        // new, deleting whatever is in its way.
        if let Some(occ_id) = self.index.occupant(true, promoted.bucket, promoted.bucket_pos) {
            let occupant = self.entry(occ_id).clone();
            let occ_stats = self.stats[self.stats_pos(occ_id)].clone();
            self.erase(occ_id);

            let mut evicted = Entry::new(occupant.addr, occupant.source);
            rebucket(&self.hasher, self.netgroup.as_ref(), &mut evicted);

            if let Some(in_the_way) = self.index.occupant(false, evicted.bucket, evicted.bucket_pos)
            {
                self.erase(in_the_way);
            }
            let alias = self.index.canonical(&evicted.addr).is_some();
            log::debug!(
                "Moved {} from tried[{}][{}] to new[{}][{}] to make space",
                occupant.addr,
                occupant.bucket,
                occupant.bucket_pos,
                evicted.bucket,
                evicted.bucket_pos
            );
            self.insert_entry(evicted, occ_stats, alias);
        }
        self.insert_entry(promoted, stats, false);
    }

    /// Record a connection attempt. `count_failure` counts it toward the
    /// failure statistics if no success intervened.
    pub fn attempt(&mut self, addr: &net::SocketAddr, count_failure: bool, now: Timestamp) {
        let id = match self.index.canonical(addr) {
            Some(id) => id,
            None => return,
        };
        let last_good = self.last_good;
        let pos = self.stats_pos(id);
        let stats = &mut self.stats[pos];

        stats.last_try = now;
        if count_failure && stats.last_counted < last_good {
            stats.last_counted = now;
            stats.attempts += 1;
        }
    }

    /// Note that we are currently connected to this address, refreshing its
    /// stamp if it has grown stale.
    pub fn connected(&mut self, addr: &net::SocketAddr, now: Timestamp) {
        let id = match self.index.canonical(addr) {
            Some(id) => id,
            None => return,
        };
        let pos = self.stats_pos(id);
        let stats = &mut self.stats[pos];

        if now - (stats.time as Timestamp) > CONNECTED_UPDATE_INTERVAL {
            stats.time = now.max(0) as AddrTime;
        }
    }

    /// Overwrite the service bits advertised by an address.
    pub fn set_services(&mut self, addr: &net::SocketAddr, services: ServiceFlags) {
        let id = match self.index.canonical(addr) {
            Some(id) => id,
            None => return,
        };
        let pos = self.stats_pos(id);
        self.stats[pos].services = services;
    }

    /// Select an address to connect to, biased towards entries with a high
    /// [`chance`](crate::entry). Returns the address and when it was last
    /// tried.
    pub fn select(&self, new_only: bool, now: Timestamp) -> Option<(PeerAddress, Timestamp)> {
        if self.index.is_empty() {
            return None;
        }
        if new_only && self.count_new == 0 {
            return None;
        }
        // Use a 50% chance for choosing between tried and new table entries.
        let use_tried =
            !new_only && self.count_tried > 0 && (self.count_new == 0 || self.rng.rand_bool());
        let buckets = if use_tried {
            TRIED_BUCKET_COUNT
        } else {
            NEW_BUCKET_COUNT
        };

        let mut chance_factor = 1.0;
        loop {
            // Pick a bucket, and an initial position in that bucket, then
            // iterate over the bucket's positions, looping around.
            let bucket = self.rng.randrange(buckets as u64) as u32;
            let start = self.rng.randrange(BUCKET_SIZE as u64) as u32;

            let mut found = None;
            for i in 0..BUCKET_SIZE {
                let pos = (start + i) % BUCKET_SIZE;
                if let Some(id) = self.index.occupant(use_tried, bucket, pos) {
                    found = Some(id);
                    break;
                }
            }
            // If the bucket is entirely empty, start over with a (likely)
            // different one.
            let id = match found {
                Some(id) => id,
                None => continue,
            };
            let entry = self.entry(id);
            let canonical = self
                .index
                .canonical(&entry.addr)
                .expect("every service has a canonical entry");
            let stats = &self.stats[self.stats_pos(canonical)];

            // With probability `chance * chance_factor`, return the entry.
            if (self.rng.randbits(30) as f64)
                < chance_factor * stats.chance(now) * (1u64 << 30) as f64
            {
                log::debug!(
                    "Selected {} from {}",
                    entry.addr,
                    if use_tried { "tried" } else { "new" }
                );
                return Some((snapshot(entry.addr, stats), stats.last_try));
            }
            // Otherwise start over with a (likely) different bucket, and an
            // increased chance factor.
            chance_factor *= 1.2;
        }
    }

    /// Return a random sample of known addresses, skipping terrible ones.
    ///
    /// At most `max_count` addresses are returned, and at most `max_pct`
    /// percent of all known addresses; zero disables the respective limit.
    pub fn get_addr(
        &mut self,
        max_count: usize,
        max_pct: usize,
        domain: Option<Domain>,
        now: Timestamp,
    ) -> Vec<PeerAddress> {
        let total = self.stats.len();
        let mut wanted = total;
        if max_pct != 0 {
            wanted = max_pct * wanted / 100;
        }
        if max_count != 0 {
            wanted = wanted.min(max_count);
        }

        // Gather a list of random entries, skipping those of low quality.
        let mut addresses = Vec::with_capacity(wanted);
        for n in 0..total {
            if addresses.len() >= wanted {
                break;
            }
            // Draw without replacement by walking a Fisher-Yates shuffle of
            // the statistics pool.
            let pick = n + self.rng.randrange((total - n) as u64) as usize;
            self.swap_stats(n, pick);

            let stats = &self.stats[n];
            let entry = self.index.get(stats.entry).expect("statistics reference a live entry");

            if let Some(domain) = domain {
                if Domain::for_address(&entry.addr) != domain {
                    continue;
                }
            }
            if stats.is_terrible(now) {
                continue;
            }
            addresses.push(snapshot(entry.addr, stats));
        }
        log::debug!("get_addr returned {} random addresses", addresses.len());
        addresses
    }

    /// Work through the collision set, promoting candidates whose tried slot
    /// has freed up or whose occupant earned eviction, and dropping
    /// candidates whose occupant proved itself.
    pub fn resolve_collisions(&mut self, now: Timestamp) {
        let candidates: Vec<EntryId> = self.collisions.iter().copied().collect();

        for id in candidates {
            // An earlier promotion in this loop may have removed this one.
            if !self.collisions.contains(&id) {
                continue;
            }
            let entry = match self.index.get(id) {
                Some(entry) => entry.clone(),
                None => {
                    self.collisions.remove(&id);
                    continue;
                }
            };
            debug_assert!(!entry.in_tried);
            let addr = entry.addr;

            // Which tried slot the candidate would move to.
            let group = self.netgroup.group(&addr.ip());
            let bucket = self.hasher.tried_bucket(&addr, &group);
            let bucket_pos = self.hasher.position(false, bucket, &addr);

            let mut resolved = false;
            match self.index.occupant(true, bucket, bucket_pos) {
                None => {
                    // Not actually a collision anymore.
                    self.good(&addr, false, now);
                    resolved = true;
                }
                Some(occ_id) => {
                    let occ_addr = self.entry(occ_id).addr;
                    let occ_stats = self.stats[self.stats_pos(occ_id)].clone();
                    let candidate_stats =
                        self.stats[entry.stats.expect("collision candidates are canonical")].clone();

                    if now - occ_stats.last_success < REPLACEMENT_HOURS * 60 * 60 {
                        // The occupant connected successfully recently; the
                        // candidate loses.
                        resolved = true;
                    } else if now - occ_stats.last_try < REPLACEMENT_HOURS * 60 * 60 {
                        // The occupant was tested recently and failed. Give
                        // it at least 60 seconds to complete a connection
                        // before taking its place.
                        if now - occ_stats.last_try > 60 {
                            log::debug!("Replacing {} with {} in tried table", occ_addr, addr);
                            self.good(&addr, false, now);
                            resolved = true;
                        }
                    } else if now - candidate_stats.last_success > TEST_WINDOW {
                        // The collision hasn't resolved in a reasonable
                        // amount of time; evict the untestable occupant.
                        log::debug!(
                            "Unable to test; replacing {} with {} in tried table anyway",
                            occ_addr,
                            addr
                        );
                        self.good(&addr, false, now);
                        resolved = true;
                    }
                }
            }
            if resolved {
                self.collisions.remove(&id);
            }
        }
    }

    /// Pick a random entry from the collision set, paired with the tried
    /// entry it would displace, for caller-driven probing. `None` if there
    /// is no collision whose slot is still contested.
    pub fn select_tried_collision(&self) -> Option<(PeerAddress, PeerAddress)> {
        if self.collisions.is_empty() {
            return None;
        }
        let n = self.rng.randrange(self.collisions.len() as u64) as usize;
        let id = *self.collisions.iter().nth(n).expect("index is in range");
        let entry = self.entry(id);

        let group = self.netgroup.group(&entry.addr.ip());
        let bucket = self.hasher.tried_bucket(&entry.addr, &group);
        let bucket_pos = self.hasher.position(false, bucket, &entry.addr);

        let occ_id = self.index.occupant(true, bucket, bucket_pos)?;
        let occupant = self.entry(occ_id);

        Some((
            snapshot(entry.addr, &self.stats[self.stats_pos(id)]),
            snapshot(occupant.addr, &self.stats[self.stats_pos(occ_id)]),
        ))
    }

    /// Where the given address sits in the table, if present.
    pub fn find(&self, addr: &net::SocketAddr) -> Option<AddressPosition> {
        let id = self.index.canonical(addr)?;
        let entry = self.entry(id);

        Some(AddressPosition {
            tried: entry.in_tried,
            multiplicity: if entry.in_tried {
                1
            } else {
                self.index.multiplicity(addr)
            },
            bucket: entry.bucket,
            position: entry.bucket_pos,
        })
    }

    ////////////////////////////////////////////////////////////////////////////

    /// Run the consistency check one in `consistency_check_ratio` times.
    ///
    /// # Panics
    ///
    /// Panics if an invariant is violated: that is a programming defect, not
    /// a user error.
    pub fn check(&self) {
        if self.consistency_check_ratio == 0 {
            return;
        }
        if self.rng.randrange(self.consistency_check_ratio as u64) >= 1 {
            return;
        }
        let code = self.consistency_check();
        if code != 0 {
            log::error!("address manager consistency check failed: code {}", code);
            panic!("address manager consistency check failed: code {}", code);
        }
    }

    /// Verify every table invariant in one pass over both views. Returns
    /// zero, or a negative code identifying the first violated invariant:
    ///
    /// * `-1`: an alias in the tried table
    /// * `-2`: an alias without a preceding canonical entry
    /// * `-3`: two canonical entries for one service
    /// * `-4`: a service occupying more slots than allowed
    /// * `-5`: a bucket assignment the hasher would not reproduce
    /// * `-6`/`-7`: new/tried counters out of sync
    /// * `-8`: statistics pool size out of sync
    /// * `-10`: a slot not mapping back to its entry
    /// * `-11`/`-12`: a view out of sync with the entry store
    /// * `-13`: a collision-set reference that is not a new canonical entry
    /// * `-22`: a statistics reference out of range
    /// * `-23`: a statistics back-reference mismatch
    pub(crate) fn consistency_check(&self) -> i32 {
        let mut counted_new = 0;
        let mut counted_tried = 0;
        let mut prev_addr: Option<net::SocketAddr> = None;
        let mut run = 0;
        let mut seen = 0;

        for id in self.index.iter_addr_order() {
            let entry = match self.index.get(id) {
                Some(entry) => entry,
                None => return -11,
            };
            seen += 1;

            let same_addr = prev_addr == Some(entry.addr);
            run = if same_addr { run + 1 } else { 1 };
            if run > NEW_BUCKETS_PER_ADDRESS as usize {
                return -4;
            }

            match entry.stats {
                None => {
                    // Tried entries cannot have aliases, and an alias always
                    // follows its canonical entry in this iteration order.
                    if entry.in_tried {
                        return -1;
                    }
                    if !same_addr {
                        return -2;
                    }
                }
                Some(pos) => {
                    if pos >= self.stats.len() {
                        return -22;
                    }
                    if self.stats[pos].entry != id {
                        return -23;
                    }
                    if same_addr {
                        return -3;
                    }
                    if entry.in_tried {
                        counted_tried += 1;
                    } else {
                        counted_new += 1;
                    }
                }
            }

            let mut copy = entry.clone();
            rebucket(&self.hasher, self.netgroup.as_ref(), &mut copy);
            if copy.bucket != entry.bucket || copy.bucket_pos != entry.bucket_pos {
                return -5;
            }
            if self.index.occupant(entry.in_tried, entry.bucket, entry.bucket_pos) != Some(id) {
                return -10;
            }
            prev_addr = Some(entry.addr);
        }

        if counted_new != self.count_new {
            return -6;
        }
        if counted_tried != self.count_tried {
            return -7;
        }
        if counted_new + counted_tried != self.stats.len() {
            return -8;
        }
        if seen != self.index.len() {
            return -11;
        }
        if self.index.iter_slots().count() != self.index.len() {
            return -12;
        }
        for id in &self.collisions {
            match self.index.get(*id) {
                Some(entry) if !entry.in_tried && !entry.is_alias() => {}
                _ => return -13,
            }
        }
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netgroup::PrefixGroup;

    use std::collections::BTreeSet;

    use quickcheck::TestResult;
    use quickcheck_macros::quickcheck;

    const KEY: [u8; 32] = [0xff; 32];

    fn manager() -> AddressManager {
        AddressManager::with_key(Box::new(PrefixGroup), Rng::with_seed(1), 0, KEY)
    }

    fn sock(s: &str) -> net::SocketAddr {
        s.parse().unwrap()
    }

    fn peer(s: &str, time: u32) -> PeerAddress {
        PeerAddress::new(sock(s), ServiceFlags::NETWORK).with_time(time)
    }

    fn group(addr: &net::SocketAddr) -> Vec<u8> {
        PrefixGroup.group(&addr.ip())
    }

    /// The tried slot an address would be promoted into.
    fn tried_slot(addr: &net::SocketAddr) -> (u32, u32) {
        let hasher = BucketHasher::new(KEY);
        let bucket = hasher.tried_bucket(addr, &group(addr));
        (bucket, hasher.position(false, bucket, addr))
    }

    #[test]
    fn test_add_and_promote() {
        let mut mgr = manager();
        let addr = peer("250.1.2.3:8333", 1000);

        // A self-announcement: the source is the address itself.
        assert!(mgr.add(&[addr], addr.socket.ip(), 600, 1000));
        assert_eq!(mgr.len(), 1);
        assert_eq!(mgr.consistency_check(), 0);

        let hasher = BucketHasher::new(KEY);
        let bucket = hasher.new_bucket(&group(&addr.socket), &group(&addr.socket));
        let found = mgr.find(&addr.socket).unwrap();
        assert_eq!(
            found,
            AddressPosition {
                tried: false,
                multiplicity: 1,
                bucket,
                position: hasher.position(true, bucket, &addr.socket),
            }
        );
        // The self-announcement penalty is waived.
        assert_eq!(mgr.stats[0].time, 1000);

        assert!(mgr.mark_good(&addr.socket, 2000), "the tried slot is empty");
        assert_eq!(mgr.consistency_check(), 0);

        let (bucket, position) = tried_slot(&addr.socket);
        let found = mgr.find(&addr.socket).unwrap();
        assert_eq!(
            found,
            AddressPosition {
                tried: true,
                multiplicity: 1,
                bucket,
                position,
            }
        );
        assert_eq!(mgr.count_tried, 1);
        assert_eq!(mgr.count_new, 0);
    }

    #[test]
    fn test_add_unroutable() {
        let mut mgr = manager();

        assert!(!mgr.add(&[peer("10.0.0.1:8333", 1000)], [99, 1, 2, 3].into(), 0, 1000));
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_add_no_new_info() {
        let mut mgr = manager();
        let addr = peer("250.1.2.3:8333", 1000);
        let source: net::IpAddr = [99, 1, 2, 3].into();

        assert!(mgr.add(&[addr], source, 0, 1000));
        assert!(!mgr.add(&[addr], source, 0, 1000), "same stamp carries no new information");
        assert_eq!(mgr.len(), 1);
        assert_eq!(mgr.find(&addr.socket).unwrap().multiplicity, 1);
    }

    #[test]
    fn test_add_merges_services() {
        let mut mgr = manager();
        let source: net::IpAddr = [99, 1, 2, 3].into();
        let addr = sock("250.1.2.3:8333");

        mgr.add(&[PeerAddress::new(addr, ServiceFlags::NETWORK).with_time(1000)], source, 0, 1000);
        mgr.add(
            &[PeerAddress::new(addr, ServiceFlags::WITNESS).with_time(1000)],
            source,
            0,
            1000,
        );

        let services = mgr.stats[0].services;
        assert!(services.has(ServiceFlags::NETWORK));
        assert!(services.has(ServiceFlags::WITNESS));
    }

    #[test]
    fn test_unknown_address_ops() {
        let mut mgr = manager();
        let addr = sock("250.1.2.3:8333");
        let now = 1_600_000_000;

        assert!(!mgr.mark_good(&addr, now));
        mgr.attempt(&addr, true, now);
        mgr.connected(&addr, now);
        mgr.set_services(&addr, ServiceFlags::NETWORK);

        assert!(mgr.is_empty());
        assert_eq!(mgr.consistency_check(), 0);
    }

    #[test]
    fn test_attempt_counting() {
        let mut mgr = manager();
        let addr = peer("250.1.2.3:8333", 1000);
        mgr.add(&[addr], [99, 1, 2, 3].into(), 0, 1000);

        mgr.attempt(&addr.socket, true, 2000);
        assert_eq!(mgr.stats[0].attempts, 1);
        assert_eq!(mgr.stats[0].last_try, 2000);

        // Further failures are not counted until another success intervenes.
        mgr.attempt(&addr.socket, true, 3000);
        assert_eq!(mgr.stats[0].attempts, 1);

        mgr.mark_good(&addr.socket, 4000);
        assert_eq!(mgr.stats[0].attempts, 0);
        mgr.attempt(&addr.socket, true, 5000);
        assert_eq!(mgr.stats[0].attempts, 1);
    }

    #[test]
    fn test_connected_refreshes_stale_stamp() {
        let mut mgr = manager();
        let now = 1_600_000_000;
        let addr = peer("250.1.2.3:8333", now as u32);
        mgr.add(&[addr], [99, 1, 2, 3].into(), 0, now);

        // A fresh stamp is left alone.
        mgr.connected(&addr.socket, now + 60);
        assert_eq!(mgr.stats[0].time, now as u32);

        mgr.connected(&addr.socket, now + 21 * 60);
        assert_eq!(mgr.stats[0].time, (now + 21 * 60) as u32);
    }

    #[test]
    fn test_alias_ceiling() {
        let mut mgr = manager();
        let addr = sock("250.1.2.3:8333");
        let base = 1_600_000_000;

        mgr.add(&[peer("250.1.2.3:8333", base)], [99, 0, 0, 1].into(), 0, base as Timestamp);

        // Each announcement from a fresh source carries a slightly newer
        // stamp, so only the stochastic gate stands in the way of an alias.
        let mut stamp = base;
        'outer: for a in 0..=255u8 {
            for b in 0..80u8 {
                if mgr.find(&addr).unwrap().multiplicity == NEW_BUCKETS_PER_ADDRESS as usize {
                    break 'outer;
                }
                stamp += 1;
                mgr.add(&[peer("250.1.2.3:8333", stamp)], [77, a, b, 9].into(), 0, base as Timestamp);
            }
        }
        assert_eq!(
            mgr.find(&addr).unwrap().multiplicity,
            NEW_BUCKETS_PER_ADDRESS as usize
        );
        assert_eq!(mgr.consistency_check(), 0);

        // A ninth copy is refused outright.
        stamp += 1;
        assert!(!mgr.add(&[peer("250.1.2.3:8333", stamp)], [78, 1, 2, 3].into(), 0, base as Timestamp));
        assert_eq!(
            mgr.find(&addr).unwrap().multiplicity,
            NEW_BUCKETS_PER_ADDRESS as usize
        );
        assert_eq!(mgr.len(), 1, "aliases share one statistics record");
    }

    /// Find an address in `250.1.0.0/16` whose tried slot equals `slot`,
    /// other than `taken`.
    fn colliding_address(slot: (u32, u32), taken: &net::SocketAddr) -> net::SocketAddr {
        for x in 0..=255u8 {
            for y in 1..=254u8 {
                let candidate = sock(&format!("250.1.{}.{}:8333", x, y));
                if candidate != *taken && tried_slot(&candidate) == slot {
                    return candidate;
                }
            }
        }
        panic!("no colliding address found");
    }

    #[test]
    fn test_collision_lifecycle() {
        let mut mgr = manager();
        let source: net::IpAddr = [99, 1, 2, 3].into();
        let t0: Timestamp = 1_600_000_000;

        let a = sock("250.1.0.1:8333");
        let b = colliding_address(tried_slot(&a), &a);

        assert!(mgr.add(&[PeerAddress::new(a, ServiceFlags::NETWORK).with_time(t0 as u32)], source, 0, t0));
        assert!(mgr.mark_good(&a, t0));
        assert!(mgr.find(&a).unwrap().tried);

        // Five hours later we learn about an address contesting a's slot.
        let t1 = t0 + 5 * 60 * 60;
        assert!(mgr.add(&[PeerAddress::new(b, ServiceFlags::NETWORK).with_time(t1 as u32)], source, 0, t1));
        assert!(!mgr.mark_good(&b, t1), "the colliding promotion is deferred");
        assert!(!mgr.find(&b).unwrap().tried);
        assert_eq!(mgr.collisions.len(), 1);

        let (candidate, occupant) = mgr.select_tried_collision().unwrap();
        assert_eq!(candidate.socket, b);
        assert_eq!(occupant.socket, a);

        // Nothing resolves while the candidate is within its test window.
        mgr.resolve_collisions(t1 + 60);
        assert_eq!(mgr.collisions.len(), 1);

        // Once the window passes without the occupant being vouched for, the
        // candidate takes the slot and the occupant falls back to new.
        mgr.resolve_collisions(t1 + TEST_WINDOW + 60);
        assert!(mgr.collisions.is_empty());
        assert!(mgr.find(&b).unwrap().tried);
        assert!(!mgr.find(&a).unwrap().tried, "the occupant was evicted to new");
        assert_eq!(mgr.len(), 2, "a promotion moves at most two entries");
        assert_eq!(mgr.consistency_check(), 0);
        assert_eq!(mgr.select_tried_collision(), None);
    }

    #[test]
    fn test_collision_occupant_recently_good() {
        let mut mgr = manager();
        let source: net::IpAddr = [99, 1, 2, 3].into();
        let t0: Timestamp = 1_600_000_000;

        let a = sock("250.1.0.1:8333");
        let b = colliding_address(tried_slot(&a), &a);

        mgr.add(&[PeerAddress::new(a, ServiceFlags::NETWORK).with_time(t0 as u32)], source, 0, t0);
        mgr.mark_good(&a, t0);
        mgr.add(&[PeerAddress::new(b, ServiceFlags::NETWORK).with_time(t0 as u32)], source, 0, t0);
        mgr.mark_good(&b, t0 + 30);

        // The occupant connected recently, so the candidate is abandoned.
        mgr.resolve_collisions(t0 + 60);
        assert!(mgr.collisions.is_empty());
        assert!(mgr.find(&a).unwrap().tried);
        assert!(!mgr.find(&b).unwrap().tried);
    }

    #[test]
    fn test_collision_set_bounded() {
        let mut mgr = manager();
        let now: Timestamp = 1_600_000_000;

        // Fill a slice of the tried table.
        for i in 0..=255u8 {
            let addr = sock(&format!("250.1.{}.1:8333", i));
            mgr.add(
                &[PeerAddress::new(addr, ServiceFlags::NETWORK).with_time(now as u32)],
                [99, i, 2, 3].into(),
                0,
                now,
            );
            // Force the promotion so that the fill itself records no
            // collisions.
            mgr.good(&addr, false, now);
        }
        assert!(mgr.count_tried > SET_TRIED_COLLISION_SIZE);
        assert!(mgr.collisions.is_empty());

        // Now promote addresses that contest occupied tried slots.
        let mut collisions = 0;
        'outer: for x in 0..=255u8 {
            for y in 2..=254u8 {
                if collisions == SET_TRIED_COLLISION_SIZE + 5 {
                    break 'outer;
                }
                let addr = sock(&format!("250.1.{}.{}:8333", x, y));
                let (bucket, position) = tried_slot(&addr);
                if mgr.index.occupant(true, bucket, position).is_none() {
                    continue;
                }
                if mgr.find(&addr).is_some() {
                    continue;
                }
                if !mgr.add(
                    &[PeerAddress::new(addr, ServiceFlags::NETWORK).with_time(now as u32)],
                    [98, x, y, 3].into(),
                    0,
                    now,
                ) {
                    continue;
                }
                assert!(!mgr.mark_good(&addr, now));
                collisions += 1;
            }
        }
        assert!(collisions > SET_TRIED_COLLISION_SIZE);
        assert_eq!(mgr.collisions.len(), SET_TRIED_COLLISION_SIZE);
        assert_eq!(mgr.consistency_check(), 0);
    }

    #[test]
    fn test_select_empty() {
        let mgr = manager();
        assert_eq!(mgr.select(false, 1_600_000_000), None);
        assert_eq!(mgr.select(true, 1_600_000_000), None);
    }

    #[test]
    fn test_select_support() {
        let mut mgr = manager();
        let now: Timestamp = 1_600_000_000;
        let mut added = BTreeSet::new();

        for i in 0..12u8 {
            let addr = sock(&format!("{}.{}.1.2:8333", 40 + i, i));
            if mgr.add(
                &[PeerAddress::new(addr, ServiceFlags::NETWORK).with_time(now as u32)],
                [99, i, 2, 3].into(),
                0,
                now,
            ) {
                added.insert(addr);
            }
        }
        assert!(!added.is_empty());

        // Repeated selection reaches every non-terrible entry.
        let mut sampled = BTreeSet::new();
        for _ in 0..2000 {
            let (addr, _) = mgr.select(true, now).unwrap();
            sampled.insert(addr.socket);
        }
        assert_eq!(sampled, added);
    }

    #[test]
    fn test_select_returns_last_try() {
        let mut mgr = manager();
        let now: Timestamp = 1_600_000_000;
        let addr = peer("250.1.2.3:8333", now as u32);

        mgr.add(&[addr], [99, 1, 2, 3].into(), 0, now);
        mgr.attempt(&addr.socket, false, now + 100);

        let (selected, last_try) = mgr.select(false, now + 2000).unwrap();
        assert_eq!(selected.socket, addr.socket);
        assert_eq!(last_try, now + 100);
    }

    #[test]
    fn test_get_addr_limits() {
        let mut mgr = manager();
        let now: Timestamp = 1_600_000_000;

        for i in 0..40u8 {
            let addr = sock(&format!("{}.{}.1.2:8333", 40 + i, i));
            mgr.add(
                &[PeerAddress::new(addr, ServiceFlags::NETWORK).with_time(now as u32)],
                [99, i, 2, 3].into(),
                0,
                now,
            );
        }
        let total = mgr.len();

        assert!(mgr.get_addr(10, 0, None, now).len() <= 10);
        assert!(mgr.get_addr(0, 50, None, now).len() <= total / 2);
        assert_eq!(mgr.get_addr(0, 0, None, now).len(), total);
        assert!(mgr.get_addr(0, 0, Some(Domain::IPV6), now).is_empty());
        assert_eq!(mgr.get_addr(0, 0, Some(Domain::IPV4), now).len(), total);
        assert_eq!(mgr.consistency_check(), 0);
    }

    #[test]
    fn test_get_addr_skips_terrible() {
        let mut mgr = manager();
        let now: Timestamp = 1_600_000_000;

        // One healthy entry, one that was never seen alive.
        mgr.add(&[peer("250.1.2.3:8333", now as u32)], [99, 1, 2, 3].into(), 0, now);
        mgr.add(&[peer("251.1.2.3:8333", 0)], [99, 1, 2, 3].into(), 0, now);
        assert_eq!(mgr.len(), 2);

        let addrs = mgr.get_addr(0, 0, None, now);
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].socket, sock("250.1.2.3:8333"));
    }

    #[test]
    fn test_size_of() {
        let mut mgr = manager();
        let now: Timestamp = 1_600_000_000;

        mgr.add(&[peer("250.1.2.3:8333", now as u32)], [99, 1, 2, 3].into(), 0, now);
        mgr.add(&[peer("251.1.2.3:8333", now as u32)], [99, 1, 2, 3].into(), 0, now);
        mgr.mark_good(&sock("250.1.2.3:8333"), now);

        assert_eq!(mgr.size_of(None, None), 2);
        assert_eq!(mgr.size_of(None, Some(true)), 1);
        assert_eq!(mgr.size_of(None, Some(false)), 1);
        assert_eq!(mgr.size_of(Some(Domain::IPV4), None), 2);
        assert_eq!(mgr.size_of(Some(Domain::IPV6), None), 0);
    }

    #[quickcheck]
    fn prop_single_source_bucket_ceiling(seed: u64) -> bool {
        let mut mgr = manager();
        let rng = Rng::with_seed(seed);
        let source: net::IpAddr = [99, 1, 2, 3].into();
        let now: Timestamp = 1_600_000_000;

        for _ in 0..200 {
            let addr: net::SocketAddr = net::SocketAddr::new(
                [
                    33 + rng.randrange(200) as u8,
                    rng.randrange(255) as u8,
                    rng.randrange(255) as u8,
                    1 + rng.randrange(254) as u8,
                ]
                .into(),
                8333,
            );
            mgr.add(
                &[PeerAddress::new(addr, ServiceFlags::NETWORK).with_time(now as u32)],
                source,
                0,
                now,
            );
        }
        // A single source group spreads over a bounded set of new buckets.
        mgr.consistency_check() == 0
            && mgr.new_buckets_used() as u64 <= crate::hasher::NEW_BUCKETS_PER_SOURCE_GROUP
    }

    #[quickcheck]
    fn prop_same_group_single_bucket(seed: u64) -> TestResult {
        let mut mgr = manager();
        let rng = Rng::with_seed(seed);
        let source: net::IpAddr = [99, 1, 2, 3].into();
        let now: Timestamp = 1_600_000_000;

        for _ in 0..100 {
            let addr: net::SocketAddr = net::SocketAddr::new(
                [250, 7, rng.randrange(255) as u8, 1 + rng.randrange(254) as u8].into(),
                8333,
            );
            mgr.add(
                &[PeerAddress::new(addr, ServiceFlags::NETWORK).with_time(now as u32)],
                source,
                0,
                now,
            );
        }
        if mgr.is_empty() {
            return TestResult::discard();
        }
        // One address group announced by one source group shares one bucket.
        TestResult::from_bool(
            mgr.new_buckets_used() == 1 && mgr.len() <= BUCKET_SIZE as usize,
        )
    }
}
