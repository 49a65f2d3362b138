//! Address records and their statistics.

use std::fmt;
use std::net;

use bitcoin::network::constants::ServiceFlags;

use crate::index::EntryId;
use crate::{AddrTime, Timestamp};

/// How old addresses can maximally be before they are forgotten.
pub const HORIZON_DAYS: i64 = 30;

/// After how many failed attempts we give up on a never-successful address.
pub const RETRIES: i32 = 3;

/// How many successive failures are allowed...
pub const MAX_FAILURES: i32 = 10;

/// ... in at least this many days.
pub const MIN_FAIL_DAYS: i64 = 7;

/// A peer address as gossiped on the network, and as returned by selection
/// and enumeration. Snapshots only; never a view into the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddress {
    /// The peer endpoint. Ports are part of the identity.
    pub socket: net::SocketAddr,
    /// Advertised service bits.
    pub services: ServiceFlags,
    /// Network-propagated freshness stamp, seconds since the epoch.
    pub time: AddrTime,
}

impl PeerAddress {
    /// Create an address with a zero freshness stamp.
    pub fn new(socket: net::SocketAddr, services: ServiceFlags) -> Self {
        Self {
            socket,
            services,
            time: 0,
        }
    }

    /// Set the freshness stamp.
    pub fn with_time(mut self, time: AddrTime) -> Self {
        self.time = time;
        self
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket)
    }
}

/// One slot occupancy in the table. A service has exactly one canonical
/// entry carrying its statistics; in the new table it may additionally
/// occupy up to [`crate::hasher::NEW_BUCKETS_PER_ADDRESS`] alias slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Entry {
    /// The peer endpoint this slot holds.
    pub addr: net::SocketAddr,
    /// Where knowledge of this address first came from.
    pub source: net::IpAddr,
    /// Whether the entry lives in the tried table.
    pub in_tried: bool,
    /// Current bucket; always equal to what the hasher would compute.
    pub bucket: u32,
    /// Current position within the bucket.
    pub bucket_pos: u32,
    /// Position in the statistics vector, or `None` for an alias.
    pub stats: Option<usize>,
}

impl Entry {
    pub fn new(addr: net::SocketAddr, source: net::IpAddr) -> Self {
        Self {
            addr,
            source,
            in_tried: false,
            bucket: 0,
            bucket_pos: 0,
            stats: None,
        }
    }

    pub fn is_alias(&self) -> bool {
        self.stats.is_none()
    }
}

/// Statistics about one service, shared by all its aliases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Stats {
    /// The canonical entry these statistics belong to.
    pub entry: EntryId,
    /// Last connection attempt whatsoever.
    pub last_try: Timestamp,
    /// Last attempt that was counted toward the failure counter.
    pub last_counted: Timestamp,
    /// Last successful connection.
    pub last_success: Timestamp,
    /// Connection attempts since the last success.
    pub attempts: i32,
    /// Network-propagated freshness stamp.
    pub time: AddrTime,
    /// Advertised service bits.
    pub services: ServiceFlags,
}

impl Stats {
    pub fn new(time: AddrTime, services: ServiceFlags) -> Self {
        Self {
            entry: EntryId::NONE,
            last_try: 0,
            last_counted: 0,
            last_success: 0,
            attempts: 0,
            time,
            services,
        }
    }

    /// Whether these statistics are bad enough that the entry can simply be
    /// discarded or overwritten.
    pub fn is_terrible(&self, now: Timestamp) -> bool {
        // Never remove things tried in the last minute.
        if self.last_try != 0 && self.last_try >= now - 60 {
            return false;
        }
        // Came in a flying DeLorean.
        if self.time as Timestamp > now + 10 * 60 {
            return true;
        }
        // Not seen in recent history.
        if self.time == 0 || now - self.time as Timestamp > HORIZON_DAYS * 24 * 60 * 60 {
            return true;
        }
        // Tried N times and never a success.
        if self.last_success == 0 && self.attempts >= RETRIES {
            return true;
        }
        // N successive failures in the last week.
        if now - self.last_success > MIN_FAIL_DAYS * 24 * 60 * 60 && self.attempts >= MAX_FAILURES {
            return true;
        }
        false
    }

    /// The relative chance this entry should be given when selecting a peer
    /// to connect to.
    pub fn chance(&self, now: Timestamp) -> f64 {
        let mut chance = 1.0;
        let since_last_try = (now - self.last_try).max(0);

        // Deprioritize very recent attempts away.
        if since_last_try < 60 * 10 {
            chance *= 0.01;
        }
        // Deprioritize 66% after each failed attempt, but at most 1/28th to
        // avoid the search taking forever or overly penalizing outages.
        chance *= 0.66f64.powi(self.attempts.min(8));

        chance
    }
}
