//! Thread-safe address book facade.
//!
//! Wraps [`AddressManager`] behind a single exclusive mutex and runs the
//! probabilistic consistency check around every operation. No method yields
//! a reference into internal state; everything returned is a snapshot.

use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::net;
use std::path::Path;
use std::sync::Mutex;

use bitcoin::network::constants::ServiceFlags;

use crate::entry::PeerAddress;
use crate::error::Error;
use crate::manager::{AddressManager, AddressPosition};
use crate::netgroup::{Domain, NetGroupManager};
use crate::rng::Rng;
use crate::Timestamp;

/// Address book construction options.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// Seed the random source with a fixed value, making table evolution
    /// reproducible. Intended for tests and replay.
    pub deterministic: bool,
    /// Run a full consistency check after one in this many operations.
    /// Zero disables checking.
    pub consistency_check_ratio: i32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            deterministic: false,
            consistency_check_ratio: 0,
        }
    }
}

/// A synchronized book of peer addresses.
///
/// All methods take `&self` and may be called from any thread; operations
/// are serialized internally by one exclusive lock and are linearizable.
pub struct AddressBook {
    inner: Mutex<AddressManager>,
}

impl AddressBook {
    /// Create an empty address book using the given network-group oracle.
    pub fn new(options: Options, netgroup: Box<dyn NetGroupManager>) -> Self {
        let rng = if options.deterministic {
            Rng::with_seed(1)
        } else {
            Rng::new()
        };
        Self {
            inner: Mutex::new(AddressManager::new(
                netgroup,
                rng,
                options.consistency_check_ratio,
            )),
        }
    }

    /// Run an operation under the lock, bracketed by probabilistic checks.
    fn with<T>(&self, f: impl FnOnce(&mut AddressManager) -> T) -> T {
        let mut inner = self.inner.lock().expect("address book: lock poisoned");

        inner.check();
        let result = f(&mut inner);
        inner.check();

        result
    }

    /// Add addresses learned from `source`. See [`AddressManager::add`].
    pub fn add(
        &self,
        addrs: &[PeerAddress],
        source: net::IpAddr,
        time_penalty: Timestamp,
        now: Timestamp,
    ) -> bool {
        self.with(|m| m.add(addrs, source, time_penalty, now))
    }

    /// Mark an address as just successfully connected. See
    /// [`AddressManager::mark_good`].
    pub fn mark_good(&self, addr: &net::SocketAddr, now: Timestamp) -> bool {
        self.with(|m| m.mark_good(addr, now))
    }

    /// Record a connection attempt. See [`AddressManager::attempt`].
    pub fn attempt(&self, addr: &net::SocketAddr, count_failure: bool, now: Timestamp) {
        self.with(|m| m.attempt(addr, count_failure, now))
    }

    /// Note an established connection. See [`AddressManager::connected`].
    pub fn connected(&self, addr: &net::SocketAddr, now: Timestamp) {
        self.with(|m| m.connected(addr, now))
    }

    /// Overwrite an address's service bits. See
    /// [`AddressManager::set_services`].
    pub fn set_services(&self, addr: &net::SocketAddr, services: ServiceFlags) {
        self.with(|m| m.set_services(addr, services))
    }

    /// Select an address to connect to. See [`AddressManager::select`].
    pub fn select(&self, new_only: bool, now: Timestamp) -> Option<(PeerAddress, Timestamp)> {
        self.with(|m| m.select(new_only, now))
    }

    /// Return a random sample of known addresses. See
    /// [`AddressManager::get_addr`].
    pub fn get_addr(
        &self,
        max_count: usize,
        max_pct: usize,
        domain: Option<Domain>,
        now: Timestamp,
    ) -> Vec<PeerAddress> {
        self.with(|m| m.get_addr(max_count, max_pct, domain, now))
    }

    /// Work through the tried-table collision set. See
    /// [`AddressManager::resolve_collisions`].
    pub fn resolve_collisions(&self, now: Timestamp) {
        self.with(|m| m.resolve_collisions(now))
    }

    /// Pick a pending collision and the entry it contests. See
    /// [`AddressManager::select_tried_collision`].
    pub fn select_tried_collision(&self) -> Option<(PeerAddress, PeerAddress)> {
        self.with(|m| m.select_tried_collision())
    }

    /// Locate an address in the table. See [`AddressManager::find`].
    pub fn find(&self, addr: &net::SocketAddr) -> Option<AddressPosition> {
        self.with(|m| m.find(addr))
    }

    /// The number of unique addresses known.
    pub fn len(&self) -> usize {
        self.with(|m| m.len())
    }

    /// Whether any addresses are known.
    pub fn is_empty(&self) -> bool {
        self.with(|m| m.is_empty())
    }

    /// Count addresses by domain and/or table. See
    /// [`AddressManager::size_of`].
    pub fn size_of(&self, domain: Option<Domain>, in_new: Option<bool>) -> usize {
        self.with(|m| m.size_of(domain, in_new))
    }

    /// The number of distinct new-table buckets currently occupied.
    pub fn new_buckets_used(&self) -> usize {
        self.with(|m| m.new_buckets_used())
    }

    /// Serialize the book into a writer.
    pub fn serialize<W: io::Write>(&self, mut writer: W) -> Result<(), Error> {
        self.with(|m| m.encode(&mut writer))
    }

    /// Replace the book's contents with a serialized table. On failure the
    /// book is left empty.
    pub fn deserialize<R: io::Read>(&self, mut reader: R) -> Result<(), Error> {
        self.with(|m| m.decode(&mut reader))
    }

    /// Serialize the book to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let file = File::create(path)?;
        self.serialize(BufWriter::new(file))
    }

    /// Load the book from a file previously written by
    /// [`AddressBook::save`]. A missing file leaves the book unchanged.
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        self.deserialize(BufReader::new(file))
    }
}
