//! In-memory database of peer network addresses, bucketed to resist
//! adversarial insertion and weighted towards recently-successful peers.
//!
//! Addresses learned from the network go into a *new* table, bucketed by a
//! keyed hash of the address group and the group of the peer that told us
//! about it, so that no single network neighbourhood can claim more than a
//! bounded share of the table. Once we successfully connect to an address it
//! is promoted to the *tried* table; collisions there are resolved with a
//! test-before-evict discipline. [`AddressManager`] is the unsynchronized
//! core; [`AddressBook`] wraps it in a mutex and runs probabilistic
//! consistency checks around every operation.
//!
//! The whole table serializes to a small, versioned byte stream and can be
//! restored from it, re-bucketing entries under the persisted secret key.
#![allow(clippy::collapsible_else_if)]
#![deny(missing_docs, unsafe_code)]
pub mod book;
pub mod entry;
pub mod error;
pub mod hasher;
pub mod manager;
pub mod netgroup;
pub mod rng;

mod codec;
mod index;

pub use bitcoin;

pub use book::{AddressBook, Options};
pub use entry::PeerAddress;
pub use error::Error;
pub use manager::{AddressManager, AddressPosition};
pub use netgroup::{Domain, NetGroupManager, PrefixGroup};
pub use rng::Rng;

/// Wall-clock seconds since the Unix epoch, as supplied by the caller.
///
/// The core never reads a clock itself; every operation that needs "now"
/// takes it as an argument, which keeps replays deterministic.
pub type Timestamp = i64;

/// Network-propagated freshness stamp carried by gossiped addresses.
pub type AddrTime = u32;
