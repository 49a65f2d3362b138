//! Keyed hashes that place addresses into buckets.
//!
//! All placement decisions are made by short keyed hashes of the address,
//! its network group, and (for the new table) the group of the source that
//! announced it. The key is secret and local to one table; it is never
//! transmitted, so the hash does not need to be cryptographically strong,
//! only deterministic, keyed and well-distributed. We use SipHash-2-4.

use std::convert::TryInto;
use std::net;

use bitcoin_hashes::siphash24;

/// Total number of buckets in the tried table.
pub const TRIED_BUCKET_COUNT: u32 = 256;

/// Total number of buckets in the new table.
pub const NEW_BUCKET_COUNT: u32 = 1024;

/// Number of positions per bucket, in both tables.
pub const BUCKET_SIZE: u32 = 64;

/// Over how many tried buckets addresses from a single group are spread.
pub const TRIED_BUCKETS_PER_GROUP: u64 = 8;

/// Over how many new buckets addresses from a single source group are spread.
pub const NEW_BUCKETS_PER_SOURCE_GROUP: u64 = 64;

/// Maximum number of times a single address can occur in the new table.
pub const NEW_BUCKETS_PER_ADDRESS: u32 = 8;

/// Computes bucket and in-bucket positions from a 256-bit secret key.
#[derive(Debug, Clone)]
pub struct BucketHasher {
    key: [u8; 32],
}

impl BucketHasher {
    /// Create a hasher from a secret key.
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// The secret key this hasher was created with.
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// The tried bucket for an address in the given network group.
    pub fn tried_bucket(&self, addr: &net::SocketAddr, group: &[u8]) -> u32 {
        let service = encode_service(addr);
        let h1 = self.short_hash(&[&service]);
        let h2 = self.short_hash(&[group, &(h1 % TRIED_BUCKETS_PER_GROUP).to_le_bytes()]);

        (h2 % TRIED_BUCKET_COUNT as u64) as u32
    }

    /// The new bucket for an address group announced by a source group.
    pub fn new_bucket(&self, addr_group: &[u8], source_group: &[u8]) -> u32 {
        let h1 = self.short_hash(&[addr_group, source_group]);
        let h2 =
            self.short_hash(&[source_group, &(h1 % NEW_BUCKETS_PER_SOURCE_GROUP).to_le_bytes()]);

        (h2 % NEW_BUCKET_COUNT as u64) as u32
    }

    /// The position of an address within the given bucket.
    pub fn position(&self, new_table: bool, bucket: u32, addr: &net::SocketAddr) -> u32 {
        let service = encode_service(addr);
        let table: &[u8] = if new_table { b"N" } else { b"K" };
        let h = self.short_hash(&[table, &bucket.to_le_bytes(), &service]);

        (h % BUCKET_SIZE as u64) as u32
    }

    /// Keyed 64-bit hash of a canonical serialization of `parts`.
    ///
    /// SipHash keys cover only 128 bits; the remaining half of the bucket
    /// key is mixed in as a data prefix. Parts are length-prefixed so that
    /// distinct argument lists never serialize identically.
    fn short_hash(&self, parts: &[&[u8]]) -> u64 {
        let mut data = Vec::with_capacity(64);
        data.extend_from_slice(&self.key[16..]);

        for part in parts {
            debug_assert!(part.len() <= u8::MAX as usize);
            data.push(part.len() as u8);
            data.extend_from_slice(part);
        }
        let k0 = u64::from_le_bytes(self.key[..8].try_into().unwrap());
        let k1 = u64::from_le_bytes(self.key[8..16].try_into().unwrap());

        siphash24::Hash::hash_with_keys(k0, k1, &data).as_u64()
    }
}

/// Canonical byte serialization of a service endpoint: address octets
/// followed by the port, big-endian.
pub(crate) fn encode_service(addr: &net::SocketAddr) -> Vec<u8> {
    let mut buf = Vec::with_capacity(18);
    match addr.ip() {
        net::IpAddr::V4(ip) => buf.extend_from_slice(&ip.octets()),
        net::IpAddr::V6(ip) => buf.extend_from_slice(&ip.octets()),
    }
    buf.extend_from_slice(&addr.port().to_be_bytes());
    buf
}
