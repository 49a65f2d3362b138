//! Versioned byte-stream format for the address table.
//!
//! Layout (all integers little-endian unless noted):
//!
//! ```text
//! format          : u8        // current = 5
//! compat          : u8        // 32 + lowest compatible format
//! key             : 32 bytes  // bucketing secret
//! count_new       : i32
//! count_tried     : i32
//! count_new + count_tried records, new first, in bucket order:
//!     time        : u32       // address record, version-2 encoding
//!     services    : varint
//!     address     : addrv2
//!     port        : u16 BE
//!     last_try, last_counted, last_success : i64
//!     attempts    : i32
//!     new records: source count (u32), then that many sources (addrv2)
//!     tried records: exactly one source, no count
//! ```
//!
//! Formats 0 through 4 are the historic layouts: one full record per slot
//! with a single source, followed by per-bucket index tables (discarded on
//! load; entries are re-bucketed under the stream's key) and, from format 2,
//! a group-map checksum. A format higher than 5 is parsed as long as the
//! stream declares compatibility with 5 or lower.

use std::io::{Read, Write};
use std::net;

use bitcoin::consensus::encode::{Decodable, Encodable, VarInt};
use bitcoin::network::address::AddrV2;
use bitcoin::network::constants::ServiceFlags;

use crate::entry::{Entry, PeerAddress, Stats};
use crate::error::Error;
use crate::hasher::{
    BUCKET_SIZE, NEW_BUCKETS_PER_ADDRESS, NEW_BUCKET_COUNT, TRIED_BUCKET_COUNT,
};
use crate::manager::{rebucket, AddressManager};

/// The format this software serializes, and the maximum it can parse.
pub(crate) const FILE_FORMAT: u8 = 5;

/// The lowest format the current layout is compatible with. Incremented
/// whenever an incompatible change is made.
const LOWEST_COMPATIBLE: u8 = 5;

/// Base value of the compatibility byte. This is 32 because the field
/// overtook what was historically the key-size prefix.
const INCOMPATIBILITY_BASE: u8 = 32;

impl AddressManager {
    /// Serialize the table. Always writes the latest format.
    pub(crate) fn encode<W: Write>(&self, w: &mut W) -> Result<(), Error> {
        FILE_FORMAT.consensus_encode(&mut *w)?;
        (INCOMPATIBILITY_BASE + LOWEST_COMPATIBLE).consensus_encode(&mut *w)?;
        w.write_all(self.hasher.key())?;
        (self.count_new as i32).consensus_encode(&mut *w)?;
        (self.count_tried as i32).consensus_encode(&mut *w)?;

        for id in self.index.iter_bucket_order() {
            let entry = self.index.get(id).expect("bucket view is consistent");
            // Aliases are written as extra sources of their canonical entry.
            if entry.is_alias() {
                continue;
            }
            let stats = &self.stats[entry.stats.expect("checked above")];

            write_address(w, &entry.addr, stats)?;
            stats.last_try.consensus_encode(&mut *w)?;
            stats.last_counted.consensus_encode(&mut *w)?;
            stats.last_success.consensus_encode(&mut *w)?;
            stats.attempts.consensus_encode(&mut *w)?;

            if entry.in_tried {
                debug_assert_eq!(self.index.multiplicity(&entry.addr), 1);
                write_source(w, &entry.source)?;
            } else {
                let count = self.index.multiplicity(&entry.addr) as u32;
                count.consensus_encode(&mut *w)?;
                write_source(w, &entry.source)?;
                for alias in self.index.aliases(&entry.addr) {
                    let alias = self.index.get(alias).expect("address view is consistent");
                    write_source(w, &alias.source)?;
                }
            }
        }
        Ok(())
    }

    /// Replace the table with the contents of a stream. On failure the table
    /// is left empty.
    pub(crate) fn decode<R: Read>(&mut self, r: &mut R) -> Result<(), Error> {
        self.clear();
        self.decode_inner(r).map_err(|err| {
            self.clear();
            err
        })
    }

    fn decode_inner<R: Read>(&mut self, r: &mut R) -> Result<(), Error> {
        let format = u8::consensus_decode(&mut *r)?;
        let compat = u8::consensus_decode(&mut *r)?;
        let lowest_compatible = compat
            .checked_sub(INCOMPATIBILITY_BASE)
            .ok_or_else(|| Error::Corrupt(format!("invalid compatibility byte {}", compat)))?;
        if lowest_compatible > FILE_FORMAT {
            return Err(Error::UnsupportedFormat {
                format,
                lowest_compatible,
                max: FILE_FORMAT,
            });
        }

        let mut key = [0; 32];
        r.read_exact(&mut key)?;
        self.set_key(key);

        let count_new = i32::consensus_decode(&mut *r)?;
        let count_tried = i32::consensus_decode(&mut *r)?;
        if count_new < 0 || count_new > (NEW_BUCKET_COUNT * BUCKET_SIZE) as i32 {
            return Err(Error::Corrupt(format!("impossible new count {}", count_new)));
        }
        if count_tried < 0 || count_tried > (TRIED_BUCKET_COUNT * BUCKET_SIZE) as i32 {
            return Err(Error::Corrupt(format!(
                "impossible tried count {}",
                count_tried
            )));
        }

        let mut legacy_buckets = 0;
        if format < FILE_FORMAT {
            legacy_buckets = i32::consensus_decode(&mut *r)?;
            if format >= 1 {
                legacy_buckets ^= 1 << 30;
            }
            if legacy_buckets < 0 || legacy_buckets > (1 << 16) {
                return Err(Error::Corrupt(format!(
                    "impossible bucket count {}",
                    legacy_buckets
                )));
            }
        }

        let mut lost = 0;
        for i in 0..count_new + count_tried {
            let in_tried = i >= count_new;
            let (addr, stats, sources) = if format >= FILE_FORMAT {
                let addr = read_address(r)?;
                let mut stats = Stats::new(addr.time, addr.services);
                stats.last_try = i64::consensus_decode(&mut *r)?;
                stats.last_counted = i64::consensus_decode(&mut *r)?;
                stats.last_success = i64::consensus_decode(&mut *r)?;
                stats.attempts = i32::consensus_decode(&mut *r)?;

                let count = if in_tried {
                    1
                } else {
                    u32::consensus_decode(&mut *r)?
                };
                if count > NEW_BUCKETS_PER_ADDRESS {
                    return Err(Error::Corrupt(format!("impossible source count {}", count)));
                }
                let mut sources = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    sources.push(read_source(r, format)?);
                }
                (addr, stats, sources)
            } else {
                let addr = read_address_legacy(r, format)?;
                let source = read_source(r, format)?;
                let last_success = i64::consensus_decode(&mut *r)?;
                let attempts = i32::consensus_decode(&mut *r)?;

                let mut stats = Stats::new(addr.time, addr.services);
                // The historic layouts carried no last-try stamp. Estimating
                // it as the last success avoids hammering previously-good
                // peers right after an upgrade.
                stats.last_try = last_success;
                stats.last_success = last_success;
                stats.attempts = attempts;
                (addr, stats, vec![source])
            };

            for source in sources {
                let mut entry = Entry::new(addr.socket, source);
                entry.in_tried = in_tried;
                rebucket(&self.hasher, self.netgroup.as_ref(), &mut entry);

                // If another entry already occupies this slot, evict it.
                if let Some(occupant) = self.index.occupant(in_tried, entry.bucket, entry.bucket_pos)
                {
                    self.erase(occupant);
                    lost += 1;
                }
                // If the service is already present: a new entry becomes an
                // alias; a tried entry replaces all existing copies, since a
                // service is never in both tables and never aliased in tried.
                let mut alias = false;
                if self.index.canonical(&addr.socket).is_some() {
                    if in_tried {
                        while let Some(existing) = self.index.canonical(&addr.socket) {
                            self.erase(existing);
                            lost += 1;
                        }
                    } else {
                        alias = true;
                    }
                }
                self.insert_entry(entry, stats.clone(), alias);
            }
        }

        // Historic bucket tables and the group-map checksum are discarded;
        // entries have already been re-bucketed under the stream's key.
        if format < FILE_FORMAT {
            for _ in 0..legacy_buckets {
                let entries = i32::consensus_decode(&mut *r)?;
                for _ in 0..entries {
                    i32::consensus_decode(&mut *r)?;
                }
            }
            if format >= 2 {
                let mut checksum = [0; 32];
                r.read_exact(&mut checksum)?;
            }
        }
        if lost > 0 {
            log::warn!("{} address(es) lost to collisions while loading", lost);
        }

        let code = self.consistency_check();
        if code != 0 {
            return Err(Error::Corrupt(format!(
                "consistency check failed with code {}",
                code
            )));
        }
        Ok(())
    }
}

fn addrv2(ip: &net::IpAddr) -> AddrV2 {
    match ip {
        net::IpAddr::V4(ip) => AddrV2::Ipv4(*ip),
        net::IpAddr::V6(ip) => AddrV2::Ipv6(*ip),
    }
}

fn ip_from_addrv2(addr: AddrV2) -> Result<net::IpAddr, Error> {
    match addr {
        AddrV2::Ipv4(ip) => Ok(net::IpAddr::V4(ip)),
        AddrV2::Ipv6(ip) => Ok(net::IpAddr::V6(ip)),
        _ => Err(Error::Corrupt("unsupported address network".to_owned())),
    }
}

fn write_address<W: Write>(w: &mut W, addr: &net::SocketAddr, stats: &Stats) -> Result<(), Error> {
    stats.time.consensus_encode(&mut *w)?;
    VarInt(stats.services.as_u64()).consensus_encode(&mut *w)?;
    addrv2(&addr.ip()).consensus_encode(&mut *w)?;
    w.write_all(&addr.port().to_be_bytes())?;
    Ok(())
}

fn read_address<R: Read>(r: &mut R) -> Result<PeerAddress, Error> {
    let time = u32::consensus_decode(&mut *r)?;
    let services = ServiceFlags::from(VarInt::consensus_decode(&mut *r)?.0);
    let ip = ip_from_addrv2(AddrV2::consensus_decode(&mut *r)?)?;
    let port = read_port(r)?;

    Ok(PeerAddress {
        socket: net::SocketAddr::new(ip, port),
        services,
        time,
    })
}

fn read_address_legacy<R: Read>(r: &mut R, format: u8) -> Result<PeerAddress, Error> {
    if format >= 3 {
        return read_address(r);
    }
    let time = u32::consensus_decode(&mut *r)?;
    let services = ServiceFlags::from(u64::consensus_decode(&mut *r)?);
    let ip = read_ip16(r)?;
    let port = read_port(r)?;

    Ok(PeerAddress {
        socket: net::SocketAddr::new(ip, port),
        services,
        time,
    })
}

fn write_source<W: Write>(w: &mut W, source: &net::IpAddr) -> Result<(), Error> {
    addrv2(source).consensus_encode(&mut *w)?;
    Ok(())
}

fn read_source<R: Read>(r: &mut R, format: u8) -> Result<net::IpAddr, Error> {
    if format >= 3 {
        ip_from_addrv2(AddrV2::consensus_decode(&mut *r)?)
    } else {
        read_ip16(r)
    }
}

/// A fixed-size address in the historic 16-byte layout: IPv6 octets, with
/// IPv4 as a mapped address.
fn read_ip16<R: Read>(r: &mut R) -> Result<net::IpAddr, Error> {
    const MAPPED_PREFIX: [u8; 12] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff];

    let mut octets = [0; 16];
    r.read_exact(&mut octets)?;

    if octets[..12] == MAPPED_PREFIX {
        let ip: [u8; 4] = [octets[12], octets[13], octets[14], octets[15]];
        Ok(net::IpAddr::from(ip))
    } else {
        Ok(net::IpAddr::from(octets))
    }
}

fn read_port<R: Read>(r: &mut R) -> Result<u16, Error> {
    let mut port = [0; 2];
    r.read_exact(&mut port)?;
    Ok(u16::from_be_bytes(port))
}
