//! Address and prefix generation.
//!
//! Candidates come from an MD5 of the client identifier with the pool's
//! network bits laid over the top. A collision appends the rejected
//! candidate to the seed and hashes again, so a given client walks the same
//! chain of candidates every time. MD5 only spreads addresses around the
//! pool; nothing here is a security boundary.

use std::net::Ipv6Addr;

use md5::{Digest, Md5};
use rand::Rng;
use tracing::{debug, error};

use crate::db::LeaseDb;
use crate::error::{LeaseError, LeaseResult};
use crate::lease::{ADDRESS_PREFIX_LEN, Lease, LeaseId, PoolId, ResourceType, Timestamp};

/// Generation attempts before an address pool is reported exhausted.
pub const ADDRESS_ATTEMPTS: u32 = 100;

/// Generation attempts before a prefix pool is reported exhausted.
pub const PREFIX_ATTEMPTS: u32 = 10;

/// Host bits kept from the hash in the byte that straddles the network
/// boundary, indexed by `bits % 8`.
const HOST_MASKS: [u8; 8] = [0xff, 0x7f, 0x3f, 0x1f, 0x0f, 0x07, 0x03, 0x01];

/// Bits kept in the last byte of a delegated prefix, indexed by
/// `prefix_len % 8`.
const PREFIX_MASKS: [u8; 8] = [0x00, 0x80, 0xc0, 0xe0, 0xf0, 0xf8, 0xfc, 0xfe];

/// Universal/local bit of the interface identifier.
const U_BIT: u8 = 0x02;

fn md5(parts: &[&[u8]]) -> [u8; 16] {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Copy the first `bits` bits of `net` over `out`.
fn overlay_network(out: &mut [u8; 16], net: &[u8; 16], bits: u8) {
    let whole = usize::from(bits / 8).min(16);
    out[..whole].copy_from_slice(&net[..whole]);
    let partial = usize::from(bits % 8);
    if partial != 0 && whole < 16 {
        let host = HOST_MASKS[partial];
        out[whole] = (out[whole] & host) | (net[whole] & !host);
    }
}

/// Deterministic candidate address for `input` inside `net/bits`.
pub fn build_address(net: Ipv6Addr, bits: u8, input: &[u8]) -> Ipv6Addr {
    let mut addr = md5(&[input]);
    overlay_network(&mut addr, &net.octets(), bits);
    if bits == 64 {
        addr[8] &= !U_BIT;
    }
    Ipv6Addr::from(addr)
}

/// Candidate prefix of length `prefix_len` inside `net/pool_bits`: the hash
/// fills the bits between the two lengths and everything after is zeroed.
pub fn build_prefix(net: Ipv6Addr, pool_bits: u8, prefix_len: u8, input: &[u8]) -> Ipv6Addr {
    let mut pref = md5(&[input]);
    overlay_network(&mut pref, &net.octets(), pool_bits);

    let last = usize::from(prefix_len / 8);
    if last < 16 {
        for byte in &mut pref[last + 1..] {
            *byte = 0;
        }
        pref[last] &= PREFIX_MASKS[usize::from(prefix_len % 8)];
    }
    Ipv6Addr::from(pref)
}

/// Subnet-router anycast (all-zero IID) and the reserved subnet anycast
/// block `::fdff:ffff:ffff:ff80/121`.
pub fn is_reserved_iid(addr: Ipv6Addr) -> bool {
    let octets = addr.octets();
    let iid = &octets[8..];
    if iid.iter().all(|b| *b == 0) {
        return true;
    }
    iid[0] == 0xfd && iid[1..7].iter().all(|b| *b == 0xff) && iid[7] & 0x80 != 0
}

/// Temporary-address generator in the style of RFC 4941 §3.2.1. The history
/// value carries over between calls and is seeded from the OS RNG on first
/// use, so its output is not reproducible across processes.
#[derive(Debug, Default)]
pub struct TemporaryGenerator {
    history: [u8; 8],
    counter: u64,
}

impl TemporaryGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a known history instead of the RNG.
    pub fn with_history(history: [u8; 8]) -> Self {
        Self { history, counter: 1 }
    }

    pub fn build(&mut self, net: Ipv6Addr, bits: u8, input: &[u8]) -> Ipv6Addr {
        if self.counter == 0 {
            rand::rng().fill(&mut self.history);
        }

        let md = md5(&[&self.history, input]);
        let net = net.octets();
        let mut addr = [0u8; 16];
        if bits == 64 {
            addr[..8].copy_from_slice(&net[..8]);
            addr[8..].copy_from_slice(&md[..8]);
            addr[8] &= !U_BIT;
        } else {
            let whole = usize::from(bits / 8).min(16);
            addr[whole..].copy_from_slice(&md[..16 - whole]);
            overlay_network(&mut addr, &net, bits);
        }

        self.history.copy_from_slice(&md[8..]);
        self.counter = self.counter.wrapping_add(1);
        Ipv6Addr::from(addr)
    }
}

impl LeaseDb {
    /// Pick a free address in an NA or TA pool for `client_id` and add it
    /// as an active lease ending at `soft_expiry`. Also returns how many
    /// candidates were tried, which grows as the pool fills up.
    pub fn create_address(
        &mut self,
        pool: PoolId,
        client_id: &[u8],
        soft_expiry: Timestamp,
    ) -> LeaseResult<(LeaseId, u32)> {
        let p = self.pool_ref(pool)?;
        let (resource_type, start, bits) = (p.resource_type(), p.start(), p.bits());
        if resource_type == ResourceType::Pd {
            error!("create_address: prefix pool {}/{}", start, bits);
            return Err(LeaseError::InvalidArgument("prefix pool"));
        }

        let mut seed = Vec::new();
        seed.try_reserve(client_id.len())?;
        seed.extend_from_slice(client_id);

        let mut attempts = 0;
        let address = loop {
            if attempts == ADDRESS_ATTEMPTS {
                debug!("Pool {}/{} exhausted after {} attempts", start, bits, attempts);
                return Err(LeaseError::NoResources { attempts });
            }
            attempts += 1;

            let candidate = if resource_type == ResourceType::Ta {
                self.temporary.build(start, bits, &seed)
            } else {
                build_address(start, bits, &seed)
            };
            if !is_reserved_iid(candidate) && !self.pool_ref(pool)?.active_hash.contains_key(&candidate) {
                break candidate;
            }

            seed.try_reserve(16)?;
            seed.extend_from_slice(&candidate.octets());
        };

        let lease = Lease::new(address).with_prefix_len(ADDRESS_PREFIX_LEN);
        self.install(pool, lease, soft_expiry).map(|id| (id, attempts))
    }

    /// Pick a free prefix of the pool's delegated length for `client_id`.
    pub fn create_prefix(
        &mut self,
        pool: PoolId,
        client_id: &[u8],
        soft_expiry: Timestamp,
    ) -> LeaseResult<(LeaseId, u32)> {
        let p = self.pool_ref(pool)?;
        let (resource_type, start, bits, units) = (p.resource_type(), p.start(), p.bits(), p.units());
        if resource_type != ResourceType::Pd {
            error!("create_prefix: address pool {}/{}", start, bits);
            return Err(LeaseError::InvalidArgument("address pool"));
        }

        let mut seed = Vec::new();
        seed.try_reserve(client_id.len())?;
        seed.extend_from_slice(client_id);

        let mut attempts = 0;
        let prefix = loop {
            if attempts == PREFIX_ATTEMPTS {
                debug!("Prefix pool {}/{} exhausted after {} attempts", start, bits, attempts);
                return Err(LeaseError::NoResources { attempts });
            }
            attempts += 1;

            let candidate = build_prefix(start, bits, units, &seed);
            if !self.pool_ref(pool)?.active_hash.contains_key(&candidate) {
                break candidate;
            }

            seed.try_reserve(16)?;
            seed.extend_from_slice(&candidate.octets());
        };

        let lease = Lease::new(prefix).with_prefix_len(units);
        self.install(pool, lease, soft_expiry).map(|id| (id, attempts))
    }

    /// Allocate `lease` and add it to `pool`; the caller gets the
    /// allocation's reference.
    fn install(&mut self, pool: PoolId, lease: Lease, soft_expiry: Timestamp) -> LeaseResult<LeaseId> {
        let id = self.allocate_lease(lease)?;
        if let Err(e) = self.add_lease(pool, id, soft_expiry) {
            if let Err(cleanup) = self.dereference_lease(id) {
                error!("Releasing unplaced lease: {}", cleanup);
            }
            return Err(e);
        }
        Ok(id)
    }
}
