//! The v6 lease: one address or delegated prefix with its lifetime
//! bookkeeping.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv6Addr;

use serde::{Deserialize, Serialize};

use crate::arena::Handle;
use crate::heap::HeapHandle;
use crate::ia::Association;
use crate::pool::Pool;

pub type LeaseId = Handle<Lease>;
pub type IaId = Handle<Association>;
pub type PoolId = Handle<Pool>;

/// Seconds since the Unix epoch.
pub type Timestamp = u64;

/// "Never". Abandoned leases carry it so they sort behind everything else.
pub const MAX_TIME: Timestamp = u64::MAX >> 1;

/// Grace period an expired or released lease stays on the inactive heap.
pub const EXPIRED_IPV6_CLEANUP_TIME: u64 = 60 * 60;

/// Prefix length of a lease that has not been turned into a prefix.
pub const PREFIX_LEN_UNSET: u8 = 255;

/// Prefix length carried by plain (NA/TA) address leases.
pub const ADDRESS_PREFIX_LEN: u8 = 128;

// ── Resource type ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    /// IA_NA: non-temporary address
    Na,
    /// IA_TA: temporary address
    Ta,
    /// IA_PD: delegated prefix
    Pd,
}

impl ResourceType {
    pub const ALL: [ResourceType; 3] = [ResourceType::Na, ResourceType::Ta, ResourceType::Pd];

    pub(crate) fn index(self) -> usize {
        match self {
            ResourceType::Na => 0,
            ResourceType::Ta => 1,
            ResourceType::Pd => 2,
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Na => write!(f, "na"),
            ResourceType::Ta => write!(f, "ta"),
            ResourceType::Pd => write!(f, "pd"),
        }
    }
}

// ── State ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseState {
    Free,
    Active,
    Expired,
    Released,
    Abandoned,
}

impl LeaseState {
    /// Active and abandoned leases live in the pool's hash and active heap;
    /// everything else on the inactive heap.
    pub fn is_active(self) -> bool {
        matches!(self, LeaseState::Active | LeaseState::Abandoned)
    }
}

// ── Policy hooks ────────────────────────────────────────────────────────────

/// An opaque policy block ("on commit/expiry/release" statements) attached
/// to a lease. The pool manager only decides when it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement(pub String);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseHooks {
    pub on_commit: Option<Statement>,
    pub on_expiry: Option<Statement>,
    pub on_release: Option<Statement>,
}

/// Per-lease variables owned by the policy layer.
pub type BindingScope = HashMap<String, String>;

// ── Lease ───────────────────────────────────────────────────────────────────

/// Heap ordering: the lease that ends first is on top, ties broken by the
/// pending (soft) end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ExpiryKey {
    pub hard: Timestamp,
    pub soft: Timestamp,
}

/// Inactive heap ordering: the lease whose grace period ends first is on
/// top, ties broken by the pending (soft) end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CleanupKey {
    pub due: Timestamp,
    pub soft: Timestamp,
}

#[derive(Debug, Clone)]
pub struct Lease {
    pub address: Ipv6Addr,
    pub prefix_len: u8,
    pub state: LeaseState,
    /// Confirmed end of life.
    pub hard_expiry: Timestamp,
    /// Requested end of life, committed into `hard_expiry` by a renew.
    pub soft_expiry: Timestamp,
    pub hooks: LeaseHooks,
    pub scope: Option<BindingScope>,
    pub(crate) heap_handle: Option<HeapHandle>,
    pub(crate) pool: Option<PoolId>,
    pub(crate) association: Option<IaId>,
}

impl Lease {
    pub fn new(address: Ipv6Addr) -> Self {
        Self {
            address,
            prefix_len: PREFIX_LEN_UNSET,
            state: LeaseState::Free,
            hard_expiry: 0,
            soft_expiry: 0,
            hooks: LeaseHooks::default(),
            scope: None,
            heap_handle: None,
            pool: None,
            association: None,
        }
    }

    pub fn with_state(mut self, state: LeaseState) -> Self {
        self.state = state;
        self
    }

    pub fn with_prefix_len(mut self, prefix_len: u8) -> Self {
        self.prefix_len = prefix_len;
        self
    }

    pub fn pool(&self) -> Option<PoolId> {
        self.pool
    }

    pub fn association(&self) -> Option<IaId> {
        self.association
    }

    /// Whether the lease currently sits on one of its pool's heaps.
    pub fn is_queued(&self) -> bool {
        self.heap_handle.is_some()
    }

    pub fn expiry_key(&self) -> ExpiryKey {
        ExpiryKey { hard: self.hard_expiry, soft: self.soft_expiry }
    }

    /// When a lease on the inactive heap may be freed.
    pub fn cleanup_time(&self, grace: u64) -> Timestamp {
        if self.hard_expiry != 0 {
            self.hard_expiry.saturating_add(grace)
        } else {
            self.soft_expiry
        }
    }

    pub fn cleanup_key(&self, grace: u64) -> CleanupKey {
        CleanupKey { due: self.cleanup_time(grace), soft: self.soft_expiry }
    }
}

impl fmt::Display for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.prefix_len <= 128 && self.prefix_len != ADDRESS_PREFIX_LEN {
            write!(f, "{}/{}", self.address, self.prefix_len)
        } else {
            write!(f, "{}", self.address)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_lease_is_free() {
        let lease = Lease::new("2001:db8::1".parse().unwrap());
        assert_eq!(lease.state, LeaseState::Free);
        assert_eq!(lease.prefix_len, PREFIX_LEN_UNSET);
        assert!(lease.pool().is_none());
        assert!(!lease.is_queued());
    }

    #[test]
    fn test_expiry_key_orders_hard_then_soft() {
        let a = ExpiryKey { hard: 10, soft: 50 };
        let b = ExpiryKey { hard: 10, soft: 60 };
        let c = ExpiryKey { hard: 11, soft: 0 };
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_cleanup_time() {
        let mut lease = Lease::new(Ipv6Addr::UNSPECIFIED);
        lease.soft_expiry = 500;
        assert_eq!(lease.cleanup_time(3600), 500);
        lease.hard_expiry = 1000;
        assert_eq!(lease.cleanup_time(3600), 4600);
    }

    #[test]
    fn test_cleanup_key_orders_by_due_time() {
        let mut expired = Lease::new(Ipv6Addr::UNSPECIFIED);
        expired.hard_expiry = 100;
        let mut released = Lease::new(Ipv6Addr::LOCALHOST);
        released.soft_expiry = 5000;
        // hard-expired lease is due at 3700, before the soft-only one
        assert!(expired.cleanup_key(3600) < released.cleanup_key(3600));
        assert!(released.cleanup_key(3600) < expired.cleanup_key(6000));
    }

    #[test]
    fn test_display() {
        let addr = Lease::new("2001:db8::1".parse().unwrap()).with_prefix_len(ADDRESS_PREFIX_LEN);
        assert_eq!(addr.to_string(), "2001:db8::1");
        let pref = Lease::new("2001:db8:1::".parse().unwrap()).with_prefix_len(56);
        assert_eq!(pref.to_string(), "2001:db8:1::/56");
    }

    #[test]
    fn test_resource_type_serde() {
        assert_eq!(serde_json::to_string(&ResourceType::Pd).unwrap(), r#""pd""#);
        let ty: ResourceType = serde_json::from_str(r#""ta""#).unwrap();
        assert_eq!(ty, ResourceType::Ta);
    }
}
