//! Process-wide list of pools, searched in insertion order.

use std::net::Ipv6Addr;

use ipnet::Ipv6Net;
use tracing::{debug, warn};

use crate::arena::Arena;
use crate::db::LeaseDb;
use crate::error::{LeaseError, LeaseResult};
use crate::lease::{PoolId, ResourceType};
use crate::pool::Pool;

/// Owns every pool. `order` holds one reference per registered pool; the
/// arena also tracks references held by leases and armed timers.
pub struct PoolRegistry {
    pools: Arena<Pool>,
    order: Vec<PoolId>,
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self { pools: Arena::new("pool"), order: Vec::new() }
    }

    pub fn allocate(&mut self, pool: Pool) -> LeaseResult<PoolId> {
        self.pools.allocate(pool)
    }

    /// Register `pool` for lookups. The registry takes its own reference.
    pub fn add(&mut self, pool: PoolId) -> LeaseResult<()> {
        self.order.try_reserve(1)?;
        self.pools.reference(pool)?;
        self.order.push(pool);
        Ok(())
    }

    pub fn reference(&mut self, pool: PoolId) -> LeaseResult<PoolId> {
        self.pools.reference(pool)
    }

    pub fn dereference(&mut self, pool: PoolId) -> LeaseResult<Option<Pool>> {
        self.pools.dereference(pool)
    }

    pub fn get(&self, pool: PoolId) -> Option<&Pool> {
        self.pools.get(pool)
    }

    pub fn get_mut(&mut self, pool: PoolId) -> Option<&mut Pool> {
        self.pools.get_mut(pool)
    }

    pub fn contains(&self, pool: PoolId) -> bool {
        self.pools.contains(pool)
    }

    pub fn refcount(&self, pool: PoolId) -> u32 {
        self.pools.refcount(pool)
    }

    /// First registered pool of `resource_type` whose range holds `addr`.
    pub fn find(&self, resource_type: ResourceType, addr: Ipv6Addr) -> LeaseResult<PoolId> {
        self.order
            .iter()
            .copied()
            .find(|id| {
                self.pools
                    .get(*id)
                    .is_some_and(|p| p.resource_type() == resource_type && p.contains(addr))
            })
            .ok_or(LeaseError::NotFound)
    }

    /// Registered pools in insertion order.
    pub fn ids(&self) -> &[PoolId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl LeaseDb {
    /// Allocate a pool and register it. The registry ends up holding the
    /// only reference.
    pub fn create_pool(
        &mut self,
        resource_type: ResourceType,
        start: Ipv6Addr,
        bits: u8,
        units: u8,
    ) -> LeaseResult<PoolId> {
        let pool = self.allocate_pool(resource_type, start, bits, units)?;
        let added = self.add_pool(pool);
        self.dereference_pool(pool)?;
        added?;
        debug!("Added {} pool {}/{}", resource_type, start, bits);
        Ok(pool)
    }

    pub fn add_pool(&mut self, pool: PoolId) -> LeaseResult<()> {
        self.registry.add(pool)
    }

    pub fn find_pool(&self, resource_type: ResourceType, addr: Ipv6Addr) -> LeaseResult<PoolId> {
        self.registry.find(resource_type, addr)
    }

    /// Reserve host-declaration and server addresses in whichever NA or TA
    /// pools contain them. Returns how many reservations were made.
    pub fn mark_hosts_unavailable(&mut self, addresses: &[Ipv6Addr]) -> usize {
        let mut marked = 0;
        for addr in addresses {
            for ty in [ResourceType::Na, ResourceType::Ta] {
                let Ok(pool) = self.find_pool(ty, *addr) else {
                    continue;
                };
                match self.mark_unavailable(pool, *addr) {
                    Ok(()) => marked += 1,
                    Err(e) => warn!("Could not reserve {}: {}", addr, e),
                }
            }
        }
        marked
    }

    /// Reserve fixed host prefixes in PD pools delegating exactly that
    /// length.
    pub fn mark_prefixes_unavailable(&mut self, prefixes: &[Ipv6Net]) -> usize {
        let mut marked = 0;
        for prefix in prefixes {
            let Ok(pool) = self.find_pool(ResourceType::Pd, prefix.network()) else {
                continue;
            };
            let units = self.registry.get(pool).map(|p| p.units());
            if units != Some(prefix.prefix_len()) {
                debug!("{} does not match the delegated length of its pool", prefix);
                continue;
            }
            match self.mark_unavailable(pool, prefix.network()) {
                Ok(()) => marked += 1,
                Err(e) => warn!("Could not reserve {}: {}", prefix, e),
            }
        }
        marked
    }
}
