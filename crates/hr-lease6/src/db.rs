//! The lease database: one value owning every lease, association and pool,
//! plus the collaborators (lease journal, policy executor, timers).
//!
//! All mutation runs on a single logical thread. Callers that share a
//! `LeaseDb` with the expiry scheduler wrap it in [`SharedLeaseDb`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::error;

use crate::alloc::TemporaryGenerator;
use crate::arena::Arena;
use crate::error::{LeaseError, LeaseResult};
use crate::events::{HookKind, PolicyExecutor};
use crate::ia::{Association, IaKey};
use crate::lease::{EXPIRED_IPV6_CLEANUP_TIME, IaId, Lease, LeaseId, PoolId, ResourceType, Statement};
use crate::pool::Pool;
use crate::registry::PoolRegistry;
use crate::scheduler::TimerTable;
use crate::store::LeaseStore;

pub type SharedLeaseDb = Arc<Mutex<LeaseDb>>;

pub struct LeaseDb {
    pub(crate) leases: Arena<Lease>,
    pub(crate) ias: Arena<Association>,
    pub(crate) registry: PoolRegistry,
    /// Associations currently holding leases, one table per resource type.
    pub(crate) active_ias: [HashMap<IaKey, IaId>; 3],
    pub(crate) temporary: TemporaryGenerator,
    pub(crate) timers: TimerTable,
    pub(crate) store: Option<Box<dyn LeaseStore>>,
    pub(crate) executor: Option<Box<dyn PolicyExecutor>>,
    pub(crate) expired_cleanup_secs: u64,
}

impl Default for LeaseDb {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseDb {
    pub fn new() -> Self {
        Self {
            leases: Arena::new("lease"),
            ias: Arena::new("association"),
            registry: PoolRegistry::new(),
            active_ias: [HashMap::new(), HashMap::new(), HashMap::new()],
            temporary: TemporaryGenerator::new(),
            timers: TimerTable::new(),
            store: None,
            executor: None,
            expired_cleanup_secs: EXPIRED_IPV6_CLEANUP_TIME,
        }
    }

    pub fn with_store(mut self, store: Box<dyn LeaseStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_executor(mut self, executor: Box<dyn PolicyExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_expired_cleanup_secs(mut self, secs: u64) -> Self {
        self.expired_cleanup_secs = secs;
        self
    }

    pub fn into_shared(self) -> SharedLeaseDb {
        Arc::new(Mutex::new(self))
    }

    pub fn expired_cleanup_secs(&self) -> u64 {
        self.expired_cleanup_secs
    }

    pub fn registry(&self) -> &PoolRegistry {
        &self.registry
    }

    // ── Leases ──────────────────────────────────────────────────────────────

    pub fn allocate_lease(&mut self, lease: Lease) -> LeaseResult<LeaseId> {
        self.leases.allocate(lease)
    }

    pub fn reference_lease(&mut self, lease: LeaseId) -> LeaseResult<LeaseId> {
        self.leases.reference(lease)
    }

    /// Drop one reference; the last one frees the lease and releases its
    /// pool reference. The association link is a back-reference and is not
    /// counted.
    pub fn dereference_lease(&mut self, lease: LeaseId) -> LeaseResult<()> {
        if let Some(freed) = self.leases.dereference(lease)? {
            if let Some(pool) = freed.pool {
                self.dereference_pool(pool)?;
            }
        }
        Ok(())
    }

    pub fn lease(&self, lease: LeaseId) -> Option<&Lease> {
        self.leases.get(lease)
    }

    pub fn lease_mut(&mut self, lease: LeaseId) -> Option<&mut Lease> {
        self.leases.get_mut(lease)
    }

    pub fn lease_refcount(&self, lease: LeaseId) -> u32 {
        self.leases.refcount(lease)
    }

    pub fn lease_count(&self) -> usize {
        self.leases.len()
    }

    // ── Associations ────────────────────────────────────────────────────────

    pub fn allocate_ia(&mut self, iaid: u32, duid: &[u8], resource_type: ResourceType) -> LeaseResult<IaId> {
        let key = IaKey::new(iaid, duid)?;
        self.ias.allocate(Association::new(key, resource_type))
    }

    pub fn reference_ia(&mut self, ia: IaId) -> LeaseResult<IaId> {
        self.ias.reference(ia)
    }

    /// Drop one reference; the last one releases every lease the
    /// association still holds.
    pub fn dereference_ia(&mut self, ia: IaId) -> LeaseResult<()> {
        if let Some(freed) = self.ias.dereference(ia)? {
            for lease in freed.leases {
                if let Some(l) = self.leases.get_mut(lease) {
                    if l.association == Some(ia) {
                        l.association = None;
                    }
                }
                self.dereference_lease(lease)?;
            }
        }
        Ok(())
    }

    pub fn association(&self, ia: IaId) -> Option<&Association> {
        self.ias.get(ia)
    }

    pub fn ia_refcount(&self, ia: IaId) -> u32 {
        self.ias.refcount(ia)
    }

    // ── Pools ───────────────────────────────────────────────────────────────

    pub fn allocate_pool(
        &mut self,
        resource_type: ResourceType,
        start: std::net::Ipv6Addr,
        bits: u8,
        units: u8,
    ) -> LeaseResult<PoolId> {
        let pool = Pool::new(resource_type, start, bits, units)?;
        self.registry.allocate(pool)
    }

    pub fn reference_pool(&mut self, pool: PoolId) -> LeaseResult<PoolId> {
        self.registry.reference(pool)
    }

    /// Drop one reference; the last one releases every lease held by the
    /// pool's hash and heaps.
    pub fn dereference_pool(&mut self, pool: PoolId) -> LeaseResult<()> {
        let Some(freed) = self.registry.dereference(pool)? else {
            return Ok(());
        };

        let mut held: Vec<LeaseId> = freed.active_hash.values().copied().collect();
        held.extend(freed.active.iter().map(|(_, l)| *l));
        held.extend(freed.inactive.iter().map(|(_, l)| *l));
        for lease in held {
            if let Some(l) = self.leases.get_mut(lease) {
                l.heap_handle = None;
                if l.pool == Some(pool) {
                    // the pool is gone; the lease must not release it again
                    l.pool = None;
                }
            }
            if let Err(e) = self.dereference_lease(lease) {
                error!("Releasing lease held by freed pool: {}", e);
            }
        }
        Ok(())
    }

    pub fn pool(&self, pool: PoolId) -> Option<&Pool> {
        self.registry.get(pool)
    }

    pub fn pool_refcount(&self, pool: PoolId) -> u32 {
        self.registry.refcount(pool)
    }

    pub(crate) fn pool_ref(&self, pool: PoolId) -> LeaseResult<&Pool> {
        self.registry.get(pool).ok_or(LeaseError::InvalidArgument("stale pool"))
    }

    pub(crate) fn lease_ref(&self, lease: LeaseId) -> LeaseResult<&Lease> {
        self.leases.get(lease).ok_or(LeaseError::InvalidArgument("stale lease"))
    }

    // ── Policy hooks ────────────────────────────────────────────────────────

    pub(crate) fn run_hook(&mut self, kind: HookKind, statement: &Statement, lease: LeaseId) {
        let (Some(executor), Some(lease)) = (self.executor.as_mut(), self.leases.get(lease)) else {
            return;
        };
        executor.execute(kind, statement, lease);
    }
}
