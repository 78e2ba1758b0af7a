//! Address/prefix pools and the lease state machine.
//!
//! A pool owns three views of its leases:
//! - `active_hash`: address -> lease for ACTIVE and ABANDONED leases (plus
//!   reservation placeholders that never reach a heap)
//! - `active`: min-heap on hard expiry of the same leases
//! - `inactive`: min-heap of EXPIRED and RELEASED leases awaiting cleanup
//!
//! The hash and each heap hold their own reference on the lease. Every
//! transition below moves a lease between the views and keeps the counters
//! equal to the heap sizes.

use std::collections::HashMap;
use std::net::Ipv6Addr;

use tracing::{debug, error, info};

use crate::db::LeaseDb;
use crate::error::{LeaseError, LeaseResult};
use crate::events::HookKind;
use crate::heap::{ExpiryHeap, HeapHandle};
use crate::lease::{CleanupKey, ExpiryKey, IaId, Lease, LeaseId, LeaseState, MAX_TIME, PoolId, ResourceType, Timestamp};

#[derive(Debug)]
pub struct Pool {
    resource_type: ResourceType,
    start: Ipv6Addr,
    bits: u8,
    /// Delegated prefix length for PD pools, 128 for address pools.
    units: u8,
    pub(crate) active_hash: HashMap<Ipv6Addr, LeaseId>,
    pub(crate) active: ExpiryHeap<ExpiryKey, LeaseId>,
    pub(crate) inactive: ExpiryHeap<CleanupKey, LeaseId>,
    pub(crate) num_active: usize,
    pub(crate) num_inactive: usize,
}

/// The top `bits` bits of `addr`.
pub fn network_portion(addr: Ipv6Addr, bits: u8) -> u128 {
    let mask = match bits {
        0 => 0,
        b if b >= 128 => u128::MAX,
        b => u128::MAX << (128 - u32::from(b)),
    };
    u128::from(addr) & mask
}

impl Pool {
    pub fn new(resource_type: ResourceType, start: Ipv6Addr, bits: u8, units: u8) -> LeaseResult<Self> {
        if bits > 128 || units > 128 {
            return Err(LeaseError::InvalidArgument("prefix length above 128"));
        }
        if resource_type == ResourceType::Pd && units <= bits {
            return Err(LeaseError::InvalidArgument("delegated length must exceed pool length"));
        }

        Ok(Self {
            resource_type,
            start: Ipv6Addr::from(network_portion(start, bits)),
            bits,
            units,
            active_hash: HashMap::new(),
            active: ExpiryHeap::new(),
            inactive: ExpiryHeap::new(),
            num_active: 0,
            num_inactive: 0,
        })
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    pub fn start(&self) -> Ipv6Addr {
        self.start
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    pub fn units(&self) -> u8 {
        self.units
    }

    /// Whether `addr` falls inside this pool's range.
    pub fn contains(&self, addr: Ipv6Addr) -> bool {
        network_portion(addr, self.bits) == network_portion(self.start, self.bits)
    }

    /// The lease (or placeholder) currently holding `addr`.
    pub fn lookup(&self, addr: Ipv6Addr) -> Option<LeaseId> {
        self.active_hash.get(&addr).copied()
    }

    pub fn active_count(&self) -> usize {
        self.num_active
    }

    pub fn inactive_count(&self) -> usize {
        self.num_inactive
    }

    pub fn active_heap_len(&self) -> usize {
        self.active.len()
    }

    pub fn inactive_heap_len(&self) -> usize {
        self.inactive.len()
    }

    /// Earliest-ending active lease.
    pub fn next_active(&self) -> Option<(ExpiryKey, LeaseId)> {
        self.active.peek().map(|(k, l)| (*k, *l))
    }

    /// Inactive lease whose grace period ends first.
    pub fn next_inactive(&self) -> Option<(CleanupKey, LeaseId)> {
        self.inactive.peek().map(|(k, l)| (*k, *l))
    }

    pub fn on_active_heap(&self, id: LeaseId, lease: &Lease) -> bool {
        lease
            .heap_handle
            .is_some_and(|h| Self::holds(&self.active, h, id))
    }

    pub fn on_inactive_heap(&self, id: LeaseId, lease: &Lease) -> bool {
        lease
            .heap_handle
            .is_some_and(|h| Self::holds(&self.inactive, h, id))
    }

    fn holds<K: Ord>(heap: &ExpiryHeap<K, LeaseId>, handle: HeapHandle, id: LeaseId) -> bool {
        heap.get(handle).is_some_and(|(_, l)| *l == id)
    }
}

fn stale_pool() -> LeaseError {
    LeaseError::InvalidArgument("stale pool")
}

fn stale_lease() -> LeaseError {
    LeaseError::InvalidArgument("stale lease")
}

impl LeaseDb {
    // ── Insertion ───────────────────────────────────────────────────────────

    /// Put `lease` into `pool`. A lease without a state is taken as ACTIVE.
    /// Active leases get `valid_end` as hard expiry and go into the hash and
    /// active heap; any other state gets it as soft expiry and goes onto the
    /// inactive heap. Whatever held the address before is evicted first.
    pub fn add_lease(&mut self, pool: PoolId, lease: LeaseId, valid_end: Timestamp) -> LeaseResult<()> {
        if !self.registry.contains(pool) {
            return Err(stale_pool());
        }
        // keep the lease alive while it is pulled out of its old slots
        self.leases.reference(lease)?;
        let result = self.add_lease_held(pool, lease, valid_end);
        self.dereference_lease(lease)?;
        result
    }

    fn add_lease_held(&mut self, pool: PoolId, lease: LeaseId, valid_end: Timestamp) -> LeaseResult<()> {
        let l = self.leases.get(lease).ok_or_else(stale_lease)?;
        let address = l.address;

        if let Some(prev) = l.pool {
            if self.registry.contains(prev) {
                self.evict(prev, lease)?;
            }
        }
        if let Some(old) = self.registry.get(pool).and_then(|p| p.lookup(address)) {
            self.evict(pool, old)?;
        }

        let l = self.leases.get_mut(lease).ok_or_else(stale_lease)?;
        if l.state == LeaseState::Free {
            l.state = LeaseState::Active;
        }
        if l.pool != Some(pool) {
            self.registry.reference(pool)?;
            let old = self.leases.get_mut(lease).and_then(|l| l.pool.replace(pool));
            if let Some(old) = old {
                self.dereference_pool(old)?;
            }
        }

        self.enqueue(pool, lease, valid_end)
    }

    /// Insert into the views matching the lease's state. The lease must not
    /// be on any heap.
    fn enqueue(&mut self, pool: PoolId, lease: LeaseId, valid_end: Timestamp) -> LeaseResult<()> {
        let grace = self.expired_cleanup_secs;
        let l = self.leases.get_mut(lease).ok_or_else(stale_lease)?;
        let p = self.registry.get_mut(pool).ok_or_else(stale_pool)?;

        if l.state.is_active() {
            l.hard_expiry = valid_end;
            p.active_hash.try_reserve(1)?;
            let handle = p.active.insert(l.expiry_key(), lease)?;
            p.active_hash.insert(l.address, lease);
            p.num_active += 1;
            l.heap_handle = Some(handle);
            // hash + heap
            self.leases.reference(lease)?;
            self.leases.reference(lease)?;
        } else {
            l.soft_expiry = valid_end;
            let handle = p.inactive.insert(l.cleanup_key(grace), lease)?;
            p.num_inactive += 1;
            l.heap_handle = Some(handle);
            self.leases.reference(lease)?;
        }
        Ok(())
    }

    /// Remove `lease` from `pool`'s hash and from whichever heap holds it,
    /// releasing the references those slots held.
    pub(crate) fn evict(&mut self, pool: PoolId, lease: LeaseId) -> LeaseResult<()> {
        self.unqueue(pool, lease)?;

        let address = self.leases.get(lease).ok_or_else(stale_lease)?.address;
        let p = self.registry.get_mut(pool).ok_or_else(stale_pool)?;
        if p.lookup(address) == Some(lease) {
            p.active_hash.remove(&address);
            self.dereference_lease(lease)?;
        }
        Ok(())
    }

    /// Take `lease` off its heap, if it is on one of `pool`'s.
    fn unqueue(&mut self, pool: PoolId, lease: LeaseId) -> LeaseResult<()> {
        let l = self.leases.get_mut(lease).ok_or_else(stale_lease)?;
        let Some(handle) = l.heap_handle.take() else {
            return Ok(());
        };
        let p = self.registry.get_mut(pool).ok_or_else(stale_pool)?;

        if Pool::holds(&p.active, handle, lease) {
            p.active.remove(handle);
            p.num_active -= 1;
        } else if Pool::holds(&p.inactive, handle, lease) {
            p.inactive.remove(handle);
            p.num_inactive -= 1;
        } else {
            error!("Lease {} is not queued in pool {:?}", l, pool);
            return Ok(());
        }
        self.dereference_lease(lease)
    }

    // ── Transitions ─────────────────────────────────────────────────────────

    /// An active lease must still be on the active heap and hold its
    /// address. One replaced by `add_lease` is neither.
    fn ensure_tracked(&self, pool: PoolId, lease: LeaseId) -> LeaseResult<()> {
        let l = self.leases.get(lease).ok_or_else(stale_lease)?;
        let p = self.registry.get(pool).ok_or_else(stale_pool)?;
        if p.on_active_heap(lease, l) && p.lookup(l.address) == Some(lease) {
            Ok(())
        } else {
            Err(LeaseError::Failure(format!("{} is no longer held by its pool", l)))
        }
    }

    /// Move an inactive lease onto the active heap and into the hash.
    fn move_to_active(&mut self, pool: PoolId, lease: LeaseId) -> LeaseResult<()> {
        let l = self.leases.get(lease).ok_or_else(stale_lease)?;
        let p = self.registry.get(pool).ok_or_else(stale_pool)?;

        let holder = p.lookup(l.address);
        if holder.is_some_and(|h| h != lease) {
            return Err(LeaseError::Failure(format!("{} is held by another lease", l)));
        }

        let old_handle = l.heap_handle;
        let key = l.expiry_key();
        let address = l.address;

        let p = self.registry.get_mut(pool).ok_or_else(stale_pool)?;
        p.active_hash.try_reserve(1)?;
        let handle = p.active.insert(key, lease)?;
        self.leases.reference(lease)?;

        let mut released = 0;
        if let Some(old) = old_handle {
            if Pool::holds(&p.inactive, old, lease) {
                p.inactive.remove(old);
                p.num_inactive -= 1;
                released += 1;
            }
        }
        if holder.is_none() {
            p.active_hash.insert(address, lease);
            self.leases.reference(lease)?;
        }
        p.num_active += 1;

        if let Some(l) = self.leases.get_mut(lease) {
            l.heap_handle = Some(handle);
            l.state = LeaseState::Active;
        }
        for _ in 0..released {
            self.dereference_lease(lease)?;
        }
        Ok(())
    }

    /// Move an active lease onto the inactive heap with `state`, firing the
    /// matching expiry/release statement and dropping the binding scope.
    fn move_to_inactive(&mut self, pool: PoolId, lease: LeaseId, state: LeaseState) -> LeaseResult<()> {
        let grace = self.expired_cleanup_secs;
        let l = self.leases.get_mut(lease).ok_or_else(stale_lease)?;
        let p = self.registry.get_mut(pool).ok_or_else(stale_pool)?;

        let handle = p.inactive.insert(l.cleanup_key(grace), lease)?;
        p.num_inactive += 1;
        let mut was_queued = false;
        if let Some(old) = l.heap_handle.replace(handle) {
            if Pool::holds(&p.active, old, lease) {
                p.active.remove(old);
                p.num_active -= 1;
                was_queued = true;
            }
        }
        let in_hash = p.lookup(l.address) == Some(lease);
        if in_hash {
            p.active_hash.remove(&l.address);
        }

        l.state = state;
        l.scope = None;
        let on_expiry = l.hooks.on_expiry.take();
        let on_release = l.hooks.on_release.take();

        let hook = match state {
            LeaseState::Expired => on_expiry.map(|s| (HookKind::Expiry, s)),
            LeaseState::Released => on_release.map(|s| (HookKind::Release, s)),
            _ => None,
        };
        if let Some((kind, statement)) = hook {
            self.run_hook(kind, &statement, lease);
        }

        // the inactive heap slot takes over the active heap's reference
        if !was_queued {
            self.leases.reference(lease)?;
        }
        if in_hash {
            self.dereference_lease(lease)?;
        }
        Ok(())
    }

    /// Commit the pending soft expiry as the new hard expiry and make sure
    /// the lease is active.
    pub fn renew_lease(&mut self, pool: PoolId, lease: LeaseId) -> LeaseResult<()> {
        let l = self.leases.get(lease).ok_or_else(stale_lease)?;
        if l.pool != Some(pool) {
            return Err(LeaseError::InvalidArgument("lease not in pool"));
        }
        if l.state.is_active() {
            self.ensure_tracked(pool, lease)?;
        }

        let l = self.leases.get_mut(lease).ok_or_else(stale_lease)?;
        l.hard_expiry = l.soft_expiry;
        l.soft_expiry = 0;

        let state = l.state;
        match state {
            LeaseState::Active | LeaseState::Abandoned => {
                let reclaimed = state == LeaseState::Abandoned;
                l.state = LeaseState::Active;
                let key = l.expiry_key();
                if let Some(handle) = l.heap_handle {
                    let p = self.registry.get_mut(pool).ok_or_else(stale_pool)?;
                    p.active.update(handle, key);
                }
                if reclaimed {
                    info!("Reclaiming previously abandoned address {}", l);
                }
            }
            _ => self.move_to_active(pool, lease)?,
        }

        let on_commit = self.leases.get_mut(lease).and_then(|l| l.hooks.on_commit.take());
        if let Some(statement) = on_commit {
            self.run_hook(HookKind::Commit, &statement, lease);
        }
        self.persist_lease(lease);
        Ok(())
    }

    /// Expire the earliest-ending active lease if its hard expiry is before
    /// `now`. The returned handle carries a reference the caller must drop.
    pub fn expire_lease(&mut self, pool: PoolId, now: Timestamp) -> LeaseResult<Option<LeaseId>> {
        let p = self.registry.get(pool).ok_or_else(stale_pool)?;
        let Some((key, lease)) = p.next_active() else {
            return Ok(None);
        };
        if now <= key.hard {
            return Ok(None);
        }

        self.move_to_inactive(pool, lease, LeaseState::Expired)?;
        self.leases.reference(lease)?;
        Ok(Some(lease))
    }

    /// Mark the lease ABANDONED and park it at the end of the active heap.
    pub fn decline_lease(&mut self, pool: PoolId, lease: LeaseId) -> LeaseResult<()> {
        let l = self.leases.get(lease).ok_or_else(stale_lease)?;
        if l.pool != Some(pool) {
            return Err(LeaseError::InvalidArgument("lease not in pool"));
        }
        if l.state.is_active() {
            self.ensure_tracked(pool, lease)?;
        } else {
            self.move_to_active(pool, lease)?;
        }

        let l = self.leases.get_mut(lease).ok_or_else(stale_lease)?;
        l.state = LeaseState::Abandoned;
        l.hard_expiry = MAX_TIME;
        let key = l.expiry_key();
        if let Some(handle) = l.heap_handle {
            let p = self.registry.get_mut(pool).ok_or_else(stale_pool)?;
            p.active.update(handle, key);
        }
        self.persist_lease(lease);
        Ok(())
    }

    /// Client gave the lease back. Anything but an ACTIVE lease is left
    /// alone, so releasing twice is harmless.
    pub fn release_lease(&mut self, pool: PoolId, lease: LeaseId) -> LeaseResult<()> {
        let l = self.leases.get(lease).ok_or_else(stale_lease)?;
        if l.state != LeaseState::Active {
            return Ok(());
        }
        if l.pool != Some(pool) {
            return Err(LeaseError::InvalidArgument("lease not in pool"));
        }
        self.move_to_inactive(pool, lease, LeaseState::Released)?;
        self.persist_lease(lease);
        Ok(())
    }

    // ── Cleanup ─────────────────────────────────────────────────────────────

    /// Free inactive leases whose grace period is over. A freed lease is
    /// unlinked from its association, and an association left empty is
    /// dropped from its active table. Returns how many leases were freed.
    pub fn cleanup_old_expired(&mut self, pool: PoolId, now: Timestamp) -> LeaseResult<usize> {
        let mut freed = 0;

        loop {
            let p = self.registry.get(pool).ok_or_else(stale_pool)?;
            let Some((key, lease)) = p.next_inactive() else {
                break;
            };
            if now < key.due {
                break;
            }
            let ia = self.leases.get(lease).ok_or_else(stale_lease)?.association;

            if let Some(p) = self.registry.get_mut(pool) {
                p.inactive.pop();
                p.num_inactive -= 1;
            }
            if let Some(l) = self.leases.get_mut(lease) {
                l.heap_handle = None;
            }
            // an association still holding the lease keeps it alive until
            // it is unlinked below
            self.dereference_lease(lease)?;
            if let Some(ia) = ia {
                self.drop_from_association(ia, lease)?;
            }
            freed += 1;
        }

        if freed > 0 {
            debug!("Pool {:?}: freed {} expired lease(s)", pool, freed);
        }
        Ok(freed)
    }

    fn drop_from_association(&mut self, ia: IaId, lease: LeaseId) -> LeaseResult<()> {
        self.ias.reference(ia)?;
        self.ia_remove_lease(Some(ia), Some(lease));
        self.forget_ia_if_empty(ia);
        self.dereference_ia(ia)
    }

    /// Reconcile a lease being reloaded from the journal with whatever
    /// already holds its address. Two active leases for one address under
    /// different associations keep the newer one; the older is evicted and
    /// `Failure` is returned so the caller can warn.
    pub fn cleanup_on_load(&mut self, pool: PoolId, lease: LeaseId, ia: IaId) -> LeaseResult<()> {
        let new = self.leases.get(lease).ok_or_else(stale_lease)?;
        let p = self.registry.get(pool).ok_or_else(stale_pool)?;
        let Some(old) = p.lookup(new.address) else {
            return Ok(());
        };
        let Some(old_ia) = self.leases.get(old).and_then(|l| l.association) else {
            return Ok(());
        };

        let same_ia = match (self.ias.get(old_ia), self.ias.get(ia)) {
            (Some(a), Some(b)) => a.key() == b.key(),
            _ => false,
        };
        let new_active = new.state.is_active();

        let mut status = Ok(());
        if same_ia {
            if new_active {
                return Ok(());
            }
        } else {
            if !new_active {
                return Ok(());
            }
            status = Err(LeaseError::Failure(format!("two active leases for {}", new)));
        }

        self.leases.reference(old)?;
        self.evict(pool, old)?;
        self.drop_from_association(old_ia, old)?;
        self.dereference_lease(old)?;
        status
    }

    // ── Lookups and reservations ────────────────────────────────────────────

    /// Whether `lease` may still be handed out: nothing else holds its
    /// address in its pool.
    pub fn lease_usable(&self, lease: LeaseId) -> bool {
        let Some(l) = self.leases.get(lease) else {
            return false;
        };
        let Some(pool) = l.pool.and_then(|p| self.registry.get(p)) else {
            return false;
        };
        match pool.lookup(l.address) {
            None => true,
            Some(holder) => holder == lease,
        }
    }

    /// Reserve `addr` so generation never hands it out. The placeholder
    /// lives only in the hash.
    pub fn mark_unavailable(&mut self, pool: PoolId, addr: Ipv6Addr) -> LeaseResult<()> {
        let p = self.registry.get_mut(pool).ok_or_else(stale_pool)?;
        if p.active_hash.contains_key(&addr) {
            debug!("{} already taken in pool {:?}", addr, pool);
            return Ok(());
        }
        p.active_hash.try_reserve(1)?;

        let placeholder = self.leases.allocate(Lease::new(addr))?;
        if let Some(p) = self.registry.get_mut(pool) {
            p.active_hash.insert(addr, placeholder);
        }
        Ok(())
    }

    pub fn lease_exists(&self, pool: PoolId, addr: Ipv6Addr) -> bool {
        self.registry
            .get(pool)
            .is_some_and(|p| p.lookup(addr).is_some())
    }

    /// Like [`lease_exists`](Self::lease_exists), but only for the pool's
    /// delegated length.
    pub fn prefix_exists(&self, pool: PoolId, prefix: Ipv6Addr, prefix_len: u8) -> bool {
        self.registry
            .get(pool)
            .is_some_and(|p| p.units == prefix_len && p.lookup(prefix).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::PolicyExecutor;
    use crate::lease::{ADDRESS_PREFIX_LEN, Statement};
    use std::sync::{Arc, Mutex};

    type Fired = Arc<Mutex<Vec<(HookKind, String)>>>;

    struct Recorder(Fired);

    impl PolicyExecutor for Recorder {
        fn execute(&mut self, kind: HookKind, statement: &Statement, _lease: &Lease) {
            self.0.lock().unwrap().push((kind, statement.0.clone()));
        }
    }

    fn addr(s: &str) -> Ipv6Addr {
        s.parse().unwrap()
    }

    fn setup() -> (LeaseDb, PoolId) {
        let mut db = LeaseDb::new();
        let pool = db.create_pool(ResourceType::Na, addr("2001:db8::"), 64, 128).unwrap();
        (db, pool)
    }

    fn add(db: &mut LeaseDb, pool: PoolId, s: &str, end: Timestamp) -> LeaseId {
        let lease = Lease::new(addr(s)).with_prefix_len(ADDRESS_PREFIX_LEN);
        let id = db.allocate_lease(lease).unwrap();
        db.add_lease(pool, id, end).unwrap();
        id
    }

    /// Counters match the heaps, and every pool lease sits in exactly one
    /// of {hash + active heap} or {inactive heap}.
    fn assert_consistent(db: &LeaseDb, pool: PoolId) {
        let p = db.pool(pool).unwrap();
        assert_eq!(p.active_count(), p.active_heap_len());
        assert_eq!(p.inactive_count(), p.inactive_heap_len());

        for (id, lease) in db.leases.iter() {
            let in_hash = p.lookup(lease.address) == Some(id);
            // evicted leases still referenced elsewhere are no longer tracked
            if lease.pool() != Some(pool) || (!in_hash && !lease.is_queued()) {
                continue;
            }
            let active = p.on_active_heap(id, lease);
            let inactive = p.on_inactive_heap(id, lease);
            assert_eq!(in_hash, active, "{} hash/heap mismatch", lease);
            assert!(active != inactive, "{} must be on exactly one heap", lease);
            assert_eq!(active, lease.state.is_active());
        }
    }

    #[test]
    fn test_network_portion() {
        let a = addr("2001:db8:0:0:ffff::1");
        assert_eq!(network_portion(a, 64), u128::from(addr("2001:db8::")));
        assert_eq!(network_portion(a, 0), 0);
        assert_eq!(network_portion(a, 128), u128::from(a));
        assert_eq!(network_portion(addr("2001:db8:ffff::"), 36), u128::from(addr("2001:db8:f000::")));
    }

    #[test]
    fn test_pool_contains() {
        let pool = Pool::new(ResourceType::Na, addr("2001:db8::abcd"), 64, 128).unwrap();
        assert_eq!(pool.start(), addr("2001:db8::"));
        assert!(pool.contains(addr("2001:db8::1")));
        assert!(pool.contains(addr("2001:db8::ffff:ffff:ffff:ffff")));
        assert!(!pool.contains(addr("2001:db8:0:1::1")));
    }

    #[test]
    fn test_pool_rejects_bad_lengths() {
        assert!(Pool::new(ResourceType::Na, Ipv6Addr::UNSPECIFIED, 129, 128).is_err());
        assert!(Pool::new(ResourceType::Pd, Ipv6Addr::UNSPECIFIED, 48, 48).is_err());
        assert!(Pool::new(ResourceType::Pd, Ipv6Addr::UNSPECIFIED, 48, 56).is_ok());
    }

    #[test]
    fn test_add_lease_promotes_free_to_active() {
        let (mut db, pool) = setup();
        let lease = add(&mut db, pool, "2001:db8::10", 1000);

        let l = db.lease(lease).unwrap();
        assert_eq!(l.state, LeaseState::Active);
        assert_eq!(l.hard_expiry, 1000);
        assert_eq!(l.pool(), Some(pool));
        assert_eq!(db.pool(pool).unwrap().lookup(addr("2001:db8::10")), Some(lease));
        assert_eq!(db.pool(pool).unwrap().active_count(), 1);
        assert_consistent(&db, pool);
    }

    #[test]
    fn test_add_inactive_lease_goes_to_inactive_heap() {
        let (mut db, pool) = setup();
        let lease = Lease::new(addr("2001:db8::11")).with_state(LeaseState::Expired);
        let id = db.allocate_lease(lease).unwrap();
        db.add_lease(pool, id, 500).unwrap();

        let l = db.lease(id).unwrap();
        assert_eq!(l.soft_expiry, 500);
        assert_eq!(l.hard_expiry, 0);
        assert!(!db.lease_exists(pool, addr("2001:db8::11")));
        assert_eq!(db.pool(pool).unwrap().inactive_count(), 1);
        assert_consistent(&db, pool);
    }

    #[test]
    fn test_add_lease_evicts_previous_holder() {
        let (mut db, pool) = setup();
        let old = add(&mut db, pool, "2001:db8::20", 1000);
        let new = add(&mut db, pool, "2001:db8::20", 2000);

        assert_eq!(db.pool(pool).unwrap().lookup(addr("2001:db8::20")), Some(new));
        assert_eq!(db.lease_refcount(old), 1);
        assert!(!db.lease(old).unwrap().is_queued());
        assert_eq!(db.pool(pool).unwrap().active_count(), 1);
        assert_consistent(&db, pool);
    }

    #[test]
    fn test_add_lease_twice_requeues() {
        let (mut db, pool) = setup();
        let lease = add(&mut db, pool, "2001:db8::21", 1000);
        db.add_lease(pool, lease, 3000).unwrap();

        assert_eq!(db.lease(lease).unwrap().hard_expiry, 3000);
        assert_eq!(db.lease_refcount(lease), 3);
        assert_eq!(db.pool_refcount(pool), 2);
        assert_consistent(&db, pool);
    }

    #[test]
    fn test_renew_extends_and_reorders() {
        let (mut db, pool) = setup();
        let t0 = 1000;
        let first = add(&mut db, pool, "2001:db8::1", t0);
        let second = add(&mut db, pool, "2001:db8::2", t0 + 50);
        assert_eq!(db.pool(pool).unwrap().next_active().map(|(_, l)| l), Some(first));

        db.lease_mut(first).unwrap().soft_expiry = t0 + 100;
        db.renew_lease(pool, first).unwrap();

        let l = db.lease(first).unwrap();
        assert_eq!(l.hard_expiry, t0 + 100);
        assert_eq!(l.soft_expiry, 0);
        assert_eq!(db.pool(pool).unwrap().next_active().map(|(_, l)| l), Some(second));
        assert_consistent(&db, pool);
    }

    #[test]
    fn test_renew_can_shorten() {
        let (mut db, pool) = setup();
        let first = add(&mut db, pool, "2001:db8::1", 100);
        let second = add(&mut db, pool, "2001:db8::2", 200);

        db.lease_mut(second).unwrap().soft_expiry = 50;
        db.renew_lease(pool, second).unwrap();
        assert_eq!(db.pool(pool).unwrap().next_active().map(|(_, l)| l), Some(second));
        assert_eq!(db.lease(first).unwrap().hard_expiry, 100);
    }

    #[test]
    fn test_decline_then_renew_reclaims() {
        let (mut db, pool) = setup();
        let t0 = 1000;
        let lease = add(&mut db, pool, "2001:db8::3", t0);
        let other = add(&mut db, pool, "2001:db8::4", t0 + 10);

        db.decline_lease(pool, lease).unwrap();
        let l = db.lease(lease).unwrap();
        assert_eq!(l.state, LeaseState::Abandoned);
        assert_eq!(l.hard_expiry, MAX_TIME);
        assert_eq!(db.pool(pool).unwrap().next_active().map(|(_, l)| l), Some(other));
        assert_consistent(&db, pool);

        db.lease_mut(lease).unwrap().soft_expiry = t0 + 200;
        db.renew_lease(pool, lease).unwrap();
        let l = db.lease(lease).unwrap();
        assert_eq!(l.state, LeaseState::Active);
        assert_eq!(l.hard_expiry, t0 + 200);
        assert_consistent(&db, pool);
    }

    #[test]
    fn test_abandoned_lease_never_expires() {
        let (mut db, pool) = setup();
        let lease = add(&mut db, pool, "2001:db8::5", 10);
        db.decline_lease(pool, lease).unwrap();
        assert_eq!(db.expire_lease(pool, 1_000_000).unwrap(), None);
    }

    #[test]
    fn test_release_is_idempotent() {
        let fired: Fired = Arc::default();
        let mut db = LeaseDb::new().with_executor(Box::new(Recorder(fired.clone())));
        let pool = db.create_pool(ResourceType::Na, addr("2001:db8::"), 64, 128).unwrap();
        let lease = add(&mut db, pool, "2001:db8::6", 1000);
        {
            let l = db.lease_mut(lease).unwrap();
            l.hooks.on_release = Some(Statement("release-hook".into()));
            l.hooks.on_expiry = Some(Statement("expiry-hook".into()));
            l.scope = Some([("ddns".to_string(), "host".to_string())].into());
        }

        db.release_lease(pool, lease).unwrap();
        let l = db.lease(lease).unwrap();
        assert_eq!(l.state, LeaseState::Released);
        assert!(l.scope.is_none());
        assert!(l.hooks.on_expiry.is_none());
        assert!(!db.lease_exists(pool, addr("2001:db8::6")));
        assert_consistent(&db, pool);

        db.release_lease(pool, lease).unwrap();
        assert_eq!(db.pool(pool).unwrap().inactive_count(), 1);
        assert_eq!(db.pool(pool).unwrap().active_count(), 0);
        assert_eq!(
            fired.lock().unwrap().as_slice(),
            &[(HookKind::Release, "release-hook".to_string())]
        );
    }

    #[test]
    fn test_expire_pops_oldest_after_hard_expiry() {
        let fired: Fired = Arc::default();
        let mut db = LeaseDb::new().with_executor(Box::new(Recorder(fired.clone())));
        let pool = db.create_pool(ResourceType::Na, addr("2001:db8::"), 64, 128).unwrap();
        let early = add(&mut db, pool, "2001:db8::7", 100);
        let _late = add(&mut db, pool, "2001:db8::8", 200);
        db.lease_mut(early).unwrap().hooks.on_expiry = Some(Statement("gone".into()));
        db.lease_mut(early).unwrap().hooks.on_release = Some(Statement("unused".into()));

        assert_eq!(db.expire_lease(pool, 100).unwrap(), None);
        let expired = db.expire_lease(pool, 101).unwrap();
        assert_eq!(expired, Some(early));

        let l = db.lease(early).unwrap();
        assert_eq!(l.state, LeaseState::Expired);
        assert!(l.hooks.on_release.is_none());
        // creator + inactive heap + returned reference
        assert_eq!(db.lease_refcount(early), 3);
        db.dereference_lease(early).unwrap();

        assert_eq!(db.expire_lease(pool, 150).unwrap(), None);
        assert_eq!(fired.lock().unwrap().len(), 1);
        assert_consistent(&db, pool);
    }

    #[test]
    fn test_renew_moves_expired_lease_back() {
        let (mut db, pool) = setup();
        let lease = add(&mut db, pool, "2001:db8::9", 100);
        let expired = db.expire_lease(pool, 200).unwrap().unwrap();
        db.dereference_lease(expired).unwrap();

        db.lease_mut(lease).unwrap().soft_expiry = 400;
        db.renew_lease(pool, lease).unwrap();
        assert_eq!(db.lease(lease).unwrap().state, LeaseState::Active);
        assert_eq!(db.pool(pool).unwrap().lookup(addr("2001:db8::9")), Some(lease));
        assert_eq!(db.lease_refcount(lease), 3);
        assert_consistent(&db, pool);
    }

    #[test]
    fn test_renew_refuses_taken_address() {
        let (mut db, pool) = setup();
        let lease = add(&mut db, pool, "2001:db8::a", 100);
        db.release_lease(pool, lease).unwrap();
        let _taker = add(&mut db, pool, "2001:db8::a", 500);

        db.lease_mut(lease).unwrap().soft_expiry = 400;
        assert!(matches!(db.renew_lease(pool, lease), Err(LeaseError::Failure(_))));
        assert!(!db.lease_usable(lease));
    }

    #[test]
    fn test_replaced_lease_cannot_be_renewed_or_declined() {
        let fired: Fired = Arc::default();
        let mut db = LeaseDb::new().with_executor(Box::new(Recorder(fired.clone())));
        let pool = db.create_pool(ResourceType::Na, addr("2001:db8::"), 64, 128).unwrap();
        let old = add(&mut db, pool, "2001:db8::e", 100);
        db.lease_mut(old).unwrap().hooks.on_commit = Some(Statement("commit".into()));
        let new = add(&mut db, pool, "2001:db8::e", 200);

        db.lease_mut(old).unwrap().soft_expiry = 900;
        assert!(matches!(db.renew_lease(pool, old), Err(LeaseError::Failure(_))));
        assert_eq!(db.lease(old).unwrap().hard_expiry, 100);
        assert!(fired.lock().unwrap().is_empty());

        assert!(matches!(db.decline_lease(pool, old), Err(LeaseError::Failure(_))));
        assert_eq!(db.lease(old).unwrap().state, LeaseState::Active);
        assert!(!db.lease(old).unwrap().is_queued());

        assert_eq!(db.pool(pool).unwrap().lookup(addr("2001:db8::e")), Some(new));
        assert_consistent(&db, pool);
    }

    #[test]
    fn test_commit_hook_fires_once() {
        let fired: Fired = Arc::default();
        let mut db = LeaseDb::new().with_executor(Box::new(Recorder(fired.clone())));
        let pool = db.create_pool(ResourceType::Na, addr("2001:db8::"), 64, 128).unwrap();
        let lease = add(&mut db, pool, "2001:db8::b", 100);
        db.lease_mut(lease).unwrap().hooks.on_commit = Some(Statement("commit".into()));

        db.lease_mut(lease).unwrap().soft_expiry = 200;
        db.renew_lease(pool, lease).unwrap();
        db.lease_mut(lease).unwrap().soft_expiry = 300;
        db.renew_lease(pool, lease).unwrap();
        assert_eq!(fired.lock().unwrap().as_slice(), &[(HookKind::Commit, "commit".to_string())]);
    }

    #[test]
    fn test_cleanup_frees_after_grace_and_forgets_ia() {
        let (mut db, pool) = setup();
        let ia = db.allocate_ia(1, b"client", ResourceType::Na).unwrap();
        let key = db.association(ia).unwrap().key().clone();
        let lease = add(&mut db, pool, "2001:db8::c", 100);
        db.ia_add_lease(ia, lease).unwrap();
        db.insert_active_ia(ia).unwrap();
        db.dereference_ia(ia).unwrap();
        db.dereference_lease(lease).unwrap();

        let expired = db.expire_lease(pool, 101).unwrap().unwrap();
        db.dereference_lease(expired).unwrap();
        assert_eq!(db.find_active_ia(ResourceType::Na, &key), Some(ia));

        assert_eq!(db.cleanup_old_expired(pool, 100 + 3599).unwrap(), 0);
        assert_eq!(db.cleanup_old_expired(pool, 100 + 3600).unwrap(), 1);

        assert_eq!(db.find_active_ia(ResourceType::Na, &key), None);
        assert!(db.lease(lease).is_none());
        assert!(db.association(ia).is_none());
        assert_eq!(db.pool(pool).unwrap().inactive_count(), 0);
        assert_eq!(db.pool_refcount(pool), 1);
    }

    #[test]
    fn test_cleanup_uses_soft_expiry_without_hard() {
        let (mut db, pool) = setup();
        let id = db
            .allocate_lease(Lease::new(addr("2001:db8::d")).with_state(LeaseState::Released))
            .unwrap();
        db.add_lease(pool, id, 50).unwrap();
        db.dereference_lease(id).unwrap();

        assert_eq!(db.cleanup_old_expired(pool, 49).unwrap(), 0);
        assert_eq!(db.cleanup_old_expired(pool, 50).unwrap(), 1);
        assert_eq!(db.lease_count(), 0);
    }

    #[test]
    fn test_cleanup_orders_by_grace_end_not_raw_expiry() {
        let (mut db, pool) = setup();
        let expired = add(&mut db, pool, "2001:db8::f", 100);
        db.dereference_lease(expired).unwrap();
        let popped = db.expire_lease(pool, 101).unwrap().unwrap();
        db.dereference_lease(popped).unwrap();

        // soft-only lease due later than the expired lease's grace end
        let late = db
            .allocate_lease(Lease::new(addr("2001:db8::10")).with_state(LeaseState::Expired))
            .unwrap();
        db.add_lease(pool, late, 5000).unwrap();
        db.dereference_lease(late).unwrap();

        let (key, head) = db.pool(pool).unwrap().next_inactive().unwrap();
        assert_eq!((key.due, head), (3700, expired));

        assert_eq!(db.cleanup_old_expired(pool, 4000).unwrap(), 1);
        assert!(db.lease(expired).is_none());
        assert!(db.lease(late).is_some());
        assert_eq!(db.cleanup_old_expired(pool, 5000).unwrap(), 1);
        assert_eq!(db.lease_count(), 0);
    }

    #[test]
    fn test_cleanup_keeps_ia_with_remaining_leases() {
        let (mut db, pool) = setup();
        let ia = db.allocate_ia(2, b"client", ResourceType::Na).unwrap();
        let key = db.association(ia).unwrap().key().clone();
        let a = add(&mut db, pool, "2001:db8::e", 100);
        let b = add(&mut db, pool, "2001:db8::f", 10_000);
        db.ia_add_lease(ia, a).unwrap();
        db.ia_add_lease(ia, b).unwrap();
        db.insert_active_ia(ia).unwrap();

        let expired = db.expire_lease(pool, 101).unwrap().unwrap();
        db.dereference_lease(expired).unwrap();
        db.cleanup_old_expired(pool, 5000).unwrap();

        assert_eq!(db.association(ia).unwrap().leases(), &[b]);
        assert_eq!(db.find_active_ia(ResourceType::Na, &key), Some(ia));
    }

    #[test]
    fn test_cleanup_on_load_conflicting_ias() {
        let (mut db, pool) = setup();
        let old_ia = db.allocate_ia(1, b"first", ResourceType::Na).unwrap();
        let old_key = db.association(old_ia).unwrap().key().clone();
        let old = add(&mut db, pool, "2001:db8::100", 1000);
        db.ia_add_lease(old_ia, old).unwrap();
        db.insert_active_ia(old_ia).unwrap();

        let new_ia = db.allocate_ia(1, b"second", ResourceType::Na).unwrap();
        let new = db
            .allocate_lease(Lease::new(addr("2001:db8::100")).with_state(LeaseState::Active))
            .unwrap();

        let result = db.cleanup_on_load(pool, new, new_ia);
        assert!(matches!(result, Err(LeaseError::Failure(_))));
        assert_eq!(db.lease_refcount(old), 1);
        db.dereference_lease(old).unwrap();
        assert!(!db.lease_exists(pool, addr("2001:db8::100")));
        assert!(db.association(old_ia).unwrap().is_empty());
        assert_eq!(db.find_active_ia(ResourceType::Na, &old_key), None);
        assert_consistent(&db, pool);
    }

    #[test]
    fn test_cleanup_on_load_same_ia() {
        let (mut db, pool) = setup();
        let ia = db.allocate_ia(1, b"client", ResourceType::Na).unwrap();
        let old = add(&mut db, pool, "2001:db8::200", 1000);
        db.ia_add_lease(ia, old).unwrap();

        let reload = db.allocate_ia(1, b"client", ResourceType::Na).unwrap();
        let active = db
            .allocate_lease(Lease::new(addr("2001:db8::200")).with_state(LeaseState::Active))
            .unwrap();
        db.cleanup_on_load(pool, active, reload).unwrap();
        assert!(db.lease_exists(pool, addr("2001:db8::200")));

        let released = db
            .allocate_lease(Lease::new(addr("2001:db8::200")).with_state(LeaseState::Released))
            .unwrap();
        db.cleanup_on_load(pool, released, reload).unwrap();
        assert!(!db.lease_exists(pool, addr("2001:db8::200")));
        assert!(db.association(ia).unwrap().is_empty());
    }

    #[test]
    fn test_cleanup_on_load_inactive_newcomer_is_ignored() {
        let (mut db, pool) = setup();
        let ia = db.allocate_ia(1, b"first", ResourceType::Na).unwrap();
        let old = add(&mut db, pool, "2001:db8::300", 1000);
        db.ia_add_lease(ia, old).unwrap();

        let other = db.allocate_ia(1, b"second", ResourceType::Na).unwrap();
        let expired = db
            .allocate_lease(Lease::new(addr("2001:db8::300")).with_state(LeaseState::Expired))
            .unwrap();
        db.cleanup_on_load(pool, expired, other).unwrap();
        assert_eq!(db.pool(pool).unwrap().lookup(addr("2001:db8::300")), Some(old));
    }

    #[test]
    fn test_mark_unavailable_and_exists() {
        let (mut db, pool) = setup();
        let reserved = addr("2001:db8::53");
        assert!(!db.lease_exists(pool, reserved));
        db.mark_unavailable(pool, reserved).unwrap();
        db.mark_unavailable(pool, reserved).unwrap();

        assert!(db.lease_exists(pool, reserved));
        let p = db.pool(pool).unwrap();
        assert_eq!(p.active_count(), 0);
        assert_eq!(p.active_heap_len(), 0);
        assert_eq!(db.lease_count(), 1);
    }

    #[test]
    fn test_prefix_exists_checks_length() {
        let mut db = LeaseDb::new();
        let pool = db.create_pool(ResourceType::Pd, addr("2001:db8::"), 48, 56).unwrap();
        let prefix = addr("2001:db8:0:100::");
        let id = db.allocate_lease(Lease::new(prefix).with_prefix_len(56)).unwrap();
        db.add_lease(pool, id, 1000).unwrap();

        assert!(db.prefix_exists(pool, prefix, 56));
        assert!(!db.prefix_exists(pool, prefix, 64));
        assert!(!db.prefix_exists(pool, addr("2001:db8:0:200::"), 56));
    }

    #[test]
    fn test_lease_usable() {
        let (mut db, pool) = setup();
        let lease = add(&mut db, pool, "2001:db8::400", 100);
        assert!(db.lease_usable(lease));

        let detached = db.allocate_lease(Lease::new(addr("2001:db8::401"))).unwrap();
        assert!(!db.lease_usable(detached));

        db.release_lease(pool, lease).unwrap();
        assert!(db.lease_usable(lease));
    }
}
