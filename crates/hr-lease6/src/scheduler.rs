//! Per-pool expiration timers and the async loop that fires them.
//!
//! Each pool has at most one armed deadline. An armed timer holds a
//! reference on its pool, released when the timer fires or is cancelled;
//! re-arming just moves the deadline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::Notify;
use tracing::{debug, error, warn};

use crate::db::{LeaseDb, SharedLeaseDb};
use crate::error::LeaseResult;
use crate::lease::{MAX_TIME, PoolId, Timestamp};

pub fn now_secs() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct TimerTable {
    deadlines: HashMap<PoolId, Timestamp>,
    waker: Arc<Notify>,
}

impl Default for TimerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerTable {
    pub fn new() -> Self {
        Self { deadlines: HashMap::new(), waker: Arc::new(Notify::new()) }
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    pub fn deadline(&self, pool: PoolId) -> Option<Timestamp> {
        self.deadlines.get(&pool).copied()
    }

    /// Earliest armed deadline across all pools.
    pub fn next(&self) -> Option<Timestamp> {
        self.deadlines.values().copied().min()
    }

    fn due(&self, now: Timestamp) -> Vec<PoolId> {
        self.deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(pool, _)| *pool)
            .collect()
    }
}

impl LeaseDb {
    /// Arm `pool`'s timer for the earlier of the first active lease's end
    /// and the first inactive lease's cleanup time. Nothing is armed when
    /// neither heap has anything due.
    pub fn schedule_next_timeout(&mut self, pool: PoolId) -> LeaseResult<()> {
        let p = self.pool_ref(pool)?;

        let mut next = MAX_TIME;
        if let Some((key, _)) = p.next_active() {
            if key.hard < next {
                next = key.hard + 1;
            }
        }
        if let Some((key, _)) = p.next_inactive() {
            if key.due < next {
                next = key.due + 1;
            }
        }
        if next >= MAX_TIME {
            return Ok(());
        }

        if !self.timers.deadlines.contains_key(&pool) {
            self.registry.reference(pool)?;
        }
        self.timers.deadlines.insert(pool, next);
        self.timers.waker.notify_one();
        debug!("Pool {:?}: next timeout at {}", pool, next);
        Ok(())
    }

    pub fn schedule_all_timeouts(&mut self) {
        for pool in self.registry.ids().to_vec() {
            if let Err(e) = self.schedule_next_timeout(pool) {
                error!("Failed to schedule timeout for pool {:?}: {}", pool, e);
            }
        }
    }

    /// Disarm `pool`'s timer, releasing the reference it held.
    pub fn cancel_timeout(&mut self, pool: PoolId) -> LeaseResult<bool> {
        if self.timers.deadlines.remove(&pool).is_none() {
            return Ok(false);
        }
        self.dereference_pool(pool)?;
        Ok(true)
    }

    pub fn next_timer_deadline(&self) -> Option<Timestamp> {
        self.timers.next()
    }

    pub fn timer_deadline(&self, pool: PoolId) -> Option<Timestamp> {
        self.timers.deadline(pool)
    }

    pub fn timer_waker(&self) -> Arc<Notify> {
        self.timers.waker.clone()
    }

    /// Fire every timer due at `now`. Returns how many fired.
    pub fn run_due_timers(&mut self, now: Timestamp) -> usize {
        let due = self.timers.due(now);
        for pool in &due {
            self.timers.deadlines.remove(pool);
            if let Err(e) = self.on_timeout(*pool, now) {
                error!("Lease timeout for pool {:?} failed: {}", pool, e);
            }
            // the fired timer's reference; a re-armed timer took its own
            if let Err(e) = self.dereference_pool(*pool) {
                error!("Releasing timer reference on pool {:?}: {}", pool, e);
            }
        }
        due.len()
    }

    /// One timer firing: expire everything due, journal each expired
    /// lease, free what is past its grace period, then re-arm.
    pub fn on_timeout(&mut self, pool: PoolId, now: Timestamp) -> LeaseResult<()> {
        let mut expired = 0;
        loop {
            match self.expire_lease(pool, now) {
                Ok(Some(lease)) => {
                    self.persist_lease(lease);
                    self.dereference_lease(lease)?;
                    expired += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Expiring leases in pool {:?}: {}", pool, e);
                    break;
                }
            }
        }
        if expired > 0 {
            debug!("Pool {:?}: expired {} lease(s)", pool, expired);
        }
        self.commit_leases();

        self.cleanup_old_expired(pool, now)?;
        self.schedule_next_timeout(pool)
    }
}

/// Sleep until the earliest armed timer, fire what is due, repeat. Wakes
/// early whenever a timer is re-armed.
pub async fn run_expiry_scheduler(db: SharedLeaseDb) {
    let waker = db.lock().await.timer_waker();
    loop {
        let next = db.lock().await.next_timer_deadline();
        match next {
            Some(deadline) => {
                let wait = Duration::from_secs(deadline.saturating_sub(now_secs()));
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = waker.notified() => continue,
                }
            }
            None => {
                waker.notified().await;
                continue;
            }
        }

        let fired = db.lock().await.run_due_timers(now_secs());
        if fired > 0 {
            debug!("Fired {} pool timer(s)", fired);
        }
    }
}
