//! DHCPv6 lease-pool manager: pools of IPv6 addresses and delegated
//! prefixes, the leases handed out from them, the client associations
//! holding those leases, and the timers that expire and free them.
//!
//! Everything lives in one [`LeaseDb`]. Callers that change leases arm the
//! affected pool with [`LeaseDb::schedule_next_timeout`]; the
//! [`run_expiry_scheduler`] task does the rest.

pub mod alloc;
pub mod arena;
pub mod bulk;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod heap;
pub mod ia;
pub mod lease;
pub mod pool;
pub mod registry;
pub mod scheduler;
pub mod store;

pub use config::{Lease6Config, PoolConfig};
pub use db::{LeaseDb, SharedLeaseDb};
pub use error::{LeaseError, LeaseResult};
pub use events::{EventBus, HookKind, LeaseEvent, PolicyExecutor};
pub use ia::{Association, IaKey};
pub use lease::{IaId, Lease, LeaseId, LeaseState, PoolId, ResourceType, Statement, Timestamp};
pub use pool::Pool;
pub use scheduler::{now_secs, run_expiry_scheduler};
pub use store::{IaRecord, JsonLeaseFile, LeaseRecord, LeaseStore};
