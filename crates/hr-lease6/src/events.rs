use std::net::Ipv6Addr;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::lease::{Lease, LeaseState, Statement};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookKind {
    Commit,
    Expiry,
    Release,
}

/// Runs the policy statements attached to a lease. The lease database calls
/// it at most once per statement; the statement is cleared afterwards.
pub trait PolicyExecutor: Send {
    fn execute(&mut self, kind: HookKind, statement: &Statement, lease: &Lease);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseEvent {
    pub kind: HookKind,
    pub statement: String,
    pub address: Ipv6Addr,
    pub prefix_len: u8,
    pub state: LeaseState,
}

/// Bus d'événements des baux : diffuse chaque hook exécuté (DNS, dashboard)
#[derive(Clone)]
pub struct EventBus {
    pub leases: broadcast::Sender<LeaseEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self { leases: broadcast::channel(256).0 }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LeaseEvent> {
        self.leases.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyExecutor for EventBus {
    fn execute(&mut self, kind: HookKind, statement: &Statement, lease: &Lease) {
        let event = LeaseEvent {
            kind,
            statement: statement.0.clone(),
            address: lease.address,
            prefix_len: lease.prefix_len,
            state: lease.state,
        };
        // no subscribers is fine
        if self.leases.send(event).is_err() {
            debug!("No listener for {:?} on {}", kind, lease);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_bus_publishes() {
        let mut bus = EventBus::new();
        let mut rx = bus.subscribe();
        let lease = Lease::new("2001:db8::1".parse().unwrap()).with_state(LeaseState::Expired);

        bus.execute(HookKind::Expiry, &Statement("ddns-remove".into()), &lease);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, HookKind::Expiry);
        assert_eq!(event.statement, "ddns-remove");
        assert_eq!(event.state, LeaseState::Expired);
    }

    #[test]
    fn test_event_bus_without_listeners() {
        let mut bus = EventBus::default();
        let lease = Lease::new(Ipv6Addr::LOCALHOST);
        bus.execute(HookKind::Commit, &Statement("noop".into()), &lease);
    }

    #[tokio::test]
    async fn test_expiry_reaches_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let mut db = crate::db::LeaseDb::new().with_executor(Box::new(bus));
        let pool = db
            .create_pool(crate::lease::ResourceType::Na, "2001:db8::".parse().unwrap(), 64, 128)
            .unwrap();
        let (lease, _) = db.create_address(pool, b"client", 10).unwrap();
        db.lease_mut(lease).unwrap().hooks.on_expiry = Some(Statement("expired".into()));

        let expired = db.expire_lease(pool, 11).unwrap().unwrap();
        db.dereference_lease(expired).unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, HookKind::Expiry);
        assert_eq!(event.address, db.lease(lease).unwrap().address);
    }
}
