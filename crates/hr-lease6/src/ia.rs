//! Identity associations (IA_NA / IA_TA / IA_PD) and their lease arrays.

use std::fmt;

use tracing::error;

use crate::db::LeaseDb;
use crate::error::{LeaseError, LeaseResult};
use crate::lease::{IaId, LeaseId, ResourceType};

/// Slots added each time an association's lease array fills up. Clients
/// rarely hold more than a handful of addresses per IA.
const IA_LEASE_INCREMENT: usize = 4;

/// IAID followed by the client DUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IaKey(Vec<u8>);

impl IaKey {
    pub fn new(iaid: u32, duid: &[u8]) -> LeaseResult<Self> {
        let mut key = Vec::new();
        key.try_reserve_exact(4 + duid.len())?;
        key.extend_from_slice(&iaid.to_be_bytes());
        key.extend_from_slice(duid);
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn iaid(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    pub fn duid(&self) -> &[u8] {
        &self.0[4..]
    }
}

impl fmt::Display for IaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.iaid(), hex::encode(self.duid()))
    }
}

#[derive(Debug)]
pub struct Association {
    key: IaKey,
    resource_type: ResourceType,
    pub(crate) leases: Vec<LeaseId>,
}

impl Association {
    pub fn new(key: IaKey, resource_type: ResourceType) -> Self {
        Self { key, resource_type, leases: Vec::new() }
    }

    pub fn key(&self) -> &IaKey {
        &self.key
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    pub fn leases(&self) -> &[LeaseId] {
        &self.leases
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}

impl LeaseDb {
    /// Link `lease` into `ia`: the association takes a reference on the
    /// lease and the lease points back at the association.
    pub fn ia_add_lease(&mut self, ia: IaId, lease: LeaseId) -> LeaseResult<()> {
        let assoc = self.ias.get_mut(ia).ok_or(LeaseError::InvalidArgument("stale association"))?;
        if !self.leases.contains(lease) {
            return Err(LeaseError::InvalidArgument("stale lease"));
        }

        if assoc.leases.len() == assoc.leases.capacity() {
            assoc.leases.try_reserve_exact(IA_LEASE_INCREMENT)?;
        }
        self.leases.reference(lease)?;
        assoc.leases.push(lease);

        if let Some(l) = self.leases.get_mut(lease) {
            l.association = Some(ia);
        }
        Ok(())
    }

    /// Unlink one occurrence of `lease` (compared by identity). Missing
    /// arguments are a no-op.
    pub fn ia_remove_lease(&mut self, ia: Option<IaId>, lease: Option<LeaseId>) {
        let (Some(ia), Some(lease)) = (ia, lease) else {
            return;
        };
        let Some(assoc) = self.ias.get_mut(ia) else {
            error!("ia_remove_lease: stale association {:?}", ia);
            return;
        };

        let Some(pos) = assoc.leases.iter().position(|l| *l == lease) else {
            error!("IAADDR/PREFIX {:?} not in IA {}", lease, assoc.key);
            return;
        };
        assoc.leases.remove(pos);

        if let Some(l) = self.leases.get_mut(lease) {
            if l.association == Some(ia) {
                l.association = None;
            }
        }
        if let Err(e) = self.dereference_lease(lease) {
            error!("Releasing lease removed from IA: {}", e);
        }
    }

    pub fn ia_remove_all_leases(&mut self, ia: IaId) {
        let Some(assoc) = self.ias.get_mut(ia) else {
            error!("ia_remove_all_leases: stale association {:?}", ia);
            return;
        };

        for lease in std::mem::take(&mut assoc.leases) {
            if let Some(l) = self.leases.get_mut(lease) {
                if l.association == Some(ia) {
                    l.association = None;
                }
            }
            if let Err(e) = self.dereference_lease(lease) {
                error!("Releasing lease removed from IA: {}", e);
            }
        }
    }

    /// Same type, same key, and the same set of (address, prefix length)
    /// pairs in any order.
    pub fn ia_equal(&self, a: Option<IaId>, b: Option<IaId>) -> bool {
        let (a, b) = match (a, b) {
            (None, None) => return true,
            (Some(a), Some(b)) => (a, b),
            _ => return false,
        };
        let (Some(a), Some(b)) = (self.ias.get(a), self.ias.get(b)) else {
            return false;
        };

        if a.resource_type != b.resource_type || a.key != b.key || a.len() != b.len() {
            return false;
        }

        let pairs = |assoc: &Association| -> Vec<_> {
            assoc
                .leases
                .iter()
                .filter_map(|l| self.leases.get(*l))
                .map(|l| (l.address, l.prefix_len))
                .collect()
        };
        let (mut ours, mut theirs) = (pairs(a), pairs(b));
        ours.sort_unstable();
        theirs.sort_unstable();
        ours == theirs
    }

    // ── Active association tables ───────────────────────────────────────────

    /// Track `ia` as the active association for its key, releasing any
    /// association previously stored under the same key.
    pub fn insert_active_ia(&mut self, ia: IaId) -> LeaseResult<()> {
        let assoc = self.ias.get(ia).ok_or(LeaseError::InvalidArgument("stale association"))?;
        let ty = assoc.resource_type;
        let key = assoc.key.clone();

        self.ias.reference(ia)?;
        if let Some(old) = self.active_ias[ty.index()].insert(key, ia) {
            self.dereference_ia(old)?;
        }
        Ok(())
    }

    pub fn find_active_ia(&self, resource_type: ResourceType, key: &IaKey) -> Option<IaId> {
        self.active_ias[resource_type.index()].get(key).copied()
    }

    pub fn remove_active_ia(&mut self, resource_type: ResourceType, key: &IaKey) -> bool {
        match self.active_ias[resource_type.index()].remove(key) {
            Some(ia) => {
                if let Err(e) = self.dereference_ia(ia) {
                    error!("Releasing association {}: {}", key, e);
                }
                true
            }
            None => false,
        }
    }

    pub fn active_ia_count(&self, resource_type: ResourceType) -> usize {
        self.active_ias[resource_type.index()].len()
    }

    /// Drop `ia` from its type table if it holds no more leases and is
    /// still the tracked association for its key.
    pub(crate) fn forget_ia_if_empty(&mut self, ia: IaId) {
        let Some(assoc) = self.ias.get(ia) else {
            return;
        };
        if !assoc.is_empty() {
            return;
        }
        let ty = assoc.resource_type;
        let key = assoc.key.clone();
        if self.find_active_ia(ty, &key) == Some(ia) {
            self.remove_active_ia(ty, &key);
        }
    }
}
