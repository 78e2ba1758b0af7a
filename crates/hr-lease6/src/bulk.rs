//! Renew, release or decline every lease an association holds.

use tracing::debug;

use crate::db::LeaseDb;
use crate::error::{LeaseError, LeaseResult};
use crate::lease::{IaId, LeaseId, PoolId};

type LeaseOp = fn(&mut LeaseDb, PoolId, LeaseId) -> LeaseResult<()>;

impl LeaseDb {
    pub fn renew_leases(&mut self, ia: IaId) -> LeaseResult<()> {
        self.change_leases(ia, LeaseDb::renew_lease)
    }

    pub fn release_leases(&mut self, ia: IaId) -> LeaseResult<()> {
        self.change_leases(ia, LeaseDb::release_lease)
    }

    pub fn decline_leases(&mut self, ia: IaId) -> LeaseResult<()> {
        self.change_leases(ia, LeaseDb::decline_lease)
    }

    /// Apply `op` to each lease in the pool that covers it. A failure does
    /// not stop the rest; the last one is returned.
    fn change_leases(&mut self, ia: IaId, op: LeaseOp) -> LeaseResult<()> {
        let assoc = self.association(ia).ok_or(LeaseError::InvalidArgument("stale association"))?;
        let resource_type = assoc.resource_type();
        let leases = assoc.leases().to_vec();

        let mut result = Ok(());
        for lease in leases {
            let Some(address) = self.lease(lease).map(|l| l.address) else {
                continue;
            };
            let Ok(pool) = self.find_pool(resource_type, address) else {
                debug!("No {} pool for {}", resource_type, address);
                continue;
            };
            if let Err(e) = op(self, pool, lease) {
                result = Err(e);
            }
        }
        result
    }
}
