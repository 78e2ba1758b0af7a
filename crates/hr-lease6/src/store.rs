//! Lease persistence: the journal contract, the JSON-lines journal, and
//! rebuilding associations from it at startup.

use std::fs::OpenOptions;
use std::io::Write;
use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::db::LeaseDb;
use crate::error::{LeaseError, LeaseResult};
use crate::lease::{BindingScope, IaId, Lease, LeaseId, LeaseState, ResourceType, Statement, Timestamp};

/// Where committed transitions go. A record is always a whole association,
/// so the newest record for a key describes it completely.
pub trait LeaseStore: Send {
    fn write_lease_record(&mut self, record: &IaRecord) -> Result<()>;

    /// Flush records buffered since the last commit.
    fn commit_if_dirty(&mut self) -> Result<()>;

    /// Replace the journal with exactly `records`.
    fn rewrite(&mut self, _records: &[IaRecord]) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IaRecord {
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    pub iaid: u32,
    /// Hex-encoded client DUID.
    pub duid: String,
    pub leases: Vec<LeaseRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub address: Ipv6Addr,
    pub prefix_len: u8,
    pub state: LeaseState,
    pub end_time: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_expiry: Option<Statement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_release: Option<Statement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<BindingScope>,
}

impl LeaseRecord {
    fn from_lease(lease: &Lease) -> Self {
        Self {
            address: lease.address,
            prefix_len: lease.prefix_len,
            state: lease.state,
            end_time: lease.hard_expiry,
            on_expiry: lease.hooks.on_expiry.clone(),
            on_release: lease.hooks.on_release.clone(),
            scope: lease.scope.clone(),
        }
    }
}

// ── JSON-lines journal ──────────────────────────────────────────────────────

/// Append-only journal, one `IaRecord` per line. Later lines win on reload.
pub struct JsonLeaseFile {
    path: PathBuf,
    pending: Vec<String>,
}

impl JsonLeaseFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf(), pending: Vec::new() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every readable record in file order. A missing file is an empty
    /// journal; unparsable lines are skipped.
    pub fn load(&self) -> Result<Vec<IaRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read lease file {}", self.path.display()))?;

        let mut records = Vec::new();
        for (n, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<IaRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping corrupt lease record {}:{}: {}", self.path.display(), n + 1, e),
            }
        }
        Ok(records)
    }

    fn ensure_parent(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        Ok(())
    }
}

impl LeaseStore for JsonLeaseFile {
    fn write_lease_record(&mut self, record: &IaRecord) -> Result<()> {
        let line = serde_json::to_string(record).context("Failed to serialize lease record")?;
        self.pending.push(line);
        Ok(())
    }

    fn commit_if_dirty(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.ensure_parent()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open lease file {}", self.path.display()))?;
        for line in &self.pending {
            writeln!(file, "{}", line)
                .with_context(|| format!("Failed to append to {}", self.path.display()))?;
        }
        let _ = file.sync_data();
        debug!("Committed {} lease record(s)", self.pending.len());
        self.pending.clear();
        Ok(())
    }

    fn rewrite(&mut self, records: &[IaRecord]) -> Result<()> {
        self.ensure_parent()?;
        let mut content = String::new();
        for record in records {
            content.push_str(&serde_json::to_string(record).context("Failed to serialize lease record")?);
            content.push('\n');
        }
        let tmp_path = self.path.with_extension("jsonl.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("Failed to write lease file {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("Failed to rename lease file to {}", self.path.display()))?;
        self.pending.clear();
        Ok(())
    }
}

// ── LeaseDb side ────────────────────────────────────────────────────────────

impl LeaseDb {
    /// Snapshot of one association.
    pub fn ia_record(&self, ia: IaId) -> Option<IaRecord> {
        let assoc = self.association(ia)?;
        let leases = assoc
            .leases()
            .iter()
            .filter_map(|l| self.lease(*l))
            .map(LeaseRecord::from_lease)
            .collect();
        Some(IaRecord {
            resource_type: assoc.resource_type(),
            iaid: assoc.key().iaid(),
            duid: hex::encode(assoc.key().duid()),
            leases,
        })
    }

    /// Snapshot of every tracked association.
    pub fn ia_records(&self) -> Vec<IaRecord> {
        ResourceType::ALL
            .iter()
            .flat_map(|ty| self.active_ias[ty.index()].values())
            .filter_map(|ia| self.ia_record(*ia))
            .collect()
    }

    /// Journal the association `lease` belongs to. Failures are logged;
    /// the in-memory transition stands.
    pub(crate) fn persist_lease(&mut self, lease: LeaseId) {
        if self.store.is_none() {
            return;
        }
        let Some(ia) = self.lease(lease).and_then(|l| l.association()) else {
            debug!("Lease {:?} has no association to write", lease);
            return;
        };
        let Some(record) = self.ia_record(ia) else {
            return;
        };
        if let Some(store) = self.store.as_mut() {
            if let Err(e) = store.write_lease_record(&record) {
                warn!("Failed to write lease record for IA {}: {:#}", ia_label(&record), e);
            }
        }
    }

    pub fn commit_leases(&mut self) {
        if let Some(store) = self.store.as_mut() {
            if let Err(e) = store.commit_if_dirty() {
                warn!("Failed to commit leases: {:#}", e);
            }
        }
    }

    /// Rewrite the journal from the tracked associations.
    pub fn compact_store(&mut self) -> Result<()> {
        let records = self.ia_records();
        let Some(store) = self.store.as_mut() else {
            return Ok(());
        };
        store.rewrite(&records)?;
        info!("Compacted lease journal to {} association(s)", records.len());
        Ok(())
    }

    /// Rebuild one association from the journal. Active and abandoned leases
    /// are linked to it; every lease goes back into its pool. The
    /// association replaces any earlier one with the same key and is only
    /// tracked if it holds leases.
    pub fn load_ia_record(&mut self, record: &IaRecord) -> LeaseResult<()> {
        let duid = hex::decode(&record.duid).map_err(|_| LeaseError::InvalidArgument("duid is not hex"))?;
        let ty = record.resource_type;
        let ia = self.allocate_ia(record.iaid, &duid, ty)?;

        let loaded = self.load_leases(ia, record);
        let key = self.association(ia).map(|a| a.key().clone());
        let holds_leases = self.association(ia).is_some_and(|a| !a.is_empty());

        let tracked = match loaded {
            Err(e) => Err(e),
            Ok(()) if holds_leases => self.insert_active_ia(ia),
            Ok(()) => {
                if let Some(key) = key {
                    self.remove_active_ia(ty, &key);
                }
                Ok(())
            }
        };
        self.dereference_ia(ia)?;
        tracked
    }

    fn load_leases(&mut self, ia: IaId, record: &IaRecord) -> LeaseResult<()> {
        let ty = record.resource_type;
        for lr in &record.leases {
            let mut lease = Lease::new(lr.address)
                .with_state(lr.state)
                .with_prefix_len(lr.prefix_len);
            lease.hooks.on_expiry = lr.on_expiry.clone();
            lease.hooks.on_release = lr.on_release.clone();
            lease.scope = lr.scope.clone();
            if lr.state == LeaseState::Released {
                lease.hard_expiry = lr.end_time;
            }

            let pool = match self.find_pool(ty, lr.address) {
                Ok(pool) => pool,
                Err(_) => {
                    warn!("No pool found for {} lease {}", ty, lr.address);
                    continue;
                }
            };

            let id = self.allocate_lease(lease)?;
            if let Err(e) = self.cleanup_on_load(pool, id, ia) {
                warn!("Duplicate {} lease {}: {}", ty, lr.address, e);
            }

            let linked = if lr.state.is_active() { self.ia_add_lease(ia, id) } else { Ok(()) };
            let added = linked.and_then(|()| self.add_lease(pool, id, lr.end_time));
            self.dereference_lease(id)?;
            added?;
        }
        Ok(())
    }
}

fn ia_label(record: &IaRecord) -> String {
    format!("{}/{}", record.iaid, record.duid)
}
