use std::net::Ipv6Addr;
use std::path::Path;

use anyhow::{Context, Result, bail};
use ipnet::Ipv6Net;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::LeaseDb;
use crate::lease::{ADDRESS_PREFIX_LEN, EXPIRED_IPV6_CLEANUP_TIME, ResourceType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease6Config {
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
    #[serde(default = "default_lease_file")]
    pub lease_file: String,
    #[serde(default = "default_expired_cleanup_secs")]
    pub expired_cleanup_secs: u64,
    #[serde(default)]
    pub reserved_addresses: Vec<Ipv6Addr>,
    #[serde(default)]
    pub reserved_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    pub prefix: String,
    /// Length of the prefixes handed out by a PD pool.
    #[serde(default)]
    pub delegated_len: Option<u8>,
}

fn default_lease_file() -> String {
    "/var/lib/server-dashboard/dhcpv6-leases6.jsonl".to_string()
}
fn default_expired_cleanup_secs() -> u64 {
    EXPIRED_IPV6_CLEANUP_TIME
}

impl Default for Lease6Config {
    fn default() -> Self {
        Self {
            pools: Vec::new(),
            lease_file: default_lease_file(),
            expired_cleanup_secs: default_expired_cleanup_secs(),
            reserved_addresses: Vec::new(),
            reserved_prefixes: Vec::new(),
        }
    }
}

impl PoolConfig {
    /// Network, prefix length and unit length of the pool.
    fn range(&self) -> Result<(Ipv6Net, u8)> {
        let net: Ipv6Net = self
            .prefix
            .parse()
            .with_context(|| format!("Invalid pool prefix: {}", self.prefix))?;

        let units = match (self.resource_type, self.delegated_len) {
            (ResourceType::Pd, None) => bail!("PD pool {} needs a delegated_len", net),
            (ResourceType::Pd, Some(len)) if len <= net.prefix_len() || len > 128 => {
                bail!("PD pool {}: delegated_len {} must be longer than the pool prefix", net, len)
            }
            (ResourceType::Pd, Some(len)) => len,
            (_, _) => ADDRESS_PREFIX_LEN,
        };
        Ok((net.trunc(), units))
    }
}

impl Lease6Config {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Lease6Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("Failed to write config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("Failed to rename config to {}", path.display()))?;
        Ok(())
    }

    /// Create every configured pool and apply the reservations.
    pub fn build_db(&self) -> Result<LeaseDb> {
        let mut db = LeaseDb::new().with_expired_cleanup_secs(self.expired_cleanup_secs);

        for pool in &self.pools {
            let (net, units) = pool.range()?;
            db.create_pool(pool.resource_type, net.network(), net.prefix_len(), units)
                .with_context(|| format!("Failed to create {} pool {}", pool.resource_type, net))?;
        }

        let prefixes = self
            .reserved_prefixes
            .iter()
            .map(|p| p.parse::<Ipv6Net>().with_context(|| format!("Invalid reserved prefix: {}", p)))
            .collect::<Result<Vec<_>>>()?;

        let hosts = db.mark_hosts_unavailable(&self.reserved_addresses);
        let delegated = db.mark_prefixes_unavailable(&prefixes);
        info!(
            "Built {} pool(s), {} reserved address(es), {} reserved prefix(es)",
            db.registry().len(),
            hosts,
            delegated
        );
        Ok(db)
    }
}
