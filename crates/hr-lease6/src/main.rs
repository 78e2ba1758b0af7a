use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use hr_lease6::{EventBus, JsonLeaseFile, Lease6Config, run_expiry_scheduler};

fn config_path() -> PathBuf {
    PathBuf::from(
        std::env::var("LEASE6_CONFIG_PATH")
            .unwrap_or_else(|_| "/var/lib/server-dashboard/dhcpv6-config.json".to_string()),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("hr_lease6=info")),
        )
        .init();

    info!("hr-lease6d starting...");

    let path = config_path();
    let config = if path.exists() {
        Lease6Config::load_from_file(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?
    } else {
        info!("No config file found at {}, using defaults", path.display());
        Lease6Config::default()
    };

    let mut db = config.build_db()?;

    // Reload the journal before attaching it so replayed records are not
    // written back.
    let journal = JsonLeaseFile::new(&config.lease_file);
    let records = match journal.load() {
        Ok(records) => records,
        Err(e) => {
            warn!("Failed to load lease file: {:#}", e);
            Vec::new()
        }
    };
    let mut failed = 0;
    for record in &records {
        if let Err(e) = db.load_ia_record(record) {
            warn!("Skipping lease record for IAID {}: {}", record.iaid, e);
            failed += 1;
        }
    }
    info!("Loaded {} lease record(s) from {} ({} skipped)", records.len() - failed, config.lease_file, failed);

    let events = EventBus::new();
    let mut db = db.with_store(Box::new(journal)).with_executor(Box::new(events.clone()));
    if let Err(e) = db.compact_store() {
        warn!("Failed to compact lease file: {:#}", e);
    }
    db.schedule_all_timeouts();

    let db = db.into_shared();
    let scheduler = tokio::spawn(run_expiry_scheduler(db.clone()));

    // Lease events go to the log until another service subscribes.
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => info!(
                    "{:?} {}/{} ({:?}): {}",
                    event.kind, event.address, event.prefix_len, event.state, event.statement
                ),
                Err(RecvError::Lagged(n)) => warn!("Lease event log lagged, {} event(s) dropped", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    info!("hr-lease6d started successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    scheduler.abort();

    let mut db = db.lock().await;
    db.commit_leases();
    if let Err(e) = db.compact_store() {
        error!("Failed to save leases on shutdown: {:#}", e);
    } else {
        info!("Leases saved successfully");
    }

    Ok(())
}
