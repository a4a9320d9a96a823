//! One-time startup of the lock service: namespace the client, make sure the
//! lock root exists, then install the release watch on it.
//!
//! Failures are logged and startup continues unless `bootstrap_strict` is set.
//! A service that comes up without its watch still grants uncontended locks,
//! but a contended acquire then only wakes on the optional re-check timer and
//! otherwise blocks forever.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::{
    config::Config,
    coordination::{Acl, CoordinationClient, CreateMode, Namespaced},
    error::{AppError, CoordError, CoordResult, Result},
    locks::LockManager,
    metrics::Metrics,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BootstrapStatus {
    pub root_ready: bool,
    pub watch_installed: bool,
}

impl BootstrapStatus {
    pub fn is_healthy(&self) -> bool {
        self.root_ready && self.watch_installed
    }
}

pub async fn bootstrap(
    client: Arc<dyn CoordinationClient>,
    config: &Config,
    metrics: Arc<Metrics>,
) -> Result<(LockManager, BootstrapStatus)> {
    let namespaced = Namespaced::new(client, &config.namespace);
    info!("Coordination client scoped to namespace {}", namespaced.namespace());

    let manager = LockManager::new(Arc::new(namespaced), &config.lock_root, metrics)
        .with_recheck_interval(config.acquire_recheck);
    let mut status = BootstrapStatus::default();

    if let Err(e) = ensure_root(manager.client().as_ref(), manager.root()).await {
        error!("Failed to prepare lock root {}: {}", manager.root(), e);
        return degraded(config, manager, status, format!("lock root unavailable: {}", e));
    }
    status.root_ready = true;

    let root_name = manager.root().trim_start_matches('/').to_string();
    if let Err(e) = manager.watch_key(&root_name).await {
        error!("Failed to install release watch on {}: {}", manager.root(), e);
        return degraded(config, manager, status, format!("release watch unavailable: {}", e));
    }
    status.watch_installed = true;

    info!("Lock service ready under {}", manager.root());
    Ok((manager, status))
}

async fn ensure_root(client: &dyn CoordinationClient, root: &str) -> CoordResult<()> {
    if client.exists(root).await? {
        info!("Lock root {} already exists", root);
        return Ok(());
    }

    match client
        .create(root, CreateMode::Persistent, Acl::OpenUnsafe, true)
        .await
    {
        Ok(_) => {
            info!("Created lock root {}", root);
            Ok(())
        }
        Err(CoordError::NodeExists { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

fn degraded(
    config: &Config,
    manager: LockManager,
    status: BootstrapStatus,
    reason: String,
) -> Result<(LockManager, BootstrapStatus)> {
    if config.bootstrap_strict {
        return Err(AppError::Bootstrap(reason));
    }

    match config.acquire_recheck {
        Some(interval) => warn!(
            "Continuing without a release watch; blocked acquirers re-check every {:?}",
            interval
        ),
        None => warn!("Continuing without a release watch; contended acquires may block forever"),
    }
    Ok((manager, status))
}
