use crate::{
    app::AppState,
    coordination::{join_path, Acl, CoordinationClient, CreateMode},
    error::{AppError, CoordError, CoordResult, Result},
    metrics::{LockEvent, Metrics},
    models::{validate_lock_key, LockQuery, LockStatus, LockStatusResponse},
    signal::ReleaseSignal,
    watch::{self, ReleaseWatcher},
};
use axum::{
    extract::{Query, State},
    Json,
};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::futures::Notified;
use tokio::time;
use tracing::{debug, error, info, warn};

/// Named mutex over a coordination client.
///
/// A lock on `key` is held while the ephemeral node `{root}/{key}` exists;
/// whoever created it is the owner. The manager itself keeps no lock state,
/// only the [`ReleaseSignal`] its blocked acquirers sleep on. Clones share
/// the signal.
#[derive(Clone)]
pub struct LockManager {
    client: Arc<dyn CoordinationClient>,
    root: String,
    signal: Arc<ReleaseSignal>,
    metrics: Arc<Metrics>,
    recheck_interval: Option<Duration>,
}

/// Proof of a successful [`LockManager::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acquired {
    pub key: String,
    pub node_path: String,
    pub attempts: u32,
}

impl LockManager {
    pub fn new(client: Arc<dyn CoordinationClient>, root: &str, metrics: Arc<Metrics>) -> Self {
        Self {
            client,
            root: format!("/{}", root.trim_matches('/')),
            signal: Arc::new(ReleaseSignal::new()),
            metrics,
            recheck_interval: None,
        }
    }

    /// Bounds every wait so a blocked acquirer also retries on a timer, not
    /// only when a removal is observed.
    pub fn with_recheck_interval(mut self, interval: Option<Duration>) -> Self {
        self.recheck_interval = interval;
        self
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn client(&self) -> &Arc<dyn CoordinationClient> {
        &self.client
    }

    pub fn signal(&self) -> &Arc<ReleaseSignal> {
        &self.signal
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn key_path(&self, key: &str) -> String {
        join_path(&self.root, key)
    }

    pub fn release_watcher(&self, key: &str) -> ReleaseWatcher {
        ReleaseWatcher::new(key, self.signal.clone(), self.metrics.clone())
    }

    /// Installs a release watch for `key`. Passing the root's own name
    /// watches every lock under the root.
    pub async fn watch_key(&self, key: &str) -> CoordResult<String> {
        watch::install(self.client.as_ref(), &self.root, self.release_watcher(key)).await
    }

    /// Blocks until the lock on `key` is held by this manager's session.
    ///
    /// Every failed create, whether the node exists or the client reported
    /// a transient error, parks the caller on the release signal and then
    /// retries. There is no timeout and no fairness between waiters.
    pub async fn acquire(&self, key: &str) -> Acquired {
        let node_path = self.key_path(key);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let released = self.signal.waiter();

            match self
                .client
                .create(&node_path, CreateMode::Ephemeral, Acl::OpenUnsafe, true)
                .await
            {
                Ok(_) => {
                    self.metrics.record_lock_event(LockEvent::Acquired);
                    info!("Lock acquired: {} (attempt {})", node_path, attempts);
                    return Acquired {
                        key: key.to_string(),
                        node_path,
                        attempts,
                    };
                }
                Err(CoordError::NodeExists { .. }) => {
                    debug!("Lock {} is held, waiting for release", node_path);
                }
                Err(e) => {
                    warn!("Failed to acquire lock {}: {}; waiting to retry", node_path, e);
                }
            }

            self.metrics.record_lock_event(LockEvent::FailedAttempt);
            self.wait(released).await;
            self.metrics.record_lock_event(LockEvent::Wakeup);
        }
    }

    async fn wait(&self, released: Notified<'_>) {
        match self.recheck_interval {
            Some(interval) => {
                if time::timeout(interval, released).await.is_err() {
                    debug!("No release observed within {:?}, re-checking", interval);
                }
            }
            None => released.await,
        }
    }

    /// Deletes the lock node for `key` if it exists.
    ///
    /// Returns `true` when the node is gone afterwards, including when it was
    /// never there. Client failures are logged and reported as `false`; the
    /// node may still exist in that case. Ownership is not checked.
    pub async fn release(&self, key: &str) -> bool {
        let node_path = self.key_path(key);

        match self.delete_if_present(&node_path).await {
            Ok(true) => {
                self.metrics.record_lock_event(LockEvent::Released);
                info!("Lock released: {}", node_path);
                true
            }
            Ok(false) => {
                debug!("Lock {} not held, nothing to release", node_path);
                true
            }
            Err(e) => {
                self.metrics.record_lock_event(LockEvent::ReleaseFailed);
                error!("Failed to release lock {}: {}", node_path, e);
                false
            }
        }
    }

    async fn delete_if_present(&self, node_path: &str) -> CoordResult<bool> {
        if !self.client.exists(node_path).await? {
            return Ok(false);
        }
        match self.client.delete(node_path).await {
            Ok(()) => Ok(true),
            Err(CoordError::NoNode { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn is_held(&self, key: &str) -> CoordResult<bool> {
        self.client.exists(&self.key_path(key)).await
    }
}

// ── Route handlers ──────────────────────────────────────────────────────

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1_000.0
}

pub async fn lock(
    State(state): State<AppState>,
    Query(query): Query<LockQuery>,
) -> Result<Json<bool>> {
    let started = Instant::now();
    let result = lock_key(&state, query.path).await;
    state
        .metrics
        .record_request("lock", elapsed_ms(started), result.is_err());
    result.map(Json)
}

async fn lock_key(state: &AppState, key: String) -> Result<bool> {
    validate_lock_key(&key)?;

    // Runs detached: a client that disconnects while waiting must not abandon
    // an acquire halfway through.
    let manager = state.lock_manager.clone();
    let acquired = tokio::spawn(async move { manager.acquire(&key).await })
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("acquire task failed: {}", e)))?;

    debug!("Lock request for {} satisfied", acquired.node_path);
    Ok(true)
}

pub async fn release(
    State(state): State<AppState>,
    Query(query): Query<LockQuery>,
) -> Result<Json<bool>> {
    let started = Instant::now();
    let result = match validate_lock_key(&query.path) {
        Ok(()) => Ok(state.lock_manager.release(&query.path).await),
        Err(e) => Err(e),
    };
    state
        .metrics
        .record_request("release", elapsed_ms(started), result.is_err());
    result.map(Json)
}

pub async fn status(
    State(state): State<AppState>,
    Query(query): Query<LockQuery>,
) -> Result<Json<LockStatusResponse>> {
    let started = Instant::now();
    let result = lock_status(&state, query.path).await;
    state
        .metrics
        .record_request("status", elapsed_ms(started), result.is_err());
    result.map(Json)
}

async fn lock_status(state: &AppState, key: String) -> Result<LockStatusResponse> {
    validate_lock_key(&key)?;

    let held = state.lock_manager.is_held(&key).await?;
    Ok(LockStatusResponse {
        node_path: state.lock_manager.key_path(&key),
        key,
        status: if held { LockStatus::Held } else { LockStatus::Free },
    })
}
