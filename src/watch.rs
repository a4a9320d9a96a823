//! Watch-driven wake-ups for blocked acquirers.
//!
//! A single children watch on the lock root turns every matching "child
//! removed" event into a raise of the shared [`ReleaseSignal`]. Matching is a
//! plain substring test of the removed node's full path against the watched
//! key. Keys that are substrings of one another (`foo` / `foobar`) therefore
//! wake each other's waiters. That only costs a spurious retry, since every
//! waiter re-checks its own node after waking.

use std::sync::Arc;

use tracing::{debug, info};

use crate::{
    coordination::{join_path, ChildEvent, ChildEventKind, ChildListener, CoordinationClient, StartMode},
    error::CoordResult,
    metrics::{LockEvent, Metrics},
    signal::ReleaseSignal,
};

#[derive(Clone)]
pub struct ReleaseWatcher {
    key: String,
    signal: Arc<ReleaseSignal>,
    metrics: Arc<Metrics>,
}

impl ReleaseWatcher {
    pub fn new(key: impl Into<String>, signal: Arc<ReleaseSignal>, metrics: Arc<Metrics>) -> Self {
        Self {
            key: key.into(),
            signal,
            metrics,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn matches(&self, removed_path: &str) -> bool {
        removed_path.contains(self.key.as_str())
    }

    /// Handles one watch event; returns whether the signal was raised.
    pub fn handle(&self, event: &ChildEvent) -> bool {
        if event.kind != ChildEventKind::Removed {
            return false;
        }

        self.metrics.record_lock_event(LockEvent::RemovalObserved);
        info!("Lock node removed: {}", event.path);

        if self.matches(&event.path) {
            self.signal.raise();
            true
        } else {
            debug!("Removal of {} does not match watched key {}", event.path, self.key);
            false
        }
    }

    pub fn into_listener(self) -> ChildListener {
        Arc::new(move |event: ChildEvent| {
            self.handle(&event);
        })
    }
}

/// Node whose children are watched for `key`: the root itself when `key`
/// names the root, otherwise `root/key`.
pub fn watch_target(root: &str, key: &str) -> String {
    if key == root.trim_start_matches('/') {
        root.to_string()
    } else {
        join_path(root, key)
    }
}

/// Installs a post-initial-sync children watch for `key` under `root`.
pub async fn install(
    client: &dyn CoordinationClient,
    root: &str,
    watcher: ReleaseWatcher,
) -> CoordResult<String> {
    let target = watch_target(root, watcher.key());
    client
        .watch_children(&target, StartMode::PostInitialSync, watcher.into_listener())
        .await?;
    info!("Release watch installed on {}", target);
    Ok(target)
}
