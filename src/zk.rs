//! [`CoordinationClient`] over a real ZooKeeper ensemble.
//!
//! The `zookeeper` crate is synchronous, so every call runs on tokio's
//! blocking pool. Children watches are one-shot in ZooKeeper; each installed
//! watch gets a dedicated thread that re-arms `get_children_w` after every
//! firing and diffs the child list against the previous one to produce
//! added/removed events.

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc,
    },
    thread,
    time::Duration,
};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};
use zookeeper::{WatchedEvent, ZkError, ZkResult, ZkState, ZooKeeper, ZooKeeperExt};

use crate::{
    coordination::{
        join_path, parent_of, validate_path, Acl, ChildEvent, ChildListener, CoordinationClient,
        CreateMode, StartMode,
    },
    error::{CoordError, CoordResult},
};

const REARM_RETRY: Duration = Duration::from_secs(1);
const CLOSE_POLL: Duration = Duration::from_millis(500);

pub struct ZkCoordinator {
    zk: Arc<ZooKeeper>,
    closed: Arc<AtomicBool>,
}

impl ZkCoordinator {
    /// Connects to `connect_string` (`host:port[,host:port...]`). Blocks.
    pub fn connect(connect_string: &str, session_timeout: Duration) -> CoordResult<Self> {
        let zk = ZooKeeper::connect(connect_string, session_timeout, |event: WatchedEvent| {
            debug!("ZooKeeper session event: {:?}", event);
        })
        .map_err(|e| map_zk_error("/", e))?;

        zk.add_listener(|state: ZkState| info!("ZooKeeper connection state: {:?}", state));
        info!("Connected to ZooKeeper at {}", connect_string);

        Ok(Self {
            zk: Arc::new(zk),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Ends the session. Ephemeral nodes it created are removed by the server.
    pub fn close(&self) -> CoordResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.zk.close().map_err(|e| map_zk_error("/", e))
    }

    async fn blocking<T, F>(&self, path: &str, op: F) -> CoordResult<T>
    where
        F: FnOnce(&ZooKeeper) -> ZkResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let zk = self.zk.clone();
        let path = path.to_string();
        tokio::task::spawn_blocking(move || op(&zk).map_err(|e| map_zk_error(&path, e)))
            .await
            .map_err(|e| CoordError::Backend(format!("blocking task failed: {}", e)))?
    }
}

#[async_trait]
impl CoordinationClient for ZkCoordinator {
    async fn create(
        &self,
        path: &str,
        mode: CreateMode,
        acl: Acl,
        create_parents: bool,
    ) -> CoordResult<String> {
        validate_path(path)?;
        let node = path.to_string();

        self.blocking(path, move |zk| {
            if create_parents {
                if let Some(parent) = parent_of(&node).filter(|p| *p != "/") {
                    zk.ensure_path(parent)?;
                }
            }
            zk.create(&node, Vec::new(), zk_acl(acl), zk_mode(mode))
        })
        .await
    }

    async fn delete(&self, path: &str) -> CoordResult<()> {
        validate_path(path)?;
        let node = path.to_string();
        self.blocking(path, move |zk| zk.delete(&node, None)).await
    }

    async fn exists(&self, path: &str) -> CoordResult<bool> {
        validate_path(path)?;
        let node = path.to_string();
        self.blocking(path, move |zk| zk.exists(&node, false).map(|stat| stat.is_some()))
            .await
    }

    async fn watch_children(
        &self,
        path: &str,
        start: StartMode,
        listener: ChildListener,
    ) -> CoordResult<()> {
        validate_path(path)?;
        let zk = self.zk.clone();
        let closed = self.closed.clone();
        let node = path.to_string();

        tokio::task::spawn_blocking(move || start_watch(zk, closed, node, start, listener))
            .await
            .map_err(|e| CoordError::Backend(format!("blocking task failed: {}", e)))?
    }
}

fn start_watch(
    zk: Arc<ZooKeeper>,
    closed: Arc<AtomicBool>,
    path: String,
    start: StartMode,
    listener: ChildListener,
) -> CoordResult<()> {
    let (tx, rx) = mpsc::channel();
    let initial = arm(&zk, &path, &tx).map_err(|e| map_zk_error(&path, e))?;

    if start == StartMode::ReplayExisting {
        for child in &initial {
            listener(ChildEvent::added(child.as_str()));
        }
    }

    let watched = path.clone();
    thread::Builder::new()
        .name("zk-children-watch".to_string())
        .spawn(move || watch_loop(zk, closed, watched, initial, listener, tx, rx))
        .map_err(|e| CoordError::Backend(format!("failed to spawn watch thread: {}", e)))?;

    info!("Installed ZooKeeper children watch on {}", path);
    Ok(())
}

/// Sets a one-shot watch on the children of `path` and returns their full
/// paths. A missing node is watched for creation instead.
fn arm(zk: &ZooKeeper, path: &str, tx: &Sender<WatchedEvent>) -> ZkResult<BTreeSet<String>> {
    let children_tx = tx.clone();
    match zk.get_children_w(path, move |event: WatchedEvent| {
        let _ = children_tx.send(event);
    }) {
        Ok(children) => Ok(children.iter().map(|c| join_path(path, c)).collect()),
        Err(ZkError::NoNode) => {
            let exists_tx = tx.clone();
            match zk.exists_w(path, move |event: WatchedEvent| {
                let _ = exists_tx.send(event);
            })? {
                // Created between the two calls.
                Some(_) => arm(zk, path, tx),
                None => Ok(BTreeSet::new()),
            }
        }
        Err(e) => Err(e),
    }
}

fn watch_loop(
    zk: Arc<ZooKeeper>,
    closed: Arc<AtomicBool>,
    path: String,
    mut known: BTreeSet<String>,
    listener: ChildListener,
    tx: Sender<WatchedEvent>,
    rx: Receiver<WatchedEvent>,
) {
    while let Some(event) = next_event(&rx, &closed, CLOSE_POLL) {
        if closed.load(Ordering::SeqCst) {
            break;
        }
        debug!("Children watch on {} fired: {:?}", path, event);

        let current = loop {
            match arm(&zk, &path, &tx) {
                Ok(current) => break Some(current),
                Err(ZkError::SessionExpired) => break None,
                Err(_) if closed.load(Ordering::SeqCst) => break None,
                Err(e) => {
                    warn!("Failed to re-arm children watch on {}: {:?}", path, e);
                    thread::sleep(REARM_RETRY);
                }
            }
        };

        let Some(current) = current else {
            error!("Children watch on {} stopped: session ended", path);
            break;
        };

        for change in diff_children(&known, &current) {
            listener(change);
        }
        known = current;
    }
    debug!("Children watch thread for {} exiting", path);
}

/// Waits for the next watch firing. Returns `None` once the client is closed,
/// checking the flag every `tick` since the loop holds a sender of its own.
fn next_event<T>(rx: &Receiver<T>, closed: &AtomicBool, tick: Duration) -> Option<T> {
    loop {
        match rx.recv_timeout(tick) {
            Ok(event) => return Some(event),
            Err(RecvTimeoutError::Timeout) if closed.load(Ordering::SeqCst) => return None,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return None,
        }
    }
}

/// Removals first, then additions, each in path order.
fn diff_children(before: &BTreeSet<String>, after: &BTreeSet<String>) -> Vec<ChildEvent> {
    before
        .difference(after)
        .map(|p| ChildEvent::removed(p.as_str()))
        .chain(after.difference(before).map(|p| ChildEvent::added(p.as_str())))
        .collect()
}

fn zk_mode(mode: CreateMode) -> zookeeper::CreateMode {
    match mode {
        CreateMode::Ephemeral => zookeeper::CreateMode::Ephemeral,
        CreateMode::Persistent => zookeeper::CreateMode::Persistent,
    }
}

fn zk_acl(acl: Acl) -> Vec<zookeeper::Acl> {
    match acl {
        Acl::OpenUnsafe => zookeeper::Acl::open_unsafe().clone(),
        Acl::CreatorAll => zookeeper::Acl::creator_all().clone(),
        Acl::ReadUnsafe => zookeeper::Acl::read_unsafe().clone(),
    }
}

fn map_zk_error(path: &str, err: ZkError) -> CoordError {
    let path = path.to_string();
    match err {
        ZkError::NodeExists => CoordError::NodeExists { path },
        ZkError::NoNode => CoordError::NoNode { path },
        ZkError::NotEmpty => CoordError::NotEmpty { path },
        ZkError::NoChildrenForEphemerals => CoordError::NoChildrenForEphemerals { path },
        ZkError::SessionExpired => CoordError::SessionExpired,
        ZkError::ConnectionLoss | ZkError::OperationTimeout => {
            CoordError::ConnectionLoss(format!("{:?}", err))
        }
        other => CoordError::Backend(format!("{:?} at {}", other, path)),
    }
}
