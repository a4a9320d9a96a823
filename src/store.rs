//! Embedded, in-process coordination backend.
//!
//! A hierarchical node tree with ZooKeeper semantics: atomic create, ephemeral
//! nodes owned by a session, persistent parents, and children watches. Client
//! handles are [`crate::sessions::MemorySession`]s obtained from
//! [`MemoryEnsemble::connect`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::{
    coordination::{
        parent_of, validate_path, Acl, ChildEvent, ChildListener, CreateMode, StartMode,
    },
    error::{CoordError, CoordResult},
    models::Session,
};

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub(crate) mode: CreateMode,
    pub(crate) owner: Option<Uuid>,
    pub(crate) acl: Acl,
}

#[derive(Default)]
pub(crate) struct EnsembleInner {
    pub(crate) nodes: Mutex<BTreeMap<String, Node>>,
    /// Children watches by watched path, tagged with the owning session.
    pub(crate) watchers: DashMap<String, Vec<(Uuid, ChildListener)>>,
    pub(crate) sessions: DashMap<Uuid, Session>,
}

/// Shared state of the embedded coordination service. Cloning is cheap and
/// every clone sees the same tree.
#[derive(Clone, Default)]
pub struct MemoryEnsemble {
    pub(crate) inner: Arc<EnsembleInner>,
}

type PendingEvents = Vec<(String, ChildEvent)>;

impl MemoryEnsemble {
    pub fn new() -> Self {
        Self::default()
    }

    fn nodes(&self) -> MutexGuard<'_, BTreeMap<String, Node>> {
        self.inner.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn create_node(
        &self,
        session_id: Uuid,
        path: &str,
        mode: CreateMode,
        acl: Acl,
        create_parents: bool,
    ) -> CoordResult<String> {
        validate_path(path)?;
        if path == "/" {
            return Err(CoordError::NodeExists { path: path.to_string() });
        }

        let mut events = PendingEvents::new();
        {
            let mut nodes = self.nodes();
            if nodes.contains_key(path) {
                return Err(CoordError::NodeExists { path: path.to_string() });
            }

            // Walk up until an existing ancestor (or the root) is found.
            let mut missing = Vec::new();
            let mut cursor = parent_of(path);
            while let Some(ancestor) = cursor {
                if ancestor == "/" {
                    break;
                }
                if let Some(node) = nodes.get(ancestor) {
                    if node.mode == CreateMode::Ephemeral {
                        return Err(CoordError::NoChildrenForEphemerals {
                            path: ancestor.to_string(),
                        });
                    }
                    break;
                }
                missing.push(ancestor.to_string());
                cursor = parent_of(ancestor);
            }

            if !missing.is_empty() && !create_parents {
                return Err(CoordError::NoNode { path: missing[0].clone() });
            }

            for ancestor in missing.iter().rev() {
                nodes.insert(
                    ancestor.clone(),
                    Node {
                        mode: CreateMode::Persistent,
                        owner: None,
                        acl,
                    },
                );
                push_event(&mut events, ChildEvent::added(ancestor.as_str()));
            }

            let owner = match mode {
                CreateMode::Ephemeral => Some(session_id),
                CreateMode::Persistent => None,
            };
            nodes.insert(
                path.to_string(),
                Node { mode, owner, acl },
            );
            push_event(&mut events, ChildEvent::added(path));
        }

        debug!("Created {:?} node {}", mode, path);
        self.dispatch(events);
        Ok(path.to_string())
    }

    pub(crate) fn delete_node(&self, path: &str) -> CoordResult<()> {
        validate_path(path)?;
        if path == "/" {
            return Err(CoordError::BadPath {
                path: path.to_string(),
                reason: "the root node cannot be deleted".to_string(),
            });
        }

        {
            let mut nodes = self.nodes();
            if !nodes.contains_key(path) {
                return Err(CoordError::NoNode { path: path.to_string() });
            }
            if has_children(&nodes, path) {
                return Err(CoordError::NotEmpty { path: path.to_string() });
            }
            nodes.remove(path);
        }

        debug!("Deleted node {}", path);
        let mut events = PendingEvents::new();
        push_event(&mut events, ChildEvent::removed(path));
        self.dispatch(events);
        Ok(())
    }

    pub(crate) fn node_exists(&self, path: &str) -> CoordResult<bool> {
        validate_path(path)?;
        Ok(path == "/" || self.nodes().contains_key(path))
    }

    pub(crate) fn add_children_watch(
        &self,
        session_id: Uuid,
        path: &str,
        start: StartMode,
        listener: ChildListener,
    ) -> CoordResult<()> {
        validate_path(path)?;

        // Register while holding the tree so no mutation slips between the
        // snapshot and the registration.
        let existing = {
            let nodes = self.nodes();
            self.inner
                .watchers
                .entry(path.to_string())
                .or_default()
                .push((session_id, listener.clone()));
            match start {
                StartMode::ReplayExisting => direct_children(&nodes, path),
                StartMode::PostInitialSync => Vec::new(),
            }
        };

        debug!("Installed children watch on {} ({:?})", path, start);
        for child in existing {
            listener(ChildEvent::added(child));
        }
        Ok(())
    }

    /// Drops every children watch installed by `session_id`. Paths left with
    /// no watchers are removed from the registry.
    pub(crate) fn remove_session_watches(&self, session_id: Uuid) -> usize {
        let mut removed = 0;
        self.inner.watchers.retain(|_, listeners| {
            let before = listeners.len();
            listeners.retain(|(owner, _)| *owner != session_id);
            removed += before - listeners.len();
            !listeners.is_empty()
        });
        removed
    }

    /// Removes every ephemeral node owned by `session_id`, notifying watchers.
    pub(crate) fn remove_session_nodes(&self, session_id: Uuid) -> Vec<String> {
        let removed: Vec<String> = {
            let mut nodes = self.nodes();
            let owned: Vec<String> = nodes
                .iter()
                .filter(|(_, node)| node.owner == Some(session_id))
                .map(|(path, _)| path.clone())
                .collect();
            for path in &owned {
                nodes.remove(path);
            }
            owned
        };

        let mut events = PendingEvents::new();
        for path in &removed {
            push_event(&mut events, ChildEvent::removed(path.as_str()));
        }
        self.dispatch(events);
        removed
    }

    /// Full paths of the direct children of `path`.
    pub fn children(&self, path: &str) -> Vec<String> {
        direct_children(&self.nodes(), path)
    }

    pub fn node_count(&self) -> usize {
        self.nodes().len()
    }

    /// Mode of the node at `path`, if it exists.
    pub fn node_mode(&self, path: &str) -> Option<CreateMode> {
        self.nodes().get(path).map(|node| node.mode)
    }

    pub fn node_acl(&self, path: &str) -> Option<Acl> {
        self.nodes().get(path).map(|node| node.acl)
    }

    /// Number of installed children watches across all paths.
    pub fn watcher_count(&self) -> usize {
        self.inner
            .watchers
            .iter()
            .map(|entry| entry.value().len())
            .sum()
    }

    fn dispatch(&self, events: PendingEvents) {
        for (parent, event) in events {
            let listeners = match self.inner.watchers.get(&parent) {
                Some(entry) => entry.value().clone(),
                None => continue,
            };
            for (_, listener) in listeners {
                listener(event.clone());
            }
        }
    }
}

fn push_event(events: &mut PendingEvents, event: ChildEvent) {
    if let Some(parent) = parent_of(&event.path) {
        events.push((parent.to_string(), event));
    }
}

fn child_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{}/", path)
    }
}

fn has_children(nodes: &BTreeMap<String, Node>, path: &str) -> bool {
    let prefix = child_prefix(path);
    nodes
        .range(prefix.clone()..)
        .next()
        .map_or(false, |(key, _)| key.starts_with(&prefix))
}

fn direct_children(nodes: &BTreeMap<String, Node>, path: &str) -> Vec<String> {
    let prefix = child_prefix(path);
    nodes
        .range(prefix.clone()..)
        .take_while(|(key, _)| key.starts_with(&prefix))
        .filter(|(key, _)| !key[prefix.len()..].contains('/'))
        .map(|(key, _)| key.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::CoordinationClient;
    use std::sync::Mutex as StdMutex;

    fn recorder() -> (ChildListener, Arc<StdMutex<Vec<ChildEvent>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: ChildListener = Arc::new(move |event| sink.lock().unwrap().push(event));
        (listener, seen)
    }

    #[tokio::test]
    async fn test_create_and_exists() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect(Some(60));

        assert!(!client.exists("/rootlock").await.unwrap());
        client
            .create("/rootlock", CreateMode::Persistent, Acl::OpenUnsafe, false)
            .await
            .unwrap();
        assert!(client.exists("/rootlock").await.unwrap());
        assert!(client.exists("/").await.unwrap());
        assert_eq!(ensemble.node_mode("/rootlock"), Some(CreateMode::Persistent));
    }

    #[tokio::test]
    async fn test_create_existing_node_fails() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect(Some(60));

        client
            .create("/foo", CreateMode::Ephemeral, Acl::OpenUnsafe, false)
            .await
            .unwrap();
        let err = client
            .create("/foo", CreateMode::Ephemeral, Acl::OpenUnsafe, false)
            .await
            .unwrap_err();
        assert_eq!(err, CoordError::NodeExists { path: "/foo".to_string() });
    }

    #[tokio::test]
    async fn test_create_parents() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect(Some(60));

        let err = client
            .create("/a/b/c", CreateMode::Ephemeral, Acl::OpenUnsafe, false)
            .await
            .unwrap_err();
        assert_eq!(err, CoordError::NoNode { path: "/a/b".to_string() });
        assert_eq!(ensemble.node_count(), 0);

        client
            .create("/a/b/c", CreateMode::Ephemeral, Acl::OpenUnsafe, true)
            .await
            .unwrap();
        assert_eq!(ensemble.node_mode("/a"), Some(CreateMode::Persistent));
        assert_eq!(ensemble.node_mode("/a/b"), Some(CreateMode::Persistent));
        assert_eq!(ensemble.node_mode("/a/b/c"), Some(CreateMode::Ephemeral));
    }

    #[tokio::test]
    async fn test_acl_is_recorded() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect(Some(60));

        client
            .create("/locked/down", CreateMode::Persistent, Acl::CreatorAll, true)
            .await
            .unwrap();
        assert_eq!(ensemble.node_acl("/locked"), Some(Acl::CreatorAll));
        assert_eq!(ensemble.node_acl("/locked/down"), Some(Acl::CreatorAll));
        assert_eq!(ensemble.node_acl("/missing"), None);
    }

    #[tokio::test]
    async fn test_ephemeral_cannot_have_children() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect(Some(60));

        client
            .create("/eph", CreateMode::Ephemeral, Acl::OpenUnsafe, false)
            .await
            .unwrap();
        let err = client
            .create("/eph/child", CreateMode::Persistent, Acl::OpenUnsafe, true)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::NoChildrenForEphemerals { .. }));
    }

    #[tokio::test]
    async fn test_delete() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect(Some(60));

        let err = client.delete("/missing").await.unwrap_err();
        assert!(matches!(err, CoordError::NoNode { .. }));

        client
            .create("/p/c", CreateMode::Persistent, Acl::OpenUnsafe, true)
            .await
            .unwrap();
        let err = client.delete("/p").await.unwrap_err();
        assert!(matches!(err, CoordError::NotEmpty { .. }));

        client.delete("/p/c").await.unwrap();
        client.delete("/p").await.unwrap();
        assert_eq!(ensemble.node_count(), 0);
    }

    #[tokio::test]
    async fn test_has_children_ignores_siblings_with_common_prefix() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect(Some(60));

        client
            .create("/a", CreateMode::Persistent, Acl::OpenUnsafe, false)
            .await
            .unwrap();
        client
            .create("/ab/x", CreateMode::Persistent, Acl::OpenUnsafe, true)
            .await
            .unwrap();
        client.delete("/a").await.unwrap();
        assert_eq!(ensemble.children("/"), vec!["/ab".to_string()]);
    }

    #[tokio::test]
    async fn test_watch_post_initial_sync() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect(Some(60));
        client
            .create("/root/existing", CreateMode::Persistent, Acl::OpenUnsafe, true)
            .await
            .unwrap();

        let (listener, seen) = recorder();
        client
            .watch_children("/root", StartMode::PostInitialSync, listener)
            .await
            .unwrap();
        assert!(seen.lock().unwrap().is_empty());

        client
            .create("/root/new", CreateMode::Ephemeral, Acl::OpenUnsafe, false)
            .await
            .unwrap();
        client.delete("/root/existing").await.unwrap();

        // Grandchildren are not reported to a children watch.
        client
            .create("/root/deep/er", CreateMode::Persistent, Acl::OpenUnsafe, true)
            .await
            .unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ChildEvent::added("/root/new"),
                ChildEvent::removed("/root/existing"),
                ChildEvent::added("/root/deep"),
            ]
        );
    }

    #[tokio::test]
    async fn test_watch_replay_existing() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect(Some(60));
        client
            .create("/root/one", CreateMode::Persistent, Acl::OpenUnsafe, true)
            .await
            .unwrap();
        client
            .create("/root/two", CreateMode::Persistent, Acl::OpenUnsafe, true)
            .await
            .unwrap();

        let (listener, seen) = recorder();
        client
            .watch_children("/root", StartMode::ReplayExisting, listener)
            .await
            .unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![ChildEvent::added("/root/one"), ChildEvent::added("/root/two")]
        );
    }

    #[tokio::test]
    async fn test_watch_on_missing_node_sees_later_children() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect(Some(60));

        let (listener, seen) = recorder();
        client
            .watch_children("/later", StartMode::PostInitialSync, listener)
            .await
            .unwrap();
        client
            .create("/later/x", CreateMode::Ephemeral, Acl::OpenUnsafe, true)
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![ChildEvent::added("/later/x")]);
    }

    #[tokio::test]
    async fn test_remove_session_nodes_only_touches_owned_ephemerals() {
        let ensemble = MemoryEnsemble::new();
        let first = ensemble.connect(Some(60));
        let second = ensemble.connect(Some(60));

        first
            .create("/root/a", CreateMode::Ephemeral, Acl::OpenUnsafe, true)
            .await
            .unwrap();
        second
            .create("/root/b", CreateMode::Ephemeral, Acl::OpenUnsafe, true)
            .await
            .unwrap();

        let removed = ensemble.remove_session_nodes(first.session_id());
        assert_eq!(removed, vec!["/root/a".to_string()]);
        assert_eq!(ensemble.children("/root"), vec!["/root/b".to_string()]);
        assert_eq!(ensemble.node_mode("/root"), Some(CreateMode::Persistent));
    }
}
