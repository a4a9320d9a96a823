//! Client-side contract of the coordination service.
//!
//! Everything the lock core needs from a ZooKeeper-style store: atomic node
//! creation, deletion, existence checks and a children watch. Backends live in
//! [`crate::store`] (embedded, in-process) and `crate::zk` (behind the
//! `zookeeper` feature).

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{CoordError, CoordResult};

/// Lifetime of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CreateMode {
    /// Removed automatically when the creating session ends.
    Ephemeral,
    /// Survives session loss; removed only by an explicit delete.
    Persistent,
}

/// Access control attached to a created node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Acl {
    /// World-readable and world-writable.
    OpenUnsafe,
    /// Full rights for the authenticated creator only.
    CreatorAll,
    /// World-readable, no write rights.
    ReadUnsafe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChildEventKind {
    Added,
    Removed,
}

/// A change to the children of a watched node. `path` is the full path of
/// the child that was added or removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChildEvent {
    pub kind: ChildEventKind,
    pub path: String,
}

impl ChildEvent {
    pub fn added(path: impl Into<String>) -> Self {
        Self { kind: ChildEventKind::Added, path: path.into() }
    }

    pub fn removed(path: impl Into<String>) -> Self {
        Self { kind: ChildEventKind::Removed, path: path.into() }
    }
}

/// How a children watch treats the children that exist when it is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Take the initial listing silently; only later changes are delivered.
    PostInitialSync,
    /// Deliver an `Added` event for every existing child before later changes.
    ReplayExisting,
}

pub type ChildListener = Arc<dyn Fn(ChildEvent) + Send + Sync>;

#[async_trait]
pub trait CoordinationClient: Send + Sync + 'static {
    /// Atomically creates `path`. Fails with [`CoordError::NodeExists`] if the
    /// node is already present. With `create_parents`, missing ancestors are
    /// created as persistent nodes first.
    async fn create(
        &self,
        path: &str,
        mode: CreateMode,
        acl: Acl,
        create_parents: bool,
    ) -> CoordResult<String>;

    /// Deletes `path`. Fails with [`CoordError::NoNode`] if it is absent.
    async fn delete(&self, path: &str) -> CoordResult<()>;

    async fn exists(&self, path: &str) -> CoordResult<bool>;

    /// Subscribes `listener` to child additions and removals under `path`.
    /// The watch stays installed until the client's session closes or expires.
    async fn watch_children(
        &self,
        path: &str,
        start: StartMode,
        listener: ChildListener,
    ) -> CoordResult<()>;
}

/// Checks that `path` is absolute, has no trailing slash and no empty, `.`
/// or `..` components.
pub fn validate_path(path: &str) -> CoordResult<()> {
    let bad = |reason: &str| CoordError::BadPath {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    if !path.starts_with('/') {
        return Err(bad("path must start with '/'"));
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        return Err(bad("path must not end with '/'"));
    }
    for component in path[1..].split('/') {
        match component {
            "" => return Err(bad("empty path component")),
            "." | ".." => return Err(bad("relative path component")),
            _ => {}
        }
    }
    Ok(())
}

/// Parent of an absolute path; `None` for the root.
pub fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Joins a child name onto an absolute parent path.
pub fn join_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// A client rebound to a fixed namespace: every path is resolved under
/// `/{namespace}` and event paths are reported relative to it.
pub struct Namespaced {
    inner: Arc<dyn CoordinationClient>,
    prefix: String,
}

impl Namespaced {
    pub fn new(inner: Arc<dyn CoordinationClient>, namespace: &str) -> Self {
        let trimmed = namespace.trim_matches('/');
        let prefix = if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{}", trimmed)
        };
        Self { inner, prefix }
    }

    pub fn namespace(&self) -> &str {
        &self.prefix
    }

    fn fix_path(&self, path: &str) -> String {
        if self.prefix.is_empty() {
            path.to_string()
        } else if path == "/" {
            self.prefix.clone()
        } else {
            format!("{}{}", self.prefix, path)
        }
    }

    fn unfix_path(prefix: &str, path: &str) -> String {
        match path.strip_prefix(prefix) {
            Some("") => "/".to_string(),
            Some(rest) if rest.starts_with('/') => rest.to_string(),
            _ => path.to_string(),
        }
    }
}

#[async_trait]
impl CoordinationClient for Namespaced {
    async fn create(
        &self,
        path: &str,
        mode: CreateMode,
        acl: Acl,
        create_parents: bool,
    ) -> CoordResult<String> {
        validate_path(path)?;
        let created = self
            .inner
            .create(&self.fix_path(path), mode, acl, create_parents)
            .await?;
        Ok(Self::unfix_path(&self.prefix, &created))
    }

    async fn delete(&self, path: &str) -> CoordResult<()> {
        validate_path(path)?;
        self.inner.delete(&self.fix_path(path)).await
    }

    async fn exists(&self, path: &str) -> CoordResult<bool> {
        validate_path(path)?;
        self.inner.exists(&self.fix_path(path)).await
    }

    async fn watch_children(
        &self,
        path: &str,
        start: StartMode,
        listener: ChildListener,
    ) -> CoordResult<()> {
        validate_path(path)?;
        let prefix = self.prefix.clone();
        let relative: ChildListener = Arc::new(move |event: ChildEvent| {
            listener(ChildEvent {
                kind: event.kind,
                path: Namespaced::unfix_path(&prefix, &event.path),
            })
        });
        self.inner
            .watch_children(&self.fix_path(path), start, relative)
            .await
    }
}
