use crate::{
    coordination::{Acl, ChildListener, CoordinationClient, CreateMode, StartMode},
    error::{CoordError, CoordResult},
    models::Session,
    store::MemoryEnsemble,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::{task::JoinHandle, time};
use tracing::{debug, info, warn};
use uuid::Uuid;

const MIN_TTL: u32 = 10;
const MAX_TTL: u32 = 300;
const DEFAULT_TTL: u32 = 60;

impl MemoryEnsemble {
    /// Opens a new session. The TTL is clamped to 10..=300 seconds.
    pub fn connect(&self, ttl_seconds: Option<u32>) -> MemorySession {
        let ttl = clamp_ttl(ttl_seconds);
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            ttl_seconds: ttl,
            expires_at: now + chrono::Duration::seconds(ttl as i64),
            created_at: now,
        };
        let id = session.id;
        self.inner.sessions.insert(id, session);

        info!("Session opened: {} (ttl {}s)", id, ttl);
        MemorySession {
            ensemble: self.clone(),
            id,
        }
    }

    pub fn keepalive(&self, session_id: Uuid) -> CoordResult<DateTime<Utc>> {
        let mut entry = self
            .inner
            .sessions
            .get_mut(&session_id)
            .ok_or(CoordError::SessionExpired)?;

        let session = entry.value_mut();
        if session.is_expired() {
            drop(entry);
            self.expire_session(session_id);
            return Err(CoordError::SessionExpired);
        }

        let new_expires = Utc::now() + chrono::Duration::seconds(session.ttl_seconds as i64);
        session.expires_at = new_expires;

        debug!("Session keepalive: {} new expiry {}", session_id, new_expires);
        Ok(new_expires)
    }

    /// Ends a session explicitly, removing its watches and ephemeral nodes.
    pub fn close_session(&self, session_id: Uuid) -> CoordResult<()> {
        if self.inner.sessions.remove(&session_id).is_none() {
            return Err(CoordError::SessionExpired);
        }
        self.remove_session_watches(session_id);
        let removed = self.remove_session_nodes(session_id);
        info!(
            "Session closed: {} ({} ephemeral nodes removed)",
            session_id,
            removed.len()
        );
        Ok(())
    }

    pub fn get_session(&self, session_id: Uuid) -> Option<Session> {
        self.inner
            .sessions
            .get(&session_id)
            .map(|entry| entry.value().clone())
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn start_expiry_task(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = time::interval(Duration::from_secs(5));
            info!("Started session expiry background task (5s interval)");

            loop {
                interval.tick().await;
                self.cleanup_expired_sessions();
            }
        })
    }

    pub(crate) fn cleanup_expired_sessions(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<Uuid> = self
            .inner
            .sessions
            .iter()
            .filter(|entry| entry.value().expires_at <= now)
            .map(|entry| *entry.key())
            .collect();

        for session_id in &expired {
            self.expire_session(*session_id);
        }
        expired.len()
    }

    fn expire_session(&self, session_id: Uuid) {
        if self.inner.sessions.remove(&session_id).is_some() {
            self.remove_session_watches(session_id);
            let removed = self.remove_session_nodes(session_id);
            warn!(
                "Session expired: {} ({} ephemeral nodes removed)",
                session_id,
                removed.len()
            );
        }
    }
}

fn clamp_ttl(ttl: Option<u32>) -> u32 {
    ttl.unwrap_or(DEFAULT_TTL).clamp(MIN_TTL, MAX_TTL)
}

/// A connection to a [`MemoryEnsemble`]. Ephemeral nodes created through it
/// are removed when it is closed or expires.
#[derive(Clone)]
pub struct MemorySession {
    ensemble: MemoryEnsemble,
    id: Uuid,
}

impl MemorySession {
    pub fn session_id(&self) -> Uuid {
        self.id
    }

    pub fn ensemble(&self) -> &MemoryEnsemble {
        &self.ensemble
    }

    pub fn keepalive(&self) -> CoordResult<DateTime<Utc>> {
        self.ensemble.keepalive(self.id)
    }

    pub fn close(&self) -> CoordResult<()> {
        self.ensemble.close_session(self.id)
    }

    /// Heartbeats at half the session TTL until the session is gone.
    pub fn start_keepalive_task(&self) -> JoinHandle<()> {
        let session = self.clone();
        let ttl = self
            .ensemble
            .get_session(self.id)
            .map(|s| s.ttl_seconds)
            .unwrap_or(DEFAULT_TTL);
        let period = Duration::from_secs(u64::from((ttl / 2).max(1)));

        tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = session.keepalive() {
                    warn!("Stopping keepalive for session {}: {}", session.id, e);
                    break;
                }
            }
        })
    }

    fn ensure_alive(&self) -> CoordResult<()> {
        match self.ensemble.get_session(self.id) {
            Some(session) if !session.is_expired() => Ok(()),
            Some(_) => {
                self.ensemble.expire_session(self.id);
                Err(CoordError::SessionExpired)
            }
            None => Err(CoordError::SessionExpired),
        }
    }
}

#[async_trait]
impl CoordinationClient for MemorySession {
    async fn create(
        &self,
        path: &str,
        mode: CreateMode,
        acl: Acl,
        create_parents: bool,
    ) -> CoordResult<String> {
        self.ensure_alive()?;
        self.ensemble
            .create_node(self.id, path, mode, acl, create_parents)
    }

    async fn delete(&self, path: &str) -> CoordResult<()> {
        self.ensure_alive()?;
        self.ensemble.delete_node(path)
    }

    async fn exists(&self, path: &str) -> CoordResult<bool> {
        self.ensure_alive()?;
        self.ensemble.node_exists(path)
    }

    async fn watch_children(
        &self,
        path: &str,
        start: StartMode,
        listener: ChildListener,
    ) -> CoordResult<()> {
        self.ensure_alive()?;
        self.ensemble
            .add_children_watch(self.id, path, start, listener)
    }
}
