use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, Result};

const MAX_KEY_LEN: usize = 255;

/// A client session of the embedded coordination backend. Ephemeral nodes
/// created through the session live exactly as long as it does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub ttl_seconds: u32,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// Query string shared by the lock routes: `?path=<key>`.
#[derive(Debug, Deserialize)]
pub struct LockQuery {
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockStatus {
    Free,
    Held,
}

#[derive(Debug, Serialize)]
pub struct LockStatusResponse {
    pub key: String,
    pub node_path: String,
    pub status: LockStatus,
}

/// Validates a caller-supplied lock key.
///
/// A key becomes a single child node directly under the lock root, so it must
/// be one path component: 1–255 characters from alphanumerics, `-`, `_` and
/// `.`, and not `.` or `..`.
pub fn validate_lock_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(AppError::InvalidLockKey {
            reason: "Lock key cannot be empty".to_string(),
        });
    }

    if key.chars().count() > MAX_KEY_LEN {
        return Err(AppError::InvalidLockKey {
            reason: format!("Lock key cannot exceed {} characters", MAX_KEY_LEN),
        });
    }

    if key == "." || key == ".." {
        return Err(AppError::InvalidLockKey {
            reason: "Lock key cannot be '.' or '..'".to_string(),
        });
    }

    if key.contains('/') {
        return Err(AppError::InvalidLockKey {
            reason: "Lock key cannot contain '/'".to_string(),
        });
    }

    if !key
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(AppError::InvalidLockKey {
            reason: "Lock key can only contain alphanumeric characters, hyphens, underscores, and dots"
                .to_string(),
        });
    }

    Ok(())
}
