//! Keyed registries backing the relay.
//!
//! The router is stateless per request; everything it knows about sessions,
//! connections and cached output lives behind these traits. Two backends are
//! provided: Redis for deployments and an in-process map for single-node runs
//! and tests. Both honour TTL expiry.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tether_proto::{now_millis, Role, SessionMetadata, SessionStatus, SessionSummary};

mod memory;
mod redis_store;

pub use self::memory::MemoryRegistry;
pub use self::redis_store::RedisRegistry;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Expiry windows applied by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryTtl {
    pub session: Duration,
    pub connection: Duration,
    pub message: Duration,
    /// Upper bound on cached envelopes kept per session.
    pub message_limit: usize,
}

impl Default for RegistryTtl {
    fn default() -> Self {
        Self {
            session: Duration::from_secs(24 * 60 * 60),
            connection: Duration::from_secs(2 * 60 * 60),
            message: Duration::from_secs(60 * 60),
            message_limit: 200,
        }
    }
}

pub(crate) fn expires_at(now: u64, ttl: Duration) -> u64 {
    now.saturating_add(ttl.as_millis() as u64)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    /// Empty while the CLI is detached.
    pub cli_connection_id: String,
    pub cli_public_key: String,
    pub web_connection_ids: BTreeSet<String>,
    pub status: SessionStatus,
    pub created_at: u64,
    pub last_active_at: u64,
    pub expires_at: u64,
    pub user_id: Option<String>,
    pub metadata: SessionMetadata,
}

impl SessionRecord {
    pub fn new(
        session_id: impl Into<String>,
        cli_connection_id: impl Into<String>,
        cli_public_key: impl Into<String>,
        user_id: Option<String>,
        ttl: Duration,
    ) -> Self {
        let now = now_millis();
        Self {
            session_id: session_id.into(),
            cli_connection_id: cli_connection_id.into(),
            cli_public_key: cli_public_key.into(),
            web_connection_ids: BTreeSet::new(),
            status: SessionStatus::Pending,
            created_at: now,
            last_active_at: now,
            expires_at: expires_at(now, ttl),
            user_id,
            metadata: SessionMetadata::default(),
        }
    }

    pub fn cli_attached(&self) -> bool {
        !self.cli_connection_id.is_empty()
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.user_id.as_deref() == Some(user_id)
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            status: self.status,
            created_at: self.created_at,
            last_active_at: self.last_active_at,
            cli_connected: self.cli_attached(),
            viewer_count: self.web_connection_ids.len(),
            metadata: self.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub connection_id: String,
    pub session_id: String,
    pub role: Role,
    pub public_key: Option<String>,
    pub connected_at: u64,
    /// Identity attached by the authorizer, `anonymous` otherwise.
    pub user_id: String,
    pub expires_at: u64,
}

impl ConnectionRecord {
    pub fn new(
        connection_id: impl Into<String>,
        session_id: impl Into<String>,
        role: Role,
        public_key: Option<String>,
        user_id: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        let now = now_millis();
        Self {
            connection_id: connection_id.into(),
            session_id: session_id.into(),
            role,
            public_key,
            connected_at: now,
            user_id: user_id.into(),
            expires_at: expires_at(now, ttl),
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// One relayed CLI -> Web envelope kept for late joiners. `encrypted_data` is
/// the serialized frame exactly as it was forwarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedMessage {
    pub session_id: String,
    pub seq: u64,
    pub encrypted_data: String,
    pub timestamp: u64,
    pub expires_at: u64,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session. Returns `false` without touching anything when
    /// the id is already taken.
    async fn create_session(&self, record: SessionRecord) -> Result<bool, StoreError>;

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError>;

    /// Point the session at a new CLI connection and reset it to `pending`.
    async fn attach_cli(
        &self,
        session_id: &str,
        connection_id: &str,
        public_key: &str,
    ) -> Result<Option<SessionRecord>, StoreError>;

    /// Detach the CLI and close the session, but only while `connection_id`
    /// is still the registered CLI. Returns `None` when nothing changed.
    async fn detach_cli(
        &self,
        session_id: &str,
        connection_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError>;

    /// Add a viewer and recompute the status in one step.
    async fn add_web_connection(
        &self,
        session_id: &str,
        connection_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError>;

    /// Remove a viewer; an emptied set pauses a session whose CLI is attached.
    async fn remove_web_connection(
        &self,
        session_id: &str,
        connection_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError>;

    async fn set_status(&self, session_id: &str, status: SessionStatus) -> Result<(), StoreError>;

    async fn update_metadata(
        &self,
        session_id: &str,
        update: &SessionMetadata,
    ) -> Result<Option<SessionRecord>, StoreError>;

    async fn sessions_for_user(&self, user_id: &str) -> Result<Vec<SessionRecord>, StoreError>;

    async fn delete_session(&self, session_id: &str) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn put_connection(&self, record: ConnectionRecord) -> Result<(), StoreError>;

    async fn get_connection(
        &self,
        connection_id: &str,
    ) -> Result<Option<ConnectionRecord>, StoreError>;

    async fn delete_connection(
        &self,
        connection_id: &str,
    ) -> Result<Option<ConnectionRecord>, StoreError>;

    async fn connections_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<ConnectionRecord>, StoreError>;

    /// Extend the connection's expiry after observed activity.
    async fn touch_connection(&self, connection_id: &str) -> Result<(), StoreError>;
}

#[async_trait]
pub trait MessageCache: Send + Sync {
    /// Append a frame to the session's bounded replay ring; returns its seq.
    async fn append_message(
        &self,
        session_id: &str,
        encrypted_data: String,
    ) -> Result<u64, StoreError>;

    /// Cached frames in append order, expired entries skipped.
    async fn recent_messages(&self, session_id: &str) -> Result<Vec<CachedMessage>, StoreError>;

    async fn clear_messages(&self, session_id: &str) -> Result<(), StoreError>;
}

/// Everything the router needs from storage.
pub trait Registry: SessionStore + ConnectionStore + MessageCache {}

impl<T> Registry for T where T: SessionStore + ConnectionStore + MessageCache {}
