use std::collections::VecDeque;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use tether_proto::{now_millis, SessionMetadata, SessionStatus};

use super::{
    expires_at, CachedMessage, ConnectionRecord, ConnectionStore, MessageCache, RegistryTtl,
    SessionRecord, SessionStore, StoreError,
};

#[derive(Debug, Default)]
struct MessageRing {
    next_seq: u64,
    entries: VecDeque<CachedMessage>,
}

/// Single-process registry. Expired records are dropped lazily when touched.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    sessions: DashMap<String, SessionRecord>,
    connections: DashMap<String, ConnectionRecord>,
    messages: DashMap<String, MessageRing>,
    ttl: RegistryTtl,
}

impl MemoryRegistry {
    pub fn new(ttl: RegistryTtl) -> Self {
        Self {
            ttl,
            ..Self::default()
        }
    }

    /// Run `f` against a live session while holding its shard lock.
    fn with_session<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut SessionRecord) -> T,
    ) -> Option<T> {
        let now = now_millis();
        let expired = match self.sessions.get_mut(session_id) {
            Some(mut entry) if !entry.is_expired(now) => return Some(f(entry.value_mut())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.sessions
                .remove_if(session_id, |_, session| session.is_expired(now));
        }
        None
    }

    fn refresh(&self, session: &mut SessionRecord) {
        let now = now_millis();
        session.last_active_at = now;
        session.expires_at = expires_at(now, self.ttl.session);
    }
}

#[async_trait]
impl SessionStore for MemoryRegistry {
    async fn create_session(&self, record: SessionRecord) -> Result<bool, StoreError> {
        let now = now_millis();
        match self.sessions.entry(record.session_id.clone()) {
            Entry::Occupied(entry) if !entry.get().is_expired(now) => Ok(false),
            Entry::Occupied(mut entry) => {
                entry.insert(record);
                Ok(true)
            }
            Entry::Vacant(entry) => {
                entry.insert(record);
                Ok(true)
            }
        }
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.with_session(session_id, |session| session.clone()))
    }

    async fn attach_cli(
        &self,
        session_id: &str,
        connection_id: &str,
        public_key: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.with_session(session_id, |session| {
            session.cli_connection_id = connection_id.to_string();
            session.cli_public_key = public_key.to_string();
            session.status = SessionStatus::Pending;
            self.refresh(session);
            session.clone()
        }))
    }

    async fn detach_cli(
        &self,
        session_id: &str,
        connection_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self
            .with_session(session_id, |session| {
                if session.cli_connection_id != connection_id {
                    return None;
                }
                session.cli_connection_id.clear();
                session.status = SessionStatus::Closed;
                session.last_active_at = now_millis();
                Some(session.clone())
            })
            .flatten())
    }

    async fn add_web_connection(
        &self,
        session_id: &str,
        connection_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.with_session(session_id, |session| {
            session.web_connection_ids.insert(connection_id.to_string());
            session.status = SessionStatus::derive(
                session.cli_attached(),
                session.web_connection_ids.len(),
                session.status,
            );
            self.refresh(session);
            session.clone()
        }))
    }

    async fn remove_web_connection(
        &self,
        session_id: &str,
        connection_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.with_session(session_id, |session| {
            session.web_connection_ids.remove(connection_id);
            if !session.cli_attached() {
                session.status = SessionStatus::Closed;
            } else if session.web_connection_ids.is_empty() {
                session.status = SessionStatus::Paused;
            }
            session.last_active_at = now_millis();
            session.clone()
        }))
    }

    async fn set_status(&self, session_id: &str, status: SessionStatus) -> Result<(), StoreError> {
        self.with_session(session_id, |session| session.status = status);
        Ok(())
    }

    async fn update_metadata(
        &self,
        session_id: &str,
        update: &SessionMetadata,
    ) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.with_session(session_id, |session| {
            session.metadata.merge(update);
            self.refresh(session);
            session.clone()
        }))
    }

    async fn sessions_for_user(&self, user_id: &str) -> Result<Vec<SessionRecord>, StoreError> {
        let now = now_millis();
        Ok(self
            .sessions
            .iter()
            .filter(|entry| !entry.is_expired(now) && entry.is_owned_by(user_id))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool, StoreError> {
        self.messages.remove(session_id);
        Ok(self.sessions.remove(session_id).is_some())
    }
}

#[async_trait]
impl ConnectionStore for MemoryRegistry {
    async fn put_connection(&self, record: ConnectionRecord) -> Result<(), StoreError> {
        self.connections
            .insert(record.connection_id.clone(), record);
        Ok(())
    }

    async fn get_connection(
        &self,
        connection_id: &str,
    ) -> Result<Option<ConnectionRecord>, StoreError> {
        let now = now_millis();
        let found = self
            .connections
            .get(connection_id)
            .map(|entry| entry.value().clone());
        match found {
            Some(record) if record.is_expired(now) => {
                self.connections
                    .remove_if(connection_id, |_, record| record.is_expired(now));
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn delete_connection(
        &self,
        connection_id: &str,
    ) -> Result<Option<ConnectionRecord>, StoreError> {
        Ok(self.connections.remove(connection_id).map(|(_, record)| record))
    }

    async fn connections_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<ConnectionRecord>, StoreError> {
        let now = now_millis();
        Ok(self
            .connections
            .iter()
            .filter(|entry| entry.session_id == session_id && !entry.is_expired(now))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn touch_connection(&self, connection_id: &str) -> Result<(), StoreError> {
        if let Some(mut entry) = self.connections.get_mut(connection_id) {
            entry.expires_at = expires_at(now_millis(), self.ttl.connection);
        }
        Ok(())
    }
}

#[async_trait]
impl MessageCache for MemoryRegistry {
    async fn append_message(
        &self,
        session_id: &str,
        encrypted_data: String,
    ) -> Result<u64, StoreError> {
        let now = now_millis();
        let mut ring = self.messages.entry(session_id.to_string()).or_default();
        ring.next_seq += 1;
        let seq = ring.next_seq;
        ring.entries.push_back(CachedMessage {
            session_id: session_id.to_string(),
            seq,
            encrypted_data,
            timestamp: now,
            expires_at: expires_at(now, self.ttl.message),
        });
        while ring.entries.len() > self.ttl.message_limit {
            ring.entries.pop_front();
        }
        Ok(seq)
    }

    async fn recent_messages(&self, session_id: &str) -> Result<Vec<CachedMessage>, StoreError> {
        let now = now_millis();
        let Some(mut ring) = self.messages.get_mut(session_id) else {
            return Ok(Vec::new());
        };
        ring.entries.retain(|message| message.expires_at > now);
        Ok(ring.entries.iter().cloned().collect())
    }

    async fn clear_messages(&self, session_id: &str) -> Result<(), StoreError> {
        if let Some(mut ring) = self.messages.get_mut(session_id) {
            ring.entries.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tether_proto::Role;

    fn registry() -> MemoryRegistry {
        MemoryRegistry::new(RegistryTtl::default())
    }

    fn session(id: &str) -> SessionRecord {
        SessionRecord::new(id, "cli-1", "cli-key", None, Duration::from_secs(60))
    }

    #[test_timeout::tokio_timeout_test]
    async fn create_refuses_live_duplicates() {
        let registry = registry();
        assert!(registry.create_session(session("AB12CD")).await.unwrap());
        assert!(!registry.create_session(session("AB12CD")).await.unwrap());
    }

    #[test_timeout::tokio_timeout_test]
    async fn expired_sessions_disappear_and_can_be_recreated() {
        let registry = registry();
        let mut stale = session("AB12CD");
        stale.expires_at = now_millis() - 1;
        assert!(registry.create_session(stale).await.unwrap());
        assert!(registry.get_session("AB12CD").await.unwrap().is_none());
        assert!(registry.create_session(session("AB12CD")).await.unwrap());
    }

    #[test_timeout::tokio_timeout_test]
    async fn viewer_membership_drives_status() {
        let registry = registry();
        registry.create_session(session("AB12CD")).await.unwrap();

        let joined = registry
            .add_web_connection("AB12CD", "web-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(joined.status, SessionStatus::Active);

        let left = registry
            .remove_web_connection("AB12CD", "web-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(left.status, SessionStatus::Paused);
        assert!(left.web_connection_ids.is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn detach_ignores_superseded_cli() {
        let registry = registry();
        registry.create_session(session("AB12CD")).await.unwrap();
        registry
            .attach_cli("AB12CD", "cli-2", "new-key")
            .await
            .unwrap();

        assert!(registry.detach_cli("AB12CD", "cli-1").await.unwrap().is_none());
        let closed = registry.detach_cli("AB12CD", "cli-2").await.unwrap().unwrap();
        assert_eq!(closed.status, SessionStatus::Closed);
        assert!(!closed.cli_attached());
    }

    #[test_timeout::tokio_timeout_test]
    async fn viewers_joining_a_detached_session_keep_it_closed() {
        let registry = registry();
        registry.create_session(session("AB12CD")).await.unwrap();
        registry.detach_cli("AB12CD", "cli-1").await.unwrap();

        let joined = registry
            .add_web_connection("AB12CD", "web-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(joined.status, SessionStatus::Closed);
        assert_eq!(joined.summary().viewer_count, 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn message_ring_is_bounded_and_sequenced() {
        let registry = MemoryRegistry::new(RegistryTtl {
            message_limit: 3,
            ..RegistryTtl::default()
        });
        for n in 0..5 {
            registry
                .append_message("AB12CD", format!("frame-{n}"))
                .await
                .unwrap();
        }
        let cached = registry.recent_messages("AB12CD").await.unwrap();
        let seqs: Vec<u64> = cached.iter().map(|message| message.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        assert_eq!(cached[0].encrypted_data, "frame-2");

        registry.clear_messages("AB12CD").await.unwrap();
        assert!(registry.recent_messages("AB12CD").await.unwrap().is_empty());
        assert_eq!(
            registry.append_message("AB12CD", "next".into()).await.unwrap(),
            6
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn connections_are_indexed_by_session() {
        let registry = registry();
        for (id, role) in [("cli-1", Role::Cli), ("web-1", Role::Web)] {
            registry
                .put_connection(ConnectionRecord::new(
                    id,
                    "AB12CD",
                    role,
                    None,
                    "anonymous",
                    Duration::from_secs(60),
                ))
                .await
                .unwrap();
        }
        registry
            .put_connection(ConnectionRecord::new(
                "web-9",
                "ZZ99ZZ",
                Role::Web,
                None,
                "anonymous",
                Duration::from_secs(60),
            ))
            .await
            .unwrap();

        let mut ids: Vec<String> = registry
            .connections_for_session("AB12CD")
            .await
            .unwrap()
            .into_iter()
            .map(|record| record.connection_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["cli-1", "web-1"]);

        let removed = registry.delete_connection("web-1").await.unwrap();
        assert_eq!(removed.map(|record| record.role), Some(Role::Web));
        assert!(registry.get_connection("web-1").await.unwrap().is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn sessions_are_listed_per_owner() {
        let registry = registry();
        let mut owned = session("AB12CD");
        owned.user_id = Some("user-1".into());
        registry.create_session(owned).await.unwrap();
        registry.create_session(session("ZZ99ZZ")).await.unwrap();

        let listed = registry.sessions_for_user("user-1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].session_id, "AB12CD");
    }
}
