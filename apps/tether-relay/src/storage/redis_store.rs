use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};

use tether_proto::{now_millis, SessionMetadata, SessionStatus};

use super::{
    expires_at, CachedMessage, ConnectionRecord, ConnectionStore, MessageCache, RegistryTtl,
    SessionRecord, SessionStore, StoreError,
};

const CREATE_SESSION: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('HSET', KEYS[1], unpack(ARGV, 3))
redis.call('EXPIRE', KEYS[1], ARGV[1])
if ARGV[2] ~= '' then
  redis.call('SADD', KEYS[2], ARGV[2])
  redis.call('EXPIRE', KEYS[2], ARGV[1])
end
return 1
"#;

const ATTACH_CLI: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
redis.call('HSET', KEYS[1], 'cli_connection_id', ARGV[1], 'cli_public_key', ARGV[2],
  'status', 'pending', 'last_active_at', ARGV[3], 'expires_at', ARGV[5])
redis.call('EXPIRE', KEYS[1], ARGV[4])
redis.call('EXPIRE', KEYS[2], ARGV[4])
return 1
"#;

const DETACH_CLI: &str = r#"
if redis.call('HGET', KEYS[1], 'cli_connection_id') ~= ARGV[1] then
  return 0
end
redis.call('HSET', KEYS[1], 'cli_connection_id', '', 'status', 'closed', 'last_active_at', ARGV[2])
return 1
"#;

const ADD_WEB: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
redis.call('SADD', KEYS[2], ARGV[1])
redis.call('EXPIRE', KEYS[2], ARGV[3])
local cli = redis.call('HGET', KEYS[1], 'cli_connection_id')
if cli and cli ~= '' then
  redis.call('HSET', KEYS[1], 'status', 'active')
else
  redis.call('HSET', KEYS[1], 'status', 'closed')
end
redis.call('HSET', KEYS[1], 'last_active_at', ARGV[2], 'expires_at', ARGV[4])
redis.call('EXPIRE', KEYS[1], ARGV[3])
return 1
"#;

const REMOVE_WEB: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
redis.call('SREM', KEYS[2], ARGV[1])
local cli = redis.call('HGET', KEYS[1], 'cli_connection_id')
if not cli or cli == '' then
  redis.call('HSET', KEYS[1], 'status', 'closed')
elseif redis.call('SCARD', KEYS[2]) == 0 then
  redis.call('HSET', KEYS[1], 'status', 'paused')
end
redis.call('HSET', KEYS[1], 'last_active_at', ARGV[2])
return 1
"#;

const SET_FIELD_IF_EXISTS: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
return 1
"#;

fn session_key(session_id: &str) -> String {
    format!("tether:session:{session_id}")
}

fn viewers_key(session_id: &str) -> String {
    format!("tether:session:{session_id}:web")
}

fn session_connections_key(session_id: &str) -> String {
    format!("tether:session:{session_id}:connections")
}

fn messages_key(session_id: &str) -> String {
    format!("tether:session:{session_id}:messages")
}

fn seq_key(session_id: &str) -> String {
    format!("tether:session:{session_id}:seq")
}

fn connection_key(connection_id: &str) -> String {
    format!("tether:connection:{connection_id}")
}

fn user_sessions_key(user_id: &str) -> String {
    format!("tether:user:{user_id}:sessions")
}

/// Registry shared by every relay process pointed at the same Redis.
///
/// Sessions are hashes with their viewer ids in a companion set; transitions
/// that read and write both run as Lua scripts so concurrent joins and leaves
/// cannot lose updates.
#[derive(Clone)]
pub struct RedisRegistry {
    redis: ConnectionManager,
    ttl: RegistryTtl,
}

impl RedisRegistry {
    pub async fn connect(redis_url: &str, ttl: RegistryTtl) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis, ttl })
    }

    fn session_ttl_secs(&self) -> u64 {
        self.ttl.session.as_secs().max(1)
    }

    async fn run_session_script(
        &self,
        script: &str,
        session_id: &str,
        args: &[String],
    ) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let script = Script::new(script);
        let mut invocation = script.prepare_invoke();
        invocation
            .key(session_key(session_id))
            .key(viewers_key(session_id));
        for arg in args {
            invocation.arg(arg);
        }
        let applied: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(applied == 1)
    }

    async fn transition(
        &self,
        script: &str,
        session_id: &str,
        args: &[String],
    ) -> Result<Option<SessionRecord>, StoreError> {
        if !self.run_session_script(script, session_id, args).await? {
            return Ok(None);
        }
        self.get_session(session_id).await
    }
}

fn parse_session(
    key: &str,
    mut fields: HashMap<String, String>,
    viewers: Vec<String>,
) -> Result<SessionRecord, StoreError> {
    let mut take = |name: &str| fields.remove(name).unwrap_or_default();
    let corrupt = |reason: String| StoreError::Corrupt {
        key: key.to_string(),
        reason,
    };
    let number = |name: &str, value: String| {
        value
            .parse::<u64>()
            .map_err(|err| corrupt(format!("{name}: {err}")))
    };

    let session_id = take("session_id");
    let cli_connection_id = take("cli_connection_id");
    let cli_public_key = take("cli_public_key");
    let status = SessionStatus::from_str(&take("status")).map_err(|err| corrupt(err.to_string()))?;
    let created_at = number("created_at", take("created_at"))?;
    let last_active_at = number("last_active_at", take("last_active_at"))?;
    let expires_at = number("expires_at", take("expires_at"))?;
    let user_id = Some(take("user_id")).filter(|user| !user.is_empty());
    let metadata = match take("metadata") {
        raw if raw.is_empty() => SessionMetadata::default(),
        raw => serde_json::from_str(&raw)?,
    };

    Ok(SessionRecord {
        session_id,
        cli_connection_id,
        cli_public_key,
        web_connection_ids: viewers.into_iter().collect(),
        status,
        created_at,
        last_active_at,
        expires_at,
        user_id,
        metadata,
    })
}

#[async_trait]
impl SessionStore for RedisRegistry {
    async fn create_session(&self, record: SessionRecord) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let owner = record.user_id.clone().unwrap_or_default();
        let owner_key = if owner.is_empty() {
            // Never touched; the script skips the index when ARGV[2] is empty.
            user_sessions_key("-")
        } else {
            user_sessions_key(&owner)
        };
        let index_member = if owner.is_empty() {
            String::new()
        } else {
            record.session_id.clone()
        };
        let metadata = serde_json::to_string(&record.metadata)?;

        let created: i64 = Script::new(CREATE_SESSION)
            .key(session_key(&record.session_id))
            .key(owner_key)
            .arg(self.session_ttl_secs())
            .arg(index_member)
            .arg("session_id")
            .arg(&record.session_id)
            .arg("cli_connection_id")
            .arg(&record.cli_connection_id)
            .arg("cli_public_key")
            .arg(&record.cli_public_key)
            .arg("status")
            .arg(record.status.as_str())
            .arg("created_at")
            .arg(record.created_at)
            .arg("last_active_at")
            .arg(record.last_active_at)
            .arg("expires_at")
            .arg(record.expires_at)
            .arg("user_id")
            .arg(owner)
            .arg("metadata")
            .arg(metadata)
            .invoke_async(&mut conn)
            .await?;
        Ok(created == 1)
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let mut conn = self.redis.clone();
        let key = session_key(session_id);
        let (fields, viewers): (HashMap<String, String>, Vec<String>) = redis::pipe()
            .hgetall(&key)
            .smembers(viewers_key(session_id))
            .query_async(&mut conn)
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }
        parse_session(&key, fields, viewers).map(Some)
    }

    async fn attach_cli(
        &self,
        session_id: &str,
        connection_id: &str,
        public_key: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let now = now_millis();
        let args = [
            connection_id.to_string(),
            public_key.to_string(),
            now.to_string(),
            self.session_ttl_secs().to_string(),
            expires_at(now, self.ttl.session).to_string(),
        ];
        self.transition(ATTACH_CLI, session_id, &args).await
    }

    async fn detach_cli(
        &self,
        session_id: &str,
        connection_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let args = [connection_id.to_string(), now_millis().to_string()];
        self.transition(DETACH_CLI, session_id, &args).await
    }

    async fn add_web_connection(
        &self,
        session_id: &str,
        connection_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let now = now_millis();
        let args = [
            connection_id.to_string(),
            now.to_string(),
            self.session_ttl_secs().to_string(),
            expires_at(now, self.ttl.session).to_string(),
        ];
        self.transition(ADD_WEB, session_id, &args).await
    }

    async fn remove_web_connection(
        &self,
        session_id: &str,
        connection_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let args = [connection_id.to_string(), now_millis().to_string()];
        self.transition(REMOVE_WEB, session_id, &args).await
    }

    async fn set_status(&self, session_id: &str, status: SessionStatus) -> Result<(), StoreError> {
        let args = ["status".to_string(), status.as_str().to_string()];
        self.run_session_script(SET_FIELD_IF_EXISTS, session_id, &args)
            .await?;
        Ok(())
    }

    async fn update_metadata(
        &self,
        session_id: &str,
        update: &SessionMetadata,
    ) -> Result<Option<SessionRecord>, StoreError> {
        // Only the owning CLI writes metadata, so read-merge-write is enough.
        let Some(mut session) = self.get_session(session_id).await? else {
            return Ok(None);
        };
        session.metadata.merge(update);
        let args = [
            "metadata".to_string(),
            serde_json::to_string(&session.metadata)?,
        ];
        if !self
            .run_session_script(SET_FIELD_IF_EXISTS, session_id, &args)
            .await?
        {
            return Ok(None);
        }
        Ok(Some(session))
    }

    async fn sessions_for_user(&self, user_id: &str) -> Result<Vec<SessionRecord>, StoreError> {
        let mut conn = self.redis.clone();
        let index = user_sessions_key(user_id);
        let ids: Vec<String> = conn.smembers(&index).await?;
        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_session(&id).await? {
                Some(session) if session.is_owned_by(user_id) => sessions.push(session),
                _ => {
                    conn.srem::<_, _, ()>(&index, &id).await?;
                }
            }
        }
        Ok(sessions)
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let owner: Option<String> = conn.hget(session_key(session_id), "user_id").await?;
        let mut pipe = redis::pipe();
        pipe.del(session_key(session_id))
            .del(viewers_key(session_id))
            .ignore()
            .del(session_connections_key(session_id))
            .ignore()
            .del(messages_key(session_id))
            .ignore()
            .del(seq_key(session_id))
            .ignore();
        if let Some(owner) = owner.filter(|owner| !owner.is_empty()) {
            pipe.srem(user_sessions_key(&owner), session_id).ignore();
        }
        let (removed,): (i64,) = pipe.query_async(&mut conn).await?;
        Ok(removed > 0)
    }
}

#[async_trait]
impl ConnectionStore for RedisRegistry {
    async fn put_connection(&self, record: ConnectionRecord) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let value = serde_json::to_string(&record)?;
        redis::pipe()
            .cmd("SETEX")
            .arg(connection_key(&record.connection_id))
            .arg(self.ttl.connection.as_secs().max(1))
            .arg(value)
            .ignore()
            .sadd(session_connections_key(&record.session_id), &record.connection_id)
            .ignore()
            .expire(
                session_connections_key(&record.session_id),
                self.session_ttl_secs() as i64,
            )
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_connection(
        &self,
        connection_id: &str,
    ) -> Result<Option<ConnectionRecord>, StoreError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(connection_key(connection_id)).await?;
        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn delete_connection(
        &self,
        connection_id: &str,
    ) -> Result<Option<ConnectionRecord>, StoreError> {
        let Some(record) = self.get_connection(connection_id).await? else {
            return Ok(None);
        };
        let mut conn = self.redis.clone();
        redis::pipe()
            .del(connection_key(connection_id))
            .ignore()
            .srem(session_connections_key(&record.session_id), connection_id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(Some(record))
    }

    async fn connections_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<ConnectionRecord>, StoreError> {
        let mut conn = self.redis.clone();
        let index = session_connections_key(session_id);
        let ids: Vec<String> = conn.smembers(&index).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids.iter().map(|id| connection_key(id)).collect();
        let values: Vec<Option<String>> =
            redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;

        let mut records = Vec::with_capacity(ids.len());
        for (id, value) in ids.iter().zip(values) {
            match value {
                Some(json) => records.push(serde_json::from_str(&json)?),
                None => {
                    conn.srem::<_, _, ()>(&index, id).await?;
                }
            }
        }
        Ok(records)
    }

    async fn touch_connection(&self, connection_id: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.expire::<_, ()>(
            connection_key(connection_id),
            self.ttl.connection.as_secs().max(1) as i64,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl MessageCache for RedisRegistry {
    async fn append_message(
        &self,
        session_id: &str,
        encrypted_data: String,
    ) -> Result<u64, StoreError> {
        let mut conn = self.redis.clone();
        let seq: u64 = conn.incr(seq_key(session_id), 1).await?;
        let now = now_millis();
        let message = CachedMessage {
            session_id: session_id.to_string(),
            seq,
            encrypted_data,
            timestamp: now,
            expires_at: expires_at(now, self.ttl.message),
        };
        let key = messages_key(session_id);
        let limit = self.ttl.message_limit.max(1) as isize;
        redis::pipe()
            .atomic()
            .rpush(&key, serde_json::to_string(&message)?)
            .ignore()
            .ltrim(&key, -limit, -1)
            .ignore()
            .expire(&key, self.ttl.message.as_secs().max(1) as i64)
            .ignore()
            .expire(seq_key(session_id), self.session_ttl_secs() as i64)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(seq)
    }

    async fn recent_messages(&self, session_id: &str) -> Result<Vec<CachedMessage>, StoreError> {
        let mut conn = self.redis.clone();
        let raw: Vec<String> = conn.lrange(messages_key(session_id), 0, -1).await?;
        let now = now_millis();
        let mut messages = Vec::with_capacity(raw.len());
        for entry in raw {
            let message: CachedMessage = serde_json::from_str(&entry)?;
            if message.expires_at > now {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    async fn clear_messages(&self, session_id: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(messages_key(session_id)).await?;
        Ok(())
    }
}
