//! Relay state machine.
//!
//! The router sees handshake fields and opaque envelopes only. Every inbound
//! frame is resolved against the registries, applied, and answered through
//! [`Push`]; failures become an `ERROR` frame for the sender and never leak
//! into other sessions.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use metrics::counter;
use thiserror::Error;
use tracing::{debug, info, warn};

use tether_proto::{
    is_valid_session_id, now_millis, ClientMessage, EncryptedEnvelope, ErrorCode, Role,
    ServerMessage, SessionMetadata, SessionStatus,
};

use crate::authorizer::Identity;
use crate::push::{Push, PushError};
use crate::storage::{ConnectionRecord, Registry, RegistryTtl, SessionRecord, StoreError};

const PUBLIC_KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Session {0} not found")]
    SessionNotFound(String),
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("{0}")]
    InvalidMessage(String),
    #[error("{0}")]
    ConnectionFailed(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl RelayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RelayError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            RelayError::InvalidPublicKey(_) => ErrorCode::InvalidPublicKey,
            RelayError::InvalidMessage(_) => ErrorCode::InvalidMessage,
            RelayError::ConnectionFailed(_) | RelayError::Storage(_) => {
                ErrorCode::ConnectionFailed
            }
            RelayError::Unauthorized(_) => ErrorCode::Unauthorized,
        }
    }
}

fn validate_public_key(public_key: &str) -> Result<(), RelayError> {
    let decoded = STANDARD
        .decode(public_key.trim())
        .map_err(|err| RelayError::InvalidPublicKey(err.to_string()))?;
    if decoded.len() != PUBLIC_KEY_LEN {
        return Err(RelayError::InvalidPublicKey(format!(
            "expected {PUBLIC_KEY_LEN} bytes, got {}",
            decoded.len()
        )));
    }
    Ok(())
}

fn encode(message: &ServerMessage) -> Option<String> {
    match serde_json::to_string(message) {
        Ok(frame) => Some(frame),
        Err(err) => {
            warn!(error = %err, "failed to serialize server message");
            None
        }
    }
}

pub struct RelayRouter {
    registry: Arc<dyn Registry>,
    push: Arc<dyn Push>,
    ws_endpoint: String,
    ttl: RegistryTtl,
}

impl RelayRouter {
    pub fn new(
        registry: Arc<dyn Registry>,
        push: Arc<dyn Push>,
        ws_endpoint: impl Into<String>,
        ttl: RegistryTtl,
    ) -> Self {
        Self {
            registry,
            push,
            ws_endpoint: ws_endpoint.into(),
            ttl,
        }
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    /// Parse and apply one inbound text frame, answering errors in-band.
    pub async fn dispatch(&self, connection_id: &str, identity: &Identity, frame: &str) {
        let message = match serde_json::from_str::<ClientMessage>(frame) {
            Ok(message) => message,
            Err(err) => {
                debug!(connection = %connection_id, error = %err, "unparseable frame");
                counter!(
                    "tether_relay_protocol_errors_total",
                    1,
                    "code" => ErrorCode::InvalidMessage.as_str()
                );
                self.send(
                    connection_id,
                    &ServerMessage::error(
                        ErrorCode::InvalidMessage,
                        format!("Invalid message format: {err}"),
                    ),
                )
                .await;
                return;
            }
        };

        let kind = message.kind();
        if let Err(err) = self.handle(connection_id, identity, message).await {
            let code = err.code();
            match &err {
                RelayError::Storage(_) => {
                    warn!(connection = %connection_id, kind, error = %err, "registry failure")
                }
                _ => debug!(connection = %connection_id, kind, error = %err, "request rejected"),
            }
            counter!("tether_relay_protocol_errors_total", 1, "code" => code.as_str());
            self.send(connection_id, &ServerMessage::error(code, err.to_string()))
                .await;
        }
    }

    pub async fn handle(
        &self,
        connection_id: &str,
        identity: &Identity,
        message: ClientMessage,
    ) -> Result<(), RelayError> {
        match message {
            ClientMessage::SessionCreate {
                session_id,
                public_key,
            } => {
                self.create_session(connection_id, identity, session_id, public_key)
                    .await
            }
            ClientMessage::SessionReconnect {
                session_id,
                public_key,
            } => {
                self.reconnect_session(connection_id, identity, session_id, public_key)
                    .await
            }
            ClientMessage::SessionJoin {
                session_id,
                public_key,
            } => {
                self.join_session(connection_id, identity, session_id, public_key)
                    .await
            }
            ClientMessage::Encrypted(envelope) => {
                self.relay_envelope(connection_id, envelope).await
            }
            ClientMessage::StateRequest { session_id } => {
                self.replay_cache(connection_id, session_id.as_deref()).await
            }
            ClientMessage::Ping { .. } => {
                if let Err(err) = self.registry.touch_connection(connection_id).await {
                    debug!(connection = %connection_id, error = %err, "touch failed");
                }
                self.send(
                    connection_id,
                    &ServerMessage::Pong {
                        timestamp: now_millis(),
                    },
                )
                .await;
                Ok(())
            }
            ClientMessage::SessionListRequest { include_inactive } => {
                self.list_sessions(connection_id, identity, include_inactive)
                    .await
            }
            ClientMessage::SessionInfoRequest { session_id } => {
                self.session_info(connection_id, identity, session_id).await
            }
            ClientMessage::SessionUpdate(metadata) => {
                self.update_session(connection_id, identity, metadata).await
            }
            ClientMessage::SessionDeleteRequest { session_id } => {
                self.delete_session(connection_id, identity, session_id)
                    .await
            }
        }
    }

    async fn create_session(
        &self,
        connection_id: &str,
        identity: &Identity,
        session_id: String,
        public_key: String,
    ) -> Result<(), RelayError> {
        if !is_valid_session_id(&session_id) {
            return Err(RelayError::InvalidMessage(format!(
                "Invalid session id {session_id}"
            )));
        }
        validate_public_key(&public_key)?;

        let record = SessionRecord::new(
            &session_id,
            connection_id,
            &public_key,
            identity.owner(),
            self.ttl.session,
        );
        if !self.registry.create_session(record).await? {
            return Err(RelayError::InvalidMessage(format!(
                "Session {session_id} already exists"
            )));
        }
        self.registry
            .put_connection(ConnectionRecord::new(
                connection_id,
                &session_id,
                Role::Cli,
                Some(public_key),
                &identity.user_id,
                self.ttl.connection,
            ))
            .await?;

        counter!("tether_relay_sessions_created_total", 1);
        info!(session = %session_id, connection = %connection_id, "session created");
        self.send(
            connection_id,
            &ServerMessage::SessionCreated {
                session_id,
                ws_endpoint: self.ws_endpoint.clone(),
            },
        )
        .await;
        Ok(())
    }

    async fn reconnect_session(
        &self,
        connection_id: &str,
        identity: &Identity,
        session_id: String,
        public_key: String,
    ) -> Result<(), RelayError> {
        validate_public_key(&public_key)?;
        let session = self
            .registry
            .get_session(&session_id)
            .await?
            .ok_or_else(|| RelayError::SessionNotFound(session_id.clone()))?;
        if let Some(owner) = &session.user_id {
            if owner != &identity.user_id {
                return Err(RelayError::Unauthorized(
                    "Session belongs to another user".to_string(),
                ));
            }
        }

        if session.cli_attached() && session.cli_connection_id != connection_id {
            // Superseded CLI socket; its record would otherwise linger until ttl.
            self.registry
                .delete_connection(&session.cli_connection_id)
                .await?;
        }
        if session.cli_public_key != public_key {
            // Cached output was sealed under the previous key pair.
            if let Err(err) = self.registry.clear_messages(&session_id).await {
                warn!(session = %session_id, error = %err, "failed to clear message cache");
            }
        }

        let session = self
            .registry
            .attach_cli(&session_id, connection_id, &public_key)
            .await?
            .ok_or_else(|| RelayError::SessionNotFound(session_id.clone()))?;
        self.registry
            .put_connection(ConnectionRecord::new(
                connection_id,
                &session_id,
                Role::Cli,
                Some(public_key.clone()),
                &identity.user_id,
                self.ttl.connection,
            ))
            .await?;

        info!(
            session = %session_id,
            connection = %connection_id,
            viewers = session.web_connection_ids.len(),
            "cli reconnected"
        );
        self.send(
            connection_id,
            &ServerMessage::SessionReconnected {
                session_id: session_id.clone(),
                ws_endpoint: self.ws_endpoint.clone(),
            },
        )
        .await;

        let delivered = self
            .notify_viewers(
                &session,
                &ServerMessage::CliReconnected {
                    cli_public_key: public_key,
                },
            )
            .await;
        if delivered > 0 {
            self.registry
                .set_status(&session_id, SessionStatus::Active)
                .await?;
        }
        Ok(())
    }

    async fn join_session(
        &self,
        connection_id: &str,
        identity: &Identity,
        session_id: String,
        public_key: String,
    ) -> Result<(), RelayError> {
        validate_public_key(&public_key)?;
        let session = self
            .registry
            .get_session(&session_id)
            .await?
            .ok_or_else(|| RelayError::SessionNotFound(session_id.clone()))?;

        self.registry
            .put_connection(ConnectionRecord::new(
                connection_id,
                &session_id,
                Role::Web,
                Some(public_key.clone()),
                &identity.user_id,
                self.ttl.connection,
            ))
            .await?;
        let session = self
            .registry
            .add_web_connection(&session_id, connection_id)
            .await?
            .unwrap_or(session);

        if !session.cli_attached() {
            info!(session = %session_id, connection = %connection_id, "viewer waiting for cli");
            self.send(
                connection_id,
                &ServerMessage::SessionJoined {
                    session_id,
                    cli_public_key: session.cli_public_key,
                    cli_disconnected: true,
                },
            )
            .await;
            self.send(connection_id, &ServerMessage::CliDisconnected)
                .await;
            return Ok(());
        }

        let cli_reached = self
            .send(
                &session.cli_connection_id,
                &ServerMessage::WebConnected {
                    public_key,
                    connection_id: connection_id.to_string(),
                },
            )
            .await;
        if !cli_reached {
            warn!(
                session = %session_id,
                cli = %session.cli_connection_id,
                "cli unreachable on join"
            );
            self.registry
                .detach_cli(&session_id, &session.cli_connection_id)
                .await?;
            self.send(connection_id, &ServerMessage::CliDisconnected)
                .await;
            return Err(RelayError::ConnectionFailed(
                "CLI connection is not reachable".to_string(),
            ));
        }

        info!(session = %session_id, connection = %connection_id, "viewer joined");
        self.send(
            connection_id,
            &ServerMessage::SessionJoined {
                session_id,
                cli_public_key: session.cli_public_key,
                cli_disconnected: false,
            },
        )
        .await;
        Ok(())
    }

    async fn relay_envelope(
        &self,
        connection_id: &str,
        envelope: EncryptedEnvelope,
    ) -> Result<(), RelayError> {
        let sender = self
            .registry
            .get_connection(connection_id)
            .await?
            .ok_or_else(|| RelayError::ConnectionFailed("Unknown connection".to_string()))?;
        if envelope.session_id != sender.session_id {
            return Err(RelayError::InvalidMessage(
                "Envelope session does not match connection".to_string(),
            ));
        }
        let session = self
            .registry
            .get_session(&sender.session_id)
            .await?
            .ok_or_else(|| RelayError::SessionNotFound(sender.session_id.clone()))?;

        let message = ServerMessage::Encrypted(envelope);
        match sender.role {
            Role::Cli => {
                if session.cli_connection_id != connection_id {
                    return Err(RelayError::ConnectionFailed(
                        "CLI connection has been superseded".to_string(),
                    ));
                }
                let Some(frame) = encode(&message) else {
                    return Ok(());
                };
                let delivered = self.fan_out(&session, &frame).await;
                counter!(
                    "tether_relay_envelopes_forwarded_total",
                    delivered as u64,
                    "direction" => "cli_to_web"
                );
                match self
                    .registry
                    .append_message(&session.session_id, frame)
                    .await
                {
                    Ok(seq) => debug!(session = %session.session_id, seq, "envelope cached"),
                    Err(err) => {
                        counter!("tether_relay_cache_write_failures_total", 1);
                        warn!(
                            session = %session.session_id,
                            error = %err,
                            "message cache write failed"
                        );
                    }
                }
                Ok(())
            }
            Role::Web => {
                if !session.cli_attached() {
                    return Err(RelayError::ConnectionFailed(
                        "CLI is not connected".to_string(),
                    ));
                }
                if !self.send(&session.cli_connection_id, &message).await {
                    return Err(RelayError::ConnectionFailed(
                        "CLI connection is not reachable".to_string(),
                    ));
                }
                counter!(
                    "tether_relay_envelopes_forwarded_total",
                    1,
                    "direction" => "web_to_cli"
                );
                Ok(())
            }
        }
    }

    async fn replay_cache(
        &self,
        connection_id: &str,
        requested: Option<&str>,
    ) -> Result<(), RelayError> {
        let connection = self
            .registry
            .get_connection(connection_id)
            .await?
            .ok_or_else(|| RelayError::ConnectionFailed("Unknown connection".to_string()))?;
        if requested.is_some_and(|session_id| session_id != connection.session_id) {
            return Err(RelayError::InvalidMessage(
                "State request for a foreign session".to_string(),
            ));
        }

        let cached = match self
            .registry
            .recent_messages(&connection.session_id)
            .await
        {
            Ok(cached) => cached,
            Err(err) => {
                warn!(session = %connection.session_id, error = %err, "message cache read failed");
                return Ok(());
            }
        };
        debug!(
            session = %connection.session_id,
            connection = %connection_id,
            count = cached.len(),
            "replaying cached output"
        );
        for message in cached {
            if !self.deliver(connection_id, message.encrypted_data).await {
                break;
            }
        }
        Ok(())
    }

    /// Transport-level close of `connection_id`.
    pub async fn disconnect(&self, connection_id: &str) {
        if let Err(err) = self.try_disconnect(connection_id).await {
            warn!(connection = %connection_id, error = %err, "disconnect cleanup failed");
        }
    }

    async fn try_disconnect(&self, connection_id: &str) -> Result<(), RelayError> {
        let Some(connection) = self.registry.delete_connection(connection_id).await? else {
            return Ok(());
        };
        match connection.role {
            Role::Cli => {
                let Some(session) = self
                    .registry
                    .detach_cli(&connection.session_id, connection_id)
                    .await?
                else {
                    debug!(connection = %connection_id, "superseded cli closed");
                    return Ok(());
                };
                info!(session = %session.session_id, "cli disconnected");
                self.notify_viewers(&session, &ServerMessage::CliDisconnected)
                    .await;
            }
            Role::Web => {
                let Some(session) = self
                    .registry
                    .remove_web_connection(&connection.session_id, connection_id)
                    .await?
                else {
                    return Ok(());
                };
                info!(
                    session = %session.session_id,
                    connection = %connection_id,
                    status = %session.status,
                    "viewer left"
                );
                if session.cli_attached() {
                    self.send(
                        &session.cli_connection_id,
                        &ServerMessage::WebDisconnected {
                            connection_id: connection_id.to_string(),
                        },
                    )
                    .await;
                }
            }
        }
        Ok(())
    }

    fn require_authenticated(identity: &Identity) -> Result<(), RelayError> {
        if identity.is_authenticated {
            Ok(())
        } else {
            Err(RelayError::Unauthorized("Authentication required".to_string()))
        }
    }

    async fn list_sessions(
        &self,
        connection_id: &str,
        identity: &Identity,
        include_inactive: bool,
    ) -> Result<(), RelayError> {
        Self::require_authenticated(identity)?;
        let mut sessions: Vec<_> = self
            .registry
            .sessions_for_user(&identity.user_id)
            .await?
            .into_iter()
            .filter(|session| include_inactive || session.status != SessionStatus::Closed)
            .map(|session| session.summary())
            .collect();
        sessions.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
        self.send(connection_id, &ServerMessage::SessionListResponse { sessions })
            .await;
        Ok(())
    }

    async fn session_info(
        &self,
        connection_id: &str,
        identity: &Identity,
        session_id: String,
    ) -> Result<(), RelayError> {
        Self::require_authenticated(identity)?;
        let session = self
            .registry
            .get_session(&session_id)
            .await?
            .filter(|session| session.is_owned_by(&identity.user_id))
            .map(|session| session.summary());
        self.send(connection_id, &ServerMessage::SessionInfoResponse { session })
            .await;
        Ok(())
    }

    async fn update_session(
        &self,
        connection_id: &str,
        identity: &Identity,
        metadata: SessionMetadata,
    ) -> Result<(), RelayError> {
        Self::require_authenticated(identity)?;
        let connection = self
            .registry
            .get_connection(connection_id)
            .await?
            .filter(|connection| connection.role == Role::Cli)
            .ok_or_else(|| {
                RelayError::Unauthorized("Only the session's CLI may update it".to_string())
            })?;
        let session = self
            .registry
            .get_session(&connection.session_id)
            .await?
            .ok_or_else(|| RelayError::SessionNotFound(connection.session_id.clone()))?;
        if session.cli_connection_id != connection_id {
            return Err(RelayError::Unauthorized(
                "Only the session's CLI may update it".to_string(),
            ));
        }
        self.registry
            .update_metadata(&session.session_id, &metadata)
            .await?;
        debug!(session = %session.session_id, "session metadata updated");
        Ok(())
    }

    async fn delete_session(
        &self,
        connection_id: &str,
        identity: &Identity,
        session_id: String,
    ) -> Result<(), RelayError> {
        Self::require_authenticated(identity)?;
        let Some(session) = self.registry.get_session(&session_id).await? else {
            self.send(
                connection_id,
                &ServerMessage::SessionDeleteResponse {
                    session_id,
                    success: false,
                    message: Some("Session not found".to_string()),
                },
            )
            .await;
            return Ok(());
        };
        if !session.is_owned_by(&identity.user_id) {
            return Err(RelayError::Unauthorized(
                "Session belongs to another user".to_string(),
            ));
        }

        for connection in self.registry.connections_for_session(&session_id).await? {
            self.registry
                .delete_connection(&connection.connection_id)
                .await?;
        }
        let removed = self.registry.delete_session(&session_id).await?;
        info!(session = %session_id, removed, "session deleted");
        self.send(
            connection_id,
            &ServerMessage::SessionDeleteResponse {
                session_id,
                success: removed,
                message: None,
            },
        )
        .await;
        Ok(())
    }

    /// Push a frame; a gone target loses its connection record.
    async fn deliver(&self, connection_id: &str, frame: String) -> bool {
        match self.push.push(connection_id, frame).await {
            Ok(()) => true,
            Err(PushError::Gone(_)) => {
                counter!("tether_relay_stale_connections_total", 1);
                debug!(connection = %connection_id, "reaping stale connection");
                if let Err(err) = self.registry.delete_connection(connection_id).await {
                    warn!(connection = %connection_id, error = %err, "failed to reap connection");
                }
                false
            }
            Err(err) => {
                counter!("tether_relay_push_failures_total", 1);
                warn!(connection = %connection_id, error = %err, "push failed");
                false
            }
        }
    }

    async fn send(&self, connection_id: &str, message: &ServerMessage) -> bool {
        match encode(message) {
            Some(frame) => self.deliver(connection_id, frame).await,
            None => false,
        }
    }

    /// Best-effort delivery to every viewer; unreachable ones leave the set.
    async fn fan_out(&self, session: &SessionRecord, frame: &str) -> usize {
        let mut delivered = 0;
        for web in &session.web_connection_ids {
            if self.deliver(web, frame.to_string()).await {
                delivered += 1;
                continue;
            }
            if let Err(err) = self
                .registry
                .remove_web_connection(&session.session_id, web)
                .await
            {
                warn!(
                    session = %session.session_id,
                    connection = %web,
                    error = %err,
                    "failed to drop viewer"
                );
            }
        }
        delivered
    }

    async fn notify_viewers(&self, session: &SessionRecord, message: &ServerMessage) -> usize {
        match encode(message) {
            Some(frame) => self.fan_out(session, &frame).await,
            None => 0,
        }
    }
}
