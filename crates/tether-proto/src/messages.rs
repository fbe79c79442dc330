use serde::{Deserialize, Serialize};

use crate::envelope::EncryptedEnvelope;
use crate::error::ErrorCode;
use crate::session::{SessionMetadata, SessionSummary};

/// Messages sent from an endpoint (CLI or Web) to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Register a brand new session; CLI only.
    #[serde(rename = "SESSION_CREATE", rename_all = "camelCase")]
    SessionCreate {
        session_id: String,
        public_key: String,
    },
    /// Re-attach a CLI to an existing session after a transport drop.
    #[serde(rename = "SESSION_RECONNECT", rename_all = "camelCase")]
    SessionReconnect {
        session_id: String,
        public_key: String,
    },
    /// Attach a viewer to a session.
    #[serde(rename = "SESSION_JOIN", rename_all = "camelCase")]
    SessionJoin {
        session_id: String,
        public_key: String,
    },
    /// Opaque application data for the peer role.
    #[serde(rename = "ENCRYPTED")]
    Encrypted(EncryptedEnvelope),
    /// Ask the relay to replay its cached CLI output.
    #[serde(rename = "STATE_REQUEST", rename_all = "camelCase")]
    StateRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    #[serde(rename = "PING")]
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
    #[serde(rename = "SESSION_LIST_REQUEST", rename_all = "camelCase")]
    SessionListRequest {
        #[serde(default)]
        include_inactive: bool,
    },
    #[serde(rename = "SESSION_INFO_REQUEST", rename_all = "camelCase")]
    SessionInfoRequest { session_id: String },
    /// Replace descriptive metadata; only honoured from the session's CLI.
    #[serde(rename = "SESSION_UPDATE")]
    SessionUpdate(SessionMetadata),
    #[serde(rename = "SESSION_DELETE_REQUEST", rename_all = "camelCase")]
    SessionDeleteRequest { session_id: String },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::SessionCreate { .. } => "SESSION_CREATE",
            ClientMessage::SessionReconnect { .. } => "SESSION_RECONNECT",
            ClientMessage::SessionJoin { .. } => "SESSION_JOIN",
            ClientMessage::Encrypted(_) => "ENCRYPTED",
            ClientMessage::StateRequest { .. } => "STATE_REQUEST",
            ClientMessage::Ping { .. } => "PING",
            ClientMessage::SessionListRequest { .. } => "SESSION_LIST_REQUEST",
            ClientMessage::SessionInfoRequest { .. } => "SESSION_INFO_REQUEST",
            ClientMessage::SessionUpdate(_) => "SESSION_UPDATE",
            ClientMessage::SessionDeleteRequest { .. } => "SESSION_DELETE_REQUEST",
        }
    }
}

/// Messages sent from the relay to an endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "SESSION_CREATED", rename_all = "camelCase")]
    SessionCreated {
        session_id: String,
        ws_endpoint: String,
    },
    #[serde(rename = "SESSION_RECONNECTED", rename_all = "camelCase")]
    SessionReconnected {
        session_id: String,
        ws_endpoint: String,
    },
    /// Join acknowledgement. `cli_disconnected` tells the viewer to wait for
    /// `cli:reconnected` instead of starting the key exchange.
    #[serde(rename = "SESSION_JOINED", rename_all = "camelCase")]
    SessionJoined {
        session_id: String,
        cli_public_key: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        cli_disconnected: bool,
    },
    #[serde(rename = "PONG")]
    Pong { timestamp: u64 },
    #[serde(rename = "ERROR")]
    Error { code: ErrorCode, message: String },
    /// A viewer attached; sent to the CLI.
    #[serde(rename = "web:connected", rename_all = "camelCase")]
    WebConnected {
        public_key: String,
        connection_id: String,
    },
    /// A viewer detached; sent to the CLI.
    #[serde(rename = "web:disconnected", rename_all = "camelCase")]
    WebDisconnected { connection_id: String },
    #[serde(rename = "cli:disconnected")]
    CliDisconnected,
    /// The CLI re-registered, possibly with a fresh key pair.
    #[serde(rename = "cli:reconnected", rename_all = "camelCase")]
    CliReconnected { cli_public_key: String },
    #[serde(rename = "ENCRYPTED")]
    Encrypted(EncryptedEnvelope),
    #[serde(rename = "SESSION_LIST_RESPONSE")]
    SessionListResponse { sessions: Vec<SessionSummary> },
    #[serde(rename = "SESSION_INFO_RESPONSE")]
    SessionInfoResponse { session: Option<SessionSummary> },
    #[serde(rename = "SESSION_DELETE_RESPONSE", rename_all = "camelCase")]
    SessionDeleteResponse {
        session_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
        }
    }
}
