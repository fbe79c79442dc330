//! Application messages carried inside encrypted envelopes.
//!
//! The envelope codec only understands the `{type, payload, seq}` shape
//! ([`SecureMessage`]); [`AppMessage`] is the typed view endpoints work with.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

pub const TERMINAL_OUTPUT: &str = "TERMINAL_OUTPUT";
pub const TERMINAL_INPUT: &str = "TERMINAL_INPUT";
pub const TERMINAL_RESIZE: &str = "TERMINAL_RESIZE";
pub const STATE_SYNC: &str = "STATE_SYNC";
pub const STATE_REQUEST: &str = "STATE_REQUEST";
pub const SESSION_KEY: &str = "SESSION_KEY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecureMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppMessage {
    TerminalOutput { data: String },
    TerminalInput { data: String },
    TerminalResize { cols: u16, rows: u16 },
    StateSync { cols: u16, rows: u16, has_history: bool },
    StateRequest,
    /// Session key handed from the CLI to one viewer, sealed under that
    /// viewer's pairwise key.
    SessionKey { key: String },
}

#[derive(Debug, Error)]
pub enum AppMessageError {
    #[error("unknown application message type '{0}'")]
    UnknownKind(String),
    #[error("malformed {kind} payload: {source}")]
    Payload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct Dimensions {
    cols: u16,
    rows: u16,
}

#[derive(Deserialize)]
struct KeyPayload {
    key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncPayload {
    cols: u16,
    rows: u16,
    #[serde(default)]
    has_history: bool,
}

impl AppMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            AppMessage::TerminalOutput { .. } => TERMINAL_OUTPUT,
            AppMessage::TerminalInput { .. } => TERMINAL_INPUT,
            AppMessage::TerminalResize { .. } => TERMINAL_RESIZE,
            AppMessage::StateSync { .. } => STATE_SYNC,
            AppMessage::StateRequest => STATE_REQUEST,
            AppMessage::SessionKey { .. } => SESSION_KEY,
        }
    }

    pub fn into_secure(self, seq: u64) -> SecureMessage {
        let kind = self.kind().to_string();
        let payload = match self {
            AppMessage::TerminalOutput { data } | AppMessage::TerminalInput { data } => {
                Value::String(data)
            }
            AppMessage::TerminalResize { cols, rows } => json!({ "cols": cols, "rows": rows }),
            AppMessage::StateSync {
                cols,
                rows,
                has_history,
            } => json!({ "cols": cols, "rows": rows, "hasHistory": has_history }),
            AppMessage::StateRequest => Value::Null,
            AppMessage::SessionKey { key } => json!({ "key": key }),
        };
        SecureMessage { kind, payload, seq }
    }
}

impl TryFrom<&SecureMessage> for AppMessage {
    type Error = AppMessageError;

    fn try_from(message: &SecureMessage) -> Result<Self, Self::Error> {
        let payload = message.payload.clone();
        match message.kind.as_str() {
            TERMINAL_OUTPUT => Ok(AppMessage::TerminalOutput {
                data: parse(TERMINAL_OUTPUT, payload)?,
            }),
            TERMINAL_INPUT => Ok(AppMessage::TerminalInput {
                data: parse(TERMINAL_INPUT, payload)?,
            }),
            TERMINAL_RESIZE => {
                let dims: Dimensions = parse(TERMINAL_RESIZE, payload)?;
                Ok(AppMessage::TerminalResize {
                    cols: dims.cols,
                    rows: dims.rows,
                })
            }
            STATE_SYNC => {
                let sync: SyncPayload = parse(STATE_SYNC, payload)?;
                Ok(AppMessage::StateSync {
                    cols: sync.cols,
                    rows: sync.rows,
                    has_history: sync.has_history,
                })
            }
            STATE_REQUEST => Ok(AppMessage::StateRequest),
            SESSION_KEY => {
                let delivery: KeyPayload = parse(SESSION_KEY, payload)?;
                Ok(AppMessage::SessionKey { key: delivery.key })
            }
            other => Err(AppMessageError::UnknownKind(other.to_string())),
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(
    kind: &'static str,
    payload: Value,
) -> Result<T, AppMessageError> {
    serde_json::from_value(payload).map_err(|source| AppMessageError::Payload { kind, source })
}
