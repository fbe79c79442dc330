//! Wire definitions shared by the tether relay and its endpoints.
//! Kept free of runtime dependencies so the browser bindings and the relay
//! agree on a single source of truth for message shapes.

pub mod app;
pub mod envelope;
pub mod error;
pub mod messages;
pub mod session;

pub use app::{AppMessage, AppMessageError, SecureMessage};
pub use envelope::{EncryptedEnvelope, PROTOCOL_VERSION};
pub use error::ErrorCode;
pub use messages::{ClientMessage, ServerMessage};
pub use session::{
    generate_session_id, is_valid_session_id, Role, SessionMetadata, SessionStatus,
    SessionSummary, ANONYMOUS_USER, SESSION_ID_LEN,
};

/// Milliseconds since the unix epoch, the timestamp unit used on the wire.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
