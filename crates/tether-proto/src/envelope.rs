use serde::{Deserialize, Serialize};

/// Version tag stamped on every envelope.
pub const PROTOCOL_VERSION: u32 = 1;

/// Opaque encrypted unit relayed between a session's CLI and its viewers.
///
/// `nonce` and `ciphertext` are standard base64. The relay never decodes
/// either field; it forwards the value exactly as received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope {
    pub version: u32,
    pub session_id: String,
    /// Fingerprint of the key that sealed the envelope. Receivers holding no
    /// matching key skip the envelope instead of counting a failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    pub nonce: String,
    pub ciphertext: String,
    pub timestamp: u64,
}
