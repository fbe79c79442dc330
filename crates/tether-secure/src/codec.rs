use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;

use tether_proto::{now_millis, EncryptedEnvelope, SecureMessage, PROTOCOL_VERSION};

use crate::error::SecureError;
use crate::key_exchange::ChannelKey;

const NONCE_LENGTH: usize = 12;

/// Seal `message` for `session_id` under a fresh random nonce. The key id is
/// stamped on the envelope and authenticated with it.
pub fn encrypt(
    message: &SecureMessage,
    session_id: &str,
    key: &ChannelKey,
) -> Result<EncryptedEnvelope, SecureError> {
    let plaintext = serde_json::to_vec(message)
        .map_err(|err| SecureError::EncryptionFailed(format!("serialize: {err}")))?;

    let mut nonce_bytes = [0u8; NONCE_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let aad = build_aad(PROTOCOL_VERSION, session_id, Some(key.id()));
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: &plaintext,
                aad: &aad,
            },
        )
        .map_err(|err| SecureError::EncryptionFailed(err.to_string()))?;

    Ok(EncryptedEnvelope {
        version: PROTOCOL_VERSION,
        session_id: session_id.to_string(),
        key_id: Some(key.id().to_string()),
        nonce: BASE64_STANDARD.encode(nonce_bytes),
        ciphertext: BASE64_STANDARD.encode(ciphertext),
        timestamp: now_millis(),
    })
}

/// Open an envelope. Any authentication failure (wrong key, altered nonce,
/// ciphertext, session id or key id) is reported as `DecryptionFailed`.
pub fn decrypt(
    envelope: &EncryptedEnvelope,
    key: &ChannelKey,
) -> Result<SecureMessage, SecureError> {
    if envelope.version != PROTOCOL_VERSION {
        return Err(SecureError::UnsupportedVersion(envelope.version));
    }
    let nonce_bytes = BASE64_STANDARD
        .decode(envelope.nonce.as_bytes())
        .map_err(|err| SecureError::DecryptionFailed(format!("invalid nonce encoding: {err}")))?;
    if nonce_bytes.len() != NONCE_LENGTH {
        return Err(SecureError::DecryptionFailed("unexpected nonce length".into()));
    }
    let ciphertext = BASE64_STANDARD
        .decode(envelope.ciphertext.as_bytes())
        .map_err(|err| {
            SecureError::DecryptionFailed(format!("invalid ciphertext encoding: {err}"))
        })?;

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let aad = build_aad(
        envelope.version,
        &envelope.session_id,
        envelope.key_id.as_deref(),
    );
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: &ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| SecureError::DecryptionFailed("authentication failed".into()))?;

    serde_json::from_slice(&plaintext).map_err(|err| SecureError::MalformedMessage(err.to_string()))
}

fn build_aad(version: u32, session_id: &str, key_id: Option<&str>) -> Vec<u8> {
    let key_id = key_id.unwrap_or_default();
    let mut aad = Vec::with_capacity(session_id.len() + key_id.len() + 13);
    aad.extend_from_slice(b"tether");
    aad.push(0x1f);
    aad.extend_from_slice(&version.to_be_bytes());
    aad.push(0x1f);
    aad.extend_from_slice(session_id.as_bytes());
    aad.push(0x1f);
    aad.extend_from_slice(key_id.as_bytes());
    aad
}
