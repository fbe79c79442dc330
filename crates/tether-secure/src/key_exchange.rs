use std::fmt;

use base64::engine::general_purpose::{STANDARD as BASE64_STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::SecureError;

pub const PUBLIC_KEY_LENGTH: usize = 32;
const CHANNEL_HKDF_SALT: &[u8] = b"tether:channel-key:v1";
const CHANNEL_HKDF_INFO: &[u8] = b"tether:channel-key:chacha20poly1305";
const KEY_ID_LABEL: &[u8] = b"tether:key-id";
const KEY_ID_LENGTH: usize = 8;

/// Symmetric ChaCha20-Poly1305 key. Either derived pairwise from an X25519
/// exchange or generated as the session key a CLI hands to its viewers.
#[derive(Clone, PartialEq, Eq)]
pub struct ChannelKey {
    bytes: [u8; 32],
    id: String,
}

impl ChannelKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        let digest = Sha256::new()
            .chain_update(KEY_ID_LABEL)
            .chain_update(bytes)
            .finalize();
        let id = STANDARD_NO_PAD.encode(&digest[..KEY_ID_LENGTH]);
        Self { bytes, id }
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// Public fingerprint stamped on envelopes sealed under this key. It
    /// reveals nothing about the key itself.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn to_base64(&self) -> String {
        BASE64_STANDARD.encode(self.bytes)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, SecureError> {
        let bytes = BASE64_STANDARD
            .decode(encoded.trim().as_bytes())
            .map_err(|err| SecureError::MalformedMessage(format!("invalid key encoding: {err}")))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|raw: Vec<u8>| {
            SecureError::MalformedMessage(format!("expected a 32 byte key, got {}", raw.len()))
        })?;
        Ok(Self::from_bytes(bytes))
    }
}

impl fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ChannelKey").field(&self.id).finish()
    }
}

/// Ephemeral X25519 key pair. Generated once per endpoint run and never
/// persisted, so a restart or page reload always presents a new public key.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> String {
        BASE64_STANDARD.encode(self.public.as_bytes())
    }

    /// Agree on a channel key with the peer's base64 public key.
    ///
    /// Both sides feed the sorted pair of public keys into HKDF, so swapping
    /// roles yields the same key. Malformed or low-order peer keys fail closed.
    pub fn derive_channel_key(&self, peer_public_key: &str) -> Result<ChannelKey, SecureError> {
        let peer = decode_public_key(peer_public_key)?;
        let shared = self.secret.diffie_hellman(&peer);
        if !shared.was_contributory() {
            return Err(SecureError::InvalidPublicKey(
                "peer key produced a non-contributory shared secret".into(),
            ));
        }

        let mut keys = [*self.public.as_bytes(), *peer.as_bytes()];
        keys.sort();
        let mut info = Vec::with_capacity(CHANNEL_HKDF_INFO.len() + 2 + 2 * PUBLIC_KEY_LENGTH);
        info.extend_from_slice(CHANNEL_HKDF_INFO);
        info.push(0x1f);
        info.extend_from_slice(&keys[0]);
        info.push(0x1f);
        info.extend_from_slice(&keys[1]);

        let hkdf = Hkdf::<Sha256>::new(Some(CHANNEL_HKDF_SALT), shared.as_bytes());
        let mut okm = [0u8; 32];
        hkdf.expand(&info, &mut okm)
            .map_err(|err| SecureError::InvalidPublicKey(format!("hkdf expand failed: {err}")))?;
        Ok(ChannelKey::from_bytes(okm))
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

pub fn decode_public_key(encoded: &str) -> Result<PublicKey, SecureError> {
    let bytes = BASE64_STANDARD
        .decode(encoded.trim().as_bytes())
        .map_err(|err| SecureError::InvalidPublicKey(format!("invalid base64: {err}")))?;
    let bytes: [u8; PUBLIC_KEY_LENGTH] = bytes.try_into().map_err(|raw: Vec<u8>| {
        SecureError::InvalidPublicKey(format!(
            "expected {PUBLIC_KEY_LENGTH} bytes, got {}",
            raw.len()
        ))
    })?;
    Ok(PublicKey::from(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn derivation_is_commutative() {
        for _ in 0..8 {
            let a = KeyPair::generate();
            let b = KeyPair::generate();
            let ab = a.derive_channel_key(&b.public_key()).unwrap();
            let ba = b.derive_channel_key(&a.public_key()).unwrap();
            assert_eq!(ab, ba);
        }
    }

    #[test_timeout::timeout]
    fn different_peers_give_different_keys() {
        let cli = KeyPair::generate();
        let first = KeyPair::generate();
        let second = KeyPair::generate();
        assert_ne!(
            cli.derive_channel_key(&first.public_key()).unwrap(),
            cli.derive_channel_key(&second.public_key()).unwrap()
        );
    }

    #[test_timeout::timeout]
    fn rejects_wrong_length_and_garbage() {
        let local = KeyPair::generate();
        let short = BASE64_STANDARD.encode([7u8; 16]);
        assert!(matches!(
            local.derive_channel_key(&short),
            Err(SecureError::InvalidPublicKey(_))
        ));
        assert!(matches!(
            local.derive_channel_key("not base64!!"),
            Err(SecureError::InvalidPublicKey(_))
        ));
    }

    #[test_timeout::timeout]
    fn rejects_low_order_points() {
        let local = KeyPair::generate();
        let zero = BASE64_STANDARD.encode([0u8; 32]);
        assert!(matches!(
            local.derive_channel_key(&zero),
            Err(SecureError::InvalidPublicKey(_))
        ));
    }

    #[test_timeout::timeout]
    fn session_keys_are_random_and_travel_as_base64() {
        let key = ChannelKey::generate();
        assert_ne!(key, ChannelKey::generate());
        let restored = ChannelKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(restored, key);
        assert_eq!(restored.id(), key.id());
        assert!(!format!("{key:?}").contains(&key.to_base64()));
        assert!(matches!(
            ChannelKey::from_base64(&BASE64_STANDARD.encode([1u8; 31])),
            Err(SecureError::MalformedMessage(_))
        ));
    }

    #[test_timeout::timeout]
    fn key_ids_are_short_and_distinct() {
        let a = ChannelKey::from_bytes([1u8; 32]);
        let b = ChannelKey::from_bytes([2u8; 32]);
        assert_eq!(a.id().len(), 11);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), ChannelKey::from_bytes([1u8; 32]).id());
    }

    #[test_timeout::timeout]
    fn public_key_is_32_bytes_base64() {
        let pair = KeyPair::generate();
        let decoded = BASE64_STANDARD.decode(pair.public_key()).unwrap();
        assert_eq!(decoded.len(), PUBLIC_KEY_LENGTH);
    }
}
