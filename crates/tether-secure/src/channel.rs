use std::collections::BTreeMap;

use tether_proto::{EncryptedEnvelope, SecureMessage};
use tracing::{debug, warn};

use crate::codec;
use crate::error::SecureError;
use crate::key_exchange::{ChannelKey, KeyPair};

/// Consecutive decryption failures after which a channel is considered out of
/// sync with its peer.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Which key opened an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySlot {
    /// The session key shared by the CLI and every viewer.
    Session,
    /// The pairwise key derived with the named peer.
    Peer(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Opened {
    pub message: SecureMessage,
    pub slot: KeySlot,
}

#[derive(Debug)]
struct Peer {
    public_key: String,
    key: ChannelKey,
}

/// One endpoint's key material.
///
/// Every peer gets a pairwise key derived from an X25519 exchange. Those keys
/// only carry the session key, which seals all terminal traffic so that any
/// number of viewers (and the relay's replay cache) share one ciphertext
/// stream. Envelopes name their key by id; an envelope for a key this side
/// does not hold is skipped without counting as a failure.
#[derive(Debug)]
pub struct SecureChannel {
    keypair: KeyPair,
    peers: BTreeMap<String, Peer>,
    session_key: Option<ChannelKey>,
    consecutive_failures: u32,
    failure_threshold: u32,
}

impl SecureChannel {
    pub fn new() -> Self {
        Self::with_keypair(KeyPair::generate())
    }

    pub fn with_keypair(keypair: KeyPair) -> Self {
        Self {
            keypair,
            peers: BTreeMap::new(),
            session_key: None,
            consecutive_failures: 0,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn public_key(&self) -> String {
        self.keypair.public_key()
    }

    /// Install `peer`'s public key. Returns `true` when the pairwise key was
    /// (re)derived and `false` when the key matched the one already in use.
    /// A rejected key leaves the previous pairing untouched.
    pub fn set_peer(&mut self, peer: &str, public_key: &str) -> Result<bool, SecureError> {
        if self
            .peers
            .get(peer)
            .is_some_and(|known| known.public_key == public_key)
        {
            return Ok(false);
        }
        let key = self.keypair.derive_channel_key(public_key)?;
        let previous = self.peers.insert(
            peer.to_string(),
            Peer {
                public_key: public_key.to_string(),
                key,
            },
        );
        debug!(
            peer,
            rederived = previous.is_some(),
            "derived pairwise key"
        );
        self.consecutive_failures = 0;
        Ok(true)
    }

    pub fn peer_public_key(&self, peer: &str) -> Option<&str> {
        self.peers.get(peer).map(|known| known.public_key.as_str())
    }

    pub fn remove_peer(&mut self, peer: &str) -> bool {
        self.peers.remove(peer).is_some()
    }

    pub fn clear_peers(&mut self) {
        self.peers.clear();
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn session_key(&self) -> Option<&ChannelKey> {
        self.session_key.as_ref()
    }

    /// Returns `true` when the installed session key changed.
    pub fn set_session_key(&mut self, key: ChannelKey) -> bool {
        if self.session_key.as_ref() == Some(&key) {
            return false;
        }
        self.session_key = Some(key);
        self.consecutive_failures = 0;
        true
    }

    pub fn clear_session_key(&mut self) {
        self.session_key = None;
    }

    pub fn is_established(&self) -> bool {
        self.session_key.is_some()
    }

    /// Seal under the session key.
    pub fn seal(
        &self,
        message: &SecureMessage,
        session_id: &str,
    ) -> Result<EncryptedEnvelope, SecureError> {
        let key = self
            .session_key
            .as_ref()
            .ok_or(SecureError::ChannelNotEstablished)?;
        codec::encrypt(message, session_id, key)
    }

    /// Seal under the pairwise key shared with `peer`.
    pub fn seal_for(
        &self,
        peer: &str,
        message: &SecureMessage,
        session_id: &str,
    ) -> Result<EncryptedEnvelope, SecureError> {
        let known = self
            .peers
            .get(peer)
            .ok_or(SecureError::ChannelNotEstablished)?;
        codec::encrypt(message, session_id, &known.key)
    }

    /// Decrypt an inbound envelope. `Ok(None)` means the envelope was sealed
    /// under a key this side does not hold. Authentication failures under a
    /// held key count towards desynchronization.
    pub fn open(&mut self, envelope: &EncryptedEnvelope) -> Result<Option<Opened>, SecureError> {
        let Some((slot, key)) = self.key_for(envelope.key_id.as_deref()) else {
            debug!(
                session = %envelope.session_id,
                key_id = envelope.key_id.as_deref().unwrap_or("-"),
                "skipping envelope sealed under a key this side does not hold"
            );
            return Ok(None);
        };
        match codec::decrypt(envelope, key) {
            Ok(message) => {
                self.consecutive_failures = 0;
                Ok(Some(Opened { message, slot }))
            }
            Err(err) => {
                self.consecutive_failures += 1;
                warn!(
                    session = %envelope.session_id,
                    failures = self.consecutive_failures,
                    error = %err,
                    "failed to open envelope"
                );
                Err(err)
            }
        }
    }

    fn key_for(&self, key_id: Option<&str>) -> Option<(KeySlot, &ChannelKey)> {
        let session = self.session_key.as_ref();
        let Some(key_id) = key_id else {
            return session.map(|key| (KeySlot::Session, key));
        };
        if let Some(key) = session.filter(|key| key.id() == key_id) {
            return Some((KeySlot::Session, key));
        }
        self.peers
            .iter()
            .find(|(_, known)| known.key.id() == key_id)
            .map(|(label, known)| (KeySlot::Peer(label.clone()), &known.key))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_desynchronized(&self) -> bool {
        self.consecutive_failures >= self.failure_threshold
    }

    pub fn reset_failures(&mut self) {
        self.consecutive_failures = 0;
    }
}

impl Default for SecureChannel {
    fn default() -> Self {
        Self::new()
    }
}
