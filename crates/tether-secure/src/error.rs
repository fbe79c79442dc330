use thiserror::Error;

use tether_proto::ErrorCode;

#[derive(Debug, Error)]
pub enum SecureError {
    #[error("invalid peer public key: {0}")]
    InvalidPublicKey(String),
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u32),
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("no channel key established")]
    ChannelNotEstablished,
}

impl SecureError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SecureError::InvalidPublicKey(_) => ErrorCode::InvalidPublicKey,
            SecureError::EncryptionFailed(_) | SecureError::ChannelNotEstablished => {
                ErrorCode::EncryptionFailed
            }
            SecureError::DecryptionFailed(_) | SecureError::UnsupportedVersion(_) => {
                ErrorCode::DecryptionFailed
            }
            SecureError::MalformedMessage(_) => ErrorCode::InvalidMessage,
        }
    }
}
