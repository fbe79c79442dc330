//! Everything an endpoint (the terminal-owning CLI or a browser viewer) needs
//! to talk through the relay without the relay learning anything: X25519 key
//! agreement, authenticated envelope sealing, the viewer input filter, and
//! the transport-free endpoint state machines.

pub mod channel;
pub mod codec;
pub mod endpoint;
pub mod error;
pub mod input_filter;
pub mod key_exchange;

pub use channel::{KeySlot, Opened, SecureChannel, DEFAULT_FAILURE_THRESHOLD};
pub use codec::{decrypt, encrypt};
pub use error::SecureError;
pub use input_filter::{FilterResult, InputFilter, InputFilterConfig, Signal};
pub use key_exchange::{ChannelKey, KeyPair};
