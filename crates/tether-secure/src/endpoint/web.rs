use tether_proto::{
    AppMessage, ClientMessage, EncryptedEnvelope, ErrorCode, SecureMessage, ServerMessage,
};
use tracing::{debug, info, warn};

use crate::channel::{KeySlot, Opened, SecureChannel};
use crate::error::SecureError;
use crate::key_exchange::ChannelKey;

/// Peer label under which the CLI's pairwise key is held.
const CLI_PEER: &str = "cli";
/// Envelopes that overtake the join acknowledgement are held, up to this many.
const MAX_EARLY_ENVELOPES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebPhase {
    Joining,
    /// Attached to the session but the CLI is currently detached.
    Waiting,
    /// Joined; the CLI has not handed over the session key yet.
    AwaitingKey,
    Connected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WebAction {
    Send(ClientMessage),
    Joined,
    /// The session key arrived and input can flow.
    Connected,
    Output(String),
    StateSync {
        cols: u16,
        rows: u16,
        has_history: bool,
    },
    CliDisconnected,
    CliReconnected,
    /// Too many envelopes failed to open; a fresh join has been issued.
    Rejoining,
    Failed {
        code: ErrorCode,
        message: String,
    },
}

/// A browser viewer. The key pair lives as long as this value, so a page
/// reload (a new `WebEndpoint`) always presents a new public key.
#[derive(Debug)]
pub struct WebEndpoint {
    session_id: String,
    channel: SecureChannel,
    phase: WebPhase,
    seq: u64,
    last_peer_seq: Option<u64>,
    replay_on_join: bool,
    early: Vec<EncryptedEnvelope>,
}

impl WebEndpoint {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self::with_channel(session_id, SecureChannel::new())
    }

    pub fn with_channel(session_id: impl Into<String>, channel: SecureChannel) -> Self {
        Self {
            session_id: session_id.into(),
            channel,
            phase: WebPhase::Joining,
            seq: 0,
            last_peer_seq: None,
            replay_on_join: true,
            early: Vec::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn phase(&self) -> WebPhase {
        self.phase
    }

    pub fn public_key(&self) -> String {
        self.channel.public_key()
    }

    /// Join frame for a fresh transport connection. The relay's cached output
    /// is requested once the session key has arrived.
    pub fn join(&mut self) -> ClientMessage {
        self.join_with_replay(true)
    }

    pub fn handle(&mut self, message: ServerMessage) -> Vec<WebAction> {
        match message {
            ServerMessage::SessionJoined {
                cli_public_key,
                cli_disconnected,
                ..
            } => {
                if let Err(err) = self.install_cli_key(&cli_public_key) {
                    return vec![failed(err)];
                }
                if cli_disconnected {
                    info!(session = %self.session_id, "joined while the CLI is detached; waiting");
                    self.phase = WebPhase::Waiting;
                    self.early.clear();
                    return vec![WebAction::Joined, WebAction::CliDisconnected];
                }
                self.phase = WebPhase::AwaitingKey;
                let mut actions = vec![WebAction::Joined];
                for envelope in std::mem::take(&mut self.early) {
                    actions.extend(self.handle_envelope(&envelope));
                }
                actions
            }
            ServerMessage::CliReconnected { cli_public_key } => {
                if let Err(err) = self.install_cli_key(&cli_public_key) {
                    return vec![failed(err)];
                }
                // The CLI may be a new process that never saw our key.
                info!(session = %self.session_id, "cli reconnected; re-announcing viewer key");
                vec![WebAction::CliReconnected, WebAction::Send(self.join())]
            }
            // The relay follows a detached join with its own notice.
            ServerMessage::CliDisconnected if self.phase == WebPhase::Waiting => Vec::new(),
            ServerMessage::CliDisconnected => {
                self.phase = WebPhase::Waiting;
                vec![WebAction::CliDisconnected]
            }
            ServerMessage::Encrypted(envelope) if self.phase == WebPhase::Joining => {
                if self.early.len() < MAX_EARLY_ENVELOPES {
                    self.early.push(envelope);
                } else {
                    debug!(session = %self.session_id, "dropping envelope received before join");
                }
                Vec::new()
            }
            ServerMessage::Encrypted(envelope) => self.handle_envelope(&envelope),
            ServerMessage::Error { code, message } => vec![WebAction::Failed { code, message }],
            ServerMessage::Pong { .. }
            | ServerMessage::SessionListResponse { .. }
            | ServerMessage::SessionInfoResponse { .. }
            | ServerMessage::SessionDeleteResponse { .. } => Vec::new(),
            ServerMessage::SessionCreated { .. }
            | ServerMessage::SessionReconnected { .. }
            | ServerMessage::WebConnected { .. }
            | ServerMessage::WebDisconnected { .. } => {
                debug!(session = %self.session_id, "ignoring cli-only notice");
                Vec::new()
            }
        }
    }

    /// Seal keystrokes for the CLI. `None` until the session key is held.
    pub fn send_input(
        &mut self,
        data: impl Into<String>,
    ) -> Result<Option<ClientMessage>, SecureError> {
        if self.phase != WebPhase::Connected {
            return Ok(None);
        }
        self.seal(AppMessage::TerminalInput { data: data.into() })
            .map(Some)
    }

    pub fn send_resize(
        &mut self,
        cols: u16,
        rows: u16,
    ) -> Result<Option<ClientMessage>, SecureError> {
        if self.phase != WebPhase::Connected {
            return Ok(None);
        }
        self.seal(AppMessage::TerminalResize { cols, rows }).map(Some)
    }

    fn join_with_replay(&mut self, replay: bool) -> ClientMessage {
        self.phase = WebPhase::Joining;
        self.replay_on_join = replay;
        self.early.clear();
        ClientMessage::SessionJoin {
            session_id: self.session_id.clone(),
            public_key: self.channel.public_key(),
        }
    }

    fn install_cli_key(&mut self, cli_public_key: &str) -> Result<(), SecureError> {
        if self.channel.set_peer(CLI_PEER, cli_public_key)? {
            // A new CLI process brings a new session key.
            self.channel.clear_session_key();
            self.last_peer_seq = None;
        }
        Ok(())
    }

    fn request_state(&mut self) -> Vec<WebAction> {
        match self.seal(AppMessage::StateRequest) {
            Ok(frame) => vec![WebAction::Send(frame)],
            Err(err) => vec![failed(err)],
        }
    }

    fn handle_envelope(&mut self, envelope: &EncryptedEnvelope) -> Vec<WebAction> {
        if envelope.session_id != self.session_id {
            warn!(
                session = %self.session_id,
                envelope_session = %envelope.session_id,
                "dropping envelope for another session"
            );
            return Vec::new();
        }
        match self.channel.open(envelope) {
            Ok(Some(Opened {
                message,
                slot: KeySlot::Session,
            })) => self.handle_session_message(&message),
            Ok(Some(Opened {
                message,
                slot: KeySlot::Peer(_),
            })) => self.accept_session_key(&message),
            Ok(None) => Vec::new(),
            Err(_) if self.channel.is_desynchronized() => {
                warn!(session = %self.session_id, "channel desynchronized; re-joining");
                self.channel.reset_failures();
                // The cached envelopes that just failed would fail again.
                let frame = self.join_with_replay(false);
                vec![WebAction::Rejoining, WebAction::Send(frame)]
            }
            Err(_) => Vec::new(),
        }
    }

    fn accept_session_key(&mut self, message: &SecureMessage) -> Vec<WebAction> {
        let encoded = match AppMessage::try_from(message) {
            Ok(AppMessage::SessionKey { key }) => key,
            Ok(other) => {
                debug!(
                    session = %self.session_id,
                    kind = other.kind(),
                    "ignoring pairwise message"
                );
                return Vec::new();
            }
            Err(err) => {
                warn!(session = %self.session_id, error = %err, "unrecognised pairwise message");
                return Vec::new();
            }
        };
        let key = match ChannelKey::from_base64(&encoded) {
            Ok(key) => key,
            Err(err) => return vec![failed(err)],
        };
        if self.channel.set_session_key(key) {
            info!(session = %self.session_id, "session key installed");
            self.last_peer_seq = None;
        }
        if self.phase != WebPhase::AwaitingKey {
            return Vec::new();
        }

        self.phase = WebPhase::Connected;
        let mut actions = vec![WebAction::Connected];
        if self.replay_on_join {
            actions.push(WebAction::Send(ClientMessage::StateRequest {
                session_id: Some(self.session_id.clone()),
            }));
        }
        actions.extend(self.request_state());
        actions
    }

    fn handle_session_message(&mut self, message: &SecureMessage) -> Vec<WebAction> {
        if let Some(last) = self.last_peer_seq {
            if message.seq <= last {
                debug!(session = %self.session_id, seq = message.seq, "dropping replayed envelope");
                return Vec::new();
            }
        }
        self.last_peer_seq = Some(message.seq);

        match AppMessage::try_from(message) {
            Ok(AppMessage::TerminalOutput { data }) => vec![WebAction::Output(data)],
            Ok(AppMessage::StateSync {
                cols,
                rows,
                has_history,
            }) => vec![WebAction::StateSync {
                cols,
                rows,
                has_history,
            }],
            Ok(other) => {
                debug!(
                    session = %self.session_id,
                    kind = other.kind(),
                    "ignoring cli-bound message"
                );
                Vec::new()
            }
            Err(err) => {
                warn!(session = %self.session_id, error = %err, "unrecognised application message");
                Vec::new()
            }
        }
    }

    fn seal(&mut self, message: AppMessage) -> Result<ClientMessage, SecureError> {
        self.seq += 1;
        let envelope = self
            .channel
            .seal(&message.into_secure(self.seq), &self.session_id)?;
        Ok(ClientMessage::Encrypted(envelope))
    }
}

fn failed(err: SecureError) -> WebAction {
    WebAction::Failed {
        code: err.code(),
        message: err.to_string(),
    }
}
