use tether_proto::{
    generate_session_id, AppMessage, ClientMessage, EncryptedEnvelope, ErrorCode, ServerMessage,
};
use tracing::{debug, info, warn};

use crate::channel::{KeySlot, Opened, SecureChannel};
use crate::error::SecureError;
use crate::input_filter::{InputFilter, InputFilterConfig};
use crate::key_exchange::ChannelKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliPhase {
    /// A create or reconnect request is in flight.
    Registering,
    /// Registered with the relay; no viewer attached.
    Waiting,
    /// At least one viewer has been handed the session key.
    Paired,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CliAction {
    Send(ClientMessage),
    Registered {
        session_id: String,
        ws_endpoint: String,
    },
    ViewerJoined {
        connection_id: String,
    },
    ViewerLeft {
        connection_id: String,
    },
    WriteInput(String),
    Resize {
        cols: u16,
        rows: u16,
    },
    InputBlocked {
        signals: Vec<&'static str>,
    },
    /// The previous session expired on the relay; a new id was chosen.
    SessionReplaced {
        previous: String,
        session_id: String,
    },
    Desynchronized,
    Failed {
        code: ErrorCode,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalState {
    pub cols: u16,
    pub rows: u16,
    pub has_history: bool,
}

impl Default for TerminalState {
    fn default() -> Self {
        Self {
            cols: 80,
            rows: 24,
            has_history: false,
        }
    }
}

/// The terminal-owning side of a session.
///
/// A random session key is generated once per process and seals all terminal
/// traffic. Each announced viewer receives that key sealed under the pairwise
/// key derived from its public key.
#[derive(Debug)]
pub struct CliEndpoint {
    session_id: String,
    channel: SecureChannel,
    filter: InputFilter,
    phase: CliPhase,
    registered: bool,
    seq: u64,
    terminal: TerminalState,
}

impl CliEndpoint {
    pub fn new(filter: InputFilterConfig) -> Self {
        Self::with_session_id(generate_session_id(), filter)
    }

    pub fn with_session_id(session_id: impl Into<String>, filter: InputFilterConfig) -> Self {
        let mut channel = SecureChannel::new();
        channel.set_session_key(ChannelKey::generate());
        Self {
            session_id: session_id.into(),
            channel,
            filter: InputFilter::new(filter),
            phase: CliPhase::Registering,
            registered: false,
            seq: 0,
            terminal: TerminalState::default(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn phase(&self) -> CliPhase {
        self.phase
    }

    pub fn public_key(&self) -> String {
        self.channel.public_key()
    }

    pub fn terminal(&self) -> TerminalState {
        self.terminal
    }

    pub fn viewer_count(&self) -> usize {
        self.channel.peer_count()
    }

    /// Registration frame for a fresh transport connection: a create on the
    /// first attempt, a reconnect once the relay has acknowledged the session.
    pub fn connect(&mut self) -> ClientMessage {
        self.phase = CliPhase::Registering;
        // Viewers announce themselves again on the new transport.
        self.channel.clear_peers();
        if self.registered {
            ClientMessage::SessionReconnect {
                session_id: self.session_id.clone(),
                public_key: self.channel.public_key(),
            }
        } else {
            ClientMessage::SessionCreate {
                session_id: self.session_id.clone(),
                public_key: self.channel.public_key(),
            }
        }
    }

    pub fn handle(&mut self, message: ServerMessage) -> Vec<CliAction> {
        match message {
            ServerMessage::SessionCreated {
                session_id,
                ws_endpoint,
            }
            | ServerMessage::SessionReconnected {
                session_id,
                ws_endpoint,
            } => {
                self.registered = true;
                self.phase = self.viewer_phase();
                info!(session = %session_id, "session registered with relay");
                vec![CliAction::Registered {
                    session_id,
                    ws_endpoint,
                }]
            }
            ServerMessage::WebConnected {
                public_key,
                connection_id,
            } => match self.admit_viewer(&connection_id, &public_key) {
                Ok(delivery) => {
                    debug!(
                        session = %self.session_id,
                        connection = %connection_id,
                        viewers = self.channel.peer_count(),
                        "viewer attached; session key delivered"
                    );
                    self.phase = CliPhase::Paired;
                    vec![
                        CliAction::ViewerJoined { connection_id },
                        CliAction::Send(delivery),
                    ]
                }
                Err(err) => {
                    warn!(
                        session = %self.session_id,
                        connection = %connection_id,
                        error = %err,
                        "viewer presented an unusable public key"
                    );
                    vec![CliAction::Failed {
                        code: err.code(),
                        message: err.to_string(),
                    }]
                }
            },
            ServerMessage::WebDisconnected { connection_id } => {
                self.channel.remove_peer(&connection_id);
                self.phase = self.viewer_phase();
                vec![CliAction::ViewerLeft { connection_id }]
            }
            ServerMessage::Encrypted(envelope) => self.handle_envelope(&envelope),
            ServerMessage::Error { code, message } => self.handle_error(code, message),
            ServerMessage::Pong { .. }
            | ServerMessage::SessionListResponse { .. }
            | ServerMessage::SessionInfoResponse { .. }
            | ServerMessage::SessionDeleteResponse { .. } => Vec::new(),
            ServerMessage::SessionJoined { .. }
            | ServerMessage::CliDisconnected
            | ServerMessage::CliReconnected { .. } => {
                debug!(session = %self.session_id, "ignoring viewer-only notice");
                Vec::new()
            }
        }
    }

    /// Seal a chunk of local terminal output. Returns `None` while no viewer
    /// holds the session key, since there is nobody able to read it yet.
    pub fn send_output(
        &mut self,
        data: impl Into<String>,
    ) -> Result<Option<ClientMessage>, SecureError> {
        if self.channel.peer_count() == 0 {
            return Ok(None);
        }
        self.terminal.has_history = true;
        self.seal(AppMessage::TerminalOutput { data: data.into() })
            .map(Some)
    }

    /// Record a local terminal resize.
    pub fn set_terminal_size(&mut self, cols: u16, rows: u16) {
        self.terminal.cols = cols;
        self.terminal.rows = rows;
    }

    fn handle_envelope(&mut self, envelope: &EncryptedEnvelope) -> Vec<CliAction> {
        if envelope.session_id != self.session_id {
            warn!(
                session = %self.session_id,
                envelope_session = %envelope.session_id,
                "dropping envelope for another session"
            );
            return Vec::new();
        }
        let opened = match self.channel.open(envelope) {
            Ok(Some(Opened {
                message,
                slot: KeySlot::Session,
            })) => message,
            Ok(Some(Opened {
                slot: KeySlot::Peer(peer),
                ..
            })) => {
                debug!(session = %self.session_id, %peer, "ignoring pairwise message from viewer");
                return Vec::new();
            }
            Ok(None) => return Vec::new(),
            Err(_) if self.channel.is_desynchronized() => {
                self.channel.reset_failures();
                return vec![CliAction::Desynchronized];
            }
            Err(_) => return Vec::new(),
        };
        let message = match AppMessage::try_from(&opened) {
            Ok(message) => message,
            Err(err) => {
                warn!(
                    session = %self.session_id,
                    error = %err,
                    "unrecognised application message"
                );
                return Vec::new();
            }
        };

        let kind = message.kind();
        match message {
            AppMessage::TerminalInput { data } => {
                let filtered = self.filter.filter(Some(&data));
                let mut actions = Vec::with_capacity(2);
                if filtered.blocked {
                    info!(
                        session = %self.session_id,
                        signals = ?filtered.blocked_signals,
                        "blocked control signals from viewer"
                    );
                    actions.push(CliAction::InputBlocked {
                        signals: filtered.blocked_signals,
                    });
                }
                if !filtered.data.is_empty() {
                    actions.push(CliAction::WriteInput(filtered.data));
                }
                actions
            }
            AppMessage::TerminalResize { cols, rows } => {
                self.set_terminal_size(cols, rows);
                vec![CliAction::Resize { cols, rows }]
            }
            AppMessage::StateRequest => {
                let sync = self.state_sync();
                match self.seal(sync) {
                    Ok(frame) => vec![CliAction::Send(frame)],
                    Err(err) => vec![CliAction::Failed {
                        code: err.code(),
                        message: err.to_string(),
                    }],
                }
            }
            AppMessage::TerminalOutput { .. }
            | AppMessage::StateSync { .. }
            | AppMessage::SessionKey { .. } => {
                debug!(session = %self.session_id, kind, "ignoring viewer-bound message");
                Vec::new()
            }
        }
    }

    fn handle_error(&mut self, code: ErrorCode, message: String) -> Vec<CliAction> {
        match (self.phase, code) {
            (CliPhase::Registering, ErrorCode::InvalidMessage)
                if !self.registered && message.contains("already exists") =>
            {
                let previous = std::mem::replace(&mut self.session_id, generate_session_id());
                info!(%previous, session = %self.session_id, "session id collision; retrying");
                vec![CliAction::Send(self.connect())]
            }
            (CliPhase::Registering, ErrorCode::SessionNotFound) if self.registered => {
                let previous = std::mem::replace(&mut self.session_id, generate_session_id());
                self.registered = false;
                warn!(
                    %previous,
                    session = %self.session_id,
                    "session expired on relay; creating a new one"
                );
                vec![
                    CliAction::SessionReplaced {
                        previous,
                        session_id: self.session_id.clone(),
                    },
                    CliAction::Send(self.connect()),
                ]
            }
            _ => vec![CliAction::Failed { code, message }],
        }
    }

    fn viewer_phase(&self) -> CliPhase {
        if self.channel.peer_count() == 0 {
            CliPhase::Waiting
        } else {
            CliPhase::Paired
        }
    }

    /// Pair with a viewer and seal the session key for it alone.
    fn admit_viewer(
        &mut self,
        connection_id: &str,
        public_key: &str,
    ) -> Result<ClientMessage, SecureError> {
        self.channel.set_peer(connection_id, public_key)?;
        let key = self
            .channel
            .session_key()
            .ok_or(SecureError::ChannelNotEstablished)?
            .to_base64();
        self.seq += 1;
        let message = AppMessage::SessionKey { key }.into_secure(self.seq);
        let envelope = self
            .channel
            .seal_for(connection_id, &message, &self.session_id)?;
        Ok(ClientMessage::Encrypted(envelope))
    }

    fn state_sync(&self) -> AppMessage {
        AppMessage::StateSync {
            cols: self.terminal.cols,
            rows: self.terminal.rows,
            has_history: self.terminal.has_history,
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
