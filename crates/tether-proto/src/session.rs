use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};

/// Length of a human-typable session identifier.
pub const SESSION_ID_LEN: usize = 6;

/// Identity attached to connections that presented no credential.
pub const ANONYMOUS_USER: &str = "anonymous";

/// Which side of a session a transport connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Cli,
    Web,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Cli => "cli",
            Role::Web => "web",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "cli" => Ok(Role::Cli),
            "web" => Ok(Role::Web),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// Cached summary of who is attached to a session.
///
/// The value is always recomputable from the CLI connection id and the set of
/// web connection ids; `Pending` and `Paused` differ only in whether a viewer
/// has ever been attached since the CLI (re)registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Active,
    Paused,
    Closed,
}

impl SessionStatus {
    pub fn derive(cli_attached: bool, viewers: usize, previous: SessionStatus) -> Self {
        if !cli_attached {
            SessionStatus::Closed
        } else if viewers > 0 {
            SessionStatus::Active
        } else if previous == SessionStatus::Pending {
            SessionStatus::Pending
        } else {
            SessionStatus::Paused
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(SessionStatus::Pending),
            "active" => Ok(SessionStatus::Active),
            "paused" => Ok(SessionStatus::Paused),
            "closed" => Ok(SessionStatus::Closed),
            other => Err(format!("unknown session status '{other}'")),
        }
    }
}

/// Descriptive fields the CLI may attach after creation. Presentation only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_url: Option<String>,
}

impl SessionMetadata {
    /// Overwrites every field that is present in `update`.
    pub fn merge(&mut self, update: &SessionMetadata) {
        if let Some(value) = &update.instance_id {
            self.instance_id = Some(value.clone());
        }
        if let Some(value) = &update.instance_label {
            self.instance_label = Some(value.clone());
        }
        if let Some(value) = &update.hostname {
            self.hostname = Some(value.clone());
        }
        if let Some(value) = &update.command {
            self.command = Some(value.clone());
        }
        if let Some(value) = &update.command_args {
            self.command_args = Some(value.clone());
        }
        if let Some(value) = &update.web_url {
            self.web_url = Some(value.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &SessionMetadata::default()
    }
}

/// Session entry returned by listing and info requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub status: SessionStatus,
    pub created_at: u64,
    pub last_active_at: u64,
    pub cli_connected: bool,
    pub viewer_count: usize,
    #[serde(flatten)]
    pub metadata: SessionMetadata,
}

/// Generate a six character uppercase alphanumeric session id.
pub fn generate_session_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .map(|c| char::from(c).to_ascii_uppercase())
        .take(SESSION_ID_LEN)
        .collect()
}

pub fn is_valid_session_id(candidate: &str) -> bool {
    candidate.len() == SESSION_ID_LEN
        && candidate
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}
