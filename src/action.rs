use serde::{Deserialize, Serialize};

/// Kind of user action under evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Edit,
    CreateAccount,
    Move,
    Delete,
    Upload,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Edit => "edit",
            ActionKind::CreateAccount => "createaccount",
            ActionKind::Move => "move",
            ActionKind::Delete => "delete",
            ActionKind::Upload => "upload",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "edit" => Some(ActionKind::Edit),
            "createaccount" => Some(ActionKind::CreateAccount),
            "move" => Some(ActionKind::Move),
            "delete" => Some(ActionKind::Delete),
            "upload" => Some(ActionKind::Upload),
            _ => None,
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One in-flight user action: the subject every filter in a run is
/// evaluated against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEvent {
    pub kind: ActionKind,
    /// Acting user name.
    pub actor: String,
    /// Target of the action (page title, new account name, file name).
    pub target: String,
    /// Filter group consulted for this action.
    pub group: String,
    /// Session identifier, when the host has one; used to remember which
    /// warnings were already shown.
    pub session: Option<String>,
    /// Request IP, when known; used as a throttle dimension.
    pub ip: Option<String>,
}

impl ActionEvent {
    pub fn new(kind: ActionKind, actor: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind,
            actor: actor.into(),
            target: target.into(),
            group: "default".to_string(),
            session: None,
            ip: None,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }
}
