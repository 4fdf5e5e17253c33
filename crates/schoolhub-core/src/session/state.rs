//! Observable session state.

use std::fmt;

use schoolhub_types::EffectiveUser;

/// Authentication lifecycle state. Exactly one is live per manager.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SessionState {
    /// Before the provider's first notification.
    #[default]
    Unknown,
    /// The first notification is being reconciled.
    Authenticating,
    Authenticated(EffectiveUser),
    Unauthenticated,
    /// The notification stream failed; no further transitions will happen.
    Error(String),
}

impl SessionState {
    /// False until the first notification has been reconciled.
    pub fn is_loaded(&self) -> bool {
        !matches!(self, SessionState::Unknown | SessionState::Authenticating)
    }

    pub fn user(&self) -> Option<&EffectiveUser> {
        match self {
            SessionState::Authenticated(user) => Some(user),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionState::Authenticated(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Unknown => write!(f, "unknown"),
            SessionState::Authenticating => write!(f, "authenticating"),
            SessionState::Authenticated(user) => write!(f, "authenticated as {}", user.label()),
            SessionState::Unauthenticated => write!(f, "unauthenticated"),
            SessionState::Error(message) => write!(f, "error: {message}"),
        }
    }
}

/// What readers observe: the state plus the most recent error message.
///
/// The error slot is cleared when a caller operation starts and set by failed
/// operations, failed reconciliations and failed best-effort writes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub error: Option<String>,
}

impl SessionSnapshot {
    pub fn user(&self) -> Option<&EffectiveUser> {
        self.state.user()
    }

    pub fn is_loading(&self) -> bool {
        !self.state.is_loaded()
    }
}
