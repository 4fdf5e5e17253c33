//! Identity records owned by the authentication provider.

use serde::{Deserialize, Serialize};

/// The provider's view of a user.
///
/// The password never leaves the provider; only the flags the session core
/// reacts to are carried here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Immutable provider-assigned id (also the profile document id).
    pub uid: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Live verification flag as reported by the provider.
    #[serde(default)]
    pub email_verified: bool,
}

impl Identity {
    pub fn new(uid: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            email: email.into(),
            display_name: None,
            email_verified: false,
        }
    }

    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn verified(mut self, verified: bool) -> Self {
        self.email_verified = verified;
        self
    }
}

/// Result of a successful sign-up or sign-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCredential {
    pub identity: Identity,
    /// True when the identity was created by this call.
    pub is_new_user: bool,
}

impl UserCredential {
    pub fn sign_in(identity: Identity) -> Self {
        Self {
            identity,
            is_new_user: false,
        }
    }

    pub fn sign_up(identity: Identity) -> Self {
        Self {
            identity,
            is_new_user: true,
        }
    }
}
