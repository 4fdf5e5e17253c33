//! Errors returned by session operations.

use std::fmt;

use schoolhub_types::BackendError;
use thiserror::Error;

/// Outcome of deleting an identity after a later registration step failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    IdentityDeleted,
    /// The identity may still exist without a profile.
    DeleteFailed(BackendError),
}

impl Compensation {
    pub fn is_complete(&self) -> bool {
        matches!(self, Compensation::IdentityDeleted)
    }
}

impl fmt::Display for Compensation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compensation::IdentityDeleted => write!(f, "account rolled back"),
            Compensation::DeleteFailed(err) => write!(f, "account rollback failed: {err}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    /// Provider refused to create the identity (email in use, weak password).
    #[error(transparent)]
    IdentityCreation(BackendError),

    #[error("Failed to set display name: {cause} ({compensation})")]
    DisplayName {
        cause: BackendError,
        compensation: Compensation,
    },

    #[error("Failed to create user profile. Please try again. ({compensation}; {cause})")]
    ProfileCreation {
        cause: BackendError,
        compensation: Compensation,
    },

    #[error(transparent)]
    InvalidCredentials(BackendError),

    #[error(transparent)]
    SignOut(BackendError),

    #[error(transparent)]
    ResetRequest(BackendError),

    /// Background reconciliation failure; recorded, never returned to callers.
    #[error("Error in auth state change: {0}")]
    Reconciliation(BackendError),

    #[error("Not signed in")]
    NotAuthenticated,

    #[error("Passwords do not match")]
    PasswordMismatch,

    #[error("Error updating password: {0}")]
    PasswordUpdate(BackendError),

    #[error("Error fetching user info: {0}")]
    ProfileFetch(BackendError),

    #[error("Error updating user info: {0}")]
    ProfileUpdate(BackendError),

    #[error("Field '{0}' cannot be edited")]
    ReservedField(String),
}

impl AuthError {
    /// The backend failure behind this error, if any.
    pub fn backend(&self) -> Option<&BackendError> {
        match self {
            AuthError::IdentityCreation(err)
            | AuthError::InvalidCredentials(err)
            | AuthError::SignOut(err)
            | AuthError::ResetRequest(err)
            | AuthError::Reconciliation(err)
            | AuthError::PasswordUpdate(err)
            | AuthError::ProfileFetch(err)
            | AuthError::ProfileUpdate(err)
            | AuthError::DisplayName { cause: err, .. }
            | AuthError::ProfileCreation { cause: err, .. } => Some(err),
            AuthError::NotAuthenticated
            | AuthError::PasswordMismatch
            | AuthError::ReservedField(_) => None,
        }
    }

    /// Compensation outcome for failed registrations.
    pub fn compensation(&self) -> Option<&Compensation> {
        match self {
            AuthError::DisplayName { compensation, .. }
            | AuthError::ProfileCreation { compensation, .. } => Some(compensation),
            _ => None,
        }
    }
}
