//! Contracts for the two managed backends (identity provider, document store).

use std::fmt;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::identity::Identity;
use crate::profile::{Document, Fields};

/// Categories of backend errors for consistent error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    /// Requested record does not exist
    NotFound,
    /// The backend refused the request (bad credentials, email in use, weak password)
    Rejected,
    /// HTTP status error (4xx, 5xx) without a recognised error code
    HttpStatus,
    /// Connection timeout or request timeout
    Timeout,
    /// Failed to parse a response
    Parse,
    /// Backend unreachable
    Unavailable,
    /// Anything else (including local state problems)
    Internal,
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendErrorKind::NotFound => write!(f, "not_found"),
            BackendErrorKind::Rejected => write!(f, "rejected"),
            BackendErrorKind::HttpStatus => write!(f, "http_status"),
            BackendErrorKind::Timeout => write!(f, "timeout"),
            BackendErrorKind::Parse => write!(f, "parse"),
            BackendErrorKind::Unavailable => write!(f, "unavailable"),
            BackendErrorKind::Internal => write!(f, "internal"),
        }
    }
}

/// Structured error from a backend with kind and details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendError {
    /// Error category
    pub kind: BackendErrorKind,
    /// One-line summary suitable for display
    pub message: String,
    /// Optional additional details (e.g., raw error body)
    pub details: Option<String>,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::NotFound, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Rejected, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Internal, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == BackendErrorKind::NotFound
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for BackendError {}

/// Result type for backend operations.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Stream of authentication-state notifications.
///
/// The first item is the state at subscription time; `None` means signed out.
pub type AuthStateStream = BoxStream<'static, Option<Identity>>;

/// Managed authentication service.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Creates an identity and signs it in.
    async fn create_identity(&self, email: &str, password: &str) -> BackendResult<Identity>;

    /// Signs in with email and password.
    async fn authenticate(&self, email: &str, password: &str) -> BackendResult<Identity>;

    async fn sign_out(&self) -> BackendResult<()>;

    async fn send_reset_email(&self, email: &str) -> BackendResult<()>;

    async fn send_verification_email(&self, identity: &Identity) -> BackendResult<()>;

    async fn set_display_name(&self, identity: &Identity, name: &str) -> BackendResult<()>;

    /// Deletes an identity. Only used to compensate a failed registration.
    async fn delete_identity(&self, identity: &Identity) -> BackendResult<()>;

    async fn update_password(&self, identity: &Identity, new_password: &str) -> BackendResult<()>;

    /// Subscribes to sign-in/sign-out notifications. Dropping the stream unsubscribes.
    fn subscribe(&self) -> AuthStateStream;
}

/// Managed document database.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetches a document; `Ok(None)` when it does not exist.
    async fn get(&self, collection: &str, id: &str) -> BackendResult<Option<Document>>;

    /// Creates or replaces a document.
    async fn set(&self, collection: &str, id: &str, fields: Fields) -> BackendResult<()>;

    /// Merges fields into an existing document. Fails with `NotFound` if it is missing.
    async fn update(&self, collection: &str, id: &str, fields: Fields) -> BackendResult<()>;
}
