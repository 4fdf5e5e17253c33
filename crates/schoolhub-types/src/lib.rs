//! Shared domain types for SchoolHub (identities, profiles, backend contracts).

pub mod backend;
pub mod identity;
pub mod profile;
pub mod user;

pub use backend::{
    AuthStateStream, BackendError, BackendErrorKind, BackendResult, DocumentStore,
    IdentityProvider,
};
pub use identity::{Identity, UserCredential};
pub use profile::{Document, FieldValue, Fields, Profile, ProfileUpdate};
pub use user::EffectiveUser;
