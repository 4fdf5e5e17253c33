//! Firebase REST backends for the SchoolHub session core.
//!
//! `FirebaseAuth` implements [`IdentityProvider`](schoolhub_types::IdentityProvider)
//! against Identity Toolkit and Secure Token; `Firestore` implements
//! [`DocumentStore`](schoolhub_types::DocumentStore) against the Firestore v1 API.

pub mod credentials;
pub mod firestore;
pub mod identity_toolkit;
pub mod shared;

pub use credentials::StoredSession;
pub use firestore::{Firestore, FirestoreConfig, TokenSource};
pub use identity_toolkit::{FirebaseAuth, FirebaseAuthConfig};
