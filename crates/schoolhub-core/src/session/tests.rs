use std::sync::{Arc, Mutex};
use std::time::Duration;

use schoolhub_types::{BackendError, FieldValue, Fields, Identity, ProfileUpdate};

use super::*;
use crate::memory::{IdentityOp, MailKind, MemoryDocumentStore, MemoryIdentityProvider, StoreOp};

const TIMEOUT: Duration = Duration::from_secs(2);

struct Harness {
    provider: Arc<MemoryIdentityProvider>,
    store: Arc<MemoryDocumentStore>,
    session: SessionManager,
}

impl Harness {
    fn start(provider: MemoryIdentityProvider, store: MemoryDocumentStore) -> Self {
        let provider = Arc::new(provider);
        let store = Arc::new(store);
        let session = SessionManager::start(
            Arc::clone(&provider) as Arc<dyn IdentityProvider>,
            Arc::clone(&store) as Arc<dyn DocumentStore>,
            SessionOptions::default(),
        );
        Self {
            provider,
            store,
            session,
        }
    }

    fn empty() -> Self {
        Self::start(MemoryIdentityProvider::new(), MemoryDocumentStore::new())
    }

    async fn settle<F>(&self, predicate: F) -> SessionSnapshot
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        tokio::time::timeout(TIMEOUT, self.session.wait_for(predicate))
            .await
            .expect("session did not reach the expected state")
    }

    fn profile(&self, uid: &str) -> Option<Fields> {
        self.store
            .document(Profile::DEFAULT_COLLECTION, uid)
            .map(|doc| doc.fields)
    }
}

async fn eventually<F: FnMut() -> bool>(mut condition: F) {
    tokio::time::timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

/// A registered, signed-out account with a stored profile.
fn seeded(verified_identity: bool, verified_profile: bool) -> (MemoryIdentityProvider, MemoryDocumentStore) {
    let provider = MemoryIdentityProvider::new();
    provider.insert_account(
        Identity::new("u1", "a@x.com")
            .with_display_name("alice")
            .verified(verified_identity),
        "Secret123",
    );
    let store = MemoryDocumentStore::new();
    let mut fields = Profile::registration_fields("u1", "alice", "a@x.com", "555-0100");
    fields.insert(field::EMAIL_VERIFIED.into(), FieldValue::Bool(verified_profile));
    store.insert(Profile::DEFAULT_COLLECTION, "u1", fields);
    (provider, store)
}

fn is_authenticated(snapshot: &SessionSnapshot) -> bool {
    snapshot.state.is_authenticated()
}

#[tokio::test]
async fn test_starts_unauthenticated_without_identity() {
    let h = Harness::empty();
    let snapshot = tokio::time::timeout(TIMEOUT, h.session.wait_until_loaded())
        .await
        .unwrap();
    assert_eq!(snapshot.state, SessionState::Unauthenticated);
    assert_eq!(snapshot.error, None);
}

#[tokio::test]
async fn test_register_creates_profile_and_merges() {
    let h = Harness::empty();
    let credential = h
        .session
        .register("a@x.com", "Secret123", "alice", "555-0100")
        .await
        .unwrap();
    assert!(credential.is_new_user);
    let uid = credential.identity.uid.clone();

    let fields = h.profile(&uid).expect("profile document");
    assert_eq!(fields.get(field::ROLE), Some(&FieldValue::from("user")));
    assert_eq!(fields.get(field::EMAIL_VERIFIED), Some(&FieldValue::Bool(false)));
    assert_eq!(fields.get(field::UID), Some(&FieldValue::from(uid.as_str())));
    assert_eq!(fields.get(field::PHONE), Some(&FieldValue::from("555-0100")));
    assert!(matches!(fields.get(field::JOINED_AT), Some(FieldValue::Timestamp(_))));

    let snapshot = h
        .settle(|s| s.user().is_some_and(|u| u.has_profile))
        .await;
    let user = snapshot.user().unwrap();
    assert_eq!(user.uid, uid);
    assert_eq!(user.username.as_deref(), Some("alice"));
    assert_eq!(user.display_name.as_deref(), Some("alice"));
    assert_eq!(user.role.as_deref(), Some("user"));
    assert!(!user.email_verified);

    h.session.drain_background().await;
    assert!(
        h.provider
            .outbox()
            .iter()
            .any(|m| m.kind == MailKind::VerifyEmail && m.email == "a@x.com")
    );
}

#[tokio::test]
async fn test_register_succeeds_when_verification_mail_fails() {
    let h = Harness::empty();
    h.provider.fail_next(
        IdentityOp::SendVerification,
        BackendError::unavailable("mail relay down"),
    );

    let credential = h
        .session
        .register("a@x.com", "Secret123", "alice", "555-0100")
        .await
        .unwrap();
    h.session.drain_background().await;

    let uid = credential.identity.uid;
    assert!(h.provider.exists(&uid));
    assert!(h.profile(&uid).is_some());
    assert!(h.provider.outbox().is_empty());

    let snapshot = h
        .settle(|s| s.user().is_some_and(|u| u.has_profile))
        .await;
    assert_eq!(snapshot.error, None);
}

#[tokio::test]
async fn test_register_profile_failure_deletes_identity() {
    let h = Harness::empty();
    h.store
        .fail_next(StoreOp::Set, BackendError::unavailable("firestore unavailable"));

    let err = h
        .session
        .register("a@x.com", "Secret123", "alice", "555-0100")
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::ProfileCreation { .. }));
    assert!(err.compensation().is_some_and(Compensation::is_complete));
    assert_eq!(h.provider.account_count(), 0);
    assert!(h.store.is_empty());

    let snapshot = h.settle(|s| s.state == SessionState::Unauthenticated).await;
    let message = snapshot.error.expect("error recorded");
    assert!(message.starts_with("Failed to create user profile"));
}

#[tokio::test]
async fn test_register_reports_failed_rollback() {
    let h = Harness::empty();
    h.store
        .fail_next(StoreOp::Set, BackendError::unavailable("firestore unavailable"));
    h.provider
        .fail_next(IdentityOp::Delete, BackendError::unavailable("auth unavailable"));

    let err = h
        .session
        .register("a@x.com", "Secret123", "alice", "555-0100")
        .await
        .unwrap_err();
    assert!(matches!(
        err.compensation(),
        Some(Compensation::DeleteFailed(e)) if e.message == "auth unavailable"
    ));
    assert!(err.to_string().contains("account rollback failed"));
    assert_eq!(h.provider.account_count(), 1);
}

#[tokio::test]
async fn test_register_display_name_failure_deletes_identity() {
    let h = Harness::empty();
    h.provider
        .fail_next(IdentityOp::SetDisplayName, BackendError::unavailable("timeout"));

    let err = h
        .session
        .register("a@x.com", "Secret123", "alice", "555-0100")
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::DisplayName { .. }));
    assert!(err.compensation().is_some_and(Compensation::is_complete));
    assert!(h.provider.identity_by_email("a@x.com").is_none());
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_register_surfaces_provider_rejection_verbatim() {
    let h = Harness::empty();
    h.session
        .register("a@x.com", "Secret123", "alice", "555-0100")
        .await
        .unwrap();

    let err = h
        .session
        .register("a@x.com", "Other1234", "bob", "555-0101")
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::IdentityCreation(_)));
    assert_eq!(err.to_string(), "EMAIL_EXISTS");
    assert_eq!(h.session.snapshot().error.as_deref(), Some("EMAIL_EXISTS"));

    let err = h
        .session
        .register("b@x.com", "123", "bob", "555-0101")
        .await
        .unwrap_err();
    assert!(err.to_string().starts_with("WEAK_PASSWORD"));
    assert_eq!(h.provider.account_count(), 1);
    assert_eq!(h.store.len(), 1);
}

#[tokio::test]
async fn test_login_rejects_bad_password() {
    let (provider, store) = seeded(false, false);
    let h = Harness::start(provider, store);

    let err = h.session.login("a@x.com", "wrong").await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidCredentials(_)));
    assert_eq!(err.to_string(), "INVALID_LOGIN_CREDENTIALS");
    assert_eq!(
        h.session.snapshot().error.as_deref(),
        Some("INVALID_LOGIN_CREDENTIALS")
    );
}

#[tokio::test]
async fn test_verified_login_mirrors_flag() {
    let (provider, store) = seeded(true, false);
    let h = Harness::start(provider, store);

    let credential = h.session.login("a@x.com", "Secret123").await.unwrap();
    assert!(!credential.is_new_user);

    let snapshot = h.settle(is_authenticated).await;
    assert!(snapshot.user().unwrap().email_verified);

    let store = Arc::clone(&h.store);
    eventually(|| {
        store
            .document(Profile::DEFAULT_COLLECTION, "u1")
            .and_then(|d| d.get(field::EMAIL_VERIFIED).and_then(FieldValue::as_bool))
            == Some(true)
    })
    .await;
}

#[tokio::test]
async fn test_restored_verified_identity_mirrors_flag() {
    let (provider, store) = seeded(true, false);
    provider.authenticate("a@x.com", "Secret123").await.unwrap();
    let h = Harness::start(provider, store);

    let snapshot = h.settle(is_authenticated).await;
    assert!(snapshot.user().unwrap().email_verified);

    let store = Arc::clone(&h.store);
    eventually(|| {
        store
            .document(Profile::DEFAULT_COLLECTION, "u1")
            .and_then(|d| d.get(field::EMAIL_VERIFIED).and_then(FieldValue::as_bool))
            == Some(true)
    })
    .await;
}

#[tokio::test]
async fn test_login_succeeds_when_mirror_write_fails() {
    let (provider, store) = seeded(true, false);
    store.fail_always(StoreOp::Update, BackendError::unavailable("write denied"));
    let h = Harness::start(provider, store);

    h.session.login("a@x.com", "Secret123").await.unwrap();

    let snapshot = h
        .settle(|s| s.state.is_authenticated() && s.error.is_some())
        .await;
    assert_eq!(
        snapshot.error.as_deref(),
        Some("Error updating email verification status: write denied")
    );
    assert!(snapshot.user().unwrap().email_verified);
}

#[tokio::test]
async fn test_unverified_login_leaves_flag_alone() {
    let (provider, store) = seeded(false, false);
    let h = Harness::start(provider, store);

    h.session.login("a@x.com", "Secret123").await.unwrap();
    let snapshot = h.settle(is_authenticated).await;
    assert!(!snapshot.user().unwrap().email_verified);
    assert_eq!(
        h.profile("u1").unwrap().get(field::EMAIL_VERIFIED),
        Some(&FieldValue::Bool(false))
    );
}

#[tokio::test]
async fn test_mirrored_flag_is_never_reverted() {
    // Profile already says verified while the provider still reports false.
    let (provider, store) = seeded(false, true);
    let h = Harness::start(provider, store);

    h.session.login("a@x.com", "Secret123").await.unwrap();
    let snapshot = h.settle(is_authenticated).await;
    assert!(snapshot.user().unwrap().email_verified);
    assert_eq!(
        h.profile("u1").unwrap().get(field::EMAIL_VERIFIED),
        Some(&FieldValue::Bool(true))
    );
}

#[tokio::test]
async fn test_restored_identity_loads_authenticated() {
    let (provider, store) = seeded(false, false);
    provider.authenticate("a@x.com", "Secret123").await.unwrap();
    let h = Harness::start(provider, store);

    let snapshot = tokio::time::timeout(TIMEOUT, h.session.wait_until_loaded())
        .await
        .unwrap();
    let user = snapshot.user().expect("signed in");
    assert!(user.has_profile);
    assert_eq!(user.label(), "alice");
}

#[tokio::test]
async fn test_missing_profile_degrades_to_identity() {
    let provider = MemoryIdentityProvider::new();
    provider.insert_account(Identity::new("u2", "b@x.com"), "Secret123");
    let h = Harness::start(provider, MemoryDocumentStore::new());

    h.session.login("b@x.com", "Secret123").await.unwrap();
    let snapshot = h.settle(is_authenticated).await;
    let user = snapshot.user().unwrap();
    assert!(!user.has_profile);
    assert_eq!(user.role, None);
    assert_eq!(snapshot.error, None);
}

#[tokio::test]
async fn test_duplicate_notifications_are_idempotent() {
    let (provider, store) = seeded(false, false);
    provider.authenticate("a@x.com", "Secret123").await.unwrap();
    let h = Harness::start(provider, store);
    let loaded = h.settle(is_authenticated).await;
    let before = h.profile("u1");

    let observed = Arc::new(Mutex::new(Vec::new()));
    let mut rx = h.session.subscribe();
    let sink = Arc::clone(&observed);
    let watcher = tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let state = rx.borrow_and_update().state.clone();
            sink.lock().unwrap().push(state);
        }
    });

    let identity = h.provider.current().unwrap();
    h.provider.emit(Some(identity.clone()));
    h.provider.emit(Some(identity));
    h.provider.emit(None);
    h.settle(|s| s.state == SessionState::Unauthenticated).await;

    assert_eq!(h.profile("u1"), before);
    assert!(loaded.user().unwrap().has_profile);
    let states = observed.lock().unwrap().clone();
    assert!(!states.contains(&SessionState::Authenticating));
    assert!(!states.contains(&SessionState::Unknown));
    watcher.abort();
}

#[tokio::test]
async fn test_fetch_failure_without_cache_is_unauthenticated() {
    let (provider, store) = seeded(false, false);
    provider.authenticate("a@x.com", "Secret123").await.unwrap();
    store.fail_next(StoreOp::Get, BackendError::unavailable("read denied"));
    let h = Harness::start(provider, store);

    let snapshot = tokio::time::timeout(TIMEOUT, h.session.wait_until_loaded())
        .await
        .unwrap();
    assert_eq!(snapshot.state, SessionState::Unauthenticated);
    assert_eq!(
        snapshot.error.as_deref(),
        Some("Error in auth state change: read denied")
    );
}

#[tokio::test]
async fn test_fetch_failure_with_cache_keeps_identity() {
    let (provider, store) = seeded(false, false);
    provider.authenticate("a@x.com", "Secret123").await.unwrap();
    let h = Harness::start(provider, store);
    h.settle(|s| s.user().is_some_and(|u| u.has_profile)).await;

    h.store
        .fail_next(StoreOp::Get, BackendError::unavailable("read denied"));
    h.provider.emit(h.provider.current());

    let snapshot = h.settle(|s| s.error.is_some()).await;
    let user = snapshot.user().expect("still signed in");
    assert_eq!(user.uid, "u1");
    assert!(!user.has_profile);
}

#[tokio::test]
async fn test_stream_close_publishes_error() {
    let h = Harness::empty();
    h.session.wait_until_loaded().await;

    h.provider.close_subscribers();
    let snapshot = h
        .settle(|s| matches!(s.state, SessionState::Error(_)))
        .await;
    assert_eq!(
        snapshot.state,
        SessionState::Error("auth state stream closed".into())
    );
}

#[tokio::test]
async fn test_reset_password() {
    let (provider, store) = seeded(false, false);
    let h = Harness::start(provider, store);

    h.session.reset_password("a@x.com").await.unwrap();
    assert!(
        h.provider
            .outbox()
            .iter()
            .any(|m| m.kind == MailKind::PasswordReset && m.email == "a@x.com")
    );

    let err = h.session.reset_password("nobody@x.com").await.unwrap_err();
    assert!(matches!(err, AuthError::ResetRequest(_)));
    assert_eq!(err.to_string(), "EMAIL_NOT_FOUND");
}

#[tokio::test]
async fn test_change_password() {
    let (provider, store) = seeded(false, false);
    let h = Harness::start(provider, store);
    h.session.wait_until_loaded().await;

    let err = h.session.change_password("abc123", "abc124").await.unwrap_err();
    assert!(matches!(err, AuthError::PasswordMismatch));
    let err = h.session.change_password("abc123", "abc123").await.unwrap_err();
    assert!(matches!(err, AuthError::NotAuthenticated));

    h.session.login("a@x.com", "Secret123").await.unwrap();
    h.settle(is_authenticated).await;
    h.session
        .change_password("NewSecret1", "NewSecret1")
        .await
        .unwrap();
    assert_eq!(h.session.snapshot().error, None);

    h.session.logout().await.unwrap();
    h.settle(|s| s.state == SessionState::Unauthenticated).await;
    h.session.login("a@x.com", "NewSecret1").await.unwrap();
}

#[tokio::test]
async fn test_update_profile() {
    let (provider, store) = seeded(false, false);
    let h = Harness::start(provider, store);
    h.session.login("a@x.com", "Secret123").await.unwrap();
    h.settle(is_authenticated).await;

    let err = h
        .session
        .update_profile(ProfileUpdate::new().field("role", "admin"))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::ReservedField(ref key) if key == "role"));
    assert_eq!(
        h.profile("u1").unwrap().get(field::ROLE),
        Some(&FieldValue::from("user"))
    );

    h.session
        .update_profile(ProfileUpdate::new().phone("555-0199").field("age", 12_i64))
        .await
        .unwrap();
    let snapshot = h
        .settle(|s| s.user().is_some_and(|u| u.extra.contains_key("age")))
        .await;
    let user = snapshot.user().unwrap();
    assert_eq!(user.phone.as_deref(), Some("555-0199"));
    assert_eq!(user.extra.get("age"), Some(&FieldValue::Integer(12)));
    assert_eq!(snapshot.error, None);
}

#[tokio::test]
async fn test_profile_operations_require_sign_in() {
    let h = Harness::empty();
    h.session.wait_until_loaded().await;

    let err = h.session.fetch_profile().await.unwrap_err();
    assert!(matches!(err, AuthError::NotAuthenticated));
    let err = h
        .session
        .update_profile(ProfileUpdate::new().username("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::NotAuthenticated));
}

#[tokio::test]
async fn test_fetch_profile() {
    let (provider, store) = seeded(false, false);
    let h = Harness::start(provider, store);
    h.session.login("a@x.com", "Secret123").await.unwrap();
    h.settle(is_authenticated).await;

    let profile = h.session.fetch_profile().await.unwrap().unwrap();
    assert_eq!(profile.username, "alice");
    assert_eq!(profile.role, "user");

    h.store
        .fail_next(StoreOp::Get, BackendError::unavailable("read denied"));
    let err = h.session.fetch_profile().await.unwrap_err();
    assert_eq!(err.to_string(), "Error fetching user info: read denied");
}

#[tokio::test]
async fn test_logout() {
    let (provider, store) = seeded(false, false);
    let h = Harness::start(provider, store);
    h.session.login("a@x.com", "Secret123").await.unwrap();
    h.settle(is_authenticated).await;

    h.provider
        .fail_next(IdentityOp::SignOut, BackendError::unavailable("offline"));
    let err = h.session.logout().await.unwrap_err();
    assert!(matches!(err, AuthError::SignOut(_)));
    assert!(h.session.snapshot().state.is_authenticated());

    h.session.logout().await.unwrap();
    let snapshot = h.settle(|s| s.state == SessionState::Unauthenticated).await;
    assert_eq!(snapshot.error, None);
    assert!(h.session.current_user().is_none());
}

#[tokio::test]
async fn test_install_rejects_second_manager() {
    let first = Harness::empty();
    let second = Harness::empty();

    let installed = install(first.session).unwrap_or_else(|_| panic!("first install"));
    assert!(std::ptr::eq(installed, global().unwrap()));
    assert!(install(second.session).is_err());
}
