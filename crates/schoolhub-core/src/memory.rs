//! In-process backends.
//!
//! `MemoryIdentityProvider` and `MemoryDocumentStore` follow the managed
//! backend's observable behaviour closely enough to drive a
//! [`SessionManager`](crate::session::SessionManager) without network access:
//! creating an identity signs it in, signing out or deleting the signed-in
//! identity emits `None`, and every subscriber first receives the current state.
//! Each operation can be made to fail on demand.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use futures_util::stream;
use schoolhub_types::{
    AuthStateStream, BackendError, BackendResult, Document, DocumentStore, FieldValue, Fields,
    Identity, IdentityProvider,
};
use tokio::sync::mpsc;

/// Shortest password the in-memory provider accepts.
pub const MIN_PASSWORD_LEN: usize = 6;

/// Failure schedule for one operation.
#[derive(Debug, Clone)]
struct Failure {
    error: BackendError,
    /// `None` fails every call until cleared.
    remaining: Option<usize>,
}

#[derive(Debug)]
struct FailurePlan<Op> {
    failures: HashMap<Op, Failure>,
}

impl<Op> Default for FailurePlan<Op> {
    fn default() -> Self {
        Self {
            failures: HashMap::new(),
        }
    }
}

impl<Op: Copy + Eq + std::hash::Hash> FailurePlan<Op> {
    fn set(&mut self, op: Op, error: BackendError, remaining: Option<usize>) {
        self.failures.insert(op, Failure { error, remaining });
    }

    fn check(&mut self, op: Op) -> BackendResult<()> {
        let Some(failure) = self.failures.get_mut(&op) else {
            return Ok(());
        };
        let error = failure.error.clone();
        let exhausted = match &mut failure.remaining {
            Some(n) => {
                *n -= 1;
                *n == 0
            }
            None => false,
        };
        if exhausted {
            self.failures.remove(&op);
        }
        Err(error)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Identity provider operations that can be scheduled to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityOp {
    Create,
    Authenticate,
    SignOut,
    SendReset,
    SendVerification,
    SetDisplayName,
    Delete,
    UpdatePassword,
}

/// Kind of message recorded in the outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailKind {
    PasswordReset,
    VerifyEmail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    pub kind: MailKind,
    pub email: String,
}

#[derive(Debug, Clone)]
struct Account {
    identity: Identity,
    password: String,
}

#[derive(Debug, Default)]
struct ProviderState {
    /// Keyed by uid.
    accounts: HashMap<String, Account>,
    current: Option<String>,
    subscribers: Vec<mpsc::UnboundedSender<Option<Identity>>>,
    failures: FailurePlan<IdentityOp>,
    outbox: Vec<SentMail>,
}

impl ProviderState {
    fn find_by_email(&self, email: &str) -> Option<&Account> {
        self.accounts
            .values()
            .find(|a| a.identity.email.eq_ignore_ascii_case(email))
    }

    fn current_identity(&self) -> Option<Identity> {
        let uid = self.current.as_ref()?;
        self.accounts.get(uid).map(|a| a.identity.clone())
    }

    fn emit(&mut self, identity: Option<Identity>) {
        self.subscribers
            .retain(|tx| tx.send(identity.clone()).is_ok());
    }

    fn account_mut(&mut self, uid: &str) -> BackendResult<&mut Account> {
        self.accounts
            .get_mut(uid)
            .ok_or_else(|| BackendError::not_found("USER_NOT_FOUND"))
    }
}

/// Identity provider kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryIdentityProvider {
    state: Mutex<ProviderState>,
}

impl MemoryIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an account without signing it in or notifying subscribers.
    pub fn insert_account(&self, identity: Identity, password: &str) {
        lock(&self.state).accounts.insert(
            identity.uid.clone(),
            Account {
                identity,
                password: password.to_string(),
            },
        );
    }

    /// Fails the next call to `op`.
    pub fn fail_next(&self, op: IdentityOp, error: BackendError) {
        lock(&self.state).failures.set(op, error, Some(1));
    }

    /// Fails every call to `op` until [`clear_failures`](Self::clear_failures).
    pub fn fail_always(&self, op: IdentityOp, error: BackendError) {
        lock(&self.state).failures.set(op, error, None);
    }

    pub fn clear_failures(&self) {
        lock(&self.state).failures = FailurePlan::default();
    }

    /// Flips the verification flag, as following the emailed link would.
    pub fn mark_verified(&self, email: &str) -> bool {
        let mut state = lock(&self.state);
        let uid = match state.find_by_email(email) {
            Some(account) => account.identity.uid.clone(),
            None => return false,
        };
        if let Some(account) = state.accounts.get_mut(&uid) {
            account.identity.email_verified = true;
        }
        true
    }

    pub fn identity_by_email(&self, email: &str) -> Option<Identity> {
        lock(&self.state)
            .find_by_email(email)
            .map(|a| a.identity.clone())
    }

    pub fn exists(&self, uid: &str) -> bool {
        lock(&self.state).accounts.contains_key(uid)
    }

    pub fn account_count(&self) -> usize {
        lock(&self.state).accounts.len()
    }

    pub fn current(&self) -> Option<Identity> {
        lock(&self.state).current_identity()
    }

    pub fn outbox(&self) -> Vec<SentMail> {
        lock(&self.state).outbox.clone()
    }

    /// Pushes a notification to all subscribers without changing accounts.
    pub fn emit(&self, identity: Option<Identity>) {
        lock(&self.state).emit(identity);
    }

    /// Ends every subscriber's stream.
    pub fn close_subscribers(&self) {
        lock(&self.state).subscribers.clear();
    }

    fn sign_in(state: &mut ProviderState, identity: &Identity) {
        state.current = Some(identity.uid.clone());
        state.emit(Some(identity.clone()));
    }
}

#[async_trait]
impl IdentityProvider for MemoryIdentityProvider {
    async fn create_identity(&self, email: &str, password: &str) -> BackendResult<Identity> {
        let mut state = lock(&self.state);
        state.failures.check(IdentityOp::Create)?;
        if password.len() < MIN_PASSWORD_LEN {
            return Err(BackendError::rejected(
                "WEAK_PASSWORD : Password should be at least 6 characters",
            ));
        }
        if state.find_by_email(email).is_some() {
            return Err(BackendError::rejected("EMAIL_EXISTS"));
        }

        let identity = Identity::new(uuid::Uuid::new_v4().simple().to_string(), email);
        state.accounts.insert(
            identity.uid.clone(),
            Account {
                identity: identity.clone(),
                password: password.to_string(),
            },
        );
        Self::sign_in(&mut state, &identity);
        Ok(identity)
    }

    async fn authenticate(&self, email: &str, password: &str) -> BackendResult<Identity> {
        let mut state = lock(&self.state);
        state.failures.check(IdentityOp::Authenticate)?;
        let identity = match state.find_by_email(email) {
            Some(account) if account.password == password => account.identity.clone(),
            _ => return Err(BackendError::rejected("INVALID_LOGIN_CREDENTIALS")),
        };
        Self::sign_in(&mut state, &identity);
        Ok(identity)
    }

    async fn sign_out(&self) -> BackendResult<()> {
        let mut state = lock(&self.state);
        state.failures.check(IdentityOp::SignOut)?;
        state.current = None;
        state.emit(None);
        Ok(())
    }

    async fn send_reset_email(&self, email: &str) -> BackendResult<()> {
        let mut state = lock(&self.state);
        state.failures.check(IdentityOp::SendReset)?;
        if state.find_by_email(email).is_none() {
            return Err(BackendError::rejected("EMAIL_NOT_FOUND"));
        }
        state.outbox.push(SentMail {
            kind: MailKind::PasswordReset,
            email: email.to_string(),
        });
        Ok(())
    }

    async fn send_verification_email(&self, identity: &Identity) -> BackendResult<()> {
        let mut state = lock(&self.state);
        state.failures.check(IdentityOp::SendVerification)?;
        let email = state.account_mut(&identity.uid)?.identity.email.clone();
        state.outbox.push(SentMail {
            kind: MailKind::VerifyEmail,
            email,
        });
        Ok(())
    }

    async fn set_display_name(&self, identity: &Identity, name: &str) -> BackendResult<()> {
        let mut state = lock(&self.state);
        state.failures.check(IdentityOp::SetDisplayName)?;
        state.account_mut(&identity.uid)?.identity.display_name = Some(name.to_string());
        Ok(())
    }

    async fn delete_identity(&self, identity: &Identity) -> BackendResult<()> {
        let mut state = lock(&self.state);
        state.failures.check(IdentityOp::Delete)?;
        if state.accounts.remove(&identity.uid).is_none() {
            return Err(BackendError::not_found("USER_NOT_FOUND"));
        }
        if state.current.as_deref() == Some(identity.uid.as_str()) {
            state.current = None;
            state.emit(None);
        }
        Ok(())
    }

    async fn update_password(&self, identity: &Identity, new_password: &str) -> BackendResult<()> {
        let mut state = lock(&self.state);
        state.failures.check(IdentityOp::UpdatePassword)?;
        if new_password.len() < MIN_PASSWORD_LEN {
            return Err(BackendError::rejected(
                "WEAK_PASSWORD : Password should be at least 6 characters",
            ));
        }
        state.account_mut(&identity.uid)?.password = new_password.to_string();
        Ok(())
    }

    fn subscribe(&self) -> AuthStateStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = lock(&self.state);
        // Receiver is alive, so the initial send cannot fail.
        let _ = tx.send(state.current_identity());
        state.subscribers.push(tx);

        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
    }
}

/// Document store operations that can be scheduled to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Get,
    Set,
    Update,
}

#[derive(Debug, Default)]
struct StoreState {
    /// Keyed by (collection, id).
    documents: HashMap<(String, String), Fields>,
    failures: FailurePlan<StoreOp>,
}

/// Document store kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    state: Mutex<StoreState>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, op: StoreOp, error: BackendError) {
        lock(&self.state).failures.set(op, error, Some(1));
    }

    pub fn fail_always(&self, op: StoreOp, error: BackendError) {
        lock(&self.state).failures.set(op, error, None);
    }

    pub fn clear_failures(&self) {
        lock(&self.state).failures = FailurePlan::default();
    }

    /// Reads a document directly, bypassing failure injection.
    pub fn document(&self, collection: &str, id: &str) -> Option<Document> {
        lock(&self.state)
            .documents
            .get(&(collection.to_string(), id.to_string()))
            .map(|fields| Document::new(id, fields.clone()))
    }

    /// Writes a document directly, bypassing failure injection.
    pub fn insert(&self, collection: &str, id: &str, fields: Fields) {
        lock(&self.state)
            .documents
            .insert((collection.to_string(), id.to_string()), resolve(fields));
    }

    pub fn len(&self) -> usize {
        lock(&self.state).documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Replaces server-timestamp sentinels with the current time.
fn resolve(mut fields: Fields) -> Fields {
    let now = Utc::now();
    for value in fields.values_mut() {
        if *value == FieldValue::ServerTimestamp {
            *value = FieldValue::Timestamp(now);
        }
    }
    fields
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> BackendResult<Option<Document>> {
        let mut state = lock(&self.state);
        state.failures.check(StoreOp::Get)?;
        Ok(state
            .documents
            .get(&(collection.to_string(), id.to_string()))
            .map(|fields| Document::new(id, fields.clone())))
    }

    async fn set(&self, collection: &str, id: &str, fields: Fields) -> BackendResult<()> {
        let mut state = lock(&self.state);
        state.failures.check(StoreOp::Set)?;
        state
            .documents
            .insert((collection.to_string(), id.to_string()), resolve(fields));
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, fields: Fields) -> BackendResult<()> {
        let mut state = lock(&self.state);
        state.failures.check(StoreOp::Update)?;
        let doc = state
            .documents
            .get_mut(&(collection.to_string(), id.to_string()))
            .ok_or_else(|| BackendError::not_found(format!("No document to update: {collection}/{id}")))?;
        doc.extend(resolve(fields));
        Ok(())
    }
}
