//! Session manager: authentication lifecycle plus profile synchronization.
//!
//! The manager mediates register/login/logout/password-reset against an
//! [`IdentityProvider`] and keeps the profile stored in a [`DocumentStore`]
//! consistent with it. State transitions only come from the provider's
//! notification stream (see `reconcile`); operations write nothing but the
//! error slot.

mod error;
mod reconcile;
mod state;

use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use schoolhub_types::profile::field;
use schoolhub_types::{
    DocumentStore, EffectiveUser, FieldValue, Fields, Identity, IdentityProvider, Profile,
    ProfileUpdate, UserCredential,
};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

pub use error::{AuthError, Compensation};
pub use state::{SessionSnapshot, SessionState};

use reconcile::Reconciler;

/// Tunables for a [`SessionManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    collection: String,
}

impl SessionOptions {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
        }
    }

    /// Collection holding profile documents.
    pub fn collection(&self) -> &str {
        &self.collection
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::new(Profile::DEFAULT_COLLECTION)
    }
}

/// State shared between the manager, the reconciler and detached tasks.
pub(crate) struct Shared {
    pub(crate) provider: Arc<dyn IdentityProvider>,
    pub(crate) store: Arc<dyn DocumentStore>,
    pub(crate) collection: String,
    state: watch::Sender<SessionSnapshot>,
    /// Detached best-effort work (verification mail, flag mirroring).
    background: Mutex<JoinSet<()>>,
}

impl Shared {
    pub(crate) fn spawn_background<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.background.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    pub(crate) fn publish(&self, state: SessionState) {
        self.state.send_modify(|snapshot| snapshot.state = state);
    }

    pub(crate) fn record_error(&self, message: String) {
        self.state.send_modify(|snapshot| snapshot.error = Some(message));
    }

    fn clear_error(&self) {
        self.state.send_if_modified(|snapshot| snapshot.error.take().is_some());
    }
}

/// Best-effort `emailVerified: true` write. Failures are logged and recorded.
///
/// The flag is only ever set, never cleared.
pub(crate) fn spawn_verified_mirror(shared: &Arc<Shared>, uid: String) {
    let task_shared = Arc::clone(shared);
    shared.spawn_background(async move {
        let shared = task_shared;
        let mut fields = Fields::new();
        fields.insert(field::EMAIL_VERIFIED.to_string(), FieldValue::Bool(true));
        match shared.store.update(&shared.collection, &uid, fields).await {
            Ok(()) => debug!(uid = %uid, "mirrored email verification"),
            Err(err) => {
                warn!(uid = %uid, error = %err, "Error updating email verification status");
                shared.record_error(format!("Error updating email verification status: {err}"));
            }
        }
    });
}

/// Owns the authentication lifecycle for one process.
///
/// Dropping the manager stops the reconciler and unsubscribes from the provider.
pub struct SessionManager {
    shared: Arc<Shared>,
    refresh: mpsc::UnboundedSender<Identity>,
    reconciler: JoinHandle<()>,
}

impl SessionManager {
    /// Subscribes to the provider and starts reconciling on the current runtime.
    ///
    /// # Panics
    /// Panics if called outside of a tokio runtime.
    pub fn start(
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn DocumentStore>,
        options: SessionOptions,
    ) -> Self {
        let (state, _) = watch::channel(SessionSnapshot::default());
        let shared = Arc::new(Shared {
            provider,
            store,
            collection: options.collection,
            state,
            background: Mutex::new(JoinSet::new()),
        });

        let notifications = shared.provider.subscribe();
        let (refresh, refresh_rx) = mpsc::unbounded_channel();
        let reconciler = tokio::spawn(
            Reconciler::new(Arc::clone(&shared)).run(notifications, refresh_rx),
        );

        Self {
            shared,
            refresh,
            reconciler,
        }
    }

    /// Current state and error slot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.state.borrow().clone()
    }

    /// Receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.state.subscribe()
    }

    pub fn current_user(&self) -> Option<EffectiveUser> {
        self.shared.state.borrow().user().cloned()
    }

    /// Waits until `predicate` holds for the published snapshot.
    pub async fn wait_for<F>(&self, mut predicate: F) -> SessionSnapshot
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        let mut rx = self.subscribe();
        // The sender lives in `self.shared`, so the channel cannot close here.
        match rx.wait_for(|snapshot| predicate(snapshot)).await {
            Ok(snapshot) => snapshot.clone(),
            Err(_) => self.snapshot(),
        }
    }

    /// Loading gate: resolves once the first notification has been reconciled.
    pub async fn wait_until_loaded(&self) -> SessionSnapshot {
        self.wait_for(|snapshot| !snapshot.is_loading()).await
    }

    /// Waits for detached best-effort tasks spawned so far.
    ///
    /// Operations never wait for them; short-lived callers use this before exit.
    pub async fn drain_background(&self) {
        let mut tasks = std::mem::take(
            &mut *self
                .shared
                .background
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        while let Some(result) = tasks.join_next().await {
            if let Err(err) = result {
                warn!(error = %err, "background task did not complete");
            }
        }
    }

    /// Creates an identity and its profile.
    ///
    /// If the display name or the profile cannot be written, the identity is
    /// deleted again so no account exists without a profile.
    ///
    /// # Errors
    /// `IdentityCreation`, `DisplayName` or `ProfileCreation`.
    pub async fn register(
        &self,
        email: &str,
        password: &str,
        username: &str,
        phone: &str,
    ) -> Result<UserCredential, AuthError> {
        self.tracked(self.register_steps(email, password, username, phone))
            .await
    }

    /// Signs in. A verified identity also gets its profile flag mirrored (best effort).
    ///
    /// # Errors
    /// `InvalidCredentials` with the provider's error.
    pub async fn login(&self, email: &str, password: &str) -> Result<UserCredential, AuthError> {
        self.tracked(self.login_steps(email, password)).await
    }

    /// # Errors
    /// `SignOut` when the provider fails to end the session.
    pub async fn logout(&self) -> Result<(), AuthError> {
        let provider = &self.shared.provider;
        self.tracked(async { provider.sign_out().await.map_err(AuthError::SignOut) })
            .await
    }

    /// # Errors
    /// `ResetRequest` when the provider refuses to send the message.
    pub async fn reset_password(&self, email: &str) -> Result<(), AuthError> {
        let provider = &self.shared.provider;
        self.tracked(async {
            provider
                .send_reset_email(email)
                .await
                .map_err(AuthError::ResetRequest)
        })
        .await
    }

    /// Fetches the signed-in user's stored profile.
    ///
    /// # Errors
    /// `NotAuthenticated` or `ProfileFetch`.
    pub async fn fetch_profile(&self) -> Result<Option<Profile>, AuthError> {
        self.tracked(self.fetch_profile_steps()).await
    }

    /// Applies a partial edit to the signed-in user's profile.
    ///
    /// # Errors
    /// `NotAuthenticated`, `ReservedField` or `ProfileUpdate`.
    pub async fn update_profile(&self, update: ProfileUpdate) -> Result<(), AuthError> {
        self.tracked(self.update_profile_steps(update)).await
    }

    /// # Errors
    /// `PasswordMismatch`, `NotAuthenticated` or `PasswordUpdate`.
    pub async fn change_password(&self, new_password: &str, confirm: &str) -> Result<(), AuthError> {
        self.tracked(self.change_password_steps(new_password, confirm))
            .await
    }

    async fn register_steps(
        &self,
        email: &str,
        password: &str,
        username: &str,
        phone: &str,
    ) -> Result<UserCredential, AuthError> {
        let shared = &self.shared;
        let identity = shared
            .provider
            .create_identity(email, password)
            .await
            .map_err(AuthError::IdentityCreation)?;
        info!(uid = %identity.uid, "identity created");

        if let Err(cause) = shared.provider.set_display_name(&identity, username).await {
            error!(uid = %identity.uid, error = %cause, "failed to set display name");
            let compensation = self.compensate(&identity).await;
            return Err(AuthError::DisplayName {
                cause,
                compensation,
            });
        }
        let identity = identity.with_display_name(username);

        self.spawn_verification_email(identity.clone());

        let fields = Profile::registration_fields(&identity.uid, username, email, phone);
        if let Err(cause) = shared
            .store
            .set(&shared.collection, &identity.uid, fields)
            .await
        {
            error!(uid = %identity.uid, error = %cause, "failed to create profile document");
            let compensation = self.compensate(&identity).await;
            return Err(AuthError::ProfileCreation {
                cause,
                compensation,
            });
        }

        info!(uid = %identity.uid, "user registered");
        self.request_refresh(identity.clone());
        Ok(UserCredential::sign_up(identity))
    }

    async fn login_steps(&self, email: &str, password: &str) -> Result<UserCredential, AuthError> {
        let identity = self
            .shared
            .provider
            .authenticate(email, password)
            .await
            .map_err(AuthError::InvalidCredentials)?;
        info!(uid = %identity.uid, "signed in");

        if identity.email_verified {
            spawn_verified_mirror(&self.shared, identity.uid.clone());
        }
        Ok(UserCredential::sign_in(identity))
    }

    async fn fetch_profile_steps(&self) -> Result<Option<Profile>, AuthError> {
        let user = self.current_user().ok_or(AuthError::NotAuthenticated)?;
        let shared = &self.shared;
        let doc = shared
            .store
            .get(&shared.collection, &user.uid)
            .await
            .map_err(AuthError::ProfileFetch)?;
        Ok(doc.as_ref().map(Profile::from_document))
    }

    async fn update_profile_steps(&self, update: ProfileUpdate) -> Result<(), AuthError> {
        let user = self.current_user().ok_or(AuthError::NotAuthenticated)?;
        if let Some(key) = update.reserved_key() {
            return Err(AuthError::ReservedField(key.to_string()));
        }
        if update.is_empty() {
            return Ok(());
        }

        let shared = &self.shared;
        shared
            .store
            .update(&shared.collection, &user.uid, update.into_fields())
            .await
            .map_err(AuthError::ProfileUpdate)?;
        info!(uid = %user.uid, "profile updated");
        self.request_refresh(user.identity);
        Ok(())
    }

    async fn change_password_steps(&self, new_password: &str, confirm: &str) -> Result<(), AuthError> {
        if new_password != confirm {
            return Err(AuthError::PasswordMismatch);
        }
        let user = self.current_user().ok_or(AuthError::NotAuthenticated)?;
        self.shared
            .provider
            .update_password(&user.identity, new_password)
            .await
            .map_err(AuthError::PasswordUpdate)?;
        info!(uid = %user.uid, "password updated");
        Ok(())
    }

    /// Clears the error slot, runs `op`, and records its failure.
    async fn tracked<T, F>(&self, op: F) -> Result<T, AuthError>
    where
        F: Future<Output = Result<T, AuthError>>,
    {
        self.shared.clear_error();
        let result = op.await;
        if let Err(err) = &result {
            self.shared.record_error(err.to_string());
        }
        result
    }

    async fn compensate(&self, identity: &Identity) -> Compensation {
        match self.shared.provider.delete_identity(identity).await {
            Ok(()) => {
                warn!(uid = %identity.uid, "deleted identity after failed registration");
                Compensation::IdentityDeleted
            }
            Err(err) => {
                error!(uid = %identity.uid, error = %err, "failed to delete identity after failed registration");
                Compensation::DeleteFailed(err)
            }
        }
    }

    fn spawn_verification_email(&self, identity: Identity) {
        let provider = Arc::clone(&self.shared.provider);
        self.shared.spawn_background(async move {
            match provider.send_verification_email(&identity).await {
                Ok(()) => debug!(uid = %identity.uid, "verification email sent"),
                Err(err) => {
                    warn!(uid = %identity.uid, error = %err, "failed to send verification email");
                }
            }
        });
    }

    fn request_refresh(&self, identity: Identity) {
        if self.refresh.send(identity).is_err() {
            debug!("reconciler stopped, refresh dropped");
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.reconciler.abort();
    }
}

static GLOBAL: OnceLock<SessionManager> = OnceLock::new();

/// Installs the process-wide manager.
///
/// # Errors
/// Returns the manager back if one is already installed.
pub fn install(manager: SessionManager) -> Result<&'static SessionManager, SessionManager> {
    let mut pending = Some(manager);
    let installed = GLOBAL.get_or_init(|| match pending.take() {
        Some(manager) => manager,
        None => unreachable!("OnceLock runs the initializer at most once"),
    });
    match pending {
        Some(rejected) => Err(rejected),
        None => Ok(installed),
    }
}

/// The process-wide manager, if one was installed.
pub fn global() -> Option<&'static SessionManager> {
    GLOBAL.get()
}

#[cfg(test)]
mod tests;
