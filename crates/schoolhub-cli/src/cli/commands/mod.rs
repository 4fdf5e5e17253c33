//! CLI command handlers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use schoolhub_core::config::{Config, paths};
use schoolhub_core::session::{self, SessionManager, SessionSnapshot};
use schoolhub_providers::{
    FirebaseAuth, FirebaseAuthConfig, Firestore, FirestoreConfig, TokenSource,
};
use schoolhub_types::EffectiveUser;

pub mod auth;
pub mod config;
pub mod profile;

/// How long a command waits for the session to reflect its operation.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds the Firebase backends from config and installs the session manager.
///
/// Returns once the stored session (if any) has been reconciled.
pub async fn open_session(config: &Config) -> Result<&'static SessionManager> {
    let firebase = &config.firebase;
    let auth_config = FirebaseAuthConfig::resolve(
        firebase.api_key.as_deref(),
        firebase.auth_base_url.as_deref(),
        firebase.token_base_url.as_deref(),
        Some(paths::session_path()),
    )?;
    let store_config = FirestoreConfig::resolve(
        firebase.project_id.as_deref(),
        firebase.firestore_base_url.as_deref(),
    )?;

    let auth = Arc::new(
        FirebaseAuth::connect(auth_config)
            .await
            .context("restore session")?,
    );
    let store = Firestore::new(store_config, Arc::clone(&auth) as Arc<dyn TokenSource>);

    let manager = SessionManager::start(auth, Arc::new(store), config.session_options());
    let session = session::install(manager).map_err(|_| anyhow!("session already started"))?;

    tokio::time::timeout(SETTLE_TIMEOUT, session.wait_until_loaded())
        .await
        .context("timed out loading session")?;
    Ok(session)
}

/// Lets best-effort work finish. After a successful command, any error it
/// recorded (a failed verification mirror, say) is reported as a warning.
pub async fn finish(session: &SessionManager, succeeded: bool) {
    session.drain_background().await;
    if succeeded && let Some(error) = session.snapshot().error {
        eprintln!("warning: {error}");
    }
}

/// Waits until the session shows `uid` signed in and `ready` holds, or an error is recorded.
async fn settle_user<F>(session: &SessionManager, uid: &str, mut ready: F) -> Option<EffectiveUser>
where
    F: FnMut(&EffectiveUser) -> bool,
{
    let settled = |snapshot: &SessionSnapshot| {
        snapshot.error.is_some() || snapshot.user().is_some_and(|u| u.uid == uid && ready(u))
    };
    let snapshot = tokio::time::timeout(SETTLE_TIMEOUT, session.wait_for(settled))
        .await
        .ok()?;
    snapshot.user().filter(|u| u.uid == uid).cloned()
}
