//! Firebase Authentication over the Identity Toolkit REST API.
//!
//! Email/password accounts only. The signed-in session lives in memory and,
//! when a session path is configured, on disk so later processes start signed
//! in. Sign-in state changes are broadcast through a watch channel; every
//! subscriber first sees the current state.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use schoolhub_types::{
    AuthStateStream, BackendError, BackendErrorKind, BackendResult, Identity, IdentityProvider,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::credentials::{StoredSession, mask_token};
use crate::firestore::TokenSource;
use crate::shared::{
    API_KEY_ENV, AUTH_URL_ENV, DEFAULT_AUTH_URL, DEFAULT_TOKEN_URL, TOKEN_URL_ENV, USER_AGENT,
    classify_reqwest_error, read_json, resolve_api_key, resolve_base_url,
};

const SIGN_UP_PATH: &str = "/v1/accounts:signUp";
const SIGN_IN_PATH: &str = "/v1/accounts:signInWithPassword";
const SEND_OOB_CODE_PATH: &str = "/v1/accounts:sendOobCode";
const UPDATE_PATH: &str = "/v1/accounts:update";
const DELETE_PATH: &str = "/v1/accounts:delete";
const LOOKUP_PATH: &str = "/v1/accounts:lookup";
const TOKEN_PATH: &str = "/v1/token";

/// ID token lifetime assumed when the response omits it.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirebaseAuthConfig {
    pub api_key: String,
    pub auth_base_url: String,
    pub token_base_url: String,
    /// Where the signed-in session is persisted. `None` keeps it in memory.
    pub session_path: Option<PathBuf>,
}

impl FirebaseAuthConfig {
    /// Resolves config values against the environment.
    ///
    /// # Errors
    /// Returns an error if no API key is available or a URL is malformed.
    pub fn resolve(
        api_key: Option<&str>,
        auth_base_url: Option<&str>,
        token_base_url: Option<&str>,
        session_path: Option<PathBuf>,
    ) -> Result<Self> {
        Ok(Self {
            api_key: resolve_api_key(api_key, API_KEY_ENV)?,
            auth_base_url: resolve_base_url(
                auth_base_url,
                AUTH_URL_ENV,
                DEFAULT_AUTH_URL,
                "Identity Toolkit",
            )?,
            token_base_url: resolve_base_url(
                token_base_url,
                TOKEN_URL_ENV,
                DEFAULT_TOKEN_URL,
                "Secure Token",
            )?,
            session_path,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    local_id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    id_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<String>,
}

/// Secure Token responses use snake case.
#[derive(Debug, Deserialize)]
struct RefreshResponse {
    id_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    users: Vec<LookupUser>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupUser {
    local_id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    email_verified: bool,
}

/// Update responses only carry tokens when the password changed.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateResponse {
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PasswordRequest<'a> {
    email: &'a str,
    password: &'a str,
    return_secure_token: bool,
}

fn expires_in_secs(raw: Option<&str>) -> i64 {
    raw.and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_EXPIRES_IN_SECS)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Identity provider backed by Firebase Authentication.
pub struct FirebaseAuth {
    config: FirebaseAuthConfig,
    http: reqwest::Client,
    session: Mutex<Option<StoredSession>>,
    state: watch::Sender<Option<Identity>>,
}

impl FirebaseAuth {
    /// Creates a client with no signed-in session.
    pub fn new(config: FirebaseAuthConfig) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            config,
            http: reqwest::Client::new(),
            session: Mutex::new(None),
            state,
        }
    }

    /// Creates a client and restores the persisted session, if any.
    ///
    /// An expired ID token is refreshed and the account is looked up again so
    /// the verification flag is current. A session the backend no longer
    /// accepts is discarded.
    ///
    /// # Errors
    /// Returns an error if the session file is unreadable.
    pub async fn connect(config: FirebaseAuthConfig) -> Result<Self> {
        let stored = match &config.session_path {
            Some(path) => StoredSession::load(path)?,
            None => None,
        };
        let auth = Self::new(config);
        let Some(stored) = stored else {
            return Ok(auth);
        };

        debug!(uid = %stored.identity.uid, "restoring session");
        auth.replace_session(Some(stored));
        match auth.restore().await {
            Ok(identity) => {
                info!(uid = %identity.uid, "session restored");
                auth.state.send_replace(Some(identity));
            }
            Err(err) if matches!(err.kind, BackendErrorKind::Rejected | BackendErrorKind::NotFound) => {
                warn!(error = %err, "stored session rejected, signing out");
                auth.end_session();
            }
            Err(err) => {
                // Offline: keep the cached identity so the session still loads.
                warn!(error = %err, "could not refresh stored session");
                let identity = auth.current_session().map(|s| s.identity);
                auth.state.send_replace(identity);
            }
        }
        Ok(auth)
    }

    async fn restore(&self) -> BackendResult<Identity> {
        let id_token = self.valid_token().await?;
        let identity = self.lookup(&id_token).await?;
        self.update_session(|session| session.identity = identity.clone());
        Ok(identity)
    }

    /// The signed-in session, if any.
    pub fn current_session(&self) -> Option<StoredSession> {
        lock(&self.session).clone()
    }

    fn url(&self, base: &str, path: &str) -> String {
        format!("{base}{path}?key={}", self.config.api_key)
    }

    async fn post<B, T>(&self, base: &str, path: &str, body: &B) -> BackendResult<T>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .http
            .post(self.url(base, path))
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .json(body)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;
        read_json(response).await
    }

    async fn lookup(&self, id_token: &str) -> BackendResult<Identity> {
        let response: LookupResponse = self
            .post(
                &self.config.auth_base_url,
                LOOKUP_PATH,
                &json!({ "idToken": id_token }),
            )
            .await?;
        let user = response
            .users
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::not_found("USER_NOT_FOUND"))?;

        let mut identity = Identity::new(user.local_id, user.email.unwrap_or_default())
            .verified(user.email_verified);
        identity.display_name = user.display_name;
        Ok(identity)
    }

    /// Exchanges the refresh token for a new ID token.
    async fn refresh(&self, refresh_token: &str) -> BackendResult<String> {
        let response: RefreshResponse = self
            .post(
                &self.config.token_base_url,
                TOKEN_PATH,
                &json!({ "grant_type": "refresh_token", "refresh_token": refresh_token }),
            )
            .await?;
        debug!(token = %mask_token(&response.id_token), "refreshed id token");

        let expires = expires_in_secs(response.expires_in.as_deref());
        let id_token = response.id_token.clone();
        self.update_session(|session| {
            *session = StoredSession::new(
                session.identity.clone(),
                response.id_token,
                response.refresh_token,
                expires,
            );
        });
        Ok(id_token)
    }

    /// Current ID token, refreshed if it is about to expire.
    async fn valid_token(&self) -> BackendResult<String> {
        let session = self
            .current_session()
            .ok_or_else(|| BackendError::internal("Not signed in"))?;
        if session.is_expired() {
            self.refresh(&session.refresh_token).await
        } else {
            Ok(session.id_token)
        }
    }

    /// ID token for the session that belongs to `identity`.
    async fn token_for(&self, identity: &Identity) -> BackendResult<String> {
        match self.current_session() {
            Some(session) if session.identity.uid == identity.uid => self.valid_token().await,
            _ => Err(BackendError::internal(format!(
                "Not signed in as {}",
                identity.uid
            ))),
        }
    }

    fn replace_session(&self, session: Option<StoredSession>) {
        *lock(&self.session) = session;
        self.persist();
    }

    fn update_session(&self, f: impl FnOnce(&mut StoredSession)) {
        {
            let mut guard = lock(&self.session);
            match guard.as_mut() {
                Some(session) => f(session),
                None => return,
            }
        }
        self.persist();
    }

    fn persist(&self) {
        let Some(path) = &self.config.session_path else {
            return;
        };
        let result = match self.current_session() {
            Some(session) => session.save(path),
            None => StoredSession::clear(path),
        };
        if let Err(err) = result {
            warn!(error = %format!("{err:#}"), "failed to persist session");
        }
    }

    fn start_session(&self, response: TokenResponse, email: &str) -> Identity {
        let mut identity = Identity::new(response.local_id, response.email.unwrap_or_else(|| email.to_string()));
        identity.display_name = response.display_name.filter(|name| !name.is_empty());
        let expires = expires_in_secs(response.expires_in.as_deref());
        self.replace_session(Some(StoredSession::new(
            identity.clone(),
            response.id_token,
            response.refresh_token,
            expires,
        )));
        identity
    }

    fn end_session(&self) {
        self.replace_session(None);
        self.state.send_replace(None);
    }
}

#[async_trait]
impl IdentityProvider for FirebaseAuth {
    async fn create_identity(&self, email: &str, password: &str) -> BackendResult<Identity> {
        let body = PasswordRequest {
            email,
            password,
            return_secure_token: true,
        };
        let response: TokenResponse = self
            .post(&self.config.auth_base_url, SIGN_UP_PATH, &body)
            .await?;

        let identity = self.start_session(response, email);
        info!(uid = %identity.uid, "account created");
        self.state.send_replace(Some(identity.clone()));
        Ok(identity)
    }

    async fn authenticate(&self, email: &str, password: &str) -> BackendResult<Identity> {
        let body = PasswordRequest {
            email,
            password,
            return_secure_token: true,
        };
        let response: TokenResponse = self
            .post(&self.config.auth_base_url, SIGN_IN_PATH, &body)
            .await?;
        let id_token = response.id_token.clone();
        let mut identity = self.start_session(response, email);

        // Sign-in responses omit the verification flag.
        match self.lookup(&id_token).await {
            Ok(looked_up) => {
                identity = looked_up;
                self.update_session(|session| session.identity = identity.clone());
            }
            Err(err) => warn!(uid = %identity.uid, error = %err, "account lookup failed"),
        }

        info!(uid = %identity.uid, "signed in");
        self.state.send_replace(Some(identity.clone()));
        Ok(identity)
    }

    async fn sign_out(&self) -> BackendResult<()> {
        if let Some(session) = self.current_session() {
            info!(uid = %session.identity.uid, "signing out");
        }
        self.end_session();
        Ok(())
    }

    async fn send_reset_email(&self, email: &str) -> BackendResult<()> {
        let _: Value = self
            .post(
                &self.config.auth_base_url,
                SEND_OOB_CODE_PATH,
                &json!({ "requestType": "PASSWORD_RESET", "email": email }),
            )
            .await?;
        Ok(())
    }

    async fn send_verification_email(&self, identity: &Identity) -> BackendResult<()> {
        let id_token = self.token_for(identity).await?;
        let _: Value = self
            .post(
                &self.config.auth_base_url,
                SEND_OOB_CODE_PATH,
                &json!({ "requestType": "VERIFY_EMAIL", "idToken": id_token }),
            )
            .await?;
        Ok(())
    }

    async fn set_display_name(&self, identity: &Identity, name: &str) -> BackendResult<()> {
        let id_token = self.token_for(identity).await?;
        let _: UpdateResponse = self
            .post(
                &self.config.auth_base_url,
                UPDATE_PATH,
                &json!({ "idToken": id_token, "displayName": name, "returnSecureToken": false }),
            )
            .await?;
        self.update_session(|session| session.identity.display_name = Some(name.to_string()));
        Ok(())
    }

    async fn delete_identity(&self, identity: &Identity) -> BackendResult<()> {
        let id_token = self.token_for(identity).await?;
        let _: Value = self
            .post(
                &self.config.auth_base_url,
                DELETE_PATH,
                &json!({ "idToken": id_token }),
            )
            .await?;
        info!(uid = %identity.uid, "account deleted");
        self.end_session();
        Ok(())
    }

    async fn update_password(&self, identity: &Identity, new_password: &str) -> BackendResult<()> {
        let id_token = self.token_for(identity).await?;
        let response: UpdateResponse = self
            .post(
                &self.config.auth_base_url,
                UPDATE_PATH,
                &json!({ "idToken": id_token, "password": new_password, "returnSecureToken": true }),
            )
            .await?;

        // Changing the password revokes the old refresh token.
        if let (Some(id_token), Some(refresh_token)) = (response.id_token, response.refresh_token) {
            let expires = expires_in_secs(response.expires_in.as_deref());
            self.update_session(|session| {
                *session = StoredSession::new(
                    session.identity.clone(),
                    id_token,
                    refresh_token,
                    expires,
                );
            });
        }
        Ok(())
    }

    fn subscribe(&self) -> AuthStateStream {
        let rx = self.state.subscribe();
        stream::unfold((rx, true), |(mut rx, first)| async move {
            if !first && rx.changed().await.is_err() {
                return None;
            }
            let identity = rx.borrow_and_update().clone();
            Some((identity, (rx, false)))
        })
        .boxed()
    }
}

#[async_trait]
impl TokenSource for FirebaseAuth {
    async fn id_token(&self) -> BackendResult<Option<String>> {
        if self.current_session().is_none() {
            return Ok(None);
        }
        self.valid_token().await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::template_override;

    fn config() -> FirebaseAuthConfig {
        FirebaseAuthConfig {
            api_key: "test-key".into(),
            auth_base_url: "http://127.0.0.1:9".into(),
            token_base_url: "http://127.0.0.1:9".into(),
            session_path: None,
        }
    }

    #[test]
    fn test_template_endpoints_build_v1_urls() {
        let auth_url = template_override("auth_base_url");
        let token_url = template_override("token_base_url");
        let config =
            FirebaseAuthConfig::resolve(Some("test-key"), Some(&auth_url), Some(&token_url), None)
                .unwrap();
        let auth = FirebaseAuth::new(config);

        assert_eq!(
            auth.url(&auth.config.auth_base_url, SIGN_UP_PATH),
            "https://identitytoolkit.googleapis.com/v1/accounts:signUp?key=test-key"
        );
        assert_eq!(
            auth.url(&auth.config.token_base_url, TOKEN_PATH),
            "https://securetoken.googleapis.com/v1/token?key=test-key"
        );
    }

    #[test]
    fn test_url_carries_api_key() {
        let auth = FirebaseAuth::new(config());
        assert_eq!(
            auth.url("http://localhost", SIGN_UP_PATH),
            "http://localhost/v1/accounts:signUp?key=test-key"
        );
    }

    #[test]
    fn test_expires_in_parsing() {
        assert_eq!(expires_in_secs(Some("1800")), 1800);
        assert_eq!(expires_in_secs(Some("soon")), DEFAULT_EXPIRES_IN_SECS);
        assert_eq!(expires_in_secs(None), DEFAULT_EXPIRES_IN_SECS);
    }

    #[tokio::test]
    async fn test_subscribe_starts_with_current_state() {
        let auth = FirebaseAuth::new(config());
        let mut stream = auth.subscribe();
        assert_eq!(stream.next().await, Some(None));

        let identity = Identity::new("u1", "a@x.com");
        auth.state.send_replace(Some(identity.clone()));
        assert_eq!(stream.next().await, Some(Some(identity)));

        auth.sign_out().await.unwrap();
        assert_eq!(stream.next().await, Some(None));
    }

    #[tokio::test]
    async fn test_operations_require_matching_session() {
        let auth = FirebaseAuth::new(config());
        let err = auth
            .set_display_name(&Identity::new("u1", "a@x.com"), "alice")
            .await
            .unwrap_err();
        assert_eq!(err.message, "Not signed in as u1");
        assert_eq!(auth.id_token().await.unwrap(), None);
    }
}
