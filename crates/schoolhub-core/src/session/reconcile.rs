//! Auth-state reconciliation.
//!
//! A single task consumes the provider's notifications in order and is the only
//! writer of `SessionSnapshot::state`. Each notification is reconciled to a
//! terminal state before the next one is read, so writes to one profile never
//! interleave.

use std::sync::Arc;

use futures_util::StreamExt;
use schoolhub_types::{AuthStateStream, EffectiveUser, Identity, Profile};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::error::AuthError;
use super::state::SessionState;
use super::{Shared, spawn_verified_mirror};

/// Message published when the provider ends the notification stream.
pub(crate) const STREAM_CLOSED: &str = "auth state stream closed";

pub(crate) struct Reconciler {
    shared: Arc<Shared>,
    /// Identity from the latest non-null notification.
    current: Option<Identity>,
    /// Profile from the latest successful fetch for `current`.
    cached: Option<Profile>,
    /// Set once the first notification has been reconciled.
    resolved: bool,
}

impl Reconciler {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            current: None,
            cached: None,
            resolved: false,
        }
    }

    /// Runs until the provider closes the notification stream.
    ///
    /// `refresh` carries re-merge requests from caller operations (after the
    /// profile was created or edited). They are applied only when they refer to
    /// the identity that is currently signed in.
    pub(crate) async fn run(
        mut self,
        mut notifications: AuthStateStream,
        mut refresh: mpsc::UnboundedReceiver<Identity>,
    ) {
        loop {
            tokio::select! {
                biased;
                next = notifications.next() => match next {
                    Some(identity) => self.handle(identity).await,
                    None => {
                        warn!("{STREAM_CLOSED}");
                        self.shared.publish(SessionState::Error(STREAM_CLOSED.to_string()));
                        return;
                    }
                },
                Some(identity) = refresh.recv() => {
                    let is_current = self
                        .current
                        .as_ref()
                        .is_some_and(|current| current.uid == identity.uid);
                    if is_current {
                        self.handle(Some(identity)).await;
                    } else {
                        debug!(uid = %identity.uid, "ignoring refresh for identity that is not signed in");
                    }
                }
            }
        }
    }

    pub(crate) async fn handle(&mut self, identity: Option<Identity>) {
        let state = match identity {
            Some(identity) => {
                if !self.resolved {
                    self.shared.publish(SessionState::Authenticating);
                }
                self.authenticated(identity).await
            }
            None => {
                info!("signed out");
                self.current = None;
                self.cached = None;
                SessionState::Unauthenticated
            }
        };

        self.shared.publish(state);
        self.resolved = true;
    }

    async fn authenticated(&mut self, identity: Identity) -> SessionState {
        let switched = self
            .current
            .as_ref()
            .is_none_or(|current| current.uid != identity.uid);
        if switched {
            self.cached = None;
        }
        self.current = Some(identity.clone());

        let shared = &self.shared;
        match shared.store.get(&shared.collection, &identity.uid).await {
            Ok(Some(doc)) => {
                let profile = Profile::from_document(&doc);
                if identity.email_verified && !profile.email_verified {
                    spawn_verified_mirror(shared, identity.uid.clone());
                }
                let user = EffectiveUser::merge(&identity, &profile);
                self.cached = Some(profile);
                info!(uid = %identity.uid, "session authenticated");
                SessionState::Authenticated(user)
            }
            Ok(None) => {
                warn!(uid = %identity.uid, "no profile document, using identity only");
                self.cached = None;
                SessionState::Authenticated(EffectiveUser::from_identity(&identity))
            }
            Err(err) => {
                let err = AuthError::Reconciliation(err);
                error!(uid = %identity.uid, error = %err, "profile fetch failed");
                shared.record_error(err.to_string());
                if self.cached.is_some() {
                    SessionState::Authenticated(EffectiveUser::from_identity(&identity))
                } else {
                    SessionState::Unauthenticated
                }
            }
        }
    }
}
