//! Route guard for authenticated-only screens.

use schoolhub_types::EffectiveUser;

use crate::session::{AuthError, SessionManager, SessionSnapshot, SessionState};

/// Where unauthenticated users are sent.
pub const LOGIN_ROUTE: &str = "/login";

#[derive(Debug, Clone, PartialEq)]
pub enum RouteDecision {
    /// Not loaded yet; render nothing.
    Loading,
    Allow(EffectiveUser),
    RedirectToLogin,
}

impl RouteDecision {
    /// Route to navigate to, if any.
    pub fn redirect(&self) -> Option<&'static str> {
        matches!(self, RouteDecision::RedirectToLogin).then_some(LOGIN_ROUTE)
    }
}

/// Decides whether a protected screen may render for `snapshot`.
pub fn guard(snapshot: &SessionSnapshot) -> RouteDecision {
    match &snapshot.state {
        SessionState::Unknown | SessionState::Authenticating => RouteDecision::Loading,
        SessionState::Authenticated(user) => RouteDecision::Allow(user.clone()),
        SessionState::Unauthenticated | SessionState::Error(_) => RouteDecision::RedirectToLogin,
    }
}

/// Waits for the loading gate, then returns the signed-in user.
///
/// # Errors
/// `NotAuthenticated` when nobody is signed in.
pub async fn require_user(session: &SessionManager) -> Result<EffectiveUser, AuthError> {
    let snapshot = session.wait_until_loaded().await;
    match guard(&snapshot) {
        RouteDecision::Allow(user) => Ok(user),
        RouteDecision::Loading | RouteDecision::RedirectToLogin => Err(AuthError::NotAuthenticated),
    }
}
