//! Account command handlers.

use anyhow::Result;
use schoolhub_core::guard::require_user;
use schoolhub_core::session::{SessionManager, SessionState};
use tracing::info;

use super::{SETTLE_TIMEOUT, settle_user};

pub async fn register(
    session: &SessionManager,
    email: &str,
    password: &str,
    username: &str,
    phone: &str,
) -> Result<()> {
    let credential = session.register(email, password, username, phone).await?;
    let uid = credential.identity.uid;
    info!(uid = %uid, "registered from cli");

    let label = settle_user(session, &uid, |u| u.has_profile)
        .await
        .map_or_else(|| email.to_string(), |u| u.label().to_string());
    println!("Registered {label} ({uid}). Check {email} for a verification link.");
    Ok(())
}

pub async fn login(session: &SessionManager, email: &str, password: &str) -> Result<()> {
    let credential = session.login(email, password).await?;
    let uid = credential.identity.uid;

    let label = settle_user(session, &uid, |_| true)
        .await
        .map_or_else(|| email.to_string(), |u| u.label().to_string());
    println!("Signed in as {label}");
    Ok(())
}

pub async fn logout(session: &SessionManager) -> Result<()> {
    let was = session.current_user();
    session.logout().await?;
    // Best effort: the reconciler publishes the sign-out shortly after.
    let _ = tokio::time::timeout(
        SETTLE_TIMEOUT,
        session.wait_for(|s| s.state == SessionState::Unauthenticated),
    )
    .await;

    match was {
        Some(user) => println!("Signed out {}", user.email),
        None => println!("Not signed in"),
    }
    Ok(())
}

pub async fn reset_password(session: &SessionManager, email: &str) -> Result<()> {
    session.reset_password(email).await?;
    println!("Password reset email sent to {email}");
    Ok(())
}

pub async fn whoami(session: &SessionManager, json: bool) -> Result<()> {
    let user = require_user(session).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&user.to_json())?);
        return Ok(());
    }

    let verified = if user.email_verified {
        "verified"
    } else {
        "unverified"
    };
    let role = user.role.as_deref().unwrap_or("no profile");
    println!("{} <{}> [{role}, {verified}]", user.label(), user.email);
    Ok(())
}

pub async fn change_password(session: &SessionManager, password: &str, confirm: &str) -> Result<()> {
    session.change_password(password, confirm).await?;
    println!("Password updated");
    Ok(())
}
