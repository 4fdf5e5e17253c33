//! Profile command handlers.

use anyhow::{Context, Result, bail};
use schoolhub_core::guard::require_user;
use schoolhub_core::session::SessionManager;
use schoolhub_types::{FieldValue, ProfileUpdate};

use super::settle_user;

pub async fn show(session: &SessionManager) -> Result<()> {
    let user = require_user(session).await?;
    let Some(profile) = session.fetch_profile().await? else {
        println!("No profile stored for {}", user.email);
        return Ok(());
    };

    println!("uid: {}", profile.uid);
    println!("username: {}", profile.username);
    println!("email: {}", profile.email);
    println!("phone: {}", profile.phone);
    println!("role: {}", profile.role);
    println!("emailVerified: {}", profile.email_verified);
    if let Some(joined_at) = profile.joined_at {
        println!("joinedAt: {}", joined_at.to_rfc3339());
    }
    for (key, value) in &profile.extra {
        println!("{key}: {value}");
    }
    Ok(())
}

pub async fn set(
    session: &SessionManager,
    username: Option<String>,
    phone: Option<String>,
    fields: &[String],
) -> Result<()> {
    let mut update = ProfileUpdate::new();
    if let Some(username) = username {
        update = update.username(username);
    }
    if let Some(phone) = phone {
        update = update.phone(phone);
    }
    for raw in fields {
        let (key, value) = parse_field(raw)?;
        update = update.field(key, value);
    }
    if update.is_empty() {
        bail!("Nothing to update. Pass --username, --phone or --field KEY=VALUE.");
    }

    let user = require_user(session).await?;
    let expected = update.clone().into_fields();
    session.update_profile(update).await?;

    // Wait for the re-merged view so the printed label is current.
    let merged = settle_user(session, &user.uid, |u| {
        expected.iter().all(|(k, v)| match k.as_str() {
            "username" => u.username.as_deref() == v.as_str(),
            "phone" => u.phone.as_deref() == v.as_str(),
            _ => u.extra.get(k) == Some(v),
        })
    })
    .await;
    let label = merged.as_ref().map_or(user.label(), |u| u.label());
    println!("Updated profile for {label}");
    Ok(())
}

fn parse_field(raw: &str) -> Result<(&str, FieldValue)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("Invalid field '{raw}': expected KEY=VALUE"))?;
    let key = key.trim();
    if key.is_empty() {
        bail!("Invalid field '{raw}': empty key");
    }
    Ok((key, FieldValue::infer(value.trim())))
}
