//! Helpers shared by the REST backends.

use anyhow::{Context, Result};
use reqwest::StatusCode;
use schoolhub_types::{BackendError, BackendErrorKind};
use serde_json::Value;

/// Standard User-Agent header for SchoolHub API requests.
pub const USER_AGENT: &str = concat!("schoolhub/", env!("CARGO_PKG_VERSION"));

pub const API_KEY_ENV: &str = "SCHOOLHUB_API_KEY";
pub const AUTH_URL_ENV: &str = "SCHOOLHUB_AUTH_URL";
pub const TOKEN_URL_ENV: &str = "SCHOOLHUB_TOKEN_URL";
pub const FIRESTORE_URL_ENV: &str = "SCHOOLHUB_FIRESTORE_URL";

pub const DEFAULT_AUTH_URL: &str = "https://identitytoolkit.googleapis.com";
pub const DEFAULT_TOKEN_URL: &str = "https://securetoken.googleapis.com";
pub const DEFAULT_FIRESTORE_URL: &str = "https://firestore.googleapis.com";

// ============================================================================
// Config resolution helpers
// ============================================================================

/// Resolves an API key with precedence: config > env.
///
/// # Errors
/// Returns an error if neither source provides a key.
pub fn resolve_api_key(config_api_key: Option<&str>, env_var: &str) -> Result<String> {
    if let Some(key) = config_api_key {
        let trimmed = key.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }

    std::env::var(env_var)
        .ok()
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
        .with_context(|| format!("No API key available. Set {env_var} or api_key in [firebase]."))
}

/// Resolves a base URL with precedence: env > config > default.
///
/// Trailing slashes are stripped so paths can be appended directly.
///
/// # Errors
/// Returns an error if the chosen URL is malformed.
pub fn resolve_base_url(
    config_base_url: Option<&str>,
    env_var: &str,
    default_url: &str,
    service_name: &str,
) -> Result<String> {
    if let Ok(env_url) = std::env::var(env_var) {
        let trimmed = env_url.trim();
        if !trimmed.is_empty() {
            validate_url(trimmed, service_name)?;
            return Ok(trimmed.trim_end_matches('/').to_string());
        }
    }

    if let Some(config_url) = config_base_url {
        let trimmed = config_url.trim();
        if !trimmed.is_empty() {
            validate_url(trimmed, service_name)?;
            return Ok(trimmed.trim_end_matches('/').to_string());
        }
    }

    Ok(default_url.to_string())
}

fn validate_url(url: &str, service_name: &str) -> Result<()> {
    url::Url::parse(url).with_context(|| format!("Invalid {service_name} base URL: {url}"))?;
    Ok(())
}

// ============================================================================
// Error mapping
// ============================================================================

pub(crate) fn classify_reqwest_error(e: &reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::new(BackendErrorKind::Timeout, format!("Request timed out: {e}"))
    } else if e.is_connect() {
        BackendError::unavailable(format!("Connection failed: {e}"))
    } else if e.is_decode() {
        BackendError::new(BackendErrorKind::Parse, format!("Invalid response: {e}"))
    } else {
        BackendError::new(BackendErrorKind::HttpStatus, format!("Network error: {e}"))
    }
}

/// Maps a non-success response to a [`BackendError`].
///
/// Google APIs answer with `{"error": {"code", "message", "status"}}`. For
/// client errors the message is the provider's code (`EMAIL_EXISTS`,
/// `WEAK_PASSWORD : ...`) and is surfaced verbatim as `Rejected`.
pub(crate) fn error_from_response(status: StatusCode, body: &str) -> BackendError {
    let message = serde_json::from_str::<Value>(body).ok().and_then(|json| {
        json.get("error")
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
    });

    let error = match (status, message) {
        (StatusCode::NOT_FOUND, message) => {
            BackendError::not_found(message.unwrap_or_else(|| "Not found".to_string()))
        }
        (status, Some(message)) if status.is_client_error() => BackendError::rejected(message),
        (status, _) if status == StatusCode::SERVICE_UNAVAILABLE => {
            BackendError::unavailable(format!("HTTP {}", status.as_u16()))
        }
        (status, Some(message)) => BackendError::new(
            BackendErrorKind::HttpStatus,
            format!("HTTP {}: {message}", status.as_u16()),
        ),
        (status, None) => {
            BackendError::new(BackendErrorKind::HttpStatus, format!("HTTP {}", status.as_u16()))
        }
    };

    if body.is_empty() {
        error
    } else {
        error.with_details(body)
    }
}

/// Reads a JSON body, mapping transport, status and parse failures.
pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, BackendError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| classify_reqwest_error(&e))?;
    if !status.is_success() {
        return Err(error_from_response(status, &body));
    }
    serde_json::from_str(&body).map_err(|e| {
        BackendError::new(BackendErrorKind::Parse, format!("Failed to parse response: {e}"))
            .with_details(body)
    })
}

/// Example value of a commented-out `[firebase]` override in the config template.
#[cfg(test)]
pub(crate) fn template_override(key: &str) -> String {
    let template = include_str!("../../schoolhub-core/default_config.toml");
    let prefix = format!("{key} =");
    let line = template
        .lines()
        .filter_map(|line| line.strip_prefix("# "))
        .find(|line| line.starts_with(&prefix))
        .unwrap_or_else(|| panic!("template has no example for {key}"));
    let table: toml::Table = toml::from_str(line).unwrap();
    table[key].as_str().unwrap().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_code_is_rejected_verbatim() {
        let body = r#"{"error":{"code":400,"message":"EMAIL_EXISTS","errors":[]}}"#;
        let err = error_from_response(StatusCode::BAD_REQUEST, body);
        assert_eq!(err.kind, BackendErrorKind::Rejected);
        assert_eq!(err.to_string(), "EMAIL_EXISTS");
        assert_eq!(err.details.as_deref(), Some(body));
    }

    #[test]
    fn test_not_found_and_server_errors() {
        let err = error_from_response(
            StatusCode::NOT_FOUND,
            r#"{"error":{"code":404,"message":"Document not found","status":"NOT_FOUND"}}"#,
        );
        assert!(err.is_not_found());
        assert_eq!(err.message, "Document not found");

        let err = error_from_response(StatusCode::INTERNAL_SERVER_ERROR, "");
        assert_eq!(err.kind, BackendErrorKind::HttpStatus);
        assert_eq!(err.message, "HTTP 500");
        assert!(err.details.is_none());

        let err = error_from_response(StatusCode::SERVICE_UNAVAILABLE, "busy");
        assert_eq!(err.kind, BackendErrorKind::Unavailable);
    }

    #[test]
    fn test_resolve_api_key_prefers_config() {
        let key = resolve_api_key(Some("  from-config "), "SCHOOLHUB_TEST_UNSET_KEY").unwrap();
        assert_eq!(key, "from-config");
        assert!(resolve_api_key(Some("  "), "SCHOOLHUB_TEST_UNSET_KEY").is_err());
    }

    #[test]
    fn test_resolve_base_url_validates_and_trims() {
        let url = resolve_base_url(
            Some("http://localhost:9099/"),
            "SCHOOLHUB_TEST_UNSET_URL",
            DEFAULT_AUTH_URL,
            "auth",
        )
        .unwrap();
        assert_eq!(url, "http://localhost:9099");

        let url =
            resolve_base_url(None, "SCHOOLHUB_TEST_UNSET_URL", DEFAULT_AUTH_URL, "auth").unwrap();
        assert_eq!(url, DEFAULT_AUTH_URL);

        let err = resolve_base_url(Some("not a url"), "SCHOOLHUB_TEST_UNSET_URL", "", "auth")
            .unwrap_err();
        assert!(err.to_string().contains("Invalid auth base URL"));
    }
}
