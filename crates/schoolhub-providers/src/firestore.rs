//! Cloud Firestore over the v1 REST API.

use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use schoolhub_types::{
    BackendError, BackendErrorKind, BackendResult, Document, DocumentStore, FieldValue, Fields,
};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::shared::{
    DEFAULT_FIRESTORE_URL, FIRESTORE_URL_ENV, USER_AGENT, classify_reqwest_error,
    error_from_response, read_json, resolve_base_url,
};

/// Supplies the bearer token for document requests.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// `Ok(None)` sends requests unauthenticated.
    async fn id_token(&self) -> BackendResult<Option<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirestoreConfig {
    pub project_id: String,
    pub base_url: String,
}

impl FirestoreConfig {
    /// # Errors
    /// Returns an error if no project id is configured or the URL is malformed.
    pub fn resolve(project_id: Option<&str>, base_url: Option<&str>) -> Result<Self> {
        let Some(project_id) = project_id.map(str::trim).filter(|p| !p.is_empty()) else {
            bail!("No Firebase project configured. Set project_id in [firebase].");
        };
        Ok(Self {
            project_id: project_id.to_string(),
            base_url: resolve_base_url(
                base_url,
                FIRESTORE_URL_ENV,
                DEFAULT_FIRESTORE_URL,
                "Firestore",
            )?,
        })
    }

    /// Resource name of the default database's document root.
    fn documents_root(&self) -> String {
        format!(
            "projects/{}/databases/(default)/documents",
            self.project_id
        )
    }
}

#[derive(Debug, Deserialize)]
struct DocumentResponse {
    name: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

/// Document store backed by Cloud Firestore.
pub struct Firestore {
    config: FirestoreConfig,
    http: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
}

impl Firestore {
    pub fn new(config: FirestoreConfig, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            tokens,
        }
    }

    fn document_name(&self, collection: &str, id: &str) -> String {
        format!("{}/{collection}/{id}", self.config.documents_root())
    }

    fn document_url(&self, collection: &str, id: &str) -> String {
        format!(
            "{}/v1/{}",
            self.config.base_url,
            self.document_name(collection, id)
        )
    }

    fn commit_url(&self) -> String {
        format!(
            "{}/v1/{}:commit",
            self.config.base_url,
            self.config.documents_root()
        )
    }

    async fn request(&self, method: reqwest::Method, url: &str) -> BackendResult<reqwest::RequestBuilder> {
        let mut builder = self
            .http
            .request(method, url)
            .header(reqwest::header::USER_AGENT, USER_AGENT);
        if let Some(token) = self.tokens.id_token().await? {
            builder = builder.bearer_auth(token);
        }
        Ok(builder)
    }

    async fn commit(&self, write: Value) -> BackendResult<()> {
        let response = self
            .request(reqwest::Method::POST, &self.commit_url())
            .await?
            .json(&json!({ "writes": [write] }))
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;
        let _: Value = read_json(response).await?;
        Ok(())
    }

    /// Builds a commit write. Server timestamps become `REQUEST_TIME` transforms.
    fn write(&self, collection: &str, id: &str, fields: &Fields, mask: Option<Vec<String>>) -> Value {
        let (values, transforms) = encode_fields(fields);
        let mut write = json!({
            "update": {
                "name": self.document_name(collection, id),
                "fields": values,
            },
        });
        if !transforms.is_empty() {
            write["updateTransforms"] = Value::Array(
                transforms
                    .into_iter()
                    .map(|path| json!({ "fieldPath": path, "setToServerValue": "REQUEST_TIME" }))
                    .collect(),
            );
        }
        if let Some(paths) = mask {
            write["updateMask"] = json!({ "fieldPaths": paths });
            write["currentDocument"] = json!({ "exists": true });
        }
        write
    }
}

#[async_trait]
impl DocumentStore for Firestore {
    async fn get(&self, collection: &str, id: &str) -> BackendResult<Option<Document>> {
        let response = self
            .request(reqwest::Method::GET, &self.document_url(collection, id))
            .await?
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        match read_json::<DocumentResponse>(response).await {
            Ok(doc) => {
                debug!(name = %doc.name, "fetched document");
                Ok(Some(Document::new(id, decode_fields(&doc.fields))))
            }
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn set(&self, collection: &str, id: &str, fields: Fields) -> BackendResult<()> {
        let write = self.write(collection, id, &fields, None);
        self.commit(write).await?;
        info!(collection, id, "document written");
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, fields: Fields) -> BackendResult<()> {
        if fields.values().any(|v| *v == FieldValue::ServerTimestamp) {
            let mask = fields
                .iter()
                .filter(|(_, v)| **v != FieldValue::ServerTimestamp)
                .map(|(k, _)| quote_field_path(k))
                .collect();
            let write = self.write(collection, id, &fields, Some(mask));
            return self.commit(write).await;
        }

        let paths: Vec<String> = fields.keys().map(|k| quote_field_path(k)).collect();
        let (values, _) = encode_fields(&fields);
        let mut query: Vec<(&str, &str)> = paths
            .iter()
            .map(|p| ("updateMask.fieldPaths", p.as_str()))
            .collect();
        query.push(("currentDocument.exists", "true"));

        let response = self
            .request(reqwest::Method::PATCH, &self.document_url(collection, id))
            .await?
            .query(&query)
            .json(&json!({ "fields": values }))
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_from_response(status, &body));
        }
        info!(collection, id, "document updated");
        Ok(())
    }
}

/// Field paths that are not plain identifiers must be backtick-quoted.
fn quote_field_path(key: &str) -> String {
    let simple = key
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if simple {
        key.to_string()
    } else {
        format!("`{}`", key.replace('\\', "\\\\").replace('`', "\\`"))
    }
}

// ============================================================================
// Value codec
// ============================================================================

/// Encodes fields into Firestore's typed value format.
///
/// Returns the encoded map plus the keys that hold server timestamps, which
/// Firestore expects as transforms rather than values.
pub fn encode_fields(fields: &Fields) -> (Map<String, Value>, Vec<String>) {
    let mut values = Map::new();
    let mut transforms = Vec::new();
    for (key, value) in fields {
        match encode_value(value) {
            Some(encoded) => {
                values.insert(key.clone(), encoded);
            }
            None => transforms.push(quote_field_path(key)),
        }
    }
    (values, transforms)
}

/// `None` for server timestamps.
pub fn encode_value(value: &FieldValue) -> Option<Value> {
    let encoded = match value {
        FieldValue::Null => json!({ "nullValue": null }),
        FieldValue::Bool(b) => json!({ "booleanValue": b }),
        FieldValue::Integer(i) => json!({ "integerValue": i.to_string() }),
        FieldValue::Double(d) => json!({ "doubleValue": d }),
        FieldValue::String(s) => json!({ "stringValue": s }),
        FieldValue::Timestamp(ts) => {
            json!({ "timestampValue": ts.to_rfc3339_opts(SecondsFormat::Micros, true) })
        }
        FieldValue::ServerTimestamp => return None,
    };
    Some(encoded)
}

/// Decodes Firestore fields. Values of unsupported types are skipped.
pub fn decode_fields(fields: &Map<String, Value>) -> Fields {
    fields
        .iter()
        .filter_map(|(key, value)| match decode_value(value) {
            Ok(decoded) => Some((key.clone(), decoded)),
            Err(err) => {
                debug!(field = %key, error = %err, "skipping field");
                None
            }
        })
        .collect()
}

/// # Errors
/// Returns a `Parse` error for malformed or unsupported values.
pub fn decode_value(value: &Value) -> BackendResult<FieldValue> {
    let parse_error = |message: String| BackendError::new(BackendErrorKind::Parse, message);
    let Some((kind, inner)) = value.as_object().and_then(|o| o.iter().next()) else {
        return Err(parse_error(format!("Expected a typed value, got {value}")));
    };

    match kind.as_str() {
        "nullValue" => Ok(FieldValue::Null),
        "booleanValue" => inner
            .as_bool()
            .map(FieldValue::Bool)
            .ok_or_else(|| parse_error(format!("Invalid boolean: {inner}"))),
        // 64-bit integers travel as strings.
        "integerValue" => inner
            .as_str()
            .and_then(|s| s.parse().ok())
            .or_else(|| inner.as_i64())
            .map(FieldValue::Integer)
            .ok_or_else(|| parse_error(format!("Invalid integer: {inner}"))),
        "doubleValue" => inner
            .as_f64()
            .map(FieldValue::Double)
            .ok_or_else(|| parse_error(format!("Invalid double: {inner}"))),
        "stringValue" => inner
            .as_str()
            .map(|s| FieldValue::String(s.to_string()))
            .ok_or_else(|| parse_error(format!("Invalid string: {inner}"))),
        "timestampValue" => inner
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|ts| FieldValue::Timestamp(ts.with_timezone(&Utc)))
            .ok_or_else(|| parse_error(format!("Invalid timestamp: {inner}"))),
        other => Err(parse_error(format!("Unsupported value type: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::shared::template_override;

    struct Anonymous;

    #[async_trait]
    impl TokenSource for Anonymous {
        async fn id_token(&self) -> BackendResult<Option<String>> {
            Ok(None)
        }
    }

    #[test]
    fn test_template_endpoint_builds_v1_urls() {
        let base_url = template_override("firestore_base_url");
        let config = FirestoreConfig::resolve(Some("demo"), Some(&base_url)).unwrap();
        let store = Firestore::new(config, Arc::new(Anonymous));

        assert_eq!(
            store.document_url("customers", "u1"),
            "https://firestore.googleapis.com/v1/projects/demo/databases/(default)/documents/customers/u1"
        );
        assert_eq!(
            store.commit_url(),
            "https://firestore.googleapis.com/v1/projects/demo/databases/(default)/documents:commit"
        );
    }

    #[test]
    fn test_encode_splits_server_timestamps() {
        let mut fields = Fields::new();
        fields.insert("username".into(), "alice".into());
        fields.insert("age".into(), FieldValue::Integer(12));
        fields.insert("emailVerified".into(), FieldValue::Bool(false));
        fields.insert("joinedAt".into(), FieldValue::ServerTimestamp);

        let (values, transforms) = encode_fields(&fields);
        assert_eq!(values["username"], json!({ "stringValue": "alice" }));
        assert_eq!(values["age"], json!({ "integerValue": "12" }));
        assert_eq!(values["emailVerified"], json!({ "booleanValue": false }));
        assert!(!values.contains_key("joinedAt"));
        assert_eq!(transforms, vec!["joinedAt".to_string()]);
    }

    #[test]
    fn test_decode_typed_values() {
        let raw = json!({
            "role": { "stringValue": "user" },
            "age": { "integerValue": "12" },
            "score": { "doubleValue": 4.5 },
            "emailVerified": { "booleanValue": true },
            "joinedAt": { "timestampValue": "2024-03-01T10:00:00.123456Z" },
            "nickname": { "nullValue": null },
            "tags": { "arrayValue": { "values": [] } }
        });
        let fields = decode_fields(raw.as_object().unwrap());

        assert_eq!(fields["role"], FieldValue::from("user"));
        assert_eq!(fields["age"], FieldValue::Integer(12));
        assert_eq!(fields["score"], FieldValue::Double(4.5));
        assert_eq!(fields["emailVerified"], FieldValue::Bool(true));
        assert_eq!(fields["nickname"], FieldValue::Null);
        assert!(!fields.contains_key("tags"));

        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
            + chrono::Duration::microseconds(123_456);
        assert_eq!(fields["joinedAt"], FieldValue::Timestamp(expected));
    }

    #[test]
    fn test_decode_rejects_untyped() {
        let err = decode_value(&json!("plain")).unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::Parse);
    }

    #[test]
    fn test_quote_field_path() {
        assert_eq!(quote_field_path("emailVerified"), "emailVerified");
        assert_eq!(quote_field_path("home address"), "`home address`");
        assert_eq!(quote_field_path("2fa"), "`2fa`");
    }

    #[test]
    fn test_resolve_requires_project() {
        assert!(FirestoreConfig::resolve(None, None).is_err());
        assert!(FirestoreConfig::resolve(Some("  "), None).is_err());
        let config = FirestoreConfig::resolve(Some("demo"), Some("http://localhost:8080")).unwrap();
        assert_eq!(
            config.documents_root(),
            "projects/demo/databases/(default)/documents"
        );
    }
}
