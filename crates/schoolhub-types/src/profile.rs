//! Profile documents stored in the document database.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Field names used by profile documents.
pub mod field {
    pub const UID: &str = "uid";
    pub const USERNAME: &str = "username";
    pub const EMAIL: &str = "email";
    pub const PHONE: &str = "phone";
    pub const ROLE: &str = "role";
    pub const EMAIL_VERIFIED: &str = "emailVerified";
    pub const JOINED_AT: &str = "joinedAt";
}

/// A single document field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Double(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    /// Resolved by the store to its own clock when the write is applied.
    ServerTimestamp,
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    /// Infers a typed value from free text (`true`/`false`, integers, decimals, else string).
    pub fn infer(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed {
            "true" => return FieldValue::Bool(true),
            "false" => return FieldValue::Bool(false),
            "null" => return FieldValue::Null,
            _ => {}
        }
        if let Ok(n) = trimmed.parse::<i64>() {
            return FieldValue::Integer(n);
        }
        if trimmed.contains('.')
            && let Ok(f) = trimmed.parse::<f64>()
            && f.is_finite()
        {
            return FieldValue::Double(f);
        }
        FieldValue::String(raw.to_string())
    }

    /// JSON rendering for display.
    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Null | FieldValue::ServerTimestamp => Value::Null,
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Integer(n) => Value::from(*n),
            FieldValue::Double(f) => Value::from(*f),
            FieldValue::String(s) => Value::String(s.clone()),
            FieldValue::Timestamp(ts) => Value::String(ts.to_rfc3339()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => write!(f, "null"),
            FieldValue::Bool(b) => write!(f, "{b}"),
            FieldValue::Integer(n) => write!(f, "{n}"),
            FieldValue::Double(d) => write!(f, "{d}"),
            FieldValue::String(s) => write!(f, "{s}"),
            FieldValue::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            FieldValue::ServerTimestamp => write!(f, "<server time>"),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

/// Ordered field map (stable output for display and wire encoding).
pub type Fields = BTreeMap<String, FieldValue>;

/// A stored document: its id plus fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }
}

/// Application-level user attributes, keyed by identity id.
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub uid: String,
    pub username: String,
    pub email: String,
    pub phone: String,
    pub role: String,
    /// Mirrored copy of the provider's verification flag.
    pub email_verified: bool,
    pub joined_at: Option<DateTime<Utc>>,
    /// Free-form fields added by profile edits (age, address, ...).
    pub extra: Fields,
}

impl Profile {
    /// Collection holding profile documents unless configured otherwise.
    pub const DEFAULT_COLLECTION: &str = "customers";
    pub const DEFAULT_ROLE: &str = "user";

    const RESERVED: [&str; 5] = [
        field::UID,
        field::ROLE,
        field::EMAIL_VERIFIED,
        field::JOINED_AT,
        field::EMAIL,
    ];

    /// Fields written once when an account registers.
    pub fn registration_fields(uid: &str, username: &str, email: &str, phone: &str) -> Fields {
        let mut fields = Fields::new();
        fields.insert(field::USERNAME.into(), username.into());
        fields.insert(field::EMAIL.into(), email.into());
        fields.insert(field::PHONE.into(), phone.into());
        fields.insert(field::EMAIL_VERIFIED.into(), FieldValue::Bool(false));
        fields.insert(field::JOINED_AT.into(), FieldValue::ServerTimestamp);
        fields.insert(field::UID.into(), uid.into());
        fields.insert(field::ROLE.into(), Self::DEFAULT_ROLE.into());
        fields
    }

    /// Builds a profile from a stored document.
    ///
    /// Missing or mistyped fields fall back to empty values; `uid` falls back to
    /// the document id and `role` to the default role.
    pub fn from_document(doc: &Document) -> Self {
        let text = |key: &str| {
            doc.get(key)
                .and_then(FieldValue::as_str)
                .unwrap_or_default()
                .to_string()
        };

        let uid = doc
            .get(field::UID)
            .and_then(FieldValue::as_str)
            .unwrap_or(&doc.id)
            .to_string();
        let role = doc
            .get(field::ROLE)
            .and_then(FieldValue::as_str)
            .filter(|r| !r.is_empty())
            .unwrap_or(Self::DEFAULT_ROLE)
            .to_string();

        let known = [
            field::UID,
            field::USERNAME,
            field::EMAIL,
            field::PHONE,
            field::ROLE,
            field::EMAIL_VERIFIED,
            field::JOINED_AT,
        ];
        let extra = doc
            .fields
            .iter()
            .filter(|(k, _)| !known.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Self {
            uid,
            username: text(field::USERNAME),
            email: text(field::EMAIL),
            phone: text(field::PHONE),
            role,
            email_verified: doc
                .get(field::EMAIL_VERIFIED)
                .and_then(FieldValue::as_bool)
                .unwrap_or(false),
            joined_at: doc.get(field::JOINED_AT).and_then(FieldValue::as_timestamp),
            extra,
        }
    }

    /// Returns true for keys that profile edits may not touch.
    pub fn is_reserved(key: &str) -> bool {
        Self::RESERVED.contains(&key)
    }
}

/// A partial profile edit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileUpdate {
    pub username: Option<String>,
    pub phone: Option<String>,
    pub extra: Fields,
}

impl ProfileUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    #[must_use]
    pub fn phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    #[must_use]
    pub fn field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_none() && self.phone.is_none() && self.extra.is_empty()
    }

    /// First free-form key that collides with a reserved profile field.
    pub fn reserved_key(&self) -> Option<&str> {
        self.extra
            .keys()
            .map(String::as_str)
            .find(|k| Profile::is_reserved(k))
    }

    pub fn into_fields(self) -> Fields {
        let mut fields = self.extra;
        if let Some(username) = self.username {
            fields.insert(field::USERNAME.into(), username.into());
        }
        if let Some(phone) = self.phone {
            fields.insert(field::PHONE.into(), phone.into());
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_fields_defaults() {
        let fields = Profile::registration_fields("u1", "alice", "a@x.com", "555-0100");
        assert_eq!(fields[field::ROLE], FieldValue::from("user"));
        assert_eq!(fields[field::EMAIL_VERIFIED], FieldValue::Bool(false));
        assert_eq!(fields[field::JOINED_AT], FieldValue::ServerTimestamp);
        assert_eq!(fields[field::UID], FieldValue::from("u1"));
    }

    #[test]
    fn test_from_document_keeps_extra_fields() {
        let mut fields = Profile::registration_fields("u1", "alice", "a@x.com", "555-0100");
        fields.insert("age".into(), FieldValue::Integer(31));
        fields.insert(field::JOINED_AT.into(), FieldValue::Null);
        let profile = Profile::from_document(&Document::new("u1", fields));

        assert_eq!(profile.username, "alice");
        assert_eq!(profile.role, "user");
        assert!(!profile.email_verified);
        assert_eq!(profile.joined_at, None);
        assert_eq!(profile.extra.get("age"), Some(&FieldValue::Integer(31)));
        assert!(!profile.extra.contains_key(field::USERNAME));
    }

    #[test]
    fn test_from_document_falls_back_to_doc_id() {
        let profile = Profile::from_document(&Document::new("doc-7", Fields::new()));
        assert_eq!(profile.uid, "doc-7");
        assert_eq!(profile.role, Profile::DEFAULT_ROLE);
    }

    #[test]
    fn test_update_detects_reserved_keys() {
        let update = ProfileUpdate::new().field("address", "Main St").field("role", "admin");
        assert_eq!(update.reserved_key(), Some("role"));

        let update = ProfileUpdate::new().username("bob").field("age", 12_i64);
        assert_eq!(update.reserved_key(), None);
        let fields = update.into_fields();
        assert_eq!(fields[field::USERNAME], FieldValue::from("bob"));
        assert_eq!(fields["age"], FieldValue::Integer(12));
    }

    #[test]
    fn test_infer_field_values() {
        assert_eq!(FieldValue::infer("true"), FieldValue::Bool(true));
        assert_eq!(FieldValue::infer("42"), FieldValue::Integer(42));
        assert_eq!(FieldValue::infer("4.5"), FieldValue::Double(4.5));
        assert_eq!(FieldValue::infer("1.5e400"), FieldValue::from("1.5e400"));
        assert_eq!(FieldValue::infer("555-0100"), FieldValue::from("555-0100"));
    }
}
