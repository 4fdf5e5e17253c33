//! The merged identity + profile view handed to screens.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::identity::Identity;
use crate::profile::{Fields, Profile, field};

/// In-memory union of an [`Identity`] and its optional [`Profile`].
///
/// Profile values win on key collisions, except `email_verified`, which is the
/// OR of the provider's live flag and the mirrored one.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveUser {
    pub uid: String,
    pub email: String,
    pub display_name: Option<String>,
    pub email_verified: bool,
    pub username: Option<String>,
    pub phone: Option<String>,
    pub role: Option<String>,
    pub joined_at: Option<DateTime<Utc>>,
    pub extra: Fields,
    /// The provider record this view was built from.
    pub identity: Identity,
    pub has_profile: bool,
}

impl EffectiveUser {
    /// Degraded view for an identity without a stored profile.
    pub fn from_identity(identity: &Identity) -> Self {
        Self {
            uid: identity.uid.clone(),
            email: identity.email.clone(),
            display_name: identity.display_name.clone(),
            email_verified: identity.email_verified,
            username: None,
            phone: None,
            role: None,
            joined_at: None,
            extra: Fields::new(),
            identity: identity.clone(),
            has_profile: false,
        }
    }

    pub fn merge(identity: &Identity, profile: &Profile) -> Self {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());

        Self {
            uid: non_empty(&profile.uid).unwrap_or_else(|| identity.uid.clone()),
            email: non_empty(&profile.email).unwrap_or_else(|| identity.email.clone()),
            display_name: identity.display_name.clone(),
            email_verified: identity.email_verified || profile.email_verified,
            username: non_empty(&profile.username),
            phone: non_empty(&profile.phone),
            role: Some(profile.role.clone()),
            joined_at: profile.joined_at,
            extra: profile.extra.clone(),
            identity: identity.clone(),
            has_profile: true,
        }
    }

    /// Name to greet the user with: username, then display name, then email.
    pub fn label(&self) -> &str {
        self.username
            .as_deref()
            .or(self.display_name.as_deref())
            .unwrap_or(&self.email)
    }

    /// Flat JSON rendering using the stored field names.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (key, value) in &self.extra {
            map.insert(key.clone(), value.to_json());
        }
        map.insert(field::UID.into(), Value::String(self.uid.clone()));
        map.insert(field::EMAIL.into(), Value::String(self.email.clone()));
        if let Some(name) = &self.display_name {
            map.insert("displayName".into(), Value::String(name.clone()));
        }
        map.insert(field::EMAIL_VERIFIED.into(), Value::Bool(self.email_verified));
        let optional = [
            (field::USERNAME, &self.username),
            (field::PHONE, &self.phone),
            (field::ROLE, &self.role),
        ];
        for (key, value) in optional {
            if let Some(v) = value {
                map.insert(key.into(), Value::String(v.clone()));
            }
        }
        if let Some(ts) = self.joined_at {
            map.insert(field::JOINED_AT.into(), Value::String(ts.to_rfc3339()));
        }
        Value::Object(map)
    }
}
