//! Managed-user records
//!
//! [`ManagedUserRecord`] follows the IdP's user representation (camelCase,
//! list-valued attributes). Fields the gateway does not model are kept in
//! [`ManagedUserRecord::extra`] so a read-modify-write cycle never drops them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Attribute linking a managed identity to the identity that created it.
pub const OWNER_ATTRIBUTE: &str = "created_by";
/// Attribute linking a managed identity to its professor.
pub const PROFESSOR_ATTRIBUTE: &str = "professor_id";
/// Gender attribute
pub const GENDER_ATTRIBUTE: &str = "gender";
/// Birth date attribute
pub const BIRTH_DATE_ATTRIBUTE: &str = "birth_date";
/// Phone number attribute
pub const PHONE_ATTRIBUTE: &str = "phone_number";

/// Attributes an update is allowed to touch.
const MUTABLE_ATTRIBUTES: [&str; 3] = [GENDER_ATTRIBUTE, BIRTH_DATE_ATTRIBUTE, PHONE_ATTRIBUTE];

fn default_enabled() -> bool {
    true
}

/// A user managed through the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedUserRecord {
    /// Unique id
    #[serde(default)]
    pub id: String,
    /// Login name (the IdP uses the email)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Email
    #[serde(default)]
    pub email: String,
    /// Given name
    #[serde(default)]
    pub first_name: String,
    /// Family name
    #[serde(default)]
    pub last_name: String,
    /// Whether the account is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Application role label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Custom attributes
    #[serde(default)]
    pub attributes: BTreeMap<String, Vec<String>>,
    /// Creation time (Unix millis)
    #[serde(default)]
    pub created_timestamp: i64,
    /// Representation fields not modelled above
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ManagedUserRecord {
    /// First value of an attribute, if non-empty.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Replace an attribute with a single value.
    pub fn set_attribute(&mut self, name: &str, value: impl Into<String>) {
        self.attributes.insert(name.to_string(), vec![value.into()]);
    }

    /// Owner reference (`created_by`).
    #[must_use]
    pub fn owner(&self) -> Option<&str> {
        self.attribute(OWNER_ATTRIBUTE)
    }

    /// Linked professor reference (`professor_id`).
    #[must_use]
    pub fn professor(&self) -> Option<&str> {
        self.attribute(PROFESSOR_ATTRIBUTE)
    }

    /// "First Last", falling back to the email when both are blank.
    #[must_use]
    pub fn display_name(&self) -> String {
        let name = format!("{} {}", self.first_name, self.last_name);
        let name = name.trim();
        if name.is_empty() {
            self.email.clone()
        } else {
            name.to_string()
        }
    }

    /// Merge the whitelisted fields of `patch` into this record.
    ///
    /// Names, the enabled flag and the gender / birth date / phone attributes
    /// are mutable. The email is not touched here (see
    /// [`ManagedUserRecord::apply_email`]). Any other attribute key, the owner
    /// attribute included, is left unchanged and reported back.
    pub fn apply_patch(&mut self, patch: &UserPatch) -> PatchReport {
        if let Some(first) = patch.first_name.as_deref().filter(|s| !s.is_empty()) {
            self.first_name = first.to_string();
        }
        if let Some(last) = patch.last_name.as_deref().filter(|s| !s.is_empty()) {
            self.last_name = last.to_string();
        }
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }

        let mut report = PatchReport::default();
        for (key, value) in &patch.attributes {
            if MUTABLE_ATTRIBUTES.contains(&key.as_str()) {
                self.attributes.insert(key.clone(), value.clone().into_vec());
            } else {
                report.ignored.push(key.clone());
            }
        }

        let direct = [
            (GENDER_ATTRIBUTE, &patch.gender),
            (BIRTH_DATE_ATTRIBUTE, &patch.birthdate),
            (PHONE_ATTRIBUTE, &patch.phone_number),
        ];
        for (name, value) in direct {
            if let Some(v) = value.as_deref().filter(|s| !s.is_empty()) {
                self.set_attribute(name, v);
            }
        }

        report
    }

    /// Change the email; the username follows when it mirrored the old email.
    pub fn apply_email(&mut self, email: &str) {
        if self.username.as_deref() == Some(self.email.as_str()) {
            self.username = Some(email.to_string());
        }
        self.email = email.to_string();
    }
}

/// Fields reported back by [`ManagedUserRecord::apply_patch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchReport {
    /// Attribute keys that were supplied but not applied
    pub ignored: Vec<String>,
}

impl PatchReport {
    /// Whether the patch tried to change the owner attribute.
    #[must_use]
    pub fn touched_owner(&self) -> bool {
        self.ignored.iter().any(|k| k == OWNER_ATTRIBUTE)
    }
}

/// An attribute value supplied as a single string or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// Single value
    One(String),
    /// Multiple values
    Many(Vec<String>),
}

impl AttributeValue {
    /// Normalize to the list form the IdP stores.
    #[must_use]
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(v) => vec![v],
            Self::Many(v) => v,
        }
    }
}

/// Input for creating a managed user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    /// Email, also used as the username
    #[serde(default)]
    pub email: String,
    /// Given name
    #[serde(default)]
    pub first_name: String,
    /// Family name
    #[serde(default)]
    pub last_name: String,
    /// Full name, split when `first_name` is blank
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Enabled flag (defaults to enabled)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Gender
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    /// Birth date
    #[serde(default, alias = "birth_date", skip_serializing_if = "Option::is_none")]
    pub birthdate: Option<String>,
    /// Phone number
    #[serde(
        default,
        rename = "phone_number",
        alias = "phone",
        skip_serializing_if = "Option::is_none"
    )]
    pub phone_number: Option<String>,
    /// Requested owner; defaults to the caller
    #[serde(default, rename = "created_by", skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    /// Requested professor; defaults to the caller
    #[serde(default, rename = "professor_id", skip_serializing_if = "Option::is_none")]
    pub professor_id: Option<String>,
    /// Initial password; a temporary one is generated when absent
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

impl NewUser {
    /// Given and family name, splitting `name` on the first whitespace when
    /// `first_name` is blank.
    #[must_use]
    pub fn names(&self) -> (String, String) {
        if self.first_name.is_empty() {
            if let Some(name) = self.name.as_deref() {
                let mut parts = name.trim().splitn(2, char::is_whitespace);
                let first = parts.next().unwrap_or_default().to_string();
                let last = parts.next().unwrap_or_default().trim().to_string();
                return (first, last);
            }
        }
        (self.first_name.clone(), self.last_name.clone())
    }

    /// Build the record for this input, stamped with `owner` and `professor`.
    #[must_use]
    pub fn to_record(
        &self,
        id: impl Into<String>,
        owner: &str,
        professor: &str,
        created_timestamp: i64,
    ) -> ManagedUserRecord {
        let (first_name, last_name) = self.names();
        let mut attributes = BTreeMap::new();
        attributes.insert(
            GENDER_ATTRIBUTE.to_string(),
            vec![self.gender.clone().unwrap_or_default()],
        );
        attributes.insert(
            BIRTH_DATE_ATTRIBUTE.to_string(),
            vec![self.birthdate.clone().unwrap_or_default()],
        );
        attributes.insert(
            PHONE_ATTRIBUTE.to_string(),
            vec![self.phone_number.clone().unwrap_or_default()],
        );
        attributes.insert(OWNER_ATTRIBUTE.to_string(), vec![owner.to_string()]);
        attributes.insert(PROFESSOR_ATTRIBUTE.to_string(), vec![professor.to_string()]);

        ManagedUserRecord {
            id: id.into(),
            username: Some(self.email.clone()),
            email: self.email.clone(),
            first_name,
            last_name,
            enabled: self.enabled.unwrap_or(true),
            role: None,
            attributes,
            created_timestamp,
            extra: Map::new(),
        }
    }
}

/// Partial update of a managed user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPatch {
    /// Given name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    /// Family name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    /// Email (privileged path only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Enabled flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Gender
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    /// Birth date
    #[serde(default, alias = "birth_date", skip_serializing_if = "Option::is_none")]
    pub birthdate: Option<String>,
    /// Phone number
    #[serde(
        default,
        rename = "phone_number",
        alias = "phone",
        skip_serializing_if = "Option::is_none"
    )]
    pub phone_number: Option<String>,
    /// Raw attribute updates
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, AttributeValue>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ManagedUserRecord {
        NewUser {
            email: "ana@example.com".to_string(),
            first_name: "Ana".to_string(),
            last_name: "Soto".to_string(),
            gender: Some("F".to_string()),
            ..NewUser::default()
        }
        .to_record("id-1", "owner-1", "prof-1", 1_700_000_000_000)
    }

    #[test]
    fn to_record_stamps_owner_and_professor() {
        let r = record();
        assert_eq!(r.owner(), Some("owner-1"));
        assert_eq!(r.professor(), Some("prof-1"));
        assert_eq!(r.username.as_deref(), Some("ana@example.com"));
        assert_eq!(r.attribute(GENDER_ATTRIBUTE), Some("F"));
        assert_eq!(r.attribute(PHONE_ATTRIBUTE), None);
        assert!(r.enabled);
    }

    #[test]
    fn names_split_full_name_when_first_name_blank() {
        let input = NewUser {
            name: Some("Carlos  de la Vega".to_string()),
            ..NewUser::default()
        };
        assert_eq!(input.names(), ("Carlos".to_string(), "de la Vega".to_string()));
    }

    #[test]
    fn patch_cannot_touch_owner() {
        let mut r = record();
        let mut patch = UserPatch::default();
        patch
            .attributes
            .insert(OWNER_ATTRIBUTE.to_string(), AttributeValue::Many(vec!["other".into()]));
        patch
            .attributes
            .insert(PHONE_ATTRIBUTE.to_string(), AttributeValue::One("+56 9 1111".into()));

        let report = r.apply_patch(&patch);

        assert_eq!(r.owner(), Some("owner-1"));
        assert_eq!(r.attribute(PHONE_ATTRIBUTE), Some("+56 9 1111"));
        assert!(report.touched_owner());
    }

    #[test]
    fn patch_applies_whitelisted_fields() {
        let mut r = record();
        let patch = UserPatch {
            first_name: Some("Anita".to_string()),
            last_name: Some(String::new()),
            enabled: Some(false),
            birthdate: Some("1999-01-02".to_string()),
            email: Some("new@example.com".to_string()),
            ..UserPatch::default()
        };

        let report = r.apply_patch(&patch);

        assert_eq!(r.first_name, "Anita");
        assert_eq!(r.last_name, "Soto");
        assert!(!r.enabled);
        assert_eq!(r.attribute(BIRTH_DATE_ATTRIBUTE), Some("1999-01-02"));
        assert_eq!(r.email, "ana@example.com");
        assert!(report.ignored.is_empty());
    }

    #[test]
    fn apply_email_moves_mirrored_username() {
        let mut r = record();
        r.apply_email("ana.soto@example.com");
        assert_eq!(r.email, "ana.soto@example.com");
        assert_eq!(r.username.as_deref(), Some("ana.soto@example.com"));
    }

    #[test]
    fn unknown_representation_fields_survive_round_trip() {
        let json = r#"{
            "id": "kc-1",
            "username": "ana@example.com",
            "email": "ana@example.com",
            "emailVerified": true,
            "attributes": {"created_by": ["owner-1"]}
        }"#;
        let r: ManagedUserRecord = serde_json::from_str(json).unwrap();
        assert_eq!(r.extra.get("emailVerified"), Some(&Value::Bool(true)));
        assert!(r.enabled);

        let back = serde_json::to_value(&r).unwrap();
        assert_eq!(back["emailVerified"], Value::Bool(true));
        assert_eq!(back["attributes"]["created_by"][0], "owner-1");
    }

    #[test]
    fn patch_accepts_string_or_list_attributes() {
        let patch: UserPatch = serde_json::from_str(
            r#"{"attributes": {"gender": "M", "phone_number": ["1", "2"]}, "phone": "3"}"#,
        )
        .unwrap();
        assert_eq!(
            patch.attributes.get("gender"),
            Some(&AttributeValue::One("M".to_string()))
        );
        assert_eq!(patch.phone_number.as_deref(), Some("3"));
    }

    #[test]
    fn display_name_falls_back_to_email() {
        let mut r = record();
        assert_eq!(r.display_name(), "Ana Soto");
        r.first_name.clear();
        r.last_name.clear();
        assert_eq!(r.display_name(), "ana@example.com");
    }
}
