use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A record as emitted by a crawl engine, before any validation.
///
/// Engines emit `{"kind": "...", "fields": {...}}`; every field is optional here so
/// that a malformed record still deserializes and can be rejected with a precise
/// [`crate::pipeline::validate::ValidationError`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "fields", rename_all = "snake_case")]
pub enum RawRecord {
    Resource(RawResource),
    Contributor(RawContributor),
}

impl RawRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            RawRecord::Resource(_) => RecordKind::Resource,
            RawRecord::Contributor(_) => RecordKind::Contributor,
        }
    }

    /// Best-effort key for log lines, available even when validation fails
    pub fn log_key(&self) -> RecordKey {
        let (source, local_id) = match self {
            RawRecord::Resource(r) => (r.source.clone(), r.local_id.clone()),
            RawRecord::Contributor(c) => (c.source.clone(), c.local_id.clone()),
        };
        RecordKey {
            kind: self.kind(),
            source: source.unwrap_or_else(|| "?".to_string()),
            local_id: local_id.unwrap_or_else(|| "?".to_string()),
        }
    }
}

/// Numeric fields arrive either as JSON numbers or as display strings ("$49.99").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RawNumber {
    Number(f64),
    Text(String),
}

/// Boolean flags arrive either as JSON booleans or as strings ("yes", "false").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RawFlag {
    Bool(bool),
    Text(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawResource {
    #[serde(alias = "platform_course_id")]
    pub local_id: Option<String>,
    #[serde(alias = "platform_id")]
    pub source: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub short_description: Option<String>,
    pub html_description: Option<String>,
    pub url: Option<String>,
    #[serde(alias = "platform_thumbnail_url")]
    pub thumbnail_url: Option<String>,
    pub is_free: Option<RawFlag>,
    pub is_limited_free: Option<RawFlag>,
    pub is_active: Option<RawFlag>,
    pub has_certificate: Option<RawFlag>,
    #[serde(alias = "dollar_price")]
    pub price: Option<RawNumber>,
    #[serde(alias = "duration_h")]
    pub duration_hours: Option<RawNumber>,
    #[serde(alias = "platform_reviews_count")]
    pub reviews_count: Option<RawNumber>,
    #[serde(alias = "platform_reviews_rating")]
    pub reviews_rating: Option<RawNumber>,
    pub enrollment_count: Option<RawNumber>,
    pub format: Option<String>,
    pub level: Option<String>,
    pub languages: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    #[serde(alias = "creators")]
    pub contributors: Option<Vec<RawContributor>>,
    #[serde(alias = "platform_last_update")]
    pub last_update: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawContributor {
    #[serde(alias = "platform_creator_id")]
    pub local_id: Option<String>,
    /// Only required on standalone contributor records; embedded ones inherit it
    #[serde(alias = "platform_id")]
    pub source: Option<String>,
    pub name: Option<String>,
    pub url: Option<String>,
    #[serde(alias = "platform_thumbnail_url")]
    pub thumbnail_url: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Resource,
    Contributor,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Resource => f.write_str("resource"),
            RecordKind::Contributor => f.write_str("contributor"),
        }
    }
}

/// Natural identity of a record: (source, source-local id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub kind: RecordKind,
    pub source: String,
    pub local_id: String,
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.source, self.local_id)
    }
}

/// A record that passed structural validation, with canonical field types.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ValidatedRecord {
    Resource(ValidatedResource),
    Contributor(ValidatedContributor),
}

impl ValidatedRecord {
    pub fn key(&self) -> RecordKey {
        match self {
            ValidatedRecord::Resource(r) => RecordKey {
                kind: RecordKind::Resource,
                source: r.source.clone(),
                local_id: r.local_id.clone(),
            },
            ValidatedRecord::Contributor(c) => RecordKey {
                kind: RecordKind::Contributor,
                source: c.source.clone(),
                local_id: c.local_id.clone(),
            },
        }
    }

    pub fn display_name(&self) -> &str {
        match self {
            ValidatedRecord::Resource(r) => &r.name,
            ValidatedRecord::Contributor(c) => &c.name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidatedResource {
    pub source: String,
    pub local_id: String,
    pub name: String,
    pub description: String,
    pub short_description: Option<String>,
    pub html_description: Option<String>,
    pub url: String,
    pub thumbnail_url: Option<String>,
    pub is_free: bool,
    pub is_limited_free: bool,
    pub is_active: bool,
    pub has_certificate: bool,
    pub price: Option<f64>,
    pub duration_hours: Option<f64>,
    pub reviews_count: Option<i64>,
    pub reviews_rating: Option<f64>,
    pub enrollment_count: Option<i64>,
    pub format: Option<String>,
    pub level: Option<String>,
    /// ISO 639-1 codes where resolvable, otherwise the lower-cased input
    pub languages: Vec<String>,
    pub tags: Vec<String>,
    pub contributors: Vec<ValidatedContributor>,
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidatedContributor {
    pub source: String,
    pub local_id: String,
    pub name: String,
    pub url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub description: Option<String>,
}
