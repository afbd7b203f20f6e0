//! Structural validation of raw records.
//!
//! Required fields are checked before anything touches storage. Optional fields are
//! coerced to canonical types; optional URLs that fail to parse are cleared instead of
//! rejecting the record.

use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Url;
use rusqlite::Connection;
use thiserror::Error;

use super::languages;
use super::{PipelineError, PipelineItem, RecordStage, StageFlow, StageKind};
use crate::types::{RawContributor, RawFlag, RawNumber, RawRecord, RawResource, ValidatedContributor, ValidatedRecord, ValidatedResource};

const MAX_IDENTIFIER_LEN: usize = 255;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("field '{field}' {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub(crate) fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn nested(self, prefix: &str) -> Self {
        Self {
            field: format!("{prefix}.{}", self.field),
            reason: self.reason,
        }
    }
}

type Result<T> = std::result::Result<T, ValidationError>;

pub fn validate(raw: RawRecord) -> Result<ValidatedRecord> {
    match raw {
        RawRecord::Resource(resource) => validate_resource(resource).map(ValidatedRecord::Resource),
        RawRecord::Contributor(contributor) => {
            validate_contributor(contributor, None).map(ValidatedRecord::Contributor)
        }
    }
}

fn validate_resource(raw: RawResource) -> Result<ValidatedResource> {
    let name = required_text("name", raw.name, Some(MAX_IDENTIFIER_LEN))?;
    let local_id = required_text("local_id", raw.local_id, Some(MAX_IDENTIFIER_LEN))?;
    let source = required_text("source", raw.source, Some(MAX_IDENTIFIER_LEN))?;
    let url = required_url("url", raw.url)?;
    let description = required_text("description", raw.description, None)?;
    let is_free = flag("is_free", raw.is_free)?.ok_or_else(|| ValidationError::new("is_free", "is required"))?;

    let languages: Vec<String> = raw
        .languages
        .unwrap_or_default()
        .iter()
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(languages::resolve)
        .fold(Vec::new(), |mut acc, code| {
            if !acc.contains(&code) {
                acc.push(code);
            }
            acc
        });
    if languages.is_empty() {
        return Err(ValidationError::new("languages", "must contain at least one language"));
    }

    let reviews_rating = decimal("reviews_rating", raw.reviews_rating)?;
    if let Some(rating) = reviews_rating {
        if !(1.0..=5.0).contains(&rating) {
            return Err(ValidationError::new("reviews_rating", format!("must be between 1 and 5, got {rating}")));
        }
    }

    let contributors = raw
        .contributors
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(idx, contributor)| {
            validate_contributor(contributor, Some(&source))
                .map_err(|e| e.nested(&format!("contributors[{idx}]")))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ValidatedResource {
        name,
        local_id,
        url,
        description,
        short_description: optional_text(raw.short_description),
        html_description: optional_text(raw.html_description),
        thumbnail_url: optional_url(raw.thumbnail_url),
        is_free,
        is_limited_free: flag("is_limited_free", raw.is_limited_free)?.unwrap_or(false),
        is_active: flag("is_active", raw.is_active)?.unwrap_or(true),
        has_certificate: flag("has_certificate", raw.has_certificate)?.unwrap_or(false),
        price: decimal("price", raw.price)?,
        duration_hours: decimal("duration_hours", raw.duration_hours)?,
        reviews_count: count("reviews_count", raw.reviews_count)?,
        reviews_rating,
        enrollment_count: count("enrollment_count", raw.enrollment_count)?,
        format: optional_text(raw.format),
        level: optional_text(raw.level),
        languages,
        tags: raw
            .tags
            .unwrap_or_default()
            .into_iter()
            .filter_map(|tag| optional_text(Some(tag)))
            .collect(),
        contributors,
        last_update: timestamp("last_update", raw.last_update)?,
        source,
    })
}

/// Embedded contributors inherit the parent's source; standalone ones must carry it.
fn validate_contributor(raw: RawContributor, inherited_source: Option<&str>) -> Result<ValidatedContributor> {
    let name = required_text("name", raw.name, Some(MAX_IDENTIFIER_LEN))?;
    let local_id = required_text("local_id", raw.local_id, Some(MAX_IDENTIFIER_LEN))?;
    let source = match inherited_source {
        Some(source) => source.to_string(),
        None => required_text("source", raw.source, Some(MAX_IDENTIFIER_LEN))?,
    };
    Ok(ValidatedContributor {
        source,
        local_id,
        name,
        url: optional_url(raw.url),
        thumbnail_url: optional_url(raw.thumbnail_url),
        description: optional_text(raw.description),
    })
}

fn required_text(field: &str, value: Option<String>, max_len: Option<usize>) -> Result<String> {
    let value = value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ValidationError::new(field, "is required"))?;
    if let Some(max) = max_len {
        let len = value.chars().count();
        if len > max {
            return Err(ValidationError::new(field, format!("exceeds {max} characters ({len})")));
        }
    }
    Ok(value)
}

fn optional_text(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_web_url(value: &str) -> Option<String> {
    let url = Url::parse(value.trim()).ok()?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Some(url.to_string()),
        _ => None,
    }
}

fn required_url(field: &str, value: Option<String>) -> Result<String> {
    let value = required_text(field, value, None)?;
    parse_web_url(&value)
        .ok_or_else(|| ValidationError::new(field, format!("is not an absolute http(s) URL: '{value}'")))
}

fn optional_url(value: Option<String>) -> Option<String> {
    value.as_deref().and_then(parse_web_url)
}

fn flag(field: &str, value: Option<RawFlag>) -> Result<Option<bool>> {
    match value {
        None => Ok(None),
        Some(RawFlag::Bool(b)) => Ok(Some(b)),
        Some(RawFlag::Text(text)) => match text.trim().to_ascii_lowercase().as_str() {
            "" => Ok(None),
            "true" | "yes" | "y" | "1" => Ok(Some(true)),
            "false" | "no" | "n" | "0" => Ok(Some(false)),
            other => Err(ValidationError::new(field, format!("is not a boolean: '{other}'"))),
        },
    }
}

/// Parses display numbers such as "$49.99" or "1,299".
fn parse_number(field: &str, value: RawNumber) -> Result<Option<f64>> {
    let number = match value {
        RawNumber::Number(n) => n,
        RawNumber::Text(text) => {
            let cleaned: String = text
                .chars()
                .filter(|c| !c.is_whitespace() && *c != ',' && !matches!(c, '$' | '€' | '£' | '¥'))
                .collect();
            if cleaned.is_empty() {
                return Ok(None);
            }
            cleaned
                .parse::<f64>()
                .map_err(|_| ValidationError::new(field, format!("is not a number: '{text}'")))?
        }
    };
    if !number.is_finite() {
        return Err(ValidationError::new(field, "is not a finite number"));
    }
    if number < 0.0 {
        return Err(ValidationError::new(field, format!("must not be negative, got {number}")));
    }
    Ok(Some(number))
}

fn decimal(field: &str, value: Option<RawNumber>) -> Result<Option<f64>> {
    match value {
        None => Ok(None),
        Some(value) => Ok(parse_number(field, value)?.map(|n| (n * 100.0).round() / 100.0)),
    }
}

fn count(field: &str, value: Option<RawNumber>) -> Result<Option<i64>> {
    let Some(value) = value else {
        return Ok(None);
    };
    match parse_number(field, value)? {
        None => Ok(None),
        Some(n) if n.fract() == 0.0 && n <= i64::MAX as f64 => Ok(Some(n as i64)),
        Some(n) => Err(ValidationError::new(field, format!("must be a whole number, got {n}"))),
    }
}

/// Accepts RFC 3339 timestamps or plain `YYYY-MM-DD` dates.
fn timestamp(field: &str, value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    let Some(value) = optional_text(value) else {
        return Ok(None);
    };
    if let Ok(ts) = DateTime::parse_from_rfc3339(&value) {
        return Ok(Some(ts.with_timezone(&Utc)));
    }
    NaiveDate::parse_from_str(&value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|dt| Some(dt.and_utc()))
        .ok_or_else(|| ValidationError::new(field, format!("is not a date: '{value}'")))
}

/// First stage: turns a raw record into a validated one or drops it.
pub struct ValidateStage;

impl RecordStage for ValidateStage {
    fn kind(&self) -> StageKind {
        StageKind::Validate
    }

    fn process(&self, _conn: &Connection, item: PipelineItem) -> std::result::Result<StageFlow, PipelineError> {
        match item {
            PipelineItem::Raw(raw) => match validate(raw) {
                Ok(record) => Ok(StageFlow::Continue(PipelineItem::Validated(record))),
                Err(err) => Ok(StageFlow::Drop(super::DropReason::Invalid(err))),
            },
            PipelineItem::Validated(record) => Ok(StageFlow::Continue(PipelineItem::Validated(record))),
        }
    }
}
