//! Free-text cleanup: markup stripped, entities decoded, whitespace collapsed.
//! A required field that cleans down to nothing drops the record as invalid.

use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::Connection;
use scraper::Html;

use super::{DropReason, PipelineError, PipelineItem, RecordStage, StageFlow, StageKind, ValidationError};
use crate::types::{ValidatedContributor, ValidatedRecord};

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));

/// Cleans one text value. Plain text without markup or entities skips the HTML parser.
pub fn clean_text(input: &str) -> String {
    let text = if input.contains('<') || input.contains('&') {
        let fragment = Html::parse_fragment(input);
        fragment.root_element().text().collect::<String>()
    } else {
        input.to_string()
    };
    WHITESPACE.replace_all(&text, " ").trim().to_string()
}

fn clean_optional(value: Option<String>) -> Option<String> {
    value.map(|v| clean_text(&v)).filter(|v| !v.is_empty())
}

/// Cleans a field that must stay non-empty.
fn clean_required(field: &str, value: &str) -> Result<String, ValidationError> {
    let cleaned = clean_text(value);
    if cleaned.is_empty() {
        return Err(ValidationError::new(field, "is empty after cleanup"));
    }
    Ok(cleaned)
}

fn normalize_contributor(mut contributor: ValidatedContributor) -> Result<ValidatedContributor, ValidationError> {
    contributor.name = clean_required("name", &contributor.name)?;
    contributor.description = clean_optional(contributor.description);
    Ok(contributor)
}

/// Cleans free-text fields. Fails when markup was all a required field held.
pub fn normalize(record: ValidatedRecord) -> Result<ValidatedRecord, ValidationError> {
    match record {
        ValidatedRecord::Resource(mut resource) => {
            resource.name = clean_required("name", &resource.name)?;
            resource.description = clean_required("description", &resource.description)?;
            resource.short_description = clean_optional(resource.short_description);
            resource.contributors = resource
                .contributors
                .into_iter()
                .enumerate()
                .map(|(idx, c)| normalize_contributor(c).map_err(|e| e.nested(&format!("contributors[{idx}]"))))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ValidatedRecord::Resource(resource))
        }
        ValidatedRecord::Contributor(contributor) => normalize_contributor(contributor).map(ValidatedRecord::Contributor),
    }
}

pub struct NormalizeStage;

impl RecordStage for NormalizeStage {
    fn kind(&self) -> StageKind {
        StageKind::Normalize
    }

    fn process(&self, _conn: &Connection, item: PipelineItem) -> Result<StageFlow, PipelineError> {
        match item {
            PipelineItem::Validated(record) => match normalize(record) {
                Ok(record) => Ok(StageFlow::Continue(PipelineItem::Validated(record))),
                Err(err) => Ok(StageFlow::Drop(DropReason::Invalid(err))),
            },
            PipelineItem::Raw(_) => Err(PipelineError::OutOfOrder { stage: self.kind().name() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markup_and_entities_are_removed() {
        assert_eq!(
            clean_text("<p>Learn <b>Rust</b>&nbsp;&amp;&nbsp;Go</p>\n\n<p>today</p>"),
            "Learn Rust & Go today"
        );
        assert_eq!(clean_text("Tom &quot;the dev&quot; &#39;Smith&#39; &lt;3"), "Tom \"the dev\" 'Smith' <3");
    }

    #[test]
    fn test_whitespace_is_collapsed_and_trimmed() {
        assert_eq!(clean_text("  Data\t\tScience \n 101  "), "Data Science 101");
        assert_eq!(clean_text("   "), "");
    }

    #[test]
    fn test_empty_optional_fields_become_absent() {
        assert_eq!(clean_optional(Some("<br/>".to_string())), None);
        assert_eq!(clean_optional(None), None);
        assert_eq!(clean_optional(Some(" x ".to_string())), Some("x".to_string()));
    }

    #[test]
    fn test_markup_only_required_fields_are_rejected() {
        let raw: crate::types::RawRecord = serde_json::from_value(serde_json::json!({
            "kind": "resource",
            "fields": {
                "source": "edx", "local_id": "empty", "name": "<b></b>",
                "description": "<p> </p>", "url": "https://example.com/e",
                "is_free": true, "languages": ["en"]
            }
        }))
        .unwrap();
        let record = crate::pipeline::validate::validate(raw).unwrap();
        let err = normalize(record).unwrap_err();
        assert_eq!(err.field, "name");
        assert_eq!(err.reason, "is empty after cleanup");

        let contributor: crate::types::RawRecord = serde_json::from_value(serde_json::json!({
            "kind": "contributor",
            "fields": {"source": "edx", "local_id": "c", "name": "<i>&nbsp;</i>"}
        }))
        .unwrap();
        let err = normalize(crate::pipeline::validate::validate(contributor).unwrap()).unwrap_err();
        assert_eq!(err.field, "name");
    }
}
