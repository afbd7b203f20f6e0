use chrono::Utc;
use rusqlite::Connection;
use tracing::debug;
use uuid::Uuid;

use super::normalize::clean_text;
use super::{PipelineError, PipelineItem, RecordStage, SavedEntity, SavedRecord, StageFlow, StageKind};
use crate::storage::catalog::{self, ResourceRefs};
use crate::types::{ValidatedContributor, ValidatedRecord, ValidatedResource};

/// Writes validated records, one transaction per record.
#[derive(Debug, Clone, Copy)]
pub struct Upserter {
    /// When false, an existing resource keeps its stored scalars and only its
    /// relationship sets are replaced
    refresh_existing: bool,
}

impl Upserter {
    pub fn new(refresh_existing: bool) -> Self {
        Self { refresh_existing }
    }

    /// Resolves referenced entities and creates or updates the record atomically.
    /// Any failure rolls the whole record back.
    pub fn save(&self, conn: &Connection, record: &ValidatedRecord) -> Result<SavedRecord, PipelineError> {
        let key = record.key();
        let to_error = |cause: rusqlite::Error| PipelineError::Persistence {
            key: key.clone(),
            name: record.display_name().to_string(),
            cause,
        };

        let tx = conn.unchecked_transaction().map_err(to_error)?;
        let (created, entity) = match record {
            ValidatedRecord::Resource(resource) => self.save_resource(&tx, resource).map_err(to_error)?,
            ValidatedRecord::Contributor(contributor) => save_contributor(&tx, contributor).map_err(to_error)?,
        };
        tx.commit().map_err(to_error)?;

        Ok(SavedRecord { key, created, entity })
    }

    fn save_resource(&self, conn: &Connection, resource: &ValidatedResource) -> rusqlite::Result<(bool, SavedEntity)> {
        let source_id = catalog::resolve_source(conn, &resource.source)?;
        let refs = ResourceRefs {
            source_id,
            format_id: resource
                .format
                .as_deref()
                .map(|name| catalog::resolve_format(conn, name))
                .transpose()?,
            level_id: resource
                .level
                .as_deref()
                .map(|name| catalog::resolve_level(conn, name))
                .transpose()?,
        };

        let mut contributor_ids = Vec::with_capacity(resource.contributors.len());
        for contributor in &resource.contributors {
            let (id, _) = catalog::upsert_contributor(conn, source_id, contributor)?;
            if !contributor_ids.contains(&id) {
                contributor_ids.push(id);
            }
        }

        let language_codes = resource
            .languages
            .iter()
            .map(|code| catalog::resolve_language(conn, code))
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut tag_ids: Vec<Uuid> = Vec::with_capacity(resource.tags.len());
        for tag in &resource.tags {
            let clean = clean_tag(tag);
            if clean.is_empty() {
                continue;
            }
            let id = catalog::resolve_tag(conn, &clean)?;
            if !tag_ids.contains(&id) {
                tag_ids.push(id);
            }
        }

        let now = Utc::now();
        let (resource_id, created) = match catalog::find_resource_id(conn, source_id, &resource.local_id)? {
            Some(id) => {
                if self.refresh_existing {
                    catalog::update_resource(conn, id, refs, resource, now)?;
                }
                (id, false)
            }
            None => (catalog::insert_resource(conn, refs, resource, now)?, true),
        };

        catalog::replace_contributors(conn, resource_id, &contributor_ids)?;
        catalog::replace_languages(conn, resource_id, &language_codes)?;
        catalog::replace_tags(conn, resource_id, &tag_ids)?;

        debug!(
            source = %resource.source,
            local_id = %resource.local_id,
            created,
            tags = tag_ids.len(),
            "Upserted resource"
        );

        let stored = catalog::load_resource(conn, resource_id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
        Ok((created, SavedEntity::Resource(stored)))
    }
}

fn save_contributor(conn: &Connection, contributor: &ValidatedContributor) -> rusqlite::Result<(bool, SavedEntity)> {
    let source_id = catalog::resolve_source(conn, &contributor.source)?;
    let (_, created) = catalog::upsert_contributor(conn, source_id, contributor)?;
    let stored = catalog::find_contributor(conn, &contributor.source, &contributor.local_id)?
        .ok_or(rusqlite::Error::QueryReturnedNoRows)?;
    Ok((created, SavedEntity::Contributor(stored)))
}

/// Tag identity: cleaned text, lower-cased.
pub fn clean_tag(tag: &str) -> String {
    clean_text(tag).to_lowercase()
}

/// Terminal stage wrapping the [`Upserter`].
pub struct PersistStage {
    upserter: Upserter,
}

impl PersistStage {
    pub fn new(upserter: Upserter) -> Self {
        Self { upserter }
    }
}

impl RecordStage for PersistStage {
    fn kind(&self) -> StageKind {
        StageKind::Persist
    }

    fn process(&self, conn: &Connection, item: PipelineItem) -> Result<StageFlow, PipelineError> {
        match item {
            PipelineItem::Validated(record) => self.upserter.save(conn, &record).map(StageFlow::Saved),
            PipelineItem::Raw(_) => Err(PipelineError::OutOfOrder { stage: self.kind().name() }),
        }
    }
}
