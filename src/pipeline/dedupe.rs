use rusqlite::Connection;

use super::{DropReason, PipelineError, PipelineItem, RecordStage, StageFlow, StageKind};
use crate::storage::catalog;
use crate::types::ValidatedRecord;

/// Read-only check on the natural key (source, local id).
pub fn is_duplicate(conn: &Connection, record: &ValidatedRecord) -> rusqlite::Result<bool> {
    match record {
        ValidatedRecord::Resource(r) => catalog::resource_exists(conn, &r.source, &r.local_id),
        ValidatedRecord::Contributor(c) => catalog::contributor_exists(conn, &c.source, &c.local_id),
    }
}

/// Drops records already present in the store. Runs before any mutating stage.
pub struct DedupeStage;

impl RecordStage for DedupeStage {
    fn kind(&self) -> StageKind {
        StageKind::Dedupe
    }

    fn process(&self, conn: &Connection, item: PipelineItem) -> Result<StageFlow, PipelineError> {
        let PipelineItem::Validated(record) = item else {
            return Err(PipelineError::OutOfOrder { stage: self.kind().name() });
        };
        let key = record.key();
        match is_duplicate(conn, &record) {
            Ok(true) => Ok(StageFlow::Drop(DropReason::Duplicate(key))),
            Ok(false) => Ok(StageFlow::Continue(PipelineItem::Validated(record))),
            Err(cause) => Err(PipelineError::Storage {
                stage: self.kind().name(),
                key,
                cause,
            }),
        }
    }
}
