//! Record pipeline: an ordered chain of stages every crawled record flows through.
//!
//! Stages run in ascending priority. Any stage may drop a record; a stage error fails
//! that record only. The chain must end in the persistence stage.

pub mod dedupe;
pub mod languages;
pub mod normalize;
pub mod persist;
pub mod validate;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::config::PipelineConfig;
use crate::domain::{Contributor, PersistedResource};
use crate::metrics;
use crate::storage::CatalogDb;
use crate::types::{RawRecord, RecordKey, ValidatedRecord};

pub use dedupe::DedupeStage;
pub use normalize::NormalizeStage;
pub use persist::{PersistStage, Upserter};
pub use validate::{ValidateStage, ValidationError};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("failed to persist {key} ('{name}'): {cause}")]
    Persistence {
        key: RecordKey,
        name: String,
        #[source]
        cause: rusqlite::Error,
    },

    #[error("storage read failed in {stage} for {key}: {cause}")]
    Storage {
        stage: &'static str,
        key: RecordKey,
        #[source]
        cause: rusqlite::Error,
    },

    #[error("stage {stage} received a record in the wrong state")]
    OutOfOrder { stage: &'static str },

    #[error("invalid pipeline: {0}")]
    Misconfigured(String),
}

/// Built-in stages. The priority fixes their position in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Validate,
    Dedupe,
    Normalize,
    Persist,
}

impl StageKind {
    pub fn priority(self) -> u32 {
        match self {
            StageKind::Validate => 110,
            StageKind::Dedupe => 115,
            StageKind::Normalize => 120,
            StageKind::Persist => 950,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StageKind::Validate => "validate",
            StageKind::Dedupe => "dedupe",
            StageKind::Normalize => "normalize",
            StageKind::Persist => "persist",
        }
    }
}

/// A record in flight between stages.
#[derive(Debug, Clone)]
pub enum PipelineItem {
    Raw(RawRecord),
    Validated(ValidatedRecord),
}

impl PipelineItem {
    pub fn key(&self) -> RecordKey {
        match self {
            PipelineItem::Raw(raw) => raw.log_key(),
            PipelineItem::Validated(record) => record.key(),
        }
    }
}

#[derive(Debug)]
pub enum StageFlow {
    Continue(PipelineItem),
    Drop(DropReason),
    Saved(SavedRecord),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    Invalid(ValidationError),
    Duplicate(RecordKey),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SavedEntity {
    Resource(PersistedResource),
    Contributor(Contributor),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SavedRecord {
    pub key: RecordKey,
    /// False when an existing row was updated
    pub created: bool,
    pub entity: SavedEntity,
}

#[derive(Debug)]
pub enum Outcome {
    Saved(SavedRecord),
    Dropped(DropReason),
    Failed(PipelineError),
}

/// One processing step of the chain.
pub trait RecordStage: Send + Sync {
    fn kind(&self) -> StageKind;

    fn process(&self, conn: &Connection, item: PipelineItem) -> Result<StageFlow, PipelineError>;
}

/// Running totals for one pipeline instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineCounters {
    pub seen: u64,
    pub validated: u64,
    pub invalid: u64,
    pub duplicates: u64,
    pub normalized: u64,
    pub saved: u64,
    pub failed: u64,
}

pub struct Pipeline {
    db: CatalogDb,
    stages: Vec<Box<dyn RecordStage>>,
    counters: PipelineCounters,
}

impl Pipeline {
    /// The standard chain: validate, dedupe, normalize, persist.
    pub fn new(db: CatalogDb, config: &PipelineConfig) -> Self {
        let stages: Vec<Box<dyn RecordStage>> = vec![
            Box::new(ValidateStage),
            Box::new(DedupeStage),
            Box::new(NormalizeStage),
            Box::new(PersistStage::new(Upserter::new(config.refresh_existing))),
        ];
        Self {
            db,
            stages,
            counters: PipelineCounters::default(),
        }
    }

    /// Builds a chain from arbitrary stages, sorted by priority. Priorities must be
    /// unique and the last stage must persist.
    pub fn with_stages(db: CatalogDb, mut stages: Vec<Box<dyn RecordStage>>) -> Result<Self, PipelineError> {
        stages.sort_by_key(|stage| stage.kind().priority());

        let mut priorities = HashSet::new();
        for stage in &stages {
            if !priorities.insert(stage.kind().priority()) {
                return Err(PipelineError::Misconfigured(format!(
                    "duplicate stage priority {} ({})",
                    stage.kind().priority(),
                    stage.kind().name()
                )));
            }
        }
        match stages.last() {
            Some(stage) if stage.kind() == StageKind::Persist => {}
            _ => {
                return Err(PipelineError::Misconfigured(
                    "the chain must end with the persist stage".to_string(),
                ))
            }
        }

        Ok(Self {
            db,
            stages,
            counters: PipelineCounters::default(),
        })
    }

    pub fn counters(&self) -> &PipelineCounters {
        &self.counters
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.kind().name()).collect()
    }

    /// Runs one record through the chain. Holds the store connection for the whole
    /// record so the dedupe check and the write cannot interleave with another record.
    pub fn process(&mut self, raw: RawRecord) -> Outcome {
        self.counters.seen += 1;
        let conn = self.db.lock();
        let mut item = PipelineItem::Raw(raw);

        for stage in &self.stages {
            let kind = stage.kind();
            let key = item.key();
            match stage.process(&conn, item) {
                Ok(StageFlow::Continue(next)) => {
                    match kind {
                        StageKind::Validate => self.counters.validated += 1,
                        StageKind::Normalize => self.counters.normalized += 1,
                        _ => {}
                    }
                    item = next;
                }
                Ok(StageFlow::Drop(reason)) => {
                    match &reason {
                        DropReason::Invalid(err) => {
                            self.counters.invalid += 1;
                            warn!(
                                kind = %key.kind,
                                source = %key.source,
                                local_id = %key.local_id,
                                stage = kind.name(),
                                field = %err.field,
                                "Dropping invalid record: {}",
                                err
                            );
                            metrics::record_outcome("invalid");
                        }
                        DropReason::Duplicate(_) => {
                            self.counters.duplicates += 1;
                            debug!(
                                kind = %key.kind,
                                source = %key.source,
                                local_id = %key.local_id,
                                stage = kind.name(),
                                "Dropping duplicate record"
                            );
                            metrics::record_outcome("duplicate");
                        }
                    }
                    return Outcome::Dropped(reason);
                }
                Ok(StageFlow::Saved(saved)) => {
                    self.counters.saved += 1;
                    debug!(
                        kind = %key.kind,
                        source = %key.source,
                        local_id = %key.local_id,
                        created = saved.created,
                        "Record saved"
                    );
                    metrics::record_outcome("saved");
                    return Outcome::Saved(saved);
                }
                Err(err) => {
                    self.counters.failed += 1;
                    error!(
                        kind = %key.kind,
                        source = %key.source,
                        local_id = %key.local_id,
                        stage = kind.name(),
                        "Record failed: {}",
                        err
                    );
                    metrics::record_outcome("failed");
                    return Outcome::Failed(err);
                }
            }
        }

        // Unreachable for chains built through `new` or `with_stages`
        self.counters.failed += 1;
        Outcome::Failed(PipelineError::Misconfigured(
            "record left the chain without being persisted".to_string(),
        ))
    }
}
