//! Indexing Data Types
//!
//! Documents, chunks and the aggregate outcome reported for every submitted batch.

use crate::error::{MappingError, PermanentWriteError};
use crate::query::types::FieldMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// A document on its way into the cluster. Lives only for one batch.
///
/// The id defines replace semantics: resubmitting a document overwrites it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexableDocument {
    pub id: String,
    #[serde(default)]
    pub fields: FieldMap,
}

impl IndexableDocument {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: FieldMap::new(),
        }
    }

    /// Replaces the field's value.
    pub fn set_field(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    /// Appends a value, turning the field multi-valued when needed.
    pub fn add_field(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        let value = value.into();
        match self.fields.entry(field.into()) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(value);
            }
            std::collections::btree_map::Entry::Occupied(mut slot) => match slot.get_mut() {
                Value::Array(values) => values.push(value),
                existing => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value]);
                }
            },
        }
    }

    pub fn with_field(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_field(field, value);
        self
    }
}

/// When the pipeline asks the cluster to make writes visible.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CommitPolicy {
    /// Rely on the cluster's own periodic soft commit.
    Delegated,
    /// Commit after `every_batches` batches and/or once `every_secs` elapsed
    /// since the previous explicit commit, whichever comes first.
    Explicit {
        #[serde(default)]
        every_batches: Option<usize>,
        #[serde(default)]
        every_secs: Option<u64>,
    },
}

impl CommitPolicy {
    pub fn every_batch() -> Self {
        CommitPolicy::Explicit {
            every_batches: Some(1),
            every_secs: None,
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        match self {
            CommitPolicy::Explicit {
                every_secs: Some(secs),
                ..
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    NotRequested,
    Committed,
    Failed(String),
}

/// Aggregate result of one `submit` call.
///
/// Counts are in documents. A batch is never all-or-nothing: callers read
/// the counts and the per-chunk failures.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome {
    pub received: usize,
    pub indexed: usize,
    pub failed: usize,
    pub mapping_failures: usize,
    /// First few mapping errors, for diagnostics.
    pub mapping_samples: Vec<MappingError>,
    pub chunk_failures: Vec<PermanentWriteError>,
    /// Documents the cluster accepted the request for but refused individually.
    pub rejected_ids: Vec<String>,
    pub chunks: usize,
    pub retries: u32,
    pub commit: CommitOutcome,
}

impl BatchOutcome {
    pub fn empty(received: usize) -> Self {
        Self {
            received,
            indexed: 0,
            failed: 0,
            mapping_failures: 0,
            mapping_samples: Vec::new(),
            chunk_failures: Vec::new(),
            rejected_ids: Vec::new(),
            chunks: 0,
            retries: 0,
            commit: CommitOutcome::NotRequested,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
            && self.mapping_failures == 0
            && !matches!(self.commit, CommitOutcome::Failed(_))
    }
}

/// Totals across a whole stream of micro-batches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamReport {
    pub batches: usize,
    pub received: usize,
    pub indexed: usize,
    pub failed: usize,
    pub mapping_failures: usize,
    pub commits: usize,
    pub commit_failures: usize,
}

impl StreamReport {
    pub fn absorb(&mut self, outcome: &BatchOutcome) {
        self.batches += 1;
        self.received += outcome.received;
        self.indexed += outcome.indexed;
        self.failed += outcome.failed;
        self.mapping_failures += outcome.mapping_failures;
        self.absorb_commit(&outcome.commit);
    }

    pub fn absorb_commit(&mut self, commit: &CommitOutcome) {
        match commit {
            CommitOutcome::Committed => self.commits += 1,
            CommitOutcome::Failed(_) => self.commit_failures += 1,
            CommitOutcome::NotRequested => {}
        }
    }
}
