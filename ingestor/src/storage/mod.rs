//! Collaborators the write path talks to: the series catalog and the sample
//! store. Both are usually the same relational database.

use async_trait::async_trait;

use crate::{labels::LabelSet, model::SeriesId, router::Batch};

mod memory;
mod sqlite;

pub use memory::{ContainerSnapshot, MemoryBackend, MemoryStats};
pub use sqlite::SqliteBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Connectivity, lock contention or similar; worth retrying.
    Transient,
    /// The metric container does not exist (yet).
    UnknownMetric,
    /// The data was rejected, e.g. by a constraint.
    Integrity,
    /// Anything else the store cannot recover from.
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct StoreError {
    kind: StoreErrorKind,
    message: String,
}

impl StoreError {
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Transient, message)
    }

    pub fn unknown_metric(metric: &str) -> Self {
        Self::new(
            StoreErrorKind::UnknownMetric,
            format!("metric container {metric:?} does not exist"),
        )
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Integrity, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Fatal, message)
    }

    pub fn kind(&self) -> StoreErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Keyed lookup service mapping label sets to series identities.
///
/// Every method must be idempotent and safe under concurrent callers: two
/// callers creating the same series get the same identity back.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Creates the storage container for `metric` unless it already exists.
    async fn ensure_metric_container(&self, metric: &str) -> Result<(), StoreError>;

    /// Returns the identity of `labels`, creating it if needed. Fails with
    /// [`StoreErrorKind::UnknownMetric`] when the metric has no container.
    async fn get_or_create_series(
        &self,
        metric: &str,
        labels: &LabelSet,
    ) -> Result<SeriesId, StoreError>;

    /// Commits bookkeeping for containers created since the last call.
    async fn finalize_metric_creation(&self) -> Result<(), StoreError>;

    /// Reverse lookup used by the query layer.
    async fn series_labels(&self, id: SeriesId) -> Result<Option<LabelSet>, StoreError>;
}

#[async_trait]
pub trait SampleStore: Send + Sync {
    /// Upserts the rows of `batch` into its metric container, keyed on
    /// (series, timestamp). Returns the number of rows written.
    async fn insert_batch(&self, batch: &Batch) -> Result<u64, StoreError>;
}
