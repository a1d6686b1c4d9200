use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::{Catalog, SampleStore, StoreError};
use crate::{
    labels::LabelSet,
    model::{Row, SeriesId},
    router::Batch,
};

/// Call and creation counters of a [`MemoryBackend`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub containers_created: u64,
    pub series_created: u64,
    pub ensure_calls: u64,
    pub get_or_create_calls: u64,
    pub finalize_calls: u64,
    pub insert_calls: u64,
    pub rows_written: u64,
}

impl MemoryStats {
    pub fn catalog_calls(&self) -> u64 {
        self.ensure_calls + self.get_or_create_calls + self.finalize_calls
    }
}

/// Rows of one metric container, with the labels of each row's series.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSnapshot {
    pub metric: String,
    pub rows: Vec<(LabelSet, Row)>,
}

#[derive(Default)]
struct Inner {
    /// metric -> (series, timestamp) -> value
    containers: FxHashMap<String, BTreeMap<(SeriesId, i64), f64>>,
    series_by_labels: FxHashMap<LabelSet, SeriesId>,
    /// Indexed by `SeriesId - 1`.
    series: Vec<LabelSet>,
    stats: MemoryStats,
}

/// Catalog and sample store kept in process memory.
///
/// Containers are ordered maps keyed on (series, timestamp), so writing the
/// same sample twice overwrites it.
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> MemoryStats {
        self.inner.lock().stats
    }

    /// Number of rows stored for `metric`.
    pub fn rows(&self, metric: &str) -> usize {
        self.inner
            .lock()
            .containers
            .get(metric)
            .map_or(0, BTreeMap::len)
    }

    pub fn metrics(&self) -> Vec<String> {
        let mut metrics = self
            .inner
            .lock()
            .containers
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        metrics.sort();
        metrics
    }

    /// Copies out every container, metrics in name order and rows in
    /// (series, timestamp) order.
    pub fn snapshot(&self) -> Vec<ContainerSnapshot> {
        let inner = self.inner.lock();
        let mut snapshot = inner
            .containers
            .iter()
            .map(|(metric, rows)| ContainerSnapshot {
                metric: metric.clone(),
                rows: rows
                    .iter()
                    .map(|(&(series_id, timestamp), &value)| {
                        let labels = inner.labels_of(series_id).cloned().unwrap_or_default();
                        (
                            labels,
                            Row {
                                series_id,
                                timestamp,
                                value,
                            },
                        )
                    })
                    .collect(),
            })
            .collect::<Vec<_>>();
        snapshot.sort_by(|a, b| a.metric.cmp(&b.metric));
        snapshot
    }
}

impl Inner {
    fn labels_of(&self, id: SeriesId) -> Option<&LabelSet> {
        id.get()
            .checked_sub(1)
            .and_then(|index| usize::try_from(index).ok())
            .and_then(|index| self.series.get(index))
    }
}

#[async_trait]
impl Catalog for MemoryBackend {
    async fn ensure_metric_container(&self, metric: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.stats.ensure_calls += 1;
        if !inner.containers.contains_key(metric) {
            inner.containers.insert(metric.to_owned(), BTreeMap::new());
            inner.stats.containers_created += 1;
        }
        Ok(())
    }

    async fn get_or_create_series(
        &self,
        metric: &str,
        labels: &LabelSet,
    ) -> Result<SeriesId, StoreError> {
        let mut inner = self.inner.lock();
        inner.stats.get_or_create_calls += 1;
        if !inner.containers.contains_key(metric) {
            return Err(StoreError::unknown_metric(metric));
        }
        if let Some(&id) = inner.series_by_labels.get(labels) {
            return Ok(id);
        }
        inner.series.push(labels.clone());
        let id = SeriesId::new(inner.series.len() as i64);
        inner.series_by_labels.insert(labels.clone(), id);
        inner.stats.series_created += 1;
        Ok(id)
    }

    async fn finalize_metric_creation(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.stats.finalize_calls += 1;
        Ok(())
    }

    async fn series_labels(&self, id: SeriesId) -> Result<Option<LabelSet>, StoreError> {
        Ok(self.inner.lock().labels_of(id).cloned())
    }
}

#[async_trait]
impl SampleStore for MemoryBackend {
    async fn insert_batch(&self, batch: &Batch) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        inner.stats.insert_calls += 1;
        let container = inner
            .containers
            .get_mut(batch.container())
            .ok_or_else(|| StoreError::unknown_metric(batch.container()))?;
        for row in &batch.rows {
            container.insert((row.series_id, row.timestamp), row.value);
        }
        let written = batch.len() as u64;
        inner.stats.rows_written += written;
        Ok(written)
    }
}
