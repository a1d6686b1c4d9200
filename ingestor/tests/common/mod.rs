#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use ingestor::{
    labels::{Fingerprint, Fingerprinter},
    router::Batch,
    storage::{Catalog, MemoryBackend, SampleStore, StoreError},
    LabelSet, Sample, SeriesId, TimeSeries,
};
use parking_lot::Mutex;

pub fn labels(pairs: &[(&str, &str)]) -> LabelSet {
    LabelSet::try_new(pairs.iter().copied()).unwrap()
}

pub fn series(pairs: &[(&str, &str)], samples: impl IntoIterator<Item = (i64, f64)>) -> TimeSeries {
    TimeSeries::new(
        labels(pairs),
        samples
            .into_iter()
            .map(|(t, v)| Sample::new(t, v))
            .collect(),
    )
}

/// Sample store that delegates to a [`MemoryBackend`] but can be told to
/// fail or stall.
#[derive(Debug, Default)]
pub struct FaultyStore {
    pub inner: Arc<MemoryBackend>,
    /// Containers whose inserts are rejected as integrity violations.
    reject: Mutex<Vec<String>>,
    /// Number of upcoming inserts that fail transiently.
    transient: AtomicU32,
    delay: Mutex<Option<Duration>>,
    calls: AtomicU32,
}

impl FaultyStore {
    pub fn new(inner: Arc<MemoryBackend>) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    pub fn reject(&self, metric: &str) {
        self.reject.lock().push(metric.to_owned());
    }

    pub fn fail_transiently(&self, times: u32) {
        self.transient.store(times, Ordering::SeqCst);
    }

    pub fn delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SampleStore for FaultyStore {
    async fn insert_batch(&self, batch: &Batch) -> Result<u64, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.reject.lock().iter().any(|m| m == batch.container()) {
            return Err(StoreError::integrity(format!(
                "check constraint failed on {}",
                batch.container()
            )));
        }
        let pending = self.transient.load(Ordering::SeqCst);
        if pending > 0 {
            self.transient.store(pending - 1, Ordering::SeqCst);
            return Err(StoreError::transient("connection reset by peer"));
        }
        self.inner.insert_batch(batch).await
    }
}

/// Catalog that delegates to a [`MemoryBackend`] after an optional delay.
#[derive(Debug)]
pub struct SlowCatalog {
    pub inner: Arc<MemoryBackend>,
    pub delay: Duration,
}

#[async_trait]
impl Catalog for SlowCatalog {
    async fn ensure_metric_container(&self, metric: &str) -> Result<(), StoreError> {
        self.inner.ensure_metric_container(metric).await
    }

    async fn get_or_create_series(
        &self,
        metric: &str,
        labels: &LabelSet,
    ) -> Result<SeriesId, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.get_or_create_series(metric, labels).await
    }

    async fn finalize_metric_creation(&self) -> Result<(), StoreError> {
        self.inner.finalize_metric_creation().await
    }

    async fn series_labels(&self, id: SeriesId) -> Result<Option<LabelSet>, StoreError> {
        self.inner.series_labels(id).await
    }
}

/// Catalog whose next `finalize_metric_creation` calls fail.
#[derive(Debug, Default)]
pub struct FlakyFinalizeCatalog {
    pub inner: Arc<MemoryBackend>,
    failures: AtomicU32,
    finalize_calls: AtomicU32,
}

impl FlakyFinalizeCatalog {
    pub fn new(inner: Arc<MemoryBackend>, failures: u32) -> Self {
        Self {
            inner,
            failures: AtomicU32::new(failures),
            finalize_calls: AtomicU32::new(0),
        }
    }

    pub fn finalize_calls(&self) -> u32 {
        self.finalize_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Catalog for FlakyFinalizeCatalog {
    async fn ensure_metric_container(&self, metric: &str) -> Result<(), StoreError> {
        self.inner.ensure_metric_container(metric).await
    }

    async fn get_or_create_series(
        &self,
        metric: &str,
        labels: &LabelSet,
    ) -> Result<SeriesId, StoreError> {
        self.inner.get_or_create_series(metric, labels).await
    }

    async fn finalize_metric_creation(&self) -> Result<(), StoreError> {
        self.finalize_calls.fetch_add(1, Ordering::SeqCst);
        let pending = self.failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures.store(pending - 1, Ordering::SeqCst);
            return Err(StoreError::fatal("finalize_metric_creation failed"));
        }
        self.inner.finalize_metric_creation().await
    }

    async fn series_labels(&self, id: SeriesId) -> Result<Option<LabelSet>, StoreError> {
        self.inner.series_labels(id).await
    }
}

/// Maps every label set to the same fingerprint.
#[derive(Debug)]
pub struct CollidingFingerprinter;

impl Fingerprinter for CollidingFingerprinter {
    fn fingerprint(&self, _: &LabelSet) -> Fingerprint {
        Fingerprint::from_bytes([0xab; 32])
    }
}
