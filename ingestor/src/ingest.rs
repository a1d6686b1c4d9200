use std::sync::Arc;

use serde::{Serialize, Serializer};
use tokio_util::sync::CancellationToken;

use crate::{
    cache::SeriesCache,
    clock::{Clock, SystemClock},
    config::Config,
    copier::CopierPool,
    error::{ConfigError, Error, Result},
    ha::HaDeduplicator,
    labels::{Blake3Fingerprinter, Fingerprinter, LabelSet},
    model::WriteRequest,
    resolver::IdentityResolver,
    router::{BatchRouter, ResolvedSeries},
    storage::{Catalog, SampleStore},
    FxIndexMap,
};

/// Aggregate outcome of one ingest call. Partial success is normal: failed
/// batches never stop their siblings.
#[derive(Debug, Default, Clone, Serialize)]
pub struct IngestReport {
    pub rows_inserted: u64,
    /// Samples rejected by the HA deduplicator.
    pub duplicates_dropped: u64,
    pub batches: usize,
    pub failed_batches: usize,
    #[serde(serialize_with = "error_message")]
    pub first_error: Option<Error>,
}

impl IngestReport {
    pub fn is_success(&self) -> bool {
        self.first_error.is_none()
    }

    pub fn into_result(self) -> Result<u64> {
        match self.first_error {
            Some(e) => Err(e),
            None => Ok(self.rows_inserted),
        }
    }

    fn record_failure(&mut self, err: Error) {
        self.failed_batches += 1;
        if self.first_error.is_none() {
            self.first_error = Some(err);
        }
    }
}

fn error_message<S: Serializer>(err: &Option<Error>, s: S) -> std::result::Result<S::Ok, S::Error> {
    match err {
        Some(e) => s.serialize_some(&e.to_string()),
        None => s.serialize_none(),
    }
}

pub struct IngestorBuilder {
    config: Config,
    catalog: Arc<dyn Catalog>,
    store: Arc<dyn SampleStore>,
    cache: Option<Arc<SeriesCache>>,
    dedup: Option<Arc<HaDeduplicator>>,
    fingerprinter: Arc<dyn Fingerprinter>,
    clock: Arc<dyn Clock>,
}

impl IngestorBuilder {
    pub fn new(catalog: Arc<dyn Catalog>, store: Arc<dyn SampleStore>) -> Self {
        Self {
            config: Config::default(),
            catalog,
            store,
            cache: None,
            dedup: None,
            fingerprinter: Arc::new(Blake3Fingerprinter),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Shares an existing series cache instead of sizing a new one from the
    /// config.
    pub fn cache(mut self, cache: Arc<SeriesCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Shares existing HA lease state.
    pub fn deduplicator(mut self, dedup: Arc<HaDeduplicator>) -> Self {
        self.dedup = Some(dedup);
        self
    }

    pub fn fingerprinter(mut self, fingerprinter: Arc<dyn Fingerprinter>) -> Self {
        self.fingerprinter = fingerprinter;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validates the config and starts the copier pool. Must be called from
    /// within a tokio runtime.
    pub fn build(self) -> Result<Ingestor, ConfigError> {
        let config = self.config;
        config.validate()?;

        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(SeriesCache::new(config.cache_capacity)));
        let dedup = self
            .dedup
            .unwrap_or_else(|| Arc::new(HaDeduplicator::with_clock(config.ha.clone(), self.clock)));
        let resolver = IdentityResolver::new(
            cache,
            self.catalog,
            self.fingerprinter,
            config.retry.clone(),
            config.call_timeout,
        );
        let copiers = CopierPool::start(
            config.copier_workers,
            config.copier_queue_capacity,
            self.store,
            config.retry.clone(),
            config.call_timeout,
        );
        tracing::info!(
            copiers = config.copier_workers,
            cache_capacity = config.cache_capacity,
            ha = config.ha.enabled,
            "ingestor started"
        );
        Ok(Ingestor {
            resolver,
            router: BatchRouter::new(config.partition_window),
            copiers,
            dedup,
        })
    }
}

/// Entry point of the write path. Cheap to share behind an `Arc`; all
/// concurrent requests use the same cache, lease state and copier pool.
#[derive(Debug)]
pub struct Ingestor {
    resolver: IdentityResolver,
    router: BatchRouter,
    copiers: CopierPool,
    dedup: Arc<HaDeduplicator>,
}

impl Ingestor {
    pub fn builder(catalog: Arc<dyn Catalog>, store: Arc<dyn SampleStore>) -> IngestorBuilder {
        IngestorBuilder::new(catalog, store)
    }

    pub fn cache(&self) -> &Arc<SeriesCache> {
        self.resolver.cache()
    }

    pub fn deduplicator(&self) -> &Arc<HaDeduplicator> {
        &self.dedup
    }

    pub async fn ingest(&self, req: WriteRequest) -> IngestReport {
        self.ingest_with_cancel(req, &CancellationToken::new()).await
    }

    /// Writes `req` and waits for every dispatched batch.
    ///
    /// Once `cancel` fires, batches that were not handed to a copier yet
    /// fail with [`Error::Cancelled`]; dispatched batches still complete.
    #[tracing::instrument(name = "ingest", skip_all, fields(series = req.series.len()))]
    pub async fn ingest_with_cancel(
        &self,
        req: WriteRequest,
        cancel: &CancellationToken,
    ) -> IngestReport {
        let mut report = IngestReport::default();
        if req.is_empty() {
            return report;
        }

        let (req, dedup) = self.dedup.filter(req);
        report.duplicates_dropped = dedup.dropped;
        let series = req
            .series
            .into_iter()
            .filter(|s| !s.samples.is_empty())
            .collect::<Vec<_>>();
        if series.is_empty() {
            return report;
        }
        if cancel.is_cancelled() {
            report.record_failure(Error::Cancelled);
            return report;
        }

        let labels = series.iter().map(|s| s.labels.clone()).collect::<Vec<_>>();
        let ids = self.resolver.resolve_batch(&labels).await;

        // A series that fails to resolve fails its whole metric batch.
        let mut metrics = FxIndexMap::<String, Arc<str>>::default();
        let mut poisoned = FxIndexMap::<Arc<str>, Error>::default();
        let mut unnamed = Vec::new();
        let mut resolved = Vec::with_capacity(series.len());
        for (s, id) in series.into_iter().zip(ids) {
            let metric = match metric_of(&s.labels, &mut metrics) {
                Ok(metric) => metric,
                Err(e) => {
                    unnamed.push(e);
                    continue;
                }
            };
            match id {
                Ok(id) => resolved.push(ResolvedSeries {
                    metric,
                    id,
                    samples: s.samples,
                }),
                Err(e) => {
                    poisoned.entry(metric).or_insert(e);
                }
            }
        }
        resolved.retain(|s| !poisoned.contains_key(&s.metric));

        let batches = self.router.route(resolved);
        report.batches = batches.len() + poisoned.len() + unnamed.len();
        for err in unnamed.into_iter().chain(poisoned.into_iter().map(|(_, e)| e)) {
            report.record_failure(err);
        }

        let mut pending = Vec::with_capacity(batches.len());
        for (key, batch) in batches {
            if cancel.is_cancelled() {
                tracing::debug!(partition = %key, "not dispatching batch of cancelled request");
                report.record_failure(Error::Cancelled);
                continue;
            }
            match self.copiers.submit(batch, cancel).await {
                Ok(outcome) => pending.push(outcome),
                Err(e) => report.record_failure(e),
            }
        }

        for outcome in pending {
            match outcome.await {
                Ok(outcome) => match outcome.result {
                    Ok(rows) => report.rows_inserted += rows,
                    Err(e) => report.record_failure(e),
                },
                Err(_) => report.record_failure(Error::Shutdown),
            }
        }

        tracing::debug!(
            rows = report.rows_inserted,
            batches = report.batches,
            failed = report.failed_batches,
            dropped = report.duplicates_dropped,
            "ingest done"
        );
        report
    }

    /// Stops the copier pool after draining queued batches.
    pub async fn shutdown(&self) {
        self.copiers.shutdown().await;
    }
}

fn metric_of(labels: &LabelSet, interned: &mut FxIndexMap<String, Arc<str>>) -> Result<Arc<str>> {
    let metric = labels.metric()?;
    if let Some(metric) = interned.get(metric) {
        return Ok(metric.clone());
    }
    let shared: Arc<str> = Arc::from(metric);
    interned.insert(metric.to_owned(), shared.clone());
    Ok(shared)
}
