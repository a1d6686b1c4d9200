use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::{
    cache::{CachedSeries, SeriesCache},
    error::{Error, Result},
    labels::{Fingerprint, Fingerprinter, LabelSet},
    model::SeriesId,
    retry::RetryPolicy,
    storage::Catalog,
    FxIndexMap,
};

/// Resolves label sets to series identities, cache first, catalog on miss.
pub struct IdentityResolver {
    cache: Arc<SeriesCache>,
    catalog: Arc<dyn Catalog>,
    fingerprinter: Arc<dyn Fingerprinter>,
    retry: RetryPolicy,
    call_timeout: Duration,
    /// Metrics whose containers were ensured but not yet finalized.
    unfinalized: Mutex<FxHashSet<String>>,
}

impl std::fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityResolver")
            .field("cache", &self.cache.stats())
            .field("fingerprinter", &self.fingerprinter)
            .field("retry", &self.retry)
            .field("call_timeout", &self.call_timeout)
            .field("unfinalized", &*self.unfinalized.lock())
            .finish_non_exhaustive()
    }
}

/// A distinct label set missing from the cache, with every request
/// position that carries it.
struct Miss {
    fingerprint: Fingerprint,
    indices: Vec<usize>,
}

type Misses<'a> = FxIndexMap<&'a LabelSet, Miss>;

impl IdentityResolver {
    pub fn new(
        cache: Arc<SeriesCache>,
        catalog: Arc<dyn Catalog>,
        fingerprinter: Arc<dyn Fingerprinter>,
        retry: RetryPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            catalog,
            fingerprinter,
            retry,
            call_timeout,
            unfinalized: Mutex::new(FxHashSet::default()),
        }
    }

    pub fn cache(&self) -> &Arc<SeriesCache> {
        &self.cache
    }

    pub async fn resolve(&self, labels: &LabelSet) -> Result<SeriesId> {
        let mut results = self.resolve_batch(std::slice::from_ref(labels)).await;
        results.pop().unwrap_or(Err(Error::Cancelled))
    }

    /// Resolves every label set of a request.
    ///
    /// Misses are grouped per metric and deduplicated per label set; a
    /// metric whose container is missing gets exactly one
    /// `ensure_metric_container` call, and bookkeeping is finalized once at
    /// the end. Identities of newly created metrics are cached only after
    /// finalization succeeds. Results line up with `labels`.
    #[tracing::instrument(
        name = "resolver:resolve_batch",
        skip_all,
        fields(series = labels.len())
    )]
    pub async fn resolve_batch(&self, labels: &[LabelSet]) -> Vec<Result<SeriesId>> {
        let mut results: Vec<Option<Result<SeriesId>>> = vec![None; labels.len()];
        let mut misses = FxIndexMap::<&str, Misses<'_>>::default();

        for (index, set) in labels.iter().enumerate() {
            let metric = match set.metric() {
                Ok(metric) => metric,
                Err(e) => {
                    results[index] = Some(Err(e.into()));
                    continue;
                }
            };
            if let Some(miss) = misses.get_mut(metric).and_then(|m| m.get_mut(set)) {
                miss.indices.push(index);
                continue;
            }
            let fingerprint = self.fingerprinter.fingerprint(set);
            match self.cache.lookup(&fingerprint) {
                Some(cached) if &cached.labels == set => results[index] = Some(Ok(cached.id)),
                Some(cached) => {
                    results[index] = Some(Err(Error::FingerprintCollision {
                        fingerprint,
                        cached: cached.labels,
                        requested: set.clone(),
                    }))
                }
                None => {
                    misses.entry(metric).or_default().insert(
                        set,
                        Miss {
                            fingerprint,
                            indices: vec![index],
                        },
                    );
                }
            }
        }

        let mut created = Vec::new();
        for (metric, entries) in misses {
            tracing::debug!(metric, misses = entries.len(), "resolving series from catalog");
            let ensured = self.resolve_metric(metric, &entries, &mut results).await;
            if ensured || self.unfinalized.lock().contains(metric) {
                created.push((metric, entries));
            } else {
                self.remember(&entries, &mut results);
            }
        }

        let pending = self.unfinalized.lock().clone();
        if created.is_empty() && pending.is_empty() {
            return collect(results);
        }

        let catalog = &*self.catalog;
        let finalized = self
            .retry
            .run("finalize_metric_creation", self.call_timeout, || {
                catalog.finalize_metric_creation()
            })
            .await;
        match finalized {
            Ok(()) => {
                self.unfinalized
                    .lock()
                    .retain(|metric| !pending.contains(metric));
                for (_, entries) in &created {
                    self.remember(entries, &mut results);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to finalize metric creation");
                let mut unfinalized = self.unfinalized.lock();
                for (metric, entries) in &created {
                    unfinalized.insert((*metric).to_owned());
                    for index in entries.values().flat_map(|miss| &miss.indices) {
                        results[*index] = Some(Err(e.clone()));
                    }
                }
            }
        }
        collect(results)
    }

    /// Resolves the misses of one metric, creating its container on demand.
    /// Returns whether the container had to be ensured.
    async fn resolve_metric(
        &self,
        metric: &str,
        entries: &Misses<'_>,
        results: &mut [Option<Result<SeriesId>>],
    ) -> bool {
        let catalog = &*self.catalog;
        let mut ensured = false;
        for (pos, (set, miss)) in entries.iter().enumerate() {
            let mut created = self
                .retry
                .run("get_or_create_series", self.call_timeout, || {
                    catalog.get_or_create_series(metric, set)
                })
                .await;

            if !ensured && matches!(&created, Err(e) if e.is_unknown_metric()) {
                let ensure = self
                    .retry
                    .run("ensure_metric_container", self.call_timeout, || {
                        catalog.ensure_metric_container(metric)
                    })
                    .await;
                if let Err(e) = ensure {
                    tracing::warn!(metric, error = %e, "failed to create metric container");
                    for rest in entries.values().skip(pos) {
                        settle(results, rest, Err(e.clone()));
                    }
                    return false;
                }
                tracing::info!(metric, "metric container ensured");
                ensured = true;
                created = self
                    .retry
                    .run("get_or_create_series", self.call_timeout, || {
                        catalog.get_or_create_series(metric, set)
                    })
                    .await;
            }
            settle(results, miss, created);
        }
        ensured
    }

    /// Caches the resolved identities of `entries`. A cached entry with the
    /// same fingerprint but other labels turns the result into a collision.
    fn remember(&self, entries: &Misses<'_>, results: &mut [Option<Result<SeriesId>>]) {
        for (set, miss) in entries {
            let Some(Some(Ok(id))) = miss.indices.first().map(|i| results[*i].clone()) else {
                continue;
            };
            let entry = CachedSeries {
                id,
                labels: (*set).clone(),
            };
            if let Err(cached) = self.cache.insert(miss.fingerprint, entry) {
                let collision = Error::FingerprintCollision {
                    fingerprint: miss.fingerprint,
                    cached: cached.labels,
                    requested: (*set).clone(),
                };
                settle(results, miss, Err(collision));
            }
        }
    }
}

fn settle(results: &mut [Option<Result<SeriesId>>], miss: &Miss, result: Result<SeriesId>) {
    for index in &miss.indices {
        results[*index] = Some(result.clone());
    }
}

fn collect(results: Vec<Option<Result<SeriesId>>>) -> Vec<Result<SeriesId>> {
    results
        .into_iter()
        .map(|r| r.unwrap_or(Err(Error::Cancelled)))
        .collect()
}
