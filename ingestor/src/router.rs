use std::{fmt, sync::Arc, time::Duration};

use crate::{
    model::{Row, Sample, SeriesId},
    FxIndexMap,
};

/// Where a batch lands: the metric container and, optionally, the start of
/// its time window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub metric: Arc<str>,
    pub window_start: Option<i64>,
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.window_start {
            Some(start) => write!(f, "{}@{start}", self.metric),
            None => f.write_str(&self.metric),
        }
    }
}

/// Rows destined for one metric container, in the order they were received.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub key: PartitionKey,
    pub rows: Vec<Row>,
}

impl Batch {
    pub fn container(&self) -> &str {
        &self.key.metric
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A series whose identity has been resolved.
#[derive(Debug, Clone)]
pub struct ResolvedSeries {
    pub metric: Arc<str>,
    pub id: SeriesId,
    pub samples: Vec<Sample>,
}

/// Splits resolved series into per-partition batches.
#[derive(Debug, Clone, Default)]
pub struct BatchRouter {
    /// Width of the time sub-partition in milliseconds, if any.
    window_ms: Option<i64>,
}

impl BatchRouter {
    pub fn new(window: Option<Duration>) -> Self {
        let window_ms = window
            .map(|w| i64::try_from(w.as_millis()).unwrap_or(i64::MAX))
            .filter(|&ms| ms > 0);
        Self { window_ms }
    }

    /// Groups samples by partition key. Partitions appear in the order their
    /// first sample was seen and rows keep the caller's order, so samples of
    /// one series stay in the order they were received.
    pub fn route(&self, series: Vec<ResolvedSeries>) -> FxIndexMap<PartitionKey, Batch> {
        let mut batches = FxIndexMap::<PartitionKey, Batch>::default();
        for s in series {
            for sample in s.samples {
                let key = self.partition_key(&s.metric, sample.timestamp);
                batches
                    .entry(key)
                    .or_insert_with_key(|key| Batch {
                        key: key.clone(),
                        rows: Vec::new(),
                    })
                    .rows
                    .push(Row {
                        series_id: s.id,
                        timestamp: sample.timestamp,
                        value: sample.value,
                    });
            }
        }
        batches
    }

    fn partition_key(&self, metric: &Arc<str>, timestamp: i64) -> PartitionKey {
        PartitionKey {
            metric: Arc::clone(metric),
            window_start: self
                .window_ms
                .map(|w| timestamp.div_euclid(w).saturating_mul(w)),
        }
    }
}
