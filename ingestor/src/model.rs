use std::fmt;

use serde::{Deserialize, Serialize};

use crate::labels::LabelSet;

/// Stable identifier of a series, assigned by the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeriesId(i64);

impl SeriesId {
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Time in milliseconds since the Unix epoch
    pub timestamp: i64,
    pub value: f64,
}

impl Sample {
    pub const fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// One series of a decoded write request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    pub labels: LabelSet,
    pub samples: Vec<Sample>,
}

impl TimeSeries {
    pub fn new(labels: LabelSet, samples: Vec<Sample>) -> Self {
        Self { labels, samples }
    }
}

/// Identifies the producer of a write request in high-availability mode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HaTag {
    pub cluster: String,
    pub replica: String,
}

impl HaTag {
    pub fn new(cluster: impl Into<String>, replica: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            replica: replica.into(),
        }
    }
}

/// An already decoded remote-write request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub series: Vec<TimeSeries>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ha: Option<HaTag>,
}

impl WriteRequest {
    pub fn new(series: Vec<TimeSeries>) -> Self {
        Self { series, ha: None }
    }

    pub fn with_ha(mut self, tag: HaTag) -> Self {
        self.ha = Some(tag);
        self
    }

    pub fn num_samples(&self) -> usize {
        self.series.iter().map(|s| s.samples.len()).sum()
    }

    /// A request is empty when it carries no samples at all.
    pub fn is_empty(&self) -> bool {
        self.series.iter().all(|s| s.samples.is_empty())
    }
}

/// A sample bound to its series identity, as written to a metric container.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Row {
    pub series_id: SeriesId,
    pub timestamp: i64,
    pub value: f64,
}
