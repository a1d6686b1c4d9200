//! Write path for Prometheus-style samples.
//!
//! A decoded write request goes through the HA deduplicator, its label sets
//! are resolved to series identities (cache first, catalog on miss), the
//! resolved samples are routed into per-metric batches and a fixed pool of
//! copiers upserts them into the backing store.

pub mod cache;
pub mod clock;
pub mod config;
pub mod copier;
mod error;
pub mod ha;
mod ingest;
pub mod labels;
mod model;
pub mod readback;
pub mod resolver;
pub mod retry;
pub mod router;
pub mod storage;

pub use {
    config::Config,
    error::{ConfigError, Error, ErrorKind, Result},
    ingest::{IngestReport, Ingestor, IngestorBuilder},
    labels::{LabelSet, METRIC_NAME_LABEL},
    model::{HaTag, Row, Sample, SeriesId, TimeSeries, WriteRequest},
};

// See https://docs.rs/indexmap/latest/indexmap/#alternate-hashers
pub(crate) type FxIndexMap<K, V> =
    indexmap::IndexMap<K, V, std::hash::BuildHasherDefault<rustc_hash::FxHasher>>;
