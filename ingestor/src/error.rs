use std::time::Duration;

use crate::{
    labels::{Fingerprint, LabelError, LabelSet},
    storage::{StoreError, StoreErrorKind},
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse classification callers use to map failures to wire status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connectivity or timeout; the request may be retried as a whole.
    Transient,
    /// Malformed or conflicting data; retrying will not help.
    DataIntegrity,
    /// Non-retryable failure reported by the backing store.
    Storage,
    /// The caller cancelled the request before the batch was dispatched.
    Cancelled,
    /// The copier pool has been shut down.
    Shutdown,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("invalid label set: {0}")]
    InvalidLabels(#[from] LabelError),
    #[error("fingerprint {fingerprint} of {requested} is already bound to {cached}")]
    FingerprintCollision {
        fingerprint: Fingerprint,
        cached: LabelSet,
        requested: LabelSet,
    },
    #[error("{op} timed out after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },
    #[error("{op} failed: {source}")]
    Store {
        op: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("ingest request was cancelled")]
    Cancelled,
    #[error("copier pool is shut down")]
    Shutdown,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidLabels(_) | Error::FingerprintCollision { .. } => {
                ErrorKind::DataIntegrity
            }
            Error::Timeout { .. } => ErrorKind::Transient,
            Error::Store { source, .. } => match source.kind() {
                StoreErrorKind::Transient => ErrorKind::Transient,
                StoreErrorKind::UnknownMetric | StoreErrorKind::Integrity => {
                    ErrorKind::DataIntegrity
                }
                StoreErrorKind::Fatal => ErrorKind::Storage,
            },
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Shutdown => ErrorKind::Shutdown,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub(crate) fn is_unknown_metric(&self) -> bool {
        matches!(
            self,
            Error::Store { source, .. } if source.kind() == StoreErrorKind::UnknownMetric
        )
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("copier_workers must be at least 1")]
    NoCopiers,
    #[error("copier_queue_capacity must be at least 1")]
    NoQueue,
    #[error("retry.max_attempts must be at least 1")]
    NoAttempts,
    #[error("retry.base must be a finite number >= 1.0, got {0}")]
    BadBackoffBase(f64),
    #[error("call_timeout must be non-zero")]
    ZeroTimeout,
    #[error("ha.cluster_label and ha.replica_label must be distinct and non-empty")]
    BadHaLabels,
}
