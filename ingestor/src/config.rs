use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, ha::HaConfig, retry::RetryPolicy};

/// Write path configuration. Durations are (de)serialized as milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of long-lived copier workers shared by all requests.
    pub copier_workers: usize,
    /// Batches waiting for a copier; submitters block when it is full.
    pub copier_queue_capacity: usize,
    /// Maximum number of cached series identities; 0 disables the cache.
    pub cache_capacity: usize,
    /// Timeout of every single catalog or store call.
    #[serde(with = "duration_ms")]
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
    pub ha: HaConfig,
    /// Splits each metric's batch into time windows of this width.
    #[serde(with = "duration_ms::option")]
    pub partition_window: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            copier_workers: 8,
            copier_queue_capacity: 1024,
            cache_capacity: 100_000,
            call_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            ha: HaConfig::default(),
            partition_window: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.copier_workers == 0 {
            return Err(ConfigError::NoCopiers);
        }
        if self.copier_queue_capacity == 0 {
            return Err(ConfigError::NoQueue);
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }
        if !self.retry.base.is_finite() || self.retry.base < 1.0 {
            return Err(ConfigError::BadBackoffBase(self.retry.base));
        }
        if self.call_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        let ha = &self.ha;
        if ha.enabled
            && (ha.cluster_label.is_empty()
                || ha.replica_label.is_empty()
                || ha.cluster_label == ha.replica_label)
        {
            return Err(ConfigError::BadHaLabels);
        }
        Ok(())
    }
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => s.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ha::{NonLeaderPolicy, TakeoverPolicy};

    #[test]
    fn test_config_from_json() {
        let config: Config = serde_json::from_str(
            r#"{
                "copier_workers": 2,
                "call_timeout": 500,
                "retry": {"max_attempts": 5},
                "ha": {"enabled": true, "takeover": {"kind": "sample_time", "timeout": 30000}},
                "partition_window": 3600000
            }"#,
        )
        .unwrap();
        assert_eq!(config.copier_workers, 2);
        assert_eq!(config.cache_capacity, Config::default().cache_capacity);
        assert_eq!(config.call_timeout, Duration::from_millis(500));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.init_backoff, Duration::from_millis(10));
        assert!(config.ha.enabled);
        assert_eq!(
            config.ha.takeover,
            TakeoverPolicy::SampleTime {
                timeout: Duration::from_secs(30)
            }
        );
        assert_eq!(config.ha.non_leader, NonLeaderPolicy::Drop);
        assert_eq!(config.partition_window, Some(Duration::from_secs(3600)));
        config.validate().unwrap();
    }

    #[test]
    fn test_config_validate() {
        assert_eq!(Config::default().validate(), Ok(()));

        let config = Config {
            copier_workers: 0,
            ..Config::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NoCopiers));

        let mut config = Config::default();
        config.retry.base = 0.5;
        assert_eq!(config.validate(), Err(ConfigError::BadBackoffBase(0.5)));

        let mut config = Config::default();
        config.ha.enabled = true;
        config.ha.replica_label = config.ha.cluster_label.clone();
        assert_eq!(config.validate(), Err(ConfigError::BadHaLabels));
    }
}
