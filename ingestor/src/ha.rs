//! High-availability deduplication.
//!
//! Redundant Prometheus replicas scrape the same targets and all push their
//! samples. Per cluster, one replica holds a lease and only its samples are
//! admitted. Every admitted write extends the lease coverage
//! (`valid_through`) to its newest timestamp. Another replica may take over
//! only once the lease has expired, as decided by the [`TakeoverPolicy`].

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    clock::{Clock, SystemClock},
    config::duration_ms,
    model::{HaTag, WriteRequest},
};

/// When a non-leader replica may take over the lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TakeoverPolicy {
    /// The lease expires when the leader has not written for `timeout` of
    /// wall-clock time.
    LeaseTimeout {
        #[serde(with = "duration_ms")]
        timeout: Duration,
    },
    /// The lease expires when the candidate's newest sample is more than
    /// `timeout` past the leader's coverage.
    SampleTime {
        #[serde(with = "duration_ms")]
        timeout: Duration,
    },
    /// The first elected replica keeps the lease forever.
    Never,
}

impl Default for TakeoverPolicy {
    fn default() -> Self {
        TakeoverPolicy::LeaseTimeout {
            timeout: Duration::from_secs(60),
        }
    }
}

/// What to do with non-leader samples the leader already covers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NonLeaderPolicy {
    #[default]
    Drop,
    /// Keep them as background data; the store upserts on (series, time).
    AcceptCovered,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HaConfig {
    pub enabled: bool,
    pub takeover: TakeoverPolicy,
    pub non_leader: NonLeaderPolicy,
    /// Label naming the cluster when a request carries no explicit tag.
    pub cluster_label: String,
    /// Label naming the replica. It is stripped from every series so all
    /// replicas resolve to the same identities.
    pub replica_label: String,
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            takeover: TakeoverPolicy::default(),
            non_leader: NonLeaderPolicy::default(),
            cluster_label: "cluster".to_owned(),
            replica_label: "__replica__".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseState {
    NoLeader,
    LeaderElected {
        replica: String,
        /// Newest sample timestamp (ms) admitted from the leader.
        valid_through: i64,
        /// Wall-clock time of the leader's last admitted write.
        last_write: SystemTime,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    pub admitted: u64,
    pub dropped: u64,
}

pub struct HaDeduplicator {
    config: HaConfig,
    clock: Arc<dyn Clock>,
    leases: DashMap<String, Arc<Mutex<LeaseState>>>,
}

impl std::fmt::Debug for HaDeduplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HaDeduplicator")
            .field("config", &self.config)
            .field("clusters", &self.leases.len())
            .finish()
    }
}

impl HaDeduplicator {
    pub fn new(config: HaConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: HaConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            leases: DashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Current lease of `cluster`.
    pub fn leader(&self, cluster: &str) -> LeaseState {
        self.leases
            .get(cluster)
            .map(|lease| lease.lock().clone())
            .unwrap_or(LeaseState::NoLeader)
    }

    /// Drops the samples the producing replica is not entitled to write.
    ///
    /// Requests without HA identity pass through untouched. Rejections are
    /// only counted, they never fail the request.
    pub fn filter(&self, mut req: WriteRequest) -> (WriteRequest, DedupStats) {
        let total = req.num_samples() as u64;
        if !self.config.enabled {
            return (req, DedupStats { admitted: total, dropped: 0 });
        }

        let tag = req.ha.clone().or_else(|| self.tag_from_labels(&req));
        for series in &mut req.series {
            series.labels = series.labels.without(&self.config.replica_label);
        }
        let Some(tag) = tag else {
            return (req, DedupStats { admitted: total, dropped: 0 });
        };
        let Some((_, newest)) = time_range(&req) else {
            return (req, DedupStats::default());
        };

        // Clone the lease out so the map shard is not locked while we work.
        let lease = self
            .leases
            .entry(tag.cluster.clone())
            .or_insert_with(|| Arc::new(Mutex::new(LeaseState::NoLeader)))
            .clone();
        let now = self.clock.now();
        let accept_covered = self.config.non_leader == NonLeaderPolicy::AcceptCovered;

        let mut state = lease.lock();
        let keep: Box<dyn Fn(i64) -> bool> = match &mut *state {
            LeaseState::NoLeader => {
                tracing::info!(cluster = %tag.cluster, replica = %tag.replica, "HA leader elected");
                *state = LeaseState::LeaderElected {
                    replica: tag.replica.clone(),
                    valid_through: newest,
                    last_write: now,
                };
                Box::new(|_| true)
            }
            LeaseState::LeaderElected {
                replica,
                valid_through,
                last_write,
            } if *replica == tag.replica => {
                *valid_through = (*valid_through).max(newest);
                *last_write = now;
                Box::new(|_| true)
            }
            LeaseState::LeaderElected {
                replica,
                valid_through,
                last_write,
            } => {
                let covered = *valid_through;
                if newest > covered && self.lease_expired(covered, *last_write, newest, now) {
                    tracing::info!(
                        cluster = %tag.cluster,
                        from = %replica,
                        to = %tag.replica,
                        valid_through = covered,
                        "HA leader changed"
                    );
                    *replica = tag.replica.clone();
                    *valid_through = newest;
                    *last_write = now;
                    Box::new(move |ts| ts > covered || accept_covered)
                } else {
                    Box::new(move |ts| ts <= covered && accept_covered)
                }
            }
        };
        drop(state);

        let mut stats = DedupStats::default();
        for series in &mut req.series {
            let before = series.samples.len();
            series.samples.retain(|s| keep(s.timestamp));
            stats.admitted += series.samples.len() as u64;
            stats.dropped += (before - series.samples.len()) as u64;
        }
        if stats.dropped > 0 {
            tracing::debug!(
                cluster = %tag.cluster,
                replica = %tag.replica,
                dropped = stats.dropped,
                "dropped non-leader samples"
            );
        }
        (req, stats)
    }

    fn lease_expired(
        &self,
        covered: i64,
        last_write: SystemTime,
        newest: i64,
        now: SystemTime,
    ) -> bool {
        match &self.config.takeover {
            TakeoverPolicy::LeaseTimeout { timeout } => now
                .duration_since(last_write)
                .map_or(false, |idle| idle >= *timeout),
            TakeoverPolicy::SampleTime { timeout } => {
                let timeout = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
                newest.saturating_sub(covered) > timeout
            }
            TakeoverPolicy::Never => false,
        }
    }

    /// Reads the HA identity from the first series labelled with both the
    /// cluster and the replica label.
    fn tag_from_labels(&self, req: &WriteRequest) -> Option<HaTag> {
        req.series.iter().find_map(|s| {
            let cluster = s.labels.get(&self.config.cluster_label)?;
            let replica = s.labels.get(&self.config.replica_label)?;
            Some(HaTag::new(cluster, replica))
        })
    }
}

/// Oldest and newest sample timestamps of a request.
fn time_range(req: &WriteRequest) -> Option<(i64, i64)> {
    req.series
        .iter()
        .flat_map(|s| s.samples.iter().map(|sample| sample.timestamp))
        .fold(None, |range, ts| match range {
            None => Some((ts, ts)),
            Some((lo, hi)) => Some((lo.min(ts), hi.max(ts))),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::MockClock, labels::LabelSet, model::Sample, model::TimeSeries};

    fn request(replica: &str, range: std::ops::RangeInclusive<i64>) -> WriteRequest {
        let labels = LabelSet::try_new([("__name__", "up")]).unwrap();
        let samples = range.map(|t| Sample::new(t, 1.0)).collect();
        WriteRequest::new(vec![TimeSeries::new(labels, samples)]).with_ha(HaTag::new("c1", replica))
    }

    fn dedup(config: HaConfig) -> (HaDeduplicator, Arc<MockClock>) {
        let clock = Arc::new(MockClock::with_time(SystemTime::UNIX_EPOCH));
        let dedup = HaDeduplicator::with_clock(
            HaConfig {
                enabled: true,
                ..config
            },
            clock.clone(),
        );
        (dedup, clock)
    }

    fn timestamps(req: &WriteRequest) -> Vec<i64> {
        req.series[0].samples.iter().map(|s| s.timestamp).collect()
    }

    #[test]
    fn test_disabled_passes_everything() {
        let dedup = HaDeduplicator::new(HaConfig::default());
        let (req, stats) = dedup.filter(request("a", 0..=9));
        assert_eq!(req.num_samples(), 10);
        assert_eq!(stats, DedupStats { admitted: 10, dropped: 0 });
        assert_eq!(dedup.leader("c1"), LeaseState::NoLeader);
    }

    #[test]
    fn test_overlapping_replicas() {
        let (dedup, _) = dedup(HaConfig::default());
        let (_, stats) = dedup.filter(request("a", 0..=100));
        assert_eq!(stats, DedupStats { admitted: 101, dropped: 0 });

        let (req, stats) = dedup.filter(request("b", 50..=150));
        assert_eq!(stats, DedupStats { admitted: 0, dropped: 101 });
        assert!(req.is_empty());

        let (_, stats) = dedup.filter(request("a", 101..=150));
        assert_eq!(stats.admitted, 50);
        assert!(matches!(
            dedup.leader("c1"),
            LeaseState::LeaderElected { replica, valid_through: 150, .. } if replica == "a"
        ));
    }

    #[test]
    fn test_takeover_after_lease_timeout() {
        let (dedup, clock) = dedup(HaConfig::default());
        dedup.filter(request("a", 0..=100));

        clock.advance(Duration::from_secs(61));
        let (req, stats) = dedup.filter(request("b", 90..=120));
        // only what the old leader did not cover
        assert_eq!(timestamps(&req), (101..=120).collect::<Vec<_>>());
        assert_eq!(stats.dropped, 11);
        assert!(matches!(
            dedup.leader("c1"),
            LeaseState::LeaderElected { replica, valid_through: 120, .. } if replica == "b"
        ));

        // the former leader is now the follower
        let (_, stats) = dedup.filter(request("a", 101..=110));
        assert_eq!(stats.admitted, 0);
    }

    #[test]
    fn test_no_takeover_within_coverage() {
        let (dedup, clock) = dedup(HaConfig::default());
        dedup.filter(request("a", 0..=100));
        clock.advance(Duration::from_secs(600));
        // nothing beyond coverage, leadership is not re-evaluated
        let (_, stats) = dedup.filter(request("b", 10..=20));
        assert_eq!(stats.admitted, 0);
        assert!(matches!(
            dedup.leader("c1"),
            LeaseState::LeaderElected { replica, .. } if replica == "a"
        ));
    }

    #[test]
    fn test_accept_covered() {
        let (dedup, _) = dedup(HaConfig {
            non_leader: NonLeaderPolicy::AcceptCovered,
            ..HaConfig::default()
        });
        dedup.filter(request("a", 0..=100));
        let (req, stats) = dedup.filter(request("b", 90..=110));
        assert_eq!(timestamps(&req), (90..=100).collect::<Vec<_>>());
        assert_eq!(stats, DedupStats { admitted: 11, dropped: 10 });
    }

    #[test]
    fn test_sample_time_takeover() {
        let (dedup, _) = dedup(HaConfig {
            takeover: TakeoverPolicy::SampleTime {
                timeout: Duration::from_millis(50),
            },
            ..HaConfig::default()
        });
        dedup.filter(request("a", 0..=100));
        let (_, stats) = dedup.filter(request("b", 120..=140));
        assert_eq!(stats.admitted, 0);
        let (_, stats) = dedup.filter(request("b", 151..=160));
        assert_eq!(stats.admitted, 10);
    }

    #[test]
    fn test_never_takeover() {
        let (dedup, clock) = dedup(HaConfig {
            takeover: TakeoverPolicy::Never,
            ..HaConfig::default()
        });
        dedup.filter(request("a", 0..=10));
        clock.advance(Duration::from_secs(3600));
        let (_, stats) = dedup.filter(request("b", 11..=20));
        assert_eq!(stats.admitted, 0);
    }

    #[test]
    fn test_tag_from_labels() {
        let (dedup, _) = dedup(HaConfig::default());
        let series = |replica: &str, ts: i64| {
            let labels =
                LabelSet::try_new([("__name__", "up"), ("cluster", "c1"), ("__replica__", replica)])
                    .unwrap();
            WriteRequest::new(vec![TimeSeries::new(labels, vec![Sample::new(ts, 1.0)])])
        };

        let (req, stats) = dedup.filter(series("a", 1));
        assert_eq!(stats.admitted, 1);
        // the replica label is gone so both replicas share series identities
        assert_eq!(req.series[0].labels.get("__replica__"), None);
        assert_eq!(req.series[0].labels.get("cluster"), Some("c1"));

        let (_, stats) = dedup.filter(series("b", 1));
        assert_eq!(stats.dropped, 1);
    }

    #[test]
    fn test_untagged_request_passes() {
        let (dedup, _) = dedup(HaConfig::default());
        let mut req = request("a", 0..=4);
        req.ha = None;
        let (req, stats) = dedup.filter(req);
        assert_eq!(stats.admitted, 5);
        assert_eq!(req.num_samples(), 5);
    }

    #[test]
    fn test_concurrent_replicas_elect_one_leader() {
        let (dedup, _clock) = dedup(HaConfig::default());
        let results = std::thread::scope(|scope| {
            let handles = (0..20i64)
                .map(|i| {
                    let replica = if i % 2 == 0 { "a" } else { "b" };
                    let from = (i / 2) * 10;
                    let dedup = &dedup;
                    let req = request(replica, from..=from + 9);
                    scope.spawn(move || (replica, dedup.filter(req).1))
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });

        let LeaseState::LeaderElected {
            replica: leader,
            valid_through,
            ..
        } = dedup.leader("c1")
        else {
            panic!("no leader elected");
        };
        assert_eq!(valid_through, 99);

        let admitted = |name: &str| {
            results
                .iter()
                .filter(|(replica, _)| *replica == name)
                .map(|(_, stats)| stats.admitted)
                .sum::<u64>()
        };
        let follower = if leader == "a" { "b" } else { "a" };
        assert_eq!(admitted(leader.as_str()), 100);
        assert_eq!(admitted(follower), 0);
        let total = results
            .iter()
            .map(|(_, stats)| stats.admitted + stats.dropped)
            .sum::<u64>();
        assert_eq!(total, 200);
    }
}
