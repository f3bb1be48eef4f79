//! Execution metrics: counters, latency distribution, per-minute snapshot
//! ring, and threshold alerts.
//!
//! Counters are lock-free atomics; the latency window, per-script table,
//! snapshot ring, and alert state sit behind short-lived mutexes that are
//! only held for push/drain operations.

use chrono::Utc;
use pylon_protocol::http_types::{
    Alert, AlertSeverity, LatencyStats, MetricSnapshot, MetricsResponse, ScriptUsage,
};
use pylon_protocol::ErrorKind;
use pylon_pool::PoolStats;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

/// Bounded sample window for percentile estimation.
const LATENCY_WINDOW: usize = 1024;
/// Snapshot ring capacity (about 100 minutes at one-minute cadence).
const SNAPSHOT_RING: usize = 100;
/// Per-script table cap; least-recently-used entries are evicted.
const PER_SCRIPT_CAP: usize = 50;
/// Dedup window for identical (rule, severity) alerts.
const ALERT_DEDUP_WINDOW: Duration = Duration::from_secs(60);
/// Alerts stay listed as active for this long after being raised.
const ALERT_ACTIVE_WINDOW: Duration = Duration::from_secs(300);

const UTILISATION_WARNING: f64 = 0.70;
const UTILISATION_CRITICAL: f64 = 0.90;
const FAILURE_RATE_WARNING: f64 = 0.20;

struct Sample {
    at: Instant,
    duration_ms: u64,
    success: bool,
}

struct ScriptCounters {
    executions: u64,
    failures: u64,
    last_used: chrono::DateTime<Utc>,
}

#[derive(Default)]
struct AlertState {
    raised: Vec<(Instant, Alert)>,
    last_by_rule: HashMap<(String, AlertSeverity), Instant>,
}

pub struct MetricsEngine {
    total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    lat_min_ms: AtomicU64,
    lat_max_ms: AtomicU64,
    lat_sum_ms: AtomicU64,
    failures_by_kind: Mutex<BTreeMap<String, u64>>,
    window: Mutex<VecDeque<Sample>>,
    per_script: Mutex<HashMap<String, ScriptCounters>>,
    snapshots: Mutex<VecDeque<MetricSnapshot>>,
    alerts: Mutex<AlertState>,
}

impl Default for MetricsEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsEngine {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            lat_min_ms: AtomicU64::new(u64::MAX),
            lat_max_ms: AtomicU64::new(0),
            lat_sum_ms: AtomicU64::new(0),
            failures_by_kind: Mutex::new(BTreeMap::new()),
            window: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
            per_script: Mutex::new(HashMap::new()),
            snapshots: Mutex::new(VecDeque::with_capacity(SNAPSHOT_RING)),
            alerts: Mutex::new(AlertState::default()),
        }
    }

    /// Record one completed execution.
    pub fn record(
        &self,
        script_name: Option<&str>,
        duration: Duration,
        error_kind: Option<ErrorKind>,
    ) {
        let duration_ms = duration.as_millis() as u64;
        self.total.fetch_add(1, Ordering::Relaxed);
        match error_kind {
            None => {
                self.successes.fetch_add(1, Ordering::Relaxed);
            }
            Some(kind) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                let mut by_kind = lock(&self.failures_by_kind);
                *by_kind.entry(kind.as_str().to_string()).or_insert(0) += 1;
            }
        }

        self.lat_min_ms.fetch_min(duration_ms, Ordering::Relaxed);
        self.lat_max_ms.fetch_max(duration_ms, Ordering::Relaxed);
        self.lat_sum_ms.fetch_add(duration_ms, Ordering::Relaxed);

        {
            let mut window = lock(&self.window);
            if window.len() == LATENCY_WINDOW {
                window.pop_front();
            }
            window.push_back(Sample {
                at: Instant::now(),
                duration_ms,
                success: error_kind.is_none(),
            });
        }

        if let Some(name) = script_name {
            let mut per_script = lock(&self.per_script);
            let entry = per_script.entry(name.to_string()).or_insert(ScriptCounters {
                executions: 0,
                failures: 0,
                last_used: Utc::now(),
            });
            entry.executions += 1;
            if error_kind.is_some() {
                entry.failures += 1;
            }
            entry.last_used = Utc::now();

            if per_script.len() > PER_SCRIPT_CAP {
                if let Some(evict) = per_script
                    .iter()
                    .min_by_key(|(_, c)| c.last_used)
                    .map(|(name, _)| name.clone())
                {
                    per_script.remove(&evict);
                }
            }
        }
    }

    /// Aggregate view for `/metrics`.
    pub fn aggregate(&self) -> MetricsResponse {
        let per_script = {
            let table = lock(&self.per_script);
            let mut rows: Vec<ScriptUsage> = table
                .iter()
                .map(|(name, counters)| ScriptUsage {
                    script_name: name.clone(),
                    executions: counters.executions,
                    failures: counters.failures,
                    last_used_at: counters.last_used,
                })
                .collect();
            rows.sort_by(|a, b| b.last_used_at.cmp(&a.last_used_at));
            rows
        };

        MetricsResponse {
            total_executions: self.total.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            failures_by_kind: lock(&self.failures_by_kind).clone(),
            latency: self.latency_stats(),
            per_script,
        }
    }

    pub fn latency_stats(&self) -> LatencyStats {
        let total = self.total.load(Ordering::Relaxed);
        let min = self.lat_min_ms.load(Ordering::Relaxed);
        let (p50, p95, p99) = self.percentiles();
        LatencyStats {
            min_ms: if min == u64::MAX { 0 } else { min },
            max_ms: self.lat_max_ms.load(Ordering::Relaxed),
            avg_ms: if total == 0 {
                0.0
            } else {
                self.lat_sum_ms.load(Ordering::Relaxed) as f64 / total as f64
            },
            p50_ms: p50,
            p95_ms: p95,
            p99_ms: p99,
        }
    }

    /// Approximate percentiles over the bounded sample window.
    fn percentiles(&self) -> (u64, u64, u64) {
        let window = lock(&self.window);
        if window.is_empty() {
            return (0, 0, 0);
        }
        let mut durations: Vec<u64> = window.iter().map(|s| s.duration_ms).collect();
        durations.sort_unstable();
        let pick = |q: f64| {
            let idx = ((durations.len() as f64 - 1.0) * q).round() as usize;
            durations[idx]
        };
        (pick(0.50), pick(0.95), pick(0.99))
    }

    /// Success rate over samples from the last minute; 1.0 when idle.
    pub fn success_rate_1m(&self) -> f64 {
        let window = lock(&self.window);
        let cutoff = Instant::now() - Duration::from_secs(60);
        let recent: Vec<&Sample> = window.iter().filter(|s| s.at >= cutoff).collect();
        if recent.is_empty() {
            return 1.0;
        }
        let successes = recent.iter().filter(|s| s.success).count();
        successes as f64 / recent.len() as f64
    }

    /// Take one per-minute snapshot and evaluate the alert rules against
    /// it. Returns the snapshot that entered the ring.
    pub fn take_snapshot(&self, pool: PoolStats) -> MetricSnapshot {
        let (p50, p95, p99) = self.percentiles();
        let snapshot = MetricSnapshot {
            timestamp: Utc::now(),
            in_use: pool.in_use,
            available: pool.available,
            healthy: pool.healthy,
            success_rate_1m: self.success_rate_1m(),
            p50_ms: p50,
            p95_ms: p95,
            p99_ms: p99,
        };

        {
            let mut ring = lock(&self.snapshots);
            if ring.len() == SNAPSHOT_RING {
                ring.pop_front();
            }
            ring.push_back(snapshot.clone());
        }

        self.evaluate_alerts(&pool, snapshot.success_rate_1m);
        snapshot
    }

    pub fn history(&self) -> Vec<MetricSnapshot> {
        lock(&self.snapshots).iter().cloned().collect()
    }

    /// Alerts raised within the active window, newest first.
    pub fn active_alerts(&self) -> Vec<Alert> {
        let state = lock(&self.alerts);
        let cutoff = Instant::now() - ALERT_ACTIVE_WINDOW;
        let mut alerts: Vec<Alert> = state
            .raised
            .iter()
            .filter(|(at, _)| *at >= cutoff)
            .map(|(_, alert)| alert.clone())
            .collect();
        alerts.reverse();
        alerts
    }

    fn evaluate_alerts(&self, pool: &PoolStats, success_rate: f64) {
        if pool.total > 0 {
            let utilisation = pool.in_use as f64 / pool.total as f64;
            if utilisation >= UTILISATION_CRITICAL {
                self.raise(
                    "pool_utilisation",
                    AlertSeverity::Critical,
                    format!("pool utilisation at {:.0}%", utilisation * 100.0),
                );
            } else if utilisation >= UTILISATION_WARNING {
                self.raise(
                    "pool_utilisation",
                    AlertSeverity::Warning,
                    format!("pool utilisation at {:.0}%", utilisation * 100.0),
                );
            }
        }

        let failure_rate = 1.0 - success_rate;
        if failure_rate > FAILURE_RATE_WARNING {
            self.raise(
                "failure_rate",
                AlertSeverity::Warning,
                format!("failure rate at {:.0}% over the last minute", failure_rate * 100.0),
            );
        }
    }

    fn raise(&self, rule: &str, severity: AlertSeverity, message: String) {
        let mut state = lock(&self.alerts);
        let key = (rule.to_string(), severity);
        let now = Instant::now();
        if let Some(last) = state.last_by_rule.get(&key) {
            if now.duration_since(*last) < ALERT_DEDUP_WINDOW {
                return;
            }
        }
        warn!("alert [{:?}] {}: {}", severity, rule, message);
        state.last_by_rule.insert(key, now);
        state.raised.push((
            now,
            Alert {
                rule: rule.to_string(),
                severity,
                message,
                raised_at: Utc::now(),
            },
        ));
        // Bound alert history.
        let overflow = state.raised.len().saturating_sub(SNAPSHOT_RING);
        if overflow > 0 {
            state.raised.drain(..overflow);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_pool(total: usize, in_use: usize) -> PoolStats {
        PoolStats {
            total,
            available: total - in_use,
            in_use,
            healthy: total,
            replacing: 0,
            waiters: 0,
        }
    }

    #[test]
    fn test_counters_and_kinds() {
        let metrics = MetricsEngine::new();
        metrics.record(None, Duration::from_millis(10), None);
        metrics.record(None, Duration::from_millis(20), Some(ErrorKind::Timeout));
        metrics.record(Some("report"), Duration::from_millis(30), Some(ErrorKind::Timeout));

        let aggregate = metrics.aggregate();
        assert_eq!(aggregate.total_executions, 3);
        assert_eq!(aggregate.successes, 1);
        assert_eq!(aggregate.failures, 2);
        assert_eq!(aggregate.failures_by_kind.get("timeout"), Some(&2));
        assert_eq!(aggregate.per_script.len(), 1);
        assert_eq!(aggregate.per_script[0].script_name, "report");
        assert_eq!(aggregate.per_script[0].failures, 1);
    }

    #[test]
    fn test_latency_stats() {
        let metrics = MetricsEngine::new();
        for ms in [10u64, 20, 30, 40, 100] {
            metrics.record(None, Duration::from_millis(ms), None);
        }
        let stats = metrics.latency_stats();
        assert_eq!(stats.min_ms, 10);
        assert_eq!(stats.max_ms, 100);
        assert_eq!(stats.avg_ms, 40.0);
        assert_eq!(stats.p50_ms, 30);
        assert!(stats.p95_ms >= 40);
    }

    #[test]
    fn test_snapshot_ring_bounded_at_100() {
        let metrics = MetricsEngine::new();
        for _ in 0..120 {
            metrics.take_snapshot(idle_pool(3, 0));
        }
        assert_eq!(metrics.history().len(), 100);
    }

    #[test]
    fn test_per_script_cap() {
        let metrics = MetricsEngine::new();
        for i in 0..60 {
            metrics.record(Some(&format!("script{i}")), Duration::from_millis(1), None);
        }
        let aggregate = metrics.aggregate();
        assert!(aggregate.per_script.len() <= PER_SCRIPT_CAP);
    }

    #[test]
    fn test_utilisation_alerts() {
        let metrics = MetricsEngine::new();
        metrics.take_snapshot(idle_pool(10, 9));
        let alerts = metrics.active_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);
        assert_eq!(alerts[0].rule, "pool_utilisation");
    }

    #[test]
    fn test_alert_dedup_within_window() {
        let metrics = MetricsEngine::new();
        metrics.take_snapshot(idle_pool(10, 8));
        metrics.take_snapshot(idle_pool(10, 8));
        // Same (rule, severity) within the dedup window: raised once.
        assert_eq!(metrics.active_alerts().len(), 1);
    }

    #[test]
    fn test_failure_rate_alert() {
        let metrics = MetricsEngine::new();
        for _ in 0..3 {
            metrics.record(None, Duration::from_millis(5), Some(ErrorKind::RuntimeError));
        }
        metrics.record(None, Duration::from_millis(5), None);
        metrics.take_snapshot(idle_pool(3, 0));
        let alerts = metrics.active_alerts();
        assert!(alerts.iter().any(|a| a.rule == "failure_rate"));
    }

    #[test]
    fn test_idle_success_rate_is_one() {
        let metrics = MetricsEngine::new();
        assert_eq!(metrics.success_rate_1m(), 1.0);
    }
}
