//! Metrics & Alert Store
//!
//! Running counters, the confidence histogram, per-model usage and the
//! recent-alerts ring, kept in an external key-value cache. Every write is a
//! single atomic cache operation, so workers sharing one cache never lose
//! updates.

mod memory;
mod redis_cache;

pub use memory::MemoryCache;
pub use redis_cache::RedisCache;

use crate::ensemble::EnsembleResult;
use crate::error::StoreError;
use crate::publish::AlertRecord;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const TOTAL_PROCESSED_KEY: &str = "metrics:total_processed";
pub const ANOMALIES_KEY: &str = "metrics:anomalies_detected";
pub const HISTOGRAM_KEY: &str = "metrics:confidence_histogram";
pub const MODEL_USAGE_KEY: &str = "metrics:model_usage";
pub const RECENT_ALERTS_KEY: &str = "recent_alerts";

/// Confidence deciles.
pub const HISTOGRAM_BUCKETS: usize = 10;

/// The subset of key-value operations the store relies on.
pub trait Cache: Send + Sync {
    fn incr(&self, key: &str, by: i64) -> Result<i64, StoreError>;

    fn hincr(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError>;

    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Empty when the hash does not exist.
    fn hgetall(&self, key: &str) -> Result<BTreeMap<String, i64>, StoreError>;

    fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Pushes to the head and trims the list to `cap` entries in one step.
    fn push_front_capped(&self, key: &str, value: &str, cap: usize) -> Result<(), StoreError>;

    /// The first `limit` entries, head first.
    fn range(&self, key: &str, limit: usize) -> Result<Vec<String>, StoreError>;

    fn ping(&self) -> Result<(), StoreError>;
}

/// Histogram field for a confidence value. `1.0` lands in the top decile.
pub fn histogram_bucket(confidence: f64) -> usize {
    let bucket = (confidence * HISTOGRAM_BUCKETS as f64).floor();
    if bucket.is_nan() || bucket < 0.0 {
        0
    } else {
        (bucket as usize).min(HISTOGRAM_BUCKETS - 1)
    }
}

pub fn alert_key(event_id: &str) -> String {
    format!("alert:{event_id}")
}

/// Read-only view served by the metrics API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_processed: u64,
    pub anomalies_detected: u64,
    /// Always within `[0, 1]`; zero before anything is processed.
    pub anomaly_rate: f64,
    pub confidence_histogram: BTreeMap<String, u64>,
    pub model_usage: BTreeMap<String, u64>,
    pub queue_size: usize,
    pub is_running: bool,
    pub dropped_messages: u64,
}

impl Default for MetricsSnapshot {
    fn default() -> Self {
        Self::from_counts(0, 0, BTreeMap::new(), BTreeMap::new())
    }
}

impl MetricsSnapshot {
    fn from_counts(
        total_processed: u64,
        anomalies_detected: u64,
        histogram: BTreeMap<String, i64>,
        model_usage: BTreeMap<String, i64>,
    ) -> Self {
        let anomaly_rate = if total_processed == 0 {
            0.0
        } else {
            (anomalies_detected as f64 / total_processed as f64).min(1.0)
        };

        let mut confidence_histogram: BTreeMap<String, u64> =
            (0..HISTOGRAM_BUCKETS).map(|b| (b.to_string(), 0)).collect();
        for (bucket, count) in histogram {
            confidence_histogram.insert(bucket, count.max(0) as u64);
        }

        Self {
            total_processed,
            anomalies_detected,
            anomaly_rate,
            confidence_histogram,
            model_usage: model_usage
                .into_iter()
                .map(|(model, count)| (model, count.max(0) as u64))
                .collect(),
            queue_size: 0,
            is_running: false,
            dropped_messages: 0,
        }
    }
}

pub struct MetricsStore {
    cache: Arc<dyn Cache>,
    alert_ttl: Duration,
    recent_capacity: usize,
}

impl MetricsStore {
    pub fn new(cache: Arc<dyn Cache>, alert_ttl: Duration, recent_capacity: usize) -> Self {
        Self {
            cache,
            alert_ttl,
            recent_capacity: recent_capacity.max(1),
        }
    }

    pub fn ping(&self) -> Result<(), StoreError> {
        self.cache.ping()
    }

    /// Counts one evaluated event.
    pub fn record(&self, result: &EnsembleResult) -> Result<(), StoreError> {
        self.cache.incr(TOTAL_PROCESSED_KEY, 1)?;
        if result.is_anomaly {
            self.cache.incr(ANOMALIES_KEY, 1)?;
        }
        let bucket = histogram_bucket(result.confidence).to_string();
        self.cache.hincr(HISTOGRAM_KEY, &bucket, 1)?;
        self.cache.hincr(MODEL_USAGE_KEY, &result.model_used, 1)?;
        Ok(())
    }

    /// Persists the alert under `alert:{id}` with the configured expiry and
    /// pushes its key onto the recent-alerts ring.
    pub fn store_alert(&self, alert: &AlertRecord) -> Result<(), StoreError> {
        let key = alert_key(alert.id());
        let value = serde_json::to_string(alert).map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.cache.set_ex(&key, &value, self.alert_ttl)?;
        self.cache
            .push_front_capped(RECENT_ALERTS_KEY, &key, self.recent_capacity)?;
        debug!(key, "alert stored");
        Ok(())
    }

    /// Counters only; the caller fills in the queue and lifecycle fields.
    pub fn snapshot(&self) -> Result<MetricsSnapshot, StoreError> {
        let total = self.counter(TOTAL_PROCESSED_KEY)?;
        let anomalies = self.counter(ANOMALIES_KEY)?;
        let histogram = self.cache.hgetall(HISTOGRAM_KEY)?;
        let usage = self.cache.hgetall(MODEL_USAGE_KEY)?;
        Ok(MetricsSnapshot::from_counts(total, anomalies, histogram, usage))
    }

    /// Newest first. Keys whose alert already expired are skipped.
    pub fn recent_alerts(&self, limit: usize) -> Result<Vec<AlertRecord>, StoreError> {
        let keys = self.cache.range(RECENT_ALERTS_KEY, limit)?;
        let mut alerts = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(raw) = self.cache.get(&key)? else {
                continue;
            };
            let alert = serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
                key: key.clone(),
                reason: e.to_string(),
            })?;
            alerts.push(alert);
        }
        Ok(alerts)
    }

    fn counter(&self, key: &str) -> Result<u64, StoreError> {
        match self.cache.get(key)? {
            None => Ok(0),
            Some(raw) => raw
                .trim()
                .parse::<i64>()
                .map(|n| n.max(0) as u64)
                .map_err(|e| StoreError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
        }
    }
}
