//! Adaptive health metrics.
//!
//! Every connection outcome for a server is appended as a sample, and the
//! server's success rate, average latency and learned timeout are recomputed
//! over its newest samples and written back in the same store transaction.
//! The derivation itself is a pure function of the sample window.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::blocking;
use crate::config::MetricsConfig;
use vmrelay_common::{
    ConnectionMetricSample, Database, Error, HealthStats, HourlyBucket, Result, SampleOutcome, ServerId,
    MAX_LEARNED_TIMEOUT_MS, MIN_LEARNED_TIMEOUT_MS,
};

const HOUR_SECS: i64 = 60 * 60;
const DAY_SECS: i64 = 24 * HOUR_SECS;

/// Index of the 95th percentile in an ascending set of `n` values
pub fn p95_index(n: usize) -> usize {
    ((0.95 * n as f64).ceil() as usize).saturating_sub(1)
}

/// Derive the learned fields from a sample window.
///
/// Latency fields need at least `min_samples` successful samples carrying a
/// response time; below that they are `None`.
pub fn compute_health(window: &[SampleOutcome], min_samples: usize) -> HealthStats {
    if window.is_empty() {
        return HealthStats::default();
    }

    let successes = window.iter().filter(|(ok, _)| *ok).count();
    let rate = successes as f64 / window.len() as f64 * 100.0;

    let mut times: Vec<i64> = window
        .iter()
        .filter_map(|(ok, ms)| if *ok { *ms } else { None })
        .collect();

    let (avg, learned) = if !times.is_empty() && times.len() >= min_samples {
        times.sort_unstable();
        let mean = times.iter().sum::<i64>() as f64 / times.len() as f64;
        let p95 = times[p95_index(times.len())];
        let learned = ((p95 as f64) * 1.5).round() as i64;
        (
            Some(mean.round() as i64),
            Some(learned.clamp(MIN_LEARNED_TIMEOUT_MS, MAX_LEARNED_TIMEOUT_MS)),
        )
    } else {
        (None, None)
    };

    HealthStats {
        success_rate_pct: Some((rate * 100.0).round() / 100.0),
        avg_response_time_ms: avg,
        learned_timeout_ms: learned,
    }
}

/// Read-side view of a server's health
#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub server_id: ServerId,
    pub success_rate_pct: Option<f64>,
    pub avg_response_time_ms: Option<i64>,
    pub learned_timeout_ms: Option<i64>,
    pub configured_timeout_ms: i64,
    pub samples_in_window: usize,
    pub hourly: Vec<HourlyBucket>,
}

/// Ingests connection samples and maintains each server's learned fields
#[derive(Clone)]
pub struct HealthMetricsEngine {
    db: Database,
    cfg: MetricsConfig,
}

impl HealthMetricsEngine {
    pub fn new(db: Database, cfg: MetricsConfig) -> Self {
        Self { db, cfg }
    }

    /// Append a sample and recompute its server's learned fields atomically
    pub async fn ingest(&self, sample: ConnectionMetricSample) -> Result<HealthStats> {
        let (window, min_samples) = (self.cfg.window, self.cfg.min_samples);
        let server_id = sample.server_id;
        let stats = blocking(&self.db, move |db| {
            db.ingest_sample(&sample, window, |w| compute_health(w, min_samples))
        })
        .await?;

        debug!(
            server_id,
            success_rate_pct = ?stats.success_rate_pct,
            learned_timeout_ms = ?stats.learned_timeout_ms,
            "server health recomputed"
        );
        Ok(stats)
    }

    /// Ingest off the caller's path; failures are logged only
    pub fn spawn_ingest(&self, sample: ConnectionMetricSample) {
        let engine = self.clone();
        tokio::spawn(async move {
            let server_id = sample.server_id;
            if let Err(e) = engine.ingest(sample).await {
                warn!(server_id, "failed to record connection sample: {}", e);
            }
        });
    }

    /// Recompute from the stored window without adding a sample
    pub async fn recompute(&self, server_id: ServerId) -> Result<HealthStats> {
        let (window, min_samples) = (self.cfg.window, self.cfg.min_samples);
        blocking(&self.db, move |db| {
            let stats = compute_health(&db.recent_outcomes(server_id, window)?, min_samples);
            db.write_health(server_id, &stats)?;
            Ok(stats)
        })
        .await
    }

    /// Stored learned fields plus the last 24h bucketed by UTC hour
    pub async fn summary(&self, server_id: ServerId) -> Result<HealthSummary> {
        let window = self.cfg.window;
        let since = chrono::Utc::now().timestamp() - DAY_SECS;
        blocking(&self.db, move |db| {
            let server = db
                .get_server(server_id)?
                .ok_or_else(|| Error::not_found("server", server_id))?;
            Ok(HealthSummary {
                server_id,
                success_rate_pct: server.success_rate_pct,
                avg_response_time_ms: server.avg_response_time_ms,
                learned_timeout_ms: server.learned_timeout_ms,
                configured_timeout_ms: server.configured_timeout_ms,
                samples_in_window: db.recent_outcomes(server_id, window)?.len(),
                hourly: db.hourly_buckets(server_id, since)?,
            })
        })
        .await
    }

    /// Delete samples older than the retention window. Safe to repeat.
    pub async fn purge_expired(&self) -> Result<usize> {
        let cutoff = chrono::Utc::now().timestamp() - self.cfg.retention_days * DAY_SECS;
        let deleted = blocking(&self.db, move |db| db.purge_samples_before(cutoff)).await?;
        if deleted > 0 {
            info!(deleted, "purged expired connection samples");
        }
        Ok(deleted)
    }
}
