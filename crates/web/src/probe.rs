//! Background health probing and metric retention.

use futures::future::join_all;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::blocking;
use crate::health::HealthMetricsEngine;
use crate::resolver::CredentialResolver;
use crate::ticket::TicketIssuer;
use vmrelay_common::{ConnectionMetricSample, Database, Result, ServerCredential};

/// Periodically probes every active server and feeds the outcome into the
/// health engine
#[derive(Clone)]
pub struct HealthProber {
    db: Database,
    resolver: CredentialResolver,
    issuer: TicketIssuer,
    engine: HealthMetricsEngine,
}

impl HealthProber {
    pub fn new(db: Database, resolver: CredentialResolver, issuer: TicketIssuer, engine: HealthMetricsEngine) -> Self {
        Self {
            db,
            resolver,
            issuer,
            engine,
        }
    }

    /// Probe all active servers once. Returns how many were probed.
    pub async fn probe_all(&self) -> Result<usize> {
        let servers = blocking(&self.db, |db| db.list_active_servers()).await?;
        let results = join_all(servers.iter().map(|s| self.probe_one(s))).await;
        Ok(results.into_iter().filter(|probed| *probed).count())
    }

    async fn probe_one(&self, server: &ServerCredential) -> bool {
        let cred = match self.resolver.credential_for(server) {
            Ok(cred) => cred,
            Err(e) => {
                debug!(server_id = server.id, "skipping health probe: {}", e);
                return false;
            }
        };

        let sample = match self.issuer.probe(&cred).await {
            Ok(elapsed) => ConnectionMetricSample::success(
                server.id,
                elapsed.as_millis() as i64,
                cred.used_overlay,
                cred.timeout_ms(),
            ),
            Err(e) => {
                warn!(server_id = server.id, host = %cred.host, "health probe failed: {}", e);
                ConnectionMetricSample::failure(server.id, &e, cred.used_overlay, cred.timeout_ms())
            }
        };

        if let Err(e) = self.engine.ingest(sample).await {
            warn!(server_id = server.id, "failed to record probe sample: {}", e);
        }
        true
    }

    /// Probe on a fixed interval. The first round runs after one interval.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.probe_all().await {
                    Ok(n) => debug!(probed = n, "health probe round finished"),
                    Err(e) => warn!("health probe round failed: {}", e),
                }
            }
        })
    }
}

/// Purge expired samples on a fixed interval, starting immediately
pub fn spawn_retention_sweeper(engine: HealthMetricsEngine, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match engine.purge_expired().await {
                Ok(0) => {}
                Ok(deleted) => info!(deleted, "retention sweep finished"),
                Err(e) => warn!("retention sweep failed: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HypervisorConfig, MetricsConfig};
    use axum::{routing::get, Json, Router};
    use vmrelay_common::SecretCipher;

    async fn fake_version_api() -> u16 {
        let app = Router::new().route(
            "/api2/json/version",
            get(|| async { Json(serde_json::json!({ "data": { "version": "8.2.4" } })) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn test_probe_all_records_samples() {
        let port = fake_version_api().await;
        let db = Database::open_memory().unwrap();
        let cipher = SecretCipher::new("key").unwrap();

        let mut up = ServerCredential::new(1, "pve1", "127.0.0.1", port);
        up.encrypted_secret = Some(cipher.encrypt("secret"));
        db.upsert_server(&up).unwrap();

        let mut no_secret = ServerCredential::new(2, "pve2", "127.0.0.1", port);
        no_secret.encrypted_secret = None;
        db.upsert_server(&no_secret).unwrap();

        let mut disabled = ServerCredential::new(3, "pve3", "127.0.0.1", port);
        disabled.is_active = false;
        db.upsert_server(&disabled).unwrap();

        let engine = HealthMetricsEngine::new(db.clone(), MetricsConfig::default());
        let prober = HealthProber::new(
            db.clone(),
            CredentialResolver::new(db.clone(), Some(cipher)),
            TicketIssuer::new(&HypervisorConfig { tls: false, verify_tls: false }).unwrap(),
            engine,
        );

        assert_eq!(prober.probe_all().await.unwrap(), 1);
        let outcomes = db.recent_outcomes(1, 100).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].0);
        assert!(db.recent_outcomes(2, 100).unwrap().is_empty());

        let server = db.get_server(1).unwrap().unwrap();
        assert_eq!(server.success_rate_pct, Some(100.0));
        assert_eq!(server.learned_timeout_ms, None);
    }
}
