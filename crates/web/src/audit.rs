//! Audit sink for privileged actions.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use crate::blocking;
use vmrelay_common::{AuditRecord, Database, Result};

/// Console opened on a VM
pub const CONSOLE_OPEN: &str = "console.open";
/// Console ticket handed out through the metadata endpoint
pub const CONSOLE_TICKET: &str = "console.ticket";
/// Metric retention purge run by an admin
pub const METRICS_PURGE: &str = "metrics.purge";

/// Destination for audit records
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> Result<()>;
}

/// Writes audit records to the `audit_log` table
pub struct DbAuditSink {
    db: Database,
}

impl DbAuditSink {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AuditSink for DbAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<()> {
        blocking(&self.db, move |db| db.insert_audit(&record)).await
    }
}

/// Hand a record to the sink without waiting. Failures are logged and never
/// reach the caller.
pub fn emit(sink: &Arc<dyn AuditSink>, record: AuditRecord) {
    let sink = sink.clone();
    tokio::spawn(async move {
        let action = record.action_type.clone();
        if let Err(e) = sink.record(record).await {
            warn!(action = %action, "failed to write audit record: {}", e);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmrelay_common::Error;

    struct BrokenSink;

    #[async_trait]
    impl AuditSink for BrokenSink {
        async fn record(&self, _record: AuditRecord) -> Result<()> {
            Err(Error::Internal("audit store offline".to_string()))
        }
    }

    #[tokio::test]
    async fn test_db_sink_writes_row() {
        let db = Database::open_memory().unwrap();
        let sink = DbAuditSink::new(db.clone());
        sink.record(
            AuditRecord::new("alice", CONSOLE_OPEN, "vm", 100)
                .with_details(serde_json::json!({ "node": "pve1", "server_id": 1 })),
        )
        .await
        .unwrap();
        assert_eq!(db.count_audit(CONSOLE_OPEN).unwrap(), 1);
        assert_eq!(db.count_audit(METRICS_PURGE).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_emit_swallows_failure() {
        let sink: Arc<dyn AuditSink> = Arc::new(BrokenSink);
        emit(&sink, AuditRecord::new("alice", CONSOLE_TICKET, "vm", 100));
        tokio::task::yield_now().await;
    }
}
