//! SQLite store for vmrelay
//!
//! Holds the tables the broker shares with its collaborators: the server
//! registry, users and VM permission assignments (read-only to the broker),
//! connection sessions, connection metric samples and the audit log.

use crate::types::*;
use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome columns of one sample, newest first when read as a window
pub type SampleOutcome = (bool, Option<i64>);

/// Database wrapper for the broker's shared state
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- Server registry (owned by the registry collaborator)
            CREATE TABLE IF NOT EXISTS servers (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                host TEXT NOT NULL,
                port INTEGER NOT NULL DEFAULT 8006,
                token_id TEXT NOT NULL DEFAULT '',
                encrypted_secret TEXT,
                routing_mode TEXT NOT NULL DEFAULT 'direct',
                overlay_host TEXT,
                overlay_port INTEGER,
                configured_timeout_ms INTEGER NOT NULL DEFAULT 30000,
                learned_timeout_ms INTEGER,
                avg_response_time_ms INTEGER,
                success_rate_pct REAL,
                tenant_id TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                updated_at INTEGER NOT NULL
            );

            -- Users (owned by the tenant/user collaborator)
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                tenant_id TEXT,
                role TEXT NOT NULL DEFAULT 'member'
            );

            -- Per-VM permission assignments
            CREATE TABLE IF NOT EXISTS vm_permissions (
                user_id TEXT NOT NULL,
                vm_id INTEGER NOT NULL,
                node_name TEXT NOT NULL,
                permissions TEXT NOT NULL DEFAULT '[]',
                PRIMARY KEY (user_id, vm_id, node_name)
            );

            -- Relayed console connections
            CREATE TABLE IF NOT EXISTS connection_sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                vm_id INTEGER NOT NULL,
                node_name TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                ended_at INTEGER,
                status TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_status ON connection_sessions(status);

            -- Connection outcome samples (append-only, pruned by retention)
            CREATE TABLE IF NOT EXISTS connection_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                server_id INTEGER NOT NULL,
                success INTEGER NOT NULL,
                response_time_ms INTEGER,
                error_message TEXT,
                used_overlay INTEGER NOT NULL DEFAULT 0,
                timeout_used_ms INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_metrics_server_time ON connection_metrics(server_id, created_at);

            -- Audit trail of privileged actions
            CREATE TABLE IF NOT EXISTS audit_log (
                id TEXT PRIMARY KEY,
                actor_id TEXT NOT NULL,
                action_type TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                details_json TEXT,
                timestamp INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // ========================================================================
    // Server registry
    // ========================================================================

    /// Insert or replace a server record
    pub fn upsert_server(&self, server: &ServerCredential) -> Result<()> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now().timestamp();

        conn.execute(
            "INSERT OR REPLACE INTO servers (id, name, host, port, token_id, encrypted_secret,
                routing_mode, overlay_host, overlay_port, configured_timeout_ms, learned_timeout_ms,
                avg_response_time_ms, success_rate_pct, tenant_id, is_active, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                server.id,
                server.name,
                server.host,
                server.port,
                server.token_id,
                server.encrypted_secret,
                server.routing_mode.as_str(),
                server.overlay_host,
                server.overlay_port,
                server.configured_timeout_ms,
                server.learned_timeout_ms,
                server.avg_response_time_ms,
                server.success_rate_pct,
                server.tenant_id,
                server.is_active,
                now,
            ],
        )?;

        debug!("Upserted server {}", server.id);
        Ok(())
    }

    /// Get a server by ID
    pub fn get_server(&self, id: ServerId) -> Result<Option<ServerCredential>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {SERVER_COLUMNS} FROM servers WHERE id = ?1"),
                params![id],
                RawServer::from_row,
            )
            .optional()?;
        raw.map(RawServer::parse).transpose()
    }

    /// All servers with the active flag set
    pub fn list_active_servers(&self) -> Result<Vec<ServerCredential>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SERVER_COLUMNS} FROM servers WHERE is_active = 1 ORDER BY id"
        ))?;
        let rows = stmt.query_map([], RawServer::from_row)?;

        let mut servers = Vec::new();
        for row in rows {
            servers.push(row?.parse()?);
        }
        Ok(servers)
    }

    /// Replace the three learned fields in a single statement
    pub fn write_health(&self, server_id: ServerId, stats: &HealthStats) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = update_health(&conn, server_id, stats)?;
        Ok(changed > 0)
    }

    // ========================================================================
    // Users and permissions
    // ========================================================================

    /// Insert or replace a user
    pub fn upsert_user(&self, user: &User) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO users (id, tenant_id, role) VALUES (?1, ?2, ?3)",
            params![user.id, user.tenant_id, user.role.as_str()],
        )?;
        Ok(())
    }

    /// Get a user by ID
    pub fn get_user(&self, id: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        let user = conn
            .query_row(
                "SELECT id, tenant_id, role FROM users WHERE id = ?1",
                params![id],
                |row| {
                    let role: String = row.get(2)?;
                    Ok(User {
                        id: row.get(0)?,
                        tenant_id: row.get(1)?,
                        role: GlobalRole::parse(&role),
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    /// Replace a user's capability set on one VM
    pub fn set_vm_permissions(
        &self,
        user_id: &str,
        vm_id: u32,
        node_name: &str,
        capabilities: &[Capability],
    ) -> Result<()> {
        let names: Vec<&str> = capabilities.iter().map(|c| c.as_str()).collect();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO vm_permissions (user_id, vm_id, node_name, permissions)
             VALUES (?1, ?2, ?3, ?4)",
            params![user_id, vm_id, node_name, serde_json::to_string(&names)?],
        )?;
        Ok(())
    }

    /// Look up a user's assignment for one VM
    pub fn get_vm_permissions(
        &self,
        user_id: &str,
        vm_id: u32,
        node_name: &str,
    ) -> Result<Option<VmPermissionAssignment>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT permissions FROM vm_permissions
                 WHERE user_id = ?1 AND vm_id = ?2 AND node_name = ?3",
                params![user_id, vm_id, node_name],
                |row| row.get(0),
            )
            .optional()?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        let names: Vec<String> = serde_json::from_str(&raw)?;
        let mut capabilities = BTreeSet::new();
        for name in names {
            match name.parse::<Capability>() {
                Ok(cap) => {
                    capabilities.insert(cap);
                }
                Err(_) => warn!(user_id, vm_id, node_name, "ignoring unknown capability {:?}", name),
            }
        }

        Ok(Some(VmPermissionAssignment {
            user_id: user_id.to_string(),
            vm_id,
            node_name: node_name.to_string(),
            capabilities,
        }))
    }

    // ========================================================================
    // Connection sessions
    // ========================================================================

    /// Record a session entering Relaying
    pub fn open_session(&self, user_id: &str, vm_id: u32, node_name: &str) -> Result<ConnectionSession> {
        let session = ConnectionSession {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            vm_id,
            node_name: node_name.to_string(),
            started_at: chrono::Utc::now().timestamp(),
            ended_at: None,
            status: SessionStatus::Active,
        };

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO connection_sessions (id, user_id, vm_id, node_name, started_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session.id,
                session.user_id,
                session.vm_id,
                session.node_name,
                session.started_at,
                session.status.as_str(),
            ],
        )?;
        Ok(session)
    }

    /// Flip an active session to ended. Returns false if it was already ended.
    pub fn end_session(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE connection_sessions SET status = 'ended', ended_at = ?1
             WHERE id = ?2 AND status = 'active'",
            params![chrono::Utc::now().timestamp(), id],
        )?;
        Ok(changed == 1)
    }

    /// Get a session by ID
    pub fn get_session(&self, id: &str) -> Result<Option<ConnectionSession>> {
        let conn = self.conn.lock();
        let session = conn
            .query_row(
                "SELECT id, user_id, vm_id, node_name, started_at, ended_at, status
                 FROM connection_sessions WHERE id = ?1",
                params![id],
                |row| {
                    let status: String = row.get(6)?;
                    Ok(ConnectionSession {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        vm_id: row.get(2)?,
                        node_name: row.get(3)?,
                        started_at: row.get(4)?,
                        ended_at: row.get(5)?,
                        status: if status == "ended" {
                            SessionStatus::Ended
                        } else {
                            SessionStatus::Active
                        },
                    })
                },
            )
            .optional()?;
        Ok(session)
    }

    /// Sessions for a user, newest first
    pub fn list_sessions_for_user(&self, user_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id FROM connection_sessions WHERE user_id = ?1 ORDER BY started_at DESC, rowid DESC",
        )?;
        let ids = stmt
            .query_map(params![user_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    // ========================================================================
    // Connection metrics
    // ========================================================================

    /// Append a sample, recompute the server's learned fields over the newest
    /// `window` samples and write them back, all in one transaction.
    pub fn ingest_sample<F>(
        &self,
        sample: &ConnectionMetricSample,
        window: usize,
        compute: F,
    ) -> Result<HealthStats>
    where
        F: FnOnce(&[SampleOutcome]) -> HealthStats,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO connection_metrics (server_id, success, response_time_ms, error_message,
                used_overlay, timeout_used_ms, retry_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                sample.server_id,
                sample.success,
                sample.response_time_ms,
                sample.error_message,
                sample.used_overlay,
                sample.timeout_used_ms,
                sample.retry_count,
                sample.created_at,
            ],
        )?;

        let outcomes = select_window(&tx, sample.server_id, window)?;
        let stats = compute(&outcomes);
        update_health(&tx, sample.server_id, &stats)?;
        tx.commit()?;

        debug!(server_id = sample.server_id, success = sample.success, "Ingested connection sample");
        Ok(stats)
    }

    /// Newest `window` sample outcomes for a server
    pub fn recent_outcomes(&self, server_id: ServerId, window: usize) -> Result<Vec<SampleOutcome>> {
        let conn = self.conn.lock();
        select_window(&conn, server_id, window)
    }

    /// Per-UTC-hour aggregate of a server's samples since `since` (epoch seconds)
    pub fn hourly_buckets(&self, server_id: ServerId, since: i64) -> Result<Vec<HourlyBucket>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT strftime('%Y-%m-%dT%H:00:00Z', created_at, 'unixepoch') AS hour,
                    COUNT(*),
                    SUM(success),
                    AVG(CASE WHEN success = 1 THEN response_time_ms END)
             FROM connection_metrics
             WHERE server_id = ?1 AND created_at >= ?2
             GROUP BY hour
             ORDER BY hour",
        )?;
        let buckets = stmt
            .query_map(params![server_id, since], |row| {
                Ok(HourlyBucket {
                    hour: row.get(0)?,
                    total: row.get(1)?,
                    successes: row.get(2)?,
                    avg_response_time_ms: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(buckets)
    }

    /// Delete samples created before `cutoff` (epoch seconds)
    pub fn purge_samples_before(&self, cutoff: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM connection_metrics WHERE created_at < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }

    // ========================================================================
    // Audit log
    // ========================================================================

    /// Append an audit record
    pub fn insert_audit(&self, record: &AuditRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO audit_log (id, actor_id, action_type, resource_type, resource_id, details_json, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                Uuid::new_v4().to_string(),
                record.actor_id,
                record.action_type,
                record.resource_type,
                record.resource_id,
                serde_json::to_string(&record.details)?,
                record.timestamp,
            ],
        )?;
        Ok(())
    }

    /// Number of audit records with the given action type
    pub fn count_audit(&self, action_type: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM audit_log WHERE action_type = ?1",
            params![action_type],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

const SERVER_COLUMNS: &str = "id, name, host, port, token_id, encrypted_secret, routing_mode, \
    overlay_host, overlay_port, configured_timeout_ms, learned_timeout_ms, avg_response_time_ms, \
    success_rate_pct, tenant_id, is_active";

fn select_window(conn: &Connection, server_id: ServerId, window: usize) -> Result<Vec<SampleOutcome>> {
    let mut stmt = conn.prepare(
        "SELECT success, response_time_ms FROM connection_metrics
         WHERE server_id = ?1
         ORDER BY created_at DESC, id DESC
         LIMIT ?2",
    )?;
    let outcomes = stmt
        .query_map(params![server_id, window as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<SampleOutcome>>>()?;
    Ok(outcomes)
}

fn update_health(conn: &Connection, server_id: ServerId, stats: &HealthStats) -> Result<usize> {
    let changed = conn.execute(
        "UPDATE servers SET learned_timeout_ms = ?1, avg_response_time_ms = ?2,
            success_rate_pct = ?3, updated_at = ?4
         WHERE id = ?5",
        params![
            stats.learned_timeout_ms,
            stats.avg_response_time_ms,
            stats.success_rate_pct,
            chrono::Utc::now().timestamp(),
            server_id,
        ],
    )?;
    Ok(changed)
}

/// Raw server row before enum/port conversion
struct RawServer {
    id: i64,
    name: String,
    host: String,
    port: i64,
    token_id: String,
    encrypted_secret: Option<String>,
    routing_mode: String,
    overlay_host: Option<String>,
    overlay_port: Option<i64>,
    configured_timeout_ms: i64,
    learned_timeout_ms: Option<i64>,
    avg_response_time_ms: Option<i64>,
    success_rate_pct: Option<f64>,
    tenant_id: Option<String>,
    is_active: bool,
}

impl RawServer {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            host: row.get(2)?,
            port: row.get(3)?,
            token_id: row.get(4)?,
            encrypted_secret: row.get(5)?,
            routing_mode: row.get(6)?,
            overlay_host: row.get(7)?,
            overlay_port: row.get(8)?,
            configured_timeout_ms: row.get(9)?,
            learned_timeout_ms: row.get(10)?,
            avg_response_time_ms: row.get(11)?,
            success_rate_pct: row.get(12)?,
            tenant_id: row.get(13)?,
            is_active: row.get(14)?,
        })
    }

    fn parse(self) -> Result<ServerCredential> {
        let port = u16::try_from(self.port)
            .map_err(|_| Error::Configuration(format!("server {} has invalid port {}", self.id, self.port)))?;
        let overlay_port = self
            .overlay_port
            .map(|p| {
                u16::try_from(p).map_err(|_| {
                    Error::Configuration(format!("server {} has invalid overlay port {}", self.id, p))
                })
            })
            .transpose()?;

        Ok(ServerCredential {
            id: self.id,
            name: self.name,
            host: self.host,
            port,
            token_id: self.token_id,
            encrypted_secret: self.encrypted_secret,
            routing_mode: self.routing_mode.parse()?,
            overlay_host: self.overlay_host,
            overlay_port,
            configured_timeout_ms: self.configured_timeout_ms,
            learned_timeout_ms: self.learned_timeout_ms,
            avg_response_time_ms: self.avg_response_time_ms,
            success_rate_pct: self.success_rate_pct,
            tenant_id: self.tenant_id,
            is_active: self.is_active,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(server_id: ServerId, success: bool, ms: Option<i64>, created_at: i64) -> ConnectionMetricSample {
        ConnectionMetricSample {
            server_id,
            success,
            response_time_ms: ms,
            error_message: None,
            used_overlay: false,
            timeout_used_ms: 30_000,
            retry_count: 0,
            created_at,
        }
    }

    #[test]
    fn test_server_roundtrip() {
        let db = Database::open_memory().unwrap();
        let mut server = ServerCredential::new(1, "pve1", "10.0.0.5", 8006);
        server.routing_mode = RoutingMode::Overlay;
        server.overlay_host = Some("pve1.mesh".to_string());
        server.tenant_id = Some("acme".to_string());
        db.upsert_server(&server).unwrap();

        let loaded = db.get_server(1).unwrap().unwrap();
        assert_eq!(loaded.host, "10.0.0.5");
        assert_eq!(loaded.port, 8006);
        assert_eq!(loaded.routing_mode, RoutingMode::Overlay);
        assert_eq!(loaded.overlay_host.as_deref(), Some("pve1.mesh"));
        assert!(loaded.is_active);
        assert!(db.get_server(2).unwrap().is_none());
    }

    #[test]
    fn test_unknown_capabilities_ignored() {
        let db = Database::open_memory().unwrap();
        {
            let conn = db.conn.lock();
            conn.execute(
                "INSERT INTO vm_permissions (user_id, vm_id, node_name, permissions)
                 VALUES ('u1', 100, 'pve1', '[\"view\",\"migrate\",\"console\"]')",
                [],
            )
            .unwrap();
        }
        let assignment = db.get_vm_permissions("u1", 100, "pve1").unwrap().unwrap();
        assert!(assignment.allows(Capability::View));
        assert!(assignment.allows(Capability::Console));
        assert_eq!(assignment.capabilities.len(), 2);
        assert!(db.get_vm_permissions("u1", 101, "pve1").unwrap().is_none());
    }

    #[test]
    fn test_session_ends_once() {
        let db = Database::open_memory().unwrap();
        let session = db.open_session("u1", 100, "pve1").unwrap();
        assert!(db.end_session(&session.id).unwrap());
        assert!(!db.end_session(&session.id).unwrap());

        let loaded = db.get_session(&session.id).unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Ended);
        assert!(loaded.ended_at.is_some());
    }

    #[test]
    fn test_ingest_writes_back_and_windows() {
        let db = Database::open_memory().unwrap();
        db.upsert_server(&ServerCredential::new(1, "pve1", "10.0.0.5", 8006)).unwrap();

        for i in 0..5 {
            db.ingest_sample(&sample(1, true, Some(100 + i), 1_000 + i), 3, |w| {
                assert!(w.len() <= 3);
                HealthStats {
                    success_rate_pct: Some(100.0),
                    avg_response_time_ms: Some(w.len() as i64),
                    learned_timeout_ms: None,
                }
            })
            .unwrap();
        }

        let window = db.recent_outcomes(1, 3).unwrap();
        assert_eq!(window, vec![(true, Some(104)), (true, Some(103)), (true, Some(102))]);

        let server = db.get_server(1).unwrap().unwrap();
        assert_eq!(server.avg_response_time_ms, Some(3));
        assert_eq!(server.success_rate_pct, Some(100.0));
    }

    #[test]
    fn test_hourly_buckets_and_purge() {
        let db = Database::open_memory().unwrap();
        let hour = 1_790_000_000 - (1_790_000_000 % 3600);
        let noop = |_: &[SampleOutcome]| HealthStats::default();

        db.ingest_sample(&sample(1, true, Some(100), hour + 10), 100, noop).unwrap();
        db.ingest_sample(&sample(1, true, Some(300), hour + 20), 100, noop).unwrap();
        db.ingest_sample(&sample(1, false, None, hour + 30), 100, noop).unwrap();
        db.ingest_sample(&sample(1, true, Some(50), hour + 3600), 100, noop).unwrap();

        let buckets = db.hourly_buckets(1, hour).unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].total, 3);
        assert_eq!(buckets[0].successes, 2);
        assert_eq!(buckets[0].avg_response_time_ms, Some(200.0));
        assert!(buckets[0].hour.ends_with(":00:00Z"));
        assert_eq!(buckets[1].total, 1);

        assert_eq!(db.purge_samples_before(hour + 3600).unwrap(), 3);
        assert_eq!(db.purge_samples_before(hour + 3600).unwrap(), 0);
        assert_eq!(db.recent_outcomes(1, 100).unwrap().len(), 1);
    }

    #[test]
    fn test_open_file_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("vmrelay.db");
        let db = Database::open(&path).unwrap();
        db.upsert_user(&User {
            id: "u1".to_string(),
            tenant_id: None,
            role: GlobalRole::Admin,
        })
        .unwrap();
        assert!(db.get_user("u1").unwrap().unwrap().is_admin());
    }
}
