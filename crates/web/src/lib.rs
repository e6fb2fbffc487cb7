//! vmrelay console broker
//!
//! Authenticates console requests, checks per-VM permissions, resolves the
//! hypervisor endpoint, mints a console ticket and relays the console stream
//! between the browser and the hypervisor, while learning per-server
//! timeouts from observed connection outcomes.

pub mod audit;
pub mod auth;
pub mod config;
pub mod health;
pub mod permissions;
pub mod probe;
pub mod relay;
pub mod resolver;
pub mod server;
pub mod session;
pub mod ticket;
pub mod upstream;

pub use audit::{AuditSink, DbAuditSink};
pub use auth::{AuthenticatedUser, TokenVerifier};
pub use config::BrokerConfig;
pub use health::{compute_health, HealthMetricsEngine, HealthSummary};
pub use permissions::PermissionGate;
pub use resolver::{CredentialResolver, ResolvedCredential};
pub use server::{AppState, BrokerServer};
pub use session::{RelaySession, RelayState};
pub use ticket::{ConsoleTarget, ConsoleTicket, TicketIssuer};

use vmrelay_common::{Database, Error, Result};

/// Run a store operation on the blocking pool
pub(crate) async fn blocking<T, F>(db: &Database, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> Result<T> + Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| Error::Internal(format!("store task failed: {e}")))?
}
