//! Console relay session state machine.
//!
//! ```text
//! Handshaking -> Authorizing -> Ticketing -> Connecting -> Relaying -> Closing -> Closed
//!      \______________\______________\____________\
//!                                                  -> Failed
//! ```
//!
//! Everything up to Connecting runs before the client's WebSocket upgrade is
//! accepted, so each failure there can still be answered with an HTTP status.

use futures::{Sink, Stream};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit;
use crate::blocking;
use crate::relay::{self, Frame, RelayOptions, RelayOutcome};
use crate::server::AppState;
use crate::ticket::ConsoleTarget;
use crate::upstream::UpstreamSocket;
use vmrelay_common::{
    AuditRecord, Capability, ConnectionMetricSample, ConnectionSession, Error, Result, ServerId,
};

/// Relay session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Handshaking,
    Authorizing,
    Ticketing,
    Connecting,
    Relaying,
    Closing,
    Closed,
    Failed,
}

impl RelayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayState::Handshaking => "handshaking",
            RelayState::Authorizing => "authorizing",
            RelayState::Ticketing => "ticketing",
            RelayState::Connecting => "connecting",
            RelayState::Relaying => "relaying",
            RelayState::Closing => "closing",
            RelayState::Closed => "closed",
            RelayState::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, next: RelayState) -> bool {
        use RelayState::*;
        matches!(
            (self, next),
            (Handshaking, Authorizing)
                | (Authorizing, Ticketing)
                | (Ticketing, Connecting)
                | (Connecting, Relaying)
                | (Relaying, Closing)
                | (Closing, Closed)
                | (Handshaking | Authorizing | Ticketing | Connecting, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RelayState::Closed | RelayState::Failed)
    }
}

impl std::fmt::Display for RelayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated parameters of a console request
#[derive(Debug, Clone)]
pub struct ConsoleRequest {
    pub target: ConsoleTarget,
    pub server_id: ServerId,
}

/// One client console connection
pub struct RelaySession {
    id: Uuid,
    request: ConsoleRequest,
    state: RelayState,
    user_id: Option<String>,
    record: Option<ConnectionSession>,
}

impl RelaySession {
    pub fn new(request: ConsoleRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            state: RelayState::Handshaking,
            user_id: None,
            record: None,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Id of the stored connection session, once Relaying
    pub fn record_id(&self) -> Option<&str> {
        self.record.as_ref().map(|r| r.id.as_str())
    }

    fn transition(&mut self, next: RelayState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        debug!(session = %self.id, from = %self.state, to = %next, "relay state change");
        self.state = next;
        Ok(())
    }

    fn fail(&mut self, err: Error) -> Error {
        if err.is_terminal() {
            warn!(session = %self.id, state = %self.state, "console request rejected: {}", err);
        } else {
            error!(
                session = %self.id,
                state = %self.state,
                node = %self.request.target.node,
                vmid = self.request.target.vmid,
                server_id = self.request.server_id,
                "console request failed: {}",
                err
            );
        }
        if self.state.can_transition_to(RelayState::Failed) {
            self.state = RelayState::Failed;
        }
        err
    }

    /// Authenticate, authorize, mint a ticket and open the upstream socket.
    /// On error the session is Failed and the error carries the HTTP status
    /// to answer the upgrade request with.
    pub async fn establish(&mut self, state: &AppState, token: Option<&str>) -> Result<UpstreamSocket> {
        match self.try_establish(state, token).await {
            Ok(socket) => Ok(socket),
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn try_establish(&mut self, state: &AppState, token: Option<&str>) -> Result<UpstreamSocket> {
        self.transition(RelayState::Authorizing)?;
        let token = token.ok_or_else(|| Error::Authentication("missing identity token".to_string()))?;
        let user = state.verifier.verify(token)?;
        self.user_id = Some(user.user_id.clone());

        let target = self.request.target.clone();
        state
            .gate
            .authorize(&user.user_id, &target.node, target.vmid, Capability::Console)
            .await?;

        self.transition(RelayState::Ticketing)?;
        let cred = state.resolver.resolve(self.request.server_id, &user.user_id).await?;

        let started = Instant::now();
        let result = match state.issuer.issue(&cred, &target).await {
            Ok(ticket) => match self.transition(RelayState::Connecting) {
                Ok(()) => state.upstream.connect(&cred, &target, ticket).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        let sample = match &result {
            Ok(_) => Some(ConnectionMetricSample::success(
                cred.server_id,
                started.elapsed().as_millis() as i64,
                cred.used_overlay,
                cred.timeout_ms(),
            )),
            Err(e) if e.is_connection_failure() => Some(ConnectionMetricSample::failure(
                cred.server_id,
                e,
                cred.used_overlay,
                cred.timeout_ms(),
            )),
            Err(_) => None,
        };
        if let Some(sample) = sample {
            state.health.spawn_ingest(sample);
        }

        result
    }

    /// Relay between the accepted client socket and the upstream socket
    pub async fn run(
        self,
        state: Arc<AppState>,
        client: axum::extract::ws::WebSocket,
        upstream: UpstreamSocket,
    ) -> Result<RelayOutcome> {
        self.run_with(state, relay::client_leg(client), relay::tungstenite_leg(upstream))
            .await
    }

    pub async fn run_with<CS, CR, US, UR>(
        mut self,
        state: Arc<AppState>,
        client: (CS, CR),
        upstream: (US, UR),
    ) -> Result<RelayOutcome>
    where
        CS: Sink<Frame, Error = Error> + Send + Unpin + 'static,
        CR: Stream<Item = Result<Frame>> + Send + Unpin + 'static,
        US: Sink<Frame, Error = Error> + Send + Unpin + 'static,
        UR: Stream<Item = Result<Frame>> + Send + Unpin + 'static,
    {
        if self.state != RelayState::Connecting {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: RelayState::Relaying.to_string(),
            });
        }
        let user_id = self
            .user_id
            .clone()
            .ok_or_else(|| Error::Internal("relay session has no user".to_string()))?;

        let (uid, vmid, node) = (user_id.clone(), self.request.target.vmid, self.request.target.node.clone());
        let record = match blocking(&state.db, move |db| db.open_session(&uid, vmid, &node)).await {
            Ok(record) => record,
            Err(e) => return Err(self.fail(e)),
        };
        self.record = Some(record);
        self.transition(RelayState::Relaying)?;

        info!(
            session = %self.id,
            record = self.record_id().unwrap_or_default(),
            user_id = %user_id,
            node = %self.request.target.node,
            vmid = self.request.target.vmid,
            "console relaying"
        );
        audit::emit(
            &state.audit,
            AuditRecord::new(&user_id, audit::CONSOLE_OPEN, "vm", self.request.target.vmid).with_details(
                serde_json::json!({
                    "node": self.request.target.node,
                    "vmtype": self.request.target.vmtype.as_str(),
                    "server_id": self.request.server_id,
                }),
            ),
        );

        let outcome = relay::pump(client, upstream, RelayOptions::from(&state.config.relay)).await;

        self.transition(RelayState::Closing)?;
        self.finish(&state).await;
        self.transition(RelayState::Closed)?;

        info!(
            session = %self.id,
            reason = ?outcome.reason,
            client_frames = outcome.client_frames,
            upstream_frames = outcome.upstream_frames,
            forced = outcome.forced,
            "console closed"
        );
        Ok(outcome)
    }

    /// Mark the stored session ended. Runs at most once.
    async fn finish(&mut self, state: &AppState) {
        let Some(record) = self.record.take() else {
            return;
        };
        let id = record.id.clone();
        match blocking(&state.db, move |db| db.end_session(&record.id)).await {
            Ok(true) => {}
            Ok(false) => warn!(session = %self.id, record = %id, "connection session was already ended"),
            Err(e) => warn!(session = %self.id, record = %id, "failed to end connection session: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::relay::tungstenite_leg;
    use futures::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::WebSocketStream;
    use vmrelay_common::{Database, GlobalRole, SecretCipher, ServerCredential, SessionStatus, User, VmType};

    const JWT_SECRET: &str = "session-test-secret";

    fn state() -> Arc<AppState> {
        let mut config = BrokerConfig::default();
        config.auth.jwt_secret = JWT_SECRET.to_string();
        config.security.secret_key = "key".to_string();
        config.hypervisor.tls = false;

        let db = Database::open_memory().unwrap();
        let cipher = SecretCipher::new("key").unwrap();
        let mut server = ServerCredential::new(1, "pve1", "127.0.0.1", 1);
        server.token_id = "root@pam!broker".to_string();
        server.encrypted_secret = Some(cipher.encrypt("secret"));
        db.upsert_server(&server).unwrap();
        db.upsert_user(&User { id: "alice".into(), tenant_id: None, role: GlobalRole::Member }).unwrap();
        db.set_vm_permissions("alice", 100, "pve1", &[Capability::View]).unwrap();

        Arc::new(AppState::new(config, db).unwrap())
    }

    fn request() -> ConsoleRequest {
        ConsoleRequest {
            target: ConsoleTarget {
                node: "pve1".to_string(),
                vmid: 100,
                vmtype: VmType::Qemu,
            },
            server_id: 1,
        }
    }

    #[test]
    fn test_transitions() {
        use RelayState::*;
        assert!(Handshaking.can_transition_to(Authorizing));
        assert!(Connecting.can_transition_to(Relaying));
        assert!(Ticketing.can_transition_to(Failed));
        assert!(!Authorizing.can_transition_to(Connecting));
        assert!(!Handshaking.can_transition_to(Relaying));
        assert!(!Relaying.can_transition_to(Failed));
        assert!(!Closed.can_transition_to(Handshaking));
        assert!(Closed.is_terminal() && Failed.is_terminal());
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut session = RelaySession::new(request());
        let err = session.transition(RelayState::Relaying).unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
        assert_eq!(err.http_status(), 500);
        assert_eq!(session.state(), RelayState::Handshaking);
    }

    #[tokio::test]
    async fn test_missing_token_fails_unauthenticated() {
        let state = state();
        let mut session = RelaySession::new(request());
        let err = session.establish(&state, None).await.unwrap_err();
        assert_eq!(err.http_status(), 401);
        assert_eq!(session.state(), RelayState::Failed);

        let mut session = RelaySession::new(request());
        let err = session.establish(&state, Some("not-a-jwt")).await.unwrap_err();
        assert_eq!(err.http_status(), 401);
    }

    #[tokio::test]
    async fn test_forbidden_before_any_upstream_call() {
        let state = state();
        let token = crate::auth::issue_test_token(JWT_SECRET, "alice", 300);
        let mut session = RelaySession::new(request());
        let err = session.establish(&state, Some(&token)).await.unwrap_err();
        assert_eq!(err.http_status(), 403);
        assert_eq!(session.state(), RelayState::Failed);
        assert_eq!(session.user_id(), Some("alice"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(state.db.recent_outcomes(1, 100).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upstream_failure_recorded() {
        let state = state();
        state
            .db
            .set_vm_permissions("alice", 100, "pve1", &[Capability::Console])
            .unwrap();
        let token = crate::auth::issue_test_token(JWT_SECRET, "alice", 300);

        let mut session = RelaySession::new(request());
        let err = session.establish(&state, Some(&token)).await.unwrap_err();
        assert!(err.is_connection_failure(), "{err}");
        assert_eq!(err.http_status(), 500);

        let mut recorded = Vec::new();
        for _ in 0..50 {
            recorded = state.db.recent_outcomes(1, 100).unwrap();
            if !recorded.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(recorded, vec![(false, None)]);
    }

    #[tokio::test]
    async fn test_session_record_ended_once() {
        let state = state();
        let mut session = RelaySession::new(request());
        session.state = RelayState::Connecting;
        session.user_id = Some("alice".to_string());

        let (a, b) = tokio::io::duplex(16 * 1024);
        let mut browser = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let relay_client = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        let (c, d) = tokio::io::duplex(16 * 1024);
        let relay_upstream = WebSocketStream::from_raw_socket(c, Role::Client, None).await;
        let mut hypervisor = WebSocketStream::from_raw_socket(d, Role::Server, None).await;

        let handle = tokio::spawn(session.run_with(
            state.clone(),
            tungstenite_leg(relay_client),
            tungstenite_leg(relay_upstream),
        ));

        browser.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
        assert_eq!(hypervisor.next().await.unwrap().unwrap(), Message::Binary(vec![1, 2, 3]));

        let ids = state.db.list_sessions_for_user("alice").unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(state.db.get_session(&ids[0]).unwrap().unwrap().status, SessionStatus::Active);

        browser.close(None).await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!outcome.forced);

        let record = state.db.get_session(&ids[0]).unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Ended);
        assert!(record.ended_at.is_some());
        assert!(!state.db.end_session(&ids[0]).unwrap());
    }
}
