//! HTTP and WebSocket server

use axum::{
    extract::{rejection::JsonRejection, ws::WebSocketUpgrade, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::audit::{self, AuditSink, DbAuditSink};
use crate::auth::{self, AuthenticatedUser, TokenSource, TokenVerifier};
use crate::config::BrokerConfig;
use crate::health::{HealthMetricsEngine, HealthSummary};
use crate::permissions::PermissionGate;
use crate::probe::HealthProber;
use crate::resolver::CredentialResolver;
use crate::session::{ConsoleRequest, RelaySession};
use crate::ticket::{ConsoleTarget, ConsoleTicket, TicketIssuer};
use crate::upstream::UpstreamConnector;
use vmrelay_common::{
    AuditRecord, Capability, ConnectionMetricSample, Database, Error, SecretCipher, ServerId, VmType,
};

/// Shared broker state. Every request and relay session reads from it; the
/// only mutable shared resource behind it is the store.
pub struct AppState {
    pub config: BrokerConfig,
    pub db: Database,
    pub verifier: TokenVerifier,
    pub gate: PermissionGate,
    pub resolver: CredentialResolver,
    pub issuer: TicketIssuer,
    pub upstream: UpstreamConnector,
    pub health: HealthMetricsEngine,
    pub audit: Arc<dyn AuditSink>,
}

impl AppState {
    pub fn new(config: BrokerConfig, db: Database) -> vmrelay_common::Result<Self> {
        let cipher = if config.security.secret_key.is_empty() {
            warn!("no secret key configured, console requests will fail until one is set");
            None
        } else {
            Some(SecretCipher::new(&config.security.secret_key)?)
        };

        Ok(Self {
            verifier: TokenVerifier::new(&config.auth),
            gate: PermissionGate::new(db.clone()),
            resolver: CredentialResolver::new(db.clone(), cipher),
            issuer: TicketIssuer::new(&config.hypervisor)?,
            upstream: UpstreamConnector::new(&config.hypervisor),
            health: HealthMetricsEngine::new(db.clone(), config.metrics.clone()),
            audit: Arc::new(DbAuditSink::new(db.clone())),
            config,
            db,
        })
    }

    /// Prober sharing this state's store and clients
    pub fn prober(&self) -> HealthProber {
        HealthProber::new(
            self.db.clone(),
            self.resolver.clone(),
            self.issuer.clone(),
            self.health.clone(),
        )
    }
}

/// Error answered as `{error, status}`
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self(Error::BadRequest(e.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({
            "error": self.0.to_string(),
            "status": status.as_u16(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// The broker's HTTP server
pub struct BrokerServer {
    state: Arc<AppState>,
}

impl BrokerServer {
    pub fn new(state: AppState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    /// Create router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/health", get(health_handler))
            .route("/ws/console", get(console_ws_handler))
            .route("/api/console/ticket", post(console_ticket_handler))
            .route("/api/servers/:id/health", get(server_health_handler))
            .route("/api/maintenance/purge-metrics", post(purge_metrics_handler))
            .fallback(not_found_handler)
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Start the server
    pub async fn serve(self, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Console broker listening on http://{}", listener.local_addr()?);
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> ApiResult<AuthenticatedUser> {
    let token = auth::bearer_token(headers)
        .ok_or_else(|| Error::Authentication("missing bearer token".to_string()))?;
    Ok(state.verifier.verify(token)?)
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "vmrelay",
        "version": vmrelay_common::VERSION,
    }))
}

/// Query of a console upgrade request
#[derive(Debug, Default, Deserialize)]
pub struct ConsoleQuery {
    pub node: Option<String>,
    pub vmid: Option<String>,
    #[serde(rename = "type")]
    pub vmtype: Option<String>,
    pub server: Option<String>,
    pub jwt: Option<String>,
}

impl ConsoleQuery {
    /// Validate the query into a console request
    pub fn into_request(self) -> vmrelay_common::Result<ConsoleRequest> {
        fn required(value: Option<String>, name: &str) -> vmrelay_common::Result<String> {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::BadRequest(format!("missing parameter: {name}")))
        }

        let node = required(self.node, "node")?;
        let vmid = required(self.vmid, "vmid")?
            .parse::<u32>()
            .map_err(|_| Error::BadRequest("vmid must be a positive integer".to_string()))?;
        let vmtype = required(self.vmtype, "type")?.parse::<VmType>()?;
        let server_id = required(self.server, "server")?
            .parse::<ServerId>()
            .map_err(|_| Error::BadRequest("server must be an integer id".to_string()))?;

        Ok(ConsoleRequest {
            target: ConsoleTarget { node, vmid, vmtype },
            server_id,
        })
    }
}

async fn console_ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConsoleQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = auth::console_token(&headers, query.jwt.as_deref());
    let request = match query.into_request() {
        Ok(request) => request,
        Err(e) => return ApiError(e).into_response(),
    };

    let mut session = RelaySession::new(request);
    let upstream = match session
        .establish(&state, token.as_ref().map(|(_, t)| t.as_str()))
        .await
    {
        Ok(upstream) => upstream,
        Err(e) => return ApiError(e).into_response(),
    };

    let ws = match token {
        Some((TokenSource::SubProtocol(protocol), _)) => ws.protocols([protocol]),
        _ => ws,
    };

    ws.on_upgrade(move |socket| async move {
        if let Err(e) = session.run(state, socket, upstream).await {
            warn!("console relay ended with error: {}", e);
        }
    })
}

/// Console ticket request body
#[derive(Debug, Deserialize)]
pub struct TicketRequest {
    pub node: String,
    pub vmid: u32,
    pub vmtype: VmType,
    #[serde(rename = "serverId", alias = "server_id")]
    pub server_id: ServerId,
}

async fn console_ticket_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: std::result::Result<Json<TicketRequest>, JsonRejection>,
) -> ApiResult<Json<ConsoleTicket>> {
    let user = authenticate(&state, &headers)?;
    let Json(req) = body?;

    state
        .gate
        .authorize(&user.user_id, &req.node, req.vmid, Capability::Console)
        .await?;
    let cred = state.resolver.resolve(req.server_id, &user.user_id).await?;

    let target = ConsoleTarget {
        node: req.node,
        vmid: req.vmid,
        vmtype: req.vmtype,
    };
    let started = Instant::now();
    let ticket = match state.issuer.issue(&cred, &target).await {
        Ok(ticket) => {
            state.health.spawn_ingest(ConnectionMetricSample::success(
                cred.server_id,
                started.elapsed().as_millis() as i64,
                cred.used_overlay,
                cred.timeout_ms(),
            ));
            ticket
        }
        Err(e) => {
            if e.is_connection_failure() {
                state.health.spawn_ingest(ConnectionMetricSample::failure(
                    cred.server_id,
                    &e,
                    cred.used_overlay,
                    cred.timeout_ms(),
                ));
            }
            warn!(server_id = cred.server_id, node = %target.node, vmid = target.vmid, "ticket issuance failed: {}", e);
            return Err(e.into());
        }
    };

    audit::emit(
        &state.audit,
        AuditRecord::new(&user.user_id, audit::CONSOLE_TICKET, "vm", target.vmid).with_details(serde_json::json!({
            "node": target.node,
            "vmtype": target.vmtype.as_str(),
            "server_id": cred.server_id,
        })),
    );
    Ok(Json(ticket))
}

async fn server_health_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<ServerId>,
) -> ApiResult<Json<HealthSummary>> {
    let user = authenticate(&state, &headers)?;
    state.resolver.authorize_server(id, &user.user_id).await?;
    Ok(Json(state.health.summary(id).await?))
}

async fn purge_metrics_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let user = authenticate(&state, &headers)?;
    if !state.gate.is_admin(&user.user_id).await? {
        return Err(Error::Authorization("admin role required".to_string()).into());
    }

    let deleted = state.health.purge_expired().await?;
    audit::emit(
        &state.audit,
        AuditRecord::new(&user.user_id, audit::METRICS_PURGE, "connection_metrics", "*")
            .with_details(serde_json::json!({ "deleted": deleted })),
    );
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

async fn not_found_handler() -> ApiError {
    ApiError(Error::not_found("route", "unknown"))
}
