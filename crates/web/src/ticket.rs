//! Console ticket issuance against the hypervisor control plane.

use serde::{Deserialize, Deserializer, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::HypervisorConfig;
use crate::resolver::ResolvedCredential;
use vmrelay_common::{Error, Result, VmType};

/// Upper bound on upstream error bodies carried in errors
pub(crate) const MAX_ERROR_BODY: usize = 512;

/// The guest a console is requested for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleTarget {
    pub node: String,
    pub vmid: u32,
    pub vmtype: VmType,
}

impl ConsoleTarget {
    /// API path of the guest, e.g. `nodes/pve1/qemu/100`
    pub fn api_path(&self) -> String {
        format!("nodes/{}/{}/{}", self.node, self.vmtype, self.vmid)
    }
}

/// One-time console credential. Not `Clone`: it is consumed by the connect
/// that uses it.
#[derive(Serialize, Deserialize)]
pub struct ConsoleTicket {
    pub ticket: String,
    #[serde(deserialize_with = "de_port")]
    pub port: u16,
    pub user: String,
    pub upid: String,
}

impl std::fmt::Debug for ConsoleTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleTicket")
            .field("port", &self.port)
            .field("user", &self.user)
            .field("upid", &self.upid)
            .finish_non_exhaustive()
    }
}

/// Proxmox returns the VNC port as a string for some guest types
fn de_port<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u16, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Num(u16),
        Str(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Num(p) => Ok(p),
        Port::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Deserialize)]
struct ApiEnvelope<T> {
    data: T,
}

/// Mints console tickets and probes hypervisor reachability
#[derive(Clone)]
pub struct TicketIssuer {
    http: reqwest::Client,
    scheme: &'static str,
}

impl TicketIssuer {
    pub fn new(cfg: &HypervisorConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!cfg.verify_tls)
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            scheme: cfg.http_scheme(),
        })
    }

    fn base_url(&self, cred: &ResolvedCredential) -> String {
        format!("{}://{}:{}/api2/json", self.scheme, cred.host, cred.port)
    }

    /// Request a WebSocket-capable console ticket, bounded by the resolved timeout
    pub async fn issue(&self, cred: &ResolvedCredential, target: &ConsoleTarget) -> Result<ConsoleTicket> {
        let url = format!("{}/{}/vncproxy", self.base_url(cred), target.api_path());
        debug!(server_id = cred.server_id, node = %target.node, vmid = target.vmid, "requesting console ticket");

        let response = self
            .http
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, cred.authorization())
            .form(&[("websocket", "1")])
            .timeout(cred.timeout)
            .send()
            .await
            .map_err(|e| map_http_error(e, cred.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(server_id = cred.server_id, status = status.as_u16(), "ticket request rejected");
            return Err(Error::Upstream {
                status: Some(status.as_u16()),
                body: truncate_body(body),
            });
        }

        let envelope: ApiEnvelope<ConsoleTicket> = response
            .json()
            .await
            .map_err(|e| map_http_error(e, cred.timeout))?;
        Ok(envelope.data)
    }

    /// Time an authenticated `GET /version`
    pub async fn probe(&self, cred: &ResolvedCredential) -> Result<Duration> {
        let started = Instant::now();
        let response = self
            .http
            .get(format!("{}/version", self.base_url(cred)))
            .header(reqwest::header::AUTHORIZATION, cred.authorization())
            .timeout(cred.timeout)
            .send()
            .await
            .map_err(|e| map_http_error(e, cred.timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Upstream {
                status: Some(status.as_u16()),
                body: truncate_body(response.text().await.unwrap_or_default()),
            });
        }
        Ok(started.elapsed())
    }
}

fn map_http_error(e: reqwest::Error, timeout: Duration) -> Error {
    if e.is_timeout() {
        Error::Timeout {
            ms: timeout.as_millis() as u64,
        }
    } else {
        Error::Upstream {
            status: e.status().map(|s| s.as_u16()),
            body: truncate_body(e.to_string()),
        }
    }
}

/// Cap an upstream error body at `MAX_ERROR_BODY` bytes
pub(crate) fn truncate_body(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}
