//! Core types for vmrelay

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

use crate::Error;

/// Server registry primary key
pub type ServerId = i64;

/// Lower bound for a learned timeout
pub const MIN_LEARNED_TIMEOUT_MS: i64 = 5_000;
/// Upper bound for a learned timeout
pub const MAX_LEARNED_TIMEOUT_MS: i64 = 120_000;

/// How the broker reaches a hypervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    Direct,
    Overlay,
}

impl Default for RoutingMode {
    fn default() -> Self {
        Self::Direct
    }
}

impl RoutingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingMode::Direct => "direct",
            RoutingMode::Overlay => "overlay",
        }
    }
}

impl FromStr for RoutingMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "overlay" => Ok(Self::Overlay),
            other => Err(Error::Configuration(format!("unknown routing mode: {other}"))),
        }
    }
}

/// Guest type on the hypervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmType {
    Qemu,
    Lxc,
}

impl VmType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmType::Qemu => "qemu",
            VmType::Lxc => "lxc",
        }
    }
}

impl std::fmt::Display for VmType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "qemu" => Ok(Self::Qemu),
            "lxc" => Ok(Self::Lxc),
            other => Err(Error::BadRequest(format!("vmtype must be qemu or lxc, got {other}"))),
        }
    }
}

/// Hypervisor endpoint as stored by the server registry.
///
/// The core only reads these records, except for the three learned fields
/// which it replaces in one statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerCredential {
    pub id: ServerId,
    pub name: String,
    pub host: String,
    pub port: u16,
    /// API token identity the secret belongs to, e.g. `root@pam!broker`
    pub token_id: String,
    #[serde(skip_serializing)]
    pub encrypted_secret: Option<String>,
    pub routing_mode: RoutingMode,
    pub overlay_host: Option<String>,
    pub overlay_port: Option<u16>,
    pub configured_timeout_ms: i64,
    pub learned_timeout_ms: Option<i64>,
    pub avg_response_time_ms: Option<i64>,
    pub success_rate_pct: Option<f64>,
    /// Owning tenant; `None` means shared by every tenant
    pub tenant_id: Option<String>,
    pub is_active: bool,
}

impl ServerCredential {
    /// Minimal active, direct-routed record
    pub fn new(id: ServerId, name: &str, host: &str, port: u16) -> Self {
        Self {
            id,
            name: name.to_string(),
            host: host.to_string(),
            port,
            token_id: String::new(),
            encrypted_secret: None,
            routing_mode: RoutingMode::Direct,
            overlay_host: None,
            overlay_port: None,
            configured_timeout_ms: 30_000,
            learned_timeout_ms: None,
            avg_response_time_ms: None,
            success_rate_pct: None,
            tenant_id: None,
            is_active: true,
        }
    }
}

/// Global role of a broker user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalRole {
    Admin,
    Member,
}

impl GlobalRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            GlobalRole::Admin => "admin",
            GlobalRole::Member => "member",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "admin" | "super_admin" => Self::Admin,
            _ => Self::Member,
        }
    }
}

/// User record as seen by the permission store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub tenant_id: Option<String>,
    pub role: GlobalRole,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == GlobalRole::Admin
    }
}

/// Per-VM capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    View,
    Console,
    Start,
    Stop,
    Restart,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::View => "view",
            Capability::Console => "console",
            Capability::Start => "start",
            Capability::Stop => "stop",
            Capability::Restart => "restart",
        }
    }
}

impl FromStr for Capability {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "view" => Ok(Self::View),
            "console" => Ok(Self::Console),
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "restart" => Ok(Self::Restart),
            other => Err(Error::BadRequest(format!("unknown capability: {other}"))),
        }
    }
}

/// Action a user can request against a VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmAction {
    View,
    Console,
    Start,
    Resume,
    Stop,
    Shutdown,
    Suspend,
    Reset,
}

impl VmAction {
    /// Capability an action requires
    pub fn capability(&self) -> Capability {
        match self {
            VmAction::View => Capability::View,
            VmAction::Console => Capability::Console,
            VmAction::Start | VmAction::Resume => Capability::Start,
            VmAction::Stop | VmAction::Shutdown | VmAction::Suspend => Capability::Stop,
            VmAction::Reset => Capability::Restart,
        }
    }
}

impl FromStr for VmAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "view" => Ok(Self::View),
            "console" => Ok(Self::Console),
            "start" => Ok(Self::Start),
            "resume" => Ok(Self::Resume),
            "stop" => Ok(Self::Stop),
            "shutdown" => Ok(Self::Shutdown),
            "suspend" => Ok(Self::Suspend),
            "reset" => Ok(Self::Reset),
            other => Err(Error::BadRequest(format!("unknown action: {other}"))),
        }
    }
}

/// Capabilities a user holds on one VM
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmPermissionAssignment {
    pub user_id: String,
    pub vm_id: u32,
    pub node_name: String,
    pub capabilities: BTreeSet<Capability>,
}

impl VmPermissionAssignment {
    pub fn allows(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Connection session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Ended => "ended",
        }
    }
}

/// One relayed console connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSession {
    pub id: String,
    pub user_id: String,
    pub vm_id: u32,
    pub node_name: String,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub status: SessionStatus,
}

/// Outcome of one connection attempt against a server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetricSample {
    pub server_id: ServerId,
    pub success: bool,
    pub response_time_ms: Option<i64>,
    pub error_message: Option<String>,
    pub used_overlay: bool,
    pub timeout_used_ms: i64,
    pub retry_count: u32,
    pub created_at: i64,
}

impl ConnectionMetricSample {
    pub fn success(server_id: ServerId, response_time_ms: i64, used_overlay: bool, timeout_used_ms: i64) -> Self {
        Self {
            server_id,
            success: true,
            response_time_ms: Some(response_time_ms),
            error_message: None,
            used_overlay,
            timeout_used_ms,
            retry_count: 0,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn failure(server_id: ServerId, error: &Error, used_overlay: bool, timeout_used_ms: i64) -> Self {
        Self {
            server_id,
            success: false,
            response_time_ms: None,
            error_message: Some(error.to_string()),
            used_overlay,
            timeout_used_ms,
            retry_count: 0,
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// The three fields derived from a server's recent samples
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthStats {
    pub success_rate_pct: Option<f64>,
    pub avg_response_time_ms: Option<i64>,
    pub learned_timeout_ms: Option<i64>,
}

/// Sample aggregate for one UTC hour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyBucket {
    /// RFC 3339 start of the hour, e.g. `2026-10-19T13:00:00Z`
    pub hour: String,
    pub total: i64,
    pub successes: i64,
    pub avg_response_time_ms: Option<f64>,
}

/// Privileged action record handed to the audit sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub actor_id: String,
    pub action_type: String,
    pub resource_type: String,
    pub resource_id: String,
    pub details: serde_json::Value,
    pub timestamp: i64,
}

impl AuditRecord {
    pub fn new(actor_id: &str, action_type: &str, resource_type: &str, resource_id: impl ToString) -> Self {
        Self {
            actor_id: actor_id.to_string(),
            action_type: action_type.to_string(),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            details: serde_json::Value::Null,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_capability_mapping() {
        assert_eq!(VmAction::Start.capability(), Capability::Start);
        assert_eq!(VmAction::Resume.capability(), Capability::Start);
        assert_eq!(VmAction::Stop.capability(), Capability::Stop);
        assert_eq!(VmAction::Shutdown.capability(), Capability::Stop);
        assert_eq!(VmAction::Suspend.capability(), Capability::Stop);
        assert_eq!(VmAction::Reset.capability(), Capability::Restart);
        assert_eq!(VmAction::Console.capability(), Capability::Console);
        assert_eq!(VmAction::View.capability(), Capability::View);
    }

    #[test]
    fn test_vm_type_parse() {
        assert_eq!("qemu".parse::<VmType>().unwrap(), VmType::Qemu);
        assert_eq!("lxc".parse::<VmType>().unwrap(), VmType::Lxc);
        assert!(matches!("kvm".parse::<VmType>(), Err(Error::BadRequest(_))));
    }

    #[test]
    fn test_capability_serde_names() {
        let caps: Vec<Capability> = serde_json::from_str(r#"["view","console","restart"]"#).unwrap();
        assert_eq!(caps, vec![Capability::View, Capability::Console, Capability::Restart]);
        assert_eq!(Capability::Stop.as_str(), "stop");
    }

    #[test]
    fn test_secret_not_serialized() {
        let mut server = ServerCredential::new(1, "pve1", "10.0.0.5", 8006);
        server.encrypted_secret = Some("c2VjcmV0".to_string());
        let json = serde_json::to_string(&server).unwrap();
        assert!(!json.contains("encrypted_secret"));
    }
}
