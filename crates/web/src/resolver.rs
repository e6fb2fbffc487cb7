//! Credential and route resolution.
//!
//! Turns a server id into the endpoint, API token and timeout to use for one
//! connect attempt. The secret is unmasked in memory for the duration of the
//! attempt only; nothing here writes to the store.

use std::time::Duration;
use tracing::warn;

use crate::blocking;
use vmrelay_common::{
    Database, Error, Result, RoutingMode, SecretCipher, ServerCredential, ServerId, MIN_LEARNED_TIMEOUT_MS,
};

/// Endpoint and credential for one connect attempt
#[derive(Clone)]
pub struct ResolvedCredential {
    pub server_id: ServerId,
    pub host: String,
    pub port: u16,
    pub token_id: String,
    secret: String,
    pub timeout: Duration,
    pub used_overlay: bool,
}

impl ResolvedCredential {
    /// Value of the `Authorization` header for the hypervisor API
    pub fn authorization(&self) -> String {
        format!("PVEAPIToken={}={}", self.token_id, self.secret)
    }

    pub fn timeout_ms(&self) -> i64 {
        self.timeout.as_millis() as i64
    }
}

impl std::fmt::Debug for ResolvedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedCredential")
            .field("server_id", &self.server_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("token_id", &self.token_id)
            .field("timeout", &self.timeout)
            .field("used_overlay", &self.used_overlay)
            .finish_non_exhaustive()
    }
}

/// Pick the overlay endpoint when overlay routing is on and a host is set,
/// otherwise the direct one. Returns (host, port, used_overlay).
pub fn select_route(server: &ServerCredential) -> (String, u16, bool) {
    match (&server.routing_mode, server.overlay_host.as_deref()) {
        (RoutingMode::Overlay, Some(host)) if !host.trim().is_empty() => (
            host.trim().to_string(),
            server.overlay_port.unwrap_or(server.port),
            true,
        ),
        _ => (server.host.clone(), server.port, false),
    }
}

/// Learned timeout when present, configured timeout otherwise. A
/// non-positive value falls back to the learned-timeout floor.
pub fn effective_timeout(server: &ServerCredential) -> Duration {
    let ms = server.learned_timeout_ms.unwrap_or(server.configured_timeout_ms);
    let ms = if ms > 0 { ms } else { MIN_LEARNED_TIMEOUT_MS };
    Duration::from_millis(ms as u64)
}

/// Resolves server ids into connectable credentials
#[derive(Clone)]
pub struct CredentialResolver {
    db: Database,
    cipher: Option<SecretCipher>,
}

impl CredentialResolver {
    /// `cipher` is `None` when no secret key is configured; every resolve
    /// then fails with a configuration error.
    pub fn new(db: Database, cipher: Option<SecretCipher>) -> Self {
        Self { db, cipher }
    }

    /// Resolve `server_id` on behalf of `user_id`
    pub async fn resolve(&self, server_id: ServerId, user_id: &str) -> Result<ResolvedCredential> {
        let server = self.authorize_server(server_id, user_id).await?;
        self.credential_for(&server)
    }

    /// Look up a server and check it is within the user's ownership scope
    pub async fn authorize_server(&self, server_id: ServerId, user_id: &str) -> Result<ServerCredential> {
        let uid = user_id.to_string();
        let (server, user) = blocking(&self.db, move |db| Ok((db.get_server(server_id)?, db.get_user(&uid)?))).await?;

        let server = server.ok_or_else(|| Error::not_found("server", server_id))?;
        let user = user.ok_or_else(|| Error::Authorization(format!("unknown user {user_id}")))?;

        if !user.is_admin() {
            if let Some(owner) = server.tenant_id.as_deref() {
                if user.tenant_id.as_deref() != Some(owner) {
                    warn!(server_id, user_id, "server outside the user's tenant");
                    return Err(Error::Authorization(format!("server {server_id} is not accessible")));
                }
            }
        }

        Ok(server)
    }

    /// Resolve a registry record without an ownership check (health probes)
    pub fn credential_for(&self, server: &ServerCredential) -> Result<ResolvedCredential> {
        if !server.is_active {
            return Err(Error::Configuration(format!("server {} is disabled", server.id)));
        }

        let stored = server
            .encrypted_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Configuration(format!("server {} has no API secret", server.id)))?;
        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| Error::Configuration("secret key is not configured".to_string()))?;
        let secret = cipher.decrypt(stored)?;

        let (host, port, used_overlay) = select_route(server);

        Ok(ResolvedCredential {
            server_id: server.id,
            host,
            port,
            token_id: server.token_id.clone(),
            secret,
            timeout: effective_timeout(server),
            used_overlay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmrelay_common::{GlobalRole, User};

    fn setup() -> (CredentialResolver, Database, SecretCipher) {
        let db = Database::open_memory().unwrap();
        let cipher = SecretCipher::new("test-key").unwrap();

        let mut server = ServerCredential::new(1, "pve1", "10.0.0.5", 8006);
        server.token_id = "root@pam!broker".to_string();
        server.encrypted_secret = Some(cipher.encrypt("uuid-secret"));
        server.tenant_id = Some("acme".to_string());
        db.upsert_server(&server).unwrap();

        db.upsert_user(&User { id: "alice".into(), tenant_id: Some("acme".into()), role: GlobalRole::Member })
            .unwrap();
        db.upsert_user(&User { id: "bob".into(), tenant_id: Some("globex".into()), role: GlobalRole::Member })
            .unwrap();
        db.upsert_user(&User { id: "root".into(), tenant_id: None, role: GlobalRole::Admin }).unwrap();

        (CredentialResolver::new(db.clone(), Some(cipher.clone())), db, cipher)
    }

    #[tokio::test]
    async fn test_direct_then_overlay() {
        let (resolver, db, _) = setup();

        let cred = resolver.resolve(1, "alice").await.unwrap();
        assert_eq!((cred.host.as_str(), cred.port), ("10.0.0.5", 8006));
        assert!(!cred.used_overlay);
        assert_eq!(cred.authorization(), "PVEAPIToken=root@pam!broker=uuid-secret");

        let mut server = db.get_server(1).unwrap().unwrap();
        server.routing_mode = RoutingMode::Overlay;
        server.overlay_host = Some("s.example".to_string());
        db.upsert_server(&server).unwrap();

        let cred = resolver.resolve(1, "alice").await.unwrap();
        assert_eq!((cred.host.as_str(), cred.port), ("s.example", 8006));
        assert!(cred.used_overlay);
    }

    #[test]
    fn test_overlay_requires_host() {
        let mut server = ServerCredential::new(1, "pve1", "10.0.0.5", 8006);
        server.routing_mode = RoutingMode::Overlay;
        server.overlay_host = Some("  ".to_string());
        assert_eq!(select_route(&server), ("10.0.0.5".to_string(), 8006, false));

        server.overlay_host = None;
        assert_eq!(select_route(&server), ("10.0.0.5".to_string(), 8006, false));

        server.routing_mode = RoutingMode::Direct;
        server.overlay_host = Some("s.example".to_string());
        assert_eq!(select_route(&server), ("10.0.0.5".to_string(), 8006, false));

        server.routing_mode = RoutingMode::Overlay;
        server.overlay_port = Some(443);
        assert_eq!(select_route(&server), ("s.example".to_string(), 443, true));
    }

    #[test]
    fn test_learned_timeout_preferred() {
        let mut server = ServerCredential::new(1, "pve1", "10.0.0.5", 8006);
        server.configured_timeout_ms = 30_000;
        assert_eq!(effective_timeout(&server), Duration::from_secs(30));
        server.learned_timeout_ms = Some(7_500);
        assert_eq!(effective_timeout(&server), Duration::from_millis(7_500));
    }

    #[test]
    fn test_non_positive_timeout_uses_floor() {
        let mut server = ServerCredential::new(1, "pve1", "10.0.0.5", 8006);
        for configured in [0, -250] {
            server.configured_timeout_ms = configured;
            assert_eq!(
                effective_timeout(&server),
                Duration::from_millis(MIN_LEARNED_TIMEOUT_MS as u64)
            );
        }
    }

    #[tokio::test]
    async fn test_failures() {
        let (resolver, db, _) = setup();

        assert!(matches!(resolver.resolve(9, "alice").await, Err(Error::NotFound { .. })));
        assert!(matches!(resolver.resolve(1, "bob").await, Err(Error::Authorization(_))));
        assert!(matches!(resolver.resolve(1, "nobody").await, Err(Error::Authorization(_))));
        resolver.resolve(1, "root").await.unwrap();

        let mut server = db.get_server(1).unwrap().unwrap();
        server.is_active = false;
        db.upsert_server(&server).unwrap();
        assert!(matches!(resolver.resolve(1, "alice").await, Err(Error::Configuration(_))));

        server.is_active = true;
        server.encrypted_secret = None;
        db.upsert_server(&server).unwrap();
        assert!(matches!(resolver.resolve(1, "alice").await, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn test_missing_key() {
        let (_, db, _) = setup();
        let resolver = CredentialResolver::new(db, None);
        assert!(matches!(resolver.resolve(1, "alice").await, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn test_debug_redacts_secret() {
        let (resolver, _, _) = setup();
        let cred = resolver.resolve(1, "alice").await.unwrap();
        assert!(!format!("{cred:?}").contains("uuid-secret"));
    }
}
