//! Identity token handling.
//!
//! Callers present an HS256 JWT whose `sub` is the broker user id. On the
//! console WebSocket the token travels in a `Sec-WebSocket-Protocol` entry of
//! the form `auth-<token>` so it stays out of URLs and access logs; the
//! legacy `?jwt=` query parameter is still accepted. REST endpoints use a
//! `Bearer` authorization header.

use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::AuthConfig;
use vmrelay_common::{Error, Result};

/// Sub-protocol prefix carrying the identity token
pub const AUTH_PROTOCOL_PREFIX: &str = "auth-";

/// Registered claims the broker reads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<serde_json::Value>,
}

/// A caller whose token verified
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: String,
}

/// Where the identity token came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSource {
    /// Full sub-protocol value to echo back in the upgrade response
    SubProtocol(String),
    Query,
}

/// Verifies identity tokens against the configured secret
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(cfg: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_nbf = true;
        match &cfg.audience {
            Some(aud) => validation.set_audience(&[aud.as_str()]),
            None => validation.validate_aud = false,
        }
        if let Some(iss) = &cfg.issuer {
            validation.set_issuer(&[iss.as_str()]);
        }

        Self {
            key: DecodingKey::from_secret(cfg.jwt_secret.as_bytes()),
            validation,
        }
    }

    /// Verify a token and return the caller it names
    pub fn verify(&self, token: &str) -> Result<AuthenticatedUser> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            warn!("rejected identity token: {}", e);
            Error::Authentication("invalid or expired token".to_string())
        })?;

        if data.claims.sub.trim().is_empty() {
            return Err(Error::Authentication("token has no subject".to_string()));
        }

        Ok(AuthenticatedUser {
            user_id: data.claims.sub,
        })
    }
}

/// Find an `auth-<token>` entry among the offered WebSocket sub-protocols.
/// Returns the full protocol value and the token.
pub fn token_from_protocols(headers: &HeaderMap) -> Option<(String, String)> {
    headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .find_map(|proto| {
            proto
                .strip_prefix(AUTH_PROTOCOL_PREFIX)
                .filter(|t| !t.is_empty())
                .map(|t| (proto.to_string(), t.to_string()))
        })
}

/// Pick the console identity token, preferring the sub-protocol form
pub fn console_token(headers: &HeaderMap, query_jwt: Option<&str>) -> Option<(TokenSource, String)> {
    if let Some((proto, token)) = token_from_protocols(headers) {
        return Some((TokenSource::SubProtocol(proto), token));
    }
    query_jwt
        .filter(|t| !t.is_empty())
        .map(|t| (TokenSource::Query, t.to_string()))
}

/// Extract a `Bearer` token from the authorization header
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
pub(crate) fn issue_test_token(secret: &str, sub: &str, ttl_secs: i64) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};
    let claims = Claims {
        sub: sub.to_string(),
        exp: chrono::Utc::now().timestamp() + ttl_secs,
        iss: None,
        aud: None,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
}
