//! Bearer credential verification for client upgrades.
//!
//! Tokens are `"<subject>.<expires_unix>.<hex hmac-sha256>"`, signed over
//! `"<subject>.<expires_unix>"` with a shared secret.  Client instance names
//! are `"<subject>.<suffix>"`; a connection may only claim an instance whose
//! owning subject matches its verified credential.

use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use mc_domain::NodeIdentity;
use mc_protocol::OriginAuth;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::GatewayError;

type HmacSha256 = Hmac<Sha256>;

/// Identity proven by a credential.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedCredential {
    pub subject: String,
    pub expires_at: DateTime<Utc>,
    pub claims: Map<String, Value>,
}

pub trait CredentialVerifier: Send + Sync + 'static {
    fn verify(&self, token: &str) -> Result<VerifiedCredential, GatewayError>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HMAC tokens
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct HmacTokenVerifier {
    secret: Vec<u8>,
}

impl HmacTokenVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self { secret: secret.into() }
    }

    /// Read the secret from `var`.  `None` when unset or empty.
    pub fn from_env(var: &str) -> Option<Self> {
        std::env::var(var)
            .ok()
            .filter(|s| !s.is_empty())
            .map(Self::new)
    }

    fn sign(&self, payload: &str) -> Result<Vec<u8>, GatewayError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| GatewayError::Internal(format!("hmac key: {e}")))?;
        mac.update(payload.as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Mint a token for `subject` valid for `ttl`.
    pub fn mint(&self, subject: &str, ttl: Duration) -> Result<String, GatewayError> {
        if subject.is_empty() || subject.contains('.') {
            return Err(GatewayError::BadRequest(
                "subject must be non-empty and must not contain '.'".into(),
            ));
        }
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| GatewayError::BadRequest(e.to_string()))?;
        let expires = (Utc::now() + ttl).timestamp();
        let payload = format!("{subject}.{expires}");
        let sig = hex::encode(self.sign(&payload)?);
        Ok(format!("{payload}.{sig}"))
    }
}

impl CredentialVerifier for HmacTokenVerifier {
    fn verify(&self, token: &str) -> Result<VerifiedCredential, GatewayError> {
        let malformed = || GatewayError::Unauthorized("malformed token".into());

        let mut parts = token.rsplitn(3, '.');
        let sig = parts.next().ok_or_else(malformed)?;
        let expires = parts.next().ok_or_else(malformed)?;
        let subject = parts.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;

        let provided = hex::decode(sig).map_err(|_| malformed())?;
        let expected = self.sign(&format!("{subject}.{expires}"))?;
        if !bool::from(provided.ct_eq(&expected)) {
            return Err(GatewayError::Unauthorized("bad signature".into()));
        }

        let expires: i64 = expires.parse().map_err(|_| malformed())?;
        let expires_at = DateTime::from_timestamp(expires, 0).ok_or_else(malformed)?;
        if expires_at <= Utc::now() {
            return Err(GatewayError::Unauthorized("token expired".into()));
        }

        Ok(VerifiedCredential {
            subject: subject.to_owned(),
            expires_at,
            claims: Map::from_iter([("iss".to_string(), Value::from("meshcall"))]),
        })
    }
}

/// Used when no signing secret is configured: every upgrade is refused.
pub struct RejectAll;

impl CredentialVerifier for RejectAll {
    fn verify(&self, _token: &str) -> Result<VerifiedCredential, GatewayError> {
        Err(GatewayError::Unauthorized("client auth is not configured".into()))
    }
}

/// The subject that owns `instance` (`"ada.phone"` → `"ada"`).
pub fn owning_subject(instance: &str) -> Option<&str> {
    instance.split_once('.').map(|(s, _)| s).filter(|s| !s.is_empty())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connection attachment
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Verified identity stored with a connection.  Everything the gateway
/// says about a client comes from here, never from in-band claims.
#[derive(Debug, Clone, Serialize)]
pub struct Attachment {
    pub identity: NodeIdentity,
    pub subject: String,
    #[serde(skip)]
    pub claims: Map<String, Value>,
    pub expires_at: DateTime<Utc>,
    pub connected_at: DateTime<Utc>,
}

impl Attachment {
    pub fn new(client_binding: &str, instance: &str, credential: VerifiedCredential) -> Self {
        Self {
            identity: NodeIdentity::client(client_binding, instance),
            subject: credential.subject,
            claims: credential.claims,
            expires_at: credential.expires_at,
            connected_at: Utc::now(),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    pub fn origin_auth(&self) -> OriginAuth {
        OriginAuth {
            subject: self.subject.clone(),
            claims: self.claims.clone(),
        }
    }
}
