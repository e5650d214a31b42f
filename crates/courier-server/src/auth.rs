//! HS256 session tokens.
//!
//! Tokens carry the raw user id in an `id` or `_id` claim, as a string or an
//! integer. `exp` is required.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use courier_core::{AuthVerifier, Claims, RelayError, Role};
use courier_protocol::RawUserId;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
struct Header {
    alg: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<RawUserId>,
    #[serde(default, rename = "_id", skip_serializing_if = "Option::is_none")]
    legacy_id: Option<RawUserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<Role>,
    #[serde(default)]
    exp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iat: Option<u64>,
}

fn invalid(reason: &str) -> RelayError {
    RelayError::InvalidToken(format!("Invalid token: {reason}"))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Verifies and signs HS256 tokens with a shared secret.
#[derive(Clone)]
pub struct JwtVerifier {
    secret: Vec<u8>,
}

impl JwtVerifier {
    #[must_use]
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn mac(&self) -> Result<HmacSha256, RelayError> {
        <HmacSha256 as Mac>::new_from_slice(&self.secret).map_err(|_| invalid("bad secret"))
    }

    /// Sign a token for `user` that expires after `ttl`.
    ///
    /// # Errors
    ///
    /// Returns an error if the claims cannot be serialized.
    pub fn sign(&self, user: &RawUserId, ttl: Duration) -> Result<String, RelayError> {
        let now = unix_now();
        let claims = TokenClaims {
            id: Some(user.clone()),
            legacy_id: None,
            username: None,
            role: None,
            exp: Some(now + ttl.as_secs()),
            iat: Some(now),
        };
        let header = serde_json::json!({"alg": "HS256", "typ": "JWT"});

        let header_b64 = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&header).map_err(|e| invalid(&e.to_string()))?,
        );
        let payload_b64 = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&claims).map_err(|e| invalid(&e.to_string()))?,
        );

        let signing_input = format!("{header_b64}.{payload_b64}");
        let mut mac = self.mac()?;
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{signing_input}.{signature}"))
    }

    fn decode(&self, token: &str) -> Result<TokenClaims, RelayError> {
        let mut parts = token.splitn(3, '.');
        let (Some(header_b64), Some(payload_b64), Some(sig_b64)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid("malformed"));
        };

        let signature = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| invalid("malformed signature"))?;
        let mut mac = self.mac()?;
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(payload_b64.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| invalid("bad signature"))?;

        let header: Header = URL_SAFE_NO_PAD
            .decode(header_b64)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .ok_or_else(|| invalid("malformed header"))?;
        if header.alg != "HS256" {
            return Err(invalid("unsupported algorithm"));
        }

        let claims: TokenClaims = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .ok_or_else(|| invalid("malformed payload"))?;

        match claims.exp {
            Some(exp) if unix_now() < exp => Ok(claims),
            Some(_) => Err(invalid("expired")),
            None => Err(invalid("missing expiry")),
        }
    }
}

#[async_trait]
impl AuthVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<Claims, RelayError> {
        let claims = self.decode(token)?;
        let subject = claims
            .id
            .or(claims.legacy_id)
            .filter(|id| !id.is_blank())
            .ok_or_else(|| invalid("missing subject"))?;

        debug!(subject = %subject, "Token verified");
        Ok(Claims {
            subject,
            username: claims.username,
            role: claims.role,
        })
    }
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier").finish_non_exhaustive()
    }
}
