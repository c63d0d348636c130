use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::Principal;

/// Capability tokens authenticate connection setup only; they are never
/// re-checked mid-stream, so expiry is kept short.
pub const MAX_STREAM_TOKEN_TTL: Duration = Duration::from_secs(15 * 60);

/// Claims carried by a stream capability token. No secret material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamClaims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    pub iat: u64,
    pub exp: u64,
}

#[derive(Debug, Clone)]
pub struct TokenError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for TokenError {}

/// Mints and verifies short-lived HS256 capability tokens for opening one
/// relay session. A session may legitimately outlive the token that opened it.
pub struct StreamTokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl std::fmt::Debug for StreamTokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTokenIssuer")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl StreamTokenIssuer {
    pub fn new(secret: Option<&str>, ttl: Duration) -> Result<Self, TokenError> {
        let secret = secret
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| TokenError {
                code: "ERR_TOKEN_CONFIG",
                message: "stream token signing key is not configured".to_string(),
            })?;

        if ttl.is_zero() || ttl > MAX_STREAM_TOKEN_TTL {
            return Err(TokenError {
                code: "ERR_TOKEN_CONFIG",
                message: format!(
                    "stream token ttl must be between 1 and {} seconds",
                    MAX_STREAM_TOKEN_TTL.as_secs()
                ),
            });
        }

        Ok(Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn mint(&self, principal: &Principal) -> Result<String, TokenError> {
        let now = unix_now_secs();
        let claims = StreamClaims {
            sub: principal.subject_id.clone(),
            roles: principal.roles.clone(),
            department: principal.department.clone(),
            iat: now,
            exp: now + self.ttl.as_secs(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding).map_err(|_| TokenError {
            code: "ERR_TOKEN_MINT",
            message: "failed to sign stream token".to_string(),
        })
    }

    pub fn verify(&self, token: &str) -> Result<StreamClaims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp"]);

        decode::<StreamClaims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|err| match err.kind() {
                ErrorKind::ExpiredSignature => TokenError {
                    code: "ERR_TOKEN_EXPIRED",
                    message: "stream token has expired".to_string(),
                },
                _ => TokenError {
                    code: "ERR_TOKEN_INVALID",
                    message: "stream token is invalid".to_string(),
                },
            })
    }
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}
