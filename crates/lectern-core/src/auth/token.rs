//! Access-token payload decoding and the identity derived from it.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Token is not a three-part JWT")]
    Malformed,

    #[error("Token payload is not valid base64url: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("Token payload is not valid claims JSON: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Claims carried in the access token.
///
/// `exp` is required; a token without it cannot be checked for expiry and is
/// treated as undecodable.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Claims {
    pub exp: i64,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub fullname: Option<String>,
}

impl Claims {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.exp <= now.timestamp()
    }

    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        self.iat.and_then(|iat| DateTime::from_timestamp(iat, 0))
    }
}

/// Read the claims of a JWT without verifying its signature.
pub fn decode_claims(token: &str) -> Result<Claims, TokenError> {
    let mut parts = token.split('.');
    let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(payload), Some(_), None) if !payload.is_empty() => payload,
        _ => return Err(TokenError::Malformed),
    };
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('='))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Account role as issued by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    Admin,
    Teacher,
    Student,
    Other(String),
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Role::Admin => "admin",
            Role::Teacher => "teacher",
            Role::Student => "student",
            Role::Other(s) => s.as_str(),
        }
    }
}

impl From<String> for Role {
    fn from(s: String) -> Self {
        match s.as_str() {
            "admin" => Role::Admin,
            "teacher" => Role::Teacher,
            "student" => Role::Student,
            _ => Role::Other(s),
        }
    }
}

impl From<&str> for Role {
    fn from(s: &str) -> Self {
        Role::from(s.to_string())
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who the current access token says the user is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: Option<i64>,
    pub username: String,
    pub role: Option<Role>,
    pub fullname: Option<String>,
}

impl Identity {
    /// Build from claims. The backend does not always put `username` in the
    /// token, so the caller may supply the name it logged in with.
    pub fn from_claims(claims: &Claims, fallback_username: Option<&str>) -> Self {
        Self {
            user_id: claims.user_id,
            username: claims
                .username
                .clone()
                .or_else(|| fallback_username.map(str::to_string))
                .unwrap_or_default(),
            role: claims.role.clone(),
            fullname: claims.fullname.clone(),
        }
    }

    pub fn display_name(&self) -> &str {
        match self.fullname.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name,
            _ => &self.username,
        }
    }
}
