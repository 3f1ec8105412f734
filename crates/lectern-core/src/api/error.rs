use thiserror::Error;

use super::transport::TransportError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Forbidden for this account: {0}")]
    AccessDenied(String),

    #[error("Unauthorized - session expired or invalid")]
    Unauthorized,

    #[error("No such resource: {0}")]
    NotFound(String),

    #[error("Too many requests, backend asked to slow down")]
    RateLimited,

    #[error("Backend failed: {0}")]
    ServerError(String),

    #[error("Could not reach backend: {0}")]
    NetworkError(#[from] TransportError),

    #[error("Unexpected response: {0}")]
    InvalidResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Response bodies quoted in errors are cut to this many bytes
const MAX_QUOTED_BODY: usize = 500;

impl ApiError {
    fn quote_body(body: &str) -> String {
        if body.len() <= MAX_QUOTED_BODY {
            return body.to_string();
        }
        let end = (0..=MAX_QUOTED_BODY)
            .rev()
            .find(|&i| body.is_char_boundary(i))
            .unwrap_or(0);
        format!("{}... ({} bytes total)", &body[..end], body.len())
    }

    /// Map a non-2xx response to the error callers branch on.
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 => ApiError::Unauthorized,
            429 => ApiError::RateLimited,
            403 => ApiError::AccessDenied(Self::quote_body(body)),
            404 => ApiError::NotFound(Self::quote_body(body)),
            500..=599 => ApiError::ServerError(Self::quote_body(body)),
            _ => ApiError::InvalidResponse(format!("HTTP {} {}", status, Self::quote_body(body))),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized)
    }
}
