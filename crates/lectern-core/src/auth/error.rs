use thiserror::Error;

use crate::api::TransportError;

use super::store::StoreError;

/// Why a token refresh produced no new access token.
///
/// Every variant except [`RefreshError::Superseded`] has already ended the
/// session by the time the caller sees it. The error is `Clone` because one
/// outcome is shared by every caller waiting on the same refresh.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("No refresh token available")]
    NoRefreshToken,

    #[error("Token refresh request failed: {0}")]
    Network(String),

    #[error("Token refresh rejected with status {0}")]
    Rejected(u16),

    #[error("Token refresh response unusable: {0}")]
    Decode(String),

    #[error("Session changed while the refresh was in flight")]
    Superseded,
}

impl RefreshError {
    pub fn ends_session(&self) -> bool {
        !matches!(self, RefreshError::Superseded)
    }
}

#[derive(Error, Debug)]
pub enum LoginError {
    /// Backend said no; carries its `detail` message when it sent one
    #[error("{0}")]
    Rejected(String),

    #[error("Network error: {0}")]
    Network(#[from] TransportError),

    #[error("Invalid login response: {0}")]
    InvalidResponse(String),

    #[error("Logged in but the session could not be saved: {0}")]
    Store(#[from] StoreError),
}
