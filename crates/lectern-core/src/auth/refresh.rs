//! Single-flight exchange of the refresh token for a new access token.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::api::{HttpRequest, Transport};

use super::error::RefreshError;
use super::session::Session;
use super::token::decode_claims;

type RefreshOutcome = Result<String, RefreshError>;
type PendingRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

/// The refresh in flight and the session generation it was started for.
struct InFlight {
    generation: u64,
    pending: PendingRefresh,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access: String,
    /// Present when the backend rotates refresh tokens
    #[serde(default)]
    refresh: Option<String>,
}

/// Runs at most one refresh at a time for a session. Callers that arrive
/// while one is pending wait on it and get the same outcome.
///
/// The backend may rotate the refresh token on first use, so a second
/// concurrent exchange with the old token would be rejected and log the
/// user out. A refresh still pending for a session that has since been
/// replaced is not joined; the current session starts its own.
pub struct RefreshCoordinator {
    session: Arc<Session>,
    transport: Arc<dyn Transport>,
    refresh_url: String,
    in_flight: Arc<Mutex<Option<InFlight>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RefreshCoordinator {
    pub fn new(session: Arc<Session>, transport: Arc<dyn Transport>, refresh_url: String) -> Self {
        Self {
            session,
            transport,
            refresh_url,
            in_flight: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_refreshing(&self) -> bool {
        lock(&self.in_flight).is_some()
    }

    /// Get a new access token, joining a refresh already in flight.
    ///
    /// On any error except [`RefreshError::Superseded`] the session has been
    /// logged out before this returns.
    pub async fn refresh(&self) -> Result<String, RefreshError> {
        let pending = {
            let mut slot = lock(&self.in_flight);
            let (generation, refresh_token) = self.session.refresh_ticket();
            match slot.as_ref() {
                Some(current) if current.generation == generation => {
                    debug!("Joining token refresh already in flight");
                    current.pending.clone()
                }
                stale => {
                    if stale.is_some() {
                        debug!("Pending refresh belongs to an ended session, starting a new one");
                    }
                    let pending = Self::run(
                        Arc::clone(&self.session),
                        Arc::clone(&self.transport),
                        self.refresh_url.clone(),
                        Arc::clone(&self.in_flight),
                        generation,
                        refresh_token,
                    )
                    .boxed()
                    .shared();
                    *slot = Some(InFlight {
                        generation,
                        pending: pending.clone(),
                    });
                    pending
                }
            }
        };
        pending.await
    }

    async fn run(
        session: Arc<Session>,
        transport: Arc<dyn Transport>,
        refresh_url: String,
        in_flight: Arc<Mutex<Option<InFlight>>>,
        generation: u64,
        refresh_token: Option<String>,
    ) -> RefreshOutcome {
        let outcome = Self::exchange(
            &session,
            transport.as_ref(),
            &refresh_url,
            generation,
            refresh_token,
        )
        .await;
        // Clear before waiters are woken so the next expiry starts a fresh
        // exchange. A newer session's refresh may already own the slot.
        let mut slot = lock(&in_flight);
        if slot.as_ref().is_some_and(|current| current.generation == generation) {
            *slot = None;
        }
        drop(slot);
        outcome
    }

    async fn exchange(
        session: &Session,
        transport: &dyn Transport,
        refresh_url: &str,
        generation: u64,
        refresh_token: Option<String>,
    ) -> RefreshOutcome {
        let Some(refresh_token) = refresh_token else {
            warn!("No refresh token available, ending session");
            session.logout_if_current(generation);
            return Err(RefreshError::NoRefreshToken);
        };

        debug!("Exchanging refresh token");
        let request = HttpRequest::post(
            refresh_url,
            serde_json::json!({ "refresh": refresh_token }),
        );

        let result = match transport.execute(request).await {
            Err(e) => Err(RefreshError::Network(e.to_string())),
            Ok(response) if !response.is_success() => Err(RefreshError::Rejected(response.status)),
            Ok(response) => response
                .json::<RefreshResponse>()
                .map_err(|e| RefreshError::Decode(e.to_string()))
                .and_then(|body| {
                    let claims =
                        decode_claims(&body.access).map_err(|e| RefreshError::Decode(e.to_string()))?;
                    Ok((body, claims))
                }),
        };

        match result {
            Ok((body, claims)) => {
                let access = body.access.clone();
                if session.apply_refresh(generation, body.access, body.refresh, &claims) {
                    info!(expires_at = claims.exp, "Access token refreshed");
                    Ok(access)
                } else {
                    debug!("Session changed during refresh, discarding new token");
                    Err(RefreshError::Superseded)
                }
            }
            Err(err) => {
                if session.logout_if_current(generation) {
                    warn!(error = %err, "Token refresh failed, session ended");
                    Err(err)
                } else {
                    debug!(error = %err, "Token refresh failed for a session that already ended");
                    Err(RefreshError::Superseded)
                }
            }
        }
    }
}
