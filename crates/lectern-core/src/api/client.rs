//! API client for the Lectern backend.
//!
//! `ApiClient` is the transport interceptor: it reads the bearer token from
//! the session at send time, and when the backend answers 401 it refreshes
//! the access token once and re-sends that one request.

use std::sync::Arc;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::auth::{
    LoginError, RefreshCoordinator, RefreshError, Session, TokenPair, TokenValidator, Verdict,
};
use crate::config::{join_url, Config};

use super::transport::{HttpRequest, HttpResponse, Method, ReqwestTransport, TransportError};
use super::{ApiError, Transport};

/// Shown when the backend rejects a login without saying why
const DEFAULT_LOGIN_ERROR: &str = "Invalid username or password";

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    detail: Option<String>,
}

/// A request relative to the backend base URL.
///
/// Carries its own retry flag: a request is re-sent after a token refresh at
/// most once, independently of every other request in flight.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
    retried: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            retried: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::Post, path).with_body(body)
    }

    pub fn put(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::Put, path).with_body(body)
    }

    pub fn patch(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::Patch, path).with_body(body)
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn is_retried(&self) -> bool {
        self.retried
    }
}

/// API client bound to one session.
/// Clone is cheap - the transport, session and refresh coordinator are shared.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    session: Arc<Session>,
    refresher: Arc<RefreshCoordinator>,
    validator: TokenValidator,
    base_url: String,
    token_url: String,
}

impl ApiClient {
    /// Create a client that talks HTTP through `reqwest`
    pub fn new(config: &Config, session: Arc<Session>) -> Result<Self, TransportError> {
        let transport = ReqwestTransport::new(config.request_timeout())?;
        Ok(Self::with_transport(config, session, Arc::new(transport)))
    }

    pub fn with_transport(
        config: &Config,
        session: Arc<Session>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let refresher = Arc::new(RefreshCoordinator::new(
            Arc::clone(&session),
            Arc::clone(&transport),
            config.refresh_url(),
        ));
        Self {
            transport,
            session,
            refresher,
            validator: TokenValidator::new(config.validation_cooldown()),
            base_url: config.api_base_url.clone(),
            token_url: config.token_url(),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    // ===== Session lifecycle =====

    /// Exchange a username and password for a token pair and start a session
    pub async fn login(&self, username: &str, password: &str) -> Result<(), LoginError> {
        let request = HttpRequest::post(
            self.token_url.as_str(),
            serde_json::json!({ "username": username, "password": password }),
        );
        let response = self.transport.execute(request).await?;

        if !response.is_success() {
            warn!(status = response.status, username, "Login rejected");
            let detail = response
                .json::<ErrorDetail>()
                .ok()
                .and_then(|body| body.detail)
                .unwrap_or_else(|| DEFAULT_LOGIN_ERROR.to_string());
            return Err(LoginError::Rejected(detail));
        }

        let tokens: TokenPair = response
            .json()
            .map_err(|e| LoginError::InvalidResponse(e.to_string()))?;
        self.session.login_as(tokens, username)?;
        info!(username, "Login successful");
        Ok(())
    }

    pub fn logout(&self) {
        self.session.logout();
    }

    /// A usable access token, refreshing it if it has expired.
    ///
    /// `None` means there is no session any more and the user has to log in.
    pub async fn validate(&self) -> Option<String> {
        let now = self.session.now();
        let (token, last_validated_at) = self.session.validation_snapshot();

        match self.validator.assess(token.as_deref(), last_validated_at, now) {
            Verdict::Missing => None,
            Verdict::Cached(token) => Some(token),
            Verdict::Valid(token) => {
                self.session.mark_validated(&token, now);
                Some(token)
            }
            Verdict::NeedsRefresh(reason) => {
                debug!(?reason, "Access token needs refresh");
                self.refresher.refresh().await.ok()
            }
        }
    }

    /// Refresh the access token now, sharing any refresh already in flight
    pub async fn refresh(&self) -> Result<String, RefreshError> {
        self.refresher.refresh().await
    }

    // ===== Requests =====

    async fn dispatch(
        &self,
        request: &ApiRequest,
        bearer: Option<String>,
    ) -> Result<HttpResponse, ApiError> {
        let outbound = HttpRequest {
            method: request.method,
            url: join_url(&self.base_url, &request.path),
            bearer,
            body: request.body.clone(),
        };
        Ok(self.transport.execute(outbound).await?)
    }

    /// Check if response is successful, returning an error with body if not.
    fn check_response(response: HttpResponse) -> Result<HttpResponse, ApiError> {
        if response.is_success() {
            Ok(response)
        } else {
            Err(ApiError::from_status(response.status, &response.body))
        }
    }

    /// Send a request with the current bearer token.
    ///
    /// A 401 triggers one token refresh and one re-send of this request; the
    /// re-sent response is returned whatever it is. If the refresh fails the
    /// session is already logged out and the original 401 is returned.
    pub async fn send(&self, mut request: ApiRequest) -> Result<HttpResponse, ApiError> {
        let response = self.dispatch(&request, self.session.access_token()).await?;
        if response.status != 401 || request.retried {
            return Self::check_response(response);
        }

        request.retried = true;
        debug!(path = %request.path, "Request unauthorized, refreshing access token");

        match self.refresher.refresh().await {
            Ok(token) => {
                let retried = self.dispatch(&request, Some(token)).await?;
                if retried.status == 401 {
                    warn!(path = %request.path, "Request still unauthorized after token refresh");
                }
                Self::check_response(retried)
            }
            Err(e) => {
                debug!(error = %e, path = %request.path, "Token refresh failed, giving up on request");
                Self::check_response(response)
            }
        }
    }

    fn parse<T: DeserializeOwned>(response: &HttpResponse, path: &str) -> Result<T, ApiError> {
        response.json().map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to parse JSON response from {}: {}", path, e))
        })
    }

    fn to_body<B: Serialize>(body: &B) -> Result<serde_json::Value, ApiError> {
        serde_json::to_value(body)
            .map_err(|e| ApiError::InvalidRequest(format!("Failed to serialize request body: {}", e)))
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self.send(ApiRequest::get(path)).await?;
        Self::parse(&response, path)
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let response = self.send(ApiRequest::post(path, Self::to_body(body)?)).await?;
        Self::parse(&response, path)
    }

    pub async fn put<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let response = self.send(ApiRequest::put(path, Self::to_body(body)?)).await?;
        Self::parse(&response, path)
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.send(ApiRequest::delete(path)).await?;
        Ok(())
    }
}
