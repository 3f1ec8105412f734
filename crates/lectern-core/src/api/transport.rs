//! HTTP transport seam between the session layer and the network.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// A fully resolved outbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub bearer: Option<String>,
    pub body: Option<serde_json::Value>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            bearer: None,
            body: None,
        }
    }

    /// Unauthenticated JSON POST, as used by the token endpoints
    pub fn post(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            body: Some(body),
            ..Self::new(Method::Post, url)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

/// Sends one request and reports whatever status came back. Non-2xx is not
/// an error at this level; only failing to get a response is.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Transport over a pooled `reqwest` client.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method.into(), &request.url)
            .header(header::ACCEPT, "application/json");
        if let Some(ref token) = request.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        debug!(method = ?request.method, url = %request.url, status, "HTTP exchange");
        Ok(HttpResponse { status, body })
    }
}
