//! REST API module for the Lectern backend.
//!
//! This module provides the `ApiClient`, which attaches the session's bearer
//! token to every request and recovers from an expired token by refreshing
//! once and retrying, and the `Transport` seam it sends requests through.
//!
//! The backend issues SimpleJWT access/refresh pairs from `/api/token/` and
//! exchanges refresh tokens at `/api/token/refresh/`.

pub mod client;
pub mod error;
pub mod transport;

pub use client::{ApiClient, ApiRequest};
pub use error::ApiError;
pub use transport::{HttpRequest, HttpResponse, Method, ReqwestTransport, Transport, TransportError};
