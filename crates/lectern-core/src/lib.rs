//! Lectern core - the authenticated-session layer of the Lectern
//! learning-management client.
//!
//! The library keeps an explicitly constructed [`Session`] that owns the
//! access/refresh token pair, mirrors it into a durable [`CredentialStore`],
//! and hands out tokens to the [`ApiClient`], which refreshes on 401 and
//! retries each request at most once.
//!
//! A typical application root wires it together like this:
//!
//! ```no_run
//! use std::sync::Arc;
//! use lectern_core::{ApiClient, Config, Session, SystemClock};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let session = Arc::new(Session::new(config.open_store()?, Arc::new(SystemClock)));
//! session.init_from_store()?;
//!
//! let api = ApiClient::new(&config, Arc::clone(&session))?;
//! let courses: serde_json::Value = api.get("/api/courses/").await?;
//! # let _ = courses;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod auth;
pub mod config;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{ApiClient, ApiError, ApiRequest, HttpResponse, Transport};
pub use auth::{
    Clock, CredentialStore, Identity, LoginError, RefreshError, Role, RouteGuard, RouteMeta,
    Navigation, Session, SystemClock, TokenPair,
};
pub use config::Config;
