//! Authentication module for managing the user session lifecycle.
//!
//! This module provides:
//! - `Session`: in-memory token pair, decoded identity and validation marker
//! - `CredentialStore`: durable key/value slot the session is mirrored into
//! - `TokenValidator`: expiry and cooldown decisions for the access token
//! - `RefreshCoordinator`: single-flight refresh-token exchange
//! - `RouteGuard`: navigation decisions based on authentication and role
//!
//! Access tokens are SimpleJWT-style JWTs; only the payload is read here,
//! signatures are the backend's business.

pub mod clock;
pub mod error;
pub mod guard;
pub mod refresh;
pub mod session;
pub mod store;
pub mod token;
pub mod validator;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{LoginError, RefreshError};
pub use guard::{Navigation, RouteGuard, RouteMeta};
pub use refresh::RefreshCoordinator;
pub use session::{Credential, Session, TokenPair};
pub use store::{CredentialStore, FileStore, KeyringStore, MemoryStore, StoreError};
pub use token::{Claims, Identity, Role, TokenError};
pub use validator::{RefreshReason, TokenValidator, Verdict};
