//! Shared fixtures for unit tests: unsigned JWTs, an in-memory session and a
//! scripted backend.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::api::{HttpRequest, HttpResponse, Transport, TransportError};
use crate::auth::{ManualClock, MemoryStore, Session, TokenPair};
use crate::config::Config;

pub(crate) const START_SECS: i64 = 1_725_148_800;
pub(crate) const BASE_URL: &str = "http://lms.test";

pub(crate) fn start() -> DateTime<Utc> {
    DateTime::from_timestamp(START_SECS, 0).expect("valid start time")
}

pub(crate) fn mint_token_with(claims: Value) -> String {
    format!(
        "{}.{}.c2lnbmF0dXJl",
        URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#),
        URL_SAFE_NO_PAD.encode(claims.to_string())
    )
}

/// An access token shaped like the backend's, expiring at `exp`.
pub(crate) fn mint_token(exp: i64, role: &str) -> String {
    mint_token_with(json!({
        "token_type": "access",
        "exp": exp,
        "iat": exp - 300,
        "jti": format!("jti-{}", exp),
        "user_id": 7,
        "role": role,
        "fullname": "Chan Sophea"
    }))
}

pub(crate) fn pair(access: &str, refresh: &str) -> TokenPair {
    TokenPair {
        access: access.to_string(),
        refresh: refresh.to_string(),
    }
}

pub(crate) fn test_config() -> Config {
    Config {
        api_base_url: BASE_URL.to_string(),
        ..Config::default()
    }
}

pub(crate) struct Fixture {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub session: Arc<Session>,
}

pub(crate) fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(start()));
    let session = Arc::new(Session::new(store.clone(), clock.clone()));
    Fixture {
        store,
        clock,
        session,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory stand-in for the backend.
///
/// Token endpoints answer with whatever was scripted. Every other path
/// answers 200 for an accepted bearer token and 401 otherwise.
pub(crate) struct FakeBackend {
    accepted: Mutex<HashSet<String>>,
    login_reply: Mutex<(u16, Value)>,
    refresh_reply: Mutex<(u16, Value)>,
    refresh_delay: Mutex<Duration>,
    refresh_offline: AtomicBool,
    refresh_calls: AtomicUsize,
    log: Mutex<Vec<HttpRequest>>,
}

impl FakeBackend {
    pub const MISSING_PATH: &'static str = "/api/missing/";
    pub const OFFLINE_PATH: &'static str = "/api/offline/";

    pub fn new() -> Self {
        Self {
            accepted: Mutex::new(HashSet::new()),
            login_reply: Mutex::new((500, Value::Null)),
            refresh_reply: Mutex::new((500, Value::Null)),
            refresh_delay: Mutex::new(Duration::ZERO),
            refresh_offline: AtomicBool::new(false),
            refresh_calls: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn url(path: &str) -> String {
        format!("{}{}", BASE_URL, path)
    }

    pub fn accept(&self, token: &str) {
        lock(&self.accepted).insert(token.to_string());
    }

    pub fn reply_to_login(&self, status: u16, body: Value) {
        *lock(&self.login_reply) = (status, body);
    }

    pub fn reply_to_refresh(&self, status: u16, body: Value) {
        *lock(&self.refresh_reply) = (status, body);
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        *lock(&self.refresh_delay) = delay;
    }

    pub fn take_refresh_offline(&self) {
        self.refresh_offline.store(true, Ordering::SeqCst);
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn requests_to(&self, path: &str) -> Vec<HttpRequest> {
        let url = Self::url(path);
        lock(&self.log)
            .iter()
            .filter(|request| request.url == url)
            .cloned()
            .collect()
    }

    fn reply(status: u16, body: &Value) -> HttpResponse {
        let body = if body.is_null() {
            String::new()
        } else {
            body.to_string()
        };
        HttpResponse::new(status, body)
    }
}

#[async_trait]
impl Transport for FakeBackend {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        lock(&self.log).push(request.clone());
        let path = request
            .url
            .strip_prefix(BASE_URL)
            .unwrap_or(&request.url)
            .to_string();

        match path.as_str() {
            "/api/token/refresh/" => {
                self.refresh_calls.fetch_add(1, Ordering::SeqCst);
                let delay = *lock(&self.refresh_delay);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if self.refresh_offline.load(Ordering::SeqCst) {
                    return Err(TransportError::Unavailable("connection refused".to_string()));
                }
                let (status, body) = lock(&self.refresh_reply).clone();
                Ok(Self::reply(status, &body))
            }
            "/api/token/" => {
                let (status, body) = lock(&self.login_reply).clone();
                Ok(Self::reply(status, &body))
            }
            _ if path == Self::OFFLINE_PATH => {
                Err(TransportError::Unavailable("connection reset".to_string()))
            }
            _ => {
                let authorized = request
                    .bearer
                    .as_ref()
                    .is_some_and(|token| lock(&self.accepted).contains(token));
                if !authorized {
                    return Ok(Self::reply(
                        401,
                        &json!({
                            "detail": "Given token not valid for any token type",
                            "code": "token_not_valid"
                        }),
                    ));
                }
                if path == Self::MISSING_PATH {
                    return Ok(Self::reply(404, &json!({ "detail": "Not found." })));
                }
                Ok(Self::reply(200, &json!({ "path": path })))
            }
        }
    }
}
