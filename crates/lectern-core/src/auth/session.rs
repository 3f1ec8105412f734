use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::store::{
    CredentialStore, StoreEntry, StoreError, StoreResult, ACCESS_TOKEN_KEY, LAST_VALIDATED_KEY,
    REFRESH_TOKEN_KEY, SESSION_KEYS, USER_KEY,
};
use super::token::{decode_claims, Claims, Identity, Role};

/// Token pair issued by the login endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credential {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub issued_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct SessionState {
    credential: Credential,
    identity: Option<Identity>,
    last_validated_at: Option<DateTime<Utc>>,
    /// Bumped on every login and logout. A refresh only lands if the
    /// generation it started under is still current.
    generation: u64,
}

impl SessionState {
    fn clear(&mut self) {
        self.credential = Credential::default();
        self.identity = None;
        self.last_validated_at = None;
        self.generation += 1;
    }
}

/// The authenticated session: tokens, the identity decoded from the access
/// token, and the validation cooldown marker.
///
/// Constructed once by the application root and shared by reference with
/// the API client and route guard. The in-memory state is the source of
/// truth; every change is mirrored to the store while the state lock is
/// held, so memory and storage never disagree about which session is live.
pub struct Session {
    store: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
    state: RwLock<SessionState>,
}

impl Session {
    pub fn new(store: Arc<dyn CredentialStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            state: RwLock::new(SessionState::default()),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ===== Lifecycle =====

    /// Replace whatever session exists with this token pair.
    ///
    /// An access token that cannot be decoded is still accepted; the session
    /// is authenticated but has no identity until the token is refreshed.
    pub fn login(&self, tokens: TokenPair) -> StoreResult<()> {
        self.establish(tokens, None)
    }

    /// Like [`login`](Self::login), using `username` when the token does not
    /// carry one.
    pub fn login_as(&self, tokens: TokenPair, username: &str) -> StoreResult<()> {
        self.establish(tokens, Some(username))
    }

    fn establish(&self, tokens: TokenPair, username: Option<&str>) -> StoreResult<()> {
        let now = self.clock.now();
        let identity = match decode_claims(&tokens.access) {
            Ok(claims) => Some(Identity::from_claims(&claims, username)),
            Err(e) => {
                warn!(error = %e, "Access token from login could not be decoded");
                None
            }
        };
        let user_json = identity.as_ref().map(serde_json::to_string).transpose()?;
        let last_validated = now.timestamp_millis().to_string();

        let mut state = self.write();
        state.credential = Credential {
            access_token: Some(tokens.access),
            refresh_token: Some(tokens.refresh),
            issued_at: Some(now),
        };
        state.identity = identity;
        state.last_validated_at = Some(now);
        state.generation += 1;

        let result = self.store.write_batch(&[
            (ACCESS_TOKEN_KEY, state.credential.access_token.as_deref()),
            (REFRESH_TOKEN_KEY, state.credential.refresh_token.as_deref()),
            (LAST_VALIDATED_KEY, Some(last_validated.as_str())),
            (USER_KEY, user_json.as_deref()),
        ]);

        info!(
            username = state.identity.as_ref().map(|i| i.username.as_str()),
            role = ?state.identity.as_ref().and_then(|i| i.role.as_ref()),
            "Session established"
        );
        if let Err(ref e) = result {
            warn!(error = %e, "Failed to persist session");
        }
        result
    }

    /// End the session: clear memory and remove every stored key.
    pub fn logout(&self) {
        let mut state = self.write();
        state.clear();
        self.clear_store();
        info!("Session cleared");
    }

    /// Log out only if no login/logout happened since `generation` was read.
    pub(crate) fn logout_if_current(&self, generation: u64) -> bool {
        let mut state = self.write();
        if state.generation != generation {
            return false;
        }
        state.clear();
        self.clear_store();
        info!("Session cleared");
        true
    }

    fn clear_store(&self) {
        let removals: Vec<StoreEntry<'_>> = SESSION_KEYS.iter().map(|key| (*key, None)).collect();
        if let Err(e) = self.store.write_batch(&removals) {
            warn!(error = %e, "Failed to remove stored session");
        }
    }

    /// Load the session persisted by an earlier run.
    ///
    /// Needs both tokens in the store. A stored access token that cannot be
    /// decoded ends the session instead of leaving a half-populated identity.
    /// A store whose contents cannot be parsed is treated the same way.
    /// Calling this again with the same stored tokens changes nothing.
    pub fn init_from_store(&self) -> StoreResult<bool> {
        let stored = self
            .store
            .get(ACCESS_TOKEN_KEY)
            .and_then(|access| Ok((access, self.store.get(REFRESH_TOKEN_KEY)?)));
        let (access, refresh) = match stored {
            Ok(tokens) => tokens,
            Err(StoreError::Serialization(e)) => {
                warn!(error = %e, "Stored session is unreadable, logging out");
                self.logout();
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        let (Some(access), Some(refresh)) = (access, refresh) else {
            debug!("No stored session found");
            return Ok(self.is_authenticated());
        };

        {
            let state = self.read();
            if state.credential.access_token.as_deref() == Some(access.as_str())
                && state.credential.refresh_token.as_deref() == Some(refresh.as_str())
            {
                debug!("Stored session already loaded");
                return Ok(true);
            }
        }

        let claims = match decode_claims(&access) {
            Ok(claims) => claims,
            Err(e) => {
                warn!(error = %e, "Stored access token is unreadable, logging out");
                self.logout();
                return Ok(false);
            }
        };

        let stored_user: Option<Identity> = self
            .store
            .get(USER_KEY)?
            .and_then(|json| serde_json::from_str(&json).ok());
        let identity =
            Identity::from_claims(&claims, stored_user.as_ref().map(|u| u.username.as_str()));
        let last_validated_at = self
            .store
            .get(LAST_VALIDATED_KEY)?
            .and_then(|millis| millis.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis);

        let mut state = self.write();
        state.credential = Credential {
            access_token: Some(access),
            refresh_token: Some(refresh),
            issued_at: claims.issued_at(),
        };
        debug!(username = %identity.username, "Restored stored session");
        state.identity = Some(identity);
        state.last_validated_at = last_validated_at;
        state.generation += 1;
        Ok(true)
    }

    // ===== Accessors =====

    /// Derived from access-token presence on every call.
    pub fn is_authenticated(&self) -> bool {
        self.read().credential.access_token.is_some()
    }

    pub fn access_token(&self) -> Option<String> {
        self.read().credential.access_token.clone()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.read().credential.refresh_token.clone()
    }

    pub fn credential(&self) -> Credential {
        self.read().credential.clone()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.read().identity.clone()
    }

    pub fn role(&self) -> Option<Role> {
        self.read().identity.as_ref().and_then(|i| i.role.clone())
    }

    pub fn last_validated_at(&self) -> Option<DateTime<Utc>> {
        self.read().last_validated_at
    }

    // ===== Validator and refresh hooks =====

    pub(crate) fn validation_snapshot(&self) -> (Option<String>, Option<DateTime<Utc>>) {
        let state = self.read();
        (
            state.credential.access_token.clone(),
            state.last_validated_at,
        )
    }

    pub(crate) fn refresh_ticket(&self) -> (u64, Option<String>) {
        let state = self.read();
        (state.generation, state.credential.refresh_token.clone())
    }

    /// Record a successful expiry check, unless the token changed meanwhile.
    pub(crate) fn mark_validated(&self, token: &str, at: DateTime<Utc>) {
        let mut state = self.write();
        if state.credential.access_token.as_deref() != Some(token) {
            return;
        }
        state.last_validated_at = Some(at);
        let millis = at.timestamp_millis().to_string();
        if let Err(e) = self.store.set(LAST_VALIDATED_KEY, &millis) {
            warn!(error = %e, "Failed to persist validation time");
        }
    }

    /// Install a refreshed access token with a single durable write.
    ///
    /// Returns false, changing nothing, if the session was logged out or
    /// replaced after `generation` was taken.
    pub(crate) fn apply_refresh(
        &self,
        generation: u64,
        access: String,
        rotated_refresh: Option<String>,
        claims: &Claims,
    ) -> bool {
        let now = self.clock.now();
        let mut state = self.write();
        if state.generation != generation {
            return false;
        }

        let fallback = state.identity.as_ref().map(|i| i.username.clone());
        let identity = Identity::from_claims(claims, fallback.as_deref());
        let user_json = serde_json::to_string(&identity).ok();
        let rotated = rotated_refresh.is_some();

        state.credential.access_token = Some(access);
        if let Some(refresh) = rotated_refresh {
            state.credential.refresh_token = Some(refresh);
        }
        state.credential.issued_at = Some(now);
        state.identity = Some(identity);
        state.last_validated_at = Some(now);

        let last_validated = now.timestamp_millis().to_string();
        let mut entries: Vec<StoreEntry<'_>> = vec![
            (ACCESS_TOKEN_KEY, state.credential.access_token.as_deref()),
            (LAST_VALIDATED_KEY, Some(last_validated.as_str())),
            (USER_KEY, user_json.as_deref()),
        ];
        if rotated {
            entries.push((REFRESH_TOKEN_KEY, state.credential.refresh_token.as_deref()));
        }
        if let Err(e) = self.store.write_batch(&entries) {
            warn!(error = %e, "Failed to persist refreshed token");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::store::MemoryStore;
    use crate::testing::{fixture, mint_token, pair, START_SECS};
    use chrono::Duration;

    fn stored(store: &MemoryStore, key: &str) -> Option<String> {
        store.get(key).unwrap()
    }

    #[test]
    fn test_login_persists_every_key() {
        let fx = fixture();
        let access = mint_token(START_SECS + 300, "student");
        fx.session.login_as(pair(&access, "R1"), "sophea").unwrap();

        assert!(fx.session.is_authenticated());
        assert_eq!(stored(&fx.store, ACCESS_TOKEN_KEY), Some(access));
        assert_eq!(stored(&fx.store, REFRESH_TOKEN_KEY).as_deref(), Some("R1"));
        assert_eq!(
            stored(&fx.store, LAST_VALIDATED_KEY),
            Some((START_SECS * 1000).to_string())
        );

        let user: Identity = serde_json::from_str(&stored(&fx.store, USER_KEY).unwrap()).unwrap();
        assert_eq!(user.username, "sophea");
        assert_eq!(user.role, Some(Role::Student));
        assert_eq!(fx.session.role(), Some(Role::Student));
        assert_eq!(fx.session.last_validated_at(), Some(fx.clock.now()));
    }

    #[test]
    fn test_login_overwrites_previous_session() {
        let fx = fixture();
        fx.session
            .login(pair(&mint_token(START_SECS + 300, "student"), "R1"))
            .unwrap();
        let (first_generation, _) = fx.session.refresh_ticket();

        let teacher = mint_token(START_SECS + 300, "teacher");
        fx.session.login(pair(&teacher, "R9")).unwrap();

        let (second_generation, refresh) = fx.session.refresh_ticket();
        assert!(second_generation > first_generation);
        assert_eq!(refresh.as_deref(), Some("R9"));
        assert_eq!(fx.session.access_token(), Some(teacher));
        assert_eq!(fx.session.role(), Some(Role::Teacher));
    }

    #[test]
    fn test_login_with_undecodable_token_has_no_identity() {
        let fx = fixture();
        fx.session.login(pair("A1", "R1")).unwrap();

        assert!(fx.session.is_authenticated());
        assert_eq!(fx.session.identity(), None);
        assert_eq!(stored(&fx.store, USER_KEY), None);
    }

    #[test]
    fn test_logout_empties_storage() {
        let fx = fixture();
        fx.session
            .login(pair(&mint_token(START_SECS + 300, "admin"), "R1"))
            .unwrap();
        fx.session.logout();

        assert!(!fx.session.is_authenticated());
        assert_eq!(fx.session.identity(), None);
        assert_eq!(fx.session.last_validated_at(), None);
        for key in SESSION_KEYS {
            assert_eq!(stored(&fx.store, key), None, "{} should be removed", key);
        }
        assert!(fx.store.is_empty());
    }

    #[test]
    fn test_init_from_store_restores_session() {
        let fx = fixture();
        let access = mint_token(START_SECS + 300, "teacher");
        fx.session.login_as(pair(&access, "R1"), "dara").unwrap();

        let restarted = Session::new(fx.store.clone(), fx.clock.clone());
        assert!(!restarted.is_authenticated());
        assert!(restarted.init_from_store().unwrap());

        assert_eq!(restarted.access_token(), Some(access));
        assert_eq!(restarted.refresh_token().as_deref(), Some("R1"));
        assert_eq!(restarted.role(), Some(Role::Teacher));
        assert_eq!(restarted.identity().unwrap().username, "dara");
        assert_eq!(restarted.last_validated_at(), Some(fx.clock.now()));
    }

    #[test]
    fn test_init_from_store_is_idempotent() {
        let fx = fixture();
        fx.session
            .login(pair(&mint_token(START_SECS + 300, "student"), "R1"))
            .unwrap();

        let restarted = Session::new(fx.store.clone(), fx.clock.clone());
        assert!(restarted.init_from_store().unwrap());
        let (generation, _) = restarted.refresh_ticket();
        let identity = restarted.identity();

        assert!(restarted.init_from_store().unwrap());
        assert_eq!(restarted.refresh_ticket().0, generation);
        assert_eq!(restarted.identity(), identity);
    }

    #[test]
    fn test_init_from_store_with_unreadable_token_logs_out() {
        let fx = fixture();
        fx.store.set(ACCESS_TOKEN_KEY, "garbage").unwrap();
        fx.store.set(REFRESH_TOKEN_KEY, "R1").unwrap();
        fx.store.set(LAST_VALIDATED_KEY, "1").unwrap();

        assert!(!fx.session.init_from_store().unwrap());
        assert!(!fx.session.is_authenticated());
        assert_eq!(fx.session.identity(), None);
        assert!(fx.store.is_empty());
    }

    #[test]
    fn test_truncated_session_file_is_discarded() {
        use crate::auth::store::FileStore;
        use crate::auth::ManualClock;
        use crate::testing::start;

        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(FileStore::new(dir.path()));
        let clock = Arc::new(ManualClock::new(start()));
        let access = mint_token(START_SECS + 300, "student");

        let first = Session::new(store.clone(), clock.clone());
        first.login(pair(&access, "R1")).unwrap();
        let contents = std::fs::read_to_string(store.path()).unwrap();
        std::fs::write(store.path(), &contents[..contents.len() / 2]).unwrap();

        let restarted = Session::new(store.clone(), clock.clone());
        assert!(!restarted.init_from_store().unwrap());
        assert!(!restarted.is_authenticated());
        assert!(!store.path().exists());

        restarted.login(pair(&access, "R2")).unwrap();
        assert_eq!(store.get(REFRESH_TOKEN_KEY).unwrap().as_deref(), Some("R2"));

        std::fs::write(store.path(), "{").unwrap();
        restarted.logout();
        assert!(!store.path().exists());
    }

    #[test]
    fn test_init_from_store_needs_both_tokens() {
        let fx = fixture();
        fx.store
            .set(ACCESS_TOKEN_KEY, &mint_token(START_SECS + 300, "student"))
            .unwrap();

        assert!(!fx.session.init_from_store().unwrap());
        assert!(!fx.session.is_authenticated());
    }

    #[test]
    fn test_stale_generation_cannot_log_out_or_refresh() {
        let fx = fixture();
        fx.session
            .login(pair(&mint_token(START_SECS + 300, "student"), "R1"))
            .unwrap();
        let (stale, _) = fx.session.refresh_ticket();

        fx.session
            .login(pair(&mint_token(START_SECS + 600, "student"), "R2"))
            .unwrap();

        assert!(!fx.session.logout_if_current(stale));
        assert!(fx.session.is_authenticated());

        let fresh = mint_token(START_SECS + 900, "student");
        let claims = decode_claims(&fresh).unwrap();
        assert!(!fx.session.apply_refresh(stale, fresh.clone(), None, &claims));
        assert_ne!(fx.session.access_token(), Some(fresh));
    }

    #[test]
    fn test_apply_refresh_keeps_refresh_token_unless_rotated() {
        let fx = fixture();
        fx.session
            .login_as(pair(&mint_token(START_SECS + 60, "student"), "R1"), "sophea")
            .unwrap();
        fx.clock.advance(Duration::seconds(120));
        let writes_before = fx.store.write_count();

        let (generation, _) = fx.session.refresh_ticket();
        let a2 = mint_token(START_SECS + 1000, "student");
        let claims = decode_claims(&a2).unwrap();
        assert!(fx.session.apply_refresh(generation, a2.clone(), None, &claims));

        assert_eq!(fx.store.write_count(), writes_before + 1);
        assert_eq!(stored(&fx.store, ACCESS_TOKEN_KEY), Some(a2));
        assert_eq!(stored(&fx.store, REFRESH_TOKEN_KEY).as_deref(), Some("R1"));
        assert_eq!(fx.session.identity().unwrap().username, "sophea");
        assert_eq!(fx.session.last_validated_at(), Some(fx.clock.now()));

        let a3 = mint_token(START_SECS + 2000, "student");
        let claims = decode_claims(&a3).unwrap();
        assert!(fx.session.apply_refresh(generation, a3, Some("R2".into()), &claims));
        assert_eq!(stored(&fx.store, REFRESH_TOKEN_KEY).as_deref(), Some("R2"));
    }

    #[test]
    fn test_mark_validated_ignores_replaced_token() {
        let fx = fixture();
        let access = mint_token(START_SECS + 300, "student");
        fx.session.login(pair(&access, "R1")).unwrap();
        let logged_in_at = fx.clock.now();

        fx.clock.advance(Duration::seconds(90));
        fx.session.mark_validated("some-other-token", fx.clock.now());
        assert_eq!(fx.session.last_validated_at(), Some(logged_in_at));

        fx.session.mark_validated(&access, fx.clock.now());
        assert_eq!(fx.session.last_validated_at(), Some(fx.clock.now()));
    }
}
