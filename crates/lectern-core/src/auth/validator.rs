use std::time::Duration;

use chrono::{DateTime, Utc};

use super::token::decode_claims;

/// Minimum interval between expiry checks of the same token.
pub const DEFAULT_VALIDATION_COOLDOWN: Duration = Duration::from_secs(60);

/// What to do with the current access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// No token; the caller has to send the user to login.
    Missing,
    /// Checked recently enough to trust without decoding.
    Cached(String),
    /// Decoded and not expired.
    Valid(String),
    NeedsRefresh(RefreshReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshReason {
    Expired,
    Undecodable,
}

/// Pure expiry/cooldown decision. The caller owns the side effects: marking
/// the token validated on `Valid`, and refreshing on `NeedsRefresh`.
#[derive(Debug, Clone, Copy)]
pub struct TokenValidator {
    cooldown: Duration,
}

impl Default for TokenValidator {
    fn default() -> Self {
        Self::new(DEFAULT_VALIDATION_COOLDOWN)
    }
}

impl TokenValidator {
    pub fn new(cooldown: Duration) -> Self {
        Self { cooldown }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn assess(
        &self,
        access_token: Option<&str>,
        last_validated_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Verdict {
        let Some(token) = access_token else {
            return Verdict::Missing;
        };

        if let Some(last) = last_validated_at {
            // A marker in the future (clock moved backwards) fails to_std and
            // falls through to a full check.
            if let Ok(elapsed) = (now - last).to_std() {
                if elapsed < self.cooldown {
                    return Verdict::Cached(token.to_string());
                }
            }
        }

        match decode_claims(token) {
            Err(_) => Verdict::NeedsRefresh(RefreshReason::Undecodable),
            Ok(claims) if claims.is_expired_at(now) => {
                Verdict::NeedsRefresh(RefreshReason::Expired)
            }
            Ok(_) => Verdict::Valid(token.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{mint_token, start, START_SECS};
    use chrono::Duration as TimeDelta;

    #[test]
    fn test_missing_token() {
        let validator = TokenValidator::default();
        assert_eq!(validator.assess(None, Some(start()), start()), Verdict::Missing);
    }

    #[test]
    fn test_within_cooldown_skips_decoding() {
        let validator = TokenValidator::default();
        let now = start() + TimeDelta::seconds(59);
        assert_eq!(
            validator.assess(Some("not-a-jwt"), Some(start()), now),
            Verdict::Cached("not-a-jwt".to_string())
        );
    }

    #[test]
    fn test_cooldown_elapsed_decodes() {
        let validator = TokenValidator::default();
        let now = start() + TimeDelta::seconds(60);
        assert_eq!(
            validator.assess(Some("not-a-jwt"), Some(start()), now),
            Verdict::NeedsRefresh(RefreshReason::Undecodable)
        );

        let token = mint_token(START_SECS + 3600, "student");
        assert_eq!(
            validator.assess(Some(&token), Some(start()), now),
            Verdict::Valid(token.clone())
        );
        assert_eq!(
            validator.assess(Some(&token), None, now),
            Verdict::Valid(token)
        );
    }

    #[test]
    fn test_expired_token_needs_refresh() {
        let validator = TokenValidator::default();
        let token = mint_token(START_SECS, "student");
        assert_eq!(
            validator.assess(Some(&token), None, start()),
            Verdict::NeedsRefresh(RefreshReason::Expired)
        );
    }

    #[test]
    fn test_future_marker_is_not_trusted() {
        let validator = TokenValidator::default();
        let token = mint_token(START_SECS - 10, "student");
        let marker = start() + TimeDelta::seconds(30);
        assert_eq!(
            validator.assess(Some(&token), Some(marker), start()),
            Verdict::NeedsRefresh(RefreshReason::Expired)
        );
    }

    #[test]
    fn test_zero_cooldown_always_decodes() {
        let validator = TokenValidator::new(std::time::Duration::ZERO);
        assert_eq!(
            validator.assess(Some("junk"), Some(start()), start()),
            Verdict::NeedsRefresh(RefreshReason::Undecodable)
        );
    }
}
