//! Navigation guard for the front end's router.
//!
//! The route table lives with the front end; it describes each route with a
//! [`RouteMeta`] and asks the guard where navigation should go.

use std::sync::Arc;

use super::session::Session;
use super::token::Role;

pub const LOGIN_PATH: &str = "/login";
pub const HOME_PATH: &str = "/";
pub const FORBIDDEN_PATH: &str = "/not-authorized";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteMeta {
    pub requires_auth: bool,
    pub requires_role: Option<Role>,
    /// The login page itself; authenticated users are sent home instead
    pub is_login_page: bool,
}

impl RouteMeta {
    pub fn public() -> Self {
        Self::default()
    }

    pub fn protected() -> Self {
        Self {
            requires_auth: true,
            ..Self::default()
        }
    }

    pub fn login_page() -> Self {
        Self {
            is_login_page: true,
            ..Self::default()
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.requires_role = Some(role);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Navigation {
    Allow,
    RedirectToLogin,
    RedirectToHome,
    Forbidden,
}

impl Navigation {
    /// Where to send the user, `None` to stay on the requested route
    pub fn redirect_path(&self) -> Option<&'static str> {
        match self {
            Navigation::Allow => None,
            Navigation::RedirectToLogin => Some(LOGIN_PATH),
            Navigation::RedirectToHome => Some(HOME_PATH),
            Navigation::Forbidden => Some(FORBIDDEN_PATH),
        }
    }
}

/// Decide a navigation from the session's state.
pub fn decide(is_authenticated: bool, role: Option<&Role>, route: &RouteMeta) -> Navigation {
    if route.requires_auth && !is_authenticated {
        Navigation::RedirectToLogin
    } else if route.is_login_page && is_authenticated {
        Navigation::RedirectToHome
    } else if route
        .requires_role
        .as_ref()
        .is_some_and(|required| role != Some(required))
    {
        Navigation::Forbidden
    } else {
        Navigation::Allow
    }
}

pub struct RouteGuard {
    session: Arc<Session>,
}

impl RouteGuard {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_authenticated()
    }

    pub fn role(&self) -> Option<Role> {
        self.session.role()
    }

    pub fn check(&self, route: &RouteMeta) -> Navigation {
        decide(self.is_authenticated(), self.role().as_ref(), route)
    }
}
