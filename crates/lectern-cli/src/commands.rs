use std::io::{self, Write};

use anyhow::{bail, Context as _, Result};
use tracing::{error, warn};

use lectern_core::{LoginError, Role, RouteGuard, RouteMeta};

use crate::Context;

/// Environment variables consulted before prompting
const USERNAME_ENV: &str = "LECTERN_USERNAME";
const PASSWORD_ENV: &str = "LECTERN_PASSWORD";

fn prompt_username(default: Option<&str>) -> Result<String> {
    match default {
        Some(last) => print!("Username [{}]: ", last),
        None => print!("Username: "),
    }
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim();

    match (input.is_empty(), default) {
        (true, Some(last)) => Ok(last.to_string()),
        _ => Ok(input.to_string()),
    }
}

fn prompt_password() -> Result<String> {
    let password = rpassword::prompt_password("Password: ")?;
    Ok(password)
}

/// Turn a login failure into something a person can act on
fn login_message(err: &LoginError) -> String {
    match err {
        LoginError::Rejected(detail) => detail.clone(),
        LoginError::Network(_) => {
            "Unable to connect to server. Check the backend URL and your connection.".to_string()
        }
        LoginError::InvalidResponse(_) => "The server sent an unexpected login response.".to_string(),
        LoginError::Store(_) => format!("Logged in, but the session could not be saved: {}", err),
    }
}

pub async fn login(ctx: &mut Context, username: Option<String>) -> Result<()> {
    let username = match username.or_else(|| std::env::var(USERNAME_ENV).ok()) {
        Some(name) => name,
        None => prompt_username(ctx.config.last_username.as_deref())?,
    };
    if username.is_empty() {
        bail!("Username required");
    }

    let password = match std::env::var(PASSWORD_ENV) {
        Ok(password) => password,
        Err(_) => prompt_password()?,
    };
    if password.is_empty() {
        bail!("Password required");
    }

    if let Err(e) = ctx.api.login(&username, &password).await {
        error!(error = %e, "Login failed");
        bail!(login_message(&e));
    }

    ctx.config.last_username = Some(username);
    if let Err(e) = ctx.config.save() {
        warn!(error = %e, "Failed to save config");
    }

    match ctx.session.identity() {
        Some(identity) => println!(
            "Logged in as {} ({})",
            identity.display_name(),
            identity.role.as_ref().map(Role::as_str).unwrap_or("no role")
        ),
        None => println!("Logged in"),
    }
    Ok(())
}

pub fn logout(ctx: &Context) -> Result<()> {
    ctx.api.logout();
    println!("Logged out");
    Ok(())
}

pub fn whoami(ctx: &Context) -> Result<()> {
    if !ctx.session.is_authenticated() {
        bail!("Not logged in");
    }
    match ctx.session.identity() {
        Some(identity) => {
            println!("username: {}", identity.username);
            if let Some(ref name) = identity.fullname {
                println!("name:     {}", name.trim());
            }
            if let Some(id) = identity.user_id {
                println!("user id:  {}", id);
            }
            println!(
                "role:     {}",
                identity.role.as_ref().map(Role::as_str).unwrap_or("-")
            );
        }
        None => println!("Logged in, identity unknown"),
    }
    if let Some(at) = ctx.session.last_validated_at() {
        println!("checked:  {}", at.to_rfc3339());
    }
    Ok(())
}

pub async fn validate(ctx: &Context) -> Result<()> {
    match ctx.api.validate().await {
        Some(_) => {
            println!("Session is valid");
            Ok(())
        }
        None => bail!("Session expired, please log in again"),
    }
}

pub async fn get(ctx: &Context, path: &str) -> Result<()> {
    if !ctx.session.is_authenticated() {
        bail!("Not logged in");
    }
    let body: serde_json::Value = ctx
        .api
        .get(path)
        .await
        .with_context(|| format!("GET {} failed", path))?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

pub fn route(
    ctx: &Context,
    path: &str,
    requires_auth: bool,
    role: Option<String>,
    login_page: bool,
) -> Result<()> {
    let meta = RouteMeta {
        requires_auth,
        requires_role: role.map(Role::from),
        is_login_page: login_page,
    };
    let guard = RouteGuard::new(ctx.session.clone());
    let decision = guard.check(&meta);
    match decision.redirect_path() {
        Some(target) => println!("{} -> {} ({:?})", path, target, decision),
        None => println!("{} -> allowed", path),
    }
    Ok(())
}
