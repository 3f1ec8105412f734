//! Lectern CLI - a command line front end for the Lectern learning-management
//! backend.
//!
//! Logs in against the backend's token endpoint, keeps the session between
//! runs, and issues authenticated requests that refresh the access token
//! when it expires.

mod commands;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use lectern_core::{ApiClient, Config, Session, SystemClock};

// ============================================================================
// Constants
// ============================================================================

/// Log level used when RUST_LOG is not set
const DEFAULT_LOG_FILTER: &str = "warn";

/// Prefix of the daily rolling log file
const LOG_FILE_NAME: &str = "lectern.log";

#[derive(Parser)]
#[command(name = "lectern", version, about = "Learning-management session client")]
struct Cli {
    /// Also write logs to a daily rolling file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Log in with username and password
    Login {
        /// Defaults to LECTERN_USERNAME, then the last username used
        #[arg(long, short)]
        username: Option<String>,
    },
    /// End the session and forget the stored tokens
    Logout,
    /// Show who the stored session belongs to
    Whoami,
    /// Check the access token, refreshing it if it has expired
    Validate,
    /// GET a backend path and print the JSON response
    Get {
        /// Path relative to the backend URL, e.g. /api/courses/
        path: String,
    },
    /// Ask the route guard where a navigation would go
    Route {
        path: String,
        #[arg(long)]
        requires_auth: bool,
        /// Role the route is restricted to
        #[arg(long)]
        role: Option<String>,
        /// Treat the route as the login page
        #[arg(long)]
        login_page: bool,
    },
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=lectern_core=debug)
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .init();

    guard
}

/// Everything a command needs, built once at startup
pub(crate) struct Context {
    pub config: Config,
    pub session: Arc<Session>,
    pub api: ApiClient,
}

fn build_context() -> Result<Context> {
    let mut config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "Failed to load config, using defaults");
            Config::default()
        }
    };
    config.apply_env();
    debug!(api = %config.api_base_url, store = ?config.store, "Config loaded");

    let store = config.open_store()?;
    let session = Arc::new(Session::new(store, Arc::new(SystemClock)));
    let restored = session.init_from_store()?;
    debug!(restored, "Session loaded");

    let api = ApiClient::new(&config, Arc::clone(&session))?;
    Ok(Context {
        config,
        session,
        api,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_dir.as_deref());
    info!("Lectern starting");

    let mut ctx = build_context()?;

    match cli.command {
        Command::Login { username } => commands::login(&mut ctx, username).await,
        Command::Logout => commands::logout(&ctx),
        Command::Whoami => commands::whoami(&ctx),
        Command::Validate => commands::validate(&ctx).await,
        Command::Get { path } => commands::get(&ctx, &path).await,
        Command::Route {
            path,
            requires_auth,
            role,
            login_page,
        } => commands::route(&ctx, &path, requires_auth, role, login_page),
    }
}
