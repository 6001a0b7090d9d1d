// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use desk_session::config::SessionConfig;
use desk_session::event::{ClearCause, SessionEvent};
use desk_session::identity::ensure_crypto_provider;
use desk_session::{BootstrapOutcome, SessionManager};

/// Keep a helpdesk session alive: restore or log in, renew ahead of expiry,
/// follow sibling instances sharing the state directory.
#[derive(Debug, Parser)]
#[command(name = "desk-session", version)]
struct Cli {
    #[command(flatten)]
    session: SessionConfig,

    /// Username used when no persisted session can be restored.
    #[arg(long, env = "DESK_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "DESK_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[arg(long, default_value = "info", env = "DESK_LOG_LEVEL")]
    log_level: String,

    /// `json` or `text`.
    #[arg(long, default_value = "text", env = "DESK_LOG_FORMAT")]
    log_format: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = cli.session.validate() {
        eprintln!("error: {e}");
        std::process::exit(2);
    }

    init_tracing(&cli);
    ensure_crypto_provider();

    if let Err(e) = run(cli).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing(cli: &Cli) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    match cli.log_format.as_str() {
        "json" => {
            fmt::fmt().with_env_filter(filter).json().init();
        }
        _ => {
            fmt::fmt().with_env_filter(filter).init();
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let manager = SessionManager::open(&cli.session)?;
    let mut events = manager.subscribe();

    match manager.bootstrap().await? {
        BootstrapOutcome::Restored(user) => info!(username = %user.username, "session restored"),
        BootstrapOutcome::Anonymous | BootstrapOutcome::AlreadyRan => login(&manager, &cli).await?,
    }

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(SessionEvent::Cleared { cause }) => match after_clear(cause) {
                NextStep::Relogin => {
                    warn!(?cause, "session ended, logging in again");
                    login(&manager, &cli).await?;
                }
                NextStep::Exit => {
                    info!(?cause, "session ended elsewhere, exiting");
                    break;
                }
                NextStep::Continue => {}
            },
            Ok(event) => match serde_json::to_string(&event) {
                Ok(line) => info!(event = %line, "session event"),
                Err(e) => warn!(err = %e, "unprintable session event"),
            },
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "dropped session events"),
            Err(RecvError::Closed) => break,
        }
    }

    info!("shutting down");
    manager.shutdown().await;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NextStep {
    Continue,
    Relogin,
    Exit,
}

/// Only a local authentication failure is recovered with the stored
/// password. A sibling's logout must stick, so it ends this process too.
fn after_clear(cause: ClearCause) -> NextStep {
    match cause {
        ClearCause::AuthenticationFailed => NextStep::Relogin,
        ClearCause::RemoteLogout | ClearCause::RemoteCleared => NextStep::Exit,
        ClearCause::Logout => NextStep::Continue,
    }
}

async fn login(manager: &SessionManager, cli: &Cli) -> anyhow::Result<()> {
    let (Some(username), Some(password)) = (cli.username.as_deref(), cli.password.as_deref())
    else {
        anyhow::bail!("no persisted session; pass --username and --password to log in");
    };
    let user = manager.login(username, password).await?;
    info!(username = %user.username, "logged in");
    Ok(())
}
