//! railsession - keeps ticketing service accounts logged in.
//!
//! Runs one session task per configured user. A stand-alone node or the
//! cluster master logs in and publishes credentials; slaves adopt them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use railsession_core::auth::Keychain;
use railsession_core::cluster::{CredentialStore, DirectoryStore};
use railsession_core::config::Config;
use railsession_core::session::{ReadyState, SessionEvent, SessionHandle, SessionManager};

const USAGE: &str = "Usage: railsession [--config PATH] [--once] [--passengers USER MEMBER...]
       railsession --store-password USERNAME";

/// Log file prefix under `<data_dir>/logs`
const LOG_FILE: &str = "railsession.log";

enum Command {
    Run,
    Passengers { user: String, members: Vec<String> },
    StorePassword { username: String },
}

struct Args {
    config: Option<PathBuf>,
    once: bool,
    command: Command,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args> {
    let mut parsed = Args {
        config: None,
        once: false,
        command: Command::Run,
    };

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args.next().context("--config needs a path")?;
                parsed.config = Some(PathBuf::from(path));
            }
            "--once" => parsed.once = true,
            "--passengers" => {
                let user = args.next().context("--passengers needs a user key")?;
                let members: Vec<String> = args.by_ref().collect();
                if members.is_empty() {
                    bail!("--passengers needs at least one member");
                }
                parsed.command = Command::Passengers { user, members };
            }
            "--store-password" => {
                let username = args.next().context("--store-password needs a username")?;
                parsed.command = Command::StorePassword { username };
            }
            "-h" | "--help" => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            other => bail!("Unknown argument '{}'\n{}", other, USAGE),
        }
    }
    Ok(parsed)
}

/// Log to stderr and to a daily file. Keep the guard alive until exit so
/// buffered file output is flushed.
fn init_tracing(data_dir: &Path) -> WorkerGuard {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_appender = tracing_appender::rolling::daily(data_dir.join("logs"), LOG_FILE);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args = parse_args(std::env::args().skip(1))?;

    if let Command::StorePassword { username } = &args.command {
        let password = rpassword::prompt_password("Password: ")?;
        Keychain::store(username, &password)?;
        eprintln!("Password for {} saved to the system keychain", username);
        return Ok(());
    }

    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if args.once {
        config.session.single_pass = true;
    }

    let _guard = init_tracing(&config.data_dir);
    let role = config.role();
    info!(%role, users = config.users.len(), "railsession starting");

    let store: Option<Arc<dyn CredentialStore>> = match &config.cluster.store_dir {
        Some(dir) if role.is_clustered() => {
            info!(store = %dir.display(), "Using shared credential store");
            Some(Arc::new(DirectoryStore::new(dir.clone())))
        }
        _ => None,
    };

    match args.command {
        Command::Passengers { user, members } => print_passengers(&config, store, &user, &members).await,
        _ => run_all(&config, store).await,
    }
}

/// Run every user's session until Ctrl-C (or one pass with `--once`).
async fn run_all(config: &Config, store: Option<Arc<dyn CredentialStore>>) -> Result<()> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let mut managers = Vec::with_capacity(config.users.len());
    for user in &config.users {
        let manager = SessionManager::from_config(config, user, store.clone())
            .with_context(|| format!("Failed to set up user {}", user.key))?
            .with_events(events_tx.clone());
        managers.push(manager);
    }
    drop(events_tx);

    let handles: Vec<SessionHandle> = managers.iter().map(SessionManager::handle).collect();
    tokio::spawn(log_events(events_rx));

    for handle in &handles {
        let handle = handle.clone();
        tokio::spawn(async move {
            if handle.wait_for_ready().await.is_ok() {
                info!(user = %handle.identity(), "User is ready");
            }
        });
    }

    {
        let handles = handles.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Interrupted, stopping sessions"),
                Err(e) => warn!(error = %e, "Could not listen for Ctrl-C"),
            }
            for handle in &handles {
                handle.destroy();
            }
        });
    }

    let tasks = managers.into_iter().map(|mut manager| {
        tokio::spawn(async move {
            manager.run().await;
        })
    });
    for result in join_all(tasks).await {
        if let Err(e) = result {
            error!(error = %e, "Session task panicked");
        }
    }

    info!("railsession shutting down");
    Ok(())
}

/// Drive one user's session until it is usable, then print the resolved
/// passenger records as JSON.
async fn print_passengers(
    config: &Config,
    store: Option<Arc<dyn CredentialStore>>,
    user: &str,
    members: &[String],
) -> Result<()> {
    let user_config = config
        .users
        .iter()
        .find(|u| u.key == user)
        .with_context(|| format!("No user '{}' in the configuration", user))?;
    let mut manager = SessionManager::from_config(config, user_config, store)?;
    let handle = manager.handle();
    let retry_time = manager.settings().retry_time;

    loop {
        manager.tick().await;
        match handle.ready_state() {
            ReadyState::Ready => break,
            ReadyState::Destroyed => bail!("Session for {} was destroyed", user),
            state => {
                info!(user, %state, "Waiting for user to become ready");
                tokio::time::sleep(retry_time).await;
            }
        }
    }

    let records = manager.get_passengers(members).await?;
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

async fn log_events(mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::UserLoaded { identity } => info!(user = %identity, "User loaded"),
            SessionEvent::StateChanged(state) => debug!(%state, "Session state changed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args> {
        parse_args(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_parse_defaults() {
        let args = parse(&[]).unwrap();
        assert!(args.config.is_none());
        assert!(!args.once);
        assert!(matches!(args.command, Command::Run));
    }

    #[test]
    fn test_parse_passengers() {
        let args = parse(&["--config", "c.json", "--once", "--passengers", "u1", "1", "*Li Si"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("c.json")));
        assert!(args.once);
        match args.command {
            Command::Passengers { user, members } => {
                assert_eq!(user, "u1");
                assert_eq!(members, vec!["1".to_string(), "*Li Si".to_string()]);
            }
            _ => panic!("expected passengers command"),
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse(&["--passengers", "u1"]).is_err());
        assert!(parse(&["--config"]).is_err());
        assert!(parse(&["--bogus"]).is_err());
    }
}
