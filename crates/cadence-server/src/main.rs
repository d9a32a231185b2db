//! cadence server binary.
//!
//! Reads `cadence.toml` (or the path given with `--config`) plus any
//! `CADENCE__*` environment overrides, opens the SQLite review store, starts
//! the persistence workers and background jobs, and serves the HTTP API until
//! interrupted.
//!
//! # Password hash generation
//!
//! To generate the argon2 PHC string for `operator_password_hash`:
//!
//! ```
//! cargo run -p cadence-server --bin cadence -- --hash-password
//! ```

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use anyhow::Context as _;
use argon2::{Argon2, PasswordHasher, password_hash::SaltString};
use cadence_engine::{Engine, queue, scheduler};
use cadence_server::{AppState, ServerConfig, auth::AuthConfig};
use cadence_store_sqlite::SqliteStore;
use clap::Parser;
use rand_core::OsRng;
use tokio::{net::TcpListener, sync::watch};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Spaced-repetition scheduling cache")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "cadence.toml")]
  config: PathBuf,

  /// Print the argon2 hash for a password entered on stdin and exit.
  #[arg(long)]
  hash_password: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // Initialise tracing.
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  // Helper mode: hash a password and exit.
  if cli.hash_password {
    let password = rpassword_or_stdin()?;
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
      .hash_password(password.as_bytes(), &salt)
      .map_err(|e| anyhow::anyhow!("argon2 error: {e}"))?
      .to_string();
    println!("{hash}");
    return Ok(());
  }

  // Load configuration.
  let settings = config::Config::builder()
    .add_source(config::File::from(cli.config).required(false))
    .add_source(config::Environment::with_prefix("CADENCE").separator("__"))
    .build()
    .context("failed to read config file")?;

  let server_cfg: ServerConfig = settings
    .try_deserialize()
    .context("failed to deserialise ServerConfig")?;

  let store_path = expand_tilde(&server_cfg.store_path);
  let store = SqliteStore::open(&store_path)
    .await
    .with_context(|| format!("failed to open store at {store_path:?}"))?;

  // Engine, persistence workers and scheduled jobs.
  let (jobs, rx) = queue::channel();
  let engine = Arc::new(
    Engine::builder(Arc::new(store), server_cfg.engine.clone(), Arc::new(jobs)).build(),
  );

  let (shutdown_tx, shutdown_rx) = watch::channel(false);
  let mut tasks = engine.persistence_worker().spawn_pool(
    Arc::new(rx),
    server_cfg.engine.worker_count,
    shutdown_rx.clone(),
  );
  tasks.extend(scheduler::spawn(engine.clone(), shutdown_rx));

  let state = AppState {
    engine,
    auth: Arc::new(AuthConfig {
      username:      server_cfg.operator_username.clone(),
      password_hash: server_cfg.operator_password_hash.clone(),
    }),
  };

  let app = cadence_server::router(state);
  let address = format!("{}:{}", server_cfg.host, server_cfg.port);

  tracing::info!("Listening on http://{address}");
  let listener = TcpListener::bind(&address)
    .await
    .with_context(|| format!("failed to bind {address}"))?;

  axum::serve(listener, app)
    .with_graceful_shutdown(async {
      if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
      }
      tracing::info!("shutdown signal received");
    })
    .await
    .context("server error")?;

  // Let workers drain what is queued and background jobs wind down.
  shutdown_tx.send(true).ok();
  for task in tasks {
    if let Err(e) = task.await {
      tracing::warn!(error = %e, "background task ended abnormally");
    }
  }
  tracing::info!("shut down cleanly");

  Ok(())
}

/// Read a password from stdin (no echo).
fn rpassword_or_stdin() -> anyhow::Result<String> {
  use std::io::{self, BufRead, Write};
  let stdin = io::stdin();
  print!("Password: ");
  io::stdout().flush().ok();
  let mut line = String::new();
  stdin.lock().read_line(&mut line)?;
  Ok(
    line
      .trim_end_matches('\n')
      .trim_end_matches('\r')
      .to_string(),
  )
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
