//! HTTP surface for the cadence engine.
//!
//! Exposes an axum [`Router`] over an [`Engine`] backed by any
//! [`ReviewStore`]. Review traffic (`/due`, `/submit`, `/hooks`) comes from
//! the API gateway and content layer and is not authenticated here; every
//! `/admin` route requires the operator's HTTP Basic credentials.

pub mod auth;
pub mod error;
pub mod handlers;

pub use error::ApiError;

use std::{path::PathBuf, sync::Arc};

use axum::{
  Router,
  routing::{get, patch, post},
};
use cadence_core::store::ReviewStore;
use cadence_engine::{Engine, EngineConfig};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use auth::AuthConfig;
use handlers::{admin, reviews};

// ─── Configuration ────────────────────────────────────────────────────────────

/// Runtime server configuration, deserialised from `cadence.toml` and
/// `CADENCE__*` environment variables.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
  #[serde(default = "default_host")]
  pub host:                   String,
  #[serde(default = "default_port")]
  pub port:                   u16,
  pub store_path:             PathBuf,
  pub operator_username:      String,
  pub operator_password_hash: String,
  #[serde(default)]
  pub engine:                 EngineConfig,
}

fn default_host() -> String { "127.0.0.1".to_string() }

fn default_port() -> u16 { 8080 }

// ─── Application state ────────────────────────────────────────────────────────

/// Shared state threaded through all axum handlers.
pub struct AppState<S> {
  pub engine: Arc<Engine<S>>,
  pub auth:   Arc<AuthConfig>,
}

impl<S> Clone for AppState<S> {
  fn clone(&self) -> Self {
    Self {
      engine: self.engine.clone(),
      auth:   self.auth.clone(),
    }
  }
}

// ─── Router ───────────────────────────────────────────────────────────────────

/// Build an axum [`Router`] for the cadence server.
pub fn router<S>(state: AppState<S>) -> Router
where
  S: ReviewStore + 'static,
{
  Router::new()
    .route("/due/{owner}/{partition}",          get(reviews::due::<S>))
    .route("/submit/{owner}/{partition}",       post(reviews::submit::<S>))
    .route("/hooks/partition-created",          post(reviews::partition_created::<S>))
    .route(
      "/admin/partitions",
      get(admin::list_partitions::<S>).post(admin::create_partition::<S>),
    )
    .route("/admin/partitions/{key}",           patch(admin::update_partition::<S>))
    .route("/admin/cache/{partition}",          get(admin::cache_status::<S>))
    .route("/admin/cache/{partition}/rebuild",  post(admin::rebuild_cache::<S>))
    .route("/admin/reconcile",                  post(admin::reconcile::<S>))
    .route(
      "/admin/archive/{partition}",
      get(admin::archive_status::<S>).post(admin::archive::<S>),
    )
    .route("/admin/auto-archive",               post(admin::auto_archive::<S>))
    .route("/admin/archives/flag",              post(admin::flag_archives::<S>))
    .route("/admin/archives/purge",             post(admin::purge_archives::<S>))
    .route("/admin/failures",                   get(admin::failures::<S>))
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

// ─── Tests ────────────────────────────────────────────────────────────────────
