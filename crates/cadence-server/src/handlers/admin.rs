//! Operator endpoints. Every handler takes an [`Operator`], so all of them
//! answer 401 without valid credentials.
//!
//! Destructive operations (`archive`, `purge`) and enabling auto-archive on a
//! live partition take `?confirm=true`; without it they answer 409.

use axum::{
  Json,
  extract::{Path, Query, State},
  http::StatusCode,
  response::IntoResponse,
};
use cadence_core::{
  partition::{ArchiveRun, NewPartition, PartitionEntity, PartitionFlags},
  review::PersistFailure,
  store::ReviewStore,
};
use cadence_engine::{
  CacheStatus,
  archive::{ArchiveStatus, AutoArchiveSummary},
  reconcile::ReconcileReport,
};
use serde::Deserialize;
use serde_json::json;

use crate::{AppState, auth::Operator, error::ApiError};

#[derive(Debug, Default, Deserialize)]
pub struct Confirm {
  #[serde(default)]
  pub confirm: bool,
}

// ─── Partitions ──────────────────────────────────────────────────────────────

/// `GET /admin/partitions`
pub async fn list_partitions<S>(
  _: Operator,
  State(state): State<AppState<S>>,
) -> Result<Json<Vec<PartitionEntity>>, ApiError>
where
  S: ReviewStore + 'static,
{
  Ok(Json(state.engine.list_partitions().await?))
}

/// `POST /admin/partitions[?confirm=true]`
pub async fn create_partition<S>(
  _: Operator,
  State(state): State<AppState<S>>,
  Query(q): Query<Confirm>,
  Json(body): Json<NewPartition>,
) -> Result<(StatusCode, Json<PartitionEntity>), ApiError>
where
  S: ReviewStore + 'static,
{
  let entity = state.engine.create_partition(body, q.confirm).await?;
  Ok((StatusCode::CREATED, Json(entity)))
}

/// `PATCH /admin/partitions/{key}[?confirm=true]`
pub async fn update_partition<S>(
  _: Operator,
  State(state): State<AppState<S>>,
  Path(key): Path<String>,
  Query(q): Query<Confirm>,
  Json(flags): Json<PartitionFlags>,
) -> Result<Json<PartitionEntity>, ApiError>
where
  S: ReviewStore + 'static,
{
  Ok(Json(state.engine.update_partition(&key, flags, q.confirm).await?))
}

// ─── Cache ───────────────────────────────────────────────────────────────────

/// `GET /admin/cache/{partition}`
pub async fn cache_status<S>(
  _: Operator,
  State(state): State<AppState<S>>,
  Path(partition): Path<String>,
) -> Result<Json<CacheStatus>, ApiError>
where
  S: ReviewStore + 'static,
{
  Ok(Json(state.engine.cache_status(&partition).await?))
}

/// `POST /admin/cache/{partition}/rebuild`. Runs in the background; poll
/// the cache status for progress.
pub async fn rebuild_cache<S>(
  _: Operator,
  State(state): State<AppState<S>>,
  Path(partition): Path<String>,
) -> impl IntoResponse
where
  S: ReviewStore + 'static,
{
  let engine = state.engine.clone();
  let key = partition.clone();
  tokio::spawn(async move {
    if let Err(e) = engine.rebuild_cache(&key).await {
      tracing::warn!(partition_key = %key, error = %e, "cache rebuild did not run to completion");
    }
  });
  (
    StatusCode::ACCEPTED,
    Json(json!({ "partition_key": partition, "state": "running" })),
  )
}

#[derive(Debug, Deserialize)]
pub struct ReconcileParams {
  pub sample_size: Option<usize>,
}

/// `POST /admin/reconcile[?sample_size=N]`
pub async fn reconcile<S>(
  _: Operator,
  State(state): State<AppState<S>>,
  Query(params): Query<ReconcileParams>,
) -> Result<Json<ReconcileReport>, ApiError>
where
  S: ReviewStore + 'static,
{
  Ok(Json(state.engine.trigger_reconciliation(params.sample_size).await?))
}

// ─── Archival ────────────────────────────────────────────────────────────────

/// `POST /admin/archive/{partition}?confirm=true`
pub async fn archive<S>(
  _: Operator,
  State(state): State<AppState<S>>,
  Path(partition): Path<String>,
  Query(q): Query<Confirm>,
) -> Result<Json<ArchiveRun>, ApiError>
where
  S: ReviewStore + 'static,
{
  Ok(Json(state.engine.archive_partition(&partition, q.confirm).await?))
}

/// `GET /admin/archive/{partition}`
pub async fn archive_status<S>(
  _: Operator,
  State(state): State<AppState<S>>,
  Path(partition): Path<String>,
) -> Result<Json<ArchiveStatus>, ApiError>
where
  S: ReviewStore + 'static,
{
  Ok(Json(state.engine.archive_status(&partition).await?))
}

/// `POST /admin/auto-archive`
pub async fn auto_archive<S>(
  _: Operator,
  State(state): State<AppState<S>>,
) -> Result<Json<AutoArchiveSummary>, ApiError>
where
  S: ReviewStore + 'static,
{
  Ok(Json(state.engine.process_auto_archive().await?))
}

/// `POST /admin/archives/flag`
pub async fn flag_archives<S>(
  _: Operator,
  State(state): State<AppState<S>>,
) -> Result<impl IntoResponse, ApiError>
where
  S: ReviewStore + 'static,
{
  let flagged = state.engine.flag_for_deletion().await?;
  Ok(Json(json!({ "flagged": flagged })))
}

/// `POST /admin/archives/purge?confirm=true`
pub async fn purge_archives<S>(
  _: Operator,
  State(state): State<AppState<S>>,
  Query(q): Query<Confirm>,
) -> Result<impl IntoResponse, ApiError>
where
  S: ReviewStore + 'static,
{
  let purged = state.engine.purge_flagged_archives(q.confirm).await?;
  Ok(Json(json!({ "purged": purged })))
}

// ─── Failures ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct FailureParams {
  pub limit: Option<usize>,
}

/// `GET /admin/failures[?limit=N]`
pub async fn failures<S>(
  _: Operator,
  State(state): State<AppState<S>>,
  Query(params): Query<FailureParams>,
) -> Result<Json<Vec<PersistFailure>>, ApiError>
where
  S: ReviewStore + 'static,
{
  Ok(Json(state.engine.persist_failures(params.limit.unwrap_or(100)).await?))
}
