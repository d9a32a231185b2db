//! Handlers called by the API gateway and the content layer.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `GET`  | `/due/{owner}/{partition}` | `?limit=&subject=&topic=` |
//! | `POST` | `/submit/{owner}/{partition}` | Body: `{"responses":[…],"idempotency_key":…}`; 202 |
//! | `POST` | `/hooks/partition-created` | Body: `{"partition_key":"…"}`; 204 |

use axum::{
  Json,
  extract::{Path, Query, State},
  http::StatusCode,
  response::IntoResponse,
};
use cadence_core::{
  review::{ClassificationFilter, ReviewResponse},
  store::ReviewStore,
};
use cadence_engine::{DueItems, Submission};
use serde::Deserialize;

use crate::{AppState, error::ApiError};

const DEFAULT_LIMIT: usize = 20;
const MAX_LIMIT: usize = 200;

// ─── Due items ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct DueParams {
  pub limit:   Option<usize>,
  pub subject: Option<String>,
  pub topic:   Option<String>,
}

/// `GET /due/{owner}/{partition}`
pub async fn due<S>(
  State(state): State<AppState<S>>,
  Path((owner, partition)): Path<(String, String)>,
  Query(params): Query<DueParams>,
) -> Result<Json<DueItems>, ApiError>
where
  S: ReviewStore + 'static,
{
  let limit = params.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
  let filter = ClassificationFilter {
    subject: params.subject,
    topic:   params.topic,
  };
  let due = state
    .engine
    .get_due(&owner, &partition, limit, (!filter.is_unrestricted()).then_some(&filter))
    .await?;
  Ok(Json(due))
}

// ─── Submit ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SubmitBody {
  pub responses:       Vec<ReviewResponse>,
  #[serde(default)]
  pub idempotency_key: Option<String>,
}

/// `POST /submit/{owner}/{partition}`
pub async fn submit<S>(
  State(state): State<AppState<S>>,
  Path((owner, partition)): Path<(String, String)>,
  Json(body): Json<SubmitBody>,
) -> Result<(StatusCode, Json<Submission>), ApiError>
where
  S: ReviewStore + 'static,
{
  let submission = state
    .engine
    .submit(&owner, &partition, body.responses, body.idempotency_key.as_deref())
    .await?;
  Ok((StatusCode::ACCEPTED, Json(submission)))
}

// ─── Lifecycle hook ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PartitionCreated {
  pub partition_key: String,
}

/// `POST /hooks/partition-created`
pub async fn partition_created<S>(
  State(state): State<AppState<S>>,
  Json(body): Json<PartitionCreated>,
) -> Result<impl IntoResponse, ApiError>
where
  S: ReviewStore + 'static,
{
  state.engine.on_partition_created(&body.partition_key).await?;
  Ok(StatusCode::NO_CONTENT)
}
