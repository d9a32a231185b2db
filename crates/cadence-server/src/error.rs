//! API error type and [`axum::response::IntoResponse`] implementation.

use std::time::Duration;

use axum::{
  Json,
  http::{HeaderValue, StatusCode, header},
  response::{IntoResponse, Response},
};
use cadence_engine::Error as EngineError;
use serde_json::json;
use thiserror::Error;

/// An error returned by a handler.
#[derive(Debug, Error)]
pub enum ApiError {
  #[error("unauthorized")]
  Unauthorized,

  #[error("bad request: {0}")]
  BadRequest(String),

  #[error("not found: {0}")]
  NotFound(String),

  #[error("conflict: {0}")]
  Conflict(String),

  /// Degraded-mode throttle; tells the caller when to come back.
  #[error("too many requests; retry later")]
  RateLimited { retry_after: Duration },

  #[error("service unavailable: {0}")]
  Unavailable(String),

  #[error("internal error: {0}")]
  Internal(String),
}

impl From<EngineError> for ApiError {
  fn from(e: EngineError) -> Self {
    match e {
      EngineError::Invalid(e) => ApiError::BadRequest(e.to_string()),
      EngineError::RateLimited { retry_after } => ApiError::RateLimited { retry_after },
      EngineError::Unavailable(m) => ApiError::Unavailable(m),
      EngineError::Cache(e) => ApiError::Unavailable(e.to_string()),
      EngineError::PartitionNotFound(_) => ApiError::NotFound(e.to_string()),
      EngineError::ConfirmationRequired
      | EngineError::ActivePartition(_)
      | EngineError::PartitionExists(_)
      | EngineError::PartitionArchived(_)
      | EngineError::ArchiveInProgress(_)
      | EngineError::RebuildInProgress(_) => ApiError::Conflict(e.to_string()),
      EngineError::Store(_) => ApiError::Internal(e.to_string()),
    }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let (status, message) = match &self {
      ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
      ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
      ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
      ApiError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),
      ApiError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
      ApiError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m.clone()),
      ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m.clone()),
    };
    let mut res = (status, Json(json!({ "error": message }))).into_response();

    match self {
      ApiError::Unauthorized => {
        res.headers_mut().insert(
          header::WWW_AUTHENTICATE,
          HeaderValue::from_static("Basic realm=\"cadence\""),
        );
      }
      ApiError::RateLimited { retry_after } => {
        // Round up; a zero would invite an immediate retry.
        let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
        res
          .headers_mut()
          .insert(header::RETRY_AFTER, HeaderValue::from(secs.max(1)));
      }
      _ => {}
    }
    res
  }
}
