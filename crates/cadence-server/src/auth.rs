//! HTTP Basic auth for the administrative routes.

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use axum::{
  extract::FromRequestParts,
  http::{HeaderMap, request::Parts},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use cadence_core::store::ReviewStore;

use crate::{AppState, error::ApiError};

/// The operator account allowed onto `/admin`.
#[derive(Clone)]
pub struct AuthConfig {
  pub username:      String,
  /// PHC string produced by argon2, e.g. `$argon2id$v=19$…`
  pub password_hash: String,
}

/// Present in a handler's arguments means the caller is the operator.
pub struct Operator;

pub fn verify_auth(headers: &HeaderMap, config: &AuthConfig) -> Result<(), ApiError> {
  let header_val = headers
    .get(axum::http::header::AUTHORIZATION)
    .and_then(|v| v.to_str().ok())
    .ok_or(ApiError::Unauthorized)?;

  let encoded = header_val
    .strip_prefix("Basic ")
    .ok_or(ApiError::Unauthorized)?;

  let decoded = B64.decode(encoded).map_err(|_| ApiError::Unauthorized)?;
  let creds = std::str::from_utf8(&decoded).map_err(|_| ApiError::Unauthorized)?;
  let (username, password) = creds.split_once(':').ok_or(ApiError::Unauthorized)?;

  if username != config.username {
    return Err(ApiError::Unauthorized);
  }

  let parsed_hash = PasswordHash::new(&config.password_hash).map_err(|e| {
    tracing::error!(error = %e, "operator password hash is not a valid PHC string");
    ApiError::Unauthorized
  })?;

  Argon2::default()
    .verify_password(password.as_bytes(), &parsed_hash)
    .map_err(|_| ApiError::Unauthorized)
}

impl<S> FromRequestParts<AppState<S>> for Operator
where
  S: ReviewStore + 'static,
{
  type Rejection = ApiError;

  async fn from_request_parts(
    parts: &mut Parts,
    state: &AppState<S>,
  ) -> Result<Self, Self::Rejection> {
    verify_auth(&parts.headers, &state.auth)?;
    Ok(Operator)
  }
}

#[cfg(test)]
mod tests {
  use argon2::{PasswordHasher, password_hash::SaltString};
  use axum::http::header;
  use rand_core::OsRng;

  use super::*;

  fn config(password: &str) -> AuthConfig {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
      .hash_password(password.as_bytes(), &salt)
      .unwrap()
      .to_string();
    AuthConfig {
      username:      "ops".to_string(),
      password_hash: hash,
    }
  }

  fn headers(value: &str) -> HeaderMap {
    let mut map = HeaderMap::new();
    map.insert(header::AUTHORIZATION, value.parse().unwrap());
    map
  }

  fn basic(user: &str, pass: &str) -> String {
    format!("Basic {}", B64.encode(format!("{user}:{pass}")))
  }

  #[test]
  fn correct_credentials() {
    let cfg = config("secret");
    assert!(verify_auth(&headers(&basic("ops", "secret")), &cfg).is_ok());
  }

  #[test]
  fn wrong_password_or_user() {
    let cfg = config("secret");
    assert!(matches!(
      verify_auth(&headers(&basic("ops", "wrong")), &cfg),
      Err(ApiError::Unauthorized)
    ));
    assert!(matches!(
      verify_auth(&headers(&basic("root", "secret")), &cfg),
      Err(ApiError::Unauthorized)
    ));
  }

  #[test]
  fn missing_or_malformed_header() {
    let cfg = config("secret");
    assert!(verify_auth(&HeaderMap::new(), &cfg).is_err());
    assert!(verify_auth(&headers("Basic !!!not-base64!!!"), &cfg).is_err());
    assert!(verify_auth(&headers("Bearer token"), &cfg).is_err());
  }
}
