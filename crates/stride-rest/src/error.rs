//! Error type for `stride-rest`.

use reqwest::{Method, StatusCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("http error: {0}")]
  Http(#[from] reqwest::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  /// The platform answered with a non-success status.
  #[error("{method} {path} → {status}: {body}")]
  Status {
    method: Method,
    path:   String,
    status: StatusCode,
    body:   String,
  },

  #[error("not signed in")]
  NotSignedIn,

  #[error("session expired and no refresh token is available")]
  SessionExpired,

  /// A write asked for its row back but the response held none.
  #[error("{0} returned no rows")]
  NoRows(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
