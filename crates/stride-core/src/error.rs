//! Error types for `stride-core`.

use thiserror::Error;

/// A row or payload did not match the schema the client expects.
#[derive(Debug, Error)]
pub enum Error {
  #[error("malformed {what}: {source}")]
  Malformed {
    what:   &'static str,
    #[source]
    source: serde_json::Error,
  },

  #[error("missing field `{0}`")]
  MissingField(&'static str),

  #[error("field `{field}` has unexpected value {value}")]
  UnexpectedValue {
    field: &'static str,
    value: serde_json::Value,
  },

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
