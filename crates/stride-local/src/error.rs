//! Error type for `stride-local`.

use stride_core::message::{ConversationId, UserId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] stride_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  /// Rows and patches must be JSON objects.
  #[error("expected a JSON object for {0}")]
  NotAnObject(&'static str),

  #[error("not signed in")]
  NotSignedIn,

  #[error("invalid or revoked access token")]
  InvalidToken,

  #[error("unknown function: {0}")]
  UnknownFunction(String),

  #[error("missing or invalid parameter {0}")]
  InvalidParam(&'static str),

  #[error("user {user_id} is not a member of conversation {conversation_id}")]
  NotAMember {
    conversation_id: ConversationId,
    user_id:         UserId,
  },

  #[error("object already exists: {bucket}/{key}")]
  ObjectExists { bucket: String, key: String },

  #[error("object not found: {bucket}/{key}")]
  ObjectNotFound { bucket: String, key: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
