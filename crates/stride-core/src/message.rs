//! Message rows, the unit of conversation history.
//!
//! Ids are assigned by the hosted database at insert time and increase
//! monotonically, so id order doubles as display order. A message is never
//! mutated in place by the client; edits and deletes arrive as replacement
//! rows carrying `edited_at` / `deleted_at`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{Error, Result};

/// Server-assigned message id.
pub type MessageId = i64;

/// Identifies the conversation a message belongs to.
pub type ConversationId = i64;

/// Opaque user identifier issued by the auth service.
pub type UserId = Uuid;

// ─── Kind ────────────────────────────────────────────────────────────────────

/// Determines how a message renders and how `body` is interpreted.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
  #[default]
  Text,
  Image,
  File,
  /// Any kind this client does not know how to render.
  #[serde(other)]
  Other,
}

impl MessageKind {
  /// Pick the attachment kind for an uploaded payload.
  pub fn for_content_type(content_type: &str) -> Self {
    if content_type.starts_with("image/") {
      Self::Image
    } else {
      Self::File
    }
  }

  pub fn is_attachment(self) -> bool { matches!(self, Self::Image | Self::File) }
}

// ─── Attachment metadata ─────────────────────────────────────────────────────

/// Describes the stored object behind an image or file message. Written by
/// the sender after the upload completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMeta {
  /// Object key inside the attachment bucket.
  pub path:      String,
  pub mime_type: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub width:     Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub height:    Option<u32>,
  /// Payload size in bytes.
  pub size:      u64,
}

// ─── Message ─────────────────────────────────────────────────────────────────

/// One row of the `messages` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
  pub id:              MessageId,
  pub conversation_id: ConversationId,
  pub author_id:       UserId,
  #[serde(default)]
  pub kind:            MessageKind,
  #[serde(default)]
  pub body:            Option<String>,
  pub created_at:      DateTime<Utc>,
  #[serde(default)]
  pub edited_at:       Option<DateTime<Utc>>,
  #[serde(default)]
  pub deleted_at:      Option<DateTime<Utc>>,
  #[serde(default)]
  pub metadata:        Option<AttachmentMeta>,
}

impl Message {
  /// Decode a loosely-typed row into a message.
  ///
  /// Text messages must carry a body unless they have been soft-deleted.
  pub fn from_row(row: Value) -> Result<Self> {
    let message: Message = serde_json::from_value(row)
      .map_err(|source| Error::Malformed { what: "message row", source })?;

    if message.kind == MessageKind::Text
      && message.body.is_none()
      && message.deleted_at.is_none()
    {
      return Err(Error::MissingField("body"));
    }

    Ok(message)
  }

  /// Decode every row, returning the messages that parsed and the errors for
  /// those that did not.
  pub fn from_rows(rows: Vec<Value>) -> (Vec<Self>, Vec<Error>) {
    let mut messages = Vec::with_capacity(rows.len());
    let mut errors = Vec::new();
    for row in rows {
      match Self::from_row(row) {
        Ok(m) => messages.push(m),
        Err(e) => errors.push(e),
      }
    }
    (messages, errors)
  }
}

// ─── Row helpers ─────────────────────────────────────────────────────────────

/// Read an integer column from a row. Accepts JSON numbers and numeric
/// strings (bigint columns are sometimes serialised as text).
pub fn row_i64(row: &Value, field: &'static str) -> Result<i64> {
  let value = row.get(field).ok_or(Error::MissingField(field))?;
  match value {
    Value::Number(n) => n.as_i64(),
    Value::String(s) => s.parse().ok(),
    _ => None,
  }
  .ok_or_else(|| Error::UnexpectedValue { field, value: value.clone() })
}
