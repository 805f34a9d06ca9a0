//! Wire contract between the chat core and the hosted platform: table and
//! column names, stored procedures, storage keys and realtime topics.

use serde_json::{Value, json};
use stride_core::{
  change::{ChangeFilter, ChangeKind},
  message::{AttachmentMeta, ConversationId, MessageId, MessageKind, UserId, row_i64},
  query::{Filter, Query},
};

use crate::Result;

pub const COL_ID: &str = "id";
pub const COL_CONVERSATION_ID: &str = "conversation_id";

pub const RPC_SEND_MESSAGE: &str = "send_message";
pub const RPC_MARK_READ: &str = "mark_conversation_read";
pub const RPC_START_DIRECT: &str = "start_direct_conversation";

// ─── Queries ─────────────────────────────────────────────────────────────────

/// The newest `page_size` messages, newest first.
pub fn newest_page(table: &str, conversation_id: ConversationId, page_size: usize) -> Query {
  Query::table(table)
    .eq(COL_CONVERSATION_ID, conversation_id)
    .order(COL_ID, false)
    .limit(page_size)
}

/// Up to `page_size` messages older than `before`, newest first.
pub fn older_page(
  table: &str,
  conversation_id: ConversationId,
  before: MessageId,
  page_size: usize,
) -> Query {
  Query::table(table)
    .eq(COL_CONVERSATION_ID, conversation_id)
    .lt(COL_ID, before)
    .order(COL_ID, false)
    .limit(page_size)
}

pub fn by_id(id: MessageId) -> Vec<Filter> { vec![Filter::eq(COL_ID, id)] }

// ─── Stored procedures ───────────────────────────────────────────────────────

pub fn send_message_params(conversation_id: ConversationId, body: &str) -> Value {
  json!({ "p_conversation_id": conversation_id, "p_body": body })
}

pub fn mark_read_params(conversation_id: ConversationId, message_id: MessageId) -> Value {
  json!({ "p_conversation_id": conversation_id, "p_message_id": message_id })
}

pub fn start_direct_params(other_user_id: UserId) -> Value {
  json!({ "p_other_user_id": other_user_id })
}

/// Read an id returned by a stored procedure, which may be a bare integer or
/// a row carrying an `id` column.
pub fn returned_id(value: &Value) -> Result<i64> {
  if let Some(id) = value.as_i64() {
    return Ok(id);
  }
  let row = match value {
    Value::Array(rows) => rows.first().unwrap_or(&Value::Null),
    other => other,
  };
  Ok(row_i64(row, COL_ID)?)
}

// ─── Attachments ─────────────────────────────────────────────────────────────

pub fn placeholder_row(
  conversation_id: ConversationId,
  author_id: UserId,
  kind: MessageKind,
) -> Value {
  json!({
    "conversation_id": conversation_id,
    "author_id": author_id,
    "kind": kind,
  })
}

/// Object key for an attachment payload.
pub fn attachment_key(conversation_id: ConversationId, message_id: MessageId) -> String {
  format!("{conversation_id}/{message_id}")
}

pub fn metadata_patch(meta: &AttachmentMeta) -> Result<Value> {
  Ok(json!({ "metadata": serde_json::to_value(meta).map_err(stride_core::Error::from)? }))
}

// ─── Realtime ────────────────────────────────────────────────────────────────

pub fn topic(conversation_id: ConversationId) -> String {
  format!("conversation:{conversation_id}")
}

/// One listener filter per change kind, all scoped to the conversation.
pub fn change_filters(table: &str, conversation_id: ConversationId) -> [ChangeFilter; 3] {
  [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete].map(|event| ChangeFilter {
    event,
    table: table.to_owned(),
    filter: Some(Filter::eq(COL_CONVERSATION_ID, conversation_id)),
  })
}
