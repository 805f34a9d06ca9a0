//! Row-change payloads delivered by the realtime transport, and the typed
//! events the chat core derives from them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
  message::{Message, MessageId},
  query::Filter,
};

/// The row operation that produced a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
  Insert,
  Update,
  Delete,
}

/// A raw, untyped row-change notification as it comes off the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
  #[serde(rename = "type")]
  pub kind:             ChangeKind,
  pub table:            String,
  /// The new row for inserts and updates; `null` for deletes.
  #[serde(default)]
  pub record:           Value,
  /// The previous row for updates and deletes. Depending on the table's
  /// replica identity this may only carry the primary key.
  #[serde(default)]
  pub old_record:       Value,
  #[serde(default)]
  pub commit_timestamp: Option<DateTime<Utc>>,
}

impl RawChange {
  /// The row a filter should be evaluated against: the new row when there is
  /// one, otherwise the old row.
  pub fn filter_target(&self) -> &Value {
    if self.record.is_null() { &self.old_record } else { &self.record }
  }
}

/// The normalised form of a [`RawChange`] for the `messages` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
  Insert(Message),
  Update(Message),
  Delete(MessageId),
}

impl ChangeEvent {
  pub fn message_id(&self) -> MessageId {
    match self {
      Self::Insert(m) | Self::Update(m) => m.id,
      Self::Delete(id) => *id,
    }
  }
}

// ─── Listener registration ───────────────────────────────────────────────────

/// What a channel listener wants to hear about.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeFilter {
  pub event:  ChangeKind,
  pub table:  String,
  /// Optional row filter, enforced by the transport when it can.
  pub filter: Option<Filter>,
}

impl ChangeFilter {
  /// True if `change` is for this table and event kind, ignoring the row
  /// filter.
  pub fn selects(&self, change: &RawChange) -> bool {
    self.event == change.kind && self.table == change.table
  }

  /// True if `change` passes the row filter (or there is none).
  pub fn admits(&self, change: &RawChange) -> bool {
    self
      .filter
      .as_ref()
      .is_none_or(|f| f.matches(change.filter_target()))
  }
}

/// Handle identifying one listener registered on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

/// Callback invoked with every raw change a listener receives.
pub type ChangeListener = Arc<dyn Fn(RawChange) + Send + Sync>;

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn delete_change() -> RawChange {
    RawChange {
      kind:             ChangeKind::Delete,
      table:            "messages".into(),
      record:           Value::Null,
      old_record:       json!({ "id": 4, "conversation_id": 9 }),
      commit_timestamp: None,
    }
  }

  #[test]
  fn delete_filters_against_old_record() {
    let change = delete_change();
    let filter = ChangeFilter {
      event:  ChangeKind::Delete,
      table:  "messages".into(),
      filter: Some(Filter::eq("conversation_id", 9)),
    };
    assert!(filter.selects(&change));
    assert!(filter.admits(&change));
  }

  #[test]
  fn wrong_event_is_not_selected() {
    let filter = ChangeFilter {
      event:  ChangeKind::Insert,
      table:  "messages".into(),
      filter: None,
    };
    assert!(!filter.selects(&delete_change()));
  }

  #[test]
  fn raw_change_wire_shape() {
    let raw: RawChange = serde_json::from_value(json!({
      "type": "INSERT",
      "table": "messages",
      "record": { "id": 1 },
      "commit_timestamp": "2024-05-01T07:30:00Z"
    }))
    .unwrap();
    assert_eq!(raw.kind, ChangeKind::Insert);
    assert!(raw.old_record.is_null());
    assert!(raw.commit_timestamp.is_some());
  }

  #[test]
  fn events_name_the_message_they_touch() {
    let message = Message::from_row(json!({
      "id": 7,
      "conversation_id": 9,
      "author_id": "6f1c2b3e-2f9a-4d0e-9a4e-0d7c1e2b3a4f",
      "kind": "text",
      "body": "hi",
      "created_at": "2024-05-01T07:30:00+00:00"
    }))
    .unwrap();
    assert_eq!(ChangeEvent::Insert(message.clone()).message_id(), 7);
    assert_eq!(ChangeEvent::Update(message).message_id(), 7);
    assert_eq!(ChangeEvent::Delete(4).message_id(), 4);
  }
}
