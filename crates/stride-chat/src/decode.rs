//! Schema-checked decoding of raw realtime payloads.
//!
//! Decoding never panics and never trusts the transport's row filter: a
//! payload for another table or conversation decodes to `None` and is
//! ignored by the caller.

use stride_core::{
  change::{ChangeEvent, ChangeKind, RawChange},
  message::{ConversationId, Message, row_i64},
};

use crate::remote::{COL_CONVERSATION_ID, COL_ID};

/// Turn a raw change into a typed event for `conversation_id`.
///
/// Returns `Ok(None)` when the change is well-formed but not for this
/// table/conversation.
pub fn decode_change(
  table: &str,
  conversation_id: ConversationId,
  raw: RawChange,
) -> stride_core::Result<Option<ChangeEvent>> {
  if raw.table != table {
    return Ok(None);
  }

  match raw.kind {
    ChangeKind::Insert | ChangeKind::Update => {
      let message = Message::from_row(raw.record)?;
      if message.conversation_id != conversation_id {
        return Ok(None);
      }
      Ok(Some(if raw.kind == ChangeKind::Insert {
        ChangeEvent::Insert(message)
      } else {
        ChangeEvent::Update(message)
      }))
    }
    ChangeKind::Delete => {
      let id = row_i64(&raw.old_record, COL_ID)?;
      // The old row only carries the conversation when the table publishes
      // full replica identity; ids are globally unique either way.
      if let Ok(owner) = row_i64(&raw.old_record, COL_CONVERSATION_ID)
        && owner != conversation_id
      {
        return Ok(None);
      }
      Ok(Some(ChangeEvent::Delete(id)))
    }
  }
}
