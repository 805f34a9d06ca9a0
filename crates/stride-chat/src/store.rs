//! The ordered, deduplicated message list of one
//! conversation.
//!
//! Entries are kept strictly ascending by id. Ids are server-assigned and
//! monotonic, so id order stands in for causal order regardless of the order
//! realtime events arrive in.

use stride_core::message::{ConversationId, Message, MessageId};

/// What [`MessageStore::upsert`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
  Inserted,
  Replaced,
  /// An identical entry was already present.
  Unchanged,
  /// The message belongs to a different conversation.
  Rejected,
}

impl Upsert {
  pub fn changed(self) -> bool { matches!(self, Self::Inserted | Self::Replaced) }
}

#[derive(Debug, Clone)]
pub struct MessageStore {
  conversation_id: ConversationId,
  messages:        Vec<Message>,
}

impl MessageStore {
  pub fn new(conversation_id: ConversationId) -> Self {
    Self { conversation_id, messages: Vec::new() }
  }

  pub fn conversation_id(&self) -> ConversationId { self.conversation_id }

  /// Insert `message`, or replace the entry with the same id if it differs.
  pub fn upsert(&mut self, message: Message) -> Upsert {
    if message.conversation_id != self.conversation_id {
      return Upsert::Rejected;
    }
    match self.position(message.id) {
      Ok(i) if self.messages[i] == message => Upsert::Unchanged,
      Ok(i) => {
        self.messages[i] = message;
        Upsert::Replaced
      }
      Err(i) => {
        self.messages.insert(i, message);
        Upsert::Inserted
      }
    }
  }

  /// Remove the entry with `id`; returns it if it was present.
  pub fn remove(&mut self, id: MessageId) -> Option<Message> {
    self.position(id).ok().map(|i| self.messages.remove(i))
  }

  /// Add the messages of an older page that are not already present.
  /// Entries already in the store are left untouched: they are at least as
  /// fresh as the page. Returns the number of messages added.
  pub fn merge_page(&mut self, page: impl IntoIterator<Item = Message>) -> usize {
    let mut added = 0;
    for message in page {
      if message.conversation_id != self.conversation_id {
        continue;
      }
      if let Err(i) = self.position(message.id) {
        self.messages.insert(i, message);
        added += 1;
      }
    }
    added
  }

  pub fn get(&self, id: MessageId) -> Option<&Message> {
    self.position(id).ok().map(|i| &self.messages[i])
  }

  pub fn contains(&self, id: MessageId) -> bool { self.position(id).is_ok() }

  pub fn first_id(&self) -> Option<MessageId> { self.messages.first().map(|m| m.id) }

  pub fn last(&self) -> Option<&Message> { self.messages.last() }

  pub fn len(&self) -> usize { self.messages.len() }

  pub fn is_empty(&self) -> bool { self.messages.is_empty() }

  pub fn clear(&mut self) { self.messages.clear(); }

  /// Messages in ascending id order.
  pub fn messages(&self) -> &[Message] { &self.messages }

  pub fn ids(&self) -> Vec<MessageId> { self.messages.iter().map(|m| m.id).collect() }

  fn position(&self, id: MessageId) -> Result<usize, usize> {
    self.messages.binary_search_by_key(&id, |m| m.id)
  }
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeSet;

  use chrono::{TimeZone, Utc};
  use stride_core::message::MessageKind;
  use uuid::Uuid;

  use super::*;

  fn msg(id: MessageId, body: &str) -> Message {
    Message {
      id,
      conversation_id: 1,
      author_id: Uuid::nil(),
      kind: MessageKind::Text,
      body: Some(body.into()),
      created_at: Utc.timestamp_opt(1_700_000_000 + id, 0).unwrap(),
      edited_at: None,
      deleted_at: None,
      metadata: None,
    }
  }

  #[test]
  fn out_of_order_inserts_are_sorted() {
    let mut s = MessageStore::new(1);
    assert_eq!(s.upsert(msg(5, "b")), Upsert::Inserted);
    assert_eq!(s.upsert(msg(3, "a")), Upsert::Inserted);
    assert_eq!(s.ids(), vec![3, 5]);
  }

  #[test]
  fn duplicate_insert_is_idempotent() {
    let mut s = MessageStore::new(1);
    s.upsert(msg(7, "x"));
    let before = s.messages().to_vec();
    assert_eq!(s.upsert(msg(7, "x")), Upsert::Unchanged);
    assert_eq!(s.messages(), before.as_slice());
  }

  #[test]
  fn differing_entry_is_replaced() {
    let mut s = MessageStore::new(1);
    s.upsert(msg(7, "x"));
    let mut edited = msg(7, "x (edited)");
    edited.edited_at = Some(Utc::now());
    assert_eq!(s.upsert(edited), Upsert::Replaced);
    assert_eq!(s.len(), 1);
    assert_eq!(s.get(7).unwrap().body.as_deref(), Some("x (edited)"));
  }

  #[test]
  fn update_before_insert_creates_then_insert_is_harmless() {
    let mut s = MessageStore::new(1);
    let mut updated = msg(9, "v2");
    updated.edited_at = Some(Utc.timestamp_opt(1_800_000_000, 0).unwrap());
    assert_eq!(s.upsert(updated.clone()), Upsert::Inserted);
    // A late duplicate of the original insert is just another upsert.
    s.upsert(msg(9, "v1"));
    s.upsert(updated.clone());
    assert_eq!(s.get(9), Some(&updated));
    assert_eq!(s.len(), 1);
  }

  #[test]
  fn remove_present_and_absent() {
    let mut s = MessageStore::new(1);
    s.upsert(msg(7, "x"));
    assert!(s.remove(7).is_some());
    assert!(s.remove(7).is_none());
    assert!(s.is_empty());
  }

  #[test]
  fn foreign_conversation_is_rejected() {
    let mut s = MessageStore::new(1);
    let mut m = msg(2, "elsewhere");
    m.conversation_id = 99;
    assert_eq!(s.upsert(m.clone()), Upsert::Rejected);
    assert_eq!(s.merge_page([m]), 0);
    assert!(s.is_empty());
  }

  #[test]
  fn merge_page_skips_existing() {
    let mut s = MessageStore::new(1);
    s.upsert(msg(10, "fresh"));
    let added = s.merge_page([msg(8, "a"), msg(9, "b"), msg(10, "stale")]);
    assert_eq!(added, 2);
    assert_eq!(s.ids(), vec![8, 9, 10]);
    assert_eq!(s.get(10).unwrap().body.as_deref(), Some("fresh"));
    assert_eq!(s.first_id(), Some(8));
  }

  /// Pseudo-random op sequences: the store must stay strictly ascending,
  /// duplicate-free, and hold exactly the ids inserted and not removed.
  #[test]
  fn random_op_sequences_keep_invariants() {
    let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
    let mut next = move || {
      seed ^= seed << 13;
      seed ^= seed >> 7;
      seed ^= seed << 17;
      seed
    };

    for _ in 0..50 {
      let mut s = MessageStore::new(1);
      let mut expected = BTreeSet::new();
      for _ in 0..200 {
        let id = (next() % 40) as MessageId;
        if next() % 3 == 0 {
          s.remove(id);
          expected.remove(&id);
        } else {
          s.upsert(msg(id, if next() % 2 == 0 { "a" } else { "b" }));
          expected.insert(id);
        }
        let ids = s.ids();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
      }
      assert_eq!(s.ids(), expected.into_iter().collect::<Vec<_>>());
    }
  }
}
