use std::sync::Arc;

use bytes::Bytes;
use serde_json::json;
use stride_core::{
  change::{ChangeEvent, ChangeKind, RawChange},
  message::{Message, MessageKind},
};
use tokio::sync::Semaphore;

use super::{
  CID, eventually,
  fake::{FakePlatform, message_row},
  fixture, fixture_with, settle, small_pages,
};
use crate::{Attachment, AttachmentStage, ChatConfig, Error, SubscriptionState};

fn count(fake: &FakePlatform, call: &str) -> usize {
  fake.calls().iter().filter(|c| *c == call).count()
}

fn seed_history(fake: &FakePlatform, ids: std::ops::RangeInclusive<i64>, author: uuid::Uuid) {
  for id in ids {
    fake.seed(id, CID, author, &format!("message {id}"));
  }
}

fn ids(view: &crate::ConversationView) -> Vec<i64> { view.messages.iter().map(|m| m.id).collect() }

// ─── Opening and paging ──────────────────────────────────────────────────────

#[tokio::test]
async fn short_first_page_has_no_older() {
  let f = fixture();
  seed_history(&f.fake, 1..=3, f.peer);

  let c = f.client.open(CID, f.me).await.unwrap();
  let view = c.snapshot();

  assert_eq!(ids(&view), vec![1, 2, 3]);
  assert!(!view.has_older);
  assert!(!view.loading);
  assert!(view.live);
  assert_eq!(view.error, None);
}

#[tokio::test]
async fn full_first_page_then_older_pages() {
  let f = fixture();
  seed_history(&f.fake, 1..=7, f.peer);

  let c = f.client.open(CID, f.me).await.unwrap();
  assert_eq!(ids(&c.snapshot()), vec![3, 4, 5, 6, 7]);
  assert!(c.snapshot().has_older);

  assert!(c.load_older().await.unwrap());
  let view = c.snapshot();
  assert_eq!(ids(&view), vec![1, 2, 3, 4, 5, 6, 7]);
  assert!(!view.has_older);

  // Nothing older: no request is made.
  let queries = count(&f.fake, "query");
  assert!(!c.load_older().await.unwrap());
  assert_eq!(count(&f.fake, "query"), queries);
}

#[tokio::test]
async fn exactly_one_page_reports_older_until_an_empty_page() {
  let f = fixture();
  seed_history(&f.fake, 1..=5, f.peer);

  let c = f.client.open(CID, f.me).await.unwrap();
  assert!(c.snapshot().has_older);

  assert!(c.load_older().await.unwrap());
  let view = c.snapshot();
  assert_eq!(ids(&view), vec![1, 2, 3, 4, 5]);
  assert!(!view.has_older);
}

#[tokio::test]
async fn older_page_skips_messages_already_present() {
  let f = fixture();
  seed_history(&f.fake, 1..=7, f.peer);
  let c = f.client.open(CID, f.me).await.unwrap();

  let early = Message::from_row(message_row(2, CID, f.peer, "message 2")).unwrap();
  c.apply_change(ChangeEvent::Insert(early)).await;
  assert_eq!(ids(&c.snapshot()), vec![2, 3, 4, 5, 6, 7]);

  c.load_older().await.unwrap();
  assert_eq!(ids(&c.snapshot()), vec![1, 2, 3, 4, 5, 6, 7]);
}

#[tokio::test]
async fn concurrent_older_loads_are_single_flight() {
  let f = fixture();
  seed_history(&f.fake, 1..=7, f.peer);
  let c = f.client.open(CID, f.me).await.unwrap();

  let gate = Arc::new(Semaphore::new(0));
  f.fake.state().query_gate = Some(Arc::clone(&gate));

  let second = async {
    eventually(|| f.fake.state().waiting == 1).await;
    assert!(c.snapshot().loading);
    let skipped = c.load_older().await;
    gate.add_permits(1);
    skipped
  };
  let (first, second) = tokio::join!(c.load_older(), second);

  assert!(first.unwrap());
  assert!(!second.unwrap());
  // First page plus exactly one older page.
  assert_eq!(count(&f.fake, "query"), 2);
  assert!(!c.snapshot().loading);
}

#[tokio::test]
async fn undecodable_full_page_still_pages_back() {
  let f = fixture();
  seed_history(&f.fake, 1..=3, f.peer);
  for id in 4..=8 {
    f.fake.state().rows.push(json!({ "id": id, "conversation_id": CID, "kind": "text" }));
  }

  let c = f.client.open(CID, f.me).await.unwrap();
  assert!(c.snapshot().messages.is_empty());
  assert!(c.snapshot().has_older);

  assert!(c.load_older().await.unwrap());
  let view = c.snapshot();
  assert_eq!(ids(&view), vec![1, 2, 3]);
  assert!(!view.has_older);
}

#[tokio::test]
async fn reloading_the_newest_page_keeps_the_older_bound() {
  let f = fixture();
  seed_history(&f.fake, 1..=12, f.peer);
  let c = f.client.open(CID, f.me).await.unwrap();
  assert!(c.load_older().await.unwrap());
  assert_eq!(ids(&c.snapshot()), (3..=12).collect::<Vec<_>>());

  assert!(c.load_first_page().await.unwrap());
  assert!(c.snapshot().has_older);
  assert!(c.load_older().await.unwrap());

  let view = c.snapshot();
  assert_eq!(ids(&view), (1..=12).collect::<Vec<_>>());
  assert!(!view.has_older);
}

#[tokio::test]
async fn failed_first_page_fails_open() {
  let f = fixture();
  f.fake.fail("query");

  let result = f.client.open(CID, f.me).await;
  assert!(matches!(result, Err(Error::Platform(_))));
}

#[tokio::test]
async fn failed_older_page_is_reported_and_retryable() {
  let f = fixture();
  seed_history(&f.fake, 1..=7, f.peer);
  let c = f.client.open(CID, f.me).await.unwrap();

  f.fake.fail("query");
  assert!(c.load_older().await.is_err());
  let view = c.snapshot();
  assert!(view.error.is_some());
  assert!(!view.loading);
  assert!(view.has_older);

  f.fake.heal("query");
  assert!(c.load_older().await.unwrap());
  assert_eq!(c.snapshot().error, None);
  assert_eq!(c.snapshot().messages.len(), 7);
}

// ─── Read receipts ───────────────────────────────────────────────────────────

#[tokio::test]
async fn opening_marks_peer_message_read() {
  let f = fixture();
  seed_history(&f.fake, 1..=2, f.peer);

  let _c = f.client.open(CID, f.me).await.unwrap();
  eventually(|| count(&f.fake, "rpc:mark_conversation_read") == 1).await;
}

#[tokio::test]
async fn opening_on_own_message_does_not_mark_read() {
  let f = fixture();
  seed_history(&f.fake, 1..=2, f.me);

  let _c = f.client.open(CID, f.me).await.unwrap();
  settle().await;
  assert_eq!(count(&f.fake, "rpc:mark_conversation_read"), 0);
}

#[tokio::test]
async fn mark_read_only_moves_forward() {
  let f = fixture();
  let c = f.client.open(CID, f.me).await.unwrap();

  f.fake.emit_insert(message_row(5, CID, f.peer, "later"));
  f.fake.emit_insert(message_row(3, CID, f.peer, "earlier"));
  eventually(|| ids(&c.snapshot()) == vec![3, 5]).await;
  settle().await;

  assert_eq!(count(&f.fake, "rpc:mark_conversation_read"), 1);
}

#[tokio::test]
async fn failed_mark_read_is_not_surfaced() {
  let f = fixture();
  let c = f.client.open(CID, f.me).await.unwrap();
  f.fake.fail("rpc");

  f.fake.emit_insert(message_row(1, CID, f.peer, "hi"));
  eventually(|| c.snapshot().messages.len() == 1).await;
  settle().await;
  assert_eq!(c.snapshot().error, None);
}

// ─── Realtime ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn opening_subscribes_after_auth() {
  let f = fixture();
  let c = f.client.open(CID, f.me).await.unwrap();

  let calls = f.fake.calls();
  let at = |call: &str| calls.iter().position(|c| c == call).unwrap();
  assert!(at("session") < at("set_auth:token-1"));
  assert!(at("set_auth:token-1") < at("channel:conversation:1"));
  assert!(at("channel:conversation:1") < at("subscribe:conversation:1"));

  assert_eq!(f.client.subscriptions().state(CID).await, SubscriptionState::Subscribed);
  assert_eq!(f.fake.live_listeners(), 3);
  assert!(c.snapshot().live);
}

#[tokio::test]
async fn realtime_inserts_are_kept_in_id_order() {
  let f = fixture();
  let c = f.client.open(CID, f.me).await.unwrap();

  f.fake.emit_insert(message_row(5, CID, f.peer, "five"));
  f.fake.emit_insert(message_row(3, CID, f.peer, "three"));
  f.fake.emit_insert(message_row(5, CID, f.peer, "five"));

  eventually(|| ids(&c.snapshot()) == vec![3, 5]).await;
}

#[tokio::test]
async fn realtime_update_replaces_entry() {
  let f = fixture();
  seed_history(&f.fake, 1..=1, f.peer);
  let c = f.client.open(CID, f.me).await.unwrap();

  let mut edited = message_row(1, CID, f.peer, "edited");
  edited["edited_at"] = json!("2024-05-01T08:00:00Z");
  f.fake.emit(RawChange {
    kind:             ChangeKind::Update,
    table:            "messages".into(),
    record:           edited,
    old_record:       json!({ "id": 1 }),
    commit_timestamp: None,
  });

  eventually(|| c.snapshot().messages[0].body.as_deref() == Some("edited")).await;
  assert_eq!(c.snapshot().messages.len(), 1);
}

#[tokio::test]
async fn realtime_delete_removes_only_present_entries() {
  let f = fixture();
  seed_history(&f.fake, 1..=2, f.peer);
  let c = f.client.open(CID, f.me).await.unwrap();

  f.fake.emit_delete(2, CID);
  eventually(|| ids(&c.snapshot()) == vec![1]).await;

  let mut rx = c.watch();
  rx.mark_unchanged();
  f.fake.emit_delete(99, CID);
  settle().await;
  assert!(!rx.has_changed().unwrap());
  assert_eq!(ids(&c.snapshot()), vec![1]);
}

#[tokio::test]
async fn foreign_conversation_changes_are_ignored() {
  let f = fixture();
  f.fake.state().enforce_filter = false;
  let c = f.client.open(CID, f.me).await.unwrap();

  f.fake.emit_insert(message_row(8, CID + 1, f.peer, "elsewhere"));
  f.fake.emit_delete(8, CID + 1);
  f.fake.emit_insert(message_row(9, CID, f.peer, "here"));

  eventually(|| ids(&c.snapshot()) == vec![9]).await;
}

#[tokio::test]
async fn malformed_payload_is_dropped() {
  let f = fixture();
  let c = f.client.open(CID, f.me).await.unwrap();

  f.fake.emit_insert(json!({ "id": "not a number", "conversation_id": CID }));
  f.fake.emit_insert(json!({ "id": 4, "conversation_id": CID, "kind": "text" }));
  f.fake.emit_insert(message_row(5, CID, f.peer, "fine"));

  eventually(|| ids(&c.snapshot()) == vec![5]).await;
  assert!(c.snapshot().live);
}

#[tokio::test]
async fn failed_subscription_can_be_retried() {
  let f = fixture();
  f.fake.fail("subscribe");

  let c = f.client.open(CID, f.me).await.unwrap();
  assert!(!c.snapshot().live);
  assert_eq!(f.client.subscriptions().state(CID).await, SubscriptionState::Unsubscribed);
  assert_eq!(f.fake.live_listeners(), 0);
  assert!(f.fake.calls().contains(&"close:conversation:1".to_owned()));

  f.fake.heal("subscribe");
  assert!(c.resubscribe().await.unwrap());
  assert!(c.snapshot().live);

  f.fake.emit_insert(message_row(1, CID, f.peer, "now live"));
  eventually(|| c.snapshot().messages.len() == 1).await;
}

#[tokio::test]
async fn second_controller_stays_live_after_the_first_closes() {
  let f = fixture();
  let a = f.client.open(CID, f.me).await.unwrap();
  let b = f.client.open(CID, f.me).await.unwrap();
  assert_eq!(f.client.subscriptions().owners(CID), 2);
  assert_eq!(f.fake.live_listeners(), 3);

  a.close().await;

  assert_eq!(f.client.subscriptions().state(CID).await, SubscriptionState::Subscribed);
  assert_eq!(f.fake.live_listeners(), 3);
  f.fake.emit_insert(message_row(1, CID, f.peer, "still here"));
  eventually(|| ids(&b.snapshot()) == vec![1]).await;
  assert!(b.snapshot().live);
}

#[tokio::test]
async fn dropped_controller_releases_its_subscription() {
  let f = fixture();
  let c = f.client.open(CID, f.me).await.unwrap();
  drop(c);

  assert_eq!(f.client.subscriptions().owners(CID), 0);
  assert_eq!(f.client.subscriptions().state(CID).await, SubscriptionState::Unsubscribed);

  let reopened = f.client.open(CID, f.me).await.unwrap();
  assert!(reopened.snapshot().live);
  eventually(|| f.fake.live_listeners() == 3).await;
  f.fake.emit_insert(message_row(1, CID, f.peer, "after reopen"));
  eventually(|| ids(&reopened.snapshot()) == vec![1]).await;
}

#[tokio::test]
async fn open_joins_an_existing_subscription() {
  let f = fixture();
  let subscriptions = f.client.subscriptions();
  let other = subscriptions.new_owner();
  assert!(subscriptions.subscribe(CID, other, Arc::new(|_: ChangeEvent| {})).await);

  let c = f.client.open(CID, f.me).await.unwrap();
  assert!(c.snapshot().live);
  f.fake.emit_insert(message_row(1, CID, f.peer, "shared"));
  eventually(|| ids(&c.snapshot()) == vec![1]).await;

  c.close().await;
  assert_eq!(subscriptions.state(CID).await, SubscriptionState::Subscribed);
  assert_eq!(subscriptions.owners(CID), 1);
}

// ─── Sending ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn sent_text_appears_before_any_realtime_event() {
  let f = fixture();
  let c = f.client.open(CID, f.me).await.unwrap();
  f.fake.state().next_id = 42;

  let id = c.send_text("hello").await.unwrap();
  assert_eq!(id, 42);

  let view = c.snapshot();
  assert_eq!(view.messages.len(), 1);
  let sent = &view.messages[0];
  assert_eq!(sent.id, 42);
  assert_eq!(sent.author_id, f.me);
  assert_eq!(sent.conversation_id, CID);
  assert_eq!(sent.kind, MessageKind::Text);
  assert_eq!(sent.body.as_deref(), Some("hello"));

  // The echo is absorbed without duplicating.
  f.fake.emit_insert(message_row(42, CID, f.me, "hello"));
  settle().await;
  assert_eq!(ids(&c.snapshot()), vec![42]);
  assert_eq!(count(&f.fake, "rpc:mark_conversation_read"), 0);
}

#[tokio::test]
async fn send_keeps_an_earlier_echo() {
  let f = fixture();
  let c = f.client.open(CID, f.me).await.unwrap();

  let confirmed = message_row(1, CID, f.me, "hello");
  let confirmed = Message::from_row(confirmed).unwrap();
  c.apply_change(ChangeEvent::Insert(confirmed.clone())).await;

  assert_eq!(c.send_text("hello").await.unwrap(), 1);
  assert_eq!(c.snapshot().messages, vec![confirmed]);
}

#[tokio::test]
async fn blank_text_is_rejected_locally() {
  let f = fixture();
  let c = f.client.open(CID, f.me).await.unwrap();

  assert!(matches!(c.send_text("").await, Err(Error::EmptyMessage)));
  assert!(matches!(c.send_text(" \n\t ").await, Err(Error::EmptyMessage)));
  assert_eq!(count(&f.fake, "rpc:send_message"), 0);
  assert!(c.snapshot().messages.is_empty());
}

#[tokio::test]
async fn failed_send_is_surfaced() {
  let f = fixture();
  let c = f.client.open(CID, f.me).await.unwrap();
  f.fake.fail("rpc");

  assert!(matches!(c.send_text("hi").await, Err(Error::Platform(_))));
  let view = c.snapshot();
  assert!(view.messages.is_empty());
  assert!(view.error.is_some());
}

#[tokio::test]
async fn reconciliation_refetches_a_missing_sent_message() {
  let f = fixture_with(ChatConfig { reconcile_delay_ms: 20, ..small_pages() });
  let c = f.client.open(CID, f.me).await.unwrap();

  let id = c.send_text("hello").await.unwrap();
  c.apply_change(ChangeEvent::Delete(id)).await;
  assert!(c.snapshot().messages.is_empty());

  eventually(|| ids(&c.snapshot()) == vec![id]).await;
}

#[tokio::test]
async fn reconciliation_skips_present_message() {
  let f = fixture_with(ChatConfig { reconcile_delay_ms: 10, ..small_pages() });
  let c = f.client.open(CID, f.me).await.unwrap();

  c.send_text("hello").await.unwrap();
  settle().await;
  assert_eq!(count(&f.fake, "query"), 1);
}

// ─── Attachments ─────────────────────────────────────────────────────────────

fn png() -> Attachment {
  Attachment {
    data:         Bytes::from_static(b"\x89PNG...."),
    content_type: "image/png".into(),
    width:        Some(640),
    height:       Some(480),
  }
}

#[tokio::test]
async fn attachment_is_uploaded_and_described() {
  let f = fixture();
  let c = f.client.open(CID, f.me).await.unwrap();

  let id = c.send_attachment(png()).await.unwrap();

  let key = format!("{CID}/{id}");
  let (data, content_type) = f.fake.state().objects[&format!("chat-attachments/{key}")].clone();
  assert_eq!(data.len(), 8);
  assert_eq!(content_type, "image/png");

  let view = c.snapshot();
  let sent = &view.messages[0];
  assert_eq!(sent.id, id);
  assert_eq!(sent.kind, MessageKind::Image);
  let meta = sent.metadata.as_ref().unwrap();
  assert_eq!(meta.path, key);
  assert_eq!(meta.mime_type, "image/png");
  assert_eq!((meta.width, meta.height, meta.size), (Some(640), Some(480), 8));
}

#[tokio::test]
async fn failed_upload_removes_placeholder() {
  let f = fixture();
  let c = f.client.open(CID, f.me).await.unwrap();
  f.fake.fail("upload");

  let err = c.send_attachment(png()).await.unwrap_err();
  assert!(matches!(err, Error::Attachment { stage: AttachmentStage::Upload, .. }));

  assert!(f.fake.state().rows.is_empty());
  assert_eq!(count(&f.fake, "remove_object"), 0);
  let view = c.snapshot();
  assert!(view.messages.is_empty());
  assert!(view.error.is_some());
}

#[tokio::test]
async fn failed_metadata_removes_object_and_placeholder() {
  let f = fixture();
  let c = f.client.open(CID, f.me).await.unwrap();
  f.fake.fail("update");

  let err = c.send_attachment(png()).await.unwrap_err();
  assert!(matches!(err, Error::Attachment { stage: AttachmentStage::Metadata, .. }));

  let state = f.fake.state();
  assert!(state.rows.is_empty());
  assert!(state.objects.is_empty());
}

#[tokio::test]
async fn failed_attachment_left_in_place_when_cleanup_disabled() {
  let f = fixture_with(ChatConfig { cleanup_failed_attachments: false, ..small_pages() });
  let c = f.client.open(CID, f.me).await.unwrap();
  f.fake.fail("update");

  assert!(c.send_attachment(png()).await.is_err());
  assert_eq!(f.fake.state().rows.len(), 1);
  assert_eq!(f.fake.state().objects.len(), 1);
  assert_eq!(c.snapshot().messages.len(), 1);
}

#[tokio::test]
async fn failed_placeholder_touches_nothing_else() {
  let f = fixture();
  let c = f.client.open(CID, f.me).await.unwrap();
  f.fake.fail("insert");

  let err = c.send_attachment(png()).await.unwrap_err();
  assert!(matches!(err, Error::Attachment { stage: AttachmentStage::Placeholder, .. }));
  assert_eq!(count(&f.fake, "upload"), 0);
}

// ─── Closing ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn close_releases_subscription_and_state() {
  let f = fixture();
  seed_history(&f.fake, 1..=3, f.peer);
  let c = f.client.open(CID, f.me).await.unwrap();
  let rx = c.watch();

  c.close().await;

  assert_eq!(f.client.subscriptions().state(CID).await, SubscriptionState::Unsubscribed);
  assert_eq!(f.fake.live_listeners(), 0);
  assert!(f.fake.calls().contains(&"close:conversation:1".to_owned()));
  let view = rx.borrow().clone();
  assert!(view.messages.is_empty());
  assert!(!view.live);

  // Closing again through the manager is harmless.
  let stranger = f.client.subscriptions().new_owner();
  f.client.subscriptions().unsubscribe(CID, stranger).await;
}

#[tokio::test]
async fn pending_reconciliation_is_dropped_after_close() {
  let f = fixture_with(ChatConfig { reconcile_delay_ms: 20, ..small_pages() });
  let c = f.client.open(CID, f.me).await.unwrap();
  let rx = c.watch();

  let id = c.send_text("hello").await.unwrap();
  c.apply_change(ChangeEvent::Delete(id)).await;
  c.close().await;

  settle().await;
  assert!(rx.borrow().messages.is_empty());
  assert_eq!(count(&f.fake, "query"), 1);
}

#[tokio::test]
async fn start_direct_conversation_returns_its_id() {
  let f = fixture();
  assert_eq!(f.client.start_direct_conversation(f.peer).await.unwrap(), 77);
  assert!(f.fake.calls().contains(&"rpc:start_direct_conversation".to_owned()));
}
