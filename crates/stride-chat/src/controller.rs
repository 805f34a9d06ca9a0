//! The single owner of one open conversation.
//!
//! The controller loads history, keeps the realtime subscription, applies
//! incoming changes, and performs sends. Every mutation of the conversation
//! state happens under one lock, and realtime events are applied by a single
//! task in arrival order, so the store never sees concurrent writers. Network
//! calls are made without the lock held; their completions re-check
//! `closed` so nothing can resurrect state after [`ConversationController::close`].

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde_json::Value;
use stride_core::{
  change::ChangeEvent,
  message::{
    AttachmentMeta, ConversationId, Message, MessageId, MessageKind, UserId, row_i64,
  },
  platform::Platform,
};
use tokio::{
  sync::{Mutex, mpsc, watch},
  task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
  AttachmentStage, ChatConfig, Error, Result,
  cursor::{Cursor, lowest, lowest_row_id},
  remote,
  store::{MessageStore, Upsert},
  subscription::{OnChange, OwnerId, SubscriptionManager},
};

// ─── Observable view ─────────────────────────────────────────────────────────

/// Read-only snapshot published to the UI after every change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationView {
  pub conversation_id: ConversationId,
  /// Ascending by id.
  pub messages:        Vec<Message>,
  pub has_older:       bool,
  /// A page load is in flight.
  pub loading:         bool,
  /// Last user-visible failure, cleared by the next successful foreground
  /// action.
  pub error:           Option<String>,
  /// The realtime subscription is established.
  pub live:            bool,
}

/// A binary payload to send as an image or file message.
#[derive(Debug, Clone)]
pub struct Attachment {
  pub data:         Bytes,
  pub content_type: String,
  pub width:        Option<u32>,
  pub height:       Option<u32>,
}

// ─── Shared state ────────────────────────────────────────────────────────────

struct State {
  store:            MessageStore,
  cursor:           Cursor,
  loading:          bool,
  error:            Option<String>,
  live:             bool,
  closed:           bool,
  last_marked_read: Option<MessageId>,
}

struct Shared<P: Platform> {
  conversation_id: ConversationId,
  me:              UserId,
  platform:        Arc<P>,
  config:          Arc<ChatConfig>,
  state:           Mutex<State>,
  view:            watch::Sender<ConversationView>,
}

impl<P: Platform> Shared<P> {
  fn publish(&self, state: &State) {
    self.view.send_replace(ConversationView {
      conversation_id: self.conversation_id,
      messages:        state.store.messages().to_vec(),
      has_older:       state.cursor.has_older,
      loading:         state.loading,
      error:           state.error.clone(),
      live:            state.live,
    });
  }

  /// Apply one realtime change. Runs on the event pump.
  async fn apply(self: &Arc<Self>, event: ChangeEvent) {
    let mut state = self.state.lock().await;
    if state.closed {
      return;
    }

    match event {
      ChangeEvent::Insert(message) | ChangeEvent::Update(message) => {
        let id = message.id;
        let from_peer = message.author_id != self.me;
        let outcome = state.store.upsert(message);
        if outcome == Upsert::Rejected {
          debug!(conversation_id = self.conversation_id, id, "rejected foreign message");
          return;
        }
        if from_peer {
          self.mark_read(&mut state, id);
        }
        if outcome.changed() {
          self.publish(&state);
        }
      }
      ChangeEvent::Delete(id) => {
        if state.store.remove(id).is_some() {
          self.publish(&state);
        }
      }
    }
  }

  /// Best-effort: tell the platform the local user has read up to `id`.
  /// Failures are logged and otherwise ignored.
  fn mark_read(self: &Arc<Self>, state: &mut State, id: MessageId) {
    if state.last_marked_read.is_some_and(|last| last >= id) {
      return;
    }
    state.last_marked_read = Some(id);

    let shared = Arc::clone(self);
    tokio::spawn(async move {
      let params = remote::mark_read_params(shared.conversation_id, id);
      if let Err(e) = shared.platform.rpc(remote::RPC_MARK_READ, params).await {
        warn!(conversation_id = shared.conversation_id, id, error = %e, "mark read failed");
      }
    });
  }

  /// Decode a server row and upsert it, unless the conversation is closed.
  async fn absorb_row(&self, row: Value) {
    let message = match Message::from_row(row) {
      Ok(m) => m,
      Err(e) => {
        warn!(conversation_id = self.conversation_id, error = %e, "dropping malformed row");
        return;
      }
    };
    let mut state = self.state.lock().await;
    if !state.closed && state.store.upsert(message).changed() {
      self.publish(&state);
    }
  }

  /// Surface a foreground failure in the view.
  async fn report(&self, error: &Error) {
    let mut state = self.state.lock().await;
    if !state.closed {
      state.error = Some(error.to_string());
      self.publish(&state);
    }
  }

  async fn ensure_open(&self) -> Result<()> {
    if self.state.lock().await.closed {
      return Err(Error::Closed(self.conversation_id));
    }
    Ok(())
  }

  /// Claim the single page-load slot. Returns `false` if a load is already
  /// running.
  async fn begin_load(&self) -> Result<bool> {
    let mut state = self.state.lock().await;
    if state.closed {
      return Err(Error::Closed(self.conversation_id));
    }
    if state.loading {
      debug!(conversation_id = self.conversation_id, "page load already in flight");
      return Ok(false);
    }
    state.loading = true;
    self.publish(&state);
    Ok(true)
  }

  fn decode_page(&self, rows: Vec<Value>) -> Vec<Message> {
    let (messages, errors) = Message::from_rows(rows);
    for e in errors {
      warn!(conversation_id = self.conversation_id, error = %e, "dropping malformed row");
    }
    messages
  }
}

// ─── Controller ──────────────────────────────────────────────────────────────

/// Owns the visible message list of one open conversation.
///
/// Call [`close`](Self::close) when the conversation is dismissed. Dropping
/// the controller also gives up its share of the subscription, but closes
/// the channel in the background.
pub struct ConversationController<P: Platform> {
  shared:        Arc<Shared<P>>,
  subscriptions: SubscriptionManager<P>,
  owner:         OwnerId,
  events:        mpsc::UnboundedSender<ChangeEvent>,
  pump:          JoinHandle<()>,
}

impl<P: Platform> ConversationController<P> {
  /// Open `conversation_id` for user `me`: load the newest page, mark it
  /// read if the last message came from someone else, then subscribe.
  ///
  /// Fails only if the first page cannot be loaded. A failed subscription
  /// leaves the controller usable with `live == false`; see
  /// [`resubscribe`](Self::resubscribe).
  pub async fn open(
    platform: Arc<P>,
    subscriptions: SubscriptionManager<P>,
    config: Arc<ChatConfig>,
    conversation_id: ConversationId,
    me: UserId,
  ) -> Result<Self> {
    let state = State {
      store:            MessageStore::new(conversation_id),
      cursor:           Cursor::default(),
      loading:          false,
      error:            None,
      live:             false,
      closed:           false,
      last_marked_read: None,
    };
    let (view, _) = watch::channel(ConversationView {
      conversation_id,
      messages: Vec::new(),
      has_older: false,
      loading: false,
      error: None,
      live: false,
    });
    let shared = Arc::new(Shared {
      conversation_id,
      me,
      platform,
      config,
      state: Mutex::new(state),
      view,
    });

    let (events, mut rx) = mpsc::unbounded_channel();
    let pump = tokio::spawn({
      let shared = Arc::clone(&shared);
      async move {
        while let Some(event) = rx.recv().await {
          shared.apply(event).await;
        }
      }
    });

    let owner = subscriptions.new_owner();
    let controller = Self { shared, subscriptions, owner, events, pump };

    controller.load_first_page().await?;
    {
      let mut state = controller.shared.state.lock().await;
      let last = state.store.last().map(|m| (m.id, m.author_id));
      if let Some((id, author)) = last
        && author != me
      {
        controller.shared.mark_read(&mut state, id);
      }
    }
    controller.subscribe().await;

    Ok(controller)
  }

  pub fn conversation_id(&self) -> ConversationId { self.shared.conversation_id }

  /// A receiver that observes every published [`ConversationView`].
  pub fn watch(&self) -> watch::Receiver<ConversationView> { self.shared.view.subscribe() }

  /// The current view.
  pub fn snapshot(&self) -> ConversationView { self.shared.view.borrow().clone() }

  // ── Paging ──────────────────────────────────────────────────────────────

  /// Load the newest page. Returns `false` if another page load was already
  /// running or the result arrived after close.
  pub async fn load_first_page(&self) -> Result<bool> {
    let shared = &self.shared;
    if !shared.begin_load().await? {
      return Ok(false);
    }

    let page_size = shared.config.page_size;
    let query =
      remote::newest_page(&shared.config.messages_table, shared.conversation_id, page_size);
    let result = shared.platform.query(query).await.map_err(Error::platform);

    let mut state = shared.state.lock().await;
    state.loading = false;
    if state.closed {
      return Ok(false);
    }
    match result {
      Ok(rows) => {
        let raw_count = rows.len();
        let raw_oldest = lowest_row_id(&rows);
        for message in shared.decode_page(rows) {
          state.store.upsert(message);
        }
        let oldest = lowest(state.store.first_id(), raw_oldest);
        state.cursor.first_page(oldest, raw_count, page_size);
        state.error = None;
        shared.publish(&state);
        Ok(true)
      }
      Err(e) => {
        state.error = Some(e.to_string());
        shared.publish(&state);
        Err(e)
      }
    }
  }

  /// Load the page before the oldest loaded message. Ignored (returns
  /// `false`) while another page load is in flight, when no older page
  /// exists, or when the result arrives after close.
  pub async fn load_older(&self) -> Result<bool> {
    let shared = &self.shared;
    let before = {
      let mut state = shared.state.lock().await;
      if state.closed {
        return Err(Error::Closed(shared.conversation_id));
      }
      if state.loading {
        debug!(conversation_id = shared.conversation_id, "page load already in flight");
        return Ok(false);
      }
      let Some(before) = state.cursor.next_before() else {
        return Ok(false);
      };
      state.loading = true;
      shared.publish(&state);
      before
    };

    let page_size = shared.config.page_size;
    let query = remote::older_page(
      &shared.config.messages_table,
      shared.conversation_id,
      before,
      page_size,
    );
    let result = shared.platform.query(query).await.map_err(Error::platform);

    let mut state = shared.state.lock().await;
    state.loading = false;
    if state.closed {
      return Ok(false);
    }
    match result {
      Ok(rows) => {
        let raw_count = rows.len();
        let raw_oldest = lowest_row_id(&rows);
        let added = state.store.merge_page(shared.decode_page(rows));
        let oldest = lowest(state.store.first_id(), raw_oldest);
        state.cursor.older_page(oldest, raw_count, page_size);
        debug!(conversation_id = shared.conversation_id, before, added, "loaded older page");
        state.error = None;
        shared.publish(&state);
        Ok(true)
      }
      Err(e) => {
        state.error = Some(e.to_string());
        shared.publish(&state);
        Err(e)
      }
    }
  }

  // ── Realtime ────────────────────────────────────────────────────────────

  /// Apply a change event to the store. Events from the subscription are
  /// routed here automatically.
  pub async fn apply_change(&self, event: ChangeEvent) { self.shared.apply(event).await; }

  /// Retry a failed subscription. Returns whether the conversation is live.
  pub async fn resubscribe(&self) -> Result<bool> {
    self.shared.ensure_open().await?;
    Ok(self.subscribe().await)
  }

  async fn subscribe(&self) -> bool {
    let events = self.events.clone();
    let on_change: OnChange = Arc::new(move |event| {
      // The pump only stops once the controller is gone.
      let _ = events.send(event);
    });
    let live = self
      .subscriptions
      .subscribe(self.shared.conversation_id, self.owner, on_change)
      .await;

    let mut state = self.shared.state.lock().await;
    if !state.closed {
      state.live = live;
      self.shared.publish(&state);
    }
    live
  }

  // ── Sending ─────────────────────────────────────────────────────────────

  /// Send a text message and show it immediately.
  ///
  /// Whitespace-only input is rejected without contacting the platform.
  /// Returns the server-assigned id.
  pub async fn send_text(&self, text: &str) -> Result<MessageId> {
    if text.trim().is_empty() {
      return Err(Error::EmptyMessage);
    }
    let shared = &self.shared;
    shared.ensure_open().await?;

    let params = remote::send_message_params(shared.conversation_id, text);
    let sent = match shared.platform.rpc(remote::RPC_SEND_MESSAGE, params).await {
      Ok(value) => remote::returned_id(&value),
      Err(e) => Err(Error::platform(e)),
    };
    let id = match sent {
      Ok(id) => id,
      Err(e) => {
        shared.report(&e).await;
        return Err(e);
      }
    };

    let optimistic = Message {
      id,
      conversation_id: shared.conversation_id,
      author_id: shared.me,
      kind: MessageKind::Text,
      body: Some(text.to_owned()),
      created_at: Utc::now(),
      edited_at: None,
      deleted_at: None,
      metadata: None,
    };
    {
      let mut state = shared.state.lock().await;
      if state.closed {
        return Ok(id);
      }
      // The realtime echo may already have delivered the confirmed row.
      if !state.store.contains(id) {
        state.store.upsert(optimistic);
      }
      state.error = None;
      shared.publish(&state);
    }

    self.schedule_reconcile(id);
    Ok(id)
  }

  /// After the configured delay, if `id` is missing from the store (it was
  /// cleared or reset in the meantime), refetch the newest message.
  fn schedule_reconcile(&self, id: MessageId) {
    let Some(delay) = self.shared.config.reconcile_delay() else {
      return;
    };
    let shared = Arc::clone(&self.shared);
    tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      {
        let state = shared.state.lock().await;
        if state.closed || state.store.contains(id) {
          return;
        }
      }

      debug!(conversation_id = shared.conversation_id, id, "reconciling missing message");
      let query =
        remote::newest_page(&shared.config.messages_table, shared.conversation_id, 1);
      match shared.platform.query(query).await {
        Ok(rows) => {
          for row in rows {
            shared.absorb_row(row).await;
          }
        }
        Err(e) => {
          warn!(conversation_id = shared.conversation_id, id, error = %e, "reconciliation failed");
        }
      }
    });
  }

  /// Send an image or file: create a placeholder row, upload the payload,
  /// then attach its metadata to the row.
  ///
  /// Any failure is returned as a single [`Error::Attachment`]. Unless
  /// disabled in the config, a failed send deletes its placeholder row and
  /// uploaded object on a best-effort basis.
  pub async fn send_attachment(&self, attachment: Attachment) -> Result<MessageId> {
    self.shared.ensure_open().await?;
    let result = self.upload_attachment(&attachment).await;
    if let Err(e) = &result {
      self.shared.report(e).await;
    }
    result
  }

  async fn upload_attachment(&self, attachment: &Attachment) -> Result<MessageId> {
    let shared = &self.shared;
    let config = &shared.config;
    let kind = MessageKind::for_content_type(&attachment.content_type);

    let row = shared
      .platform
      .insert(
        &config.messages_table,
        remote::placeholder_row(shared.conversation_id, shared.me, kind),
      )
      .await
      .map_err(|e| Error::attachment(AttachmentStage::Placeholder, Error::platform(e)))?;
    let id = row_i64(&row, remote::COL_ID)
      .map_err(|e| Error::attachment(AttachmentStage::Placeholder, e.into()))?;
    shared.absorb_row(row).await;

    let key = remote::attachment_key(shared.conversation_id, id);
    if let Err(e) = shared
      .platform
      .upload_object(
        &config.attachment_bucket,
        &key,
        attachment.data.clone(),
        &attachment.content_type,
      )
      .await
    {
      self.compensate(id, None).await;
      return Err(Error::attachment(AttachmentStage::Upload, Error::platform(e)));
    }

    let meta = AttachmentMeta {
      path:      key.clone(),
      mime_type: attachment.content_type.clone(),
      width:     attachment.width,
      height:    attachment.height,
      size:      attachment.data.len() as u64,
    };
    let patched = match remote::metadata_patch(&meta) {
      Ok(patch) => shared
        .platform
        .update(&config.messages_table, patch, remote::by_id(id))
        .await
        .map_err(Error::platform),
      Err(e) => Err(e),
    };

    match patched {
      Ok(rows) if !rows.is_empty() => {
        for row in rows {
          shared.absorb_row(row).await;
        }
        Ok(id)
      }
      Ok(_) => {
        self.compensate(id, Some(&key)).await;
        Err(Error::attachment(AttachmentStage::Metadata, Error::MessageNotFound(id)))
      }
      Err(e) => {
        self.compensate(id, Some(&key)).await;
        Err(Error::attachment(AttachmentStage::Metadata, e))
      }
    }
  }

  /// Undo a partially-sent attachment. Failures here are only logged.
  async fn compensate(&self, id: MessageId, uploaded_key: Option<&str>) {
    let shared = &self.shared;
    let config = &shared.config;
    if !config.cleanup_failed_attachments {
      warn!(conversation_id = shared.conversation_id, id, "leaving placeholder of failed attachment");
      return;
    }

    if let Some(key) = uploaded_key
      && let Err(e) = shared.platform.remove_object(&config.attachment_bucket, key).await
    {
      warn!(conversation_id = shared.conversation_id, id, error = %e, "failed to remove uploaded object");
    }
    if let Err(e) = shared
      .platform
      .delete(&config.messages_table, remote::by_id(id))
      .await
    {
      warn!(conversation_id = shared.conversation_id, id, error = %e, "failed to delete placeholder row");
    }

    let mut state = shared.state.lock().await;
    if !state.closed && state.store.remove(id).is_some() {
      shared.publish(&state);
    }
  }

  // ── Teardown ────────────────────────────────────────────────────────────

  /// Release the subscription and discard all in-memory state. In-flight
  /// requests may still complete; their results are dropped.
  pub async fn close(self) {
    {
      let mut state = self.shared.state.lock().await;
      state.closed = true;
      state.loading = false;
      state.live = false;
      state.store.clear();
      state.cursor = Cursor::default();
      self.shared.publish(&state);
    }
    self
      .subscriptions
      .unsubscribe(self.shared.conversation_id, self.owner)
      .await;
    debug!(conversation_id = self.shared.conversation_id, "conversation closed");
  }
}

impl<P: Platform> Drop for ConversationController<P> {
  fn drop(&mut self) {
    self.pump.abort();
    self
      .subscriptions
      .unsubscribe_detached(self.shared.conversation_id, self.owner);
  }
}
