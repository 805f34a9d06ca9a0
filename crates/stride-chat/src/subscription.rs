//! One realtime channel per open conversation.
//!
//! The manager is shared process-wide. Several owners (controllers on
//! different screens) may watch the same conversation; they share its one
//! channel, each event is fanned out to every owner, and the channel is
//! released when the last owner leaves. Every transition happens under the
//! map's lock, and the lock is never held across a network call:
//!
//! ```text
//! Unsubscribed ──subscribe──▶ Subscribing ──ok──▶ Subscribed
//!       ▲                          │                   │
//!       └──────── error / cancel ──┘◀── last owner ────┘
//! ```

use std::{
  collections::HashMap,
  sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicU64, Ordering},
  },
};

use stride_core::{
  change::{ChangeEvent, ChangeListener, ListenerId, RawChange},
  message::ConversationId,
  platform::{Auth, Realtime, RealtimeChannel},
};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{Error, Result, decode::decode_change, remote};

/// Callback receiving decoded, conversation-scoped change events.
pub type OnChange = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

/// Identifies one party holding a conversation's subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
  Unsubscribed,
  Subscribing,
  Subscribed,
}

/// Callbacks of every owner of one conversation, shared with the channel
/// listeners that fan events out to them.
type Owners = Arc<Mutex<Vec<(OwnerId, OnChange)>>>;

/// A joined channel together with the listeners registered on it; released
/// as a unit.
struct Subscription<C> {
  channel:   C,
  listeners: Vec<ListenerId>,
}

impl<C: RealtimeChannel> Subscription<C> {
  async fn release(mut self) {
    for id in self.listeners.drain(..) {
      self.channel.remove_listener(id);
    }
    self.channel.close().await;
  }
}

enum Phase<C> {
  /// A subscribe call is in flight; `generation` identifies it so a stale
  /// completion cannot claim a slot that was released and re-acquired.
  /// Owners that join meanwhile wait on `settled`.
  Subscribing {
    generation: u64,
    settled:    watch::Sender<Option<bool>>,
  },
  Subscribed(Subscription<C>),
}

struct Slot<C> {
  owners: Owners,
  phase:  Phase<C>,
}

impl<C> Slot<C> {
  /// Add `owner`, replacing its previous callback if it already has one.
  fn join(&self, owner: OwnerId, on_change: OnChange) {
    let mut owners = self.owners.lock().unwrap_or_else(PoisonError::into_inner);
    match owners.iter_mut().find(|(o, _)| *o == owner) {
      Some(entry) => entry.1 = on_change,
      None => owners.push((owner, on_change)),
    }
  }

  /// Remove `owner`; returns how many owners remain.
  fn leave(&self, owner: OwnerId) -> usize {
    let mut owners = self.owners.lock().unwrap_or_else(PoisonError::into_inner);
    owners.retain(|(o, _)| *o != owner);
    owners.len()
  }
}

fn fan_out(owners: &Owners, event: ChangeEvent) {
  let targets: Vec<OnChange> = owners
    .lock()
    .unwrap_or_else(PoisonError::into_inner)
    .iter()
    .map(|(_, on_change)| Arc::clone(on_change))
    .collect();
  for on_change in targets {
    on_change(event.clone());
  }
}

/// What [`SubscriptionManager::subscribe`] found under the lock.
enum Join {
  Live,
  Wait(watch::Receiver<Option<bool>>),
  Lead { generation: u64, owners: Owners },
}

// ─── Manager ─────────────────────────────────────────────────────────────────

/// Owns the realtime channels of every open conversation.
///
/// Cheap to clone; clones share the same channel map.
pub struct SubscriptionManager<P: Auth + Realtime> {
  inner: Arc<ManagerInner<P>>,
}

struct ManagerInner<P: Auth + Realtime> {
  platform:        Arc<P>,
  table:           String,
  slots:           Mutex<HashMap<ConversationId, Slot<<P as Realtime>::Channel>>>,
  next_generation: AtomicU64,
  next_owner:      AtomicU64,
}

impl<P: Auth + Realtime> ManagerInner<P> {
  fn slots(&self) -> MutexGuard<'_, HashMap<ConversationId, Slot<<P as Realtime>::Channel>>> {
    self.slots.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn is_pending(
    slots: &HashMap<ConversationId, Slot<<P as Realtime>::Channel>>,
    conversation_id: ConversationId,
    generation: u64,
  ) -> bool {
    matches!(
      slots.get(&conversation_id).map(|s| &s.phase),
      Some(Phase::Subscribing { generation: g, .. }) if *g == generation
    )
  }
}

/// Removes a `Subscribing` slot whose subscribe call never finished, e.g.
/// because its future was dropped.
struct PendingSlot<'a, P: Auth + Realtime> {
  inner:           &'a ManagerInner<P>,
  conversation_id: ConversationId,
  generation:      u64,
}

impl<P: Auth + Realtime> Drop for PendingSlot<'_, P> {
  fn drop(&mut self) {
    let mut slots = self.inner.slots();
    if ManagerInner::<P>::is_pending(&slots, self.conversation_id, self.generation) {
      slots.remove(&self.conversation_id);
      debug!(conversation_id = self.conversation_id, "abandoned pending subscription");
    }
  }
}

impl<P: Auth + Realtime> Clone for SubscriptionManager<P> {
  fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl<P: Auth + Realtime> SubscriptionManager<P> {
  /// `table` is the table whose row changes are delivered.
  pub fn new(platform: Arc<P>, table: impl Into<String>) -> Self {
    Self {
      inner: Arc::new(ManagerInner {
        platform,
        table: table.into(),
        slots: Mutex::new(HashMap::new()),
        next_generation: AtomicU64::new(0),
        next_owner: AtomicU64::new(0),
      }),
    }
  }

  /// A fresh owner id for [`subscribe`](Self::subscribe).
  pub fn new_owner(&self) -> OwnerId {
    OwnerId(self.inner.next_owner.fetch_add(1, Ordering::Relaxed))
  }

  pub async fn state(&self, conversation_id: ConversationId) -> SubscriptionState {
    match self.inner.slots().get(&conversation_id).map(|s| &s.phase) {
      None => SubscriptionState::Unsubscribed,
      Some(Phase::Subscribing { .. }) => SubscriptionState::Subscribing,
      Some(Phase::Subscribed(_)) => SubscriptionState::Subscribed,
    }
  }

  /// Number of owners sharing the conversation's subscription.
  pub fn owners(&self, conversation_id: ConversationId) -> usize {
    self.inner.slots().get(&conversation_id).map_or(0, |slot| {
      slot.owners.lock().unwrap_or_else(PoisonError::into_inner).len()
    })
  }

  /// Subscribe `owner` to row changes for `conversation_id`, forwarding
  /// decoded events to `on_change`.
  ///
  /// At most one channel exists per conversation: an owner joining an
  /// existing subscription shares it, and if that subscription is still
  /// connecting, waits for its outcome. Subscribing the same owner again
  /// replaces its callback. Returns `false` if the transport rejected the
  /// subscription or it was released while connecting; the caller decides
  /// whether to retry.
  pub async fn subscribe(
    &self,
    conversation_id: ConversationId,
    owner: OwnerId,
    on_change: OnChange,
  ) -> bool {
    let join = {
      let mut slots = self.inner.slots();
      match slots.get(&conversation_id) {
        Some(slot) => {
          slot.join(owner, on_change);
          match &slot.phase {
            Phase::Subscribed(_) => Join::Live,
            Phase::Subscribing { settled, .. } => Join::Wait(settled.subscribe()),
          }
        }
        None => {
          let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
          let owners: Owners = Arc::new(Mutex::new(vec![(owner, on_change)]));
          let (settled, _) = watch::channel(None);
          slots.insert(conversation_id, Slot {
            owners: Arc::clone(&owners),
            phase:  Phase::Subscribing { generation, settled },
          });
          Join::Lead { generation, owners }
        }
      }
    };

    match join {
      Join::Live => {
        debug!(conversation_id, "joined live subscription");
        true
      }
      Join::Wait(mut settled) => {
        debug!(conversation_id, "waiting for pending subscription");
        // A closed channel means the leader was cancelled.
        let live = match settled.wait_for(Option::is_some).await {
          Ok(outcome) => outcome.unwrap_or(false),
          Err(_) => false,
        };
        live
      }
      Join::Lead { generation, owners } => self.lead(conversation_id, generation, owners).await,
    }
  }

  async fn lead(&self, conversation_id: ConversationId, generation: u64, owners: Owners) -> bool {
    let _pending = PendingSlot { inner: &self.inner, conversation_id, generation };
    let connected = self.connect(conversation_id, owners).await;

    let late = {
      let mut slots = self.inner.slots();
      let ours = ManagerInner::<P>::is_pending(&slots, conversation_id, generation);
      match connected {
        Ok(subscription) if ours => {
          if let Some(slot) = slots.get_mut(&conversation_id) {
            if let Phase::Subscribing { settled, .. } = &slot.phase {
              settled.send_replace(Some(true));
            }
            slot.phase = Phase::Subscribed(subscription);
          }
          debug!(conversation_id, "subscribed");
          return true;
        }
        Ok(subscription) => subscription,
        Err(e) => {
          if ours
            && let Some(Slot { phase: Phase::Subscribing { settled, .. }, .. }) =
              slots.remove(&conversation_id)
          {
            settled.send_replace(Some(false));
          }
          warn!(conversation_id, error = %e, "realtime subscribe failed");
          return false;
        }
      }
    };

    debug!(conversation_id, "released while subscribing; closing channel");
    late.release().await;
    false
  }

  /// Take `owner` off the conversation. Returns the subscription if that was
  /// the last owner and the channel had joined.
  fn detach(
    &self,
    conversation_id: ConversationId,
    owner: OwnerId,
  ) -> Option<Subscription<<P as Realtime>::Channel>> {
    let mut slots = self.inner.slots();
    if slots.get(&conversation_id)?.leave(owner) > 0 {
      return None;
    }
    match slots.remove(&conversation_id)?.phase {
      Phase::Subscribed(subscription) => Some(subscription),
      Phase::Subscribing { .. } => {
        debug!(conversation_id, "cancelled pending subscription");
        None
      }
    }
  }

  /// Remove `owner` from the conversation, releasing the channel and its
  /// listeners once no owner is left. A no-op for an owner that is not
  /// subscribed.
  pub async fn unsubscribe(&self, conversation_id: ConversationId, owner: OwnerId) {
    if let Some(subscription) = self.detach(conversation_id, owner) {
      subscription.release().await;
      debug!(conversation_id, "unsubscribed");
    }
  }

  /// Like [`unsubscribe`](Self::unsubscribe), for callers that cannot
  /// await. The channel is closed on a spawned task when a runtime is
  /// available and dropped otherwise.
  pub fn unsubscribe_detached(&self, conversation_id: ConversationId, owner: OwnerId) {
    let Some(subscription) = self.detach(conversation_id, owner) else {
      return;
    };
    match tokio::runtime::Handle::try_current() {
      Ok(runtime) => {
        runtime.spawn(subscription.release());
      }
      Err(_) => debug!(conversation_id, "no runtime; dropping channel without close"),
    }
    debug!(conversation_id, "unsubscribed");
  }

  /// Release every channel, whoever owns it.
  pub async fn unsubscribe_all(&self) {
    let slots: Vec<_> = self.inner.slots().drain().collect();
    for (conversation_id, slot) in slots {
      if let Phase::Subscribed(subscription) = slot.phase {
        subscription.release().await;
        debug!(conversation_id, "unsubscribed");
      }
    }
  }

  /// Refresh auth, open the channel, register the three listeners and join.
  async fn connect(
    &self,
    conversation_id: ConversationId,
    owners: Owners,
  ) -> Result<Subscription<<P as Realtime>::Channel>> {
    let platform = &self.inner.platform;

    // The auth context must be in place before the channel joins; a channel
    // joined without it is not row-filtered server-side.
    let session = platform.session().await.map_err(Error::platform)?;
    platform
      .set_auth(&session.access_token)
      .await
      .map_err(Error::platform)?;

    let mut channel = platform.channel(&remote::topic(conversation_id));
    let listeners = remote::change_filters(&self.inner.table, conversation_id)
      .into_iter()
      .map(|filter| {
        let listener = listener(self.inner.table.clone(), conversation_id, Arc::clone(&owners));
        channel.on_change(filter, listener)
      })
      .collect();

    let mut subscription = Subscription { channel, listeners };
    if let Err(e) = subscription.channel.subscribe().await {
      subscription.release().await;
      return Err(Error::platform(e));
    }
    Ok(subscription)
  }
}

/// Wrap the owners in a raw-payload listener that decodes, validates the
/// conversation client-side, and drops anything it cannot use.
fn listener(table: String, conversation_id: ConversationId, owners: Owners) -> ChangeListener {
  Arc::new(move |raw: RawChange| {
    let kind = raw.kind;
    match decode_change(&table, conversation_id, raw) {
      Ok(Some(event)) => {
        debug!(conversation_id, ?kind, id = event.message_id(), "change");
        fan_out(&owners, event);
      }
      Ok(None) => debug!(conversation_id, ?kind, "ignoring change outside conversation"),
      Err(e) => warn!(conversation_id, ?kind, error = %e, "dropping malformed realtime payload"),
    }
  })
}
