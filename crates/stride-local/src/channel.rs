//! A realtime channel fed by the platform's change bus.

use std::sync::{Arc, Mutex, PoisonError};

use stride_core::{
  change::{ChangeFilter, ChangeListener, ListenerId, RawChange},
  message::UserId,
  platform::RealtimeChannel,
};
use tokio::{
  sync::{
    RwLock,
    broadcast::{self, error::RecvError},
  },
  task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{Error, Result};

type Listeners = Arc<Mutex<Vec<(ListenerId, ChangeFilter, ChangeListener)>>>;

/// Delivers bus changes to its listeners once subscribed.
///
/// Row filters are applied only if the platform had a valid auth context
/// when the channel joined; otherwise every change of a matching table and
/// event is delivered.
pub struct LocalChannel {
  topic:         String,
  bus:           broadcast::Sender<RawChange>,
  auth:          Arc<RwLock<Option<UserId>>>,
  listeners:     Listeners,
  next_listener: u64,
  pump:          Option<JoinHandle<()>>,
}

impl LocalChannel {
  pub(crate) fn new(
    topic: &str,
    bus: broadcast::Sender<RawChange>,
    auth: Arc<RwLock<Option<UserId>>>,
  ) -> Self {
    Self {
      topic: topic.to_owned(),
      bus,
      auth,
      listeners: Arc::default(),
      next_listener: 0,
      pump: None,
    }
  }

  pub fn is_joined(&self) -> bool { self.pump.is_some() }
}

fn deliver(listeners: &Listeners, change: &RawChange, filtered: bool) {
  let targets: Vec<ChangeListener> = listeners
    .lock()
    .unwrap_or_else(PoisonError::into_inner)
    .iter()
    .filter(|(_, filter, _)| filter.selects(change) && (!filtered || filter.admits(change)))
    .map(|(_, _, listener)| Arc::clone(listener))
    .collect();
  for listener in targets {
    listener(change.clone());
  }
}

impl RealtimeChannel for LocalChannel {
  type Error = Error;

  fn topic(&self) -> &str { &self.topic }

  fn on_change(&mut self, filter: ChangeFilter, listener: ChangeListener) -> ListenerId {
    self.next_listener += 1;
    let id = ListenerId(self.next_listener);
    self
      .listeners
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push((id, filter, listener));
    id
  }

  fn remove_listener(&mut self, id: ListenerId) {
    self
      .listeners
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .retain(|(l, _, _)| *l != id);
  }

  /// Join the bus. Changes published after this returns are delivered.
  async fn subscribe(&mut self) -> Result<()> {
    if self.pump.is_some() {
      return Ok(());
    }

    let user = *self.auth.read().await;
    if user.is_none() {
      warn!(topic = %self.topic, "joined without auth; row filters are not applied");
    }
    let filtered = user.is_some();

    let mut rx = self.bus.subscribe();
    let listeners = Arc::clone(&self.listeners);
    let topic = self.topic.clone();
    self.pump = Some(tokio::spawn(async move {
      loop {
        match rx.recv().await {
          Ok(change) => deliver(&listeners, &change, filtered),
          Err(RecvError::Lagged(skipped)) => {
            warn!(%topic, skipped, "realtime channel lagged");
          }
          Err(RecvError::Closed) => break,
        }
      }
    }));

    debug!(topic = %self.topic, filtered, "channel joined");
    Ok(())
  }

  async fn close(self) {
    debug!(topic = %self.topic, "channel closed");
  }
}

impl Drop for LocalChannel {
  fn drop(&mut self) {
    if let Some(pump) = self.pump.take() {
      pump.abort();
    }
  }
}
