//! The explicitly constructed entry point to the chat core.

use std::sync::Arc;

use stride_core::{
  message::{ConversationId, UserId},
  platform::Platform,
};

use crate::{
  ChatConfig, ConversationController, Error, Result, remote,
  subscription::SubscriptionManager,
};

/// Holds the platform handle, the process-wide [`SubscriptionManager`] and
/// the chat configuration. Construct one per process and pass it to
/// whatever opens conversations.
///
/// Cheap to clone.
pub struct ChatClient<P: Platform> {
  platform:      Arc<P>,
  subscriptions: SubscriptionManager<P>,
  config:        Arc<ChatConfig>,
}

impl<P: Platform> Clone for ChatClient<P> {
  fn clone(&self) -> Self {
    Self {
      platform:      Arc::clone(&self.platform),
      subscriptions: self.subscriptions.clone(),
      config:        Arc::clone(&self.config),
    }
  }
}

impl<P: Platform> ChatClient<P> {
  pub fn new(platform: Arc<P>, config: ChatConfig) -> Self {
    let subscriptions =
      SubscriptionManager::new(Arc::clone(&platform), config.messages_table.clone());
    Self { platform, subscriptions, config: Arc::new(config) }
  }

  pub fn platform(&self) -> &Arc<P> { &self.platform }

  pub fn subscriptions(&self) -> &SubscriptionManager<P> { &self.subscriptions }

  pub fn config(&self) -> &ChatConfig { &self.config }

  /// Open a conversation for user `me`.
  pub async fn open(
    &self,
    conversation_id: ConversationId,
    me: UserId,
  ) -> Result<ConversationController<P>> {
    ConversationController::open(
      Arc::clone(&self.platform),
      self.subscriptions.clone(),
      Arc::clone(&self.config),
      conversation_id,
      me,
    )
    .await
  }

  /// Find or create the direct conversation between the signed-in user and
  /// `other`.
  pub async fn start_direct_conversation(&self, other: UserId) -> Result<ConversationId> {
    let value = self
      .platform
      .rpc(remote::RPC_START_DIRECT, remote::start_direct_params(other))
      .await
      .map_err(Error::platform)?;
    remote::returned_id(&value)
  }

  /// Release every realtime channel, e.g. on sign-out.
  pub async fn shutdown(&self) { self.subscriptions.unsubscribe_all().await; }
}
