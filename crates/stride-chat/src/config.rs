//! Tunables for the chat core, deserialised from the `[chat]` table of the
//! application config.

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
  /// Messages fetched per page, first page included.
  pub page_size:                  usize,
  /// Delay before the post-send reconciliation check; `0` disables it.
  pub reconcile_delay_ms:         u64,
  pub messages_table:             String,
  pub attachment_bucket:          String,
  /// Delete the placeholder row and uploaded object when an attachment send
  /// fails part-way.
  pub cleanup_failed_attachments: bool,
}

impl Default for ChatConfig {
  fn default() -> Self {
    Self {
      page_size:                  30,
      reconcile_delay_ms:         1000,
      messages_table:             "messages".into(),
      attachment_bucket:          "chat-attachments".into(),
      cleanup_failed_attachments: true,
    }
  }
}

impl ChatConfig {
  pub fn reconcile_delay(&self) -> Option<Duration> {
    (self.reconcile_delay_ms > 0)
      .then(|| Duration::from_millis(self.reconcile_delay_ms))
  }
}
