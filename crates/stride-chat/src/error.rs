//! Error type for `stride-chat`.

use std::fmt;

use stride_core::message::{ConversationId, MessageId};
use thiserror::Error;

/// Where an attachment send failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentStage {
  /// Creating the placeholder message row.
  Placeholder,
  /// Uploading the payload to object storage.
  Upload,
  /// Writing the storage metadata back onto the row.
  Metadata,
}

impl fmt::Display for AttachmentStage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Placeholder => "placeholder",
      Self::Upload => "upload",
      Self::Metadata => "metadata",
    })
  }
}

#[derive(Debug, Error)]
pub enum Error {
  #[error("message is empty")]
  EmptyMessage,

  #[error("conversation {0} is closed")]
  Closed(ConversationId),

  #[error("message {0} not found")]
  MessageNotFound(MessageId),

  #[error("decode error: {0}")]
  Decode(#[from] stride_core::Error),

  #[error("platform error: {0}")]
  Platform(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error("attachment {stage} failed: {source}")]
  Attachment {
    stage:  AttachmentStage,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },
}

impl Error {
  /// Wrap an error returned by any platform trait.
  pub fn platform(e: impl std::error::Error + Send + Sync + 'static) -> Self {
    Self::Platform(Box::new(e))
  }

  pub(crate) fn attachment(stage: AttachmentStage, e: Error) -> Self {
    Self::Attachment { stage, source: Box::new(e) }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
