//! Realtime chat core for Stride.
//!
//! One [`ConversationController`] owns the visible state of one open
//! conversation: a [`MessageStore`] kept in ascending id order, a pagination
//! [`Cursor`], and a realtime subscription held by the process-wide
//! [`SubscriptionManager`]. All of it is built on the platform traits in
//! [`stride_core::platform`], so the hosted service, the local emulator and
//! test doubles are interchangeable.

pub mod client;
pub mod config;
pub mod controller;
pub mod cursor;
pub mod decode;
pub mod error;
pub mod remote;
pub mod store;
pub mod subscription;

pub use client::ChatClient;
pub use config::ChatConfig;
pub use controller::{Attachment, ConversationController, ConversationView};
pub use cursor::Cursor;
pub use error::{AttachmentStage, Error, Result};
pub use store::{MessageStore, Upsert};
pub use subscription::{OwnerId, SubscriptionManager, SubscriptionState};

#[cfg(test)]
mod tests;
