//! A local, SQLite-backed implementation of the Stride platform traits.
//!
//! Rows of every table live in one SQLite table as JSON documents; ids come
//! from a single `AUTOINCREMENT` sequence, so they are unique and increase
//! across tables. Writes publish [`RawChange`](stride_core::change::RawChange)s
//! on an in-process bus that backs the realtime channels. Database access
//! runs on [`tokio_rusqlite`]'s background thread.
//!
//! Used by the CLI for offline use and by tests that want real persistence
//! and realtime delivery without a hosted backend.

mod channel;
mod encode;
mod platform;
mod rpc;
mod schema;

pub mod error;

pub use channel::LocalChannel;
pub use error::{Error, Result};
pub use platform::{LocalPlatform, StoredObject};
