//! HTTP client for the hosted platform's REST surfaces: the row API, stored
//! procedures, object storage and token auth.
//!
//! [`RestClient`] implements [`Database`](stride_core::platform::Database),
//! [`ObjectStorage`](stride_core::platform::ObjectStorage) and
//! [`Auth`](stride_core::platform::Auth). Realtime runs over a separate
//! socket transport and is not provided here.

mod client;
mod encode;

pub mod error;

pub use client::{RestClient, RestConfig};
pub use error::{Error, Result};
