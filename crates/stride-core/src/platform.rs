//! The hosted-platform contract and supporting types.
//!
//! The traits are implemented by platform backends (`stride-local`,
//! `stride-rest`, test doubles). The chat core depends on these abstractions,
//! never on a concrete backend, so every service handle is constructed by the
//! caller and injected.
//!
//! All methods return `Send` futures so implementations can be driven from a
//! multi-threaded tokio runtime.

use std::future::Future;

use bytes::Bytes;
use serde_json::Value;

use crate::{
  change::{ChangeFilter, ChangeListener, ListenerId},
  query::{Filter, Query},
  session::Session,
};

/// A loosely-typed row as returned by the row API.
pub type Row = Value;

// ─── Database ────────────────────────────────────────────────────────────────

/// Row reads and writes plus stored-procedure calls.
pub trait Database: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Read rows matching `query`.
  fn query(
    &self,
    query: Query,
  ) -> impl Future<Output = Result<Vec<Row>, Self::Error>> + Send + '_;

  /// Invoke a stored procedure by name.
  fn rpc<'a>(
    &'a self,
    name: &'a str,
    params: Value,
  ) -> impl Future<Output = Result<Value, Self::Error>> + Send + 'a;

  /// Insert one row and return it as stored (with server-assigned columns).
  fn insert<'a>(
    &'a self,
    table: &'a str,
    row: Row,
  ) -> impl Future<Output = Result<Row, Self::Error>> + Send + 'a;

  /// Merge `patch` into every row matching `filters`; returns the updated
  /// rows.
  fn update<'a>(
    &'a self,
    table: &'a str,
    patch: Value,
    filters: Vec<Filter>,
  ) -> impl Future<Output = Result<Vec<Row>, Self::Error>> + Send + 'a;

  /// Insert `row`, or merge it into the existing row whose `on_conflict`
  /// columns are equal.
  fn upsert<'a>(
    &'a self,
    table: &'a str,
    row: Row,
    on_conflict: &'a [&'a str],
  ) -> impl Future<Output = Result<Row, Self::Error>> + Send + 'a;

  /// Delete every row matching `filters`; returns the deleted rows.
  fn delete<'a>(
    &'a self,
    table: &'a str,
    filters: Vec<Filter>,
  ) -> impl Future<Output = Result<Vec<Row>, Self::Error>> + Send + 'a;
}

// ─── Object storage ──────────────────────────────────────────────────────────

pub trait ObjectStorage: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Store `data` at `bucket/key`, replacing any existing object.
  fn upload_object<'a>(
    &'a self,
    bucket: &'a str,
    key: &'a str,
    data: Bytes,
    content_type: &'a str,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// Remove the object at `bucket/key`. Removing a missing object succeeds.
  fn remove_object<'a>(
    &'a self,
    bucket: &'a str,
    key: &'a str,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;
}

// ─── Auth ────────────────────────────────────────────────────────────────────

pub trait Auth: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// The current session, refreshed first if it is about to expire.
  fn session(
    &self,
  ) -> impl Future<Output = Result<Session, Self::Error>> + Send + '_;
}

// ─── Realtime ────────────────────────────────────────────────────────────────

/// The realtime transport: a persistent connection multiplexing channels.
pub trait Realtime: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;
  type Channel: RealtimeChannel<Error = Self::Error>;

  /// Install `access_token` as the connection's auth context. Channels
  /// joined before this call do not get server-side row filtering.
  fn set_auth<'a>(
    &'a self,
    access_token: &'a str,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// Create a channel for `topic`. Nothing is sent until
  /// [`RealtimeChannel::subscribe`].
  fn channel(&self, topic: &str) -> Self::Channel;
}

/// One realtime channel and the listeners registered on it.
pub trait RealtimeChannel: Send + Sync + 'static {
  type Error: std::error::Error + Send + Sync + 'static;

  fn topic(&self) -> &str;

  /// Register `listener` for changes selected by `filter`.
  fn on_change(
    &mut self,
    filter: ChangeFilter,
    listener: ChangeListener,
  ) -> ListenerId;

  /// Deregister a listener. Unknown ids are ignored.
  fn remove_listener(&mut self, id: ListenerId);

  /// Join the channel; listeners start receiving changes on success.
  fn subscribe(
    &mut self,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Leave the channel and drop every listener.
  fn close(self) -> impl Future<Output = ()> + Send
  where
    Self: Sized;
}

// ─── Platform ────────────────────────────────────────────────────────────────

/// Everything the chat core needs from the hosted platform.
pub trait Platform:
  Database + ObjectStorage + Auth + Realtime + 'static
{
}

impl<T> Platform for T where
  T: Database + ObjectStorage + Auth + Realtime + 'static
{
}
