//! The SQLite implementation of the platform traits.

use std::{path::Path, sync::Arc};

use bytes::Bytes;
use chrono::Utc;
use rusqlite::{OptionalExtension as _, params, params_from_iter, types::Value as SqlValue};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use stride_core::{
  change::{ChangeKind, RawChange},
  message::UserId,
  platform::{Auth, Database, ObjectStorage, Realtime, Row},
  query::{Filter, Query},
  session::Session,
};
use tokio::sync::{RwLock, broadcast};
use tracing::debug;
use uuid::Uuid;

use crate::{
  Error, LocalChannel, Result,
  encode::{Sql, decode_row, encode_dt, into_object, select, where_clause},
  schema::SCHEMA,
};

/// Changes buffered per realtime subscriber before it starts lagging.
const BUS_CAPACITY: usize = 1024;

/// An uploaded object as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
  pub content_type: String,
  /// Hex-encoded SHA-256 of `data`.
  pub sha256:       String,
  pub data:         Bytes,
}

// ─── Platform ────────────────────────────────────────────────────────────────

/// A single-process stand-in for the hosted backend.
///
/// Cloning is cheap; clones share the connection, the signed-in session and
/// the realtime bus.
#[derive(Clone)]
pub struct LocalPlatform {
  conn:          tokio_rusqlite::Connection,
  bus:           broadcast::Sender<RawChange>,
  session:       Arc<RwLock<Option<Session>>>,
  realtime_user: Arc<RwLock<Option<UserId>>>,
}

impl LocalPlatform {
  /// Open (or create) a database at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    Self::init(conn).await
  }

  /// Open an in-memory database. Used by tests.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    Self::init(conn).await
  }

  async fn init(conn: tokio_rusqlite::Connection) -> Result<Self> {
    conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    let (bus, _) = broadcast::channel(BUS_CAPACITY);
    Ok(Self {
      conn,
      bus,
      session: Arc::default(),
      realtime_user: Arc::default(),
    })
  }

  pub(crate) fn conn(&self) -> &tokio_rusqlite::Connection { &self.conn }

  // ── Sessions ────────────────────────────────────────────────────────────

  /// Sign in as `user_id` without credentials and make the new session
  /// current.
  pub async fn sign_in(&self, user_id: UserId) -> Result<Session> {
    let token = Uuid::new_v4().simple().to_string();
    let session = Session {
      user_id,
      access_token: token.clone(),
      refresh_token: None,
      expires_at: None,
    };

    let user = user_id.hyphenated().to_string();
    let at = encode_dt(Utc::now());
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO sessions (access_token, user_id, created_at) VALUES (?1, ?2, ?3)",
          params![token, user, at],
        )?;
        Ok(())
      })
      .await?;

    debug!(%user_id, "signed in");
    *self.session.write().await = Some(session.clone());
    Ok(session)
  }

  /// Revoke the current session. Channels already joined keep their auth
  /// context.
  pub async fn sign_out(&self) -> Result<()> {
    let Some(session) = self.session.write().await.take() else {
      return Ok(());
    };
    *self.realtime_user.write().await = None;
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "DELETE FROM sessions WHERE access_token = ?1",
          params![session.access_token],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// The user of the current session.
  pub(crate) async fn caller(&self) -> Result<UserId> {
    self
      .session
      .read()
      .await
      .as_ref()
      .map(|s| s.user_id)
      .ok_or(Error::NotSignedIn)
  }

  // ── Realtime bus ────────────────────────────────────────────────────────

  /// Observe every change the platform publishes, unfiltered.
  pub fn changes(&self) -> broadcast::Receiver<RawChange> { self.bus.subscribe() }

  fn publish(&self, kind: ChangeKind, table: &str, record: Value, old_record: Value) {
    let change = RawChange {
      kind,
      table: table.to_owned(),
      record,
      old_record,
      commit_timestamp: Some(Utc::now()),
    };
    // No subscribers is not an error.
    let _ = self.bus.send(change);
  }

  // ── Rows ────────────────────────────────────────────────────────────────

  pub(crate) async fn query_rows(&self, query: Query) -> Result<Vec<Row>> {
    let Sql { text, params } = select(&query);
    let raw = self
      .conn
      .call(move |conn| Ok(select_rows(conn, &text, &params)?))
      .await?;
    raw.iter().map(|(_, data)| decode_row(data)).collect()
  }

  /// Insert `row`, assigning `id` and, when absent, `created_at`.
  pub(crate) async fn insert_row(&self, table: &str, row: Row) -> Result<Row> {
    let mut map = into_object(row, "insert")?;
    map.remove("id");
    map
      .entry("created_at")
      .or_insert_with(|| json!(encode_dt(Utc::now())));
    let data = Value::Object(map).to_string();
    let table_name = table.to_owned();

    let stored: String = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        tx.execute(
          "INSERT INTO rows (table_name, data) VALUES (?1, ?2)",
          params![table_name, data],
        )?;
        let id = tx.last_insert_rowid();
        let stored = tx.query_row(
          "UPDATE rows SET data = json_set(data, '$.id', id) WHERE id = ?1 RETURNING data",
          params![id],
          |r| r.get(0),
        )?;
        tx.commit()?;
        Ok(stored)
      })
      .await?;

    let record = decode_row(&stored)?;
    debug!(table, id = %record["id"], "inserted row");
    self.publish(ChangeKind::Insert, table, record.clone(), Value::Null);
    Ok(record)
  }

  /// Merge `patch` into every matching row. `id` cannot be changed and a
  /// `null` in the patch removes the column.
  pub(crate) async fn update_rows(
    &self,
    table: &str,
    patch: Value,
    filters: &[Filter],
  ) -> Result<Vec<Row>> {
    let mut patch = into_object(patch, "update")?;
    patch.remove("id");
    let patch = Value::Object(patch).to_string();
    let Sql { text, params } = where_clause(table, filters);

    let pairs: Vec<(String, String)> = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let before = select_rows(&tx, &format!("SELECT id, data FROM rows {text}"), &params)?;
        let mut pairs = Vec::with_capacity(before.len());
        for (id, old) in before {
          let new: String = tx.query_row(
            "UPDATE rows SET data = json_patch(data, ?1) WHERE id = ?2 RETURNING data",
            params![patch, id],
            |r| r.get(0),
          )?;
          pairs.push((old, new));
        }
        tx.commit()?;
        Ok(pairs)
      })
      .await?;

    let mut updated = Vec::with_capacity(pairs.len());
    for (old, new) in pairs {
      let (old, new) = (decode_row(&old)?, decode_row(&new)?);
      self.publish(ChangeKind::Update, table, new.clone(), old);
      updated.push(new);
    }
    debug!(table, count = updated.len(), "updated rows");
    Ok(updated)
  }

  pub(crate) async fn delete_rows(&self, table: &str, filters: &[Filter]) -> Result<Vec<Row>> {
    let Sql { text, params } = where_clause(table, filters);
    let raw = self
      .conn
      .call(move |conn| {
        Ok(select_rows(
          conn,
          &format!("DELETE FROM rows {text} RETURNING id, data"),
          &params,
        )?)
      })
      .await?;

    let mut deleted = Vec::with_capacity(raw.len());
    for (_, data) in raw {
      let old = decode_row(&data)?;
      self.publish(ChangeKind::Delete, table, Value::Null, old.clone());
      deleted.push(old);
    }
    debug!(table, count = deleted.len(), "deleted rows");
    Ok(deleted)
  }

  // ── Objects ─────────────────────────────────────────────────────────────

  pub async fn download_object(&self, bucket: &str, key: &str) -> Result<StoredObject> {
    let (b, k) = (bucket.to_owned(), key.to_owned());
    let found = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT content_type, sha256, data FROM objects WHERE bucket = ?1 AND key = ?2",
              params![b, k],
              |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, Vec<u8>>(2)?)),
            )
            .optional()?,
        )
      })
      .await?;

    let (content_type, sha256, data) = found.ok_or_else(|| Error::ObjectNotFound {
      bucket: bucket.to_owned(),
      key:    key.to_owned(),
    })?;
    Ok(StoredObject { content_type, sha256, data: Bytes::from(data) })
  }
}

fn select_rows(
  conn: &rusqlite::Connection,
  sql: &str,
  params: &[SqlValue],
) -> rusqlite::Result<Vec<(i64, String)>> {
  let mut stmt = conn.prepare(sql)?;
  let rows = stmt
    .query_map(params_from_iter(params), |r| Ok((r.get(0)?, r.get(1)?)))?
    .collect::<rusqlite::Result<Vec<_>>>();
  rows
}

// ─── Trait impls ─────────────────────────────────────────────────────────────

impl Database for LocalPlatform {
  type Error = Error;

  async fn query(&self, query: Query) -> Result<Vec<Row>> { self.query_rows(query).await }

  async fn rpc(&self, name: &str, params: Value) -> Result<Value> { self.call_rpc(name, &params).await }

  async fn insert(&self, table: &str, row: Row) -> Result<Row> { self.insert_row(table, row).await }

  async fn update(&self, table: &str, patch: Value, filters: Vec<Filter>) -> Result<Vec<Row>> {
    self.update_rows(table, patch, &filters).await
  }

  /// Update the row whose `on_conflict` columns equal those of `row`, or
  /// insert it. Not atomic across concurrent writers.
  async fn upsert(&self, table: &str, row: Row, on_conflict: &[&str]) -> Result<Row> {
    let map = into_object(row, "upsert")?;
    if !on_conflict.is_empty() {
      let filters: Vec<Filter> = on_conflict
        .iter()
        .map(|column| Filter::eq(*column, map.get(*column).cloned().unwrap_or(Value::Null)))
        .collect();
      let updated = self
        .update_rows(table, Value::Object(map.clone()), &filters)
        .await?;
      if let Some(row) = updated.into_iter().next() {
        return Ok(row);
      }
    }
    self.insert_row(table, Value::Object(map)).await
  }

  async fn delete(&self, table: &str, filters: Vec<Filter>) -> Result<Vec<Row>> {
    self.delete_rows(table, &filters).await
  }
}

impl ObjectStorage for LocalPlatform {
  type Error = Error;

  async fn upload_object(
    &self,
    bucket: &str,
    key: &str,
    data: Bytes,
    content_type: &str,
  ) -> Result<()> {
    let sha256 = hex::encode(Sha256::digest(&data));
    let (b, k, ct) = (bucket.to_owned(), key.to_owned(), content_type.to_owned());
    let at = encode_dt(Utc::now());
    let size = data.len();

    let inserted = self
      .conn
      .call(move |conn| {
        let n = conn.execute(
          "INSERT INTO objects (bucket, key, content_type, sha256, data, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6)
           ON CONFLICT (bucket, key) DO NOTHING",
          params![b, k, ct, sha256, data.as_ref(), at],
        )?;
        Ok(n == 1)
      })
      .await?;

    if !inserted {
      return Err(Error::ObjectExists { bucket: bucket.to_owned(), key: key.to_owned() });
    }
    debug!(bucket, key, size, "stored object");
    Ok(())
  }

  /// Removing a missing object succeeds.
  async fn remove_object(&self, bucket: &str, key: &str) -> Result<()> {
    let (b, k) = (bucket.to_owned(), key.to_owned());
    self
      .conn
      .call(move |conn| {
        conn.execute("DELETE FROM objects WHERE bucket = ?1 AND key = ?2", params![b, k])?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}

impl Auth for LocalPlatform {
  type Error = Error;

  async fn session(&self) -> Result<Session> {
    self.session.read().await.clone().ok_or(Error::NotSignedIn)
  }
}

impl Realtime for LocalPlatform {
  type Error = Error;
  type Channel = LocalChannel;

  /// Validate `access_token` and use it for channels joined from now on.
  async fn set_auth(&self, access_token: &str) -> Result<()> {
    let token = access_token.to_owned();
    let user: Option<String> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT user_id FROM sessions WHERE access_token = ?1",
              params![token],
              |r| r.get(0),
            )
            .optional()?,
        )
      })
      .await?;

    let mut realtime_user = self.realtime_user.write().await;
    match user {
      Some(user) => {
        *realtime_user = Some(Uuid::parse_str(&user)?);
        Ok(())
      }
      None => {
        *realtime_user = None;
        Err(Error::InvalidToken)
      }
    }
  }

  fn channel(&self, topic: &str) -> LocalChannel {
    LocalChannel::new(topic, self.bus.clone(), Arc::clone(&self.realtime_user))
  }
}
