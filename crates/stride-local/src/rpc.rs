//! Stored procedures of the local platform.
//!
//! Procedures act as the signed-in user. Conversations live in the
//! `conversations` table; membership and read positions in the
//! `conversation_members` SQL table.

use rusqlite::{OptionalExtension as _, params};
use serde_json::{Value, json};
use stride_core::{
  message::{ConversationId, MessageId, UserId, row_i64},
  query::Query,
};
use tracing::debug;
use uuid::Uuid;

use crate::{Error, LocalPlatform, Result};

pub const MESSAGES: &str = "messages";
pub const CONVERSATIONS: &str = "conversations";

fn param_i64(params: &Value, name: &'static str) -> Result<i64> {
  params.get(name).and_then(Value::as_i64).ok_or(Error::InvalidParam(name))
}

fn param_str<'a>(params: &'a Value, name: &'static str) -> Result<&'a str> {
  params.get(name).and_then(Value::as_str).ok_or(Error::InvalidParam(name))
}

fn param_uuid(params: &Value, name: &'static str) -> Result<Uuid> {
  Uuid::parse_str(param_str(params, name)?).map_err(|_| Error::InvalidParam(name))
}

/// Order-independent key identifying the direct conversation of two users.
fn direct_key(a: UserId, b: UserId) -> String {
  let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
  format!("{lo}:{hi}")
}

impl LocalPlatform {
  pub(crate) async fn call_rpc(&self, name: &str, params: &Value) -> Result<Value> {
    debug!(name, "rpc");
    match name {
      "send_message" => self.send_message(params).await,
      "mark_conversation_read" => self.mark_conversation_read(params).await,
      "start_direct_conversation" => self.start_direct_conversation(params).await,
      other => Err(Error::UnknownFunction(other.to_owned())),
    }
  }

  async fn send_message(&self, params: &Value) -> Result<Value> {
    let conversation_id = param_i64(params, "p_conversation_id")?;
    let body = param_str(params, "p_body")?;
    if body.trim().is_empty() {
      return Err(Error::InvalidParam("p_body"));
    }
    let author = self.caller().await?;
    self.ensure_member(conversation_id, author).await?;

    let row = self
      .insert_row(
        MESSAGES,
        json!({
          "conversation_id": conversation_id,
          "author_id": author,
          "kind": "text",
          "body": body,
        }),
      )
      .await?;
    let id = row_i64(&row, "id")?;
    self.advance_read(conversation_id, author, id).await?;
    Ok(json!(id))
  }

  async fn mark_conversation_read(&self, params: &Value) -> Result<Value> {
    let conversation_id = param_i64(params, "p_conversation_id")?;
    let message_id = param_i64(params, "p_message_id")?;
    let user = self.caller().await?;
    self.ensure_member(conversation_id, user).await?;
    self.advance_read(conversation_id, user, message_id).await?;
    Ok(Value::Null)
  }

  /// Find or create the direct conversation between the caller and
  /// `p_other_user_id`.
  async fn start_direct_conversation(&self, params: &Value) -> Result<Value> {
    let other = param_uuid(params, "p_other_user_id")?;
    let me = self.caller().await?;
    if other == me {
      return Err(Error::InvalidParam("p_other_user_id"));
    }

    let key = direct_key(me, other);
    let existing = self
      .query_rows(Query::table(CONVERSATIONS).eq("direct_key", key.as_str()).limit(1))
      .await?;
    if let Some(row) = existing.first() {
      return Ok(json!(row_i64(row, "id")?));
    }

    let row = self
      .insert_row(CONVERSATIONS, json!({ "kind": "direct", "direct_key": key }))
      .await?;
    let id = row_i64(&row, "id")?;
    self.add_member(id, me).await?;
    self.add_member(id, other).await?;
    debug!(conversation_id = id, %me, %other, "created direct conversation");
    Ok(json!(id))
  }

  // ── Membership ──────────────────────────────────────────────────────────

  /// Add `user` to a conversation; a no-op if already a member.
  pub async fn add_member(&self, conversation_id: ConversationId, user: UserId) -> Result<()> {
    let user = user.hyphenated().to_string();
    self
      .conn()
      .call(move |conn| {
        conn.execute(
          "INSERT INTO conversation_members (conversation_id, user_id) VALUES (?1, ?2)
           ON CONFLICT DO NOTHING",
          params![conversation_id, user],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// The newest message `user` has read, if any.
  pub async fn last_read(
    &self,
    conversation_id: ConversationId,
    user: UserId,
  ) -> Result<Option<MessageId>> {
    let user_str = user.hyphenated().to_string();
    let found: Option<Option<i64>> = self
      .conn()
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT last_read_message_id FROM conversation_members
               WHERE conversation_id = ?1 AND user_id = ?2",
              params![conversation_id, user_str],
              |r| r.get(0),
            )
            .optional()?,
        )
      })
      .await?;
    found.ok_or(Error::NotAMember { conversation_id, user_id: user })
  }

  async fn ensure_member(&self, conversation_id: ConversationId, user: UserId) -> Result<()> {
    self.last_read(conversation_id, user).await.map(|_| ())
  }

  /// Move the read position forward; never backwards.
  async fn advance_read(
    &self,
    conversation_id: ConversationId,
    user: UserId,
    message_id: MessageId,
  ) -> Result<()> {
    let user = user.hyphenated().to_string();
    self
      .conn()
      .call(move |conn| {
        conn.execute(
          "UPDATE conversation_members
           SET last_read_message_id = MAX(COALESCE(last_read_message_id, 0), ?3)
           WHERE conversation_id = ?1 AND user_id = ?2",
          params![conversation_id, user, message_id],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}
