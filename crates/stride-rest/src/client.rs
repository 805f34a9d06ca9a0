//! Async HTTP client for the hosted platform.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::Utc;
use reqwest::{Client, Method, RequestBuilder, Response, header::CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{Value, json};
use stride_core::{
  message::UserId,
  platform::{Auth, Database, ObjectStorage, Row},
  query::{Filter, Query},
  session::Session,
};
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
  Error, Result,
  encode::{filter_params, query_params},
};

/// Refresh the access token when it expires within this margin.
fn refresh_margin() -> chrono::Duration { chrono::Duration::seconds(60) }

/// Connection settings for the hosted platform.
#[derive(Debug, Clone, Deserialize)]
pub struct RestConfig {
  pub base_url:     String,
  /// Public API key, sent with every request.
  pub api_key:      String,
  #[serde(default = "default_timeout")]
  pub timeout_secs: u64,
}

fn default_timeout() -> u64 { 30 }

#[derive(Deserialize)]
struct TokenUser {
  id: UserId,
}

#[derive(Deserialize)]
struct TokenResponse {
  access_token:  String,
  refresh_token: Option<String>,
  expires_in:    Option<i64>,
  user:          TokenUser,
}

impl From<TokenResponse> for Session {
  fn from(t: TokenResponse) -> Self {
    Session {
      user_id:       t.user.id,
      access_token:  t.access_token,
      refresh_token: t.refresh_token,
      expires_at:    t
        .expires_in
        .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
    }
  }
}

/// Async HTTP client for the row, RPC, storage and auth endpoints.
///
/// Cheap to clone; clones share the HTTP pool and the session.
#[derive(Clone)]
pub struct RestClient {
  http:    Client,
  config:  Arc<RestConfig>,
  session: Arc<RwLock<Option<Session>>>,
}

impl RestClient {
  pub fn new(config: RestConfig) -> Result<Self> {
    let http = Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()?;
    Ok(Self {
      http,
      config: Arc::new(config),
      session: Arc::default(),
    })
  }

  fn url(&self, path: &str) -> String {
    format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
  }

  /// Attach the API key and a bearer token: the session's access token when
  /// signed in, otherwise the API key itself.
  async fn request(&self, method: Method, path: &str) -> RequestBuilder {
    let bearer = match self.session.read().await.as_ref() {
      Some(session) => session.access_token.clone(),
      None => self.config.api_key.clone(),
    };
    self
      .http
      .request(method, self.url(path))
      .header("apikey", &self.config.api_key)
      .bearer_auth(bearer)
  }

  async fn send(&self, method: Method, path: &str, req: RequestBuilder) -> Result<Response> {
    debug!(%method, path, "request");
    let resp = req.send().await?;
    let status = resp.status();
    if status.is_success() {
      return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(Error::Status { method, path: path.to_owned(), status, body })
  }

  /// Decode a JSON body; an empty body reads as `null`.
  async fn json(resp: Response) -> Result<Value> {
    let bytes = resp.bytes().await?;
    if bytes.is_empty() {
      return Ok(Value::Null);
    }
    Ok(serde_json::from_slice(&bytes)?)
  }

  fn rows(value: Value) -> Vec<Row> {
    match value {
      Value::Array(rows) => rows,
      Value::Null => Vec::new(),
      row => vec![row],
    }
  }

  // ── Auth ────────────────────────────────────────────────────────────────

  /// `POST /auth/v1/token?grant_type=password`
  pub async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session> {
    let session = self
      .token("password", json!({ "email": email, "password": password }))
      .await?;
    debug!(user_id = %session.user_id, "signed in");
    Ok(session)
  }

  /// `POST /auth/v1/token?grant_type=refresh_token`
  pub async fn refresh(&self) -> Result<Session> {
    let refresh_token = self
      .session
      .read()
      .await
      .as_ref()
      .ok_or(Error::NotSignedIn)?
      .refresh_token
      .clone()
      .ok_or(Error::SessionExpired)?;
    self
      .token("refresh_token", json!({ "refresh_token": refresh_token }))
      .await
  }

  async fn token(&self, grant_type: &str, body: Value) -> Result<Session> {
    let path = format!("/auth/v1/token?grant_type={grant_type}");
    let req = self
      .http
      .post(self.url(&path))
      .header("apikey", &self.config.api_key)
      .json(&body);
    let resp = self.send(Method::POST, &path, req).await?;
    let session = Session::from(resp.json::<TokenResponse>().await?);
    *self.session.write().await = Some(session.clone());
    Ok(session)
  }

  /// Adopt a session obtained elsewhere, e.g. restored from disk.
  pub async fn set_session(&self, session: Session) { *self.session.write().await = Some(session); }

  pub async fn sign_out(&self) { self.session.write().await.take(); }

  // ── Rows ────────────────────────────────────────────────────────────────

  async fn write(
    &self,
    method: Method,
    table: &str,
    params: Vec<(String, String)>,
    prefer: &str,
    body: Option<Value>,
  ) -> Result<Vec<Row>> {
    let path = format!("/rest/v1/{table}");
    let mut req = self
      .request(method.clone(), &path)
      .await
      .query(&params)
      .header("Prefer", prefer);
    if let Some(body) = body {
      req = req.json(&body);
    }
    let resp = self.send(method, &path, req).await?;
    Ok(Self::rows(Self::json(resp).await?))
  }

  // ── Storage ─────────────────────────────────────────────────────────────

  fn object_path(bucket: &str, key: &str) -> String { format!("/storage/v1/object/{bucket}/{key}") }
}

// ─── Trait impls ─────────────────────────────────────────────────────────────

impl Database for RestClient {
  type Error = Error;

  /// `GET /rest/v1/{table}?select=*&…`
  async fn query(&self, query: Query) -> Result<Vec<Row>> {
    let path = format!("/rest/v1/{}", query.table);
    let req = self
      .request(Method::GET, &path)
      .await
      .query(&query_params(&query));
    let resp = self.send(Method::GET, &path, req).await?;
    Ok(Self::rows(Self::json(resp).await?))
  }

  /// `POST /rest/v1/rpc/{name}`
  async fn rpc(&self, name: &str, params: Value) -> Result<Value> {
    let path = format!("/rest/v1/rpc/{name}");
    let req = self.request(Method::POST, &path).await.json(&params);
    let resp = self.send(Method::POST, &path, req).await?;
    Self::json(resp).await
  }

  async fn insert(&self, table: &str, row: Row) -> Result<Row> {
    self
      .write(Method::POST, table, Vec::new(), "return=representation", Some(row))
      .await?
      .into_iter()
      .next()
      .ok_or_else(|| Error::NoRows(format!("insert into {table}")))
  }

  async fn update(&self, table: &str, patch: Value, filters: Vec<Filter>) -> Result<Vec<Row>> {
    self
      .write(
        Method::PATCH,
        table,
        filter_params(&filters),
        "return=representation",
        Some(patch),
      )
      .await
  }

  async fn upsert(&self, table: &str, row: Row, on_conflict: &[&str]) -> Result<Row> {
    let params = vec![("on_conflict".to_owned(), on_conflict.join(","))];
    self
      .write(
        Method::POST,
        table,
        params,
        "return=representation,resolution=merge-duplicates",
        Some(row),
      )
      .await?
      .into_iter()
      .next()
      .ok_or_else(|| Error::NoRows(format!("upsert into {table}")))
  }

  async fn delete(&self, table: &str, filters: Vec<Filter>) -> Result<Vec<Row>> {
    self
      .write(
        Method::DELETE,
        table,
        filter_params(&filters),
        "return=representation",
        None,
      )
      .await
  }
}

impl ObjectStorage for RestClient {
  type Error = Error;

  /// `POST /storage/v1/object/{bucket}/{key}`
  async fn upload_object(
    &self,
    bucket: &str,
    key: &str,
    data: Bytes,
    content_type: &str,
  ) -> Result<()> {
    let path = Self::object_path(bucket, key);
    let req = self
      .request(Method::POST, &path)
      .await
      .header(CONTENT_TYPE, content_type)
      .body(data);
    self.send(Method::POST, &path, req).await?;
    Ok(())
  }

  /// `DELETE /storage/v1/object/{bucket}/{key}`
  async fn remove_object(&self, bucket: &str, key: &str) -> Result<()> {
    let path = Self::object_path(bucket, key);
    let req = self.request(Method::DELETE, &path).await;
    self.send(Method::DELETE, &path, req).await?;
    Ok(())
  }
}

impl Auth for RestClient {
  type Error = Error;

  /// The current session, refreshed first if it is about to expire.
  async fn session(&self) -> Result<Session> {
    let current = self.session.read().await.clone().ok_or(Error::NotSignedIn)?;
    if current.expires_within(Utc::now(), refresh_margin()) {
      debug!(user_id = %current.user_id, "refreshing session");
      return self.refresh().await;
    }
    Ok(current)
  }
}
