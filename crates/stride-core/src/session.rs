//! Authenticated session issued by the platform's auth service.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::message::UserId;

/// An access token plus the user it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
  pub user_id:       UserId,
  pub access_token:  String,
  #[serde(default)]
  pub refresh_token: Option<String>,
  /// `None` for tokens that never expire (local emulator, service keys).
  #[serde(default)]
  pub expires_at:    Option<DateTime<Utc>>,
}

impl Session {
  /// True if the token expires within `margin` of `now`.
  pub fn expires_within(&self, now: DateTime<Utc>, margin: Duration) -> bool {
    self.expires_at.is_some_and(|at| at - margin <= now)
  }
}
