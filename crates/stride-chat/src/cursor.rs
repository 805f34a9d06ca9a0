//! Backward pagination state.

use stride_core::{
  message::{MessageId, row_i64},
  platform::Row,
};

use crate::remote::COL_ID;

/// Tracks how far back the conversation has been loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
  /// Smallest id loaded so far; `None` until a page with any id arrives.
  pub oldest_loaded_id: Option<MessageId>,
  /// True iff the most recent page came back full, so older rows may exist.
  pub has_older:        bool,
}

impl Cursor {
  /// Reset after the newest page. `oldest` is the smallest id now loaded
  /// (see [`lowest`]); `raw_count` is the number of rows the platform
  /// returned, before any were dropped by decoding.
  pub fn first_page(&mut self, oldest: Option<MessageId>, raw_count: usize, page_size: usize) {
    self.oldest_loaded_id = oldest;
    self.has_older = raw_count == page_size;
  }

  /// Advance past an older page. `raw_count` is counted before decoding and
  /// deduplication.
  pub fn older_page(&mut self, oldest: Option<MessageId>, raw_count: usize, page_size: usize) {
    self.oldest_loaded_id = lowest(self.oldest_loaded_id, oldest);
    self.has_older = raw_count == page_size;
  }

  /// The exclusive upper bound for the next older page, if paging is
  /// possible.
  pub fn next_before(&self) -> Option<MessageId> {
    if self.has_older { self.oldest_loaded_id } else { None }
  }
}

pub fn lowest(a: Option<MessageId>, b: Option<MessageId>) -> Option<MessageId> {
  match (a, b) {
    (Some(a), Some(b)) => Some(a.min(b)),
    (a, b) => a.or(b),
  }
}

/// Smallest id among raw rows, including rows that fail to decode as
/// messages.
pub fn lowest_row_id(rows: &[Row]) -> Option<MessageId> {
  rows.iter().filter_map(|row| row_i64(row, COL_ID).ok()).min()
}
