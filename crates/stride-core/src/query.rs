//! Row queries: table, filters, ordering and an offset/limit window.
//!
//! The model is small (equality/inequality filters, a single order column
//! and a range) because that is all the hosted row API offers.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Filters ─────────────────────────────────────────────────────────────────

/// Comparison applied by a [`Filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
  Eq,
  Neq,
  Lt,
  Lte,
  Gt,
  Gte,
  /// `IS NULL`; the filter value is ignored.
  IsNull,
}

impl FilterOp {
  /// The operator name used on the wire (`column=op.value`).
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Eq => "eq",
      Self::Neq => "neq",
      Self::Lt => "lt",
      Self::Lte => "lte",
      Self::Gt => "gt",
      Self::Gte => "gte",
      Self::IsNull => "is",
    }
  }
}

/// A single `column <op> value` predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
  pub column: String,
  pub op:     FilterOp,
  pub value:  Value,
}

impl Filter {
  pub fn new(
    column: impl Into<String>,
    op: FilterOp,
    value: impl Into<Value>,
  ) -> Self {
    Self { column: column.into(), op, value: value.into() }
  }

  pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
    Self::new(column, FilterOp::Eq, value)
  }

  /// Evaluate the predicate against a JSON row. Missing columns compare as
  /// `null`; values of different types never match an ordering operator.
  pub fn matches(&self, row: &Value) -> bool {
    let actual = row.get(&self.column).unwrap_or(&Value::Null);
    match self.op {
      FilterOp::IsNull => actual.is_null(),
      FilterOp::Eq => loose_eq(actual, &self.value),
      FilterOp::Neq => !actual.is_null() && !loose_eq(actual, &self.value),
      FilterOp::Lt => compare(actual, &self.value) == Some(Ordering::Less),
      FilterOp::Lte => matches!(
        compare(actual, &self.value),
        Some(Ordering::Less | Ordering::Equal)
      ),
      FilterOp::Gt => compare(actual, &self.value) == Some(Ordering::Greater),
      FilterOp::Gte => matches!(
        compare(actual, &self.value),
        Some(Ordering::Greater | Ordering::Equal)
      ),
    }
  }
}

/// Equality that treats `5` and `5.0` as equal.
fn loose_eq(a: &Value, b: &Value) -> bool {
  match (a, b) {
    (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
    _ => a == b,
  }
}

/// Order two scalars of the same JSON type.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
  match (a, b) {
    (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
      (Some(x), Some(y)) => Some(x.cmp(&y)),
      _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
    },
    (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
    (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
    _ => None,
  }
}

// ─── Ordering and range ──────────────────────────────────────────────────────

/// Single-column ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
  pub column:    String,
  pub ascending: bool,
}

/// Offset/limit window applied after ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Range {
  pub offset: usize,
  pub limit:  Option<usize>,
}

// ─── Query ───────────────────────────────────────────────────────────────────

/// Parameters for [`crate::platform::Database::query`].
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
  pub table:   String,
  /// All filters must match (logical AND).
  pub filters: Vec<Filter>,
  pub order:   Option<Order>,
  pub range:   Range,
}

impl Query {
  pub fn table(table: impl Into<String>) -> Self {
    Self {
      table:   table.into(),
      filters: Vec::new(),
      order:   None,
      range:   Range::default(),
    }
  }

  pub fn filter(mut self, filter: Filter) -> Self {
    self.filters.push(filter);
    self
  }

  pub fn eq(self, column: &str, value: impl Into<Value>) -> Self {
    self.filter(Filter::new(column, FilterOp::Eq, value))
  }

  pub fn neq(self, column: &str, value: impl Into<Value>) -> Self {
    self.filter(Filter::new(column, FilterOp::Neq, value))
  }

  pub fn lt(self, column: &str, value: impl Into<Value>) -> Self {
    self.filter(Filter::new(column, FilterOp::Lt, value))
  }

  pub fn lte(self, column: &str, value: impl Into<Value>) -> Self {
    self.filter(Filter::new(column, FilterOp::Lte, value))
  }

  pub fn gt(self, column: &str, value: impl Into<Value>) -> Self {
    self.filter(Filter::new(column, FilterOp::Gt, value))
  }

  pub fn gte(self, column: &str, value: impl Into<Value>) -> Self {
    self.filter(Filter::new(column, FilterOp::Gte, value))
  }

  pub fn is_null(self, column: &str) -> Self {
    self.filter(Filter::new(column, FilterOp::IsNull, Value::Null))
  }

  pub fn order(mut self, column: &str, ascending: bool) -> Self {
    self.order = Some(Order { column: column.to_owned(), ascending });
    self
  }

  pub fn limit(mut self, limit: usize) -> Self {
    self.range.limit = Some(limit);
    self
  }

  pub fn offset(mut self, offset: usize) -> Self {
    self.range.offset = offset;
    self
  }

  /// True if every filter matches `row`.
  pub fn matches(&self, row: &Value) -> bool {
    self.filters.iter().all(|f| f.matches(row))
  }

  /// Evaluate the query in memory over `rows` of this query's table.
  pub fn apply(&self, rows: impl IntoIterator<Item = Value>) -> Vec<Value> {
    let mut out: Vec<Value> =
      rows.into_iter().filter(|r| self.matches(r)).collect();

    if let Some(order) = &self.order {
      out.sort_by(|a, b| {
        let a = a.get(&order.column).unwrap_or(&Value::Null);
        let b = b.get(&order.column).unwrap_or(&Value::Null);
        let ord = compare(a, b).unwrap_or(Ordering::Equal);
        if order.ascending { ord } else { ord.reverse() }
      });
    }

    let limit = self.range.limit.unwrap_or(usize::MAX);
    out.into_iter().skip(self.range.offset).take(limit).collect()
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn filters_compare_numbers_and_strings() {
    let row = json!({ "id": 10, "kind": "text", "deleted_at": null });
    assert!(Filter::eq("id", 10).matches(&row));
    assert!(Filter::eq("id", 10.0).matches(&row));
    assert!(Filter::new("id", FilterOp::Lt, 11).matches(&row));
    assert!(!Filter::new("id", FilterOp::Lt, 10).matches(&row));
    assert!(Filter::new("id", FilterOp::Lte, 10).matches(&row));
    assert!(Filter::new("kind", FilterOp::Neq, "image").matches(&row));
    assert!(Filter::new("deleted_at", FilterOp::IsNull, Value::Null).matches(&row));
    assert!(Filter::new("missing", FilterOp::IsNull, Value::Null).matches(&row));
  }

  #[test]
  fn mixed_types_never_order() {
    let row = json!({ "id": "10" });
    assert!(!Filter::new("id", FilterOp::Gt, 1).matches(&row));
    assert!(!Filter::new("id", FilterOp::Lt, 100).matches(&row));
  }

  #[test]
  fn apply_orders_and_windows() {
    let rows = (1..=10).map(|i| json!({ "id": i, "conversation_id": i % 2 }));
    let q = Query::table("messages")
      .eq("conversation_id", 0)
      .lt("id", 9)
      .order("id", false)
      .limit(2);
    let ids: Vec<i64> = q
      .apply(rows)
      .iter()
      .map(|r| r["id"].as_i64().unwrap())
      .collect();
    assert_eq!(ids, vec![8, 6]);
  }

  #[test]
  fn apply_with_offset() {
    let rows = (1..=5).map(|i| json!({ "id": i }));
    let q = Query::table("t").order("id", true).offset(3);
    assert_eq!(q.apply(rows).len(), 2);
  }
}
