//! Translation between JSON rows and the SQL used to query them.
//!
//! Columns are addressed with `json_extract(data, '$."column"')`; the path
//! and every comparison value are bound as parameters, never spliced into
//! the statement text.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use serde_json::{Map, Value};
use stride_core::query::{Filter, FilterOp, Query};

use crate::{Error, Result};

// ─── Values ──────────────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339_opts(SecondsFormat::Micros, true) }

/// Bind a JSON scalar the way `json_extract` would return it.
pub fn to_sql(value: &Value) -> SqlValue {
  match value {
    Value::Null => SqlValue::Null,
    Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
    Value::Number(n) => match n.as_i64() {
      Some(i) => SqlValue::Integer(i),
      None => SqlValue::Real(n.as_f64().unwrap_or_default()),
    },
    Value::String(s) => SqlValue::Text(s.clone()),
    other => SqlValue::Text(other.to_string()),
  }
}

pub fn json_path(column: &str) -> String { format!("$.\"{}\"", column.replace('"', "")) }

pub fn into_object(value: Value, what: &'static str) -> Result<Map<String, Value>> {
  match value {
    Value::Object(map) => Ok(map),
    _ => Err(Error::NotAnObject(what)),
  }
}

pub fn decode_row(data: &str) -> Result<Value> { Ok(serde_json::from_str(data)?) }

// ─── Statements ──────────────────────────────────────────────────────────────

/// A statement fragment with its positional parameters.
#[derive(Debug, Default)]
pub struct Sql {
  pub text:   String,
  pub params: Vec<SqlValue>,
}

impl Sql {
  fn bind(&mut self, value: SqlValue) -> usize {
    self.params.push(value);
    self.params.len()
  }
}

fn sql_op(op: FilterOp) -> &'static str {
  match op {
    FilterOp::Eq => "=",
    FilterOp::Neq => "!=",
    FilterOp::Lt => "<",
    FilterOp::Lte => "<=",
    FilterOp::Gt => ">",
    FilterOp::Gte => ">=",
    FilterOp::IsNull => "IS",
  }
}

/// `WHERE` clause restricting `rows` to `table` and every filter.
pub fn where_clause(table: &str, filters: &[Filter]) -> Sql {
  let mut sql = Sql::default();
  let t = sql.bind(SqlValue::Text(table.to_owned()));
  sql.text = format!("WHERE table_name = ?{t}");

  for filter in filters {
    let p = sql.bind(SqlValue::Text(json_path(&filter.column)));
    let column = format!("json_extract(data, ?{p})");
    let clause = match (filter.op, &filter.value) {
      (FilterOp::IsNull, _) | (FilterOp::Eq, Value::Null) => format!("{column} IS NULL"),
      (FilterOp::Neq, Value::Null) => format!("{column} IS NOT NULL"),
      (op, value) => {
        let v = sql.bind(to_sql(value));
        format!("{column} {} ?{v}", sql_op(op))
      }
    };
    sql.text.push_str(" AND ");
    sql.text.push_str(&clause);
  }
  sql
}

/// Full `SELECT id, data` statement for a query.
pub fn select(query: &Query) -> Sql {
  let mut sql = where_clause(&query.table, &query.filters);
  sql.text = format!("SELECT id, data FROM rows {}", sql.text);

  match &query.order {
    Some(order) => {
      let p = sql.bind(SqlValue::Text(json_path(&order.column)));
      let dir = if order.ascending { "ASC" } else { "DESC" };
      sql.text.push_str(&format!(" ORDER BY json_extract(data, ?{p}) {dir}, id {dir}"));
    }
    None => sql.text.push_str(" ORDER BY id ASC"),
  }

  // SQLite treats a negative limit as "no limit".
  let limit = query.range.limit.map_or(-1, |l| l as i64);
  let l = sql.bind(SqlValue::Integer(limit));
  let o = sql.bind(SqlValue::Integer(query.range.offset as i64));
  sql.text.push_str(&format!(" LIMIT ?{l} OFFSET ?{o}"));
  sql
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn filters_become_bound_json_extracts() {
    let q = Query::table("messages")
      .eq("conversation_id", 3)
      .lt("id", 100)
      .is_null("deleted_at")
      .order("id", false)
      .limit(30);
    let sql = select(&q);

    assert_eq!(
      sql.text,
      "SELECT id, data FROM rows WHERE table_name = ?1 \
       AND json_extract(data, ?2) = ?3 \
       AND json_extract(data, ?4) < ?5 \
       AND json_extract(data, ?6) IS NULL \
       ORDER BY json_extract(data, ?7) DESC, id DESC LIMIT ?8 OFFSET ?9"
    );
    assert_eq!(sql.params[1], SqlValue::Text("$.\"conversation_id\"".into()));
    assert_eq!(sql.params[2], SqlValue::Integer(3));
    assert_eq!(sql.params[7], SqlValue::Integer(30));
  }

  #[test]
  fn column_names_cannot_escape_the_path() {
    assert_eq!(json_path("a\"b"), "$.\"ab\"");
  }

  #[test]
  fn scalars_bind_like_json_extract() {
    assert_eq!(to_sql(&json!(true)), SqlValue::Integer(1));
    assert_eq!(to_sql(&json!(1.5)), SqlValue::Real(1.5));
    assert_eq!(to_sql(&json!("x")), SqlValue::Text("x".into()));
    assert_eq!(to_sql(&json!(null)), SqlValue::Null);
  }
}
