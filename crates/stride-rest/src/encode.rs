//! Query-string encoding for the row API (`column=op.value`).

use serde_json::Value;
use stride_core::query::{Filter, FilterOp, Query};

/// Render a scalar the way the row API expects it after the operator.
fn scalar(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

pub fn filter_param(filter: &Filter) -> (String, String) {
  let value = match (filter.op, &filter.value) {
    (FilterOp::IsNull, _) | (FilterOp::Eq, Value::Null) => "is.null".to_owned(),
    (FilterOp::Neq, Value::Null) => "not.is.null".to_owned(),
    (op, value) => format!("{}.{}", op.as_str(), scalar(value)),
  };
  (filter.column.clone(), value)
}

pub fn filter_params(filters: &[Filter]) -> Vec<(String, String)> {
  filters.iter().map(filter_param).collect()
}

/// Every query-string pair of a read.
pub fn query_params(query: &Query) -> Vec<(String, String)> {
  let mut params = vec![("select".to_owned(), "*".to_owned())];
  params.extend(filter_params(&query.filters));
  if let Some(order) = &query.order {
    let dir = if order.ascending { "asc" } else { "desc" };
    params.push(("order".to_owned(), format!("{}.{dir}", order.column)));
  }
  if let Some(limit) = query.range.limit {
    params.push(("limit".to_owned(), limit.to_string()));
  }
  if query.range.offset > 0 {
    params.push(("offset".to_owned(), query.range.offset.to_string()));
  }
  params
}
