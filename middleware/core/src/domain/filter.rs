// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0
//! # Query Filter DSL
//!
//! Filtering, ordering and pagination implemented once over arbitrary JSON
//! row sequences. Used by CRUD `query`, `core.get_jobs`, `core.job_query`
//! and `audit.query`.
//!
//! ## Filters
//!
//! A filter list is an implicit AND of entries. Each entry is either a
//! triple `[field, op, value]` or a disjunction `["OR", [entry, ...]]`,
//! where each disjunct is itself an entry or a list of entries (AND).
//! Disjunctions nest at most [`MAX_OR_DEPTH`] deep. `field` may be a dotted
//! path into nested objects.
//!
//! | Op | Meaning |
//! |----|---------|
//! | `=` `!=` | equality |
//! | `>` `>=` `<` `<=` | ordering of numbers or strings |
//! | `~` | regex search on strings |
//! | `in` `nin` | field value is (not) one of `value` |
//! | `rin` `rnin` | `value` is (not) contained in the field (list or substring) |
//! | `^` `$` | string starts / ends with |
//!
//! ## Options
//!
//! `limit`, `offset`, `order_by` (`-field` descending, `nulls_first:` /
//! `nulls_last:` prefixes), `select`, `count`, `get`, `extra`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;

use crate::domain::error::CallError;

pub const MAX_OR_DEPTH: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Regex,
    In,
    Nin,
    Rin,
    Rnin,
    StartsWith,
    EndsWith,
}

impl Operator {
    pub fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "=" => Self::Eq,
            "!=" => Self::Ne,
            ">" => Self::Gt,
            ">=" => Self::Ge,
            "<" => Self::Lt,
            "<=" => Self::Le,
            "~" => Self::Regex,
            "in" => Self::In,
            "nin" => Self::Nin,
            "rin" => Self::Rin,
            "rnin" => Self::Rnin,
            "^" => Self::StartsWith,
            "$" => Self::EndsWith,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub enum Filter {
    Compare {
        field: String,
        op: Operator,
        value: Value,
        regex: Option<Regex>,
    },
    Or(Vec<Vec<Filter>>),
}

impl Filter {
    /// Parse a filter list (`[[field, op, value], ["OR", [...]], ...]`).
    pub fn parse_list(filters: &Value) -> Result<Vec<Filter>, CallError> {
        Self::parse_entries(filters, 0, "filters")
    }

    fn parse_entries(filters: &Value, depth: usize, path: &str) -> Result<Vec<Filter>, CallError> {
        let entries = filters
            .as_array()
            .ok_or_else(|| CallError::validation(path, "Filters must be a list"))?;
        entries
            .iter()
            .enumerate()
            .map(|(i, entry)| Self::parse_entry(entry, depth, &format!("{}.{}", path, i)))
            .collect()
    }

    fn parse_entry(entry: &Value, depth: usize, path: &str) -> Result<Filter, CallError> {
        let parts = entry
            .as_array()
            .ok_or_else(|| CallError::validation(path, "Filter must be a list"))?;

        if parts.len() == 2 && parts[0].as_str() == Some("OR") {
            if depth >= MAX_OR_DEPTH {
                return Err(CallError::validation(path, "Maximum OR nesting depth exceeded"));
            }
            let disjuncts = parts[1]
                .as_array()
                .ok_or_else(|| CallError::validation(path, "OR requires a list of filters"))?;
            let mut branches = Vec::with_capacity(disjuncts.len());
            for (i, disjunct) in disjuncts.iter().enumerate() {
                let branch_path = format!("{}.{}", path, i);
                // A disjunct is a single entry or a list of entries.
                let is_conjunction = disjunct
                    .as_array()
                    .and_then(|d| d.first())
                    .map(Value::is_array)
                    .unwrap_or(false);
                if is_conjunction {
                    branches.push(Self::parse_entries(disjunct, depth + 1, &branch_path)?);
                } else {
                    branches.push(vec![Self::parse_entry(disjunct, depth + 1, &branch_path)?]);
                }
            }
            return Ok(Filter::Or(branches));
        }

        if parts.len() != 3 {
            return Err(CallError::validation(path, "Filter must be [field, operator, value]"));
        }
        let field = parts[0]
            .as_str()
            .ok_or_else(|| CallError::validation(path, "Filter field must be a string"))?;
        let op_name = parts[1]
            .as_str()
            .ok_or_else(|| CallError::validation(path, "Filter operator must be a string"))?;
        let op = Operator::parse(op_name)
            .ok_or_else(|| CallError::validation(path, format!("Invalid operator: {}", op_name)))?;
        let value = parts[2].clone();

        let regex = match op {
            Operator::Regex => {
                let pattern = value
                    .as_str()
                    .ok_or_else(|| CallError::validation(path, "Regex filter value must be a string"))?;
                Some(Regex::new(pattern).map_err(|e| CallError::validation(path, e.to_string()))?)
            }
            Operator::In | Operator::Nin if !value.is_array() => {
                return Err(CallError::validation(path, format!("{} requires a list value", op_name)));
            }
            _ => None,
        };

        Ok(Filter::Compare {
            field: field.to_string(),
            op,
            value,
            regex,
        })
    }

    pub fn matches(&self, row: &Value) -> bool {
        match self {
            Filter::Or(branches) => branches
                .iter()
                .any(|branch| branch.iter().all(|f| f.matches(row))),
            Filter::Compare {
                field,
                op,
                value,
                regex,
            } => {
                let actual = lookup(row, field).unwrap_or(&Value::Null);
                compare(actual, *op, value, regex.as_ref())
            }
        }
    }
}

/// Resolve a dotted path inside a JSON object.
pub fn lookup<'a>(row: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(direct) = row.get(path) {
        return Some(direct);
    }
    path.split('.').try_fold(row, |current, key| match current {
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => current.get(key),
    })
}

fn compare(actual: &Value, op: Operator, expected: &Value, regex: Option<&Regex>) -> bool {
    match op {
        Operator::Eq => actual == expected,
        Operator::Ne => actual != expected,
        Operator::Gt => order(actual, expected) == Some(Ordering::Greater),
        Operator::Ge => matches!(order(actual, expected), Some(Ordering::Greater | Ordering::Equal)),
        Operator::Lt => order(actual, expected) == Some(Ordering::Less),
        Operator::Le => matches!(order(actual, expected), Some(Ordering::Less | Ordering::Equal)),
        Operator::Regex => match (actual.as_str(), regex) {
            (Some(s), Some(re)) => re.is_match(s),
            _ => false,
        },
        Operator::In => expected.as_array().map(|v| v.contains(actual)).unwrap_or(false),
        Operator::Nin => expected.as_array().map(|v| !v.contains(actual)).unwrap_or(true),
        Operator::Rin => contains(actual, expected),
        Operator::Rnin => !contains(actual, expected),
        Operator::StartsWith => match (actual.as_str(), expected.as_str()) {
            (Some(a), Some(e)) => a.starts_with(e),
            _ => false,
        },
        Operator::EndsWith => match (actual.as_str(), expected.as_str()) {
            (Some(a), Some(e)) => a.ends_with(e),
            _ => false,
        },
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::Array(items), _) => items.contains(needle),
        (Value::String(s), Value::String(n)) => s.contains(n.as_str()),
        _ => false,
    }
}

/// Ordering of two JSON scalars of the same kind; `None` across kinds.
fn order(a: &Value, b: &Value) -> Option<Ordering> {
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

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    /// 0 means unlimited
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub order_by: Vec<String>,
    #[serde(default)]
    pub select: Vec<String>,
    #[serde(default)]
    pub count: bool,
    /// Expect exactly one row; return it instead of a list
    #[serde(default)]
    pub get: bool,
    /// Service-specific extensions
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl QueryOptions {
    pub fn from_value(value: &Value) -> Result<Self, CallError> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone()).map_err(|e| CallError::validation("options", e.to_string()))
    }

    pub fn get() -> Self {
        Self {
            get: true,
            ..Default::default()
        }
    }
}

struct OrderKey<'a> {
    field: &'a str,
    descending: bool,
    nulls_first: Option<bool>,
}

fn parse_order_key(spec: &str) -> OrderKey<'_> {
    let (nulls_first, rest) = if let Some(rest) = spec.strip_prefix("nulls_first:") {
        (Some(true), rest)
    } else if let Some(rest) = spec.strip_prefix("nulls_last:") {
        (Some(false), rest)
    } else {
        (None, spec)
    };
    match rest.strip_prefix('-') {
        Some(field) => OrderKey {
            field,
            descending: true,
            nulls_first,
        },
        None => OrderKey {
            field: rest,
            descending: false,
            nulls_first,
        },
    }
}

fn order_rows(rows: &mut [Value], order_by: &[String]) {
    // Stable sorts applied from the least significant key.
    for spec in order_by.iter().rev() {
        let key = parse_order_key(spec);
        rows.sort_by(|a, b| {
            let x = lookup(a, key.field).filter(|v| !v.is_null());
            let y = lookup(b, key.field).filter(|v| !v.is_null());
            match (x, y) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) | (Some(_), None) => {
                    // Nulls sort last ascending and first descending unless told.
                    let nulls_first = key.nulls_first.unwrap_or(key.descending);
                    let x_is_null = x.is_none();
                    if x_is_null == nulls_first {
                        Ordering::Less
                    } else {
                        Ordering::Greater
                    }
                }
                (Some(x), Some(y)) => {
                    let ord = order(x, y).unwrap_or(Ordering::Equal);
                    if key.descending {
                        ord.reverse()
                    } else {
                        ord
                    }
                }
            }
        });
    }
}

fn select_fields(row: &Value, select: &[String]) -> Value {
    let mut out = Map::new();
    for field in select {
        let Some(value) = lookup(row, field) else {
            continue;
        };
        let mut parts = field.split('.').peekable();
        let mut target = &mut out;
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                target.insert(part.to_string(), value.clone());
                break;
            }
            let next = target
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !next.is_object() {
                *next = Value::Object(Map::new());
            }
            match next {
                Value::Object(map) => target = map,
                _ => break,
            }
        }
    }
    Value::Object(out)
}

/// Apply filters and options to `rows`.
///
/// Returns a list, a row (`get`), or a number (`count`). `get` on an empty
/// result is `MATCH_NOT_FOUND`.
pub fn filter_list(rows: Vec<Value>, filters: &[Filter], options: &QueryOptions) -> Result<Value, CallError> {
    let mut rows: Vec<Value> = rows
        .into_iter()
        .filter(|row| filters.iter().all(|f| f.matches(row)))
        .collect();

    if options.count {
        return Ok(Value::from(rows.len()));
    }

    order_rows(&mut rows, &options.order_by);

    let mut rows: Vec<Value> = rows.into_iter().skip(options.offset).collect();
    if options.limit > 0 {
        rows.truncate(options.limit);
    }

    if !options.select.is_empty() {
        rows = rows.iter().map(|r| select_fields(r, &options.select)).collect();
    }

    if options.get {
        return rows
            .into_iter()
            .next()
            .ok_or_else(|| CallError::MatchNotFound("No matching record".to_string()));
    }
    Ok(Value::Array(rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::ErrorCode;
    use serde_json::json;

    fn rows() -> Vec<Value> {
        vec![
            json!({"id": 1, "name": "tank", "size": 100, "tags": ["a"], "props": {"compression": "lz4"}}),
            json!({"id": 2, "name": "boot-pool", "size": 20, "tags": ["b"], "props": {"compression": "off"}}),
            json!({"id": 3, "name": "backup", "size": null, "tags": ["a", "b"], "props": {"compression": "zstd"}}),
        ]
    }

    fn query(filters: Value, options: Value) -> Result<Value, CallError> {
        let filters = Filter::parse_list(&filters)?;
        let options = QueryOptions::from_value(&options)?;
        filter_list(rows(), &filters, &options)
    }

    fn ids(value: Value) -> Vec<i64> {
        value
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["id"].as_i64().unwrap())
            .collect()
    }

    #[test]
    fn test_basic_operators() {
        assert_eq!(ids(query(json!([["name", "=", "tank"]]), json!({})).unwrap()), vec![1]);
        assert_eq!(ids(query(json!([["size", ">=", 20]]), json!({})).unwrap()), vec![1, 2]);
        assert_eq!(ids(query(json!([["id", "in", [1, 3]]]), json!({})).unwrap()), vec![1, 3]);
        assert_eq!(ids(query(json!([["tags", "rin", "b"]]), json!({})).unwrap()), vec![2, 3]);
        assert_eq!(ids(query(json!([["name", "~", "^b"]]), json!({})).unwrap()), vec![2, 3]);
        assert_eq!(ids(query(json!([["name", "$", "pool"]]), json!({})).unwrap()), vec![2]);
        assert_eq!(
            ids(query(json!([["props.compression", "!=", "off"]]), json!({})).unwrap()),
            vec![1, 3]
        );
    }

    #[test]
    fn test_or_with_conjunction() {
        let filters = json!([["OR", [["id", "=", 1], [["tags", "rin", "b"], ["size", "=", null]]]]]);
        assert_eq!(ids(query(filters, json!({})).unwrap()), vec![1, 3]);
    }

    #[test]
    fn test_or_depth_limit() {
        let deep = json!([["OR", [["OR", [["OR", [["OR", [["id", "=", 1]]]]]]]]]]);
        let err = query(deep, json!({})).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }

    #[test]
    fn test_order_by_with_nulls() {
        let value = query(json!([]), json!({"order_by": ["-size"]})).unwrap();
        assert_eq!(ids(value), vec![3, 1, 2]);
        let value = query(json!([]), json!({"order_by": ["nulls_last:-size"]})).unwrap();
        assert_eq!(ids(value), vec![1, 2, 3]);
        let value = query(json!([]), json!({"order_by": ["size"]})).unwrap();
        assert_eq!(ids(value), vec![2, 1, 3]);
    }

    #[test]
    fn test_pagination_select_count_get() {
        let value = query(json!([]), json!({"order_by": ["id"], "offset": 1, "limit": 1})).unwrap();
        assert_eq!(ids(value), vec![2]);

        let value = query(json!([]), json!({"select": ["id", "props.compression"]})).unwrap();
        assert_eq!(value[0], json!({"id": 1, "props": {"compression": "lz4"}}));

        assert_eq!(query(json!([["tags", "rin", "a"]]), json!({"count": true})).unwrap(), json!(2));

        let row = query(json!([["id", "=", 2]]), json!({"get": true})).unwrap();
        assert_eq!(row["name"], "boot-pool");

        let err = query(json!([["id", "=", 9]]), json!({"get": true})).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MatchNotFound);
    }

    #[test]
    fn test_invalid_operator_rejected() {
        let err = query(json!([["id", "like", 1]]), json!({})).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }
}
