//! Operator-driven filtering, ordering, and pagination over the relational store
//!
//! Filters are typed ([`Filter`]) so the query builder never inspects untyped maps.
//! Loosely-shaped input (for example a JSON object assembled from request parameters)
//! goes through [`Query::from_params`] once, at the boundary.
//!
//! Field names that are not columns of the target table are ignored, as is an unknown
//! `order_by`. A "many" query with no matches yields an empty `Vec`; a "first" query
//! yields `None`. Neither is an error.

use crate::db::Database;
use crate::error::DatabaseError;
use crate::{Error, Result};
use serde_json::Value as Json;
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, QueryBuilder, Sqlite};

/// A scalar operand
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Text value
    Text(String),
    /// Integer value (booleans are stored as 0/1)
    Integer(i64),
    /// Floating point value
    Real(f64),
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl Value {
    fn from_json(json: &Json) -> Result<Self> {
        match json {
            Json::String(s) => Ok(Value::Text(s.clone())),
            Json::Bool(b) => Ok(Value::from(*b)),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Integer(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Value::Real(f))
                } else {
                    Err(Error::Validation(format!("unsupported number {}", n)))
                }
            }
            other => Err(Error::Validation(format!(
                "expected a scalar operand, got {}",
                other
            ))),
        }
    }

    fn push(self, qb: &mut QueryBuilder<'static, Sqlite>) {
        match self {
            Value::Text(v) => qb.push_bind(v),
            Value::Integer(v) => qb.push_bind(v),
            Value::Real(v) => qb.push_bind(v),
        };
    }
}

/// Condition applied to one field
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    /// `=`
    Equals(Value),
    /// `!=`
    NotEquals(Value),
    /// `>`
    GreaterThan(Value),
    /// `<`
    LessThan(Value),
    /// `>=`
    AtLeast(Value),
    /// `<=`
    AtMost(Value),
    /// `in`
    In(Vec<Value>),
    /// `not in`
    NotIn(Vec<Value>),
    /// Substring match
    Like(String),
    /// Negated substring match
    NotLike(String),
    /// Inclusive range
    Between(Value, Value),
    /// `is null`
    IsNull,
    /// `is not null`
    IsNotNull,
    /// NULL or the empty string
    IsEmpty,
    /// Neither NULL nor the empty string
    IsNotEmpty,
}

impl Filter {
    /// Parse one filter value
    ///
    /// A literal means equality (`null` means `is null`); an object carries an
    /// `operator` and a `value`. Unrecognised operators fall back to equality.
    pub fn from_json(json: &Json) -> Result<Self> {
        let Json::Object(map) = json else {
            return match json {
                Json::Null => Ok(Filter::IsNull),
                Json::Array(_) => Err(Error::Validation(
                    "a list operand needs an explicit 'in' or 'not in' operator".into(),
                )),
                literal => Ok(Filter::Equals(Value::from_json(literal)?)),
            };
        };

        let operator = map
            .get("operator")
            .and_then(Json::as_str)
            .ok_or_else(|| Error::Validation("filter object is missing 'operator'".into()))?
            .trim()
            .to_ascii_lowercase();
        let value = map.get("value").unwrap_or(&Json::Null);

        let filter = match operator.as_str() {
            "is null" => Filter::IsNull,
            "is not null" => Filter::IsNotNull,
            "is empty" => Filter::IsEmpty,
            "is not empty" => Filter::IsNotEmpty,
            "!=" => Filter::NotEquals(Value::from_json(value)?),
            ">" => Filter::GreaterThan(Value::from_json(value)?),
            "<" => Filter::LessThan(Value::from_json(value)?),
            ">=" => Filter::AtLeast(Value::from_json(value)?),
            "<=" => Filter::AtMost(Value::from_json(value)?),
            "like" => Filter::Like(like_operand(value)?),
            "not like" => Filter::NotLike(like_operand(value)?),
            "in" => Filter::In(list_operand(value)?),
            "not in" => Filter::NotIn(list_operand(value)?),
            "between" => match value {
                Json::Array(bounds) if bounds.len() == 2 => {
                    Filter::Between(Value::from_json(&bounds[0])?, Value::from_json(&bounds[1])?)
                }
                _ => {
                    return Err(Error::Validation(
                        "'between' needs a two-element [low, high] range".into(),
                    ));
                }
            },
            _ => Filter::Equals(Value::from_json(value)?),
        };
        Ok(filter)
    }

    fn push(self, field: &str, qb: &mut QueryBuilder<'static, Sqlite>) {
        match self {
            Filter::Equals(v) => push_compare(qb, field, " = ", v),
            Filter::NotEquals(v) => push_compare(qb, field, " != ", v),
            Filter::GreaterThan(v) => push_compare(qb, field, " > ", v),
            Filter::LessThan(v) => push_compare(qb, field, " < ", v),
            Filter::AtLeast(v) => push_compare(qb, field, " >= ", v),
            Filter::AtMost(v) => push_compare(qb, field, " <= ", v),
            Filter::Like(s) => push_compare(qb, field, " LIKE ", Value::Text(format!("%{}%", s))),
            Filter::NotLike(s) => {
                push_compare(qb, field, " NOT LIKE ", Value::Text(format!("%{}%", s)))
            }
            Filter::In(values) if values.is_empty() => {
                qb.push("1 = 0");
            }
            Filter::NotIn(values) if values.is_empty() => {
                qb.push("1 = 1");
            }
            Filter::In(values) => push_list(qb, field, " IN (", values),
            Filter::NotIn(values) => push_list(qb, field, " NOT IN (", values),
            Filter::Between(low, high) => {
                qb.push(field).push(" BETWEEN ");
                low.push(qb);
                qb.push(" AND ");
                high.push(qb);
            }
            Filter::IsNull => {
                qb.push(field).push(" IS NULL");
            }
            Filter::IsNotNull => {
                qb.push(field).push(" IS NOT NULL");
            }
            Filter::IsEmpty => {
                qb.push(format!("({field} IS NULL OR {field} = '')"));
            }
            Filter::IsNotEmpty => {
                qb.push(format!("({field} IS NOT NULL AND {field} != '')"));
            }
        }
    }
}

fn like_operand(value: &Json) -> Result<String> {
    match Value::from_json(value)? {
        Value::Text(s) => Ok(s),
        Value::Integer(i) => Ok(i.to_string()),
        Value::Real(f) => Ok(f.to_string()),
    }
}

fn list_operand(value: &Json) -> Result<Vec<Value>> {
    match value {
        Json::Array(items) => items.iter().map(Value::from_json).collect(),
        single => Ok(vec![Value::from_json(single)?]),
    }
}

fn push_compare(qb: &mut QueryBuilder<'static, Sqlite>, field: &str, op: &str, value: Value) {
    qb.push(field).push(op);
    value.push(qb);
}

fn push_list(qb: &mut QueryBuilder<'static, Sqlite>, field: &str, open: &str, values: Vec<Value>) {
    qb.push(field).push(open);
    for (i, value) in values.into_iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        value.push(qb);
    }
    qb.push(")");
}

/// Filter, ordering, and pagination for one entity type
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    /// Conditions, ANDed together
    pub filters: Vec<(String, Filter)>,
    /// Column to order by; the entity's default when absent or unknown
    pub order_by: Option<String>,
    /// Sort direction (default: descending)
    pub descending: bool,
    /// Rows skipped after ordering
    pub skip: Option<i64>,
    /// Maximum rows returned
    pub limit: Option<i64>,
}

impl Default for Query {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            order_by: None,
            descending: true,
            skip: None,
            limit: None,
        }
    }
}

impl Query {
    /// Empty query: everything, default order, descending
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a condition
    pub fn filter(mut self, field: impl Into<String>, filter: Filter) -> Self {
        self.filters.push((field.into(), filter));
        self
    }

    /// Shorthand for an equality condition
    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(field, Filter::Equals(value.into()))
    }

    /// Order by `field`
    pub fn order_by(mut self, field: impl Into<String>, descending: bool) -> Self {
        self.order_by = Some(field.into());
        self.descending = descending;
        self
    }

    /// Skip the first `n` rows
    pub fn skip(mut self, n: i64) -> Self {
        self.skip = Some(n);
        self
    }

    /// Return at most `n` rows
    pub fn limit(mut self, n: i64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Build a query from a field-to-filter mapping
    ///
    /// The keys `order_by`, `descending`, `skip`, and `limit` control ordering and
    /// pagination; every other key is a field filter.
    pub fn from_params(params: &serde_json::Map<String, Json>) -> Result<Self> {
        let mut query = Query::new();
        for (key, value) in params {
            match key.as_str() {
                "order_by" => query.order_by = value.as_str().map(str::to_string),
                "descending" => query.descending = value.as_bool().unwrap_or(true),
                "skip" => query.skip = value.as_i64(),
                "limit" => query.limit = value.as_i64(),
                field => query.filters.push((field.to_string(), Filter::from_json(value)?)),
            }
        }
        Ok(query)
    }

    /// Render the SELECT for `T`; `first` restricts the result to one row and ignores `limit`
    pub(crate) fn build<T: Queryable>(&self, first: bool) -> QueryBuilder<'static, Sqlite> {
        let mut qb = QueryBuilder::new(format!(
            "SELECT {} FROM {}",
            T::COLUMNS.join(", "),
            T::TABLE
        ));

        let mut applied = 0;
        for (field, filter) in &self.filters {
            let Some(column) = T::COLUMNS.iter().find(|c| **c == field.as_str()) else {
                tracing::debug!(table = T::TABLE, field = %field, "ignoring filter on unknown field");
                continue;
            };
            qb.push(if applied == 0 { " WHERE " } else { " AND " });
            filter.clone().push(column, &mut qb);
            applied += 1;
        }

        let order = self
            .order_by
            .as_deref()
            .and_then(|o| T::COLUMNS.iter().find(|c| **c == o))
            .copied()
            .unwrap_or(T::DEFAULT_ORDER);
        qb.push(format!(
            " ORDER BY {} {}",
            order,
            if self.descending { "DESC" } else { "ASC" }
        ));

        let limit = if first { Some(1) } else { self.limit };
        match (limit, self.skip) {
            (None, None) => {}
            (limit, skip) => {
                qb.push(" LIMIT ");
                qb.push_bind(limit.unwrap_or(-1));
                qb.push(" OFFSET ");
                qb.push_bind(skip.unwrap_or(0).max(0));
            }
        }
        qb
    }
}

/// An entity that can be read through [`Query`]
pub trait Queryable: for<'r> FromRow<'r, SqliteRow> + Send + Unpin {
    /// Backing table
    const TABLE: &'static str;
    /// Selectable, filterable columns
    const COLUMNS: &'static [&'static str];
    /// Ordering column used when none (or an unknown one) is requested
    const DEFAULT_ORDER: &'static str = "id";
}

impl Database {
    /// All rows matching `query`
    pub async fn query_many<T: Queryable>(&self, query: &Query) -> Result<Vec<T>> {
        let mut qb = query.build::<T>(false);
        qb.build_query_as::<T>()
            .fetch_all(self.pool())
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to query {}: {}",
                    T::TABLE,
                    e
                )))
            })
    }

    /// First row matching `query`, after `skip`
    pub async fn query_first<T: Queryable>(&self, query: &Query) -> Result<Option<T>> {
        let mut qb = query.build::<T>(true);
        qb.build_query_as::<T>()
            .fetch_optional(self.pool())
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to query {}: {}",
                    T::TABLE,
                    e
                )))
            })
    }
}
