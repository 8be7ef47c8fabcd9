//! Filters and ordering shared by the remote adapter and the offline read path.
//!
//! The offline path evaluates a [`Query`] client-side with the same semantics a
//! PostgREST-style backend applies server-side: ascending sorts put nulls last,
//! descending sorts put them first, and `ilike` patterns use `%` wildcards.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entities::{Entity, EntityId, ID_FIELD};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Case-insensitive pattern match with `%` wildcards.
    Ilike,
    /// Value must be a JSON array; matches when the field equals any element.
    In,
}

impl FilterOp {
    /// Operator keyword understood by PostgREST.
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Ilike => "ilike",
            Self::In => "in",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        let actual = field_value(entity, &self.field);
        match self.op {
            FilterOp::Eq => values_equal(&actual, &self.value),
            FilterOp::Neq => !values_equal(&actual, &self.value),
            FilterOp::Gt => compare_values(&actual, &self.value) == Some(Ordering::Greater),
            FilterOp::Gte => matches!(
                compare_values(&actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::Lt => compare_values(&actual, &self.value) == Some(Ordering::Less),
            FilterOp::Lte => matches!(
                compare_values(&actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::Ilike => match (&actual, &self.value) {
                (Value::String(text), Value::String(pattern)) => ilike(text, pattern),
                _ => false,
            },
            FilterOp::In => match &self.value {
                Value::Array(options) => options.iter().any(|v| values_equal(&actual, v)),
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub field: String,
    pub ascending: bool,
}

impl Order {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: true,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: false,
        }
    }
}

/// A select request: conjunctive filters, ordering and an optional row cap.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order: Vec<Order>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, order: Order) -> Self {
        self.order.push(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn is_unfiltered(&self) -> bool {
        self.filters.is_empty() && self.limit.is_none()
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        self.filters.iter().all(|filter| filter.matches(entity))
    }

    /// Evaluate the query against a local snapshot.
    pub fn apply(&self, entities: Vec<Entity>) -> Vec<Entity> {
        let mut rows: Vec<Entity> = entities.into_iter().filter(|e| self.matches(e)).collect();
        if !self.order.is_empty() {
            rows.sort_by(|a, b| self.compare(a, b));
        }
        if let Some(limit) = self.limit {
            rows.truncate(limit);
        }
        rows
    }

    fn compare(&self, a: &Entity, b: &Entity) -> Ordering {
        for order in &self.order {
            let left = field_value(a, &order.field);
            let right = field_value(b, &order.field);
            let ordering = match (left.is_null(), right.is_null()) {
                (true, true) => Ordering::Equal,
                // Nulls sort as the largest value.
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => sort_order(&left, &right),
            };
            let ordering = if order.ascending {
                ordering
            } else {
                ordering.reverse()
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

/// Rows addressed by an update or delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Id(EntityId),
    Filter(Vec<Filter>),
}

impl Target {
    pub fn matches(&self, entity: &Entity) -> bool {
        match self {
            Self::Id(id) => &entity.id == id,
            Self::Filter(filters) => filters.iter().all(|filter| filter.matches(entity)),
        }
    }

    /// Filters equivalent to this target, for backends that only speak filters.
    pub fn to_filters(&self) -> Vec<Filter> {
        match self {
            Self::Id(id) => vec![Filter::eq(ID_FIELD, id.as_str())],
            Self::Filter(filters) => filters.clone(),
        }
    }
}

fn field_value(entity: &Entity, field: &str) -> Value {
    if field == ID_FIELD {
        return Value::String(entity.id.to_string());
    }
    entity.get(field).cloned().unwrap_or(Value::Null)
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Number(_), _) | (_, Value::Number(_)) => {
            as_number(left)?.partial_cmp(&as_number(right)?)
        }
        _ => None,
    }
}

/// Rank of a JSON type when sorting values of different types.
fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order used by sorts: values of different JSON types order by type, never
/// by coercion.
fn sort_order(left: &Value, right: &Value) -> Ordering {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            let a = a.as_f64().unwrap_or(f64::NAN);
            let b = b.as_f64().unwrap_or(f64::NAN);
            a.total_cmp(&b)
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            left.to_string().cmp(&right.to_string())
        }
        _ => type_rank(left).cmp(&type_rank(right)),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    left == right || compare_values(left, right) == Some(Ordering::Equal)
}

fn ilike(text: &str, pattern: &str) -> bool {
    let text = text.to_lowercase();
    let pattern = pattern.to_lowercase();
    let parts: Vec<&str> = pattern.split('%').collect();
    if parts.len() == 1 {
        return text == pattern;
    }

    let mut rest = text.as_str();
    let last = parts.len() - 1;
    for (index, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if index == 0 {
            match rest.strip_prefix(part) {
                Some(tail) => rest = tail,
                None => return false,
            }
        } else if index == last {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}
