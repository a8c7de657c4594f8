use crate::topology::types::ShardId;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Field name -> value. Multi-valued fields hold a JSON array.
pub type FieldMap = BTreeMap<String, Value>;

/// Name of the unique key field every document carries.
pub const ID_FIELD: &str = "id";

/// Cursor token that starts a fresh walk over a shard.
pub const CURSOR_START: &str = "*";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SortClause {
    pub field: String,
    pub order: SortDirection,
}

impl SortClause {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortDirection::Desc,
        }
    }
}

/// How records from different shards are combined.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderingMode {
    /// Records are yielded as each shard produces them. Within a shard, pagination order holds.
    PerShard,
    /// A k-way merge on the declared sort, with `id` as the final tie-break.
    GlobalSort,
}

/// What happens when one shard's sub-query fails.
///
/// There is deliberately no `Default`: every caller states the policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ShardFailurePolicy {
    /// The first shard error ends the whole result.
    FailFast,
    /// Failed shards are reported, remaining shards keep yielding.
    AllowPartial,
}

/// A logical query, fanned out unchanged to every shard.
///
/// `q` and `filters` are opaque predicate strings handed to the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Query {
    pub q: String,
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub sort: Vec<SortClause>,
    pub page_size: usize,
}

impl Query {
    pub const DEFAULT_PAGE_SIZE: usize = 1000;

    pub fn new(q: impl Into<String>) -> Self {
        Self {
            q: q.into(),
            filters: Vec::new(),
            fields: Vec::new(),
            sort: Vec::new(),
            page_size: Self::DEFAULT_PAGE_SIZE,
        }
    }

    pub fn match_all() -> Self {
        Self::new("*:*")
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filters.push(filter.into());
        self
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_sort(mut self, clause: SortClause) -> Self {
        self.sort.push(clause);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// The declared sort, terminated by `id asc` unless `id` is already sorted on.
    ///
    /// Cursor positions need a total order, and the merge uses the same order.
    pub fn effective_sort(&self) -> Vec<SortClause> {
        let mut sort = self.sort.clone();
        if !sort.iter().any(|clause| clause.field == ID_FIELD) {
            sort.push(SortClause::asc(ID_FIELD));
        }
        sort
    }
}

/// One retrieved document. Immutable once yielded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub id: String,
    #[serde(default)]
    pub fields: FieldMap,
}

impl Record {
    pub fn new(id: impl Into<String>, fields: FieldMap) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// The field's value, or its first element when multi-valued.
    pub fn first_value(&self, field: &str) -> Option<&Value> {
        match self.fields.get(field)? {
            Value::Array(values) => values.first(),
            value => Some(value),
        }
    }

    /// Value used for ordering. `id` is served from the record id itself.
    pub fn sort_value(&self, field: &str) -> Option<Value> {
        if field == ID_FIELD {
            return Some(Value::String(self.id.clone()));
        }
        self.first_value(field).cloned()
    }

    pub fn sort_key(&self, sort: &[SortClause]) -> Vec<Value> {
        sort.iter()
            .map(|clause| self.sort_value(&clause.field).unwrap_or(Value::Null))
            .collect()
    }
}

/// Where a shard's pagination loop is. Owned by that loop alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorState {
    pub shard_id: ShardId,
    pub token: String,
    pub emitted: u64,
    pub exhausted: bool,
}

impl CursorState {
    pub fn start(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            token: CURSOR_START.to_string(),
            emitted: 0,
            exhausted: false,
        }
    }

    /// Applies one page response. A missing or unchanged next cursor means the
    /// shard has nothing more to give.
    pub fn advance(&mut self, returned: usize, next: Option<String>) {
        self.emitted += returned as u64;
        match next {
            Some(token) if token != self.token => self.token = token,
            _ => self.exhausted = true,
        }
    }
}

/// Total order over field values: missing < bool < number < string < array < object.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let x = x.as_f64().unwrap_or(f64::NAN);
                let y = y.as_f64().unwrap_or(f64::NAN);
                x.total_cmp(&y)
            }
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (left, right) in x.iter().zip(y.iter()) {
                let ord = compare_values(left, right);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => x.len().cmp(&y.len()),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Compares two sort keys built from the same clauses.
pub fn compare_keys(a: &[Value], b: &[Value], sort: &[SortClause]) -> Ordering {
    for ((left, right), clause) in a.iter().zip(b.iter()).zip(sort.iter()) {
        let ord = compare_values(left, right);
        let ord = match clause.order {
            SortDirection::Asc => ord,
            SortDirection::Desc => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Orders records by the declared clauses in turn, then by id.
pub fn compare_records(a: &Record, b: &Record, sort: &[SortClause]) -> Ordering {
    compare_keys(&a.sort_key(sort), &b.sort_key(sort), sort).then_with(|| a.id.cmp(&b.id))
}
