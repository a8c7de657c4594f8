//! Field Mapping
//!
//! Turns raw records of arbitrary shape into `IndexableDocument`s. A mapper
//! either produces a document with a non-empty id or a `MappingError`; the
//! pipeline drops and counts the latter.

use super::types::IndexableDocument;
use crate::error::MappingError;
use crate::query::types::ID_FIELD;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

pub trait FieldMapper<R>: Send + Sync {
    fn map(&self, raw: &R) -> Result<IndexableDocument, MappingError>;
}

/// Adapts a closure into a [`FieldMapper`].
pub struct FnMapper<F>(F);

pub fn mapper_fn<R, F>(f: F) -> FnMapper<F>
where
    F: Fn(&R) -> Result<IndexableDocument, MappingError> + Send + Sync,
{
    FnMapper(f)
}

impl<R, F> FieldMapper<R> for FnMapper<F>
where
    F: Fn(&R) -> Result<IndexableDocument, MappingError> + Send + Sync,
{
    fn map(&self, raw: &R) -> Result<IndexableDocument, MappingError> {
        let doc = (self.0)(raw)?;
        if doc.id.trim().is_empty() {
            return Err(MappingError::MissingId);
        }
        Ok(doc)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Long,
    Double,
    Bool,
    /// Multi-valued text.
    Strings,
}

/// How one source field becomes one document field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldSpec {
    pub source: String,
    pub target: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
}

impl FieldSpec {
    pub fn new(source: impl Into<String>, kind: FieldKind) -> Self {
        let source = source.into();
        Self {
            target: source.clone(),
            source,
            kind,
            required: false,
        }
    }

    pub fn to(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Maps JSON objects through a declared list of fields.
///
/// Undeclared source fields are ignored. Absent or null optional fields are skipped.
#[derive(Debug, Clone)]
pub struct JsonFieldMapper {
    id_field: String,
    fields: Vec<FieldSpec>,
}

impl JsonFieldMapper {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self {
            id_field: ID_FIELD.to_string(),
            fields,
        }
    }

    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = field.into();
        self
    }

    fn map_object(&self, object: &Map<String, Value>) -> Result<IndexableDocument, MappingError> {
        let id = match object.get(&self.id_field) {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(Value::Number(n)) if n.is_i64() || n.is_u64() => n.to_string(),
            _ => return Err(MappingError::MissingId),
        };

        let mut doc = IndexableDocument::new(id);
        for spec in &self.fields {
            match object.get(&spec.source) {
                None | Some(Value::Null) if spec.required => {
                    return Err(MappingError::MissingField(spec.source.clone()));
                }
                None | Some(Value::Null) => {}
                Some(value) => doc.set_field(spec.target.clone(), coerce(spec, value)?),
            }
        }
        Ok(doc)
    }
}

impl FieldMapper<Value> for JsonFieldMapper {
    fn map(&self, raw: &Value) -> Result<IndexableDocument, MappingError> {
        match raw {
            Value::Object(object) => self.map_object(object),
            other => Err(MappingError::Malformed(format!(
                "expected a JSON object, got {}",
                type_name(other)
            ))),
        }
    }
}

impl FieldMapper<String> for JsonFieldMapper {
    fn map(&self, raw: &String) -> Result<IndexableDocument, MappingError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| MappingError::Malformed(e.to_string()))?;
        FieldMapper::<Value>::map(self, &value)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn coerce(spec: &FieldSpec, value: &Value) -> Result<Value, MappingError> {
    let invalid = |reason: String| MappingError::InvalidField {
        field: spec.source.clone(),
        reason,
    };

    match spec.kind {
        FieldKind::Text => as_text(value).map(Value::String).ok_or_else(|| {
            invalid(format!("{} is not text", type_name(value)))
        }),
        FieldKind::Long => as_long(value)
            .map(Value::from)
            .ok_or_else(|| invalid(format!("{} is not an integer", value))),
        FieldKind::Double => as_double(value)
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| invalid(format!("{} is not a finite number", value))),
        FieldKind::Bool => as_bool(value)
            .map(Value::Bool)
            .ok_or_else(|| invalid(format!("{} is not a boolean", value))),
        FieldKind::Strings => {
            let items: Vec<&Value> = match value {
                Value::Array(items) => items.iter().filter(|v| !v.is_null()).collect(),
                single => vec![single],
            };
            items
                .into_iter()
                .map(|item| {
                    as_text(item)
                        .map(Value::String)
                        .ok_or_else(|| invalid(format!("{} element is not text", type_name(item))))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array)
        }
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_long(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_double(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Maps delimited text rows, e.g. `"1,foo,bar"`, onto named columns.
///
/// Values are trimmed and empty values skipped. A row may be shorter than the
/// column list but not longer.
#[derive(Debug, Clone)]
pub struct DelimitedFieldMapper {
    delimiter: char,
    columns: Vec<String>,
    id_column: String,
}

impl DelimitedFieldMapper {
    pub fn new<I, S>(delimiter: char, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            delimiter,
            columns: columns.into_iter().map(Into::into).collect(),
            id_column: ID_FIELD.to_string(),
        }
    }

    /// Comma-separated rows.
    pub fn csv<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(',', columns)
    }

    pub fn with_id_column(mut self, column: impl Into<String>) -> Self {
        self.id_column = column.into();
        self
    }

    fn map_row(&self, row: &str) -> Result<IndexableDocument, MappingError> {
        let values: Vec<&str> = row.split(self.delimiter).map(str::trim).collect();
        if values.len() > self.columns.len() {
            return Err(MappingError::Malformed(format!(
                "{} values for {} columns",
                values.len(),
                self.columns.len()
            )));
        }

        let mut id = None;
        let mut fields = Vec::with_capacity(values.len());
        for (column, value) in self.columns.iter().zip(values) {
            if value.is_empty() {
                continue;
            }
            if *column == self.id_column {
                id = Some(value);
            } else {
                fields.push((column, value));
            }
        }

        let mut doc = IndexableDocument::new(id.ok_or(MappingError::MissingId)?);
        for (column, value) in fields {
            doc.set_field(column.clone(), value);
        }
        Ok(doc)
    }
}

impl FieldMapper<String> for DelimitedFieldMapper {
    fn map(&self, raw: &String) -> Result<IndexableDocument, MappingError> {
        self.map_row(raw)
    }
}
