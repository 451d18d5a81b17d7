//! Core model for covds: scopes, payloads, flat records, and the schema-driven mapping engine.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod mapper;
pub mod path;
pub mod registry;
pub mod scope;

pub use mapper::{map_records, MapError};
pub use path::{resolve, resolve_strict, ROOT_PATH};
pub use registry::{LocationIdSource, MappingEntry, RegistryError, SchemaRegistry, Shape};
pub use scope::{apply_location_columns, scope_applies};

pub const CRATE_NAME: &str = "covds-core";

/// Document shape produced by the public reports endpoint, for every scope.
pub const DEFAULT_DOCUMENT: &str = "public_report";

pub const DATE_COLUMN: &str = "date";
pub const LOCATION_TYPE_COLUMN: &str = "location_type";
pub const LOCATION_ID_COLUMN: &str = "location_id";

/// Location id recorded for national payloads, which carry none of their own.
pub const NATIONAL_LOCATION_ID: i64 = 0;

/// Geographic aggregation level of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    National,
    State,
    District,
}

impl Scope {
    pub const ALL: [Scope; 3] = [Scope::National, Scope::State, Scope::District];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::National => "national",
            Scope::State => "state",
            Scope::District => "district",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown location scope `{0}`")]
pub struct ParseScopeError(pub String);

impl FromStr for Scope {
    type Err = ParseScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "national" => Ok(Scope::National),
            "state" => Ok(Scope::State),
            "district" => Ok(Scope::District),
            other => Err(ParseScopeError(other.to_string())),
        }
    }
}

/// One ingested JSON document. Never mutated once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub document: String,
    pub scope: Scope,
    pub location_id: Option<i64>,
    pub date: NaiveDate,
    pub body: JsonValue,
}

impl Payload {
    pub fn new(scope: Scope, location_id: Option<i64>, date: NaiveDate, body: JsonValue) -> Self {
        Self {
            document: DEFAULT_DOCUMENT.to_string(),
            scope,
            location_id,
            date,
            body,
        }
    }

    pub fn with_document(mut self, document: impl Into<String>) -> Self {
        self.document = document.into();
        self
    }

    /// Id of the location this payload describes; national payloads resolve to 0.
    pub fn effective_location_id(&self) -> i64 {
        self.location_id.unwrap_or(NATIONAL_LOCATION_ID)
    }

    pub fn date_string(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }

    /// Short identifier used in log lines and failure reports, e.g. `state/31@2021-06-01`.
    pub fn describe(&self) -> String {
        format!(
            "{}/{}@{}",
            self.scope,
            self.effective_location_id(),
            self.date_string()
        )
    }
}

/// Scalar value of one column in a flat record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Null,
    Boolean(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Cell {
    /// Converts a JSON value into a cell. Nested arrays and objects become compact JSON text.
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Cell::Null,
            JsonValue::Bool(b) => Cell::Boolean(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Cell::Integer(i),
                None => n.as_f64().map(Cell::Real).unwrap_or(Cell::Null),
            },
            JsonValue::String(s) => Cell::Text(s.clone()),
            JsonValue::Array(_) | JsonValue::Object(_) => Cell::Text(value.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Cell::Integer(i) => Some(*i),
            Cell::Boolean(b) => Some(i64::from(*b)),
            Cell::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Integer(i) => Some(*i as f64),
            Cell::Real(f) => Some(*f),
            Cell::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Cell::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Name of the cell's variant, used when inferring column types.
    pub fn kind(&self) -> &'static str {
        match self {
            Cell::Null => "null",
            Cell::Boolean(_) => "boolean",
            Cell::Integer(_) => "integer",
            Cell::Real(_) => "real",
            Cell::Text(_) => "text",
        }
    }
}

impl From<i64> for Cell {
    fn from(value: i64) -> Self {
        Cell::Integer(value)
    }
}

impl From<f64> for Cell {
    fn from(value: f64) -> Self {
        Cell::Real(value)
    }
}

impl From<bool> for Cell {
    fn from(value: bool) -> Self {
        Cell::Boolean(value)
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::Text(value.to_string())
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Cell::Text(value)
    }
}

impl<T: Into<Cell>> From<Option<T>> for Cell {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Cell::Null)
    }
}

/// A single row of named scalar values, in column insertion order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FlatRecord {
    cells: Vec<(String, Cell)>,
}

impl FlatRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a column, replacing its value in place if it is already present.
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Cell>) {
        let column = column.into();
        let value = value.into();
        match self.cells.iter_mut().find(|(name, _)| *name == column) {
            Some((_, slot)) => *slot = value,
            None => self.cells.push((column, value)),
        }
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<Cell>) -> Self {
        self.set(column, value);
        self
    }

    pub fn get(&self, column: &str) -> Option<&Cell> {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.get(column).is_some()
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Cell)> {
        self.cells.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl<K: Into<String>, V: Into<Cell>> FromIterator<(K, V)> for FlatRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = FlatRecord::new();
        for (column, value) in iter {
            record.set(column, value);
        }
        record
    }
}

impl Serialize for FlatRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.cells.len()))?;
        for (column, value) in &self.cells {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}
