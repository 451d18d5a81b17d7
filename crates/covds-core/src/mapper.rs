//! Turns one payload and one mapping entry into flat records.

use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use crate::path::resolve;
use crate::registry::{MappingEntry, Shape};
use crate::{Cell, FlatRecord, Payload, DATE_COLUMN};

/// Upstream document no longer matches the declared shape of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("`{path}` for table {table}: expected {expected}, found {found}")]
    ShapeMismatch {
        table: String,
        path: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("`{path}` for table {table}: element {index} is {found}, expected an object")]
    ElementNotObject {
        table: String,
        path: String,
        index: usize,
        found: &'static str,
    },
}

/// Extracts the records described by `entry` from `payload`.
///
/// A path that resolves to nothing yields no records; a path that resolves to the wrong
/// JSON type is an error. Individual columns that are missing become `Cell::Null`.
pub fn map_records(payload: &Payload, entry: &MappingEntry) -> Result<Vec<FlatRecord>, MapError> {
    let date = payload.date_string();
    let columns = entry.columns.as_deref();

    let mut records = match entry.shape {
        Shape::Object if entry.is_root() => {
            let fields = payload
                .body
                .as_object()
                .ok_or_else(|| mismatch(entry, "object", &payload.body))?;
            vec![project(fields, columns)]
        }
        Shape::Object => match resolve(&payload.body, &entry.source_path) {
            None => Vec::new(),
            Some(JsonValue::Object(fields)) => vec![project(fields, columns)],
            Some(other) => return Err(mismatch(entry, "object", other)),
        },
        Shape::ObjectList => match resolve(&payload.body, &entry.source_path) {
            None => Vec::new(),
            Some(JsonValue::Array(items)) => items
                .iter()
                .enumerate()
                .map(|(index, item)| match item {
                    JsonValue::Object(fields) => Ok(project(fields, columns)),
                    other => Err(MapError::ElementNotObject {
                        table: entry.target_table.clone(),
                        path: entry.source_path.clone(),
                        index,
                        found: json_kind(other),
                    }),
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(other) => return Err(mismatch(entry, "array", other)),
        },
    };

    for record in &mut records {
        record.set(DATE_COLUMN, date.as_str());
    }
    Ok(records)
}

fn project(fields: &Map<String, JsonValue>, columns: Option<&[String]>) -> FlatRecord {
    match columns {
        Some(columns) => columns
            .iter()
            .map(|column| {
                let cell = fields.get(column).map(Cell::from_json).unwrap_or(Cell::Null);
                (column.clone(), cell)
            })
            .collect(),
        None => fields
            .iter()
            .map(|(column, value)| (column.clone(), Cell::from_json(value)))
            .collect(),
    }
}

fn mismatch(entry: &MappingEntry, expected: &'static str, found: &JsonValue) -> MapError {
    MapError::ShapeMismatch {
        table: entry.target_table.clone(),
        path: entry.source_path.clone(),
        expected,
        found: json_kind(found),
    }
}

pub fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
