//! Target store contract for flat records, with in-memory and SQLite backends.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use covds_core::{Cell, FlatRecord};
use sha2::{Digest, Sha256};
use thiserror::Error;

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub const CRATE_NAME: &str = "covds-storage";

pub const MEMORY_URL: &str = "memory";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("table `{0}` does not exist")]
    UnknownTable(String),
    #[error("cannot create table `{0}` from an empty record")]
    EmptySample(String),
    #[error("record for `{table}` has no value for primary key column `{column}`")]
    MissingKey { table: String, column: String },
    #[error("`{table}.{column}` = {value} has no matching row in `{references}`")]
    ForeignKey {
        table: String,
        column: String,
        references: String,
        value: String,
    },
    #[error("encoding row: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub column: String,
    pub references: String,
    pub references_column: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub name: String,
    pub primary_key: Vec<String>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableSpec {
    pub fn new<I, S>(name: impl Into<String>, primary_key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            primary_key: primary_key.into_iter().map(Into::into).collect(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn with_foreign_key(
        mut self,
        column: impl Into<String>,
        references: impl Into<String>,
        references_column: impl Into<String>,
    ) -> Self {
        self.foreign_keys.push(ForeignKey {
            column: column.into(),
            references: references.into(),
            references_column: references_column.into(),
        });
        self
    }

    /// Primary key tuple of `record`. Absent and null key cells are rejected.
    pub fn key_of<'r>(&self, record: &'r FlatRecord) -> Result<Vec<&'r Cell>, StoreError> {
        self.primary_key
            .iter()
            .map(|column| match record.get(column) {
                Some(cell) if !cell.is_null() => Ok(cell),
                _ => Err(StoreError::MissingKey {
                    table: self.name.clone(),
                    column: column.clone(),
                }),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowFilter {
    equals: Vec<(String, Cell)>,
}

impl RowFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Cell>) -> Self {
        self.equals.push((column.into(), value.into()));
        self
    }

    pub fn conditions(&self) -> &[(String, Cell)] {
        &self.equals
    }

    pub fn matches(&self, record: &FlatRecord) -> bool {
        self.equals
            .iter()
            .all(|(column, value)| record.get(column).unwrap_or(&Cell::Null) == value)
    }
}

/// Tables take their shape from the first record written; later records may add columns.
#[async_trait]
pub trait TableStore: Send + Sync {
    async fn ensure_table(&self, spec: &TableSpec, sample: &FlatRecord) -> Result<(), StoreError>;

    async fn upsert(&self, spec: &TableSpec, records: &[FlatRecord]) -> Result<usize, StoreError>;

    /// Drops the table and recreates it holding exactly `records`.
    async fn replace(&self, spec: &TableSpec, records: &[FlatRecord]) -> Result<usize, StoreError>;

    async fn query(&self, table: &str, filter: &RowFilter) -> Result<Vec<FlatRecord>, StoreError>;

    async fn table_names(&self) -> Result<Vec<String>, StoreError>;

    async fn has_table(&self, table: &str) -> Result<bool, StoreError> {
        Ok(self.table_names().await?.iter().any(|name| name == table))
    }
}

/// Column names differing only by ASCII case collide in SQLite. A name matching `existing`
/// takes that spelling; a later in-record collision gets `_2`, `_3`, ... Key columns never move.
pub fn fold_column_case(
    record: &FlatRecord,
    primary_key: &[String],
    existing: &[String],
) -> FlatRecord {
    let same = |taken: &[String], name: &str| taken.iter().any(|t| t.eq_ignore_ascii_case(name));
    let mut taken = primary_key
        .iter()
        .filter(|column| record.contains(column))
        .cloned()
        .collect::<Vec<_>>();
    record
        .iter()
        .map(|(name, cell)| {
            if primary_key.iter().any(|column| column == name) {
                return (name.to_string(), cell.clone());
            }
            let mut column = name.to_string();
            let mut suffix = 2;
            while same(&taken, &column) {
                column = format!("{name}_{suffix}");
                suffix += 1;
            }
            if let Some(spelling) = existing.iter().find(|e| e.eq_ignore_ascii_case(&column)) {
                column = spelling.clone();
            }
            taken.push(column.clone());
            (column, cell.clone())
        })
        .collect()
}

/// `memory` or any `sqlite:` URL. With `fresh`, a database file is deleted before opening.
pub async fn connect_store(
    database_url: &str,
    fresh: bool,
) -> Result<Arc<dyn TableStore>, StoreError> {
    if database_url == MEMORY_URL {
        return Ok(Arc::new(MemoryStore::new()));
    }
    if fresh {
        if let Some(path) = sqlite_file_path(database_url) {
            return Ok(Arc::new(SqliteStore::open_file(path, true).await?));
        }
    }
    Ok(Arc::new(SqliteStore::connect(database_url).await?))
}

pub fn sqlite_file_path(database_url: &str) -> Option<&Path> {
    let rest = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or_default();
    if path.is_empty() || path == ":memory:" {
        return None;
    }
    Some(Path::new(path))
}

pub async fn row_counts(store: &dyn TableStore) -> Result<BTreeMap<String, usize>, StoreError> {
    let mut counts = BTreeMap::new();
    for table in store.table_names().await? {
        let rows = store.query(&table, &RowFilter::all()).await?;
        counts.insert(table, rows.len());
    }
    Ok(counts)
}

/// SHA-256 over the table's rows, independent of row and column order.
pub async fn table_digest(store: &dyn TableStore, table: &str) -> Result<String, StoreError> {
    let rows = store.query(table, &RowFilter::all()).await?;
    rows_digest(&rows)
}

pub fn rows_digest(rows: &[FlatRecord]) -> Result<String, StoreError> {
    let mut lines = rows
        .iter()
        .map(|row| serde_json::to_string(&row.iter().collect::<BTreeMap<_, _>>()))
        .collect::<Result<Vec<_>, _>>()?;
    lines.sort_unstable();

    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    Ok(hex::encode(hasher.finalize()))
}
