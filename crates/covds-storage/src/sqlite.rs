use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use covds_core::{Cell, FlatRecord};
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{Column, Row, Sqlite, TypeInfo, ValueRef};
use tracing::{debug, info};

use crate::{fold_column_case, RowFilter, StoreError, TableSpec, TableStore};

/// SQLite-backed store. A single pooled connection serializes every write.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        info!(database_url, "opened sqlite store");
        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:").await
    }

    /// Opens a database file, deleting any previous file first when `fresh` is set.
    pub async fn open_file(path: impl AsRef<Path>, fresh: bool) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if fresh {
            for sidecar in ["", "-wal", "-shm"] {
                let mut file = path.as_os_str().to_owned();
                file.push(sidecar);
                if tokio::fs::try_exists(&file).await? {
                    tokio::fs::remove_file(&file).await?;
                }
            }
            info!(path = %path.display(), "removed previous database");
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        Self::connect(&format!("sqlite://{}", path.display())).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_list<'a>(names: impl IntoIterator<Item = &'a str>) -> String {
    names
        .into_iter()
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Declared type for a column, from the first non-null value written to it.
fn column_type(cell: Option<&Cell>) -> &'static str {
    match cell {
        Some(Cell::Integer(_)) | Some(Cell::Boolean(_)) => " INTEGER",
        Some(Cell::Real(_)) => " REAL",
        Some(Cell::Text(_)) => " TEXT",
        Some(Cell::Null) | None => "",
    }
}

/// Column names in first-seen order with the first non-null sample of each.
fn batch_columns(records: &[FlatRecord]) -> Vec<(String, Option<Cell>)> {
    let mut columns: Vec<(String, Option<Cell>)> = Vec::new();
    for record in records {
        for (name, cell) in record.iter() {
            let sample = Some(cell.clone()).filter(|c| !c.is_null());
            match columns
                .iter_mut()
                .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            {
                Some((_, slot)) => {
                    if slot.is_none() {
                        *slot = sample;
                    }
                }
                None => columns.push((name.to_string(), sample)),
            }
        }
    }
    columns
}

fn bind_cell<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    cell: &Cell,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match cell {
        Cell::Null => query.bind(Option::<String>::None),
        Cell::Boolean(b) => query.bind(*b),
        Cell::Integer(i) => query.bind(*i),
        Cell::Real(f) => query.bind(*f),
        Cell::Text(s) => query.bind(s.clone()),
    }
}

fn row_to_record(row: &SqliteRow) -> Result<FlatRecord, StoreError> {
    let mut record = FlatRecord::new();
    for column in row.columns() {
        let idx = column.ordinal();
        let storage_class = {
            let raw = row.try_get_raw(idx)?;
            if raw.is_null() {
                None
            } else {
                Some(raw.type_info().name().to_string())
            }
        };
        let cell = match storage_class.as_deref() {
            None => Cell::Null,
            Some("INTEGER") | Some("BOOLEAN") => Cell::Integer(row.try_get::<i64, _>(idx)?),
            Some("REAL") => Cell::Real(row.try_get::<f64, _>(idx)?),
            Some("BLOB") => {
                Cell::Text(String::from_utf8_lossy(&row.try_get::<Vec<u8>, _>(idx)?).into_owned())
            }
            Some(_) => Cell::Text(row.try_get::<String, _>(idx)?),
        };
        record.set(column.name(), cell);
    }
    Ok(record)
}

async fn table_exists(conn: &mut SqliteConnection, table: &str) -> Result<bool, StoreError> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?)",
    )
    .bind(table)
    .fetch_one(&mut *conn)
    .await?;
    Ok(exists)
}

async fn existing_columns(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<Vec<String>, StoreError> {
    let rows = sqlx::query(&format!("PRAGMA table_info({})", quote_ident(table)))
        .fetch_all(&mut *conn)
        .await?;
    rows.iter()
        .map(|row| row.try_get::<String, _>("name").map_err(StoreError::from))
        .collect()
}

/// Creates the table or adds the batch's new columns. Returns the resulting column list.
async fn ensure_columns(
    conn: &mut SqliteConnection,
    spec: &TableSpec,
    records: &[FlatRecord],
) -> Result<Vec<String>, StoreError> {
    let wanted = batch_columns(records);

    if !table_exists(conn, &spec.name).await? {
        if wanted.is_empty() {
            return Err(StoreError::EmptySample(spec.name.clone()));
        }
        let mut definitions = wanted
            .iter()
            .map(|(name, sample)| format!("{}{}", quote_ident(name), column_type(sample.as_ref())))
            .collect::<Vec<_>>();
        definitions.push(format!(
            "PRIMARY KEY ({})",
            quote_list(spec.primary_key.iter().map(String::as_str))
        ));
        for fk in &spec.foreign_keys {
            definitions.push(format!(
                "FOREIGN KEY ({}) REFERENCES {} ({})",
                quote_ident(&fk.column),
                quote_ident(&fk.references),
                quote_ident(&fk.references_column)
            ));
        }
        let sql = format!(
            "CREATE TABLE {} ({})",
            quote_ident(&spec.name),
            definitions.join(", ")
        );
        sqlx::query(&sql).execute(&mut *conn).await?;
        debug!(table = %spec.name, columns = wanted.len(), "created table");
        return Ok(wanted.into_iter().map(|(name, _)| name).collect());
    }

    let mut columns = existing_columns(conn, &spec.name).await?;
    for (name, sample) in wanted {
        if columns.iter().any(|c| c.eq_ignore_ascii_case(&name)) {
            continue;
        }
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN {}{}",
            quote_ident(&spec.name),
            quote_ident(&name),
            column_type(sample.as_ref())
        );
        sqlx::query(&sql).execute(&mut *conn).await?;
        debug!(table = %spec.name, column = %name, "added column");
        columns.push(name);
    }
    Ok(columns)
}

/// Records with column names folded onto the table's existing spelling.
async fn fold_records(
    conn: &mut SqliteConnection,
    spec: &TableSpec,
    records: &[FlatRecord],
) -> Result<Vec<FlatRecord>, StoreError> {
    let existing = if table_exists(conn, &spec.name).await? {
        existing_columns(conn, &spec.name).await?
    } else {
        Vec::new()
    };
    Ok(records
        .iter()
        .map(|record| fold_column_case(record, &spec.primary_key, &existing))
        .collect())
}

async fn write_rows(
    conn: &mut SqliteConnection,
    spec: &TableSpec,
    records: &[FlatRecord],
) -> Result<usize, StoreError> {
    for record in records {
        spec.key_of(record)?;
    }
    let records = fold_records(conn, spec, records).await?;
    let columns = ensure_columns(conn, spec, &records).await?;
    let updatable = columns
        .iter()
        .filter(|c| !spec.primary_key.contains(c))
        .collect::<Vec<_>>();
    let conflict = quote_list(spec.primary_key.iter().map(String::as_str));
    // Columns absent from a record are reset so the new row fully replaces the old one.
    let on_conflict = if updatable.is_empty() {
        format!("ON CONFLICT ({conflict}) DO NOTHING")
    } else {
        let assignments = updatable
            .iter()
            .map(|c| format!("{0} = excluded.{0}", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        format!("ON CONFLICT ({conflict}) DO UPDATE SET {assignments}")
    };

    for record in &records {
        let names = record.columns().collect::<Vec<_>>();
        let placeholders = vec!["?"; names.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) {}",
            quote_ident(&spec.name),
            quote_list(names.iter().copied()),
            placeholders,
            on_conflict
        );
        let mut query = sqlx::query(&sql);
        for (_, cell) in record.iter() {
            query = bind_cell(query, cell);
        }
        query.execute(&mut *conn).await.map_err(|err| match err {
            sqlx::Error::Database(db) if db.message().contains("FOREIGN KEY") => {
                StoreError::ForeignKey {
                    table: spec.name.clone(),
                    column: spec
                        .foreign_keys
                        .iter()
                        .map(|fk| fk.column.as_str())
                        .collect::<Vec<_>>()
                        .join(","),
                    references: spec
                        .foreign_keys
                        .iter()
                        .map(|fk| fk.references.as_str())
                        .collect::<Vec<_>>()
                        .join(","),
                    value: db.message().to_string(),
                }
            }
            other => StoreError::Sqlx(other),
        })?;
    }
    Ok(records.len())
}

#[async_trait]
impl TableStore for SqliteStore {
    async fn ensure_table(&self, spec: &TableSpec, sample: &FlatRecord) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let sample = fold_records(&mut tx, spec, std::slice::from_ref(sample)).await?;
        ensure_columns(&mut tx, spec, &sample).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn upsert(&self, spec: &TableSpec, records: &[FlatRecord]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let written = write_rows(&mut tx, spec, records).await?;
        tx.commit().await?;
        Ok(written)
    }

    async fn replace(&self, spec: &TableSpec, records: &[FlatRecord]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(&spec.name)))
            .execute(&mut *tx)
            .await?;
        let written = if records.is_empty() {
            0
        } else {
            write_rows(&mut tx, spec, records).await?
        };
        tx.commit().await?;
        Ok(written)
    }

    async fn query(&self, table: &str, filter: &RowFilter) -> Result<Vec<FlatRecord>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        if !table_exists(&mut conn, table).await? {
            return Err(StoreError::UnknownTable(table.to_string()));
        }
        let columns = existing_columns(&mut conn, table).await?;

        let mut clauses = Vec::new();
        let mut binds = Vec::new();
        for (column, value) in filter.conditions() {
            let known = columns.iter().any(|c| c == column);
            match (known, value) {
                // An unknown column reads as null everywhere.
                (false, Cell::Null) => {}
                (false, _) => return Ok(Vec::new()),
                (true, Cell::Null) => clauses.push(format!("{} IS NULL", quote_ident(column))),
                (true, value) => {
                    clauses.push(format!("{} = ?", quote_ident(column)));
                    binds.push(value);
                }
            }
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT * FROM {}{} ORDER BY rowid",
            quote_ident(table),
            where_clause
        );
        let mut query = sqlx::query(&sql);
        for value in binds {
            query = bind_cell(query, value);
        }
        let rows = query.fetch_all(&mut *conn).await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn table_names(&self) -> Result<Vec<String>, StoreError> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }
}
