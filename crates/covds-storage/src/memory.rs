use std::collections::BTreeMap;

use async_trait::async_trait;
use covds_core::{Cell, FlatRecord};
use tokio::sync::Mutex;

use crate::{fold_column_case, RowFilter, StoreError, TableSpec, TableStore};

/// Process-local store, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<BTreeMap<String, MemoryTable>>,
}

#[derive(Debug, Default)]
struct MemoryTable {
    columns: Vec<String>,
    rows: BTreeMap<String, FlatRecord>,
}

impl MemoryTable {
    fn add_columns(&mut self, record: &FlatRecord) {
        for column in record.columns() {
            if !self.columns.iter().any(|c| c.eq_ignore_ascii_case(column)) {
                self.columns.push(column.to_string());
            }
        }
    }

    fn aligned(&self, row: &FlatRecord) -> FlatRecord {
        self.columns
            .iter()
            .map(|column| {
                let cell = row.get(column).cloned().unwrap_or(Cell::Null);
                (column.clone(), cell)
            })
            .collect()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn encode_key(key: &[&Cell]) -> Result<String, StoreError> {
    Ok(serde_json::to_string(key)?)
}

fn check_foreign_keys(
    tables: &BTreeMap<String, MemoryTable>,
    spec: &TableSpec,
    records: &[FlatRecord],
) -> Result<(), StoreError> {
    for fk in &spec.foreign_keys {
        for record in records {
            let Some(value) = record.get(&fk.column).filter(|cell| !cell.is_null()) else {
                continue;
            };
            let found = tables.get(&fk.references).is_some_and(|parent| {
                parent
                    .rows
                    .values()
                    .any(|row| row.get(&fk.references_column) == Some(value))
            });
            if !found {
                return Err(StoreError::ForeignKey {
                    table: spec.name.clone(),
                    column: fk.column.clone(),
                    references: fk.references.clone(),
                    value: serde_json::to_string(value)?,
                });
            }
        }
    }
    Ok(())
}

fn write_rows(
    tables: &mut BTreeMap<String, MemoryTable>,
    spec: &TableSpec,
    records: &[FlatRecord],
) -> Result<usize, StoreError> {
    let keys = records
        .iter()
        .map(|record| spec.key_of(record).and_then(|key| encode_key(&key)))
        .collect::<Result<Vec<_>, _>>()?;
    check_foreign_keys(tables, spec, records)?;

    let table = tables.entry(spec.name.clone()).or_default();
    for (key, record) in keys.into_iter().zip(records) {
        let record = fold_column_case(record, &spec.primary_key, &table.columns);
        table.add_columns(&record);
        table.rows.insert(key, record);
    }
    Ok(records.len())
}

#[async_trait]
impl TableStore for MemoryStore {
    async fn ensure_table(&self, spec: &TableSpec, sample: &FlatRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if let Some(table) = tables.get_mut(&spec.name) {
            let sample = fold_column_case(sample, &spec.primary_key, &table.columns);
            table.add_columns(&sample);
            return Ok(());
        }
        if sample.is_empty() {
            return Err(StoreError::EmptySample(spec.name.clone()));
        }
        let mut table = MemoryTable::default();
        table.add_columns(&fold_column_case(sample, &spec.primary_key, &[]));
        tables.insert(spec.name.clone(), table);
        Ok(())
    }

    async fn upsert(&self, spec: &TableSpec, records: &[FlatRecord]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut tables = self.tables.lock().await;
        write_rows(&mut tables, spec, records)
    }

    async fn replace(&self, spec: &TableSpec, records: &[FlatRecord]) -> Result<usize, StoreError> {
        let mut tables = self.tables.lock().await;
        let previous = tables.remove(&spec.name);
        if records.is_empty() {
            return Ok(0);
        }
        match write_rows(&mut tables, spec, records) {
            Ok(written) => Ok(written),
            Err(err) => {
                tables.remove(&spec.name);
                if let Some(previous) = previous {
                    tables.insert(spec.name.clone(), previous);
                }
                Err(err)
            }
        }
    }

    async fn query(&self, table: &str, filter: &RowFilter) -> Result<Vec<FlatRecord>, StoreError> {
        let tables = self.tables.lock().await;
        let table_data = tables
            .get(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        Ok(table_data
            .rows
            .values()
            .filter(|row| filter.matches(row))
            .map(|row| table_data.aligned(row))
            .collect())
    }

    async fn table_names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.tables.lock().await.keys().cloned().collect())
    }
}
