//! Run reports and Parquet snapshots of loaded tables.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use covds_core::{Cell, FlatRecord};
use covds_storage::{RowFilter, TableStore};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::RunReport;

pub const SUMMARY_FILE: &str = "load_summary.json";
pub const BRIEF_FILE: &str = "daily_brief.md";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes `load_summary.json` and `daily_brief.md` into `reports_dir`.
pub async fn write_run_reports(reports_dir: &Path, report: &RunReport) -> Result<()> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing run summary")?;
    fs::write(reports_dir.join(SUMMARY_FILE), json)
        .await
        .with_context(|| format!("writing {SUMMARY_FILE}"))?;
    fs::write(reports_dir.join(BRIEF_FILE), daily_brief(report))
        .await
        .with_context(|| format!("writing {BRIEF_FILE}"))?;
    Ok(())
}

pub fn daily_brief(report: &RunReport) -> String {
    let mut lines = vec![
        "# CoWIN Dataset Daily Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", report.run_id),
        format!("- Stage: {}", report.stage),
        format!("- Started: {}", report.started_at),
        format!("- Finished: {}", report.finished_at),
    ];

    if let Some(load) = &report.load {
        lines.push(format!("- Payloads loaded: {}", load.payloads_loaded));
        lines.push(format!("- Records written: {}", load.total_records()));
        lines.push(format!("- Failed pairings: {}", load.failures.len()));
        lines.push(format!("- Skipped files: {}", load.skipped.len()));
        lines.push(String::new());
        lines.push("## Records per table".to_string());
        lines.extend(
            load.records_written
                .iter()
                .map(|(table, count)| format!("- {table}: {count}")),
        );
        if !load.failures.is_empty() {
            lines.push(String::new());
            lines.push("## Failures".to_string());
            lines.extend(load.failures.iter().map(|f| {
                format!("- {} `{}` -> {}: {}", f.payload, f.path, f.table, f.error)
            }));
        }
    }

    if !report.derived.is_empty() {
        lines.push(String::new());
        lines.push("## Derived tables".to_string());
        lines.extend(report.derived.iter().map(|d| {
            format!(
                "- {}: {} rows ({}) sha256 `{}`",
                d.table,
                d.rows,
                d.selected_date.as_deref().unwrap_or("all dates"),
                d.digest
            )
        }));
    }

    lines.push(String::new());
    lines.join("\n")
}

/// Writes each table to `<reports_dir>/snapshots/<table>.parquet` plus a manifest of digests.
pub async fn export_parquet_snapshots(
    store: &dyn TableStore,
    reports_dir: &Path,
    tables: &[String],
) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let mut files = Vec::with_capacity(tables.len());
    for table in tables {
        if !store.has_table(table).await? {
            continue;
        }
        let rows = store
            .query(table, &RowFilter::all())
            .await
            .with_context(|| format!("reading {table}"))?;
        if rows.is_empty() {
            continue;
        }
        let path = snapshot_dir.join(format!("{table}.parquet"));
        write_parquet(&path, table_batch(table, &rows)?)?;
        files.push(manifest_entry(table, reports_dir, &path, rows.len())?);
    }

    let manifest = ParquetManifest {
        schema_version: 1,
        files,
    };
    let manifest_path = snapshot_dir.join(MANIFEST_FILE);
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

/// Arrow type holding every non-null cell of a column; mixed columns fall back to text.
fn column_type<'a>(cells: impl Iterator<Item = &'a Cell>) -> DataType {
    let mut found: Option<DataType> = None;
    for cell in cells {
        let kind = match cell {
            Cell::Null => continue,
            Cell::Boolean(_) => DataType::Boolean,
            Cell::Integer(_) => DataType::Int64,
            Cell::Real(_) => DataType::Float64,
            Cell::Text(_) => return DataType::Utf8,
        };
        found = Some(match (found, kind) {
            (None, kind) => kind,
            (Some(prev), kind) if prev == kind => prev,
            (Some(DataType::Int64), DataType::Float64)
            | (Some(DataType::Float64), DataType::Int64) => DataType::Float64,
            _ => return DataType::Utf8,
        });
    }
    found.unwrap_or(DataType::Utf8)
}

fn cell_text(cell: &Cell) -> Option<String> {
    match cell {
        Cell::Null => None,
        Cell::Boolean(v) => Some(v.to_string()),
        Cell::Integer(v) => Some(v.to_string()),
        Cell::Real(v) => Some(v.to_string()),
        Cell::Text(v) => Some(v.clone()),
    }
}

fn table_batch(table: &str, rows: &[FlatRecord]) -> Result<RecordBatch> {
    let columns = rows
        .first()
        .map(|row| row.columns().map(str::to_string).collect::<Vec<_>>())
        .unwrap_or_default();

    let mut fields = Vec::with_capacity(columns.len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(columns.len());
    for column in &columns {
        let cells = rows
            .iter()
            .map(|row| row.get(column).unwrap_or(&Cell::Null))
            .collect::<Vec<_>>();
        let data_type = column_type(cells.iter().copied());
        let array: ArrayRef = match data_type {
            DataType::Boolean => Arc::new(BooleanArray::from(
                cells
                    .iter()
                    .map(|cell| match cell {
                        Cell::Boolean(v) => Some(*v),
                        _ => None,
                    })
                    .collect::<Vec<_>>(),
            )),
            DataType::Int64 => Arc::new(Int64Array::from(
                cells.iter().map(|cell| cell.as_i64()).collect::<Vec<_>>(),
            )),
            DataType::Float64 => Arc::new(Float64Array::from(
                cells.iter().map(|cell| cell.as_f64()).collect::<Vec<_>>(),
            )),
            _ => Arc::new(StringArray::from(
                cells.iter().map(|cell| cell_text(cell)).collect::<Vec<_>>(),
            )),
        };
        fields.push(ArrowField::new(column.as_str(), array.data_type().clone(), true));
        arrays.push(array);
    }

    let schema = Arc::new(Schema::new(fields));
    RecordBatch::try_new(schema, arrays).with_context(|| format!("building {table} record batch"))
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(
    name: &str,
    reports_dir: &Path,
    path: &Path,
    rows: usize,
) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        rows,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}
