use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use covds_core::{
    apply_location_columns, map_records, FlatRecord, MapError, MappingEntry, Payload,
    SchemaRegistry,
};
use covds_sources::{read_payload, scan_snapshot_dir, ReferenceData};
use covds_storage::{StoreError, TableSpec, TableStore};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub const STATES_TABLE: &str = "states";
pub const DISTRICTS_TABLE: &str = "districts";

#[derive(Debug, Error)]
pub enum PairingError {
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadFailure {
    pub payload: String,
    pub file: Option<String>,
    pub table: String,
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFile {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub payloads_loaded: usize,
    pub reference_rows: usize,
    pub records_written: BTreeMap<String, usize>,
    pub failures: Vec<LoadFailure>,
    pub skipped: Vec<SkippedFile>,
}

impl LoadSummary {
    fn begin() -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            payloads_loaded: 0,
            reference_rows: 0,
            records_written: BTreeMap::new(),
            failures: Vec::new(),
            skipped: Vec::new(),
        }
    }

    pub fn total_records(&self) -> usize {
        self.records_written.values().sum()
    }
}

#[derive(Debug, Default)]
pub struct PayloadOutcome {
    pub records_written: BTreeMap<String, usize>,
    pub failures: Vec<(MappingEntry, PairingError)>,
}

/// Writes payloads into the target store following the schema registry.
///
/// Payloads are processed one at a time. A failed entry only loses that entry's rows for the
/// payload at hand; everything else keeps loading.
pub struct Loader {
    store: Arc<dyn TableStore>,
    registry: Arc<SchemaRegistry>,
}

impl Loader {
    pub fn new(store: Arc<dyn TableStore>, registry: Arc<SchemaRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &Arc<dyn TableStore> {
        &self.store
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Writes `states` and `districts`. Inconsistent reference data aborts the run.
    pub async fn load_reference(&self, reference: &ReferenceData) -> Result<usize> {
        reference.validate().context("validating reference data")?;

        let states = reference
            .states
            .iter()
            .map(|state| {
                FlatRecord::new()
                    .with("id", state.id)
                    .with("name", state.name.as_str())
            })
            .collect::<Vec<_>>();
        let districts = reference
            .districts
            .iter()
            .map(|district| {
                FlatRecord::new()
                    .with("id", district.district_id)
                    .with("name", district.district_name.as_str())
                    .with("state_id", district.state_id)
            })
            .collect::<Vec<_>>();

        let states_spec = TableSpec::new(STATES_TABLE, ["id"]);
        let districts_spec = TableSpec::new(DISTRICTS_TABLE, ["id"])
            .with_foreign_key("state_id", STATES_TABLE, "id");
        let written = self
            .store
            .upsert(&states_spec, &states)
            .await
            .context("writing states")?
            + self
                .store
                .upsert(&districts_spec, &districts)
                .await
                .context("writing districts")?;
        info!(
            states = states.len(),
            districts = districts.len(),
            "loaded reference data"
        );
        Ok(written)
    }

    pub async fn load_payload(&self, payload: &Payload) -> PayloadOutcome {
        let mut outcome = PayloadOutcome::default();
        for entry in self.registry.entries_for(&payload.document, payload.scope) {
            match self.load_entry(payload, entry).await {
                Ok(0) => {}
                Ok(written) => {
                    *outcome
                        .records_written
                        .entry(entry.target_table.clone())
                        .or_default() += written;
                }
                Err(err) => outcome.failures.push((entry.clone(), err)),
            }
        }
        outcome
    }

    async fn load_entry(
        &self,
        payload: &Payload,
        entry: &MappingEntry,
    ) -> Result<usize, PairingError> {
        let records = apply_location_columns(map_records(payload, entry)?, entry, payload);
        let Some(first) = records.first() else {
            debug!(
                payload = %payload.describe(),
                table = %entry.target_table,
                path = %entry.source_path,
                "path produced no records"
            );
            return Ok(0);
        };
        let spec = TableSpec::new(entry.target_table.as_str(), &entry.primary_key);
        for record in &records {
            spec.key_of(record)?;
        }
        self.store.ensure_table(&spec, first).await?;
        Ok(self.store.upsert(&spec, &records).await?)
    }

    pub async fn load(
        &self,
        reference: &ReferenceData,
        payloads: &[Payload],
    ) -> Result<LoadSummary> {
        let mut summary = LoadSummary::begin();
        summary.reference_rows = self.load_reference(reference).await?;
        for payload in payloads {
            self.record_payload(&mut summary, payload, None).await;
        }
        summary.finished_at = Utc::now();
        Ok(summary)
    }

    /// Loads reference data, then every snapshot file found under `root`.
    ///
    /// Files that cannot be read or parsed are skipped and listed in the summary.
    pub async fn load_snapshot_dir(
        &self,
        reference: &ReferenceData,
        root: &Path,
    ) -> Result<LoadSummary> {
        let mut summary = LoadSummary::begin();
        summary.reference_rows = self.load_reference(reference).await?;

        let scan = scan_snapshot_dir(root)
            .with_context(|| format!("scanning snapshot tree {}", root.display()))?;
        summary.skipped.extend(scan.skipped.into_iter().map(|entry| SkippedFile {
            path: entry.path.display().to_string(),
            reason: entry.reason,
        }));

        for source in &scan.payloads {
            match read_payload(source) {
                Ok(payload) => {
                    self.record_payload(&mut summary, &payload, Some(source.path.as_path()))
                        .await
                }
                Err(err) => {
                    warn!(
                        file = %source.path.display(),
                        error = %err,
                        "skipping unreadable snapshot"
                    );
                    summary.skipped.push(SkippedFile {
                        path: source.path.display().to_string(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        summary.finished_at = Utc::now();
        info!(
            payloads = summary.payloads_loaded,
            records = summary.total_records(),
            failures = summary.failures.len(),
            skipped = summary.skipped.len(),
            "snapshot tree loaded"
        );
        Ok(summary)
    }

    async fn record_payload(
        &self,
        summary: &mut LoadSummary,
        payload: &Payload,
        file: Option<&Path>,
    ) {
        let span = info_span!(
            "payload",
            scope = %payload.scope,
            location_id = payload.location_id,
            date = %payload.date
        );
        let outcome = self.load_payload(payload).instrument(span).await;
        for (table, written) in outcome.records_written {
            *summary.records_written.entry(table).or_default() += written;
        }
        for (entry, err) in outcome.failures {
            warn!(
                payload = %payload.describe(),
                file = ?file,
                table = %entry.target_table,
                path = %entry.source_path,
                error = %err,
                "skipping entry for payload"
            );
            summary.failures.push(LoadFailure {
                payload: payload.describe(),
                file: file.map(|f| f.display().to_string()),
                table: entry.target_table,
                path: entry.source_path,
                error: err.to_string(),
            });
        }
        summary.payloads_loaded += 1;
    }
}
