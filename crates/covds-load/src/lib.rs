//! Load pipeline: snapshot tree into the target store, then derived metric tables.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use covds_core::{MappingEntry, SchemaRegistry};
use covds_sources::load_reference_data;
use covds_storage::{connect_store, row_counts, TableStore};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

pub mod export;
pub mod loader;
pub mod metrics;

pub use export::{daily_brief, export_parquet_snapshots, write_run_reports};
pub use loader::{LoadFailure, LoadSummary, Loader, PairingError, PayloadOutcome, SkippedFile};
pub use metrics::{
    builtin_families, rebuild, DateSelection, MetricColumn, MetricFamily, RebuildOutcome,
};

pub const CRATE_NAME: &str = "covds-load";

#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub database_url: String,
    pub data_dir: PathBuf,
    pub states_file: PathBuf,
    pub districts_file: PathBuf,
    pub registry_file: Option<PathBuf>,
    pub reports_dir: PathBuf,
    pub fresh_db: bool,
}

impl LoadConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("COVDS_DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://covid-ds.db".to_string()),
            data_dir: std::env::var("COVDS_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/cowin")),
            states_file: std::env::var("COVDS_STATES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./states.json")),
            districts_file: std::env::var("COVDS_DISTRICTS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./districts.json")),
            registry_file: std::env::var("COVDS_REGISTRY_FILE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            reports_dir: std::env::var("COVDS_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            fresh_db: std::env::var("COVDS_FRESH_DB")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    documents: BTreeMap<String, Vec<MappingEntry>>,
}

/// Reads a YAML registry of the form `documents: { <document>: [<entry>, ...] }`.
pub fn load_registry_file(path: &Path) -> Result<SchemaRegistry> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let file: RegistryFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    SchemaRegistry::new(file.documents)
        .with_context(|| format!("validating registry {}", path.display()))
}

/// Pipeline stage selected by the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Load,
    Derive,
    Run,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Load => "load",
            Stage::Derive => "derive",
            Stage::Run => "run",
        }
    }

    fn loads(&self) -> bool {
        matches!(self, Stage::Load | Stage::Run)
    }

    fn derives(&self) -> bool {
        matches!(self, Stage::Derive | Stage::Run)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "load" => Ok(Stage::Load),
            "derive" => Ok(Stage::Derive),
            "run" => Ok(Stage::Run),
            other => bail!("unknown stage `{other}` (expected load, derive or run)"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub stage: Stage,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub database_url: String,
    pub load: Option<LoadSummary>,
    pub derived: Vec<RebuildOutcome>,
    pub row_counts: BTreeMap<String, usize>,
    pub reports_dir: String,
    pub parquet_manifest: Option<String>,
}

pub struct Pipeline {
    config: LoadConfig,
    loader: Loader,
    families: Vec<MetricFamily>,
}

impl Pipeline {
    /// Opens the store and registry named by `config`. `fresh` discards an existing database.
    pub async fn open(config: LoadConfig, fresh: bool) -> Result<Self> {
        let registry = match &config.registry_file {
            Some(path) => load_registry_file(path)?,
            None => SchemaRegistry::cowin_public_reports(),
        };
        let store = connect_store(&config.database_url, fresh)
            .await
            .with_context(|| format!("opening store {}", config.database_url))?;
        Ok(Self::with_store(config, store, Arc::new(registry)))
    }

    pub fn with_store(
        config: LoadConfig,
        store: Arc<dyn TableStore>,
        registry: Arc<SchemaRegistry>,
    ) -> Self {
        Self {
            config,
            loader: Loader::new(store, registry),
            families: builtin_families(),
        }
    }

    pub fn with_families(mut self, families: Vec<MetricFamily>) -> Self {
        self.families = families;
        self
    }

    pub fn store(&self) -> &dyn TableStore {
        self.loader.store().as_ref()
    }

    pub async fn load(&self) -> Result<LoadSummary> {
        let reference = load_reference_data(&self.config.states_file, &self.config.districts_file)?;
        self.loader
            .load_snapshot_dir(&reference, &self.config.data_dir)
            .await
    }

    pub async fn derive(&self) -> Result<Vec<RebuildOutcome>> {
        rebuild(self.store(), &self.families)
            .await
            .context("rebuilding derived tables")
    }

    /// Runs `stage` and writes its reports under `<reports_dir>/<run_id>/`.
    pub async fn run(&self, stage: Stage) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, %stage, database_url = %self.config.database_url, "starting run");

        let load = if stage.loads() {
            Some(self.load().await?)
        } else {
            None
        };
        let derived = if stage.derives() {
            self.derive().await?
        } else {
            Vec::new()
        };

        let reports_dir = self.config.reports_dir.join(run_id.to_string());
        let parquet_manifest = if derived.is_empty() {
            None
        } else {
            let tables = derived.iter().map(|d| d.table.clone()).collect::<Vec<_>>();
            let manifest = export_parquet_snapshots(self.store(), &reports_dir, &tables).await?;
            Some(manifest.display().to_string())
        };

        let report = RunReport {
            run_id,
            stage,
            started_at,
            finished_at: Utc::now(),
            database_url: self.config.database_url.clone(),
            load,
            derived,
            row_counts: row_counts(self.store()).await.context("counting rows")?,
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest,
        };
        write_run_reports(&reports_dir, &report).await?;
        info!(%run_id, reports_dir = %report.reports_dir, "run finished");
        Ok(report)
    }
}

/// Runs `stage` with configuration taken from the environment.
pub async fn run_once_from_env(stage: Stage) -> Result<RunReport> {
    let config = LoadConfig::from_env();
    let fresh = config.fresh_db && stage.loads();
    let pipeline = Pipeline::open(config, fresh).await?;
    pipeline.run(stage).await
}
