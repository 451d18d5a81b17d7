//! Snapshot tree enumeration and location reference files.
//!
//! A snapshot root holds one folder per collection date:
//!
//! ```text
//! <root>/2021-06-01/national.json
//! <root>/2021-06-01/states/31.json
//! <root>/2021-06-01/districts/571.json
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use covds_core::mapper::json_kind;
use covds_core::{Payload, Scope, DATE_COLUMN};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

mod reference;

pub use reference::{load_reference_data, District, ReferenceData, ReferenceError, State};

pub const CRATE_NAME: &str = "covds-sources";

pub const NATIONAL_FILE: &str = "national.json";
pub const STATES_DIR: &str = "states";
pub const DISTRICTS_DIR: &str = "districts";

const FOLDER_DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{}: top-level value is {found}, expected an object", path.display())]
    NotAnObject { path: PathBuf, found: &'static str },
}

/// A snapshot file located in the tree, not yet read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadRef {
    pub scope: Scope,
    pub location_id: Option<i64>,
    pub folder_date: NaiveDate,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    pub payloads: Vec<PayloadRef>,
    pub skipped: Vec<SkippedEntry>,
}

impl ScanOutcome {
    fn skip(&mut self, path: &Path, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(path = %path.display(), %reason, "skipping snapshot entry");
        self.skipped.push(SkippedEntry {
            path: path.to_path_buf(),
            reason,
        });
    }
}

/// Lists every loadable snapshot under `root`.
///
/// Payloads come back ordered by date, then national, states and districts, then location id.
/// Entries that do not fit the layout are reported in `skipped`; only an unreadable root is an
/// error.
pub fn scan_snapshot_dir(root: &Path) -> Result<ScanOutcome, SourceError> {
    let mut outcome = ScanOutcome::default();
    let mut folders = Vec::new();
    for path in sorted_entries(root)? {
        let date = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| NaiveDate::parse_from_str(name, FOLDER_DATE_FORMAT).ok());
        match date {
            Some(date) if path.is_dir() => folders.push((date, path)),
            Some(_) => outcome.skip(&path, "not a directory"),
            None => outcome.skip(&path, "folder name is not a YYYY-MM-DD date"),
        }
    }
    folders.sort();

    for (date, folder) in folders {
        scan_date_folder(&folder, date, &mut outcome);
    }
    debug!(
        root = %root.display(),
        payloads = outcome.payloads.len(),
        skipped = outcome.skipped.len(),
        "scanned snapshot tree"
    );
    Ok(outcome)
}

fn scan_date_folder(folder: &Path, date: NaiveDate, outcome: &mut ScanOutcome) {
    let entries = match sorted_entries(folder) {
        Ok(entries) => entries,
        Err(err) => {
            outcome.skip(folder, err.to_string());
            return;
        }
    };

    let mut national = None;
    let mut states = None;
    let mut districts = None;
    for path in entries {
        match path.file_name().and_then(|name| name.to_str()) {
            Some(NATIONAL_FILE) if path.is_file() => national = Some(path),
            Some(STATES_DIR) if path.is_dir() => states = Some(path),
            Some(DISTRICTS_DIR) if path.is_dir() => districts = Some(path),
            _ => outcome.skip(&path, "unexpected entry in date folder"),
        }
    }

    if let Some(path) = national {
        outcome.payloads.push(PayloadRef {
            scope: Scope::National,
            location_id: None,
            folder_date: date,
            path,
        });
    }
    if let Some(dir) = states {
        scan_location_folder(&dir, Scope::State, date, outcome);
    }
    if let Some(dir) = districts {
        scan_location_folder(&dir, Scope::District, date, outcome);
    }
}

fn scan_location_folder(dir: &Path, scope: Scope, date: NaiveDate, outcome: &mut ScanOutcome) {
    let entries = match sorted_entries(dir) {
        Ok(entries) => entries,
        Err(err) => {
            outcome.skip(dir, err.to_string());
            return;
        }
    };

    let mut found = Vec::new();
    for path in entries {
        if !path.is_file() {
            outcome.skip(&path, "not a file");
            continue;
        }
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            outcome.skip(&path, "not a .json file");
            continue;
        }
        let id = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.parse::<i64>().ok());
        match id {
            Some(id) => found.push((id, path)),
            None => outcome.skip(&path, format!("file name is not a {scope} id")),
        }
    }
    found.sort();

    outcome
        .payloads
        .extend(found.into_iter().map(|(id, path)| PayloadRef {
            scope,
            location_id: Some(id),
            folder_date: date,
            path,
        }));
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, SourceError> {
    let io_err = |source| SourceError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths = fs::read_dir(dir)
        .map_err(io_err)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_err)?;
    paths.sort();
    Ok(paths)
}

/// Reads and parses one snapshot file.
///
/// The payload date is the body's own `date` field when it holds a valid date, otherwise the
/// date of the folder the file was found in.
pub fn read_payload(source: &PayloadRef) -> Result<Payload, SourceError> {
    let text = fs::read_to_string(&source.path).map_err(|err| SourceError::Io {
        path: source.path.clone(),
        source: err,
    })?;
    let body: JsonValue = serde_json::from_str(&text).map_err(|err| SourceError::Json {
        path: source.path.clone(),
        source: err,
    })?;
    if !body.is_object() {
        return Err(SourceError::NotAnObject {
            path: source.path.clone(),
            found: json_kind(&body),
        });
    }

    let date = body
        .get(DATE_COLUMN)
        .and_then(JsonValue::as_str)
        .and_then(|raw| NaiveDate::parse_from_str(raw, FOLDER_DATE_FORMAT).ok())
        .unwrap_or(source.folder_date);
    if date != source.folder_date {
        debug!(
            path = %source.path.display(),
            folder_date = %source.folder_date,
            body_date = %date,
            "body date differs from folder date"
        );
    }

    Ok(Payload::new(source.scope, source.location_id, date, body))
}
