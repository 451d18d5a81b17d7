//! Declarative table of mapping entries, keyed by document shape and scope.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::path::ROOT_PATH;
use crate::scope::scope_applies;
use crate::{Scope, DATE_COLUMN, DEFAULT_DOCUMENT, LOCATION_ID_COLUMN, LOCATION_TYPE_COLUMN};

/// Record shape found at an entry's source path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    /// One record from one object.
    Object,
    /// One record per element of an array of objects.
    ObjectList,
}

impl Shape {
    pub fn as_str(&self) -> &'static str {
        match self {
            Shape::Object => "object",
            Shape::ObjectList => "object_list",
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an entry's injected `location_id` comes from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationIdSource {
    /// The payload's own location, also for list rows describing its children.
    #[default]
    Payload,
    /// A column already present on the produced record.
    Column(String),
}

/// One declarative rule: how to extract one table's rows from a raw document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub target_table: String,
    #[serde(alias = "path")]
    pub source_path: String,
    #[serde(alias = "type")]
    pub shape: Shape,
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    #[serde(default, alias = "location_type")]
    pub scope: Option<Scope>,
    #[serde(default, alias = "load_location_columns")]
    pub location_columns: bool,
    #[serde(default)]
    pub location_id_source: LocationIdSource,
    #[serde(alias = "pk")]
    pub primary_key: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("entry for `{table}` has an empty {what}")]
    Empty { table: String, what: &'static str },
    #[error("root-path entry `{table}` must be object-shaped and declare explicit columns")]
    RootPathNeedsColumns { table: String },
    #[error("primary key column `{column}` of `{table}` is never produced by the entry")]
    KeyNotProduced { table: String, column: String },
    #[error("location id column `{column}` of `{table}` is {problem}")]
    LocationIdColumn {
        table: String,
        column: String,
        problem: &'static str,
    },
    #[error("table `{table}` is mapped twice for document `{document}` in scope {scope}")]
    DuplicateTarget {
        document: String,
        table: String,
        scope: Scope,
    },
}

impl MappingEntry {
    pub fn is_root(&self) -> bool {
        self.source_path == ROOT_PATH
    }

    /// Primary key columns that are not synthesized by the mapper or the scoper.
    pub fn data_key_columns(&self) -> impl Iterator<Item = &str> {
        self.primary_key.iter().map(String::as_str).filter(|column| {
            *column != DATE_COLUMN
                && !(self.location_columns
                    && (*column == LOCATION_TYPE_COLUMN || *column == LOCATION_ID_COLUMN))
        })
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        let table = &self.target_table;
        if table.trim().is_empty() {
            return Err(RegistryError::Empty {
                table: table.clone(),
                what: "target table",
            });
        }
        if self.source_path.trim().is_empty() {
            return Err(RegistryError::Empty {
                table: table.clone(),
                what: "source path",
            });
        }
        if self.primary_key.is_empty() {
            return Err(RegistryError::Empty {
                table: table.clone(),
                what: "primary key",
            });
        }
        if self.is_root() && (self.shape != Shape::Object || self.columns.is_none()) {
            return Err(RegistryError::RootPathNeedsColumns {
                table: table.clone(),
            });
        }
        if let LocationIdSource::Column(column) = &self.location_id_source {
            let problem = if !self.location_columns {
                Some("set on an entry that does not inject location columns")
            } else if self
                .columns
                .as_ref()
                .is_some_and(|columns| !columns.contains(column))
            {
                Some("not among the entry's columns")
            } else {
                None
            };
            if let Some(problem) = problem {
                return Err(RegistryError::LocationIdColumn {
                    table: table.clone(),
                    column: column.clone(),
                    problem,
                });
            }
        }

        for column in &self.primary_key {
            let synthesized = column == DATE_COLUMN
                || (self.location_columns
                    && (column == LOCATION_TYPE_COLUMN || column == LOCATION_ID_COLUMN));
            let location_without_injection = !self.location_columns
                && (column == LOCATION_TYPE_COLUMN || column == LOCATION_ID_COLUMN);
            let declared = self
                .columns
                .as_ref()
                .map(|columns| columns.iter().any(|c| c == column));
            let produced = synthesized || declared.unwrap_or(!location_without_injection);
            if !produced {
                return Err(RegistryError::KeyNotProduced {
                    table: table.clone(),
                    column: column.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Immutable set of mapping entries per document shape.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaRegistry {
    documents: BTreeMap<String, Vec<MappingEntry>>,
}

impl SchemaRegistry {
    pub fn new(documents: BTreeMap<String, Vec<MappingEntry>>) -> Result<Self, RegistryError> {
        for (document, entries) in &documents {
            for entry in entries {
                entry.validate()?;
            }
            for scope in Scope::ALL {
                let mut seen = BTreeSet::new();
                for entry in entries.iter().filter(|e| scope_applies(e, scope)) {
                    if !seen.insert(entry.target_table.as_str()) {
                        return Err(RegistryError::DuplicateTarget {
                            document: document.clone(),
                            table: entry.target_table.clone(),
                            scope,
                        });
                    }
                }
            }
        }
        Ok(Self { documents })
    }

    /// Registry with a single document shape.
    pub fn single(
        document: impl Into<String>,
        entries: Vec<MappingEntry>,
    ) -> Result<Self, RegistryError> {
        Self::new(BTreeMap::from([(document.into(), entries)]))
    }

    /// Mapping for the CoWIN `getPublicReports` snapshot, shared by all three scopes.
    pub fn cowin_public_reports() -> Self {
        let entries = PUBLIC_REPORT_ENTRIES
            .iter()
            .map(EntryDef::to_entry)
            .collect();
        Self {
            documents: BTreeMap::from([(DEFAULT_DOCUMENT.to_string(), entries)]),
        }
    }

    /// Entries applicable to a payload of `document` shape collected at `scope`.
    pub fn entries_for<'a>(
        &'a self,
        document: &str,
        scope: Scope,
    ) -> impl Iterator<Item = &'a MappingEntry> + 'a {
        self.documents
            .get(document)
            .into_iter()
            .flatten()
            .filter(move |entry| scope_applies(entry, scope))
    }

    pub fn documents(&self) -> impl Iterator<Item = &str> {
        self.documents.keys().map(String::as_str)
    }

    pub fn entries(&self, document: &str) -> &[MappingEntry] {
        self.documents
            .get(document)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn target_tables(&self) -> BTreeSet<&str> {
        self.documents
            .values()
            .flatten()
            .map(|entry| entry.target_table.as_str())
            .collect()
    }
}

struct EntryDef {
    target_table: &'static str,
    source_path: &'static str,
    shape: Shape,
    columns: Option<&'static [&'static str]>,
    scope: Option<Scope>,
    location_columns: bool,
    primary_key: &'static [&'static str],
}

impl EntryDef {
    fn to_entry(&self) -> MappingEntry {
        MappingEntry {
            target_table: self.target_table.to_string(),
            source_path: self.source_path.to_string(),
            shape: self.shape,
            columns: self
                .columns
                .map(|columns| columns.iter().map(|c| c.to_string()).collect()),
            scope: self.scope,
            location_columns: self.location_columns,
            location_id_source: LocationIdSource::Payload,
            primary_key: self.primary_key.iter().map(|c| c.to_string()).collect(),
        }
    }
}

const LOCATION_DATE_KEY: &[&str] = &["location_type", "location_id", "date"];

static PUBLIC_REPORT_ENTRIES: &[EntryDef] = &[
    EntryDef {
        target_table: "raw_vaccination_site_count",
        source_path: "topBlock.sites",
        shape: Shape::Object,
        columns: None,
        scope: None,
        location_columns: true,
        primary_key: LOCATION_DATE_KEY,
    },
    EntryDef {
        target_table: "raw_registration_count",
        source_path: "topBlock.registration",
        shape: Shape::Object,
        columns: None,
        scope: None,
        location_columns: true,
        primary_key: LOCATION_DATE_KEY,
    },
    EntryDef {
        target_table: "raw_vaccination_session_count",
        source_path: "topBlock.sessions",
        shape: Shape::Object,
        columns: None,
        scope: None,
        location_columns: true,
        primary_key: LOCATION_DATE_KEY,
    },
    EntryDef {
        target_table: "raw_vaccination_count",
        source_path: "topBlock.vaccination",
        shape: Shape::Object,
        columns: None,
        scope: None,
        location_columns: true,
        primary_key: LOCATION_DATE_KEY,
    },
    EntryDef {
        target_table: "raw_vaccination_by_age",
        source_path: "vaccinationByAge",
        shape: Shape::Object,
        columns: None,
        scope: None,
        location_columns: true,
        primary_key: LOCATION_DATE_KEY,
    },
    EntryDef {
        target_table: "raw_session_vaccination_count",
        source_path: "vaccinationDoneByTime",
        shape: Shape::ObjectList,
        columns: None,
        scope: None,
        location_columns: true,
        primary_key: &["location_type", "location_id", "date", "label"],
    },
    EntryDef {
        target_table: "raw_daily_vaccination_snapshot",
        source_path: "last7DaysVaccination",
        shape: Shape::ObjectList,
        columns: None,
        scope: None,
        location_columns: true,
        primary_key: &["location_type", "location_id", "date", "vaccine_date"],
    },
    EntryDef {
        target_table: "raw_daily_registration_snapshot",
        source_path: "last7DaysRegistration",
        shape: Shape::ObjectList,
        columns: None,
        scope: None,
        location_columns: true,
        primary_key: &["location_type", "location_id", "date", "reg_date"],
    },
    EntryDef {
        target_table: "raw_daily_session_status_snapshot",
        source_path: "last5daySessionStatus",
        shape: Shape::ObjectList,
        columns: None,
        scope: None,
        location_columns: true,
        primary_key: &["location_type", "location_id", "date", "session_date"],
    },
    EntryDef {
        target_table: "raw_meta",
        source_path: ROOT_PATH,
        shape: Shape::Object,
        columns: Some(&["timestamp", "aefiPercentage"]),
        scope: None,
        location_columns: true,
        primary_key: LOCATION_DATE_KEY,
    },
    // The same beneficiary breakdown lands in a different table one level down per scope.
    EntryDef {
        target_table: "raw_state_level_vaccination_count",
        source_path: "getBeneficiariesGroupBy",
        shape: Shape::ObjectList,
        columns: None,
        scope: Some(Scope::National),
        location_columns: false,
        primary_key: &["date", "state_id"],
    },
    EntryDef {
        target_table: "raw_district_level_vaccination_count",
        source_path: "getBeneficiariesGroupBy",
        shape: Shape::ObjectList,
        columns: None,
        scope: Some(Scope::State),
        location_columns: false,
        primary_key: &["date", "district_id"],
    },
    EntryDef {
        target_table: "raw_site_level_vaccination_count",
        source_path: "getBeneficiariesGroupBy",
        shape: Shape::ObjectList,
        columns: None,
        scope: Some(Scope::District),
        location_columns: true,
        primary_key: &["location_type", "location_id", "date", "session_site_id"],
    },
];
