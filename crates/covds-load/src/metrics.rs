//! Narrow metric tables rebuilt from the wide raw tables after loading.

use std::collections::BTreeMap;

use covds_core::{Cell, FlatRecord, Scope, DATE_COLUMN, LOCATION_ID_COLUMN, LOCATION_TYPE_COLUMN};
use covds_storage::{rows_digest, table_digest, RowFilter, StoreError, TableSpec, TableStore};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::loader::{DISTRICTS_TABLE, STATES_TABLE};

pub const METRIC_COLUMN: &str = "metric";
pub const VALUE_COLUMN: &str = "value";
pub const LOCATION_NAME_COLUMN: &str = "location_name";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateSelection {
    /// Only rows carrying the most recent date among the family's source rows.
    Latest,
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricColumn {
    pub column: String,
    pub metric: String,
}

/// One wide-to-narrow reshaping: each listed column of each selected source row becomes a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricFamily {
    pub target_table: String,
    pub source_table: String,
    pub scope: Scope,
    pub dates: DateSelection,
    pub metrics: Vec<MetricColumn>,
}

impl MetricFamily {
    fn new(
        target_table: &str,
        source_table: &str,
        scope: Scope,
        dates: DateSelection,
        metrics: &[(&str, &str)],
    ) -> Self {
        Self {
            target_table: target_table.to_string(),
            source_table: source_table.to_string(),
            scope,
            dates,
            metrics: metrics
                .iter()
                .map(|(column, metric)| MetricColumn {
                    column: column.to_string(),
                    metric: metric.to_string(),
                })
                .collect(),
        }
    }

    fn table_spec(&self) -> TableSpec {
        TableSpec::new(
            self.target_table.as_str(),
            [LOCATION_TYPE_COLUMN, LOCATION_ID_COLUMN, DATE_COLUMN, METRIC_COLUMN],
        )
    }
}

const AGE_BANDS: &[(&str, &str)] = &[
    ("vac_18_30", "vac_18_30"),
    ("vac_30_45", "vac_30_45"),
    ("vac_45_60", "vac_45_60"),
    ("above_60", "above_60"),
];
const VACCINE_TYPES: &[(&str, &str)] = &[("covishield", "covidshield"), ("covaxin", "covaxin")];
const DOSE_TYPES: &[(&str, &str)] = &[("tot_dose_1", "Dose 1"), ("tot_dose_2", "Dose 2")];
const DAILY_TREND: &[(&str, &str)] = &[
    ("today", "today"),
    ("tot_dose_1", "Dose 1"),
    ("tot_dose_2", "Dose 2"),
];

const BY_AGE: &str = "raw_vaccination_by_age";
const COUNTS: &str = "raw_vaccination_count";

pub fn builtin_families() -> Vec<MetricFamily> {
    use DateSelection::{All, Latest};
    use Scope::{National, State};
    vec![
        MetricFamily::new("final_vaccination_age", BY_AGE, National, Latest, AGE_BANDS),
        MetricFamily::new("final_state_vaccination_age", BY_AGE, State, Latest, AGE_BANDS),
        MetricFamily::new("vaccine_data", COUNTS, National, Latest, VACCINE_TYPES),
        MetricFamily::new("state_vaccine_data", COUNTS, State, Latest, VACCINE_TYPES),
        MetricFamily::new("national_dose_data", COUNTS, National, Latest, DOSE_TYPES),
        MetricFamily::new("national_vaccine_trend", COUNTS, National, All, DAILY_TREND),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebuildOutcome {
    pub table: String,
    pub source_rows: usize,
    pub rows: usize,
    pub selected_date: Option<String>,
    pub digest: String,
}

/// Replaces every family's table with a fresh reshaping of its source table.
pub async fn rebuild(
    store: &dyn TableStore,
    families: &[MetricFamily],
) -> Result<Vec<RebuildOutcome>, StoreError> {
    let names = LocationNames::read(store).await?;
    let mut outcomes = Vec::with_capacity(families.len());
    for family in families {
        outcomes.push(rebuild_family(store, family, &names).await?);
    }
    Ok(outcomes)
}

async fn rebuild_family(
    store: &dyn TableStore,
    family: &MetricFamily,
    names: &LocationNames,
) -> Result<RebuildOutcome, StoreError> {
    let source = if store.has_table(&family.source_table).await? {
        let filter = RowFilter::all().eq(LOCATION_TYPE_COLUMN, family.scope.as_str());
        store.query(&family.source_table, &filter).await?
    } else {
        warn!(
            table = %family.target_table,
            source = %family.source_table,
            "source table missing; derived table will be empty"
        );
        Vec::new()
    };

    let selected_date = match family.dates {
        DateSelection::Latest => source.iter().filter_map(row_date).max().map(str::to_string),
        DateSelection::All => None,
    };
    let mut selected = source
        .iter()
        .filter(|row| match &selected_date {
            Some(date) => row_date(row) == Some(date.as_str()),
            None => true,
        })
        .collect::<Vec<_>>();
    selected.sort_by_key(|row| {
        (
            row.get(LOCATION_ID_COLUMN).and_then(Cell::as_i64),
            row_date(row).map(str::to_string),
        )
    });

    let mut records = Vec::with_capacity(selected.len() * family.metrics.len());
    for row in &selected {
        let location_id = row.get(LOCATION_ID_COLUMN).cloned().unwrap_or(Cell::Null);
        let location_name = names.lookup(family.scope, location_id.as_i64());
        for metric in &family.metrics {
            records.push(
                FlatRecord::new()
                    .with(METRIC_COLUMN, metric.metric.as_str())
                    .with(VALUE_COLUMN, row.get(&metric.column).cloned().unwrap_or(Cell::Null))
                    .with(LOCATION_TYPE_COLUMN, family.scope.as_str())
                    .with(LOCATION_ID_COLUMN, location_id.clone())
                    .with(LOCATION_NAME_COLUMN, location_name.map(str::to_string))
                    .with(DATE_COLUMN, row.get(DATE_COLUMN).cloned().unwrap_or(Cell::Null)),
            );
        }
    }

    let rows = store.replace(&family.table_spec(), &records).await?;
    let digest = if rows == 0 {
        rows_digest(&[])?
    } else {
        table_digest(store, &family.target_table).await?
    };
    info!(
        table = %family.target_table,
        source_rows = selected.len(),
        rows,
        date = selected_date.as_deref().unwrap_or("all"),
        "rebuilt derived table"
    );
    Ok(RebuildOutcome {
        table: family.target_table.clone(),
        source_rows: selected.len(),
        rows,
        selected_date,
        digest,
    })
}

fn row_date(row: &FlatRecord) -> Option<&str> {
    row.get(DATE_COLUMN).and_then(Cell::as_str)
}

#[derive(Debug, Default)]
struct LocationNames {
    states: BTreeMap<i64, String>,
    districts: BTreeMap<i64, String>,
}

impl LocationNames {
    async fn read(store: &dyn TableStore) -> Result<Self, StoreError> {
        Ok(Self {
            states: read_names(store, STATES_TABLE).await?,
            districts: read_names(store, DISTRICTS_TABLE).await?,
        })
    }

    fn lookup(&self, scope: Scope, id: Option<i64>) -> Option<&str> {
        let id = id?;
        match scope {
            Scope::National => None,
            Scope::State => self.states.get(&id).map(String::as_str),
            Scope::District => self.districts.get(&id).map(String::as_str),
        }
    }
}

async fn read_names(store: &dyn TableStore, table: &str) -> Result<BTreeMap<i64, String>, StoreError> {
    if !store.has_table(table).await? {
        return Ok(BTreeMap::new());
    }
    Ok(store
        .query(table, &RowFilter::all())
        .await?
        .iter()
        .filter_map(|row| {
            let id = row.get("id")?.as_i64()?;
            let name = row.get("name")?.as_str()?;
            Some((id, name.to_string()))
        })
        .collect())
}
