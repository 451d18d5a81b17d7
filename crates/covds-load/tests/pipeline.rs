use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use covds_core::{Cell, FlatRecord, Payload, SchemaRegistry, Scope};
use covds_load::{
    builtin_families, rebuild, DateSelection, LoadConfig, Loader, MetricColumn, MetricFamily,
    Pipeline, Stage,
};
use covds_sources::{load_reference_data, District, ReferenceData, State};
use covds_storage::{table_digest, MemoryStore, RowFilter, SqliteStore, TableStore};
use serde_json::json;
use tempfile::tempdir;

fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn fixtures() -> PathBuf {
    workspace_root().join("fixtures")
}

fn reference() -> ReferenceData {
    let root = fixtures();
    load_reference_data(&root.join("states.json"), &root.join("districts.json")).unwrap()
}

fn loader(store: Arc<dyn TableStore>) -> Loader {
    Loader::new(store, Arc::new(SchemaRegistry::cowin_public_reports()))
}

async fn stores() -> Vec<(&'static str, Arc<dyn TableStore>)> {
    vec![
        ("memory", Arc::new(MemoryStore::new()) as Arc<dyn TableStore>),
        (
            "sqlite",
            Arc::new(SqliteStore::in_memory().await.unwrap()) as Arc<dyn TableStore>,
        ),
    ]
}

async fn rows(store: &dyn TableStore, table: &str) -> Vec<FlatRecord> {
    store.query(table, &RowFilter::all()).await.unwrap()
}

async fn digests(store: &dyn TableStore) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for table in store.table_names().await.unwrap() {
        let digest = table_digest(store, &table).await.unwrap();
        out.insert(table, digest);
    }
    out
}

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

#[tokio::test]
async fn snapshot_tree_populates_every_scope() {
    for (name, store) in stores().await {
        let loader = loader(store.clone());
        let summary = loader
            .load_snapshot_dir(&reference(), &fixtures().join("cowin"))
            .await
            .unwrap();

        assert_eq!(summary.payloads_loaded, 6, "{name}");
        assert!(summary.failures.is_empty(), "{name}: {:?}", summary.failures);
        assert!(summary.skipped.is_empty(), "{name}: {:?}", summary.skipped);

        let expected = [
            ("states", 2),
            ("districts", 3),
            ("raw_vaccination_site_count", 6),
            ("raw_vaccination_count", 6),
            ("raw_vaccination_by_age", 6),
            ("raw_session_vaccination_count", 12),
            ("raw_daily_vaccination_snapshot", 18),
            ("raw_daily_session_status_snapshot", 12),
            ("raw_meta", 6),
            ("raw_state_level_vaccination_count", 4),
            ("raw_district_level_vaccination_count", 4),
            ("raw_site_level_vaccination_count", 4),
        ];
        for (table, count) in expected {
            assert_eq!(rows(store.as_ref(), table).await.len(), count, "{name}: {table}");
        }
    }
}

#[tokio::test]
async fn national_site_counts_are_keyed_on_location_zero() {
    for (name, store) in stores().await {
        loader(store.clone())
            .load_snapshot_dir(&reference(), &fixtures().join("cowin"))
            .await
            .unwrap();
        let national = store
            .query(
                "raw_vaccination_site_count",
                &RowFilter::all()
                    .eq("location_type", "national")
                    .eq("date", "2021-06-01"),
            )
            .await
            .unwrap();
        assert_eq!(national.len(), 1, "{name}");
        let row = &national[0];
        assert_eq!(row.get("location_id"), Some(&Cell::Integer(0)), "{name}");
        assert_eq!(row.get("total"), Some(&Cell::Integer(600_000)), "{name}");
        assert_eq!(row.get("govt"), Some(&Cell::Integer(520_000)), "{name}");
        assert_eq!(row.get("pvt"), Some(&Cell::Integer(80_000)), "{name}");
        assert_eq!(row.get("today"), Some(&Cell::Integer(300_000)), "{name}");
    }
}

#[tokio::test]
async fn loading_the_same_tree_twice_changes_nothing() {
    for (name, store) in stores().await {
        let loader = loader(store.clone());
        let root = fixtures().join("cowin");
        loader.load_snapshot_dir(&reference(), &root).await.unwrap();
        let first = digests(store.as_ref()).await;
        loader.load_snapshot_dir(&reference(), &root).await.unwrap();
        assert_eq!(first, digests(store.as_ref()).await, "{name}");
    }
}

#[tokio::test]
async fn beneficiary_breakdown_lands_in_the_scope_specific_table() {
    for (name, store) in stores().await {
        loader(store.clone())
            .load_snapshot_dir(&reference(), &fixtures().join("cowin"))
            .await
            .unwrap();

        let districts = store
            .query(
                "raw_district_level_vaccination_count",
                &RowFilter::all().eq("date", "2021-06-01"),
            )
            .await
            .unwrap();
        let mut ids = districts
            .iter()
            .map(|r| r.get("district_id").and_then(Cell::as_i64))
            .collect::<Vec<_>>();
        ids.sort();
        assert_eq!(ids, vec![Some(571), Some(572)], "{name}");
        assert!(districts.iter().all(|r| !r.contains("location_type")), "{name}");

        let states = rows(store.as_ref(), "raw_state_level_vaccination_count").await;
        assert!(states.iter().all(|r| !r.contains("district_id")), "{name}");

        let sites = rows(store.as_ref(), "raw_site_level_vaccination_count").await;
        assert!(
            sites
                .iter()
                .all(|r| r.get("location_id") == Some(&Cell::Integer(571))
                    && r.get("location_type") == Some(&Cell::Text("district".into()))),
            "{name}"
        );
    }
}

#[tokio::test]
async fn reloading_a_changed_payload_overwrites_the_row() {
    for (name, store) in stores().await {
        let loader = loader(store.clone());
        let payload = |today: i64| {
            Payload::new(
                Scope::State,
                Some(31),
                date("2021-06-01"),
                json!({"topBlock": {"sites": {"total": 600, "govt": 500, "pvt": 100, "today": today}}}),
            )
        };
        loader.load(&reference(), &[payload(10)]).await.unwrap();
        loader.load(&reference(), &[payload(25)]).await.unwrap();

        let sites = rows(store.as_ref(), "raw_vaccination_site_count").await;
        assert_eq!(sites.len(), 1, "{name}");
        assert_eq!(sites[0].get("today"), Some(&Cell::Integer(25)), "{name}");
    }
}

#[tokio::test]
async fn list_entries_fan_out_per_element() {
    let store: Arc<dyn TableStore> = Arc::new(MemoryStore::new());
    let payload = Payload::new(
        Scope::District,
        Some(571),
        date("2021-06-01"),
        json!({"vaccinationDoneByTime": [
            {"label": "9 AM", "count": 1},
            {"label": "10 AM", "count": 2},
            {"label": "11 AM", "count": 3}
        ]}),
    );
    let summary = loader(store.clone()).load(&reference(), &[payload]).await.unwrap();
    assert_eq!(summary.records_written["raw_session_vaccination_count"], 3);

    let rows = rows(store.as_ref(), "raw_session_vaccination_count").await;
    assert_eq!(rows.len(), 3);
    for row in &rows {
        assert_eq!(row.get("date"), Some(&Cell::Text("2021-06-01".into())));
        assert_eq!(row.get("location_type"), Some(&Cell::Text("district".into())));
        assert_eq!(row.get("location_id"), Some(&Cell::Integer(571)));
    }
}

#[tokio::test]
async fn shape_mismatch_only_loses_that_pairing() {
    for (name, store) in stores().await {
        let payload = Payload::new(
            Scope::National,
            None,
            date("2021-06-01"),
            json!({
                "topBlock": {"sites": {"total": 1, "govt": 1, "pvt": 0, "today": 1}},
                "vaccinationDoneByTime": {"label": "9 AM", "count": 1}
            }),
        );
        let summary = loader(store.clone()).load(&reference(), &[payload]).await.unwrap();

        assert_eq!(summary.failures.len(), 1, "{name}");
        let failure = &summary.failures[0];
        assert_eq!(failure.table, "raw_session_vaccination_count", "{name}");
        assert_eq!(failure.path, "vaccinationDoneByTime", "{name}");
        assert_eq!(failure.payload, "national/0@2021-06-01", "{name}");
        assert!(!store.has_table("raw_session_vaccination_count").await.unwrap(), "{name}");
        assert_eq!(rows(store.as_ref(), "raw_vaccination_site_count").await.len(), 1, "{name}");
    }
}

#[tokio::test]
async fn missing_key_column_is_reported_for_the_pairing() {
    let store: Arc<dyn TableStore> = Arc::new(MemoryStore::new());
    let payload = Payload::new(
        Scope::National,
        None,
        date("2021-06-01"),
        json!({"getBeneficiariesGroupBy": [{"state_name": "Tamil Nadu", "total": 5}]}),
    );
    let summary = loader(store.clone()).load(&reference(), &[payload]).await.unwrap();
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].table, "raw_state_level_vaccination_count");
    assert!(summary.failures[0].error.contains("state_id"));
}

#[tokio::test]
async fn district_with_unknown_state_aborts_before_any_payload() {
    let store: Arc<dyn TableStore> = Arc::new(MemoryStore::new());
    let reference = ReferenceData {
        states: vec![State {
            id: 31,
            name: "Tamil Nadu".into(),
        }],
        districts: vec![District {
            district_id: 265,
            district_name: "Bangalore Urban".into(),
            state_id: 16,
        }],
    };
    let err = loader(store.clone())
        .load_snapshot_dir(&reference, &fixtures().join("cowin"))
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("unknown state 16"));
    assert!(store.table_names().await.unwrap().is_empty());
}

#[tokio::test]
async fn malformed_snapshot_files_are_skipped() {
    let dir = tempdir().unwrap();
    let day = dir.path().join("2021-06-01");
    fs::create_dir_all(day.join("states")).unwrap();
    fs::copy(
        fixtures().join("cowin/2021-06-01/national.json"),
        day.join("national.json"),
    )
    .unwrap();
    fs::write(day.join("states/31.json"), "{\"topBlock\": ").unwrap();
    fs::write(day.join("states/README"), "notes").unwrap();

    let store: Arc<dyn TableStore> = Arc::new(MemoryStore::new());
    let summary = loader(store.clone())
        .load_snapshot_dir(&reference(), dir.path())
        .await
        .unwrap();
    assert_eq!(summary.payloads_loaded, 1);
    assert_eq!(summary.skipped.len(), 2);
    assert!(summary.skipped.iter().any(|s| s.path.ends_with("31.json")));
    assert!(summary.failures.is_empty());
}

#[tokio::test]
async fn derived_tables_use_only_the_latest_date_and_rebuild_identically() {
    for (name, store) in stores().await {
        loader(store.clone())
            .load_snapshot_dir(&reference(), &fixtures().join("cowin"))
            .await
            .unwrap();

        let first = rebuild(store.as_ref(), &builtin_families()).await.unwrap();
        let second = rebuild(store.as_ref(), &builtin_families()).await.unwrap();
        assert_eq!(first, second, "{name}");

        let age = rows(store.as_ref(), "final_vaccination_age").await;
        assert_eq!(age.len(), 4, "{name}");
        assert!(
            age.iter()
                .all(|r| r.get("date") == Some(&Cell::Text("2021-06-02".into()))),
            "{name}"
        );
        let young = age
            .iter()
            .find(|r| r.get("metric") == Some(&Cell::Text("vac_18_30".into())))
            .unwrap();
        assert_eq!(young.get("value"), Some(&Cell::Integer(20_000_100)), "{name}");

        let state_age = rows(store.as_ref(), "final_state_vaccination_age").await;
        assert_eq!(state_age.len(), 4, "{name}");
        assert!(
            state_age
                .iter()
                .all(|r| r.get("location_name") == Some(&Cell::Text("Tamil Nadu".into()))),
            "{name}"
        );

        let vaccines = store
            .query("vaccine_data", &RowFilter::all().eq("metric", "covidshield"))
            .await
            .unwrap();
        assert_eq!(vaccines.len(), 1, "{name}");
        assert_eq!(vaccines[0].get("value"), Some(&Cell::Integer(195_000_800)), "{name}");

        let doses = rows(store.as_ref(), "national_dose_data").await;
        assert_eq!(doses.len(), 2, "{name}");

        let trend = rows(store.as_ref(), "national_vaccine_trend").await;
        assert_eq!(trend.len(), 6, "{name}");
    }
}

#[tokio::test]
async fn rebuild_discards_rows_from_older_dates() {
    let store: Arc<dyn TableStore> = Arc::new(MemoryStore::new());
    let loader = loader(store.clone());
    let root = fixtures().join("cowin");
    let family = MetricFamily {
        target_table: "vaccine_latest".into(),
        source_table: "raw_vaccination_count".into(),
        scope: Scope::National,
        dates: DateSelection::Latest,
        metrics: vec![MetricColumn {
            column: "covaxin".into(),
            metric: "covaxin".into(),
        }],
    };

    let first_day = fs::read_to_string(root.join("2021-06-01/national.json")).unwrap();
    let payload = Payload::new(
        Scope::National,
        None,
        date("2021-06-01"),
        serde_json::from_str(&first_day).unwrap(),
    );
    loader.load(&reference(), &[payload]).await.unwrap();
    rebuild(store.as_ref(), std::slice::from_ref(&family)).await.unwrap();
    let before = rows(store.as_ref(), "vaccine_latest").await;
    assert_eq!(before[0].get("date"), Some(&Cell::Text("2021-06-01".into())));

    loader.load_snapshot_dir(&reference(), &root).await.unwrap();
    rebuild(store.as_ref(), std::slice::from_ref(&family)).await.unwrap();
    let after = rows(store.as_ref(), "vaccine_latest").await;
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].get("date"), Some(&Cell::Text("2021-06-02".into())));
}

fn config(reports_dir: &Path) -> LoadConfig {
    let root = fixtures();
    LoadConfig {
        database_url: "memory".into(),
        data_dir: root.join("cowin"),
        states_file: root.join("states.json"),
        districts_file: root.join("districts.json"),
        registry_file: None,
        reports_dir: reports_dir.to_path_buf(),
        fresh_db: false,
    }
}

#[tokio::test]
async fn full_run_writes_reports_and_parquet_snapshots() {
    let dir = tempdir().unwrap();
    let pipeline = Pipeline::open(config(dir.path()), false).await.unwrap();
    let report = pipeline.run(Stage::Run).await.unwrap();

    let load = report.load.as_ref().unwrap();
    assert_eq!(load.payloads_loaded, 6);
    assert_eq!(report.derived.len(), 6);
    assert_eq!(report.row_counts["final_vaccination_age"], 4);

    let run_dir = dir.path().join(report.run_id.to_string());
    let summary: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(run_dir.join("load_summary.json")).unwrap())
            .unwrap();
    assert_eq!(summary["stage"], "run");
    assert_eq!(summary["load"]["payloads_loaded"], 6);

    let brief = fs::read_to_string(run_dir.join("daily_brief.md")).unwrap();
    assert!(brief.contains("final_vaccination_age: 4 rows (2021-06-02)"));

    let manifest: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(run_dir.join("snapshots/manifest.json")).unwrap(),
    )
    .unwrap();
    let files = manifest["files"].as_array().unwrap();
    assert_eq!(files.len(), 6);
    assert!(run_dir.join("snapshots/national_vaccine_trend.parquet").exists());
    assert!(files
        .iter()
        .all(|f| f["sha256"].as_str().map(str::len) == Some(64)));
}

#[tokio::test]
async fn derive_stage_reads_previously_loaded_tables() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("covid-ds.db");
    let mut cfg = config(&dir.path().join("reports"));
    cfg.database_url = format!("sqlite://{}", db.display());

    let loaded = Pipeline::open(cfg.clone(), true).await.unwrap();
    let report = loaded.run(Stage::Load).await.unwrap();
    assert!(report.derived.is_empty());
    assert!(report.parquet_manifest.is_none());
    drop(loaded);

    let derived = Pipeline::open(cfg, false).await.unwrap();
    let report = derived.run(Stage::Derive).await.unwrap();
    assert!(report.load.is_none());
    let trend = report
        .derived
        .iter()
        .find(|d| d.table == "national_vaccine_trend")
        .unwrap();
    assert_eq!(trend.rows, 6);
}

#[tokio::test]
async fn unopenable_store_aborts_before_any_report() {
    let dir = tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    fs::write(&blocker, "not a directory").unwrap();
    let reports = dir.path().join("reports");

    for fresh in [false, true] {
        let mut cfg = config(&reports);
        cfg.database_url = format!("sqlite://{}", blocker.join("covid-ds.db").display());
        let Err(err) = Pipeline::open(cfg.clone(), fresh).await else {
            panic!("store under a regular file opened (fresh = {fresh})");
        };
        let message = format!("{err:#}");
        assert!(
            message.contains(&format!("opening store {}", cfg.database_url)),
            "{message}"
        );
        assert!(!reports.exists());
    }
}
