//! Scope routing and location column injection.

use crate::registry::{LocationIdSource, MappingEntry};
use crate::{Cell, FlatRecord, Payload, Scope, LOCATION_ID_COLUMN, LOCATION_TYPE_COLUMN};

/// An entry without a declared scope applies to every payload; otherwise scopes must match.
pub fn scope_applies(entry: &MappingEntry, scope: Scope) -> bool {
    entry.scope.map_or(true, |declared| declared == scope)
}

/// Adds `location_type` and `location_id` to each record when the entry asks for them.
///
/// Rows listing children of the payload's location still carry the payload's id unless the
/// entry names a record column as the id source.
pub fn apply_location_columns(
    mut records: Vec<FlatRecord>,
    entry: &MappingEntry,
    payload: &Payload,
) -> Vec<FlatRecord> {
    if !entry.location_columns {
        return records;
    }
    for record in &mut records {
        let location_id = match &entry.location_id_source {
            LocationIdSource::Payload => Cell::Integer(payload.effective_location_id()),
            LocationIdSource::Column(column) => record.get(column).cloned().unwrap_or(Cell::Null),
        };
        record.set(LOCATION_TYPE_COLUMN, payload.scope.as_str());
        record.set(LOCATION_ID_COLUMN, location_id);
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::map_records;
    use crate::registry::Shape;
    use chrono::NaiveDate;
    use serde_json::json;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 6, 1).unwrap()
    }

    fn entry(
        table: &str,
        path: &str,
        shape: Shape,
        scope: Option<Scope>,
        location_columns: bool,
    ) -> MappingEntry {
        MappingEntry {
            target_table: table.to_string(),
            source_path: path.to_string(),
            shape,
            columns: None,
            scope,
            location_columns,
            location_id_source: LocationIdSource::Payload,
            primary_key: vec!["date".to_string()],
        }
    }

    #[test]
    fn undeclared_scope_applies_everywhere() {
        let e = entry("t", "a", Shape::Object, None, true);
        assert!(Scope::ALL.iter().all(|s| scope_applies(&e, *s)));
    }

    #[test]
    fn declared_scope_applies_only_on_exact_match() {
        let e = entry("t", "a", Shape::Object, Some(Scope::State), true);
        assert!(scope_applies(&e, Scope::State));
        assert!(!scope_applies(&e, Scope::National));
        assert!(!scope_applies(&e, Scope::District));
    }

    #[test]
    fn national_site_counts_get_location_zero() {
        let payload = Payload::new(
            Scope::National,
            None,
            date(),
            json!({"topBlock": {"sites": {"total": 100, "govt": 80, "pvt": 20, "today": 5}}}),
        );
        let mut e = entry("vaccination_site_count", "topBlock.sites", Shape::Object, None, true);
        e.columns = Some(vec!["total".into(), "govt".into(), "pvt".into(), "today".into()]);

        let records = apply_location_columns(map_records(&payload, &e).unwrap(), &e, &payload);
        assert_eq!(records.len(), 1);
        assert_eq!(
            serde_json::to_value(&records[0]).unwrap(),
            json!({
                "location_type": "national",
                "location_id": 0,
                "total": 100,
                "govt": 80,
                "pvt": 20,
                "today": 5,
                "date": "2021-06-01"
            })
        );
    }

    #[test]
    fn district_breakdown_in_state_payload_keeps_own_identity() {
        let payload = Payload::new(
            Scope::State,
            Some(31),
            date(),
            json!({"getBeneficiariesGroupBy": [
                {"district_id": 571, "district_name": "X", "total": 10},
                {"district_id": 572, "district_name": "Y", "total": 12}
            ]}),
        );
        let e = entry(
            "district_level_vaccination_count",
            "getBeneficiariesGroupBy",
            Shape::ObjectList,
            Some(Scope::State),
            false,
        );
        let records = apply_location_columns(map_records(&payload, &e).unwrap(), &e, &payload);
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| !r.contains("location_type")));
        assert_eq!(records[0].get("district_id"), Some(&Cell::Integer(571)));

        let mut annotated = e.clone();
        annotated.location_columns = true;
        let records =
            apply_location_columns(map_records(&payload, &annotated).unwrap(), &annotated, &payload);
        for record in &records {
            assert_eq!(record.get("location_type"), Some(&Cell::Text("state".into())));
            assert_eq!(record.get("location_id"), Some(&Cell::Integer(31)));
        }
    }

    #[test]
    fn child_rows_use_parent_id_unless_a_column_is_named() {
        let payload = Payload::new(
            Scope::District,
            Some(571),
            date(),
            json!({"getBeneficiariesGroupBy": [{"session_site_id": 9001, "total": 3}]}),
        );
        let mut e = entry("sites", "getBeneficiariesGroupBy", Shape::ObjectList, None, true);
        let records = apply_location_columns(map_records(&payload, &e).unwrap(), &e, &payload);
        assert_eq!(records[0].get("location_id"), Some(&Cell::Integer(571)));

        e.location_id_source = LocationIdSource::Column("session_site_id".into());
        let records = apply_location_columns(map_records(&payload, &e).unwrap(), &e, &payload);
        assert_eq!(records[0].get("location_id"), Some(&Cell::Integer(9001)));
        assert_eq!(records[0].get("location_type"), Some(&Cell::Text("district".into())));
    }
}
