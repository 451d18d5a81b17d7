use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct District {
    pub district_id: i64,
    pub district_name: String,
    pub state_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferenceError {
    #[error("state id {0} is listed more than once")]
    DuplicateState(i64),
    #[error("district id {0} is listed more than once")]
    DuplicateDistrict(i64),
    #[error("district {district_id} refers to unknown state {state_id}")]
    UnknownState { district_id: i64, state_id: i64 },
}

/// Location names used to label loaded and derived rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceData {
    pub states: Vec<State>,
    pub districts: Vec<District>,
}

impl ReferenceData {
    pub fn validate(&self) -> Result<(), ReferenceError> {
        let mut state_ids = BTreeSet::new();
        for state in &self.states {
            if !state_ids.insert(state.id) {
                return Err(ReferenceError::DuplicateState(state.id));
            }
        }
        let mut district_ids = BTreeSet::new();
        for district in &self.districts {
            if !district_ids.insert(district.district_id) {
                return Err(ReferenceError::DuplicateDistrict(district.district_id));
            }
            if !state_ids.contains(&district.state_id) {
                return Err(ReferenceError::UnknownState {
                    district_id: district.district_id,
                    state_id: district.state_id,
                });
            }
        }
        Ok(())
    }

    pub fn state_name(&self, id: i64) -> Option<&str> {
        self.states
            .iter()
            .find(|state| state.id == id)
            .map(|state| state.name.as_str())
    }

    pub fn district_name(&self, id: i64) -> Option<&str> {
        self.districts
            .iter()
            .find(|district| district.district_id == id)
            .map(|district| district.district_name.as_str())
    }
}

pub fn load_reference_data(states_path: &Path, districts_path: &Path) -> Result<ReferenceData> {
    Ok(ReferenceData {
        states: read_json_file(states_path)?,
        districts: read_json_file(districts_path)?,
    })
}

fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading reference file {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("parsing reference file {}", path.display()))
}
