// Named pose sequences recorded from the arm and replayed later
//
// Persisted as a JSON object mapping scenario names to pose arrays.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::error::{ArmError, Result};
use super::pose::Pose;

#[derive(Debug, thiserror::Error)]
pub enum ScenarioFileError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScenarioBook {
    scenarios: BTreeMap<String, Vec<Pose>>,
}

impl ScenarioBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `pose` to the named scenario, creating it if needed
    pub fn record(&mut self, name: &str, pose: Pose) {
        let poses = self.scenarios.entry(name.to_string()).or_default();
        poses.push(pose);
        debug!("Recorded pose {} of scenario '{}'", poses.len(), name);
    }

    pub fn get(&self, name: &str) -> Result<&[Pose]> {
        self.scenarios
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| ArmError::UnknownScenario(name.to_string()))
    }

    /// Forgets the named scenario
    pub fn clear(&mut self, name: &str) -> Result<()> {
        self.scenarios
            .remove(name)
            .map(|_| info!("Cleared scenario '{}'", name))
            .ok_or_else(|| ArmError::UnknownScenario(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.scenarios.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }

    pub fn from_json(json: &str) -> std::result::Result<Self, ScenarioFileError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> std::result::Result<String, ScenarioFileError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: impl AsRef<Path>) -> std::result::Result<Self, ScenarioFileError> {
        let path = path.as_ref();
        info!("Loading scenarios from {}", path.display());
        Self::from_json(&fs::read_to_string(path)?)
    }

    /// Like [`ScenarioBook::load`], but a missing file is an empty book
    pub fn load_or_default(path: impl AsRef<Path>) -> std::result::Result<Self, ScenarioFileError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> std::result::Result<(), ScenarioFileError> {
        let path = path.as_ref();
        info!("Saving scenarios to {}", path.display());
        fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
