use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.8;
pub const DEFAULT_CONFIDENCE_FLOOR: f32 = 0.95;
pub const DEFAULT_MIN_FACE_FRACTION: f32 = 0.2;

/// Engine-wide tunables. Fixed for the lifetime of a service, never per request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Cosine similarity a match must strictly exceed.
    pub similarity_threshold: f32,
    /// Detector confidence a box must strictly exceed to be considered at all.
    pub confidence_floor: f32,
    /// Minimum face height (and width) as a fraction of the frame's.
    pub min_face_fraction: f32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            confidence_floor: DEFAULT_CONFIDENCE_FLOOR,
            min_face_fraction: DEFAULT_MIN_FACE_FRACTION,
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum SettingsError {
    #[error("similarity threshold {0} outside [-1, 1]")]
    Threshold(f32),
    #[error("confidence floor {0} outside [0, 1]")]
    ConfidenceFloor(f32),
    #[error("minimum face fraction {0} outside [0, 1]")]
    FaceFraction(f32),
}

impl EngineSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            return Err(SettingsError::Threshold(self.similarity_threshold));
        }
        if !(0.0..=1.0).contains(&self.confidence_floor) {
            return Err(SettingsError::ConfidenceFloor(self.confidence_floor));
        }
        if !(0.0..=1.0).contains(&self.min_face_fraction) {
            return Err(SettingsError::FaceFraction(self.min_face_fraction));
        }
        Ok(())
    }
}
