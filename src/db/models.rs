use serde::Serialize;
use thiserror::Error;

/// A feature value outside its domain.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeatureError {
    #[error("duration must be finite and >= 0, got {0}")]
    Duration(f64),
    #[error("bpm must be finite and > 0, got {0}")]
    Bpm(f64),
    #[error("energy must be within [0, 1], got {0}")]
    Energy(f64),
}

/// The three acoustic features written for a track once analysis succeeds.
///
/// They are always stored together; a track either has all three or none.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Features {
    /// Seconds.
    pub duration: f64,
    /// Estimated dominant tempo.
    pub bpm: f64,
    /// Mean/peak ratio of the RMS envelope, in [0, 1].
    pub energy: f64,
}

impl Features {
    /// Build a feature record, rejecting values outside their domain.
    pub fn new(duration: f64, bpm: f64, energy: f64) -> Result<Self, FeatureError> {
        let features = Self { duration, bpm, energy };
        features.validate()?;
        Ok(features)
    }

    pub fn validate(&self) -> Result<(), FeatureError> {
        if !self.duration.is_finite() || self.duration < 0.0 {
            return Err(FeatureError::Duration(self.duration));
        }
        if !self.bpm.is_finite() || self.bpm <= 0.0 {
            return Err(FeatureError::Bpm(self.bpm));
        }
        if !self.energy.is_finite() || !(0.0..=1.0).contains(&self.energy) {
            return Err(FeatureError::Energy(self.energy));
        }
        Ok(())
    }
}

/// Data for inserting a freshly imported track.
pub struct NewTrack {
    pub storage_key: String,
    pub original_name: String,
    pub mime: Option<String>,
}

/// A track row read from the database.
///
/// `features` is `Some` exactly when the track has been analyzed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Track {
    pub id: i64,
    pub storage_key: String,
    pub original_name: String,
    pub mime: Option<String>,
    pub deleted: bool,
    #[serde(flatten)]
    pub features: Option<Features>,
}

impl Track {
    pub fn is_analyzed(&self) -> bool {
        self.features.is_some()
    }

    pub fn bpm(&self) -> Option<f64> {
        self.features.map(|f| f.bpm)
    }

    pub fn energy(&self) -> Option<f64> {
        self.features.map(|f| f.energy)
    }

    pub fn duration(&self) -> Option<f64> {
        self.features.map(|f| f.duration)
    }
}

/// Library statistics.
#[derive(Debug, Default)]
pub struct LibraryStats {
    pub total_tracks: i64,
    pub analyzed_tracks: i64,
    pub deleted_tracks: i64,
    pub mean_bpm: Option<f64>,
    pub mean_energy: Option<f64>,
    pub total_duration_secs: f64,
}
