//! Reference backends scored against a per-feature baseline.
//!
//! Both compute standardized deviations `z = |x - mean| / std` for every
//! baseline feature. They differ in how the deviations are reduced:
//! [`ZScoreBackend`] takes the maximum, [`BoundaryBackend`] the RMS distance
//! from the baseline centre.

use super::{BackendKind, ScoringBackend, ScoringVerdict, require_features};
use crate::error::BackendError;
use crate::event::FeatureVector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const MIN_STD: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureStats {
    pub mean: f64,
    pub std: f64,
}

/// Per-feature distribution summary produced by offline training.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub features: BTreeMap<String, FeatureStats>,
    /// Threshold for [`ZScoreBackend`].
    #[serde(default = "default_z_threshold")]
    pub z_threshold: f64,
    /// Radius for [`BoundaryBackend`].
    #[serde(default = "default_radius")]
    pub radius: f64,
}

fn default_z_threshold() -> f64 {
    3.0
}

fn default_radius() -> f64 {
    2.0
}

impl Baseline {
    pub fn new() -> Self {
        Self {
            features: BTreeMap::new(),
            z_threshold: default_z_threshold(),
            radius: default_radius(),
        }
    }

    pub fn with_feature(mut self, name: impl Into<String>, mean: f64, std: f64) -> Self {
        self.features.insert(name.into(), FeatureStats { mean, std });
        self
    }

    fn deviations(&self, backend: &str, features: &FeatureVector) -> Result<Vec<f64>, BackendError> {
        if self.features.is_empty() {
            return Err(BackendError::Unready {
                backend: backend.to_string(),
            });
        }
        require_features(backend, self.features.keys(), features)?;

        Ok(self
            .features
            .iter()
            .map(|(name, stats)| {
                let x = features[name];
                (x - stats.mean).abs() / stats.std.abs().max(MIN_STD)
            })
            .collect())
    }
}

fn verdict(name: &str, distance: f64, threshold: f64) -> ScoringVerdict {
    let confidence = if threshold > 0.0 {
        (distance / threshold).min(1.0)
    } else {
        1.0
    };
    ScoringVerdict::new(name, distance > threshold, distance, confidence, threshold)
}

/// Statistical-deviation backend: anomalous when any feature's z-score
/// exceeds the threshold.
pub struct ZScoreBackend {
    name: String,
    baseline: Option<Baseline>,
}

impl ZScoreBackend {
    pub const DEFAULT_NAME: &'static str = "statistical";

    /// A backend with no baseline yet; every call is `Unready`.
    pub fn untrained() -> Self {
        Self {
            name: Self::DEFAULT_NAME.to_string(),
            baseline: None,
        }
    }

    pub fn fitted(baseline: Baseline) -> Self {
        Self {
            name: Self::DEFAULT_NAME.to_string(),
            baseline: Some(baseline),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl ScoringBackend for ZScoreBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::StatisticalDeviation
    }

    fn threshold(&self) -> f64 {
        self.baseline
            .as_ref()
            .map_or_else(default_z_threshold, |b| b.z_threshold)
    }

    fn is_ready(&self) -> bool {
        self.baseline.as_ref().is_some_and(|b| !b.features.is_empty())
    }

    fn score(&self, features: &FeatureVector) -> Result<ScoringVerdict, BackendError> {
        let baseline = self.baseline.as_ref().ok_or_else(|| BackendError::Unready {
            backend: self.name.clone(),
        })?;
        let max_z = baseline
            .deviations(&self.name, features)?
            .into_iter()
            .fold(0.0, f64::max);
        Ok(verdict(&self.name, max_z, baseline.z_threshold))
    }
}

/// Boundary-distance backend: anomalous when the RMS standardized distance
/// from the baseline centre leaves the trained radius.
pub struct BoundaryBackend {
    name: String,
    baseline: Option<Baseline>,
}

impl BoundaryBackend {
    pub const DEFAULT_NAME: &'static str = "boundary";

    pub fn untrained() -> Self {
        Self {
            name: Self::DEFAULT_NAME.to_string(),
            baseline: None,
        }
    }

    pub fn fitted(baseline: Baseline) -> Self {
        Self {
            name: Self::DEFAULT_NAME.to_string(),
            baseline: Some(baseline),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl ScoringBackend for BoundaryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::BoundaryDistance
    }

    fn threshold(&self) -> f64 {
        self.baseline.as_ref().map_or_else(default_radius, |b| b.radius)
    }

    fn is_ready(&self) -> bool {
        self.baseline.as_ref().is_some_and(|b| !b.features.is_empty())
    }

    fn score(&self, features: &FeatureVector) -> Result<ScoringVerdict, BackendError> {
        let baseline = self.baseline.as_ref().ok_or_else(|| BackendError::Unready {
            backend: self.name.clone(),
        })?;
        let z = baseline.deviations(&self.name, features)?;
        let rms = (z.iter().map(|d| d * d).sum::<f64>() / z.len() as f64).sqrt();
        Ok(verdict(&self.name, rms, baseline.radius))
    }
}
