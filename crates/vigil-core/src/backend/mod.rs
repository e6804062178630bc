//! Scoring backend contract.
//!
//! A backend is trained out of band and is read-only at call time. The
//! ensemble treats any [`BackendError`] as recoverable and simply leaves
//! that backend out of the vote.

mod baseline;

pub use baseline::{Baseline, BoundaryBackend, FeatureStats, ZScoreBackend};

use crate::error::BackendError;
use crate::event::FeatureVector;
use serde::{Deserialize, Serialize};

/// Backend families the pipeline knows how to label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Isolation,
    BoundaryDistance,
    ReconstructionError,
    StatisticalDeviation,
    Custom,
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Isolation => "isolation",
            Self::BoundaryDistance => "boundary_distance",
            Self::ReconstructionError => "reconstruction_error",
            Self::StatisticalDeviation => "statistical_deviation",
            Self::Custom => "custom",
        }
    }
}

/// One backend's opinion about one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringVerdict {
    pub backend_name: String,
    pub is_anomaly: bool,
    pub score: f64,
    /// Always within `[0, 1]` once built through [`ScoringVerdict::new`].
    pub confidence: f64,
    pub threshold: f64,
}

impl ScoringVerdict {
    pub fn new(
        backend_name: impl Into<String>,
        is_anomaly: bool,
        score: f64,
        confidence: f64,
        threshold: f64,
    ) -> Self {
        Self {
            backend_name: backend_name.into(),
            is_anomaly,
            score,
            confidence: clamp_confidence(confidence),
            threshold,
        }
    }
}

/// NaN confidence counts as zero.
pub fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

/// Trained anomaly scorer.
pub trait ScoringBackend: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> BackendKind;

    /// Decision threshold fixed during training.
    fn threshold(&self) -> f64;

    fn is_ready(&self) -> bool {
        true
    }

    /// Fails with [`BackendError::Unready`] before training and with
    /// [`BackendError::Score`] on malformed feature vectors.
    fn score(&self, features: &FeatureVector) -> Result<ScoringVerdict, BackendError>;
}

/// Checks that every expected feature is present and finite.
pub fn require_features<'a, I>(
    backend: &str,
    expected: I,
    features: &FeatureVector,
) -> Result<(), BackendError>
where
    I: IntoIterator<Item = &'a String>,
{
    for name in expected {
        match features.get(name) {
            None => {
                return Err(BackendError::Score {
                    backend: backend.to_string(),
                    reason: format!("missing feature {name:?}"),
                });
            }
            Some(v) if !v.is_finite() => {
                return Err(BackendError::Score {
                    backend: backend.to_string(),
                    reason: format!("feature {name:?} is not finite ({v})"),
                });
            }
            Some(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_confidence_is_clamped() {
        assert_eq!(ScoringVerdict::new("a", true, 3.0, 2.5, 1.0).confidence, 1.0);
        assert_eq!(ScoringVerdict::new("a", false, 0.1, -0.2, 1.0).confidence, 0.0);
        assert_eq!(ScoringVerdict::new("a", false, 0.1, f64::NAN, 1.0).confidence, 0.0);
        assert_eq!(ScoringVerdict::new("a", false, 0.1, 0.4, 1.0).confidence, 0.4);
    }

    #[test]
    fn test_require_features() {
        let expected = vec!["a".to_string(), "b".to_string()];
        let mut features = FeatureVector::new();
        features.insert("a".into(), 1.0);

        let err = require_features("z", &expected, &features).unwrap_err();
        assert!(matches!(err, BackendError::Score { ref reason, .. } if reason.contains("\"b\"")));

        features.insert("b".into(), f64::INFINITY);
        assert!(require_features("z", &expected, &features).is_err());

        features.insert("b".into(), 2.0);
        features.insert("extra".into(), 9.0);
        assert!(require_features("z", &expected, &features).is_ok());
    }
}
