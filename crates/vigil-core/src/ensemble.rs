//! Ensemble Engine
//!
//! Runs every registered backend against one event and combines the verdicts
//! by strict majority vote. Evaluation holds no mutable state, so a single
//! engine can be shared behind an `Arc` by any number of workers.

use crate::backend::{ScoringBackend, ScoringVerdict, clamp_confidence};
use crate::error::{BackendError, EnsembleError};
use crate::event::Event;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// `model_used` label for majority-vote results.
pub const ENSEMBLE_MODEL: &str = "ensemble";

/// Combined decision for one event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnsembleResult {
    pub event_id: String,
    /// The event's own timestamp; evaluation never reads the clock.
    pub timestamp: DateTime<Utc>,
    pub is_anomaly: bool,
    pub confidence: f64,
    pub score: f64,
    pub threshold: f64,
    pub model_used: String,
    /// In backend registration order.
    pub contributing_verdicts: Vec<ScoringVerdict>,
    /// Backends left out of the vote because they failed on this event.
    #[serde(skip)]
    pub excluded: Vec<BackendError>,
}

impl EnsembleResult {
    /// Votes in favour of anomaly.
    pub fn anomaly_votes(&self) -> usize {
        self.contributing_verdicts.iter().filter(|v| v.is_anomaly).count()
    }
}

#[derive(Default)]
pub struct EnsembleBuilder {
    backends: Vec<Arc<dyn ScoringBackend>>,
}

impl EnsembleBuilder {
    pub fn backend<B: ScoringBackend + 'static>(self, backend: B) -> Self {
        self.shared(Arc::new(backend))
    }

    pub fn shared(mut self, backend: Arc<dyn ScoringBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    /// Fails fast when two backends share a name.
    pub fn build(self) -> Result<EnsembleEngine, EnsembleError> {
        let mut index = HashMap::with_capacity(self.backends.len());
        for (i, backend) in self.backends.iter().enumerate() {
            if index.insert(backend.name().to_string(), i).is_some() {
                return Err(EnsembleError::DuplicateBackend(backend.name().to_string()));
            }
        }
        Ok(EnsembleEngine {
            backends: self.backends,
            index,
        })
    }
}

pub struct EnsembleEngine {
    backends: Vec<Arc<dyn ScoringBackend>>,
    index: HashMap<String, usize>,
}

impl EnsembleEngine {
    pub fn builder() -> EnsembleBuilder {
        EnsembleBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Names in registration order.
    pub fn backend_names(&self) -> impl Iterator<Item = &str> {
        self.backends.iter().map(|b| b.name())
    }

    /// True when at least one backend is trained.
    pub fn is_ready(&self) -> bool {
        self.backends.iter().any(|b| b.is_ready())
    }

    /// Majority vote over every backend that scores the event successfully.
    ///
    /// A failing backend is logged and excluded. An exact tie is *not*
    /// anomalous.
    pub fn evaluate(&self, event: &Event) -> Result<EnsembleResult, EnsembleError> {
        let mut verdicts = Vec::with_capacity(self.backends.len());
        let mut excluded = Vec::new();

        for backend in &self.backends {
            match backend.score(&event.features) {
                Ok(verdict) => verdicts.push(verdict),
                Err(err) => {
                    warn!(event_id = %event.id, backend = backend.name(), error = %err, "Backend excluded from vote");
                    excluded.push(err);
                }
            }
        }

        if verdicts.is_empty() {
            return Err(EnsembleError::NoBackendAvailable {
                event_id: event.id.clone(),
                failures: excluded,
            });
        }

        let n = verdicts.len() as f64;
        let votes = verdicts.iter().filter(|v| v.is_anomaly).count();
        let mean = |f: fn(&ScoringVerdict) -> f64| verdicts.iter().map(f).sum::<f64>() / n;

        Ok(EnsembleResult {
            event_id: event.id.clone(),
            timestamp: event.timestamp,
            is_anomaly: votes * 2 > verdicts.len(),
            confidence: mean(|v| clamp_confidence(v.confidence)),
            score: mean(|v| v.score),
            threshold: mean(|v| v.threshold),
            model_used: ENSEMBLE_MODEL.to_string(),
            contributing_verdicts: verdicts,
            excluded,
        })
    }

    /// Single-backend mode: that backend's verdict, no voting.
    pub fn evaluate_with(&self, event: &Event, backend_name: &str) -> Result<EnsembleResult, EnsembleError> {
        let backend = self
            .index
            .get(backend_name)
            .map(|&i| &self.backends[i])
            .ok_or_else(|| EnsembleError::UnknownBackend(backend_name.to_string()))?;

        let verdict = backend.score(&event.features)?;
        Ok(EnsembleResult {
            event_id: event.id.clone(),
            timestamp: event.timestamp,
            is_anomaly: verdict.is_anomaly,
            confidence: clamp_confidence(verdict.confidence),
            score: verdict.score,
            threshold: verdict.threshold,
            model_used: backend.name().to_string(),
            contributing_verdicts: vec![verdict],
            excluded: Vec::new(),
        })
    }

    /// Scores labelled events with the full ensemble.
    ///
    /// Events no backend can score are counted as `skipped` rather than
    /// predictions.
    pub fn assess<'a, I>(&self, labelled: I) -> PerformanceReport
    where
        I: IntoIterator<Item = (&'a Event, bool)>,
    {
        let mut report = PerformanceReport::default();
        for (event, actual) in labelled {
            match self.evaluate(event) {
                Ok(result) => report.record(result.is_anomaly, actual),
                Err(_) => report.skipped += 1,
            }
        }
        report
    }
}

/// Confusion-matrix summary of [`EnsembleEngine::assess`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub true_positives: u64,
    pub false_positives: u64,
    pub true_negatives: u64,
    pub false_negatives: u64,
    pub skipped: u64,
}

impl PerformanceReport {
    fn record(&mut self, predicted: bool, actual: bool) {
        match (predicted, actual) {
            (true, true) => self.true_positives += 1,
            (true, false) => self.false_positives += 1,
            (false, false) => self.true_negatives += 1,
            (false, true) => self.false_negatives += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.true_positives + self.false_positives + self.true_negatives + self.false_negatives
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.true_positives + self.true_negatives, self.total())
    }

    pub fn precision(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_positives)
    }

    pub fn recall(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_negatives)
    }

    pub fn f1(&self) -> f64 {
        let (p, r) = (self.precision(), self.recall());
        if p + r == 0.0 { 0.0 } else { 2.0 * p * r / (p + r) }
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 { 0.0 } else { num as f64 / den as f64 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use crate::event::FeatureVector;
    use chrono::TimeZone;

    /// Returns a canned verdict, or fails when `fail` is set.
    struct Fixed {
        name: &'static str,
        anomaly: bool,
        confidence: f64,
        score: f64,
        fail: bool,
    }

    impl Fixed {
        fn vote(name: &'static str, anomaly: bool, confidence: f64) -> Self {
            Self {
                name,
                anomaly,
                confidence,
                score: if anomaly { 2.0 } else { 0.5 },
                fail: false,
            }
        }

        fn broken(name: &'static str) -> Self {
            Self {
                fail: true,
                ..Self::vote(name, true, 1.0)
            }
        }
    }

    impl ScoringBackend for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn kind(&self) -> BackendKind {
            BackendKind::Custom
        }

        fn threshold(&self) -> f64 {
            1.0
        }

        fn score(&self, _features: &FeatureVector) -> Result<ScoringVerdict, BackendError> {
            if self.fail {
                return Err(BackendError::Score {
                    backend: self.name.to_string(),
                    reason: "non-finite input".into(),
                });
            }
            Ok(ScoringVerdict::new(
                self.name,
                self.anomaly,
                self.score,
                self.confidence,
                self.threshold(),
            ))
        }
    }

    fn event() -> Event {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Event::new("e-1", ts, FeatureVector::from([("x".to_string(), 1.0)]))
    }

    fn engine(backends: Vec<Fixed>) -> EnsembleEngine {
        backends
            .into_iter()
            .fold(EnsembleEngine::builder(), |b, f| b.backend(f))
            .build()
            .unwrap()
    }

    #[test]
    fn test_strict_majority() {
        let e = engine(vec![
            Fixed::vote("a", true, 0.9),
            Fixed::vote("b", true, 0.7),
            Fixed::vote("c", false, 0.2),
        ]);
        let result = e.evaluate(&event()).unwrap();

        assert!(result.is_anomaly);
        assert_eq!(result.anomaly_votes(), 2);
        assert_eq!(result.model_used, ENSEMBLE_MODEL);
        assert!((result.confidence - 0.6).abs() < 1e-12);
        assert!((result.score - 1.5).abs() < 1e-12);
        assert_eq!(result.threshold, 1.0);
        let order: Vec<_> = result.contributing_verdicts.iter().map(|v| v.backend_name.as_str()).collect();
        assert_eq!(order, ["a", "b", "c"]);
    }

    #[test]
    fn test_exact_tie_is_not_anomalous() {
        let e = engine(vec![
            Fixed::vote("a", true, 0.9),
            Fixed::vote("b", false, 0.1),
            Fixed::vote("c", true, 0.9),
            Fixed::vote("d", false, 0.1),
        ]);
        let result = e.evaluate(&event()).unwrap();
        assert_eq!(result.anomaly_votes(), 2);
        assert!(!result.is_anomaly);

        let pair = engine(vec![Fixed::vote("a", true, 0.9), Fixed::vote("b", false, 0.9)]);
        assert!(!pair.evaluate(&event()).unwrap().is_anomaly);
    }

    #[test]
    fn test_failed_backend_is_excluded() {
        let e = engine(vec![
            Fixed::vote("a", true, 0.8),
            Fixed::broken("b"),
            Fixed::vote("c", false, 0.4),
        ]);
        let result = e.evaluate(&event()).unwrap();

        assert_eq!(result.contributing_verdicts.len(), 2);
        assert_eq!(result.excluded.len(), 1);
        assert_eq!(result.excluded[0].backend(), "b");
        // 1 of 2 is a tie
        assert!(!result.is_anomaly);
        assert!((result.confidence - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_no_backend_available() {
        let e = engine(vec![Fixed::broken("a"), Fixed::broken("b")]);
        match e.evaluate(&event()) {
            Err(EnsembleError::NoBackendAvailable { event_id, failures }) => {
                assert_eq!(event_id, "e-1");
                let names: Vec<_> = failures.iter().map(BackendError::backend).collect();
                assert_eq!(names, ["a", "b"]);
            }
            other => panic!("expected NoBackendAvailable, got {other:?}"),
        }

        let one_left = engine(vec![Fixed::broken("a"), Fixed::vote("b", true, 0.3)]);
        assert!(one_left.evaluate(&event()).unwrap().is_anomaly);
    }

    #[test]
    fn test_evaluate_is_deterministic() {
        let e = engine(vec![Fixed::vote("a", true, 0.8), Fixed::vote("b", false, 0.3)]);
        let ev = event();
        assert_eq!(e.evaluate(&ev).unwrap(), e.evaluate(&ev).unwrap());
        assert_eq!(e.evaluate(&ev).unwrap().timestamp, ev.timestamp);
    }

    #[test]
    fn test_single_backend_mode() {
        let e = engine(vec![Fixed::vote("a", false, 0.2), Fixed::vote("b", true, 0.95)]);

        let result = e.evaluate_with(&event(), "b").unwrap();
        assert!(result.is_anomaly);
        assert_eq!(result.model_used, "b");
        assert_eq!(result.confidence, 0.95);
        assert_eq!(result.contributing_verdicts.len(), 1);

        assert_eq!(
            e.evaluate_with(&event(), "missing"),
            Err(EnsembleError::UnknownBackend("missing".into()))
        );
    }

    #[test]
    fn test_single_backend_failure_propagates() {
        let e = engine(vec![Fixed::broken("a")]);
        assert!(matches!(
            e.evaluate_with(&event(), "a"),
            Err(EnsembleError::Backend(BackendError::Score { .. }))
        ));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let built = EnsembleEngine::builder()
            .backend(Fixed::vote("a", true, 0.5))
            .backend(Fixed::vote("a", false, 0.5))
            .build();
        assert!(matches!(built, Err(EnsembleError::DuplicateBackend(name)) if name == "a"));
    }

    #[test]
    fn test_assess_confusion_matrix() {
        let flagging = engine(vec![Fixed::vote("a", true, 0.9)]);
        let events = [event(), event(), event()];
        let labels = [true, false, true];

        let report = flagging.assess(events.iter().zip(labels));
        assert_eq!(report.true_positives, 2);
        assert_eq!(report.false_positives, 1);
        assert_eq!(report.total(), 3);
        assert!((report.precision() - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(report.recall(), 1.0);
        assert!((report.f1() - 0.8).abs() < 1e-12);

        let empty = PerformanceReport::default();
        assert_eq!(empty.accuracy(), 0.0);
        assert_eq!(empty.f1(), 0.0);
    }
}
