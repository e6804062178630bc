//! Vigil Core - Streaming Anomaly Pipeline
//!
//! Events flow through five stages:
//!
//! ```text
//! broker -> Ingestor -> bounded queue -> BatchAggregator -> EnsembleEngine
//!        -> ResultPublisher -> (results/alerts topics + MetricsStore)
//! ```
//!
//! [`pipeline::Pipeline`] starts and stops the stages.

pub mod backend;
pub mod batch;
pub mod broker;
pub mod config;
pub mod ensemble;
pub mod error;
pub mod event;
pub mod ingest;
pub mod pipeline;
pub mod publish;
pub mod queue;
pub mod store;
pub mod telemetry;

pub use backend::{Baseline, BoundaryBackend, ScoringBackend, ScoringVerdict, ZScoreBackend};
pub use config::PipelineConfig;
pub use ensemble::{EnsembleEngine, EnsembleResult};
pub use event::Event;
pub use pipeline::{Drain, Pipeline};
pub use publish::{AlertRecord, ResultRecord, Severity};
pub use store::{MetricsSnapshot, MetricsStore};
