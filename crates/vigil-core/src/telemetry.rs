//! Operational counters exported in Prometheus text format.
//!
//! Held in a registry owned by the pipeline instead of the global default
//! registry, so several pipelines (and tests) can coexist in one process.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

pub struct Telemetry {
    registry: Registry,
    pub ingested: IntCounter,
    pub dropped: IntCounter,
    pub parse_errors: IntCounter,
    pub processed: IntCounter,
    pub anomalies: IntCounter,
    pub processing_errors: IntCounter,
    pub backend_failures: IntCounterVec,
    pub published: IntCounterVec,
    pub publish_retries: IntCounter,
    pub publish_failures: IntCounter,
    pub store_errors: IntCounter,
    pub queue_depth: IntGauge,
    pub batch_size: Histogram,
    pub batch_latency: Histogram,
}

impl Telemetry {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let c = IntCounter::new(name, help)?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };
        let labelled = |name: &str, help: &str, label: &str| -> Result<IntCounterVec, prometheus::Error> {
            let c = IntCounterVec::new(Opts::new(name, help), &[label])?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };

        let ingested = counter("vigil_ingested_total", "Events accepted into the queue")?;
        let dropped = counter("vigil_dropped_total", "Events dropped because the queue was full")?;
        let parse_errors = counter("vigil_parse_errors_total", "Malformed inbound records skipped")?;
        let processed = counter("vigil_processed_total", "Events evaluated by the ensemble")?;
        let anomalies = counter("vigil_anomalies_total", "Events flagged as anomalous")?;
        let processing_errors = counter(
            "vigil_processing_errors_total",
            "Events dropped because no backend could score them",
        )?;
        let backend_failures = labelled(
            "vigil_backend_failures_total",
            "Backend verdicts excluded from the vote",
            "backend",
        )?;
        let published = labelled("vigil_published_total", "Messages acknowledged by the broker", "topic")?;
        let publish_retries = counter("vigil_publish_retries_total", "Publish attempts retried")?;
        let publish_failures = counter(
            "vigil_publish_failures_total",
            "Messages dropped after exhausting retries",
        )?;
        let store_errors = counter("vigil_store_errors_total", "Failed metrics or alert writes")?;

        let queue_depth = IntGauge::new("vigil_queue_depth", "Events waiting in the bounded queue")?;
        registry.register(Box::new(queue_depth.clone()))?;

        let batch_size = Histogram::with_opts(
            HistogramOpts::new("vigil_batch_size", "Events per flushed batch")
                .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0]),
        )?;
        registry.register(Box::new(batch_size.clone()))?;

        let batch_latency = Histogram::with_opts(HistogramOpts::new(
            "vigil_batch_duration_seconds",
            "Time to evaluate and publish one batch",
        ))?;
        registry.register(Box::new(batch_latency.clone()))?;

        Ok(Self {
            registry,
            ingested,
            dropped,
            parse_errors,
            processed,
            anomalies,
            processing_errors,
            backend_failures,
            published,
            publish_retries,
            publish_failures,
            store_errors,
            queue_depth,
            batch_size,
            batch_latency,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
