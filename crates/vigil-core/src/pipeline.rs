//! Lifecycle Controller and batch workers.
//!
//! One ingestor thread feeds the bounded queue; `worker_count` worker threads
//! share the consumer side, each owning its own batch buffer and timer. Stop
//! cancels the ingestor, which closes the queue; workers then flush what is
//! left and exit. Broker connections are closed once both sides are done, or
//! once the drain timeout expires.

use crate::batch::{Batch, BatchAggregator};
use crate::broker::{EventSink, EventSource};
use crate::config::PipelineConfig;
use crate::ensemble::{ENSEMBLE_MODEL, EnsembleEngine};
use crate::error::{EnsembleError, StartupError};
use crate::ingest::Ingestor;
use crate::publish::{AlertRecord, ResultPublisher};
use crate::queue::{QueueConsumer, Recv, event_queue};
use crate::store::{Cache, MetricsSnapshot, MetricsStore};
use crate::telemetry::Telemetry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

struct Worker {
    id: usize,
    consumer: QueueConsumer,
    aggregator: BatchAggregator,
    engine: Arc<EnsembleEngine>,
    model: Option<String>,
    publisher: Arc<ResultPublisher>,
    store: Arc<MetricsStore>,
    telemetry: Arc<Telemetry>,
    poll_interval: Duration,
}

impl Worker {
    fn run(mut self) {
        info!(worker = self.id, "Worker active.");

        loop {
            // Wake no later than the batch timer so a timeout flush fires
            // without a new arrival.
            let wait = self
                .aggregator
                .time_until_due(Instant::now())
                .map_or(self.poll_interval, |due| due.min(self.poll_interval));

            match self.consumer.recv_timeout(wait) {
                Recv::Event(event) => {
                    if let Some(batch) = self.aggregator.push(event, Instant::now()) {
                        self.process(batch);
                    }
                }
                Recv::Idle => {}
                Recv::Closed => break,
            }
            if let Some(batch) = self.aggregator.poll(Instant::now()) {
                self.process(batch);
            }
            self.telemetry.queue_depth.set(self.consumer.len() as i64);
        }

        if let Some(batch) = self.aggregator.drain() {
            self.process(batch);
        }
        info!(worker = self.id, "Worker stopped.");
    }

    /// Evaluates, publishes and records each event independently.
    fn process(&self, batch: Batch) {
        let timer = self.telemetry.batch_latency.start_timer();
        self.telemetry.batch_size.observe(batch.len() as f64);
        let mut anomalies = 0usize;

        for event in &batch.events {
            let outcome = match &self.model {
                Some(model) => self.engine.evaluate_with(event, model),
                None => self.engine.evaluate(event),
            };
            let result = match outcome {
                Ok(result) => result,
                Err(err) => {
                    let failures = match &err {
                        EnsembleError::NoBackendAvailable { failures, .. } => failures.as_slice(),
                        EnsembleError::Backend(failure) => std::slice::from_ref(failure),
                        _ => &[],
                    };
                    for failure in failures {
                        self.telemetry
                            .backend_failures
                            .with_label_values(&[failure.backend()])
                            .inc();
                    }
                    self.telemetry.processing_errors.inc();
                    error!(worker = self.id, event_id = %event.id, error = %err, "Dropping unscorable event");
                    continue;
                }
            };

            for failure in &result.excluded {
                self.telemetry
                    .backend_failures
                    .with_label_values(&[failure.backend()])
                    .inc();
            }
            self.telemetry.processed.inc();

            let alert = self.publisher.publish_outcome(event, &result);
            if let Err(err) = self.store.record(&result) {
                self.telemetry.store_errors.inc();
                warn!(worker = self.id, event_id = %event.id, error = %err, "Failed to update metrics");
            }

            if let Some(alert) = alert {
                anomalies += 1;
                self.telemetry.anomalies.inc();
                warn!(
                    worker = self.id,
                    event_id = %event.id,
                    confidence = result.confidence,
                    severity = ?alert.severity,
                    "ANOMALY"
                );
                if let Err(err) = self.store.store_alert(&alert) {
                    self.telemetry.store_errors.inc();
                    warn!(worker = self.id, event_id = %event.id, error = %err, "Failed to store alert");
                }
            }
        }

        timer.observe_duration();
        info!(
            worker = self.id,
            batch_size = batch.len(),
            trigger = batch.trigger.as_str(),
            anomalies,
            "Batch flushed"
        );
    }
}

/// Whether both loops exited within the drain timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    Complete,
    TimedOut,
}

pub struct Pipeline {
    cancel: CancellationToken,
    ingest: Option<JoinHandle<Box<dyn EventSource>>>,
    workers: Vec<JoinHandle<()>>,
    sink: Arc<dyn EventSink>,
    consumer: QueueConsumer,
    engine: Arc<EnsembleEngine>,
    store: Arc<MetricsStore>,
    telemetry: Arc<Telemetry>,
    running: Arc<AtomicBool>,
    drain_timeout: Duration,
}

impl Pipeline {
    /// Validates everything that can be checked up front, then spawns the
    /// ingestor and the workers.
    pub fn start(
        config: PipelineConfig,
        engine: Arc<EnsembleEngine>,
        source: Box<dyn EventSource>,
        sink: Arc<dyn EventSink>,
        cache: Arc<dyn Cache>,
    ) -> Result<Self, StartupError> {
        config.validate()?;
        if engine.is_empty() {
            return Err(StartupError::NoBackends);
        }
        if let Some(model) = &config.model {
            if !engine.backend_names().any(|name| name == model) {
                return Err(EnsembleError::UnknownBackend(model.clone()).into());
            }
        }
        if !engine.is_ready() {
            warn!("No scoring backend is trained; every event will be dropped.");
        }

        let store = Arc::new(MetricsStore::new(
            cache,
            config.alert_ttl,
            config.recent_alerts_capacity,
        ));
        store.ping()?;

        let telemetry = Arc::new(Telemetry::new()?);
        let (producer, consumer) = event_queue(config.queue_capacity);
        let publisher = Arc::new(ResultPublisher::new(sink.clone(), &config, telemetry.clone()));

        let mut workers = Vec::with_capacity(config.worker_count);
        for id in 0..config.worker_count {
            let worker = Worker {
                id,
                consumer: consumer.clone(),
                aggregator: BatchAggregator::new(config.batch_size, config.batch_timeout),
                engine: engine.clone(),
                model: config.model.clone(),
                publisher: publisher.clone(),
                store: store.clone(),
                telemetry: telemetry.clone(),
                poll_interval: config.poll_interval,
            };
            let handle = thread::Builder::new()
                .name(format!("vigil-worker-{id}"))
                .spawn(move || worker.run())
                .map_err(|source| StartupError::Spawn { name: "worker", source })?;
            workers.push(handle);
        }

        let cancel = CancellationToken::new();
        let ingestor = Ingestor::new(
            source,
            producer,
            telemetry.clone(),
            config.ingest_poll_timeout,
            config.retry_delay,
        );
        let ingest = {
            let cancel = cancel.clone();
            thread::Builder::new()
                .name("vigil-ingest".into())
                .spawn(move || ingestor.run(cancel))
                .map_err(|source| StartupError::Spawn { name: "ingest", source })?
        };

        info!(
            workers = config.worker_count,
            batch_size = config.batch_size,
            batch_timeout_ms = config.batch_timeout.as_millis() as u64,
            queue_capacity = config.queue_capacity,
            backends = engine.len(),
            model = config.model.as_deref().unwrap_or(ENSEMBLE_MODEL),
            "Pipeline started."
        );

        Ok(Self {
            cancel,
            ingest: Some(ingest),
            workers,
            sink,
            consumer,
            engine,
            store,
            telemetry,
            running: Arc::new(AtomicBool::new(true)),
            drain_timeout: config.drain_timeout,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    pub fn engine(&self) -> &Arc<EnsembleEngine> {
        &self.engine
    }

    /// Zeroed counters, never an error, when the cache cannot be read.
    pub fn metrics(&self) -> MetricsSnapshot {
        let mut snapshot = self.store.snapshot().unwrap_or_else(|err| {
            self.telemetry.store_errors.inc();
            warn!(error = %err, "Failed to read metrics");
            MetricsSnapshot::default()
        });
        snapshot.queue_size = self.consumer.len();
        snapshot.is_running = self.is_running();
        snapshot.dropped_messages = self.consumer.dropped();
        snapshot
    }

    /// Newest first; empty when the cache cannot be read.
    pub fn recent_alerts(&self, limit: usize) -> Vec<AlertRecord> {
        self.store.recent_alerts(limit).unwrap_or_else(|err| {
            self.telemetry.store_errors.inc();
            warn!(error = %err, "Failed to read recent alerts");
            Vec::new()
        })
    }

    /// Stops ingestion, waits up to the drain timeout for the workers to
    /// flush, then closes the broker connections.
    pub fn stop(mut self) -> Drain {
        info!("Stopping pipeline... (Waiting for queues to drain)");
        self.cancel.cancel();

        let deadline = Instant::now() + self.drain_timeout;
        let finished = |p: &Self| {
            p.ingest.as_ref().is_none_or(JoinHandle::is_finished)
                && p.workers.iter().all(JoinHandle::is_finished)
        };
        while !finished(&self) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let drain = if finished(&self) {
            Drain::Complete
        } else {
            warn!(
                timeout_ms = self.drain_timeout.as_millis() as u64,
                "Drain timed out, shutting down anyway"
            );
            Drain::TimedOut
        };

        if let Some(handle) = self.ingest.take() {
            if handle.is_finished() {
                match handle.join() {
                    Ok(mut source) => {
                        if let Err(err) = source.close() {
                            warn!(error = %err, "Failed to close event source");
                        }
                    }
                    Err(_) => error!("Ingestor panicked"),
                }
            }
        }
        for handle in self.workers.drain(..) {
            if handle.is_finished() && handle.join().is_err() {
                error!("Worker panicked");
            }
        }
        if let Err(err) = self.sink.close() {
            warn!(error = %err, "Failed to close event sink");
        }

        self.running.store(false, Ordering::Release);
        info!(?drain, "Pipeline stopped.");
        drain
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
