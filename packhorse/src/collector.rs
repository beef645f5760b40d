//! The collector that owns sources and handlers and drives the pipeline.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::{
    sync::{watch, Notify},
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, error, info};

use crate::{
    error::BuildError,
    handler::{AfterSendFn, ErrorHandler, FlushOptions, MetricHandler},
    metadata::{Metadata, MetadataKind},
    source::MetricSource,
    tags::TagSet,
};

/// Statistics for one completed snapshot.
#[derive(Clone, Debug)]
pub struct SerializationInfo {
    /// Readings serialized across all handlers.
    pub count: u64,
    /// Serialized bytes across all handlers.
    pub bytes_written: u64,
    /// How long the snapshot took.
    pub duration: Duration,
    /// The snapshot's timestamp.
    pub started_at: DateTime<Utc>,
}

/// Hook invoked before every snapshot.
pub type BeforeSerializationFn = Arc<dyn Fn() + Send + Sync>;

/// Hook invoked after every snapshot.
pub type AfterSerializationFn = Arc<dyn Fn(&SerializationInfo) + Send + Sync>;

/// Builder for a [`MetricsCollector`].
pub struct CollectorBuilder {
    sources: Vec<Arc<MetricSource>>,
    handlers: Vec<Arc<dyn MetricHandler>>,
    snapshot_interval: Duration,
    flush_interval: Duration,
    metadata_interval: Duration,
    max_retries: u32,
    retry_delay: Duration,
    before_serialization: Option<BeforeSerializationFn>,
    after_serialization: Option<AfterSerializationFn>,
    after_send: Option<AfterSendFn>,
    on_error: Option<ErrorHandler>,
}

impl Default for CollectorBuilder {
    fn default() -> Self {
        CollectorBuilder {
            sources: Vec::new(),
            handlers: Vec::new(),
            snapshot_interval: Duration::from_secs(30),
            flush_interval: Duration::from_secs(10),
            metadata_interval: Duration::from_secs(24 * 60 * 60),
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            before_serialization: None,
            after_serialization: None,
            after_send: None,
            on_error: None,
        }
    }
}

impl CollectorBuilder {
    /// Creates a builder with default intervals.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a metric source to snapshot.
    #[must_use]
    pub fn add_source(mut self, source: Arc<MetricSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Adds a handler to ship readings through.
    #[must_use]
    pub fn add_handler(mut self, handler: Arc<dyn MetricHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Sets the snapshot cadence. Defaults to 30 seconds.
    #[must_use]
    pub fn snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = interval;
        self
    }

    /// Sets the flush cadence. Defaults to 10 seconds.
    #[must_use]
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Sets how often metadata is re-sent even without registrations.
    /// Defaults to 24 hours.
    #[must_use]
    pub fn metadata_interval(mut self, interval: Duration) -> Self {
        self.metadata_interval = interval;
        self
    }

    /// Sets the per-payload-type retry cap. Defaults to 3.
    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the sleep between retries. Defaults to 5 seconds.
    #[must_use]
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Installs a hook invoked synchronously before every snapshot.
    #[must_use]
    pub fn before_serialization(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.before_serialization = Some(Arc::new(hook));
        self
    }

    /// Installs a hook invoked synchronously after every snapshot.
    #[must_use]
    pub fn after_serialization(
        mut self,
        hook: impl Fn(&SerializationInfo) + Send + Sync + 'static,
    ) -> Self {
        self.after_serialization = Some(Arc::new(hook));
        self
    }

    /// Installs a hook invoked after every payload send attempt.
    #[must_use]
    pub fn after_send(
        mut self,
        hook: impl Fn(&crate::handler::AfterSendInfo) + Send + Sync + 'static,
    ) -> Self {
        self.after_send = Some(Arc::new(hook));
        self
    }

    /// Installs the receiver for every background error.
    ///
    /// Required: background tasks have no other way to report failures.
    #[must_use]
    pub fn on_error(
        mut self,
        handler: impl Fn(&crate::error::PipelineError) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(handler));
        self
    }

    /// Builds the collector.
    pub fn build(self) -> Result<MetricsCollector, BuildError> {
        let on_error = self.on_error.ok_or(BuildError::MissingErrorHandler)?;
        if self.snapshot_interval.is_zero() {
            return Err(BuildError::InvalidConfiguration {
                reason: "snapshot interval must be non-zero".to_string(),
            });
        }
        if self.flush_interval.is_zero() {
            return Err(BuildError::InvalidConfiguration {
                reason: "flush interval must be non-zero".to_string(),
            });
        }

        let (shutdown, _) = watch::channel(false);
        Ok(MetricsCollector {
            inner: Arc::new(CollectorInner {
                sources: self.sources,
                handlers: self.handlers,
                snapshot_interval: self.snapshot_interval,
                flush_interval: self.flush_interval,
                metadata_interval: self.metadata_interval,
                max_retries: self.max_retries,
                retry_delay: self.retry_delay,
                before_serialization: self.before_serialization,
                after_serialization: self.after_serialization,
                after_send: self.after_send,
                on_error,
                flush_now: Notify::new(),
                metadata_epoch: AtomicU64::new(u64::MAX),
                metadata_sent_at: Mutex::new(None),
            }),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }
}

struct CollectorInner {
    sources: Vec<Arc<MetricSource>>,
    handlers: Vec<Arc<dyn MetricHandler>>,
    snapshot_interval: Duration,
    flush_interval: Duration,
    metadata_interval: Duration,
    max_retries: u32,
    retry_delay: Duration,
    before_serialization: Option<BeforeSerializationFn>,
    after_serialization: Option<AfterSerializationFn>,
    after_send: Option<AfterSendFn>,
    on_error: ErrorHandler,
    flush_now: Notify,
    metadata_epoch: AtomicU64,
    metadata_sent_at: Mutex<Option<Instant>>,
}

impl CollectorInner {
    fn flush_options(&self) -> FlushOptions {
        FlushOptions {
            retry_delay: self.retry_delay,
            max_retries: self.max_retries,
            send_timeout: Some(self.flush_interval),
            after_send: self.after_send.clone(),
            on_error: Some(Arc::clone(&self.on_error)),
        }
    }

    /// Serializes every source into every handler.
    fn snapshot(&self) {
        if let Some(hook) = &self.before_serialization {
            hook();
        }

        for source in &self.sources {
            source.run_pre_snapshot_callbacks();
        }

        let started_at = Utc::now();
        let started = Instant::now();

        self.maybe_serialize_metadata();

        let mut count = 0u64;
        let mut bytes_written = 0u64;
        for handler in &self.handlers {
            let mut batch = handler.begin_batch();
            for source in &self.sources {
                if let Err(queue_full) = source.write_readings(batch.as_mut(), started_at) {
                    debug!(
                        payload_type = %queue_full.payload_type,
                        "Handler buffer full; abandoning snapshot for this handler."
                    );
                    (self.on_error)(&queue_full.into());
                    self.flush_now.notify_one();
                    break;
                }
            }
            count += batch.metrics_written();
            bytes_written += batch.bytes_written();
            drop(batch);

            for dropped in handler.take_serialization_errors() {
                (self.on_error)(&dropped.into());
            }
        }

        if let Some(hook) = &self.after_serialization {
            hook(&SerializationInfo {
                count,
                bytes_written,
                duration: started.elapsed(),
                started_at,
            });
        }
    }

    /// Serializes metadata when a metric was registered since the last pass
    /// or the periodic re-send is due.
    fn maybe_serialize_metadata(&self) {
        let epoch: u64 = self.sources.iter().map(|s| s.registration_epoch()).sum();
        let due = {
            let sent_at = self.metadata_sent_at.lock();
            match *sent_at {
                Some(at) => at.elapsed() >= self.metadata_interval,
                None => true,
            }
        };

        if !due && self.metadata_epoch.load(Relaxed) == epoch {
            return;
        }

        let metadata = self.gather_metadata();
        if metadata.is_empty() {
            return;
        }

        debug!(entries = metadata.len(), "Serializing metric metadata.");
        for handler in &self.handlers {
            handler.serialize_metadata(&metadata);
        }

        self.metadata_epoch.store(epoch, Relaxed);
        *self.metadata_sent_at.lock() = Some(Instant::now());
    }

    /// Gathers metadata from all sources, deduplicated by (name, kind, tags).
    fn gather_metadata(&self) -> Vec<Metadata> {
        let mut seen: HashSet<(String, MetadataKind, TagSet)> = HashSet::new();
        let mut gathered = Vec::new();
        for source in &self.sources {
            for entry in source.metadata() {
                let key = (entry.name.clone(), entry.kind, entry.tags.clone());
                if seen.insert(key) {
                    gathered.push(entry);
                }
            }
        }
        gathered
    }

    async fn flush_all(&self) {
        let options = self.flush_options();
        let mut set = JoinSet::new();
        for handler in &self.handlers {
            let handler = Arc::clone(handler);
            let options = options.clone();
            set.spawn(async move {
                handler.flush(&options).await;
            });
        }
        while let Some(result) = set.join_next().await {
            if let Err(join_error) = result {
                error!(error = %join_error, "Flush task panicked.");
            }
        }
    }
}

/// Owns sources and handlers, periodically snapshotting the former into the
/// latter and flushing the buffered payloads to their endpoints.
///
/// Two background tasks cooperate: the snapshot task serializes all
/// registered metrics every `snapshot_interval` (and re-serializes metadata
/// when registrations changed or the 24-hour re-send is due); the flush task
/// drains every handler every `flush_interval`, or immediately when a
/// snapshot hits a full buffer. All background failures are funneled to the
/// error handler supplied at construction; none propagate to application
/// threads.
pub struct MetricsCollector {
    inner: Arc<CollectorInner>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MetricsCollector {
    /// Starts a builder.
    pub fn builder() -> CollectorBuilder {
        CollectorBuilder::new()
    }

    /// Attaches sources and spawns the snapshot and flush tasks.
    ///
    /// Must be called from within a tokio runtime. Calling `start` more than
    /// once has no effect.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        for source in &self.inner.sources {
            source.attach();
        }

        info!(
            sources = self.inner.sources.len(),
            handlers = self.inner.handlers.len(),
            "Starting metrics collector."
        );

        let snapshot_inner = Arc::clone(&self.inner);
        let mut snapshot_shutdown = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(snapshot_inner.snapshot_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => snapshot_inner.snapshot(),
                    _ = snapshot_shutdown.changed() => break,
                }
            }
        }));

        let flush_inner = Arc::clone(&self.inner);
        let mut flush_shutdown = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_inner.flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => flush_inner.flush_all().await,
                    _ = flush_inner.flush_now.notified() => flush_inner.flush_all().await,
                    _ = flush_shutdown.changed() => break,
                }
            }
        }));
    }

    /// Stops the background tasks, takes a final snapshot (readings plus any
    /// pending metadata), flushes every handler, and detaches sources.
    pub async fn stop(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        if tasks.is_empty() {
            return;
        }

        info!("Stopping metrics collector.");
        let _ = self.shutdown.send(true);
        for task in tasks {
            if let Err(join_error) = task.await {
                error!(error = %join_error, "Background task panicked.");
            }
        }

        self.inner.snapshot();
        self.inner.flush_all().await;

        for source in &self.inner.sources {
            source.detach();
        }
    }

    /// Runs one snapshot immediately, outside the periodic schedule.
    pub fn snapshot_now(&self) {
        self.inner.snapshot();
    }

    /// Runs one flush immediately, outside the periodic schedule.
    pub async fn flush_now(&self) {
        self.inner.flush_all().await;
    }
}
