//! The registry that owns instruments and drives their serialization.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering::Relaxed},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use crate::{
    batch::ReadingBatch,
    error::{CreateError, QueueFullError},
    instrument::{
        AggregateGauge, Counter, CumulativeCounter, EventGauge, GaugeAggregator, Instrument,
        InstrumentInfo, ReadingWriter, SamplingGauge, SnapshotCounter, SnapshotGauge,
        TaggedMetrics,
    },
    metadata::Metadata,
    reading::MetricType,
    tags::TagSet,
    validation::{apply_transform, is_valid_metric_name, is_valid_tag_name, StringTransform},
};

/// Configuration for a [`MetricSource`].
#[derive(Clone, Default)]
pub struct SourceOptions {
    default_tags: Vec<(String, String)>,
    metric_name_transform: Option<StringTransform>,
    tag_name_transform: Option<StringTransform>,
    tag_value_transform: Option<StringTransform>,
}

impl SourceOptions {
    /// Adds a tag merged into every metric this source creates.
    ///
    /// Metric-local tags win when the same name appears in both places.
    #[must_use]
    pub fn with_default_tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_tags.push((name.into(), value.into()));
        self
    }

    /// Sets a transform applied to every metric name before validation.
    #[must_use]
    pub fn with_metric_name_transform(mut self, transform: StringTransform) -> Self {
        self.metric_name_transform = Some(transform);
        self
    }

    /// Sets a transform applied to every tag name before validation.
    #[must_use]
    pub fn with_tag_name_transform(mut self, transform: StringTransform) -> Self {
        self.tag_name_transform = Some(transform);
        self
    }

    /// Sets a transform applied to every tag value before validation.
    #[must_use]
    pub fn with_tag_value_transform(mut self, transform: StringTransform) -> Self {
        self.tag_value_transform = Some(transform);
        self
    }
}

/// Source options after the default tags have been transformed and validated.
///
/// Shared with tagged factories so that kernels created after registration
/// see the same defaults and transforms as kernels created up front.
pub(crate) struct CanonicalOptions {
    pub default_tags: Vec<(String, String)>,
    pub metric_name_transform: Option<StringTransform>,
    pub tag_name_transform: Option<StringTransform>,
    pub tag_value_transform: Option<StringTransform>,
}

/// A registry of instruments with a snapshot-write operation.
///
/// Sources are the construction surface for all instruments: every factory
/// method validates names and tags, merges the source's default tags, and
/// enforces that (name, tags) is unique across everything registered here.
/// The collector asks each source to write all of its instruments into a
/// batch at every snapshot.
pub struct MetricSource {
    options: Arc<CanonicalOptions>,
    writers: RwLock<Vec<Arc<dyn ReadingWriter>>>,
    registered: Arc<Mutex<HashSet<(String, TagSet)>>>,
    epoch: Arc<AtomicU64>,
    pre_snapshot: RwLock<Vec<Box<dyn Fn() + Send + Sync>>>,
    attached: AtomicBool,
}

impl MetricSource {
    /// Creates a source, canonicalizing and validating its default tags.
    pub fn new(options: SourceOptions) -> Result<Self, CreateError> {
        let mut default_tags = Vec::with_capacity(options.default_tags.len());
        for (name, value) in &options.default_tags {
            let name = apply_transform(name, options.tag_name_transform.as_ref());
            if !is_valid_tag_name(&name) {
                return Err(CreateError::InvalidTagName { name });
            }
            let value = apply_transform(value, options.tag_value_transform.as_ref());
            if !crate::validation::is_valid_tag_value(&value) {
                return Err(CreateError::InvalidTagValue { name, value });
            }
            default_tags.push((name, value));
        }

        Ok(MetricSource {
            options: Arc::new(CanonicalOptions {
                default_tags,
                metric_name_transform: options.metric_name_transform,
                tag_name_transform: options.tag_name_transform,
                tag_value_transform: options.tag_value_transform,
            }),
            writers: RwLock::new(Vec::new()),
            registered: Arc::new(Mutex::new(HashSet::new())),
            epoch: Arc::new(AtomicU64::new(0)),
            pre_snapshot: RwLock::new(Vec::new()),
            attached: AtomicBool::new(false),
        })
    }

    /// Creates and registers a [`Counter`].
    pub fn counter(
        &self,
        name: &str,
        unit: &str,
        description: &str,
        tags: &[(&str, &str)],
    ) -> Result<Arc<Counter>, CreateError> {
        let (name, tags) = self.identity(name, tags)?;
        let info = InstrumentInfo::new(name, unit, description, MetricType::Counter, tags);
        self.register(Counter::new(info))
    }

    /// Creates and registers a [`CumulativeCounter`].
    pub fn cumulative_counter(
        &self,
        name: &str,
        unit: &str,
        description: &str,
        tags: &[(&str, &str)],
    ) -> Result<Arc<CumulativeCounter>, CreateError> {
        let (name, tags) = self.identity(name, tags)?;
        let info =
            InstrumentInfo::new(name, unit, description, MetricType::CumulativeCounter, tags);
        self.register(CumulativeCounter::new(info))
    }

    /// Creates and registers a [`SnapshotCounter`] backed by `provider`.
    pub fn snapshot_counter(
        &self,
        name: &str,
        unit: &str,
        description: &str,
        tags: &[(&str, &str)],
        provider: impl Fn() -> Option<i64> + Send + Sync + 'static,
    ) -> Result<Arc<SnapshotCounter>, CreateError> {
        let (name, tags) = self.identity(name, tags)?;
        let info = InstrumentInfo::new(name, unit, description, MetricType::Counter, tags);
        self.register(SnapshotCounter::new(info, Box::new(provider)))
    }

    /// Creates and registers a [`SamplingGauge`].
    pub fn sampling_gauge(
        &self,
        name: &str,
        unit: &str,
        description: &str,
        tags: &[(&str, &str)],
    ) -> Result<Arc<SamplingGauge>, CreateError> {
        let (name, tags) = self.identity(name, tags)?;
        let info = InstrumentInfo::new(name, unit, description, MetricType::Gauge, tags);
        self.register(SamplingGauge::new(info))
    }

    /// Creates and registers an [`EventGauge`].
    pub fn event_gauge(
        &self,
        name: &str,
        unit: &str,
        description: &str,
        tags: &[(&str, &str)],
    ) -> Result<Arc<EventGauge>, CreateError> {
        let (name, tags) = self.identity(name, tags)?;
        let info = InstrumentInfo::new(name, unit, description, MetricType::Gauge, tags);
        self.register(EventGauge::new(info))
    }

    /// Creates and registers a [`SnapshotGauge`] backed by `provider`.
    pub fn snapshot_gauge(
        &self,
        name: &str,
        unit: &str,
        description: &str,
        tags: &[(&str, &str)],
        provider: impl Fn() -> Option<f64> + Send + Sync + 'static,
    ) -> Result<Arc<SnapshotGauge>, CreateError> {
        let (name, tags) = self.identity(name, tags)?;
        let info = InstrumentInfo::new(name, unit, description, MetricType::Gauge, tags);
        self.register(SnapshotGauge::new(info, Box::new(provider)))
    }

    /// Creates and registers an [`AggregateGauge`].
    pub fn aggregate_gauge(
        &self,
        name: &str,
        unit: &str,
        description: &str,
        tags: &[(&str, &str)],
        aggregators: Vec<GaugeAggregator>,
        minimum_events: u64,
    ) -> Result<Arc<AggregateGauge>, CreateError> {
        let (name, tags) = self.identity(name, tags)?;
        self.register(AggregateGauge::new(
            name,
            unit,
            description,
            tags,
            aggregators,
            minimum_events,
        )?)
    }

    /// Creates and registers a tagged [`Counter`] family.
    pub fn tagged_counter(
        &self,
        name: &str,
        unit: &str,
        description: &str,
        tag_keys: &[&str],
    ) -> Result<Arc<TaggedMetrics<Counter>>, CreateError> {
        let unit = unit.to_string();
        let description = description.to_string();
        self.tagged(name, tag_keys, move |name, tags| {
            Ok(Counter::new(InstrumentInfo::new(
                name,
                &unit,
                &description,
                MetricType::Counter,
                tags,
            )))
        })
    }

    /// Creates and registers a tagged [`CumulativeCounter`] family.
    pub fn tagged_cumulative_counter(
        &self,
        name: &str,
        unit: &str,
        description: &str,
        tag_keys: &[&str],
    ) -> Result<Arc<TaggedMetrics<CumulativeCounter>>, CreateError> {
        let unit = unit.to_string();
        let description = description.to_string();
        self.tagged(name, tag_keys, move |name, tags| {
            Ok(CumulativeCounter::new(InstrumentInfo::new(
                name,
                &unit,
                &description,
                MetricType::CumulativeCounter,
                tags,
            )))
        })
    }

    /// Creates and registers a tagged [`SamplingGauge`] family.
    pub fn tagged_sampling_gauge(
        &self,
        name: &str,
        unit: &str,
        description: &str,
        tag_keys: &[&str],
    ) -> Result<Arc<TaggedMetrics<SamplingGauge>>, CreateError> {
        let unit = unit.to_string();
        let description = description.to_string();
        self.tagged(name, tag_keys, move |name, tags| {
            Ok(SamplingGauge::new(InstrumentInfo::new(
                name,
                &unit,
                &description,
                MetricType::Gauge,
                tags,
            )))
        })
    }

    /// Creates and registers a tagged [`AggregateGauge`] family.
    pub fn tagged_aggregate_gauge(
        &self,
        name: &str,
        unit: &str,
        description: &str,
        tag_keys: &[&str],
        aggregators: Vec<GaugeAggregator>,
        minimum_events: u64,
    ) -> Result<Arc<TaggedMetrics<AggregateGauge>>, CreateError> {
        let unit = unit.to_string();
        let description = description.to_string();
        self.tagged(name, tag_keys, move |name, tags| {
            AggregateGauge::new(name, &unit, &description, tags, aggregators.clone(), minimum_events)
        })
    }

    /// Creates and registers a tagged family with an arbitrary kernel
    /// constructor.
    pub(crate) fn tagged<K: Instrument + 'static>(
        &self,
        name: &str,
        tag_keys: &[&str],
        make: impl Fn(Arc<str>, TagSet) -> Result<K, CreateError> + Send + Sync + 'static,
    ) -> Result<Arc<TaggedMetrics<K>>, CreateError> {
        let name = self.canonical_name(name)?;

        let mut canonical_keys = Vec::with_capacity(tag_keys.len());
        for key in tag_keys {
            let key = apply_transform(key, self.options.tag_name_transform.as_ref());
            if !is_valid_tag_name(&key) {
                return Err(CreateError::InvalidTagName { name: key });
            }
            canonical_keys.push(key);
        }

        let factory = Arc::new(TaggedMetrics::new(
            name,
            canonical_keys,
            Arc::clone(&self.options),
            Arc::clone(&self.registered),
            Arc::clone(&self.epoch),
            Box::new(make),
        ));
        self.writers.write().push(Arc::clone(&factory) as Arc<dyn ReadingWriter>);
        self.epoch.fetch_add(1, Relaxed);

        Ok(factory)
    }

    /// Writes every registered instrument's readings into `batch`.
    pub fn write_readings(
        &self,
        batch: &mut dyn ReadingBatch,
        timestamp: DateTime<Utc>,
    ) -> Result<(), QueueFullError> {
        let writers: Vec<_> = self.writers.read().iter().map(Arc::clone).collect();
        for writer in writers {
            writer.write_readings(batch, timestamp)?;
        }
        Ok(())
    }

    /// The metadata for every registered instrument.
    pub fn metadata(&self) -> Vec<Metadata> {
        let writers: Vec<_> = self.writers.read().iter().map(Arc::clone).collect();
        writers.iter().flat_map(|w| w.metadata()).collect()
    }

    /// A counter bumped on every registration.
    ///
    /// The collector compares epochs between snapshots to decide whether
    /// metadata needs to be re-sent.
    pub fn registration_epoch(&self) -> u64 {
        self.epoch.load(Relaxed)
    }

    /// Registers a callback invoked at the start of every snapshot, before
    /// any instrument is serialized.
    ///
    /// Used by push-style adapters that need to fold externally-collected
    /// values into instruments right before they are read.
    pub fn add_pre_snapshot_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.pre_snapshot.write().push(Box::new(callback));
    }

    /// Runs the registered pre-snapshot callbacks.
    ///
    /// The collector invokes this once per snapshot, before any handler's
    /// batch is written.
    pub fn run_pre_snapshot_callbacks(&self) {
        for callback in self.pre_snapshot.read().iter() {
            callback();
        }
    }

    /// Marks the source as attached to a running collector.
    pub fn attach(&self) {
        self.attached.store(true, Relaxed);
    }

    /// Marks the source as detached.
    pub fn detach(&self) {
        self.attached.store(false, Relaxed);
    }

    /// Whether a collector is currently snapshotting this source.
    pub fn is_attached(&self) -> bool {
        self.attached.load(Relaxed)
    }

    fn canonical_name(&self, raw: &str) -> Result<Arc<str>, CreateError> {
        let name = apply_transform(raw, self.options.metric_name_transform.as_ref());
        if !is_valid_metric_name(&name) {
            return Err(CreateError::InvalidName { name });
        }
        Ok(Arc::from(name))
    }

    fn identity(
        &self,
        name: &str,
        tags: &[(&str, &str)],
    ) -> Result<(Arc<str>, TagSet), CreateError> {
        let name = self.canonical_name(name)?;
        let locals: Vec<(String, String)> =
            tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        let tags = TagSet::merge(
            &name,
            &self.options.default_tags,
            &locals,
            self.options.tag_name_transform.as_ref(),
            self.options.tag_value_transform.as_ref(),
        )?;
        Ok((name, tags))
    }

    fn register<K: Instrument + 'static>(&self, kernel: K) -> Result<Arc<K>, CreateError> {
        let key = (kernel.name().to_string(), kernel.tags().clone());
        if !self.registered.lock().insert(key) {
            return Err(CreateError::DuplicateMetric { name: kernel.name().to_string() });
        }

        let kernel = Arc::new(kernel);
        self.writers.write().push(Arc::clone(&kernel) as Arc<dyn ReadingWriter>);
        self.epoch.fetch_add(1, Relaxed);
        Ok(kernel)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering::Relaxed},
        Arc,
    };

    use chrono::{TimeZone, Utc};

    use super::{MetricSource, SourceOptions};
    use crate::{
        batch::CollectingBatch,
        error::CreateError,
        instrument::Instrument,
        metadata::MetadataKind,
        validation::StringTransform,
    };

    #[test]
    fn duplicate_name_and_tags_is_rejected() {
        let source = MetricSource::new(SourceOptions::default()).unwrap();
        source.counter("requests", "req", "", &[("host", "a")]).unwrap();

        let err = source.counter("requests", "req", "", &[("host", "a")]).unwrap_err();
        assert_eq!(err, CreateError::DuplicateMetric { name: "requests".to_string() });

        // Same name with different tags is a different series.
        source.counter("requests", "req", "", &[("host", "b")]).unwrap();
    }

    #[test]
    fn invalid_name_is_rejected() {
        let source = MetricSource::new(SourceOptions::default()).unwrap();
        let err = source.counter("bad name", "req", "", &[("host", "a")]).unwrap_err();
        assert_eq!(err, CreateError::InvalidName { name: "bad name".to_string() });
    }

    #[test]
    fn metric_without_tags_is_rejected() {
        let source = MetricSource::new(SourceOptions::default()).unwrap();
        let err = source.counter("requests", "req", "", &[]).unwrap_err();
        assert_eq!(err, CreateError::EmptyTagSet { name: "requests".to_string() });
    }

    #[test]
    fn default_tags_satisfy_the_tag_requirement() {
        let source =
            MetricSource::new(SourceOptions::default().with_default_tag("host", "web01")).unwrap();
        let counter = source.counter("requests", "req", "", &[]).unwrap();
        assert_eq!(counter.tags().get("host"), Some("web01"));
    }

    #[test]
    fn name_transform_applies_before_validation() {
        let transform: StringTransform = Arc::new(|s: &str| s.replace(' ', "_"));
        let source = MetricSource::new(
            SourceOptions::default()
                .with_default_tag("host", "a")
                .with_metric_name_transform(transform),
        )
        .unwrap();

        let counter = source.counter("request count", "req", "", &[]).unwrap();
        assert_eq!(counter.name(), "request_count");
    }

    #[test]
    fn write_readings_visits_every_writer() {
        let source =
            MetricSource::new(SourceOptions::default().with_default_tag("host", "a")).unwrap();
        let requests = source.counter("requests", "req", "", &[]).unwrap();
        let errors = source.counter("errors", "err", "", &[]).unwrap();
        requests.increment_by(2);
        errors.increment();

        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut batch = CollectingBatch::new();
        source.write_readings(&mut batch, ts).unwrap();

        let mut names: Vec<_> =
            batch.readings().iter().map(|r| r.name().to_string()).collect();
        names.sort();
        assert_eq!(names, vec!["errors", "requests"]);
    }

    #[test]
    fn pre_snapshot_callbacks_run_on_demand() {
        let source =
            MetricSource::new(SourceOptions::default().with_default_tag("host", "a")).unwrap();
        let pumped = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&pumped);
        source.add_pre_snapshot_callback(move || {
            count.fetch_add(1, Relaxed);
        });

        source.run_pre_snapshot_callbacks();
        source.run_pre_snapshot_callbacks();
        assert_eq!(pumped.load(Relaxed), 2);
    }

    #[test]
    fn metadata_spans_all_writers_and_kinds() {
        let source =
            MetricSource::new(SourceOptions::default().with_default_tag("host", "a")).unwrap();
        source.counter("requests", "req", "total requests", &[]).unwrap();
        source.sampling_gauge("temperature", "C", "", &[]).unwrap();

        let metadata = source.metadata();
        // requests: rate + desc + unit; temperature: rate + unit.
        assert_eq!(metadata.len(), 5);

        let rate = metadata
            .iter()
            .find(|m| m.name == "requests" && m.kind == MetadataKind::Rate)
            .unwrap();
        assert_eq!(rate.value, "counter");

        let gauge_rate = metadata
            .iter()
            .find(|m| m.name == "temperature" && m.kind == MetadataKind::Rate)
            .unwrap();
        assert_eq!(gauge_rate.value, "gauge");
    }

    #[test]
    fn registration_epoch_tracks_additions() {
        let source =
            MetricSource::new(SourceOptions::default().with_default_tag("host", "a")).unwrap();
        let before = source.registration_epoch();
        source.counter("requests", "req", "", &[]).unwrap();
        assert!(source.registration_epoch() > before);

        let factory = source.tagged_counter("by_route", "req", "", &["route"]).unwrap();
        let after_factory = source.registration_epoch();
        factory.get_or_add(&["users"]).unwrap();
        assert!(
            source.registration_epoch() > after_factory,
            "materializing a tagged kernel must dirty the metadata epoch"
        );
    }
}
