//! Metric instruments: the per-type value storage and aggregation kernels.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{
    batch::ReadingBatch,
    error::QueueFullError,
    metadata::{Metadata, MetadataKind},
    reading::{MetricReading, MetricType},
    tags::TagSet,
};

mod aggregate;
mod counter;
mod gauge;
mod tagged;

pub use aggregate::{AggregateGauge, GaugeAggregator};
pub use counter::{Counter, CumulativeCounter, SnapshotCounter};
pub use gauge::{EventGauge, SamplingGauge, SnapshotGauge};
pub use tagged::TaggedMetrics;

/// One name suffix an instrument can emit readings under.
///
/// Most instruments emit exactly one entry with an empty suffix; aggregate
/// gauges emit one per configured aggregator. The suffixed name is
/// precomputed so readings never concatenate strings on the snapshot path.
#[derive(Clone, Debug)]
pub struct SuffixEntry {
    suffix: Arc<str>,
    name_with_suffix: Arc<str>,
    unit: String,
    description: String,
}

impl SuffixEntry {
    pub(crate) fn new(name: &str, suffix: &str, unit: &str, description: &str) -> Self {
        SuffixEntry {
            suffix: Arc::from(suffix),
            name_with_suffix: Arc::from(format!("{name}{suffix}")),
            unit: unit.to_string(),
            description: description.to_string(),
        }
    }

    /// The suffix itself, possibly empty.
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// The full name readings under this suffix carry.
    pub fn name_with_suffix(&self) -> &str {
        &self.name_with_suffix
    }

    /// Unit of measure for this suffix.
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Description for this suffix.
    pub fn description(&self) -> &str {
        &self.description
    }
}

/// The identity shared by every instrument: name, unit, description, type,
/// effective tags, and the suffixes it can emit.
///
/// Frozen at construction; instruments never rename and tags never change.
#[derive(Clone, Debug)]
pub struct InstrumentInfo {
    name: Arc<str>,
    metric_type: MetricType,
    tags: TagSet,
    suffixes: Vec<SuffixEntry>,
}

impl InstrumentInfo {
    /// Creates an identity with a single, empty suffix.
    pub(crate) fn new(
        name: Arc<str>,
        unit: &str,
        description: &str,
        metric_type: MetricType,
        tags: TagSet,
    ) -> Self {
        let suffixes = vec![SuffixEntry::new(&name, "", unit, description)];
        InstrumentInfo { name, metric_type, tags, suffixes }
    }

    /// Creates an identity with explicit suffixes.
    pub(crate) fn with_suffixes(
        name: Arc<str>,
        metric_type: MetricType,
        tags: TagSet,
        suffixes: Vec<SuffixEntry>,
    ) -> Self {
        InstrumentInfo { name, metric_type, tags, suffixes }
    }

    /// The base metric name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The metric type.
    pub fn metric_type(&self) -> MetricType {
        self.metric_type
    }

    /// The effective (merged) tags.
    pub fn tags(&self) -> &TagSet {
        &self.tags
    }

    /// The suffixes this instrument can emit readings under.
    pub fn suffixes(&self) -> &[SuffixEntry] {
        &self.suffixes
    }

    /// Builds a reading for the suffix at `index`.
    pub(crate) fn reading(
        &self,
        index: usize,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> MetricReading {
        let entry = &self.suffixes[index];
        MetricReading::with_suffix(
            Arc::clone(&self.name),
            Arc::clone(&entry.suffix),
            Arc::clone(&entry.name_with_suffix),
            self.metric_type,
            value,
            self.tags.clone(),
            timestamp,
        )
    }

    /// Derives the metadata entries for every suffix.
    pub(crate) fn metadata(&self) -> Vec<Metadata> {
        let mut entries = Vec::with_capacity(self.suffixes.len() * 3);
        for suffix in &self.suffixes {
            entries.push(Metadata {
                name: suffix.name_with_suffix.to_string(),
                kind: MetadataKind::Rate,
                tags: self.tags.clone(),
                value: self.metric_type.rate_name().to_string(),
                metric_type: self.metric_type,
            });
            if !suffix.description.is_empty() {
                entries.push(Metadata {
                    name: suffix.name_with_suffix.to_string(),
                    kind: MetadataKind::Description,
                    tags: self.tags.clone(),
                    value: suffix.description.clone(),
                    metric_type: self.metric_type,
                });
            }
            if !suffix.unit.is_empty() {
                entries.push(Metadata {
                    name: suffix.name_with_suffix.to_string(),
                    kind: MetadataKind::Unit,
                    tags: self.tags.clone(),
                    value: suffix.unit.clone(),
                    metric_type: self.metric_type,
                });
            }
        }
        entries
    }
}

/// A single metric kernel.
///
/// Implementations store values between snapshots and know how to turn the
/// accumulated state into readings when the collector snapshots them.
pub trait Instrument: Send + Sync {
    /// The instrument's frozen identity.
    fn info(&self) -> &InstrumentInfo;

    /// Writes this instrument's readings for the snapshot at `timestamp`.
    ///
    /// Kernels with reset-on-snapshot semantics (counters, event gauges,
    /// aggregate gauges) adopt and clear their state as part of this call.
    fn write_readings(
        &self,
        batch: &mut dyn ReadingBatch,
        timestamp: DateTime<Utc>,
    ) -> Result<(), QueueFullError>;

    /// The base metric name.
    fn name(&self) -> &str {
        self.info().name()
    }

    /// The metric type.
    fn metric_type(&self) -> MetricType {
        self.info().metric_type()
    }

    /// The effective tags.
    fn tags(&self) -> &TagSet {
        self.info().tags()
    }

    /// The suffixes this instrument can emit readings under.
    fn suffixes(&self) -> &[SuffixEntry] {
        self.info().suffixes()
    }
}

/// Anything a source can register: a single instrument or a tagged factory
/// producing instruments per tag-value tuple.
pub trait ReadingWriter: Send + Sync {
    /// Writes all readings for the snapshot at `timestamp`.
    fn write_readings(
        &self,
        batch: &mut dyn ReadingBatch,
        timestamp: DateTime<Utc>,
    ) -> Result<(), QueueFullError>;

    /// The metadata for every metric this writer manages.
    fn metadata(&self) -> Vec<Metadata>;
}

impl<T: Instrument> ReadingWriter for T {
    fn write_readings(
        &self,
        batch: &mut dyn ReadingBatch,
        timestamp: DateTime<Utc>,
    ) -> Result<(), QueueFullError> {
        Instrument::write_readings(self, batch, timestamp)
    }

    fn metadata(&self) -> Vec<Metadata> {
        self.info().metadata()
    }
}
