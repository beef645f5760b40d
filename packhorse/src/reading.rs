//! The unit of data that traverses the pipeline.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};

use crate::tags::TagSet;

/// The aggregation semantics of a metric.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum MetricType {
    /// A monotonic delta reset on every snapshot.
    Counter,
    /// A low-volume delta counter made monotonic at the receiver.
    CumulativeCounter,
    /// A point-in-time value.
    Gauge,
}

impl MetricType {
    /// The payload type readings of this metric type are routed to.
    pub const fn payload_type(self) -> PayloadType {
        match self {
            MetricType::Counter => PayloadType::Counter,
            MetricType::CumulativeCounter => PayloadType::CumulativeCounter,
            MetricType::Gauge => PayloadType::Gauge,
        }
    }

    /// The rate classification reported in metadata: `counter` or `gauge`.
    pub const fn rate_name(self) -> &'static str {
        match self {
            MetricType::Counter | MetricType::CumulativeCounter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Routing key for payload buffers and endpoints.
///
/// Every reading maps to exactly one payload type via
/// [`MetricType::payload_type`]; metadata is its own type.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum PayloadType {
    /// Counter readings.
    Counter,
    /// Cumulative counter readings.
    CumulativeCounter,
    /// Gauge readings.
    Gauge,
    /// Metric metadata.
    Metadata,
}

impl PayloadType {
    /// All payload types, in the fixed enumeration order handlers flush in.
    pub const ALL: [PayloadType; 4] = [
        PayloadType::Counter,
        PayloadType::CumulativeCounter,
        PayloadType::Gauge,
        PayloadType::Metadata,
    ];
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadType::Counter => f.write_str("counter"),
            PayloadType::CumulativeCounter => f.write_str("cumulative-counter"),
            PayloadType::Gauge => f.write_str("gauge"),
            PayloadType::Metadata => f.write_str("metadata"),
        }
    }
}

/// One (name, value, tags, timestamp) tuple produced during a snapshot.
///
/// Readings are immutable once constructed; updating produces a new reading
/// with the same identity and a new value/timestamp. The suffixed name is
/// precomputed so that serializers never concatenate on the hot path.
#[derive(Clone, Debug)]
pub struct MetricReading {
    name: Arc<str>,
    name_with_suffix: Arc<str>,
    suffix: Arc<str>,
    metric_type: MetricType,
    value: f64,
    tags: TagSet,
    timestamp: DateTime<Utc>,
}

impl MetricReading {
    /// Creates a reading with no suffix.
    pub fn new(
        name: Arc<str>,
        metric_type: MetricType,
        value: f64,
        tags: TagSet,
        timestamp: DateTime<Utc>,
    ) -> Self {
        MetricReading {
            name_with_suffix: Arc::clone(&name),
            name,
            suffix: Arc::from(""),
            metric_type,
            value,
            tags,
            timestamp,
        }
    }

    /// Creates a reading carrying a suffixed name.
    ///
    /// `name_with_suffix` must be the concatenation of `name` and `suffix`;
    /// callers keep both precomputed per metric so readings only clone
    /// reference-counted strings.
    pub fn with_suffix(
        name: Arc<str>,
        suffix: Arc<str>,
        name_with_suffix: Arc<str>,
        metric_type: MetricType,
        value: f64,
        tags: TagSet,
        timestamp: DateTime<Utc>,
    ) -> Self {
        MetricReading { name, name_with_suffix, suffix, metric_type, value, tags, timestamp }
    }

    /// Returns a new reading with the same identity and a fresh
    /// value/timestamp.
    pub fn with_value(&self, value: f64, timestamp: DateTime<Utc>) -> Self {
        let mut updated = self.clone();
        updated.value = value;
        updated.timestamp = timestamp;
        updated
    }

    /// The base metric name, without suffix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The suffix, or the empty string.
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// The full serialized name: base name plus suffix.
    pub fn name_with_suffix(&self) -> &str {
        &self.name_with_suffix
    }

    /// The metric type that produced this reading.
    pub fn metric_type(&self) -> MetricType {
        self.metric_type
    }

    /// The recorded value.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// The effective tags.
    pub fn tags(&self) -> &TagSet {
        &self.tags
    }

    /// When the reading was taken (or, for event gauges, when the event
    /// occurred).
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}
