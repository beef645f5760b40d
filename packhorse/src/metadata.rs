//! Descriptive metadata derived from registered metrics.

use crate::{reading::MetricType, tags::TagSet};

/// The kind of fact a metadata entry states about a metric.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum MetadataKind {
    /// Whether the series is a counter or a gauge.
    Rate,
    /// Human-readable description.
    Description,
    /// Unit of measure.
    Unit,
}

impl MetadataKind {
    /// The wire name of this kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            MetadataKind::Rate => "rate",
            MetadataKind::Description => "desc",
            MetadataKind::Unit => "unit",
        }
    }
}

/// One metadata fact: (suffixed metric name, kind, tags, value).
///
/// Metadata is derived deterministically from a metric at registration time
/// and stays constant for the life of the owning source. The originating
/// metric type rides along so handlers can route or drop entries for payload
/// types they do not ship (it is not itself serialized).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Metadata {
    /// Full metric name including any aggregator suffix.
    pub name: String,
    /// What this entry states.
    pub kind: MetadataKind,
    /// The metric's effective tags.
    pub tags: TagSet,
    /// The stated value; for [`MetadataKind::Rate`] one of `counter`/`gauge`.
    pub value: String,
    /// The type of the metric this entry describes.
    pub metric_type: MetricType,
}

impl Metadata {
    /// The deduplication identity: (name, kind, tags).
    pub fn dedupe_key(&self) -> (&str, MetadataKind, &TagSet) {
        (self.name.as_str(), self.kind, &self.tags)
    }
}
