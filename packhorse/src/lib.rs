//! Process-embedded metrics collection with buffered, size-bounded payload
//! shipping.
//!
//! `packhorse` lets application code declare strongly-typed counters and
//! gauges, accumulates their values in atomic or lock-minimal kernels,
//! periodically snapshots them into a compact wire representation, packs the
//! serialized bytes into size-bounded payloads per payload type, and ships
//! those payloads to one or more backends with retry and backpressure.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use packhorse::{CollectorBuilder, GaugeAggregator, MetricSource, SourceOptions};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // A source owns instruments and merges its default tags into each one.
//! let source = Arc::new(MetricSource::new(
//!     SourceOptions::default().with_default_tag("host", "web01"),
//! )?);
//!
//! let requests = source.counter("http_requests", "requests", "served requests", &[])?;
//! let latency = source.aggregate_gauge(
//!     "http_latency",
//!     "ms",
//!     "request latency",
//!     &[],
//!     vec![
//!         GaugeAggregator::median(),
//!         GaugeAggregator::percentile(0.95),
//!         GaugeAggregator::max(),
//!         GaugeAggregator::count(),
//!     ],
//!     1,
//! )?;
//!
//! // Hot paths mutate instruments; snapshots and shipping happen in the
//! // background once a collector with one or more handlers is started.
//! requests.increment();
//! latency.record(12.5);
//!
//! let collector = CollectorBuilder::new()
//!     .add_source(source)
//!     // .add_handler(...) one per backend
//!     .on_error(|error| eprintln!("metrics pipeline: {error}"))
//!     .build()?;
//! collector.start();
//! # Ok(())
//! # }
//! ```
//!
//! # Pipeline
//!
//! Application threads mutate instrument kernels. On every snapshot tick the
//! collector asks each [`MetricSource`] to write all of its instruments into
//! a batch bound to each handler; the handler serializes each reading into a
//! per-payload-type buffer, recording payload split offsets as the bytes
//! cross the configured payload size. On every flush tick the buffered
//! payloads are detached and shipped, with per-payload-type retry and an
//! item-count ceiling that pushes back on snapshots when an endpoint falls
//! behind.
//!
//! Concrete shipping backends live in companion crates; this crate provides
//! the instruments, sources, collector, and the buffered handler engine
//! backends plug into via [`handler::HandlerBackend`].

mod batch;
mod collector;
mod diagnostics;
mod error;
pub mod handler;
mod instrument;
mod metadata;
mod reading;
mod source;
mod tags;
pub mod validation;

pub use batch::{CollectingBatch, ReadingBatch};
pub use collector::{
    AfterSerializationFn, BeforeSerializationFn, CollectorBuilder, MetricsCollector,
    SerializationInfo,
};
pub use diagnostics::{DiagnosticsCollector, EventSourceSpec};
pub use error::{
    BuildError, CreateError, PipelineError, QueueFullError, SerializeError, TransportError,
};
pub use handler::{AfterSendFn, AfterSendInfo, ErrorHandler, FlushOptions, MetricHandler};
pub use instrument::{
    AggregateGauge, Counter, CumulativeCounter, EventGauge, GaugeAggregator, Instrument,
    InstrumentInfo, SamplingGauge, SnapshotCounter, SnapshotGauge, SuffixEntry, TaggedMetrics,
};
pub use metadata::{Metadata, MetadataKind};
pub use reading::{MetricReading, MetricType, PayloadType};
pub use source::{MetricSource, SourceOptions};
pub use tags::TagSet;
