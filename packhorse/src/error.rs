use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::reading::PayloadType;

/// Errors raised while constructing a metric.
///
/// All of these indicate a configuration problem at the call site creating the
/// metric, and none of them are recoverable by retrying: the caller either
/// fixes the name/tags/aggregator set, or the metric cannot exist.
#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum CreateError {
    /// The metric name is empty or contains a character outside `[A-Za-z0-9._/-]`.
    #[error("invalid metric name {name:?}")]
    InvalidName {
        /// The offending name, after any configured transform was applied.
        name: String,
    },

    /// A tag name is empty or contains a character outside `[A-Za-z0-9._/-]`.
    #[error("invalid tag name {name:?}")]
    InvalidTagName {
        /// The offending tag name, after any configured transform was applied.
        name: String,
    },

    /// A tag value is empty or contains a character outside `[A-Za-z0-9._/-]`.
    #[error("invalid value {value:?} for tag {name:?}")]
    InvalidTagValue {
        /// The tag the value was supplied for.
        name: String,
        /// The offending value, after any configured transform was applied.
        value: String,
    },

    /// The metric would have no tags after merging the source's default tags.
    #[error("metric {name:?} has no tags after merging defaults")]
    EmptyTagSet {
        /// The metric being constructed.
        name: String,
    },

    /// Another metric with the same name and tag set is already registered.
    #[error("metric {name:?} is already registered with the same tags")]
    DuplicateMetric {
        /// The metric being constructed.
        name: String,
    },

    /// Two aggregators on the same gauge produce the same suffix.
    #[error("duplicate aggregator suffix {suffix:?} on {name:?}")]
    DuplicateSuffix {
        /// The gauge being constructed.
        name: String,
        /// The colliding suffix.
        suffix: String,
    },

    /// An aggregator suffix contains a character outside `[A-Za-z0-9._/-]`.
    #[error("invalid aggregator suffix {suffix:?} on {name:?}")]
    InvalidSuffix {
        /// The gauge being constructed.
        name: String,
        /// The offending suffix.
        suffix: String,
    },

    /// An aggregate gauge was configured with no aggregators at all.
    #[error("aggregate gauge {name:?} has no aggregators")]
    NoAggregators {
        /// The gauge being constructed.
        name: String,
    },

    /// A tagged factory was invoked with the wrong number of tag values.
    #[error("metric {name:?} takes {expected} tag values, got {actual}")]
    TagValueCount {
        /// The factory's metric name.
        name: String,
        /// Number of tag keys the factory was declared with.
        expected: usize,
        /// Number of values supplied.
        actual: usize,
    },
}

/// A payload buffer refused a write because its item ceiling was reached.
///
/// Raised at serialization time when the number of buffered items for a
/// payload type has already hit `max_payload_count`. The collector reacts by
/// abandoning the rest of the current snapshot for the affected handler and
/// requesting an immediate flush.
#[derive(Debug, Clone, Error, Eq, PartialEq)]
#[error("payload buffer for {payload_type} is full ({count} items buffered)")]
pub struct QueueFullError {
    /// The payload type whose buffer is full.
    pub payload_type: PayloadType,
    /// Number of items currently buffered.
    pub count: usize,
}

/// A reading could not be serialized.
///
/// These are fatal for the offending reading only: the reading is dropped and
/// the error is surfaced through the collector's error handler, while the
/// rest of the snapshot proceeds.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SerializeError {
    /// The serialized reading is larger than a single payload.
    #[error("reading for {name:?} does not fit in one {payload_type} payload")]
    Oversized {
        /// Name of the metric whose reading was dropped.
        name: String,
        /// The payload type it was routed to.
        payload_type: PayloadType,
    },

    /// The reading's timestamp falls outside the range the endpoint accepts.
    #[error("timestamp {timestamp} for {name:?} is outside the accepted range")]
    TimestampOutOfRange {
        /// Name of the metric whose reading was dropped.
        name: String,
        /// The rejected timestamp.
        timestamp: DateTime<Utc>,
    },

    /// The reading's value is NaN or infinite and cannot be represented on
    /// the wire.
    #[error("non-finite value for {name:?}")]
    NonFiniteValue {
        /// Name of the metric whose reading was dropped.
        name: String,
    },
}

/// A payload could not be delivered to a remote endpoint.
///
/// Transport errors are retried up to the configured retry cap; once retries
/// are exhausted the error is surfaced through the collector's error handler.
/// Low-level socket and HTTP failures are converted into this type at the
/// handler boundary so that callers never see transport-library error types.
#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum TransportError {
    /// The endpoint answered with a non-success status.
    #[error("endpoint returned HTTP {status}: {body}")]
    Http {
        /// The response status code.
        status: u16,
        /// Best-effort capture of the response body.
        body: String,
    },

    /// A socket-level failure during send.
    #[error("i/o failure during send: {message}")]
    Io {
        /// The error kind reported by the operating system.
        kind: std::io::ErrorKind,
        /// The rendered error.
        message: String,
    },

    /// The request could not be built or dispatched at all.
    #[error("failed to dispatch request: {message}")]
    Request {
        /// The rendered error.
        message: String,
    },

    /// The socket's cached endpoint was invalidated mid-send.
    ///
    /// Known-transient race after an endpoint reconfiguration; the handler
    /// recreates its socket and the send is retried without involving the
    /// user's error handler.
    #[error("socket endpoint changed during send")]
    StaleEndpoint,

    /// The send did not complete within the allowed window and was
    /// abandoned.
    #[error("send abandoned after {after:?}")]
    Timeout {
        /// How long the send was allowed to run.
        after: std::time::Duration,
    },
}

impl TransportError {
    /// Converts an [`std::io::Error`] into a transport error.
    pub fn from_io(err: &std::io::Error) -> Self {
        TransportError::Io { kind: err.kind(), message: err.to_string() }
    }

    /// Whether this error must bypass the user-supplied error handler.
    ///
    /// True only for the documented transient socket races that the handler
    /// resolves internally.
    pub fn skip_error_handler(&self) -> bool {
        matches!(self, TransportError::StaleEndpoint)
    }
}

/// Any error surfaced through the collector's error handler.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// A payload buffer hit its item ceiling.
    #[error(transparent)]
    QueueFull(#[from] QueueFullError),

    /// A reading was dropped during serialization.
    #[error(transparent)]
    Serialize(#[from] SerializeError),

    /// A payload could not be delivered.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors that could occur while building a collector.
#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum BuildError {
    /// No error handler was supplied.
    ///
    /// Background snapshot and flush tasks can only report failures through
    /// the error handler, so building a collector without one would silently
    /// swallow every transport and serialization problem.
    #[error("collector requires an error handler; use CollectorBuilder::on_error")]
    MissingErrorHandler,

    /// A configured interval is zero.
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Details about the invalid configuration.
        reason: String,
    },
}
