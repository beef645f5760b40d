//! The handler abstraction and the buffered payload engine behind it.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    batch::ReadingBatch,
    error::{PipelineError, QueueFullError, SerializeError, TransportError},
    metadata::Metadata,
    reading::{MetricReading, PayloadType},
};

mod buffer;
mod buffered;

pub use buffer::{CommitError, DetachedPayloads, PayloadBuffer};
pub use buffered::{BufferedHandler, BufferedHandlerConfig, HandlerBackend};

/// Details about one completed (or failed) payload send.
#[derive(Clone, Debug)]
pub struct AfterSendInfo {
    /// The payload type the chunk belonged to.
    pub payload_type: PayloadType,
    /// Size of the payload handed to the transport.
    pub bytes_written: usize,
    /// How long the send took.
    pub duration: Duration,
    /// The failure, if the send did not succeed.
    pub error: Option<TransportError>,
}

/// Observer invoked after every payload send attempt.
pub type AfterSendFn = Arc<dyn Fn(&AfterSendInfo) + Send + Sync>;

/// Receiver for every error the background pipeline produces.
pub type ErrorHandler = Arc<dyn Fn(&PipelineError) + Send + Sync>;

/// Parameters for one flush pass.
#[derive(Clone)]
pub struct FlushOptions {
    /// Sleep between retries of a failed send.
    pub retry_delay: Duration,
    /// Retry cap per payload type.
    pub max_retries: u32,
    /// Abandon a send that has not completed within this window.
    ///
    /// The collector sets this to its flush interval so a wedged endpoint
    /// cannot stall the pipeline past one cycle.
    pub send_timeout: Option<Duration>,
    /// Observer invoked after every send attempt.
    pub after_send: Option<AfterSendFn>,
    /// Receiver for send failures (transient socket races excluded).
    pub on_error: Option<ErrorHandler>,
}

impl FlushOptions {
    pub(crate) fn report_after_send(&self, info: &AfterSendInfo) {
        if let Some(after_send) = &self.after_send {
            after_send(info);
        }
    }

    pub(crate) fn report_error(&self, error: PipelineError) {
        if let Some(on_error) = &self.on_error {
            on_error(&error);
        }
    }
}

/// A per-backend shipping endpoint.
///
/// Handlers accept readings and metadata during snapshots, buffer their
/// serialized bytes per payload type, and drain the buffers to a remote
/// endpoint when flushed. A handler's flush is sequential across payload
/// types; different handlers flush independently.
#[async_trait]
pub trait MetricHandler: Send + Sync {
    /// Starts a batch that routes readings into this handler's buffers and
    /// tracks per-batch statistics.
    fn begin_batch(&self) -> Box<dyn ReadingBatch + '_>;

    /// Serializes one reading, without batch statistics.
    fn serialize_reading(&self, reading: &MetricReading) -> Result<(), QueueFullError>;

    /// Serializes the full metadata list into the metadata buffer.
    fn serialize_metadata(&self, metadata: &[Metadata]);

    /// Takes the readings dropped during serialization since the last call.
    ///
    /// Dropped readings (oversized, out-of-range timestamps) do not abort a
    /// snapshot; the collector collects them here and reports each through
    /// the error handler.
    fn take_serialization_errors(&self) -> Vec<SerializeError>;

    /// Drains all buffered payloads to the remote endpoint.
    async fn flush(&self, options: &FlushOptions);
}
