use std::{mem, time::Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use super::{
    buffer::{CommitError, PayloadBuffer},
    AfterSendInfo, FlushOptions, MetricHandler,
};
use crate::{
    batch::ReadingBatch,
    error::{QueueFullError, SerializeError, TransportError},
    metadata::Metadata,
    reading::{MetricReading, PayloadType},
};

/// Buffer limits shared by every buffered handler.
#[derive(Clone, Copy, Debug)]
pub struct BufferedHandlerConfig {
    /// Upper bound on a single payload, in bytes.
    ///
    /// Values below 1000 are clamped up: a smaller bound cannot fit a
    /// realistically-tagged reading and would drop everything.
    pub max_payload_size: usize,
    /// Upper bound on buffered items per payload type.
    pub max_payload_count: usize,
}

impl BufferedHandlerConfig {
    const MIN_PAYLOAD_SIZE: usize = 1000;

    fn clamped(self) -> Self {
        BufferedHandlerConfig {
            max_payload_size: self.max_payload_size.max(Self::MIN_PAYLOAD_SIZE),
            max_payload_count: self.max_payload_count,
        }
    }
}

impl Default for BufferedHandlerConfig {
    fn default() -> Self {
        BufferedHandlerConfig { max_payload_size: 8000, max_payload_count: 240 }
    }
}

/// The backend-specific half of a buffered handler.
///
/// A backend declares its buffer layout, serializes readings and metadata
/// into raw bytes, optionally trims payloads before transmission, and owns
/// the transport that delivers them.
#[async_trait]
pub trait HandlerBackend: Send + Sync {
    /// Short name for diagnostics.
    fn name(&self) -> &'static str;

    /// The buffers this backend wants, labeled by payload type, in flush
    /// order.
    ///
    /// Multiple payload types may share one buffer (and therefore one
    /// endpoint and one item ceiling); [`HandlerBackend::slot_for`] defines
    /// the routing.
    fn buffer_slots(&self) -> Vec<PayloadType>;

    /// Routes a payload type to one of the declared buffers, or `None` to
    /// drop that payload type entirely.
    fn slot_for(&self, payload_type: PayloadType) -> Option<usize>;

    /// Serializes one reading, including its trailing separator.
    fn serialize_reading(
        &self,
        buf: &mut Vec<u8>,
        reading: &MetricReading,
    ) -> Result<(), SerializeError>;

    /// Serializes the full metadata list as a single item.
    fn serialize_metadata(
        &self,
        buf: &mut Vec<u8>,
        metadata: &[Metadata],
    ) -> Result<(), SerializeError>;

    /// Trims a chunk before transmission (e.g. a trailing separator).
    fn prepare_payload<'a>(&self, payload_type: PayloadType, chunk: &'a [u8]) -> &'a [u8] {
        let _ = payload_type;
        chunk
    }

    /// Delivers one payload.
    async fn send(&self, payload_type: PayloadType, payload: &[u8])
        -> Result<(), TransportError>;
}

/// The buffering engine every concrete handler is built on.
///
/// Owns one [`PayloadBuffer`] per backend-declared slot, enforces the item
/// ceiling at serialization time, and drives the detach/slice/send/retry
/// cycle at flush time. Serialization and flushing synchronize per slot, so
/// snapshots can keep writing while a detached sequence is in flight.
pub struct BufferedHandler<B> {
    backend: B,
    labels: Vec<PayloadType>,
    slots: Vec<Mutex<PayloadBuffer>>,
    config: BufferedHandlerConfig,
    dropped: Mutex<Vec<SerializeError>>,
}

impl<B: HandlerBackend> BufferedHandler<B> {
    /// Creates a handler over `backend` with the given buffer limits.
    pub fn new(backend: B, config: BufferedHandlerConfig) -> Self {
        let labels = backend.buffer_slots();
        let slots = labels.iter().map(|_| Mutex::new(PayloadBuffer::new())).collect();
        BufferedHandler { backend, labels, slots, config: config.clamped(), dropped: Mutex::new(Vec::new()) }
    }

    /// The backend this handler ships through.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Buffered item count for the slot `payload_type` routes to.
    pub fn buffered_items(&self, payload_type: PayloadType) -> usize {
        self.backend
            .slot_for(payload_type)
            .map(|slot| self.slots[slot].lock().items())
            .unwrap_or(0)
    }

    fn serialize_into_slot(&self, reading: &MetricReading) -> Result<usize, QueueFullError> {
        let payload_type = reading.metric_type().payload_type();
        let Some(slot) = self.backend.slot_for(payload_type) else {
            return Ok(0);
        };

        let mut buffer = self.slots[slot].lock();
        if buffer.items() >= self.config.max_payload_count {
            return Err(QueueFullError { payload_type: self.labels[slot], count: buffer.items() });
        }

        if let Err(err) = self.backend.serialize_reading(buffer.begin_item(), reading) {
            buffer.abort_item();
            drop(buffer);
            self.dropped.lock().push(err);
            return Ok(0);
        }

        match buffer.commit_item(self.config.max_payload_size) {
            Ok(bytes) => Ok(bytes),
            Err(CommitError::Oversized) => {
                drop(buffer);
                self.dropped.lock().push(SerializeError::Oversized {
                    name: reading.name_with_suffix().to_string(),
                    payload_type,
                });
                Ok(0)
            }
        }
    }

    async fn flush_slot(&self, slot: usize, options: &FlushOptions) -> bool {
        let label = self.labels[slot];
        let detached = {
            let mut buffer = self.slots[slot].lock();
            if buffer.is_empty() {
                return true;
            }
            buffer.detach()
        };

        let total_chunks = detached.chunk_count();
        trace!(
            handler = self.backend.name(),
            payload_type = %label,
            chunks = total_chunks,
            bytes = detached.chunks().map(<[u8]>::len).sum::<usize>(),
            "Flushing detached payloads."
        );

        let mut chunk_index = 0;
        let mut retries = 0u32;
        while let Some(chunk) = detached.chunk(chunk_index) {
            let payload = self.backend.prepare_payload(label, chunk);
            let started = Instant::now();
            let result = match options.send_timeout {
                Some(limit) => {
                    match tokio::time::timeout(limit, self.backend.send(label, payload)).await {
                        Ok(result) => result,
                        Err(_) => Err(TransportError::Timeout { after: limit }),
                    }
                }
                None => self.backend.send(label, payload).await,
            };
            let duration = started.elapsed();

            match result {
                Ok(()) => {
                    options.report_after_send(&AfterSendInfo {
                        payload_type: label,
                        bytes_written: payload.len(),
                        duration,
                        error: None,
                    });
                    chunk_index += 1;
                }
                Err(err) => {
                    options.report_after_send(&AfterSendInfo {
                        payload_type: label,
                        bytes_written: payload.len(),
                        duration,
                        error: Some(err.clone()),
                    });
                    if !err.skip_error_handler() {
                        options.report_error(err.clone().into());
                    }

                    if retries < options.max_retries {
                        retries += 1;
                        debug!(
                            handler = self.backend.name(),
                            payload_type = %label,
                            retry = retries,
                            error = %err,
                            "Send failed; retrying after delay."
                        );
                        tokio::time::sleep(options.retry_delay).await;
                    } else {
                        error!(
                            handler = self.backend.name(),
                            payload_type = %label,
                            dropped_chunks = total_chunks - chunk_index,
                            error = %err,
                            "Exhausted retries; abandoning remaining payloads."
                        );
                        return false;
                    }
                }
            }
        }

        true
    }
}

#[async_trait]
impl<B: HandlerBackend> MetricHandler for BufferedHandler<B> {
    fn begin_batch(&self) -> Box<dyn ReadingBatch + '_> {
        Box::new(BufferedBatch { handler: self, bytes: 0, metrics: 0 })
    }

    fn serialize_reading(&self, reading: &MetricReading) -> Result<(), QueueFullError> {
        self.serialize_into_slot(reading).map(|_| ())
    }

    fn serialize_metadata(&self, metadata: &[Metadata]) {
        let Some(slot) = self.backend.slot_for(PayloadType::Metadata) else {
            return;
        };
        if metadata.is_empty() {
            return;
        }

        let mut buffer = self.slots[slot].lock();
        if let Err(err) = self.backend.serialize_metadata(buffer.begin_item(), metadata) {
            buffer.abort_item();
            drop(buffer);
            self.dropped.lock().push(err);
            return;
        }

        // Metadata goes out as one payload regardless of size; it is sent
        // rarely and some endpoints only accept the complete document.
        let _ = buffer.commit_item(usize::MAX);
    }

    fn take_serialization_errors(&self) -> Vec<SerializeError> {
        mem::take(&mut *self.dropped.lock())
    }

    async fn flush(&self, options: &FlushOptions) {
        for slot in 0..self.slots.len() {
            if !self.flush_slot(slot, options).await {
                // A payload type out of retries ends the whole pass; the
                // remaining slots keep their buffers for the next flush.
                return;
            }
        }
    }
}

struct BufferedBatch<'a, B> {
    handler: &'a BufferedHandler<B>,
    bytes: u64,
    metrics: u64,
}

impl<'a, B: HandlerBackend> ReadingBatch for BufferedBatch<'a, B> {
    fn add(&mut self, reading: MetricReading) -> Result<(), QueueFullError> {
        let bytes = self.handler.serialize_into_slot(&reading)?;
        if bytes > 0 {
            self.bytes += bytes as u64;
            self.metrics += 1;
        }
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.bytes
    }

    fn metrics_written(&self) -> u64 {
        self.metrics
    }
}
