//! The sink interface readings are written into during a snapshot.

use crate::{error::QueueFullError, reading::MetricReading};

/// A sink receiving [`MetricReading`]s during serialization.
///
/// Every handler supplies its own batch that forwards each reading to the
/// handler's serializer; the batch additionally tracks how much was written
/// through it so the collector can report per-snapshot statistics.
pub trait ReadingBatch {
    /// Adds one reading to the batch.
    ///
    /// Fails only when the destination payload buffer has reached its item
    /// ceiling; the caller is expected to stop writing for this interval.
    fn add(&mut self, reading: MetricReading) -> Result<(), QueueFullError>;

    /// Serialized bytes written through this batch.
    fn bytes_written(&self) -> u64;

    /// Number of readings written through this batch.
    fn metrics_written(&self) -> u64;
}

/// A batch that simply collects readings in memory.
///
/// Useful for tests and for inspecting what a set of instruments would emit
/// without involving a handler.
#[derive(Default)]
pub struct CollectingBatch {
    readings: Vec<MetricReading>,
}

impl CollectingBatch {
    /// Creates an empty collecting batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// The readings added so far.
    pub fn readings(&self) -> &[MetricReading] {
        &self.readings
    }

    /// Consumes the batch, returning the collected readings.
    pub fn into_readings(self) -> Vec<MetricReading> {
        self.readings
    }
}

impl ReadingBatch for CollectingBatch {
    fn add(&mut self, reading: MetricReading) -> Result<(), QueueFullError> {
        self.readings.push(reading);
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        0
    }

    fn metrics_written(&self) -> u64 {
        self.readings.len() as u64
    }
}
