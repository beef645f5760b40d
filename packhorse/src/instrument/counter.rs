use std::sync::atomic::{
    AtomicI64,
    Ordering::{AcqRel, Relaxed},
};

use chrono::{DateTime, Utc};

use super::{Instrument, InstrumentInfo};
use crate::{batch::ReadingBatch, error::QueueFullError};

/// A thread-safe counter reporting the delta accumulated since the last
/// snapshot.
///
/// The accumulator is swapped to zero atomically as part of writing, so
/// increments racing a snapshot land in the next interval rather than being
/// lost. An idle counter emits nothing.
#[derive(Debug)]
pub struct Counter {
    info: InstrumentInfo,
    value: AtomicI64,
}

impl Counter {
    pub(crate) fn new(info: InstrumentInfo) -> Self {
        Counter { info, value: AtomicI64::new(0) }
    }

    /// Increments the counter by one.
    pub fn increment(&self) {
        self.increment_by(1);
    }

    /// Increments the counter by `delta`.
    ///
    /// Deltas are expected to be non-negative; the receiver treats the series
    /// as monotonic and a negative delta will produce a dip in the reported
    /// rate.
    pub fn increment_by(&self, delta: i64) {
        self.value.fetch_add(delta, Relaxed);
    }
}

impl Instrument for Counter {
    fn info(&self) -> &InstrumentInfo {
        &self.info
    }

    fn write_readings(
        &self,
        batch: &mut dyn ReadingBatch,
        timestamp: DateTime<Utc>,
    ) -> Result<(), QueueFullError> {
        let delta = self.value.swap(0, AcqRel);
        if delta == 0 {
            return Ok(());
        }

        batch.add(self.info.reading(0, delta as f64, timestamp))
    }
}

/// A low-volume counter whose receiver-visible value is monotonic.
///
/// Only unit increments are supported. Like [`Counter`], the delta since the
/// last snapshot is emitted and the accumulator resets; the handler for an
/// endpoint that wants totals (e.g. Bosun's external counter endpoint) keeps
/// a per-series running total and serializes that instead of the delta.
pub struct CumulativeCounter {
    info: InstrumentInfo,
    value: AtomicI64,
}

impl CumulativeCounter {
    pub(crate) fn new(info: InstrumentInfo) -> Self {
        CumulativeCounter { info, value: AtomicI64::new(0) }
    }

    /// Increments the counter by one.
    pub fn increment(&self) {
        self.value.fetch_add(1, Relaxed);
    }
}

impl Instrument for CumulativeCounter {
    fn info(&self) -> &InstrumentInfo {
        &self.info
    }

    fn write_readings(
        &self,
        batch: &mut dyn ReadingBatch,
        timestamp: DateTime<Utc>,
    ) -> Result<(), QueueFullError> {
        let delta = self.value.swap(0, AcqRel);
        if delta <= 0 {
            return Ok(());
        }

        batch.add(self.info.reading(0, delta as f64, timestamp))
    }
}

/// A counter whose value is supplied by a user callback at snapshot time.
///
/// The provider runs on the snapshot thread; the caller owns any
/// synchronization inside it. A reading is emitted only when the provider
/// returns a present, non-zero value.
pub struct SnapshotCounter {
    info: InstrumentInfo,
    provider: Box<dyn Fn() -> Option<i64> + Send + Sync>,
}

impl SnapshotCounter {
    pub(crate) fn new(
        info: InstrumentInfo,
        provider: Box<dyn Fn() -> Option<i64> + Send + Sync>,
    ) -> Self {
        SnapshotCounter { info, provider }
    }
}

impl Instrument for SnapshotCounter {
    fn info(&self) -> &InstrumentInfo {
        &self.info
    }

    fn write_readings(
        &self,
        batch: &mut dyn ReadingBatch,
        timestamp: DateTime<Utc>,
    ) -> Result<(), QueueFullError> {
        match (self.provider)() {
            Some(value) if value != 0 => batch.add(self.info.reading(0, value as f64, timestamp)),
            _ => Ok(()),
        }
    }
}
