use std::{
    mem,
    sync::atomic::{
        AtomicU64,
        Ordering::{Acquire, Release},
    },
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{Instrument, InstrumentInfo};
use crate::{batch::ReadingBatch, error::QueueFullError};

/// A gauge reporting the last recorded value at every snapshot.
///
/// The value is stored as the bit pattern of an `f64` in an atomic integer,
/// so recording is a single atomic store from any thread. Recording `NaN`
/// disables emission until a real value is recorded again; a freshly
/// constructed gauge starts disabled.
pub struct SamplingGauge {
    info: InstrumentInfo,
    bits: AtomicU64,
}

impl SamplingGauge {
    pub(crate) fn new(info: InstrumentInfo) -> Self {
        SamplingGauge { info, bits: AtomicU64::new(f64::NAN.to_bits()) }
    }

    /// Records the current value.
    pub fn record(&self, value: f64) {
        self.bits.store(value.to_bits(), Release);
    }
}

impl Instrument for SamplingGauge {
    fn info(&self) -> &InstrumentInfo {
        &self.info
    }

    fn write_readings(
        &self,
        batch: &mut dyn ReadingBatch,
        timestamp: DateTime<Utc>,
    ) -> Result<(), QueueFullError> {
        let value = f64::from_bits(self.bits.load(Acquire));
        if value.is_nan() {
            return Ok(());
        }

        batch.add(self.info.reading(0, value, timestamp))
    }
}

/// A gauge emitting one reading per recorded event.
///
/// Events carry their own occurrence time, which is what the emitted reading
/// uses (not the snapshot time). The event list is adopted wholesale at
/// snapshot time; recording is a short push under a mutex.
pub struct EventGauge {
    info: InstrumentInfo,
    events: Mutex<Vec<(f64, DateTime<Utc>)>>,
}

impl EventGauge {
    pub(crate) fn new(info: InstrumentInfo) -> Self {
        EventGauge { info, events: Mutex::new(Vec::new()) }
    }

    /// Records an event that occurred now.
    pub fn record(&self, value: f64) {
        self.record_at(value, Utc::now());
    }

    /// Records an event with an explicit occurrence time.
    pub fn record_at(&self, value: f64, time: DateTime<Utc>) {
        self.events.lock().push((value, time));
    }
}

impl Instrument for EventGauge {
    fn info(&self) -> &InstrumentInfo {
        &self.info
    }

    fn write_readings(
        &self,
        batch: &mut dyn ReadingBatch,
        _timestamp: DateTime<Utc>,
    ) -> Result<(), QueueFullError> {
        let events = mem::take(&mut *self.events.lock());
        for (value, time) in events {
            batch.add(self.info.reading(0, value, time))?;
        }
        Ok(())
    }
}

/// A gauge whose value is supplied by a user callback at snapshot time.
///
/// The provider runs on the snapshot thread; the caller owns any
/// synchronization inside it. A reading is emitted whenever the provider
/// returns a present value, including zero.
pub struct SnapshotGauge {
    info: InstrumentInfo,
    provider: Box<dyn Fn() -> Option<f64> + Send + Sync>,
}

impl SnapshotGauge {
    pub(crate) fn new(
        info: InstrumentInfo,
        provider: Box<dyn Fn() -> Option<f64> + Send + Sync>,
    ) -> Self {
        SnapshotGauge { info, provider }
    }
}

impl Instrument for SnapshotGauge {
    fn info(&self) -> &InstrumentInfo {
        &self.info
    }

    fn write_readings(
        &self,
        batch: &mut dyn ReadingBatch,
        timestamp: DateTime<Utc>,
    ) -> Result<(), QueueFullError> {
        match (self.provider)() {
            Some(value) => batch.add(self.info.reading(0, value, timestamp)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};

    use super::{EventGauge, SamplingGauge, SnapshotGauge};
    use crate::{
        batch::CollectingBatch,
        instrument::{Instrument, InstrumentInfo},
        reading::MetricType,
        tags::tag_set,
    };

    fn info(name: &str) -> InstrumentInfo {
        InstrumentInfo::new(
            Arc::from(name),
            "ms",
            "test gauge",
            MetricType::Gauge,
            tag_set(&[("host", "a")]),
        )
    }

    #[test]
    fn sampling_gauge_nan_gates_emission() {
        let gauge = SamplingGauge::new(info("temperature"));
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let mut batch = CollectingBatch::new();
        gauge.write_readings(&mut batch, ts).unwrap();
        assert!(batch.readings().is_empty(), "fresh gauge must be disabled");

        gauge.record(1.5);
        let mut batch = CollectingBatch::new();
        gauge.write_readings(&mut batch, ts).unwrap();
        assert_eq!(batch.readings().len(), 1);
        assert_eq!(batch.readings()[0].value(), 1.5);

        gauge.record(f64::NAN);
        let mut batch = CollectingBatch::new();
        gauge.write_readings(&mut batch, ts).unwrap();
        assert!(batch.readings().is_empty(), "NaN must disable emission");

        gauge.record(2.5);
        let mut batch = CollectingBatch::new();
        gauge.write_readings(&mut batch, ts).unwrap();
        assert_eq!(batch.readings().len(), 1);
        assert_eq!(batch.readings()[0].value(), 2.5);
    }

    #[test]
    fn event_gauge_emits_each_event_at_its_own_time() {
        let gauge = EventGauge::new(info("job_duration"));
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 2).unwrap();
        gauge.record_at(10.0, t1);
        gauge.record_at(20.0, t2);

        let snapshot_ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 0).unwrap();
        let mut batch = CollectingBatch::new();
        gauge.write_readings(&mut batch, snapshot_ts).unwrap();

        let mut emitted: Vec<_> =
            batch.readings().iter().map(|r| (r.value(), r.timestamp())).collect();
        emitted.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(emitted, vec![(10.0, t1), (20.0, t2)]);

        let mut second = CollectingBatch::new();
        gauge.write_readings(&mut second, snapshot_ts).unwrap();
        assert!(second.readings().is_empty(), "events are consumed by the snapshot");
    }

    #[test]
    fn snapshot_gauge_emits_present_values_including_zero() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let zero = SnapshotGauge::new(info("free_memory"), Box::new(|| Some(0.0)));
        let mut batch = CollectingBatch::new();
        zero.write_readings(&mut batch, ts).unwrap();
        assert_eq!(batch.readings().len(), 1);
        assert_eq!(batch.readings()[0].value(), 0.0);

        let absent = SnapshotGauge::new(info("absent"), Box::new(|| None));
        let mut batch = CollectingBatch::new();
        absent.write_readings(&mut batch, ts).unwrap();
        assert!(batch.readings().is_empty());
    }
}
