use std::{mem, sync::Arc};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{Instrument, InstrumentInfo, SuffixEntry};
use crate::{
    batch::ReadingBatch,
    error::{CreateError, QueueFullError},
    reading::MetricType,
    tags::TagSet,
    validation::is_valid_metric_name,
};

/// One reduction applied to the samples an [`AggregateGauge`] collects
/// during a snapshot interval.
///
/// Aggregators are identified by a percentile code and determine both what
/// is computed and what suffix the emitted reading carries:
///
/// | Aggregator   | Code  | Suffix     |
/// |--------------|-------|------------|
/// | Last         | −2.0  | (none)     |
/// | Average      | −1.0  | `_avg`     |
/// | Count        | −3.0  | `_count`   |
/// | Min          | 0.0   | `_min`     |
/// | Median       | 0.5   | `_median`  |
/// | Percentile p | p     | `_PP`      |
/// | Max          | 1.0   | `_max`     |
#[derive(Clone, Debug, PartialEq)]
pub struct GaugeAggregator {
    kind: AggregatorKind,
    suffix: String,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum AggregatorKind {
    Last,
    Average,
    Count,
    Min,
    Max,
    Percentile(f64),
}

impl GaugeAggregator {
    /// The last sample recorded in the interval. Emits with no suffix.
    pub fn last() -> Self {
        GaugeAggregator { kind: AggregatorKind::Last, suffix: String::new() }
    }

    /// The arithmetic mean of the interval's samples.
    pub fn average() -> Self {
        GaugeAggregator { kind: AggregatorKind::Average, suffix: "_avg".to_string() }
    }

    /// The number of samples recorded in the interval.
    ///
    /// Unlike every other aggregator, Count always emits: even for an empty
    /// interval, and even when the sample count is below the gauge's
    /// `minimum_events` squelch threshold.
    pub fn count() -> Self {
        GaugeAggregator { kind: AggregatorKind::Count, suffix: "_count".to_string() }
    }

    /// The smallest sample of the interval.
    pub fn min() -> Self {
        GaugeAggregator { kind: AggregatorKind::Min, suffix: "_min".to_string() }
    }

    /// The largest sample of the interval.
    pub fn max() -> Self {
        GaugeAggregator { kind: AggregatorKind::Max, suffix: "_max".to_string() }
    }

    /// The nearest-rank median of the interval's samples.
    pub fn median() -> Self {
        GaugeAggregator { kind: AggregatorKind::Percentile(0.5), suffix: "_median".to_string() }
    }

    /// The nearest-rank percentile `p` of the interval's samples.
    ///
    /// `p` is clamped to `[0.0, 1.0]`; the boundary values degrade to
    /// [`GaugeAggregator::min`] and [`GaugeAggregator::max`], and `0.5` to
    /// [`GaugeAggregator::median`]. Other values get the `_PP` suffix where
    /// `PP = floor(p * 100)`.
    pub fn percentile(p: f64) -> Self {
        let p = p.clamp(0.0, 1.0);
        if p == 0.0 {
            return Self::min();
        }
        if p == 1.0 {
            return Self::max();
        }
        if p == 0.5 {
            return Self::median();
        }

        let suffix = format!("_{}", (p * 100.0).floor() as u32);
        GaugeAggregator { kind: AggregatorKind::Percentile(p), suffix }
    }

    /// Replaces the default suffix.
    ///
    /// The replacement must still be empty or a valid name fragment; this is
    /// checked when the owning gauge is constructed.
    #[must_use]
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    /// The percentile code identifying this aggregator.
    pub fn percentile_code(&self) -> f64 {
        match self.kind {
            AggregatorKind::Last => -2.0,
            AggregatorKind::Average => -1.0,
            AggregatorKind::Count => -3.0,
            AggregatorKind::Min => 0.0,
            AggregatorKind::Max => 1.0,
            AggregatorKind::Percentile(p) => p,
        }
    }

    /// The suffix readings produced by this aggregator carry.
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    fn needs_samples(&self) -> bool {
        matches!(self.kind, AggregatorKind::Percentile(_))
    }
}

#[derive(Debug)]
struct AggregateState {
    count: u64,
    sum: f64,
    last: f64,
    min: f64,
    max: f64,
    samples: Vec<f64>,
}

impl AggregateState {
    fn empty(sample_capacity: usize) -> Self {
        AggregateState {
            count: 0,
            sum: 0.0,
            last: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            samples: Vec::with_capacity(sample_capacity),
        }
    }
}

/// A gauge that reduces the samples recorded during an interval through one
/// or more aggregators.
///
/// Recording is a single short critical section updating count, sum, last,
/// min, and max; the raw sample list is kept only when a percentile-style
/// aggregator is configured, since those are the only reductions that need a
/// sort at snapshot time.
///
/// When the interval's sample count is below `minimum_events`, every
/// aggregator is squelched except Count, which emits the (sub-threshold)
/// count so that downstream dashboards can still see activity.
#[derive(Debug)]
pub struct AggregateGauge {
    info: InstrumentInfo,
    aggregators: Vec<GaugeAggregator>,
    minimum_events: u64,
    track_samples: bool,
    state: Mutex<AggregateState>,
}

impl AggregateGauge {
    pub(crate) fn new(
        name: Arc<str>,
        unit: &str,
        description: &str,
        tags: TagSet,
        aggregators: Vec<GaugeAggregator>,
        minimum_events: u64,
    ) -> Result<Self, CreateError> {
        if aggregators.is_empty() {
            return Err(CreateError::NoAggregators { name: name.to_string() });
        }

        let mut suffixes = Vec::with_capacity(aggregators.len());
        for aggregator in &aggregators {
            let suffix = aggregator.suffix();
            if !suffix.is_empty() && !is_valid_metric_name(suffix) {
                return Err(CreateError::InvalidSuffix {
                    name: name.to_string(),
                    suffix: suffix.to_string(),
                });
            }
            if aggregators.iter().filter(|a| a.suffix() == suffix).count() > 1 {
                return Err(CreateError::DuplicateSuffix {
                    name: name.to_string(),
                    suffix: suffix.to_string(),
                });
            }
            suffixes.push(SuffixEntry::new(&name, suffix, unit, description));
        }

        let track_samples = aggregators.iter().any(GaugeAggregator::needs_samples);
        let info = InstrumentInfo::with_suffixes(name, MetricType::Gauge, tags, suffixes);

        Ok(AggregateGauge {
            info,
            aggregators,
            minimum_events: minimum_events.max(1),
            track_samples,
            state: Mutex::new(AggregateState::empty(0)),
        })
    }

    /// Records one sample.
    pub fn record(&self, value: f64) {
        let mut state = self.state.lock();
        state.count += 1;
        state.sum += value;
        state.last = value;
        if value < state.min {
            state.min = value;
        }
        if value > state.max {
            state.max = value;
        }
        if self.track_samples {
            state.samples.push(value);
        }
    }

    fn adopt_state(&self) -> AggregateState {
        let mut state = self.state.lock();
        // Size the replacement list off the adopted one; an interval's volume
        // is a decent predictor of the next interval's.
        let capacity_hint = state.samples.len() / 2;
        mem::replace(&mut *state, AggregateState::empty(capacity_hint))
    }
}

impl Instrument for AggregateGauge {
    fn info(&self) -> &InstrumentInfo {
        &self.info
    }

    fn write_readings(
        &self,
        batch: &mut dyn ReadingBatch,
        timestamp: DateTime<Utc>,
    ) -> Result<(), QueueFullError> {
        let mut adopted = self.adopt_state();

        let squelched = adopted.count < self.minimum_events;
        if !squelched && self.track_samples {
            adopted.samples.sort_unstable_by(|a, b| a.total_cmp(b));
        }

        for (index, aggregator) in self.aggregators.iter().enumerate() {
            let value = match aggregator.kind {
                AggregatorKind::Count => adopted.count as f64,
                _ if squelched => continue,
                AggregatorKind::Last => adopted.last,
                AggregatorKind::Average => adopted.sum / adopted.count as f64,
                AggregatorKind::Min => adopted.min,
                AggregatorKind::Max => adopted.max,
                AggregatorKind::Percentile(p) => {
                    let rank = nearest_rank_index(p, adopted.samples.len());
                    adopted.samples[rank]
                }
            };

            batch.add(self.info.reading(index, value, timestamp))?;
        }

        Ok(())
    }
}

/// Nearest-rank index for percentile `p` over `n` sorted samples:
/// `round(p * (n - 1))`, with `.5` ties resolved downward so that the median
/// of an even-sized interval picks the lower middle sample.
fn nearest_rank_index(p: f64, n: usize) -> usize {
    debug_assert!(n > 0);
    let exact = p * (n - 1) as f64;
    let rank = (exact - 0.5).ceil();
    (rank.max(0.0) as usize).min(n - 1)
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc};

    use chrono::{TimeZone, Utc};

    use super::{nearest_rank_index, AggregateGauge, GaugeAggregator};
    use crate::{
        batch::CollectingBatch,
        error::CreateError,
        instrument::Instrument,
        tags::{tag_set, TagSet},
    };

    fn gauge(aggregators: Vec<GaugeAggregator>, minimum_events: u64) -> AggregateGauge {
        AggregateGauge::new(
            Arc::from("latency"),
            "ms",
            "request latency",
            tag_set(&[("host", "a")]),
            aggregators,
            minimum_events,
        )
        .unwrap()
    }

    fn snapshot(gauge: &AggregateGauge) -> HashMap<String, f64> {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut batch = CollectingBatch::new();
        gauge.write_readings(&mut batch, ts).unwrap();
        batch
            .readings()
            .iter()
            .map(|r| (r.suffix().to_string(), r.value()))
            .collect()
    }

    #[test]
    fn percentile_scenario_one_to_one_hundred() {
        let gauge = gauge(
            vec![
                GaugeAggregator::min(),
                GaugeAggregator::median(),
                GaugeAggregator::percentile(0.95),
                GaugeAggregator::max(),
                GaugeAggregator::count(),
            ],
            1,
        );

        for v in 1..=100 {
            gauge.record(v as f64);
        }

        let by_suffix = snapshot(&gauge);
        assert_eq!(by_suffix.len(), 5);
        assert_eq!(by_suffix["_min"], 1.0);
        assert_eq!(by_suffix["_median"], 50.0);
        assert_eq!(by_suffix["_95"], 95.0);
        assert_eq!(by_suffix["_max"], 100.0);
        assert_eq!(by_suffix["_count"], 100.0);
    }

    #[test]
    fn squelch_below_minimum_events_keeps_count() {
        let gauge = gauge(
            vec![
                GaugeAggregator::min(),
                GaugeAggregator::median(),
                GaugeAggregator::percentile(0.95),
                GaugeAggregator::max(),
                GaugeAggregator::count(),
            ],
            10,
        );

        gauge.record(1.0);
        gauge.record(2.0);
        gauge.record(3.0);

        let by_suffix = snapshot(&gauge);
        assert_eq!(by_suffix.len(), 1, "only the count aggregator may emit");
        assert_eq!(by_suffix["_count"], 3.0);
    }

    #[test]
    fn empty_interval_emits_count_zero_only() {
        let with_count =
            gauge(vec![GaugeAggregator::average(), GaugeAggregator::count()], 1);
        let by_suffix = snapshot(&with_count);
        assert_eq!(by_suffix.len(), 1);
        assert_eq!(by_suffix["_count"], 0.0);

        let without_count = gauge(vec![GaugeAggregator::average(), GaugeAggregator::max()], 1);
        assert!(snapshot(&without_count).is_empty());
    }

    #[test]
    fn state_resets_between_snapshots() {
        let gauge = gauge(vec![GaugeAggregator::average(), GaugeAggregator::count()], 1);
        gauge.record(10.0);
        gauge.record(20.0);

        let first = snapshot(&gauge);
        assert_eq!(first["_avg"], 15.0);
        assert_eq!(first["_count"], 2.0);

        let second = snapshot(&gauge);
        assert_eq!(second.len(), 1);
        assert_eq!(second["_count"], 0.0);
    }

    #[test]
    fn last_and_average_track_all_samples() {
        let gauge = gauge(
            vec![GaugeAggregator::last(), GaugeAggregator::average()],
            1,
        );
        gauge.record(4.0);
        gauge.record(6.0);
        gauge.record(11.0);

        let by_suffix = snapshot(&gauge);
        assert_eq!(by_suffix[""], 11.0);
        assert_eq!(by_suffix["_avg"], 7.0);
    }

    #[test]
    fn percentile_constructor_degrades_at_boundaries() {
        assert_eq!(GaugeAggregator::percentile(0.0), GaugeAggregator::min());
        assert_eq!(GaugeAggregator::percentile(1.0), GaugeAggregator::max());
        assert_eq!(GaugeAggregator::percentile(0.5), GaugeAggregator::median());
        assert_eq!(GaugeAggregator::percentile(0.99).suffix(), "_99");
        assert_eq!(GaugeAggregator::percentile(0.999).suffix(), "_99");
    }

    #[test]
    fn duplicate_suffixes_are_rejected() {
        let err = AggregateGauge::new(
            Arc::from("latency"),
            "ms",
            "request latency",
            tag_set(&[("host", "a")]),
            vec![GaugeAggregator::percentile(0.991), GaugeAggregator::percentile(0.995)],
            1,
        )
        .unwrap_err();

        assert_eq!(
            err,
            CreateError::DuplicateSuffix {
                name: "latency".to_string(),
                suffix: "_99".to_string()
            }
        );
    }

    #[test]
    fn invalid_custom_suffix_is_rejected() {
        let err = AggregateGauge::new(
            Arc::from("latency"),
            "ms",
            "request latency",
            tag_set(&[("host", "a")]),
            vec![GaugeAggregator::max().with_suffix("_p max")],
            1,
        )
        .unwrap_err();

        assert!(matches!(err, CreateError::InvalidSuffix { .. }));
    }

    #[test]
    fn no_aggregators_is_rejected() {
        let err = AggregateGauge::new(
            Arc::from("latency"),
            "ms",
            "request latency",
            TagSet::merge("latency", &[], &[("host".to_string(), "a".to_string())], None, None)
                .unwrap(),
            Vec::new(),
            1,
        )
        .unwrap_err();

        assert_eq!(err, CreateError::NoAggregators { name: "latency".to_string() });
    }

    #[test]
    fn nearest_rank_matches_formula() {
        // round(p * (n - 1)) with .5 ties resolved downward.
        assert_eq!(nearest_rank_index(0.0, 100), 0);
        assert_eq!(nearest_rank_index(1.0, 100), 99);
        assert_eq!(nearest_rank_index(0.5, 100), 49);
        assert_eq!(nearest_rank_index(0.95, 100), 94);
        assert_eq!(nearest_rank_index(0.5, 101), 50);
        assert_eq!(nearest_rank_index(0.5, 1), 0);
        assert_eq!(nearest_rank_index(0.3, 2), 0);
        assert_eq!(nearest_rank_index(0.7, 2), 1);
    }
}
