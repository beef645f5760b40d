//! Ships a handful of metrics to a local StatsD agent.
//!
//! Run a listener first, e.g. `nc -u -l 8125`, then:
//! `cargo run --example statsd_basic`.

use std::{sync::Arc, time::Duration};

use packhorse::{CollectorBuilder, GaugeAggregator, MetricHandler, MetricSource, SourceOptions};
use packhorse_exporter_statsd::StatsdHandlerBuilder;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().init();

    let source = Arc::new(MetricSource::new(
        SourceOptions::default().with_default_tag("service", "statsd-basic"),
    )?);

    let requests = source.counter("requests", "requests", "simulated requests", &[])?;
    let latency = source.aggregate_gauge(
        "latency",
        "ms",
        "simulated request latency",
        &[],
        vec![
            GaugeAggregator::median(),
            GaugeAggregator::percentile(0.95),
            GaugeAggregator::max(),
            GaugeAggregator::count(),
        ],
        1,
    )?;

    let statsd = StatsdHandlerBuilder::new("127.0.0.1", 8125).build()?;
    let collector = CollectorBuilder::new()
        .add_source(source)
        .add_handler(Arc::new(statsd) as Arc<dyn MetricHandler>)
        .snapshot_interval(Duration::from_secs(2))
        .flush_interval(Duration::from_secs(1))
        .on_error(|error| eprintln!("metrics pipeline: {error}"))
        .build()?;
    collector.start();

    for i in 0..100u32 {
        requests.increment();
        latency.record(5.0 + f64::from(i % 40));
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    collector.stop().await;
    Ok(())
}
