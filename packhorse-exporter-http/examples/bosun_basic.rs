//! Ships counters and gauges to a Bosun relay.
//!
//! Point `BOSUN_URL` at a relay (or a request-logging stub) and run:
//! `BOSUN_URL=http://localhost:8070 cargo run --example bosun_basic`.

use std::{sync::Arc, time::Duration};

use packhorse::{CollectorBuilder, MetricHandler, MetricSource, SourceOptions};
use packhorse_exporter_http::BosunHandlerBuilder;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().init();

    let base_url =
        std::env::var("BOSUN_URL").unwrap_or_else(|_| "http://localhost:8070".to_string());

    let source = Arc::new(MetricSource::new(
        SourceOptions::default()
            .with_default_tag("host", "example-host")
            .with_default_tag("service", "bosun-basic"),
    )?);
    let requests = source.counter("requests", "requests", "simulated requests", &[])?;
    let external = source.cumulative_counter("events", "events", "simulated events", &[])?;

    let bosun = BosunHandlerBuilder::new(base_url).build()?;
    let collector = CollectorBuilder::new()
        .add_source(source)
        .add_handler(Arc::new(bosun) as Arc<dyn MetricHandler>)
        .snapshot_interval(Duration::from_secs(5))
        .flush_interval(Duration::from_secs(2))
        .after_send(|info| {
            println!(
                "sent {} bytes of {} in {:?}",
                info.bytes_written, info.payload_type, info.duration
            );
        })
        .on_error(|error| eprintln!("metrics pipeline: {error}"))
        .build()?;
    collector.start();

    for _ in 0..30 {
        requests.increment_by(3);
        external.increment();
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    collector.stop().await;
    Ok(())
}
