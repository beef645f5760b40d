//! Plugs a custom backend into the buffered engine: payloads are printed to
//! stdout instead of being shipped anywhere.
//!
//! `cargo run --example custom_backend`

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use packhorse::{
    handler::{BufferedHandler, BufferedHandlerConfig, HandlerBackend},
    CollectorBuilder, Metadata, MetricHandler, MetricReading, MetricSource, PayloadType,
    SerializeError, SourceOptions, TransportError,
};

struct StdoutBackend;

#[async_trait]
impl HandlerBackend for StdoutBackend {
    fn name(&self) -> &'static str {
        "stdout"
    }

    fn buffer_slots(&self) -> Vec<PayloadType> {
        vec![PayloadType::Counter, PayloadType::Gauge, PayloadType::Metadata]
    }

    fn slot_for(&self, payload_type: PayloadType) -> Option<usize> {
        match payload_type {
            PayloadType::Counter | PayloadType::CumulativeCounter => Some(0),
            PayloadType::Gauge => Some(1),
            PayloadType::Metadata => Some(2),
        }
    }

    fn serialize_reading(
        &self,
        buf: &mut Vec<u8>,
        reading: &MetricReading,
    ) -> Result<(), SerializeError> {
        buf.extend_from_slice(
            format!(
                "{} = {} at {} {:?}\n",
                reading.name_with_suffix(),
                reading.value(),
                reading.timestamp(),
                reading.tags(),
            )
            .as_bytes(),
        );
        Ok(())
    }

    fn serialize_metadata(
        &self,
        buf: &mut Vec<u8>,
        metadata: &[Metadata],
    ) -> Result<(), SerializeError> {
        for entry in metadata {
            buf.extend_from_slice(
                format!("# {} {} = {}\n", entry.name, entry.kind.as_str(), entry.value).as_bytes(),
            );
        }
        Ok(())
    }

    async fn send(&self, payload_type: PayloadType, payload: &[u8]) -> Result<(), TransportError> {
        print!("--- {payload_type} payload ---\n{}", String::from_utf8_lossy(payload));
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let source = Arc::new(MetricSource::new(
        SourceOptions::default().with_default_tag("host", "local"),
    )?);
    let requests = source.counter("requests", "requests", "processed requests", &[])?;
    let queue_depth = source.sampling_gauge("queue_depth", "items", "work queue depth", &[])?;

    let handler = BufferedHandler::new(StdoutBackend, BufferedHandlerConfig::default());
    let collector = CollectorBuilder::new()
        .add_source(source)
        .add_handler(Arc::new(handler) as Arc<dyn MetricHandler>)
        .snapshot_interval(Duration::from_secs(1))
        .flush_interval(Duration::from_secs(1))
        .on_error(|error| eprintln!("metrics pipeline: {error}"))
        .build()?;
    collector.start();

    for i in 0..5u32 {
        requests.increment_by(10);
        queue_depth.record(f64::from(i * 3));
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    collector.stop().await;
    Ok(())
}
