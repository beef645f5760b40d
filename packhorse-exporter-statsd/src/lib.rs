//! StatsD/UDP shipping handler for [`packhorse`].
//!
//! Readings are rendered in the StatsD line protocol, packed into payloads
//! no larger than a single conservative UDP MTU (1400 bytes), and sent as
//! datagrams to the configured agent. StatsD has no metadata concept, so
//! metadata is dropped.
//!
//! ```no_run
//! use std::sync::Arc;
//! use packhorse::{CollectorBuilder, MetricHandler};
//! use packhorse_exporter_statsd::StatsdHandlerBuilder;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let statsd = StatsdHandlerBuilder::new("127.0.0.1", 8125).build()?;
//!
//! let collector = CollectorBuilder::new()
//!     .add_handler(Arc::new(statsd) as Arc<dyn MetricHandler>)
//!     .on_error(|error| eprintln!("metrics pipeline: {error}"))
//!     .build()?;
//! collector.start();
//! # Ok(())
//! # }
//! ```
//!
//! The socket is created lazily on the first send and kept for the life of
//! the handler. Reconfiguring the endpoint with
//! [`StatsdBackend::set_endpoint`] atomically invalidates the cached address
//! and socket; a send racing that swap is retried on a fresh socket without
//! involving the collector's error handler.

use std::{io, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::debug;

use packhorse::{
    handler::{BufferedHandler, BufferedHandlerConfig, HandlerBackend},
    Metadata, MetricReading, PayloadType, SerializeError, TransportError,
};

mod writer;

use writer::write_line;

// One conservative UDP MTU; larger datagrams risk fragmentation and get
// dropped wholesale by some agents.
const DEFAULT_MAX_PAYLOAD_SIZE: usize = 1400;

/// Errors that could occur while building a StatsD handler.
#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum BuildError {
    /// A configuration value is unusable.
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Details about the invalid configuration.
        reason: String,
    },
}

/// A handler shipping readings to a StatsD agent over UDP.
pub type StatsdHandler = BufferedHandler<StatsdBackend>;

/// Builder for a [`StatsdHandler`].
pub struct StatsdHandlerBuilder {
    host: String,
    port: u16,
    config: BufferedHandlerConfig,
}

impl StatsdHandlerBuilder {
    /// Creates a builder targeting `host:port`.
    ///
    /// An empty host or a zero port builds a no-op handler that buffers and
    /// discards; this mirrors "statsd disabled" configurations.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        StatsdHandlerBuilder {
            host: host.into(),
            port,
            config: BufferedHandlerConfig {
                max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
                ..BufferedHandlerConfig::default()
            },
        }
    }

    /// Overrides the maximum datagram size. Values above a single UDP
    /// datagram are rejected.
    pub fn max_payload_size(mut self, size: usize) -> Result<Self, BuildError> {
        if size > (u16::MAX as usize) - 8 {
            return Err(BuildError::InvalidConfiguration {
                reason: format!("payload size {size} exceeds the UDP datagram maximum"),
            });
        }
        self.config.max_payload_size = size;
        Ok(self)
    }

    /// Overrides the per-payload-type item ceiling.
    #[must_use]
    pub fn max_payload_count(mut self, count: usize) -> Self {
        self.config.max_payload_count = count;
        self
    }

    /// Builds the handler.
    pub fn build(self) -> Result<StatsdHandler, BuildError> {
        let endpoint = if self.host.is_empty() || self.port == 0 {
            None
        } else {
            Some((self.host, self.port))
        };

        Ok(BufferedHandler::new(
            StatsdBackend {
                endpoint: RwLock::new(endpoint),
                resolved: RwLock::new(None),
                socket: RwLock::new(None),
            },
            self.config,
        ))
    }
}

/// The StatsD-specific serialization and transport rules.
pub struct StatsdBackend {
    endpoint: RwLock<Option<(String, u16)>>,
    resolved: RwLock<Option<SocketAddr>>,
    socket: RwLock<Option<Arc<UdpSocket>>>,
}

impl StatsdBackend {
    /// Replaces the target endpoint.
    ///
    /// The cached address and socket are invalidated atomically; in-flight
    /// sends may observe the swap and retry transparently. An empty host or
    /// zero port turns the handler into a no-op.
    pub fn set_endpoint(&self, host: impl Into<String>, port: u16) {
        let host = host.into();
        let endpoint = if host.is_empty() || port == 0 { None } else { Some((host, port)) };
        *self.endpoint.write() = endpoint;
        *self.resolved.write() = None;
        *self.socket.write() = None;
    }

    async fn resolve(&self) -> Result<Option<SocketAddr>, TransportError> {
        if let Some(addr) = *self.resolved.read() {
            return Ok(Some(addr));
        }

        let Some((host, port)) = self.endpoint.read().clone() else {
            return Ok(None);
        };

        let addr = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|e| TransportError::from_io(&e))?
            .next()
            .ok_or_else(|| TransportError::Request {
                message: format!("no addresses resolved for {host}:{port}"),
            })?;

        debug!(%addr, "Resolved StatsD endpoint.");
        *self.resolved.write() = Some(addr);
        Ok(Some(addr))
    }

    async fn socket(&self) -> Result<Arc<UdpSocket>, TransportError> {
        if let Some(socket) = self.socket.read().as_ref() {
            return Ok(Arc::clone(socket));
        }

        let socket = UdpSocket::bind(("0.0.0.0", 0))
            .await
            .map_err(|e| TransportError::from_io(&e))?;
        let socket = Arc::new(socket);
        *self.socket.write() = Some(Arc::clone(&socket));
        Ok(socket)
    }

    fn is_address_family_race(err: &io::Error) -> bool {
        // Seen when the endpoint flips between IPv4 and IPv6 under a send:
        // the cached socket's family no longer matches the resolved address.
        matches!(err.kind(), io::ErrorKind::AddrNotAvailable | io::ErrorKind::InvalidInput)
    }
}

#[async_trait]
impl HandlerBackend for StatsdBackend {
    fn name(&self) -> &'static str {
        "statsd"
    }

    fn buffer_slots(&self) -> Vec<PayloadType> {
        vec![PayloadType::Counter, PayloadType::CumulativeCounter, PayloadType::Gauge]
    }

    fn slot_for(&self, payload_type: PayloadType) -> Option<usize> {
        match payload_type {
            PayloadType::Counter => Some(0),
            PayloadType::CumulativeCounter => Some(1),
            PayloadType::Gauge => Some(2),
            PayloadType::Metadata => None,
        }
    }

    fn serialize_reading(
        &self,
        buf: &mut Vec<u8>,
        reading: &MetricReading,
    ) -> Result<(), SerializeError> {
        write_line(buf, reading)
    }

    fn serialize_metadata(
        &self,
        _buf: &mut Vec<u8>,
        _metadata: &[Metadata],
    ) -> Result<(), SerializeError> {
        Ok(())
    }

    async fn send(&self, _payload_type: PayloadType, payload: &[u8]) -> Result<(), TransportError> {
        let Some(addr) = self.resolve().await? else {
            // No endpoint configured; drop silently.
            return Ok(());
        };

        let socket = self.socket().await?;
        match socket.send_to(payload, addr).await {
            Ok(_) => Ok(()),
            Err(err) if Self::is_address_family_race(&err) => {
                debug!(error = %err, "Socket family mismatch after endpoint change; recreating.");
                *self.socket.write() = None;
                Err(TransportError::StaleEndpoint)
            }
            Err(err) => Err(TransportError::from_io(&err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use chrono::{TimeZone, Utc};
    use tokio::net::UdpSocket;

    use packhorse::{
        handler::{FlushOptions, HandlerBackend, MetricHandler},
        MetricReading, MetricType, PayloadType, TagSet,
    };

    use super::StatsdHandlerBuilder;

    fn reading(name: &str, metric_type: MetricType, value: f64) -> MetricReading {
        let tags = TagSet::merge(
            name,
            &[],
            &[("env".to_string(), "p".to_string())],
            None,
            None,
        )
        .unwrap();
        MetricReading::new(
            Arc::from(name),
            metric_type,
            value,
            tags,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        )
    }

    fn flush_options() -> FlushOptions {
        FlushOptions {
            retry_delay: Duration::from_millis(1),
            max_retries: 1,
            send_timeout: Some(Duration::from_secs(5)),
            after_send: None,
            on_error: None,
        }
    }

    #[tokio::test]
    async fn sends_one_datagram_per_payload() {
        let receiver = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let port = receiver.local_addr().unwrap().port();

        let handler = StatsdHandlerBuilder::new("127.0.0.1", port).build().unwrap();
        handler.serialize_reading(&reading("req", MetricType::Counter, 7.0)).unwrap();
        handler.flush(&flush_options()).await;

        let mut buf = [0u8; 2048];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), receiver.recv_from(&mut buf))
            .await
            .expect("datagram must arrive")
            .unwrap();
        assert_eq!(&buf[..len], b"req:7|c|#env:p\n");
    }

    #[tokio::test]
    async fn multiple_readings_share_a_datagram() {
        let receiver = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let port = receiver.local_addr().unwrap().port();

        let handler = StatsdHandlerBuilder::new("127.0.0.1", port).build().unwrap();
        handler.serialize_reading(&reading("a", MetricType::Counter, 1.0)).unwrap();
        handler.serialize_reading(&reading("b", MetricType::Counter, 2.0)).unwrap();
        handler.flush(&flush_options()).await;

        let mut buf = [0u8; 2048];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), receiver.recv_from(&mut buf))
            .await
            .expect("datagram must arrive")
            .unwrap();
        assert_eq!(&buf[..len], b"a:1|c|#env:p\nb:2|c|#env:p\n");
    }

    #[tokio::test]
    async fn missing_endpoint_is_a_noop() {
        let handler = StatsdHandlerBuilder::new("", 0).build().unwrap();
        handler.serialize_reading(&reading("req", MetricType::Counter, 7.0)).unwrap();
        // No socket, no error: the flush just discards.
        handler.flush(&flush_options()).await;
    }

    #[tokio::test]
    async fn endpoint_swap_invalidates_the_cache() {
        let first = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let second = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();

        let handler = StatsdHandlerBuilder::new("127.0.0.1", first.local_addr().unwrap().port())
            .build()
            .unwrap();

        handler.serialize_reading(&reading("a", MetricType::Counter, 1.0)).unwrap();
        handler.flush(&flush_options()).await;

        handler.backend().set_endpoint("127.0.0.1", second.local_addr().unwrap().port());
        handler.serialize_reading(&reading("b", MetricType::Counter, 2.0)).unwrap();
        handler.flush(&flush_options()).await;

        let mut buf = [0u8; 128];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), first.recv_from(&mut buf))
            .await
            .expect("first endpoint must receive the first flush")
            .unwrap();
        assert_eq!(&buf[..len], b"a:1|c|#env:p\n");

        let (len, _) = tokio::time::timeout(Duration::from_secs(5), second.recv_from(&mut buf))
            .await
            .expect("second endpoint must receive the second flush")
            .unwrap();
        assert_eq!(&buf[..len], b"b:2|c|#env:p\n");
    }

    #[tokio::test]
    async fn metadata_is_dropped() {
        let handler = StatsdHandlerBuilder::new("127.0.0.1", 8125).build().unwrap();
        assert_eq!(handler.backend().slot_for(PayloadType::Metadata), None);
    }

    #[test]
    fn oversized_configuration_is_rejected() {
        let err = StatsdHandlerBuilder::new("127.0.0.1", 8125).max_payload_size(70_000);
        assert!(err.is_err());
    }
}
