//! Handler for Bosun / OpenTSDB relays.

use std::collections::HashMap;

use async_trait::async_trait;
use hyper::{Method, Uri};
use parking_lot::Mutex;

use packhorse::{
    handler::{BufferedHandler, BufferedHandlerConfig, HandlerBackend},
    Metadata, MetricReading, MetricType, PayloadType, SerializeError, TagSet, TransportError,
};

use crate::{
    client::HttpClient,
    json::{trim_trailing, write_number, write_raw_string, write_tags_object},
    BuildError,
};

// Bosun rejects datapoints outside [2000-01-01, 2250-01-01] UTC.
const EPOCH_MIN: i64 = 946_684_800;
const EPOCH_MAX: i64 = 8_835_955_200;

/// A handler shipping readings to a Bosun relay.
pub type BosunHandler = BufferedHandler<BosunBackend>;

/// Builder for a [`BosunHandler`].
pub struct BosunHandlerBuilder {
    base_url: String,
    enable_external_counters: bool,
    gzip: bool,
    config: BufferedHandlerConfig,
}

impl BosunHandlerBuilder {
    /// Creates a builder targeting `base_url` (e.g. `http://bosun:8070`).
    pub fn new(base_url: impl Into<String>) -> Self {
        BosunHandlerBuilder {
            base_url: base_url.into(),
            enable_external_counters: true,
            gzip: true,
            config: BufferedHandlerConfig::default(),
        }
    }

    /// Enables or disables the external (cumulative) counter endpoint.
    ///
    /// When disabled, cumulative counter readings and their metadata are
    /// dropped entirely.
    #[must_use]
    pub fn enable_external_counters(mut self, enabled: bool) -> Self {
        self.enable_external_counters = enabled;
        self
    }

    /// Enables or disables gzip for reading payloads. Defaults to on.
    /// Metadata is never gzipped.
    #[must_use]
    pub fn gzip(mut self, enabled: bool) -> Self {
        self.gzip = enabled;
        self
    }

    /// Overrides the buffer limits.
    #[must_use]
    pub fn buffer_config(mut self, config: BufferedHandlerConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the handler.
    pub fn build(self) -> Result<BosunHandler, BuildError> {
        let base = self.base_url.trim_end_matches('/');
        let backend = BosunBackend {
            client: HttpClient::new(),
            put_uri: parse_uri(&format!("{base}/api/put"))?,
            count_uri: parse_uri(&format!("{base}/api/count"))?,
            metadata_uri: parse_uri(&format!("{base}/api/metadata/put"))?,
            gzip: self.gzip,
            enable_external_counters: self.enable_external_counters,
            totals: Mutex::new(HashMap::new()),
        };
        Ok(BufferedHandler::new(backend, self.config))
    }
}

fn parse_uri(raw: &str) -> Result<Uri, BuildError> {
    raw.parse::<Uri>().map_err(|e| BuildError::InvalidUrl { reason: format!("{raw}: {e}") })
}

/// The Bosun-specific serialization and transport rules.
///
/// Counter and gauge readings share the `/api/put` endpoint and buffer;
/// cumulative counters go to `/api/count` carrying a handler-maintained
/// running total per series (the relay re-adds the `host` tag, so it is
/// stripped here); metadata goes to `/api/metadata/put` uncompressed.
pub struct BosunBackend {
    client: HttpClient,
    put_uri: Uri,
    count_uri: Uri,
    metadata_uri: Uri,
    gzip: bool,
    enable_external_counters: bool,
    totals: Mutex<HashMap<(String, TagSet), i64>>,
}

impl BosunBackend {
    fn running_total(&self, reading: &MetricReading) -> i64 {
        let key = (reading.name_with_suffix().to_string(), reading.tags().clone());
        let mut totals = self.totals.lock();
        let total = totals.entry(key).or_insert(0);
        *total += reading.value() as i64;
        *total
    }
}

#[async_trait]
impl HandlerBackend for BosunBackend {
    fn name(&self) -> &'static str {
        "bosun"
    }

    fn buffer_slots(&self) -> Vec<PayloadType> {
        if self.enable_external_counters {
            vec![PayloadType::Counter, PayloadType::CumulativeCounter, PayloadType::Metadata]
        } else {
            vec![PayloadType::Counter, PayloadType::Metadata]
        }
    }

    fn slot_for(&self, payload_type: PayloadType) -> Option<usize> {
        match payload_type {
            PayloadType::Counter | PayloadType::Gauge => Some(0),
            PayloadType::CumulativeCounter => self.enable_external_counters.then_some(1),
            PayloadType::Metadata => Some(if self.enable_external_counters { 2 } else { 1 }),
        }
    }

    fn serialize_reading(
        &self,
        buf: &mut Vec<u8>,
        reading: &MetricReading,
    ) -> Result<(), SerializeError> {
        if !reading.value().is_finite() {
            return Err(SerializeError::NonFiniteValue {
                name: reading.name_with_suffix().to_string(),
            });
        }

        let epoch = reading.timestamp().timestamp();
        if !(EPOCH_MIN..=EPOCH_MAX).contains(&epoch) {
            return Err(SerializeError::TimestampOutOfRange {
                name: reading.name_with_suffix().to_string(),
                timestamp: reading.timestamp(),
            });
        }

        let (value, tags) = if reading.metric_type() == MetricType::CumulativeCounter {
            (self.running_total(reading) as f64, reading.tags().without("host"))
        } else {
            (reading.value(), reading.tags().clone())
        };

        buf.extend_from_slice(b"{\"metric\":");
        write_raw_string(buf, reading.name_with_suffix());
        buf.extend_from_slice(b",\"value\":");
        write_number(buf, value);
        buf.extend_from_slice(b",\"tags\":");
        write_tags_object(buf, &tags);
        buf.extend_from_slice(b",\"timestamp\":");
        let mut writer = itoa::Buffer::new();
        buf.extend_from_slice(writer.format(epoch).as_bytes());
        buf.extend_from_slice(b"},");

        Ok(())
    }

    fn serialize_metadata(
        &self,
        buf: &mut Vec<u8>,
        metadata: &[Metadata],
    ) -> Result<(), SerializeError> {
        for entry in metadata {
            if entry.metric_type == MetricType::CumulativeCounter && !self.enable_external_counters
            {
                continue;
            }

            let tags: serde_json::Map<String, serde_json::Value> = entry
                .tags
                .iter()
                .map(|(k, v)| (k.to_string(), serde_json::Value::from(v)))
                .collect();
            let document = serde_json::json!({
                "metric": entry.name,
                "name": entry.kind.as_str(),
                "tags": tags,
                "value": entry.value,
            });
            // Writing into a Vec cannot fail.
            let _ = serde_json::to_writer(&mut *buf, &document);
            buf.push(b',');
        }
        Ok(())
    }

    fn prepare_payload<'a>(&self, _payload_type: PayloadType, chunk: &'a [u8]) -> &'a [u8] {
        trim_trailing(chunk, b',')
    }

    async fn send(&self, payload_type: PayloadType, payload: &[u8]) -> Result<(), TransportError> {
        let (uri, gzip) = match payload_type {
            PayloadType::Counter | PayloadType::Gauge => (&self.put_uri, self.gzip),
            PayloadType::CumulativeCounter => (&self.count_uri, self.gzip),
            PayloadType::Metadata => (&self.metadata_uri, false),
        };

        self.client.send(Method::POST, uri.clone(), &[], gzip, b"[", payload, b"]").await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};

    use packhorse::{
        handler::HandlerBackend, Metadata, MetadataKind, MetricReading, MetricType, PayloadType,
        SerializeError, TagSet,
    };

    use super::{BosunBackend, BosunHandlerBuilder};

    fn backend(enable_external_counters: bool) -> BosunBackend {
        use super::{parse_uri, HttpClient, Mutex};
        use std::collections::HashMap;

        BosunBackend {
            client: HttpClient::new(),
            put_uri: parse_uri("http://bosun:8070/api/put").unwrap(),
            count_uri: parse_uri("http://bosun:8070/api/count").unwrap(),
            metadata_uri: parse_uri("http://bosun:8070/api/metadata/put").unwrap(),
            gzip: false,
            enable_external_counters,
            totals: Mutex::new(HashMap::new()),
        }
    }

    #[test]
    fn builder_accepts_trailing_slash() {
        let handler = BosunHandlerBuilder::new("http://bosun:8070/").build().unwrap();
        assert_eq!(handler.backend().buffer_slots().len(), 3);
    }

    fn tags(pairs: &[(&str, &str)]) -> TagSet {
        let local: Vec<_> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        TagSet::merge("test", &[], &local, None, None).unwrap()
    }

    fn reading(name: &str, metric_type: MetricType, value: f64) -> MetricReading {
        MetricReading::new(
            Arc::from(name),
            metric_type,
            value,
            tags(&[("host", "x"), ("env", "prod")]),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        )
    }

    fn serialize(backend: &BosunBackend, reading: &MetricReading) -> String {
        let mut buf = Vec::new();
        backend.serialize_reading(&mut buf, reading).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn reading_wire_format() {
        let backend = backend(true);
        let json = serialize(&backend, &reading("requests", MetricType::Counter, 11.0));
        assert_eq!(
            json,
            "{\"metric\":\"requests\",\"value\":11,\
             \"tags\":{\"env\":\"prod\",\"host\":\"x\"},\"timestamp\":1704067200},"
        );
    }

    #[test]
    fn cumulative_counter_reports_running_total_and_strips_host() {
        let backend = backend(true);
        let first = serialize(&backend, &reading("ext", MetricType::CumulativeCounter, 3.0));
        assert!(first.contains("\"value\":3"), "unexpected body: {first}");
        assert!(!first.contains("host"), "host tag must be stripped: {first}");

        let second = serialize(&backend, &reading("ext", MetricType::CumulativeCounter, 2.0));
        assert!(second.contains("\"value\":5"), "totals must accumulate: {second}");

        // A different series has its own total.
        let other = MetricReading::new(
            Arc::from("ext"),
            MetricType::CumulativeCounter,
            7.0,
            tags(&[("host", "y"), ("env", "dev")]),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        );
        let other_body = serialize(&backend, &other);
        assert!(other_body.contains("\"value\":7"), "unexpected body: {other_body}");
    }

    #[test]
    fn timestamps_outside_the_accepted_range_are_rejected() {
        let backend = backend(true);

        let too_old = MetricReading::new(
            Arc::from("old"),
            MetricType::Gauge,
            1.0,
            tags(&[("host", "x")]),
            Utc.with_ymd_and_hms(1999, 12, 31, 23, 59, 59).unwrap(),
        );
        let mut buf = Vec::new();
        let err = backend.serialize_reading(&mut buf, &too_old).unwrap_err();
        assert!(matches!(err, SerializeError::TimestampOutOfRange { .. }));

        let too_far = MetricReading::new(
            Arc::from("far"),
            MetricType::Gauge,
            1.0,
            tags(&[("host", "x")]),
            Utc.with_ymd_and_hms(2250, 1, 1, 0, 0, 1).unwrap(),
        );
        let err = backend.serialize_reading(&mut buf, &too_far).unwrap_err();
        assert!(matches!(err, SerializeError::TimestampOutOfRange { .. }));

        let boundary = MetricReading::new(
            Arc::from("edge"),
            MetricType::Gauge,
            1.0,
            tags(&[("host", "x")]),
            Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap(),
        );
        assert!(backend.serialize_reading(&mut buf, &boundary).is_ok());
    }

    #[test]
    fn cumulative_routing_follows_the_external_counter_switch() {
        let enabled = backend(true);
        assert_eq!(enabled.slot_for(PayloadType::CumulativeCounter), Some(1));
        assert_eq!(enabled.slot_for(PayloadType::Metadata), Some(2));

        let disabled = backend(false);
        assert_eq!(disabled.slot_for(PayloadType::CumulativeCounter), None);
        assert_eq!(disabled.slot_for(PayloadType::Metadata), Some(1));
        assert_eq!(disabled.slot_for(PayloadType::Counter), Some(0));
    }

    #[test]
    fn disabled_external_counters_drop_cumulative_metadata() {
        let entries = vec![
            Metadata {
                name: "requests".into(),
                kind: MetadataKind::Rate,
                tags: tags(&[("host", "x")]),
                value: "counter".into(),
                metric_type: MetricType::Counter,
            },
            Metadata {
                name: "ext".into(),
                kind: MetadataKind::Rate,
                tags: tags(&[("host", "x")]),
                value: "counter".into(),
                metric_type: MetricType::CumulativeCounter,
            },
        ];

        let disabled = backend(false);
        let mut buf = Vec::new();
        disabled.serialize_metadata(&mut buf, &entries).unwrap();
        let body = String::from_utf8(buf).unwrap();
        assert!(body.contains("\"metric\":\"requests\""));
        assert!(!body.contains("\"metric\":\"ext\""));

        let enabled = backend(true);
        let mut buf = Vec::new();
        enabled.serialize_metadata(&mut buf, &entries).unwrap();
        let body = String::from_utf8(buf).unwrap();
        assert!(body.contains("\"metric\":\"ext\""));
    }

    #[test]
    fn prepare_trims_the_trailing_comma() {
        let backend = backend(true);
        let trimmed = backend.prepare_payload(PayloadType::Counter, b"{\"a\":1},{\"b\":2},");
        assert_eq!(trimmed, b"{\"a\":1},{\"b\":2}");
    }
}
