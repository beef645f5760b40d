//! Handler for the DataDog HTTP API.

use std::collections::HashMap;

use async_trait::async_trait;
use hyper::{Method, Uri};
use parking_lot::Mutex;
use tracing::debug;

use packhorse::{
    handler::{BufferedHandler, BufferedHandlerConfig, HandlerBackend},
    Metadata, MetadataKind, MetricReading, MetricType, PayloadType, SerializeError,
    TransportError,
};

use crate::{
    client::HttpClient,
    json::{trim_trailing, write_number, write_raw_string, write_tags_array},
    BuildError,
};

// Unit strings the DataDog metadata API accepts; anything else is dropped
// from unit metadata rather than failing the whole document.
const ALLOWED_UNITS: &[&str] = &[
    "bit", "byte", "connection", "count", "day", "error", "event", "file", "fraction", "host",
    "hour", "item", "message", "microsecond", "millisecond", "minute", "nanosecond", "node",
    "occurrence", "operation", "packet", "page", "payload", "percent", "process", "query", "read",
    "record", "request", "row", "second", "task", "thread", "time", "unit", "week", "write",
];

/// A handler shipping readings to DataDog over HTTP.
pub type DatadogHandler = BufferedHandler<DatadogBackend>;

/// Builder for a [`DatadogHandler`].
pub struct DatadogHandlerBuilder {
    base_url: String,
    api_key: String,
    application_key: Option<String>,
    host: Option<String>,
    gzip: bool,
    config: BufferedHandlerConfig,
}

impl DatadogHandlerBuilder {
    /// Creates a builder targeting `base_url` (e.g.
    /// `https://app.datadoghq.com`) with the given API key.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        DatadogHandlerBuilder {
            base_url: base_url.into(),
            api_key: api_key.into(),
            application_key: None,
            host: None,
            gzip: true,
            config: BufferedHandlerConfig::default(),
        }
    }

    /// Sets the application key sent with metadata requests.
    #[must_use]
    pub fn application_key(mut self, key: impl Into<String>) -> Self {
        self.application_key = Some(key.into());
        self
    }

    /// Sets the `host` field injected into every series.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Enables or disables gzip for series payloads. Defaults to on.
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
    pub fn build(self) -> Result<DatadogHandler, BuildError> {
        if self.api_key.is_empty() {
            return Err(BuildError::InvalidConfiguration {
                reason: "DataDog requires an API key".to_string(),
            });
        }

        let base = self.base_url.trim_end_matches('/');
        let mut auth_query = format!("api_key={}", self.api_key);
        if let Some(app_key) = &self.application_key {
            auth_query.push_str("&application_key=");
            auth_query.push_str(app_key);
        }

        let series_uri = format!("{base}/api/v1/series?{auth_query}")
            .parse::<Uri>()
            .map_err(|e| BuildError::InvalidUrl { reason: e.to_string() })?;

        Ok(BufferedHandler::new(
            DatadogBackend {
                client: HttpClient::new(),
                series_uri,
                metadata_base: format!("{base}/api/v1/metrics"),
                auth_query,
                host: self.host,
                gzip: self.gzip,
                pending_metadata: Mutex::new(Vec::new()),
            },
            self.config,
        ))
    }
}

/// The DataDog-specific serialization and transport rules.
///
/// Counters, cumulative counters, and gauges share one series endpoint and
/// therefore one buffer; the item ceiling applies to their combined count.
/// Metadata cannot be batched on this API: `serialize_metadata` records the
/// per-metric documents on the side and writes a single sentinel byte into
/// the metadata buffer so the flush cycle has something to drain, and the
/// real requests are issued one `PUT` per metric from `send`.
pub struct DatadogBackend {
    client: HttpClient,
    series_uri: Uri,
    metadata_base: String,
    auth_query: String,
    host: Option<String>,
    gzip: bool,
    pending_metadata: Mutex<Vec<(String, serde_json::Value)>>,
}

impl DatadogBackend {
    fn metadata_documents(&self, metadata: &[Metadata]) -> Vec<(String, serde_json::Value)> {
        let mut by_name: HashMap<&str, serde_json::Map<String, serde_json::Value>> =
            HashMap::new();
        for entry in metadata {
            let document = by_name.entry(entry.name.as_str()).or_default();
            match entry.kind {
                MetadataKind::Rate => {
                    let kind = if entry.value == "counter" { "count" } else { "gauge" };
                    document.insert("type".to_string(), kind.into());
                }
                MetadataKind::Description => {
                    document.insert("description".to_string(), entry.value.clone().into());
                }
                MetadataKind::Unit => {
                    if ALLOWED_UNITS.contains(&entry.value.as_str()) {
                        document.insert("unit".to_string(), entry.value.clone().into());
                    } else {
                        debug!(
                            metric_name = entry.name,
                            unit = entry.value,
                            "Dropping unit not accepted by DataDog."
                        );
                    }
                }
            }
        }

        by_name
            .into_iter()
            .map(|(name, document)| (name.to_string(), serde_json::Value::Object(document)))
            .collect()
    }
}

#[async_trait]
impl HandlerBackend for DatadogBackend {
    fn name(&self) -> &'static str {
        "datadog"
    }

    fn buffer_slots(&self) -> Vec<PayloadType> {
        vec![PayloadType::Counter, PayloadType::Metadata]
    }

    fn slot_for(&self, payload_type: PayloadType) -> Option<usize> {
        match payload_type {
            PayloadType::Counter | PayloadType::CumulativeCounter | PayloadType::Gauge => Some(0),
            PayloadType::Metadata => Some(1),
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

        let kind = match reading.metric_type() {
            MetricType::Counter | MetricType::CumulativeCounter => "count",
            MetricType::Gauge => "gauge",
        };

        buf.extend_from_slice(b"{\"metric\":");
        write_raw_string(buf, reading.name_with_suffix());
        buf.extend_from_slice(b",\"points\":[[");
        let mut writer = itoa::Buffer::new();
        buf.extend_from_slice(writer.format(reading.timestamp().timestamp()).as_bytes());
        buf.push(b',');
        write_number(buf, reading.value());
        buf.extend_from_slice(b"]],\"type\":");
        write_raw_string(buf, kind);
        if let Some(host) = &self.host {
            buf.extend_from_slice(b",\"host\":");
            write_raw_string(buf, host);
        }
        buf.extend_from_slice(b",\"tags\":");
        write_tags_array(buf, reading.tags());
        buf.extend_from_slice(b"},");

        Ok(())
    }

    fn serialize_metadata(
        &self,
        buf: &mut Vec<u8>,
        metadata: &[Metadata],
    ) -> Result<(), SerializeError> {
        let documents = self.metadata_documents(metadata);
        if documents.is_empty() {
            return Ok(());
        }

        self.pending_metadata.lock().extend(documents);
        // The buffer only needs a sentinel; the real payloads are built in
        // `send` from the pending list.
        buf.push(b'+');
        Ok(())
    }

    fn prepare_payload<'a>(&self, payload_type: PayloadType, chunk: &'a [u8]) -> &'a [u8] {
        if payload_type == PayloadType::Metadata {
            chunk
        } else {
            trim_trailing(chunk, b',')
        }
    }

    async fn send(&self, payload_type: PayloadType, payload: &[u8]) -> Result<(), TransportError> {
        if payload_type != PayloadType::Metadata {
            return self
                .client
                .send(
                    Method::POST,
                    self.series_uri.clone(),
                    &[],
                    self.gzip,
                    b"{\"series\":[",
                    payload,
                    b"]}",
                )
                .await;
        }

        // One request per metric; the pending list is only cleared once every
        // document went through, so a retry re-sends the idempotent PUTs.
        let documents = self.pending_metadata.lock().clone();
        for (name, document) in &documents {
            let uri = format!("{}/{}?{}", self.metadata_base, name, self.auth_query)
                .parse::<Uri>()
                .map_err(|e| TransportError::Request { message: e.to_string() })?;
            let body = serde_json::to_vec(document)
                .map_err(|e| TransportError::Request { message: e.to_string() })?;
            self.client.send(Method::PUT, uri, &[], false, b"", &body, b"").await?;
        }

        self.pending_metadata.lock().clear();
        Ok(())
    }
}
