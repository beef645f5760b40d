//! Handler for the SignalFx datapoint API.

use async_trait::async_trait;
use hyper::{
    header::{HeaderName, HeaderValue},
    Method, Uri,
};

use packhorse::{
    handler::{BufferedHandler, BufferedHandlerConfig, HandlerBackend},
    Metadata, MetricReading, PayloadType, SerializeError, TransportError,
};

use crate::{
    client::HttpClient,
    json::{trim_trailing, write_number, write_raw_string, write_tags_object},
    BuildError,
};

static SF_TOKEN_HEADER: HeaderName = HeaderName::from_static("x-sf-token");

/// A handler shipping readings to SignalFx.
pub type SignalFxHandler = BufferedHandler<SignalFxBackend>;

/// Builder for a [`SignalFxHandler`].
pub struct SignalFxHandlerBuilder {
    base_url: String,
    access_token: Option<String>,
    gzip: bool,
    config: BufferedHandlerConfig,
}

impl SignalFxHandlerBuilder {
    /// Creates a builder targeting `base_url` (e.g.
    /// `https://ingest.signalfx.com`).
    pub fn new(base_url: impl Into<String>) -> Self {
        SignalFxHandlerBuilder {
            base_url: base_url.into(),
            access_token: None,
            gzip: true,
            config: BufferedHandlerConfig::default(),
        }
    }

    /// Sets the access token sent in the `X-SF-TOKEN` header.
    #[must_use]
    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Enables or disables gzip. Defaults to on.
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
    pub fn build(self) -> Result<SignalFxHandler, BuildError> {
        let base = self.base_url.trim_end_matches('/');
        let datapoint_uri = format!("{base}/v2/datapoint")
            .parse::<Uri>()
            .map_err(|e| BuildError::InvalidUrl { reason: e.to_string() })?;

        let token = self
            .access_token
            .map(|token| {
                HeaderValue::from_str(&token).map_err(|e| BuildError::InvalidConfiguration {
                    reason: format!("access token is not a valid header value: {e}"),
                })
            })
            .transpose()?;

        Ok(BufferedHandler::new(
            SignalFxBackend { client: HttpClient::new(), datapoint_uri, token, gzip: self.gzip },
            self.config,
        ))
    }
}

/// The SignalFx-specific serialization and transport rules.
///
/// All three reading classes go to the one datapoint endpoint but carry
/// class-specific preambles (`{"counter":[`, `{"cumulative_counter":[`,
/// `{"gauge":[`), so each keeps its own buffer. SignalFx has no metadata
/// endpoint; metadata is dropped.
pub struct SignalFxBackend {
    client: HttpClient,
    datapoint_uri: Uri,
    token: Option<HeaderValue>,
    gzip: bool,
}

impl SignalFxBackend {
    fn preamble(payload_type: PayloadType) -> &'static [u8] {
        match payload_type {
            PayloadType::Counter => b"{\"counter\":[",
            PayloadType::CumulativeCounter => b"{\"cumulative_counter\":[",
            PayloadType::Gauge => b"{\"gauge\":[",
            PayloadType::Metadata => b"",
        }
    }
}

#[async_trait]
impl HandlerBackend for SignalFxBackend {
    fn name(&self) -> &'static str {
        "signalfx"
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
        if !reading.value().is_finite() {
            return Err(SerializeError::NonFiniteValue {
                name: reading.name_with_suffix().to_string(),
            });
        }

        buf.extend_from_slice(b"{\"metric\":");
        write_raw_string(buf, reading.name_with_suffix());
        buf.extend_from_slice(b",\"value\":");
        write_number(buf, reading.value());
        buf.extend_from_slice(b",\"timestamp\":");
        let mut writer = itoa::Buffer::new();
        buf.extend_from_slice(writer.format(reading.timestamp().timestamp_millis()).as_bytes());
        buf.extend_from_slice(b",\"dimensions\":");
        write_tags_object(buf, reading.tags());
        buf.extend_from_slice(b"},");

        Ok(())
    }

    fn serialize_metadata(
        &self,
        _buf: &mut Vec<u8>,
        _metadata: &[Metadata],
    ) -> Result<(), SerializeError> {
        Ok(())
    }

    fn prepare_payload<'a>(&self, _payload_type: PayloadType, chunk: &'a [u8]) -> &'a [u8] {
        trim_trailing(chunk, b',')
    }

    async fn send(&self, payload_type: PayloadType, payload: &[u8]) -> Result<(), TransportError> {
        let mut headers = Vec::new();
        if let Some(token) = &self.token {
            headers.push((SF_TOKEN_HEADER.clone(), token.clone()));
        }

        self.client
            .send(
                Method::POST,
                self.datapoint_uri.clone(),
                &headers,
                self.gzip,
                Self::preamble(payload_type),
                payload,
                b"]}",
            )
            .await
    }
}
