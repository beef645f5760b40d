//! Shared HTTP plumbing for the JSON backends.

use std::{io::Write as _, sync::Arc};

use flate2::{write::GzEncoder, Compression};
use http_body_util::{BodyExt, Collected, Full};
use hyper::{
    body::Bytes,
    header::{HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE},
    Method, Request, Uri,
};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use parking_lot::RwLock;

use packhorse::TransportError;

type PooledClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

/// A lazily-built hyper client shared by every request a handler makes.
///
/// The client is created on the first request and reused for the life of
/// the handler.
pub(crate) struct HttpClient {
    inner: RwLock<Option<Arc<PooledClient>>>,
}

impl HttpClient {
    pub fn new() -> Self {
        HttpClient { inner: RwLock::new(None) }
    }

    fn get(&self) -> Result<Arc<PooledClient>, TransportError> {
        if let Some(client) = self.inner.read().as_ref() {
            return Ok(Arc::clone(client));
        }

        let mut slot = self.inner.write();
        if let Some(client) = slot.as_ref() {
            return Ok(Arc::clone(client));
        }

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| TransportError::Request {
                message: format!("no native root CA certificates found: {e}"),
            })?
            .https_or_http()
            .enable_http1()
            .build();
        let client: PooledClient = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(std::time::Duration::from_secs(30))
            .build(https);

        let client = Arc::new(client);
        *slot = Some(Arc::clone(&client));
        Ok(client)
    }

    /// Sends `preamble ++ payload ++ postamble` as a JSON request body,
    /// gzipped when requested, and maps any non-success response into a
    /// [`TransportError`] carrying the status and a best-effort body.
    pub async fn send(
        &self,
        method: Method,
        uri: Uri,
        headers: &[(HeaderName, HeaderValue)],
        gzip: bool,
        preamble: &[u8],
        payload: &[u8],
        postamble: &[u8],
    ) -> Result<(), TransportError> {
        let client = self.get()?;
        let body = assemble_body(preamble, payload, postamble, gzip)?;

        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if gzip {
            builder = builder.header(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        }
        for (name, value) in headers {
            builder = builder.header(name.clone(), value.clone());
        }

        let request = builder
            .body(Full::from(body))
            .map_err(|e| TransportError::Request { message: e.to_string() })?;

        let response = client
            .request(request)
            .await
            .map_err(|e| TransportError::Request { message: e.to_string() })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map(Collected::to_bytes)
            .map_err(|_| ())
            .and_then(|b| String::from_utf8(b[..].to_vec()).map_err(|_| ()))
            .unwrap_or_else(|()| String::from("<failed to read response body>"));

        Err(TransportError::Http { status: status.as_u16(), body })
    }
}

fn assemble_body(
    preamble: &[u8],
    payload: &[u8],
    postamble: &[u8],
    gzip: bool,
) -> Result<Bytes, TransportError> {
    let total = preamble.len() + payload.len() + postamble.len();
    if !gzip {
        let mut body = Vec::with_capacity(total);
        body.extend_from_slice(preamble);
        body.extend_from_slice(payload);
        body.extend_from_slice(postamble);
        return Ok(Bytes::from(body));
    }

    let mut encoder = GzEncoder::new(Vec::with_capacity(total / 4), Compression::default());
    encoder
        .write_all(preamble)
        .and_then(|()| encoder.write_all(payload))
        .and_then(|()| encoder.write_all(postamble))
        .map_err(|e| TransportError::Request { message: e.to_string() })?;
    let compressed =
        encoder.finish().map_err(|e| TransportError::Request { message: e.to_string() })?;
    Ok(Bytes::from(compressed))
}

#[cfg(test)]
mod tests {
    use std::io::Read as _;

    use flate2::read::GzDecoder;

    use super::assemble_body;

    #[test]
    fn plain_body_is_concatenated() {
        let body = assemble_body(b"[", b"{\"a\":1},{\"b\":2}", b"]", false).unwrap();
        assert_eq!(&body[..], b"[{\"a\":1},{\"b\":2}]");
    }

    #[test]
    fn gzip_body_round_trips() {
        let body = assemble_body(b"[", b"{\"a\":1}", b"]", true).unwrap();

        let mut decoder = GzDecoder::new(&body[..]);
        let mut decompressed = String::new();
        decoder.read_to_string(&mut decompressed).unwrap();
        assert_eq!(decompressed, "[{\"a\":1}]");
    }
}
