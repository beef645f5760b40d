//! HTTP/JSON shipping handlers for [`packhorse`]: Bosun, DataDog, and
//! SignalFx.
//!
//! Each handler specializes the buffered payload engine from the core crate
//! with its backend's endpoints, JSON framing, and auth:
//!
//! ```no_run
//! use std::sync::Arc;
//! use packhorse::{CollectorBuilder, MetricHandler};
//! use packhorse_exporter_http::{BosunHandlerBuilder, DatadogHandlerBuilder};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let bosun = BosunHandlerBuilder::new("http://bosun:8070").build()?;
//! let datadog = DatadogHandlerBuilder::new("https://app.datadoghq.com", "api-key")
//!     .host("web01")
//!     .build()?;
//!
//! let collector = CollectorBuilder::new()
//!     .add_handler(Arc::new(bosun) as Arc<dyn MetricHandler>)
//!     .add_handler(Arc::new(datadog) as Arc<dyn MetricHandler>)
//!     .on_error(|error| eprintln!("metrics pipeline: {error}"))
//!     .build()?;
//! collector.start();
//! # Ok(())
//! # }
//! ```
//!
//! Requests are `POST`s (metadata sometimes `PUT`s) with bodies assembled as
//! `preamble ++ payload ++ postamble`, optionally gzip-compressed. Any
//! non-2xx response surfaces as a transport error carrying the status code
//! and a best-effort copy of the response body, and is retried by the engine
//! under the collector's retry policy.

use thiserror::Error;

mod bosun;
mod client;
mod datadog;
mod json;
mod signalfx;

pub use bosun::{BosunBackend, BosunHandler, BosunHandlerBuilder};
pub use datadog::{DatadogBackend, DatadogHandler, DatadogHandlerBuilder};
pub use signalfx::{SignalFxBackend, SignalFxHandler, SignalFxHandlerBuilder};

/// Errors that could occur while building an HTTP handler.
#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum BuildError {
    /// An endpoint URL could not be parsed.
    #[error("invalid endpoint URL: {reason}")]
    InvalidUrl {
        /// Details about the parse failure.
        reason: String,
    },

    /// A configuration value is unusable.
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Details about the invalid configuration.
        reason: String,
    },
}
