//! HTTP transport for the case-study generation backend.
//!
//! POSTs the generation request as JSON and hands the response body to the
//! session as a byte stream. Framing follows the response `Content-Type`.
mod adapter;
mod config;

pub use adapter::HttpTransport;
pub use config::HttpTransportConfig;
