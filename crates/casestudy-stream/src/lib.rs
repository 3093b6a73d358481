//! Streaming client core for incremental case-study generation.
//!
//! A [`StreamingSession`] opens a transport, decodes frames into
//! [`StreamEvent`]s, folds them into ordered sections, and publishes an
//! immutable [`SessionSnapshot`] after every frame. Consumers render from
//! snapshots only.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use casestudy_stream::http::{HttpTransport, HttpTransportConfig};
//! use casestudy_stream::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), SessionError> {
//! let transport = HttpTransport::new(HttpTransportConfig::new("http://localhost:8000"))?;
//! let session = StreamingSession::new(Arc::new(transport));
//!
//! let _subscription = session.subscribe(|snapshot| {
//!     println!("{} {}%", snapshot.status, snapshot.progress_percent);
//! });
//!
//! let request = GenerationRequest::new(
//!     "Apollo",
//!     "2024-01-01".parse().expect("date"),
//!     "2024-03-31".parse().expect("date"),
//! )
//! .participant("pm@example.com")
//! .keyword("launch");
//! session.start(request)?;
//!
//! let document = session.outcome().await?;
//! println!("{}", document.to_markdown());
//! # Ok(())
//! # }
//! ```

/// Section accumulation over the event stream.
pub mod accumulator;
/// Session configuration.
pub mod config;
/// Consumer contract, render model, and generation controller.
pub mod consumer;
/// Public error types.
pub mod errors;
/// Typed stream events.
pub mod event;
/// HTTP transport against the generation backend.
pub mod http;
/// Tracing subscriber setup.
pub mod observability;
/// Frame decoding and event parsing.
pub mod parser;
/// Common imports for typical usage.
pub mod prelude;
/// Progress estimation.
pub mod progress;
/// Generation request payload.
pub mod request;
/// The streaming session state machine.
pub mod session;
/// Snapshots, statuses, and export.
pub mod snapshot;
mod subscribers;
/// Append-only text shared with snapshots.
pub mod text;
/// Transport seam and the replay transport.
pub mod transport;

pub use accumulator::{ApplyOutcome, Section, SectionAccumulator};
pub use config::SessionConfig;
pub use consumer::{
    CaseStudyDocument, ConsumerView, DocumentSection, DocumentSink, DocumentSinkError,
    GenerationController, SessionConsumer, bind,
};
pub use errors::{ParseError, SessionError, SessionFailure, TransportError};
pub use event::{MetadataMap, StreamEvent};
pub use observability::init_observability;
pub use parser::{Frame, FrameDecoder, Framing, parse, parse_frame};
pub use request::{GenerationRequest, TemplateType};
pub use session::StreamingSession;
pub use snapshot::{SessionSnapshot, SessionStatus};
pub use subscribers::Subscription;
pub use text::SharedText;
pub use transport::{ByteStream, ReplayTransport, TransportFactory, TransportHandle};
