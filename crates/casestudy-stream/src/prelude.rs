//! Common imports for consumers of the session API.
pub use crate::{
    ConsumerView, GenerationController, GenerationRequest, ReplayTransport, SessionConfig,
    SessionConsumer, SessionError, SessionFailure, SessionSnapshot, SessionStatus, StreamEvent,
    StreamingSession, Subscription, TemplateType, TransportFactory,
};
