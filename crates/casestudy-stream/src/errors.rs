use crate::snapshot::SessionStatus;

/// Errors returned by a transport before they are normalized into a
/// session failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Connection could not be established (network, DNS, TLS).
    #[error("transport open failed: {message}")]
    Open { message: String },
    /// Backend answered the open request with a non-success status.
    #[error("backend returned status {status_code}: {message}")]
    Status { status_code: u16, message: String },
    /// The incremental body failed after it started flowing.
    #[error("transport I/O error: {message}")]
    Io { message: String },
}

impl TransportError {
    /// Creates an open-time connection error.
    pub fn open(message: impl Into<String>) -> Self {
        Self::Open {
            message: message.into(),
        }
    }

    /// Creates an error for a non-success response status.
    pub fn status(status_code: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status_code,
            message: message.into(),
        }
    }

    /// Creates a mid-stream I/O error.
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Returns the human-readable message for this error.
    pub fn message(&self) -> &str {
        match self {
            Self::Open { message } | Self::Status { message, .. } | Self::Io { message } => {
                message
            }
        }
    }
}

/// A single frame that could not be decoded into a `StreamEvent`.
///
/// The raw frame text is kept so it can be logged for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Frame body is not valid JSON.
    #[error("malformed frame JSON: {reason}")]
    Json { raw: String, reason: String },
    /// Frame is JSON but not an object, or a known event is missing a field.
    #[error("invalid frame shape: {reason}")]
    Shape { raw: String, reason: String },
}

impl ParseError {
    /// Returns the offending raw frame text.
    pub fn raw(&self) -> &str {
        match self {
            Self::Json { raw, .. } | Self::Shape { raw, .. } => raw,
        }
    }
}

/// Terminal session failure recorded in the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionFailure {
    /// The transport could not be opened.
    #[error("could not connect to generation backend: {message}")]
    TransportOpen { message: String },
    /// The transport failed while streaming.
    #[error("generation stream failed: {message}")]
    Transport { message: String },
    /// The backend sent a non-recoverable error event; message is verbatim.
    #[error("{message}")]
    Upstream { message: String },
    /// No frame arrived within the inactivity window.
    #[error("no data received for {seconds}s")]
    Timeout { seconds: u64 },
    /// A frame failed to decode while strict parsing was enabled.
    #[error("could not decode frame: {message}")]
    Parse { message: String },
    /// The stream ended before the backend signalled completion.
    #[error("stream ended before generation finished")]
    Disconnected,
}

/// Top-level error type for the public session API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Operation is not allowed in the current status (programmer error).
    #[error("invalid state: cannot {operation} while {status}")]
    InvalidState {
        operation: &'static str,
        status: SessionStatus,
    },
    /// Invalid client or transport configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Invalid generation request.
    #[error("validation error: {0}")]
    Validation(String),
    /// The session reached `Failed`.
    #[error(transparent)]
    Failed(SessionFailure),
    /// The session reached `Cancelled`.
    #[error("cancelled")]
    Cancelled,
}

impl SessionError {
    pub(crate) fn invalid_state(operation: &'static str, status: SessionStatus) -> Self {
        Self::InvalidState { operation, status }
    }
}

impl From<SessionFailure> for SessionError {
    fn from(value: SessionFailure) -> Self {
        SessionError::Failed(value)
    }
}

pub(crate) fn failure_from_transport_error(err: &TransportError, opening: bool) -> SessionFailure {
    match err {
        TransportError::Open { message } => SessionFailure::TransportOpen {
            message: message.clone(),
        },
        TransportError::Status {
            status_code,
            message,
        } => SessionFailure::TransportOpen {
            message: format!("status {status_code}: {message}"),
        },
        TransportError::Io { message } if opening => SessionFailure::TransportOpen {
            message: message.clone(),
        },
        TransportError::Io { message } => SessionFailure::Transport {
            message: message.clone(),
        },
    }
}
