use futures::StreamExt as _;
use tracing::debug;

use crate::errors::{SessionError, TransportError};
use crate::parser::Framing;
use crate::request::GenerationRequest;
use crate::transport::{ByteStream, TransportFactory, TransportHandle};

use super::config::HttpTransportConfig;

const ACCEPT_STREAMING: &str = "text/event-stream, application/x-ndjson";

/// Opens generation streams against the backend over HTTP.
pub struct HttpTransport {
    client: reqwest::Client,
    config: HttpTransportConfig,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self, SessionError> {
        if config.base_url.trim().is_empty() {
            return Err(SessionError::Config(
                "HTTP transport base_url must not be empty".into(),
            ));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| SessionError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Creates a transport using `CASESTUDY_API_URL` and `CASESTUDY_API_TOKEN`.
    pub fn from_env() -> Result<Self, SessionError> {
        Self::new(HttpTransportConfig::from_env()?)
    }
}

#[async_trait::async_trait]
impl TransportFactory for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn open(&self, request: &GenerationRequest) -> Result<TransportHandle, TransportError> {
        let url = self.config.stream_url();
        debug!(%url, method = %self.config.method, project = %request.project_name, template = %request.template_type, "opening generation stream");

        let mut http_req = self
            .client
            .request(self.config.method.clone(), &url)
            .header(reqwest::header::ACCEPT, ACCEPT_STREAMING)
            .json(request);
        if let Some(token) = self.config.api_token.as_deref() {
            http_req = http_req.bearer_auth(token);
        }

        let response = http_req
            .send()
            .await
            .map_err(|e| TransportError::open(format!("request to {url} failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(TransportError::status(status.as_u16(), body));
        }

        let framing = framing_for(
            response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
        );
        debug!(%url, ?framing, "generation stream accepted");

        let body: ByteStream = Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| TransportError::io(e.to_string()))),
        );
        Ok(TransportHandle::new(body, framing))
    }
}

fn framing_for(content_type: Option<&str>) -> Framing {
    match content_type {
        Some(value) if value.trim().to_ascii_lowercase().starts_with("text/event-stream") => {
            Framing::Sse
        }
        _ => Framing::Ndjson,
    }
}
