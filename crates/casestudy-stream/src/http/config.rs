use std::time::Duration;

use crate::errors::SessionError;

const DEFAULT_STREAM_PATH: &str = "/case-study/generate/stream";

/// Connection settings for [`HttpTransport`](super::HttpTransport).
#[derive(Clone, Debug)]
pub struct HttpTransportConfig {
    /// Backend origin, e.g. `http://localhost:8000`.
    pub base_url: String,
    /// Bearer token sent as `Authorization`, if the backend requires one.
    pub api_token: Option<String>,
    /// Bounds connection setup only; the body is governed by the session's
    /// inactivity window.
    pub connect_timeout: Duration,
    /// Path of the streaming endpoint, appended to `base_url`.
    pub stream_path: String,
    /// HTTP method of the streaming endpoint. The backend serves it as a
    /// `GET` that reads the request from the JSON body.
    pub method: reqwest::Method,
}

impl HttpTransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_token: None,
            connect_timeout: Duration::from_secs(30),
            stream_path: DEFAULT_STREAM_PATH.to_string(),
            method: reqwest::Method::GET,
        }
    }

    /// Builds a config from `CASESTUDY_API_URL` and optional `CASESTUDY_API_TOKEN`.
    pub fn from_env() -> Result<Self, SessionError> {
        let base_url = std::env::var("CASESTUDY_API_URL").unwrap_or_default();
        if base_url.trim().is_empty() {
            return Err(SessionError::Config(
                "missing CASESTUDY_API_URL for the HTTP transport".into(),
            ));
        }
        let mut config = Self::new(base_url.trim());
        if let Ok(token) = std::env::var("CASESTUDY_API_TOKEN")
            && !token.trim().is_empty()
        {
            config = config.api_token(token.trim());
        }
        Ok(config)
    }

    pub fn api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn stream_path(mut self, path: impl Into<String>) -> Self {
        self.stream_path = path.into();
        self
    }

    pub fn method(mut self, method: reqwest::Method) -> Self {
        self.method = method;
        self
    }

    pub(crate) fn stream_url(&self) -> String {
        let path = self.stream_path.trim_start_matches('/');
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}
