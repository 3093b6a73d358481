use std::time::Duration;

use crate::errors::SessionError;

const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60);

/// Behavior options for a `StreamingSession`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Longest silence tolerated between frames (keepalives count) before the
    /// session fails with a timeout. Also bounds the transport open.
    pub inactivity_timeout: Duration,
    /// Fail the session on the first undecodable frame instead of skipping it.
    pub strict_parsing: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            strict_parsing: false,
        }
    }
}

impl SessionConfig {
    /// Reads overrides from the environment.
    ///
    /// - `CASESTUDY_INACTIVITY_TIMEOUT_SECS`: inactivity window in seconds.
    /// - `CASESTUDY_STRICT_PARSING`: `1`/`true`/`yes`/`on` to fail on bad frames.
    pub fn from_env() -> Result<Self, SessionError> {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("CASESTUDY_INACTIVITY_TIMEOUT_SECS") {
            let secs: u64 = raw.trim().parse().map_err(|_| {
                SessionError::Config(format!(
                    "CASESTUDY_INACTIVITY_TIMEOUT_SECS must be a whole number of seconds, got {raw:?}"
                ))
            })?;
            config = config.inactivity_timeout(Duration::from_secs(secs));
        }
        if let Ok(raw) = std::env::var("CASESTUDY_STRICT_PARSING") {
            config.strict_parsing = crate::observability::parse_bool_env(&raw).unwrap_or(false);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    pub fn strict_parsing(mut self, strict: bool) -> Self {
        self.strict_parsing = strict;
        self
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.inactivity_timeout.is_zero() {
            return Err(SessionError::Config(
                "inactivity_timeout must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}
