use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

/// Open key/value map carried by `Metadata` events.
///
/// Values are left as raw JSON; consumers check for the keys they know.
pub type MetadataMap = BTreeMap<String, serde_json::Value>;

/// Typed representation of one transport frame.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Opens a named section.
    SectionStart {
        section: String,
        timestamp: Option<DateTime<Utc>>,
    },
    /// Text for the innermost open section, or the unsectioned bucket.
    ///
    /// `section` is the backend's hint of where it thinks the text belongs; it
    /// is informational only and never reroutes the text.
    Content {
        text: String,
        section: Option<String>,
    },
    /// Closes a named section.
    SectionEnd {
        section: String,
        timestamp: Option<DateTime<Utc>>,
    },
    /// Out-of-band facts not tied to a section.
    Metadata { entries: MetadataMap },
    /// Backend-reported error.
    Error { message: String, recoverable: bool },
    /// Generation finished.
    Done,
}

impl StreamEvent {
    /// Convenience constructor for a section start without a timestamp.
    pub fn section_start(section: impl Into<String>) -> Self {
        Self::SectionStart {
            section: section.into(),
            timestamp: None,
        }
    }

    /// Convenience constructor for a section end without a timestamp.
    pub fn section_end(section: impl Into<String>) -> Self {
        Self::SectionEnd {
            section: section.into(),
            timestamp: None,
        }
    }

    /// Convenience constructor for a content event with no section hint.
    pub fn content(text: impl Into<String>) -> Self {
        Self::Content {
            text: text.into(),
            section: None,
        }
    }

    /// Convenience constructor for a single-entry metadata event.
    pub fn metadata(key: impl Into<String>, value: serde_json::Value) -> Self {
        let mut entries = MetadataMap::new();
        entries.insert(key.into(), value);
        Self::Metadata { entries }
    }

    /// Short tag used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SectionStart { .. } => "section_start",
            Self::Content { .. } => "content",
            Self::SectionEnd { .. } => "section_end",
            Self::Metadata { .. } => "metadata",
            Self::Error { .. } => "error",
            Self::Done => "done",
        }
    }
}
