use std::fmt;

use crate::accumulator::Section;
use crate::event::MetadataMap;
use crate::text::SharedText;

/// Lifecycle of a streaming session.
///
/// `Idle -> Connecting -> Streaming -> {Completed | Failed | Cancelled}`;
/// `Failed -> Connecting` only through an explicit retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Connecting,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    /// Terminal statuses accept no further events.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a generation is in flight (`Connecting` or `Streaming`).
    pub fn is_running(self) -> bool {
        matches!(self, Self::Connecting | Self::Streaming)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable point-in-time view of a session.
///
/// Cloning is cheap: section bodies are shared with the session, and later
/// appends by the session never show through.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SessionSnapshot {
    pub session_id: uuid::Uuid,
    /// 1-based attempt number; bumped by `retry()`.
    pub attempt: u32,
    /// Increases with every published snapshot of this session.
    pub revision: u64,
    pub status: SessionStatus,
    /// Sections ordered by start.
    pub sections: Vec<Section>,
    /// Text received while no section was open.
    pub unsectioned: SharedText,
    pub metadata: MetadataMap,
    pub progress_percent: u8,
    /// Name of the section currently receiving content.
    pub current_section: Option<String>,
    pub error_message: Option<String>,
    /// Messages from recoverable upstream errors.
    pub warnings: Vec<String>,
    pub frames_applied: u64,
    pub parse_errors: u64,
}

impl SessionSnapshot {
    pub(crate) fn idle(session_id: uuid::Uuid) -> Self {
        Self {
            session_id,
            attempt: 1,
            revision: 0,
            status: SessionStatus::Idle,
            sections: Vec::new(),
            unsectioned: SharedText::new(),
            metadata: MetadataMap::new(),
            progress_percent: 0,
            current_section: None,
            error_message: None,
            warnings: Vec::new(),
            frames_applied: 0,
            parse_errors: 0,
        }
    }

    /// Looks up the most recently started section with `name`.
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().rev().find(|s| s.name == name)
    }

    /// True unless the generation completed.
    pub fn is_incomplete(&self) -> bool {
        self.status != SessionStatus::Completed
    }

    /// Unsectioned text followed by every section's text in start order.
    pub fn assembled_text(&self) -> String {
        let mut out = String::with_capacity(
            self.unsectioned.len() + self.sections.iter().map(|s| s.text().len()).sum::<usize>(),
        );
        out.push_str(&self.unsectioned);
        for section in &self.sections {
            out.push_str(section.text());
        }
        out
    }

    /// Renders the document as markdown with one `##` heading per section.
    ///
    /// Anything short of `Completed` is prefixed with an incomplete notice so
    /// partial output is never mistaken for a final document.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        match self.status {
            SessionStatus::Completed => {}
            SessionStatus::Failed => {
                out.push_str("> **Incomplete:** generation failed");
                if let Some(message) = &self.error_message {
                    out.push_str(": ");
                    out.push_str(message);
                }
                out.push_str("\n\n");
            }
            SessionStatus::Cancelled => {
                out.push_str("> **Incomplete:** generation was cancelled\n\n");
            }
            SessionStatus::Idle | SessionStatus::Connecting | SessionStatus::Streaming => {
                out.push_str("> **Incomplete:** generation in progress\n\n");
            }
        }
        let preamble = self.unsectioned.trim();
        if !preamble.is_empty() {
            out.push_str(preamble);
            out.push_str("\n\n");
        }
        for section in &self.sections {
            out.push_str("## ");
            out.push_str(&section.name);
            out.push_str("\n\n");
            let body = section.text().trim();
            if !body.is_empty() {
                out.push_str(body);
                out.push_str("\n\n");
            }
        }
        let trimmed = out.trim_end().len();
        out.truncate(trimmed);
        out.push('\n');
        out
    }
}
