//! Terminal consumer: prints streamed text as it arrives and status changes
//! as they happen.

use std::io::Write;
use std::sync::Mutex;

use casestudy_stream::{ConsumerView, SessionConsumer, SessionSnapshot, SessionStatus};

/// What has already been written for the current attempt.
#[derive(Debug, Default)]
pub struct RenderState {
    attempt: u32,
    unsectioned: usize,
    sections: Vec<usize>,
    warnings: usize,
    wrote_text: bool,
    status: Option<SessionStatus>,
    progress: u8,
}

/// Output produced for one snapshot.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Delta {
    /// Document text for stdout.
    pub text: String,
    /// Status lines for stderr.
    pub status: Vec<String>,
}

impl RenderState {
    /// Computes what `snapshot` adds over what was already printed.
    pub fn advance(&mut self, snapshot: &SessionSnapshot) -> Delta {
        let mut delta = Delta::default();
        if snapshot.attempt != self.attempt {
            if self.attempt != 0 {
                delta
                    .status
                    .push(format!("retrying (attempt {})", snapshot.attempt));
                if self.wrote_text {
                    delta.text.push_str("\n\n");
                }
            }
            *self = Self {
                attempt: snapshot.attempt,
                ..Self::default()
            };
        }

        if let Some(rest) = snapshot.unsectioned.get(self.unsectioned..) {
            delta.text.push_str(rest);
            self.unsectioned = snapshot.unsectioned.len();
        }
        for (idx, section) in snapshot.sections.iter().enumerate() {
            if idx == self.sections.len() {
                if self.wrote_text || !delta.text.is_empty() {
                    delta.text.push_str("\n\n");
                }
                delta.text.push_str("## ");
                delta.text.push_str(&section.name);
                delta.text.push_str("\n\n");
                self.sections.push(0);
            }
            if let Some(rest) = section.text().get(self.sections[idx]..) {
                delta.text.push_str(rest);
                self.sections[idx] = section.text().len();
            }
        }
        self.wrote_text |= !delta.text.is_empty();

        if self.status != Some(snapshot.status) {
            self.status = Some(snapshot.status);
            let view = ConsumerView::from(snapshot);
            delta
                .status
                .push(view.banner.unwrap_or_else(|| snapshot.status.to_string()));
        }
        if snapshot.progress_percent > self.progress {
            self.progress = snapshot.progress_percent;
            if snapshot.status.is_running() {
                delta.status.push(format!("{}%", snapshot.progress_percent));
            }
        }
        for warning in snapshot.warnings.iter().skip(self.warnings) {
            delta.status.push(format!("warning: {warning}"));
        }
        self.warnings = snapshot.warnings.len();
        delta
    }
}

/// Writes document text to `out` and status lines to stderr.
pub struct TerminalRenderer<W> {
    state: Mutex<(RenderState, W)>,
    quiet: bool,
}

impl<W: Write + Send> TerminalRenderer<W> {
    pub fn new(out: W, quiet: bool) -> Self {
        Self {
            state: Mutex::new((RenderState::default(), out)),
            quiet,
        }
    }
}

impl<W: Write + Send> SessionConsumer for TerminalRenderer<W> {
    fn render(&self, snapshot: &SessionSnapshot) {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let (state, out) = &mut *guard;
        let delta = state.advance(snapshot);
        if !delta.text.is_empty() {
            let _ = out.write_all(delta.text.as_bytes());
            let _ = out.flush();
        }
        if !self.quiet {
            for line in delta.status {
                eprintln!("[{}] {line}", snapshot.status);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casestudy_stream::{SectionAccumulator, StreamEvent};

    fn snapshot(status: SessionStatus, attempt: u32, events: &[StreamEvent]) -> SessionSnapshot {
        let state = events
            .iter()
            .fold(SectionAccumulator::new(), |state, event| state.apply(event));
        let mut snapshot: SessionSnapshot = serde_json::from_value(serde_json::json!({
            "session_id": "00000000-0000-0000-0000-000000000000",
            "attempt": attempt,
            "revision": 1,
            "status": status,
            "sections": [],
            "unsectioned": state.unsectioned(),
            "metadata": {},
            "progress_percent": 0,
            "current_section": null,
            "error_message": null,
            "warnings": [],
            "frames_applied": 0,
            "parse_errors": 0,
        }))
        .expect("snapshot");
        snapshot.sections = state.sections().to_vec();
        snapshot
    }

    #[test]
    fn prints_only_new_text() {
        let mut state = RenderState::default();
        let first = state.advance(&snapshot(
            SessionStatus::Streaming,
            1,
            &[StreamEvent::section_start("Summary"), StreamEvent::content("Hel")],
        ));
        assert_eq!(first.text, "## Summary\n\nHel");
        assert_eq!(first.status, vec!["streaming".to_string()]);

        let second = state.advance(&snapshot(
            SessionStatus::Streaming,
            1,
            &[
                StreamEvent::section_start("Summary"),
                StreamEvent::content("Hello"),
                StreamEvent::section_end("Summary"),
                StreamEvent::section_start("Findings"),
                StreamEvent::content("- one"),
            ],
        ));
        assert_eq!(second.text, "lo\n\n## Findings\n\n- one");
        assert!(second.status.is_empty());
    }

    #[test]
    fn failure_banner_and_cancel_are_reported_differently() {
        let mut state = RenderState::default();
        let mut failed = snapshot(SessionStatus::Failed, 1, &[]);
        failed.error_message = Some("model overloaded".into());
        let delta = state.advance(&failed);
        assert!(delta.status[0].contains("model overloaded"));

        let mut state = RenderState::default();
        let delta = state.advance(&snapshot(SessionStatus::Cancelled, 1, &[]));
        assert_eq!(delta.status, vec!["cancelled".to_string()]);
    }

    #[test]
    fn retry_restarts_output() {
        let mut state = RenderState::default();
        state.advance(&snapshot(
            SessionStatus::Failed,
            1,
            &[StreamEvent::content("stale")],
        ));
        let delta = state.advance(&snapshot(
            SessionStatus::Streaming,
            2,
            &[StreamEvent::content("fresh")],
        ));
        assert_eq!(delta.text, "\n\nfresh");
        assert_eq!(delta.status[0], "retrying (attempt 2)");
    }

    #[test]
    fn warnings_are_reported_once() {
        let mut state = RenderState::default();
        let mut snap = snapshot(SessionStatus::Streaming, 1, &[]);
        snap.warnings = vec!["slow source".into()];
        assert!(state.advance(&snap).status.contains(&"warning: slow source".to_string()));
        assert!(state.advance(&snap).status.is_empty());
    }

    #[test]
    fn renderer_writes_text_to_its_writer() {
        let renderer = TerminalRenderer::new(Vec::new(), true);
        renderer.render(&snapshot(
            SessionStatus::Streaming,
            1,
            &[StreamEvent::content("intro")],
        ));
        let (_, out) = renderer.state.into_inner().expect("state");
        assert_eq!(out, b"intro");
    }
}
