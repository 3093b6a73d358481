use chrono::{DateTime, Utc};

use crate::event::{MetadataMap, StreamEvent};
use crate::text::SharedText;

/// A named block of generated text with a start/end lifecycle.
///
/// Text is shared with published snapshots, so taking a snapshot never
/// copies section bodies and appending never copies what a snapshot holds.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Section {
    pub name: String,
    text: SharedText,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl Section {
    fn open(name: String, started_at: Option<DateTime<Utc>>) -> Self {
        Self {
            name,
            text: SharedText::new(),
            started_at,
            ended_at: None,
            is_active: true,
        }
    }

    /// Text accumulated so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    fn append(&mut self, text: &str) {
        self.text.push_str(text);
    }
}

/// What applying an event did to the accumulator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The event changed accumulated state.
    Applied,
    /// `SectionStart` for a name that is already active; ignored.
    DuplicateStart,
    /// `SectionEnd` with no matching open section; ignored.
    UnmatchedEnd,
    /// The event carries no accumulator state (`Error`, `Done`, empty text).
    Skipped,
}

/// Folds stream events into sections, unsectioned text, and metadata.
///
/// Append/merge only: sections are never removed, and reopening a closed
/// section name starts a new entry rather than reviving the old one.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SectionAccumulator {
    sections: Vec<Section>,
    // Indices into `sections` that are still open, oldest first.
    open: Vec<usize>,
    unsectioned: SharedText,
    metadata: MetadataMap,
    events_applied: u64,
}

impl SectionAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reducer form: consumes the state and returns the next one.
    pub fn apply(mut self, event: &StreamEvent) -> Self {
        self.apply_event(event);
        self
    }

    /// Applies `event` in place and reports how it was handled.
    pub fn apply_event(&mut self, event: &StreamEvent) -> ApplyOutcome {
        self.events_applied = self.events_applied.saturating_add(1);
        match event {
            StreamEvent::SectionStart { section, timestamp } => {
                if self.find_open(section).is_some() {
                    return ApplyOutcome::DuplicateStart;
                }
                self.sections
                    .push(Section::open(section.clone(), *timestamp));
                self.open.push(self.sections.len() - 1);
                ApplyOutcome::Applied
            }
            StreamEvent::Content { text, .. } => {
                if text.is_empty() {
                    return ApplyOutcome::Skipped;
                }
                match self.open.last() {
                    Some(&idx) => self.sections[idx].append(text),
                    None => self.unsectioned.push_str(text),
                }
                ApplyOutcome::Applied
            }
            StreamEvent::SectionEnd { section, timestamp } => {
                let Some(pos) = self.find_open(section) else {
                    return ApplyOutcome::UnmatchedEnd;
                };
                let idx = self.open.remove(pos);
                let closed = &mut self.sections[idx];
                closed.is_active = false;
                closed.ended_at = *timestamp;
                ApplyOutcome::Applied
            }
            StreamEvent::Metadata { entries } => {
                for (key, value) in entries {
                    self.metadata.insert(key.clone(), value.clone());
                }
                ApplyOutcome::Applied
            }
            StreamEvent::Error { .. } | StreamEvent::Done => ApplyOutcome::Skipped,
        }
    }

    fn find_open(&self, name: &str) -> Option<usize> {
        self.open
            .iter()
            .rposition(|&idx| self.sections[idx].name == name)
    }

    /// All sections in start order, closed and open.
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Text that arrived while no section was open.
    pub fn unsectioned(&self) -> &str {
        &self.unsectioned
    }

    pub(crate) fn unsectioned_shared(&self) -> SharedText {
        self.unsectioned.clone()
    }

    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    /// The section currently receiving content, if any.
    pub fn current_section(&self) -> Option<&Section> {
        self.open.last().map(|&idx| &self.sections[idx])
    }

    pub fn closed_count(&self) -> usize {
        self.sections.len() - self.open.len()
    }

    pub fn events_applied(&self) -> u64 {
        self.events_applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fold(events: &[StreamEvent]) -> SectionAccumulator {
        events
            .iter()
            .fold(SectionAccumulator::new(), |state, event| state.apply(event))
    }

    #[test]
    fn content_concatenates_in_order() {
        let pieces = ["Hel", "lo", " ", "wor", "ld", "", "!"];
        let mut events = vec![StreamEvent::section_start("Summary")];
        events.extend(pieces.iter().map(|p| StreamEvent::content(*p)));
        let state = fold(&events);
        assert_eq!(state.sections().len(), 1);
        assert_eq!(state.sections()[0].text(), pieces.concat());
        assert!(state.sections()[0].is_active);
    }

    #[test]
    fn duplicate_start_neither_resets_nor_duplicates() {
        let mut state = SectionAccumulator::new();
        assert_eq!(
            state.apply_event(&StreamEvent::section_start("X")),
            ApplyOutcome::Applied
        );
        state.apply_event(&StreamEvent::content("a"));
        assert_eq!(
            state.apply_event(&StreamEvent::section_start("X")),
            ApplyOutcome::DuplicateStart
        );
        assert_eq!(state.sections().len(), 1);
        assert_eq!(state.sections()[0].text(), "a");
    }

    #[test]
    fn unmatched_end_creates_no_phantom_section() {
        let mut state = SectionAccumulator::new();
        assert_eq!(
            state.apply_event(&StreamEvent::section_end("X")),
            ApplyOutcome::UnmatchedEnd
        );
        assert!(state.sections().is_empty());

        state.apply_event(&StreamEvent::section_start("X"));
        state.apply_event(&StreamEvent::section_end("X"));
        assert_eq!(
            state.apply_event(&StreamEvent::section_end("X")),
            ApplyOutcome::UnmatchedEnd
        );
        assert_eq!(state.sections().len(), 1);
    }

    #[test]
    fn content_without_open_section_goes_to_unsectioned() {
        let state = fold(&[
            StreamEvent::content("preamble "),
            StreamEvent::section_start("A"),
            StreamEvent::content("a"),
            StreamEvent::section_end("A"),
            StreamEvent::content("tail"),
        ]);
        assert_eq!(state.unsectioned(), "preamble tail");
        assert_eq!(state.sections()[0].text(), "a");
        assert!(state.current_section().is_none());
    }

    #[test]
    fn content_targets_most_recent_open_section() {
        let state = fold(&[
            StreamEvent::section_start("outer"),
            StreamEvent::content("1"),
            StreamEvent::section_start("inner"),
            StreamEvent::content("2"),
            StreamEvent::section_end("inner"),
            StreamEvent::content("3"),
        ]);
        assert_eq!(state.sections()[0].text(), "13");
        assert_eq!(state.sections()[1].text(), "2");
        assert_eq!(state.current_section().map(|s| s.name.as_str()), Some("outer"));
    }

    #[test]
    fn content_hint_does_not_reroute_text() {
        let state = fold(&[
            StreamEvent::section_start("A"),
            StreamEvent::Content {
                text: "x".into(),
                section: Some("B".into()),
            },
        ]);
        assert_eq!(state.sections()[0].text(), "x");
        assert_eq!(state.sections().len(), 1);
    }

    #[test]
    fn out_of_order_end_closes_the_named_section() {
        let state = fold(&[
            StreamEvent::section_start("A"),
            StreamEvent::section_start("B"),
            StreamEvent::section_end("A"),
            StreamEvent::content("b"),
        ]);
        assert!(!state.sections()[0].is_active);
        assert!(state.sections()[1].is_active);
        assert_eq!(state.sections()[1].text(), "b");
        assert_eq!(state.closed_count(), 1);
    }

    #[test]
    fn reopening_a_closed_section_creates_a_new_entry() {
        let t1: DateTime<Utc> = "2024-05-01T10:00:00Z".parse().expect("t1");
        let t2: DateTime<Utc> = "2024-05-01T10:05:00Z".parse().expect("t2");
        let state = fold(&[
            StreamEvent::SectionStart {
                section: "Notes".into(),
                timestamp: Some(t1),
            },
            StreamEvent::content("first"),
            StreamEvent::SectionEnd {
                section: "Notes".into(),
                timestamp: Some(t1),
            },
            StreamEvent::SectionStart {
                section: "Notes".into(),
                timestamp: Some(t2),
            },
            StreamEvent::content("second"),
        ]);
        assert_eq!(state.sections().len(), 2);
        assert_eq!(state.sections()[0].text(), "first");
        assert_eq!(state.sections()[0].ended_at, Some(t1));
        assert_eq!(state.sections()[1].text(), "second");
        assert_eq!(state.sections()[1].started_at, Some(t2));
    }

    #[test]
    fn metadata_is_last_write_wins() {
        let state = fold(&[
            StreamEvent::metadata("emails", serde_json::json!(3)),
            StreamEvent::section_start("A"),
            StreamEvent::metadata("emails", serde_json::json!(7)),
            StreamEvent::metadata("docs", serde_json::json!(1)),
        ]);
        assert_eq!(state.metadata().get("emails"), Some(&serde_json::json!(7)));
        assert_eq!(state.metadata().get("docs"), Some(&serde_json::json!(1)));
        assert_eq!(state.events_applied(), 4);
    }

    #[test]
    fn cloned_sections_are_unaffected_by_later_appends() {
        let mut state = fold(&[StreamEvent::section_start("A"), StreamEvent::content("x")]);
        let before = state.sections().to_vec();
        state.apply_event(&StreamEvent::content("y"));
        assert_eq!(before[0].text(), "x");
        assert_eq!(state.sections()[0].text(), "xy");
    }

    #[test]
    fn held_snapshots_do_not_force_copies_on_append() {
        let mut state = fold(&[StreamEvent::section_start("Long")]);
        state.apply_event(&StreamEvent::content("start "));
        let mut held = Vec::new();
        let mut copies = 0;
        for _ in 0..1000 {
            let before = state.sections()[0].text().as_ptr();
            held.push((state.sections().to_vec(), state.unsectioned_shared()));
            state.apply_event(&StreamEvent::content("chunk "));
            if state.sections()[0].text().as_ptr() != before {
                copies += 1;
            }
        }
        // Only capacity doublings move the buffer.
        assert!(copies <= 8, "section text copied on {copies} of 1000 appends");
        assert_eq!(held[0].0[0].text(), "start ");
        assert_eq!(state.sections()[0].text().len(), 6 + 6 * 1000);
    }
}
