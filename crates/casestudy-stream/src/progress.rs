use serde_json::Value;

use crate::accumulator::SectionAccumulator;

/// Highest percentage reported before the `Done` event arrives.
pub const PROGRESS_CAP_BEFORE_DONE: u8 = 95;

const REPORTED_PERCENT_KEYS: [&str; 2] = ["progress", "progress_percentage"];
const EXPECTED_SECTION_KEYS: [&str; 3] =
    ["expected_sections", "expected_section_count", "total_sections"];

/// Estimates completion percentage from accumulated state.
///
/// Prefers a percentage reported by the backend, then closed sections against
/// an expected total. With neither, each closed section counts for a fixed
/// step. Never exceeds [`PROGRESS_CAP_BEFORE_DONE`]; only `Done` reaches 100.
pub fn estimate(state: &SectionAccumulator) -> u8 {
    let metadata = state.metadata();
    let raw = if let Some(reported) = REPORTED_PERCENT_KEYS
        .iter()
        .find_map(|key| metadata.get(*key).and_then(as_number))
    {
        reported
    } else if let Some(expected) = EXPECTED_SECTION_KEYS
        .iter()
        .find_map(|key| metadata.get(*key).and_then(as_number))
        .filter(|expected| *expected > 0.0)
    {
        state.closed_count() as f64 / expected * 100.0
    } else {
        // Unknown total: approach the cap without reaching it.
        let closed = state.closed_count() as f64;
        f64::from(PROGRESS_CAP_BEFORE_DONE) * closed / (closed + 4.0)
    };
    clamp_percent(raw)
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn clamp_percent(raw: f64) -> u8 {
    if !raw.is_finite() {
        return 0;
    }
    raw.clamp(0.0, f64::from(PROGRESS_CAP_BEFORE_DONE)).floor() as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::StreamEvent;

    fn with(events: &[StreamEvent]) -> SectionAccumulator {
        events
            .iter()
            .fold(SectionAccumulator::new(), |state, event| state.apply(event))
    }

    #[test]
    fn reported_percent_wins_and_is_capped() {
        let state = with(&[StreamEvent::metadata("progress", serde_json::json!(40))]);
        assert_eq!(estimate(&state), 40);
        let state = with(&[StreamEvent::metadata("progress_percentage", serde_json::json!(100))]);
        assert_eq!(estimate(&state), PROGRESS_CAP_BEFORE_DONE);
    }

    #[test]
    fn expected_total_drives_section_ratio() {
        let state = with(&[
            StreamEvent::metadata("expected_sections", serde_json::json!("4")),
            StreamEvent::section_start("A"),
            StreamEvent::section_end("A"),
        ]);
        assert_eq!(estimate(&state), 25);

        let state = with(&[
            StreamEvent::metadata("total_sections", serde_json::json!(1)),
            StreamEvent::section_start("A"),
            StreamEvent::section_end("A"),
        ]);
        assert_eq!(estimate(&state), PROGRESS_CAP_BEFORE_DONE);
    }

    #[test]
    fn unknown_total_never_reaches_cap() {
        let mut state = SectionAccumulator::new();
        assert_eq!(estimate(&state), 0);
        for i in 0..200 {
            let name = format!("s{i}");
            state.apply_event(&StreamEvent::section_start(name.clone()));
            state.apply_event(&StreamEvent::section_end(name));
            assert!(estimate(&state) < 100);
        }
        assert!(estimate(&state) <= PROGRESS_CAP_BEFORE_DONE);
    }

    #[test]
    fn garbage_values_are_ignored() {
        let state = with(&[
            StreamEvent::metadata("progress", serde_json::json!({"nested": true})),
            StreamEvent::metadata("expected_sections", serde_json::json!(0)),
        ]);
        assert_eq!(estimate(&state), 0);
    }
}
