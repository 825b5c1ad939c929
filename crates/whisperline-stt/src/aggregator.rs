use tracing::debug;

use crate::types::TranscriptionChunk;

/// Merges the chunk stream from either provider family into one running
/// transcript.
///
/// Final chunks are authoritative: they are trimmed, joined onto the
/// confirmed text with a single space, and the partial buffer for that
/// utterance is discarded. Partial chunks are provisional: they stack in
/// an ordered buffer and only affect the displayed text, never the
/// confirmed text.
///
/// Partials are re-joined wholesale on every update, so a provider that
/// re-sends overlapping partial text will show duplicated words until
/// the final chunk lands. That matches observed provider behavior and is
/// kept as-is.
#[derive(Debug)]
pub struct TranscriptionAggregator {
    confirmed: String,
    partials: Vec<String>,
    partials_enabled: bool,
    transcribing: bool,
    last_error: Option<String>,
}

impl TranscriptionAggregator {
    pub fn new(partials_enabled: bool) -> Self {
        Self {
            confirmed: String::new(),
            partials: Vec::new(),
            partials_enabled,
            transcribing: false,
            last_error: None,
        }
    }

    /// Reset for a new recording pass. Clears the transcript, the
    /// partial buffer, and any previous error.
    pub fn begin(&mut self) {
        self.confirmed.clear();
        self.partials.clear();
        self.last_error = None;
        self.transcribing = true;
    }

    /// Merge one incoming chunk.
    pub fn apply(&mut self, chunk: &TranscriptionChunk) {
        if chunk.is_final {
            let new_text = chunk.text.trim();
            let existing = self.confirmed.trim();
            self.confirmed = if existing.is_empty() {
                new_text.to_string()
            } else {
                format!("{existing} {new_text}")
            };
            self.partials.clear();
            debug!(target: "stt", len = self.confirmed.len(), "merged final chunk");
        } else if self.partials_enabled {
            self.partials.push(chunk.text.clone());
        }
    }

    /// Confirmed text plus the space-joined, trimmed partial tail.
    pub fn current_text(&self) -> String {
        if self.partials.is_empty() {
            return self.confirmed.clone();
        }
        let tail = self
            .partials
            .iter()
            .map(|p| p.trim())
            .collect::<Vec<_>>()
            .join(" ");
        if self.confirmed.is_empty() {
            tail
        } else {
            format!("{} {}", self.confirmed, tail)
        }
    }

    pub fn is_transcribing(&self) -> bool {
        self.transcribing
    }

    /// Toggle partial display. Disabling clears any buffered partials so
    /// the view falls back to confirmed text only.
    pub fn set_partials_enabled(&mut self, enabled: bool) {
        self.partials_enabled = enabled;
        if !enabled {
            self.partials.clear();
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Stop cleanly. Confirmed text and any in-flight partials stay
    /// visible; only the active flag flips.
    pub fn stop(&mut self) {
        self.transcribing = false;
    }

    /// Record an unrecovered failure. Text accumulated before the
    /// failure is preserved, not discarded.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.transcribing = false;
        self.last_error = Some(message.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partial(text: &str) -> TranscriptionChunk {
        TranscriptionChunk::partial(text)
    }

    fn final_chunk(text: &str) -> TranscriptionChunk {
        TranscriptionChunk::final_result(text)
    }

    #[test]
    fn final_onto_empty_taken_as_is() {
        let mut agg = TranscriptionAggregator::new(true);
        agg.begin();
        agg.apply(&final_chunk("  Hello world  "));
        assert_eq!(agg.current_text(), "Hello world");
    }

    #[test]
    fn finals_join_with_single_space() {
        let mut agg = TranscriptionAggregator::new(true);
        agg.begin();
        agg.apply(&final_chunk("First utterance."));
        agg.apply(&final_chunk("  Second utterance.  "));
        assert_eq!(agg.current_text(), "First utterance. Second utterance.");
    }

    #[test]
    fn final_discards_buffered_partials() {
        let mut agg = TranscriptionAggregator::new(true);
        agg.begin();
        agg.apply(&partial("Hel"));
        agg.apply(&partial("Hello wor"));
        agg.apply(&final_chunk("Hello world"));
        assert_eq!(agg.current_text(), "Hello world");
    }

    #[test]
    fn final_text_independent_of_partial_count() {
        for n in 0..8 {
            let mut agg = TranscriptionAggregator::new(true);
            agg.begin();
            agg.apply(&final_chunk("Already confirmed"));
            for i in 0..n {
                agg.apply(&partial(&format!("draft {i}")));
            }
            agg.apply(&final_chunk("  and the rest  "));
            assert_eq!(agg.current_text(), "Already confirmed and the rest");
        }
    }

    #[test]
    fn partials_stack_in_display() {
        let mut agg = TranscriptionAggregator::new(true);
        agg.begin();
        agg.apply(&partial("Hello"));
        agg.apply(&partial("Hello world"));
        // Re-join duplicates overlapping partial text until a final lands.
        assert_eq!(agg.current_text(), "Hello Hello world");
    }

    #[test]
    fn partials_ignored_when_disabled() {
        let mut agg = TranscriptionAggregator::new(false);
        agg.begin();
        agg.apply(&partial("Hello"));
        agg.apply(&partial("Hello world"));
        assert_eq!(agg.current_text(), "");
        agg.apply(&final_chunk("Hello world, this is a test"));
        assert_eq!(agg.current_text(), "Hello world, this is a test");
    }

    #[test]
    fn streaming_scenario_ends_on_final_text() {
        let chunks = [
            ("Hello", false),
            ("Hello world", false),
            ("Hello world, this is a test", true),
        ];
        let mut agg = TranscriptionAggregator::new(true);
        agg.begin();
        for (text, is_final) in chunks {
            let chunk = if is_final {
                final_chunk(text)
            } else {
                partial(text)
            };
            agg.apply(&chunk);
        }
        assert_eq!(agg.current_text(), "Hello world, this is a test");
    }

    #[test]
    fn stop_preserves_text() {
        let mut agg = TranscriptionAggregator::new(true);
        agg.begin();
        agg.apply(&final_chunk("kept"));
        agg.stop();
        assert!(!agg.is_transcribing());
        assert_eq!(agg.current_text(), "kept");
    }

    #[test]
    fn fail_preserves_text_and_records_error() {
        let mut agg = TranscriptionAggregator::new(true);
        agg.begin();
        agg.apply(&final_chunk("confirmed"));
        agg.apply(&partial("in flight"));
        agg.fail("socket dropped");
        assert!(!agg.is_transcribing());
        assert_eq!(agg.last_error(), Some("socket dropped"));
        assert_eq!(agg.current_text(), "confirmed in flight");
    }

    #[test]
    fn begin_resets_everything() {
        let mut agg = TranscriptionAggregator::new(true);
        agg.begin();
        agg.apply(&final_chunk("old text"));
        agg.fail("boom");
        agg.begin();
        assert!(agg.is_transcribing());
        assert_eq!(agg.current_text(), "");
        assert_eq!(agg.last_error(), None);
    }
}
