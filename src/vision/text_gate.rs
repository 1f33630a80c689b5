//! Text-change gate
//!
//! Filters OCR outputs whose combined text is indistinguishable from the
//! previous accepted result for the same window. Stabilization decides
//! whether OCR runs at all; this gate decides whether OCR work that already
//! ran is worth emitting. The two filters are deliberately separate.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::debug;

use crate::capture::frame::WindowHandle;
use crate::pipeline::TranslationMode;

/// Authoritative pipeline threshold. The service-layer value in settings is
/// configuration surface only and does not feed this gate.
pub const TEXT_CHANGE_THRESHOLD: f32 = 0.10;

/// Gate verdict for one OCR result
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GateDecision {
    /// Text differs enough from the baseline; baseline updated
    Accepted,
    /// Text is effectively unchanged; baseline untouched
    Rejected { similarity: f32 },
}

impl GateDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, GateDecision::Accepted)
    }
}

/// Per-window duplicate-text filter
#[derive(Debug)]
pub struct TextChangeGate {
    previous_text: Mutex<HashMap<WindowHandle, String>>,
    threshold: f32,
}

impl Default for TextChangeGate {
    fn default() -> Self {
        Self::new()
    }
}

impl TextChangeGate {
    pub fn new() -> Self {
        Self {
            previous_text: Mutex::new(HashMap::new()),
            threshold: TEXT_CHANGE_THRESHOLD,
        }
    }

    /// Decide whether `current_text` should pass for `window`.
    ///
    /// First observation for a window always passes. Otherwise the change
    /// fraction `1 - s` (token Jaccard similarity `s`) must reach the
    /// threshold. SingleShot mode bypasses the comparison entirely but
    /// still records the text as the new baseline.
    pub fn accept(
        &self,
        window: WindowHandle,
        current_text: &str,
        mode: TranslationMode,
    ) -> GateDecision {
        let mut previous = self.previous_text.lock();

        if mode == TranslationMode::SingleShot {
            previous.insert(window, current_text.to_string());
            return GateDecision::Accepted;
        }

        let similarity = match previous.get(&window) {
            Some(baseline) => token_jaccard(baseline, current_text),
            None => {
                previous.insert(window, current_text.to_string());
                return GateDecision::Accepted;
            }
        };

        if 1.0 - similarity < self.threshold {
            debug!(window, similarity, "text gate rejected near-duplicate");
            return GateDecision::Rejected { similarity };
        }

        previous.insert(window, current_text.to_string());
        GateDecision::Accepted
    }

    /// Baseline currently stored for a window.
    pub fn baseline(&self, window: WindowHandle) -> Option<String> {
        self.previous_text.lock().get(&window).cloned()
    }

    /// Drop one window's baseline.
    pub fn clear_window(&self, window: WindowHandle) {
        self.previous_text.lock().remove(&window);
    }

    /// Drop all baselines.
    pub fn reset(&self) {
        self.previous_text.lock().clear();
    }
}

/// Jaccard similarity over whitespace-separated tokens.
///
/// Set-based, so stable under insertion order. Two empty texts are
/// identical (similarity 1.0).
fn token_jaccard(a: &str, b: &str) -> f32 {
    let set_a: HashSet<&str> = a.split_whitespace().collect();
    let set_b: HashSet<&str> = b.split_whitespace().collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.len() + set_b.len() - intersection;
    intersection as f32 / union as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_text_always_accepted() {
        let gate = TextChangeGate::new();
        assert!(gate.accept(1, "Hello world", TranslationMode::Live).is_accepted());
        assert_eq!(gate.baseline(1).as_deref(), Some("Hello world"));
    }

    #[test]
    fn test_identical_text_rejected() {
        let gate = TextChangeGate::new();
        gate.accept(1, "Hello world", TranslationMode::Live);
        let decision = gate.accept(1, "Hello world", TranslationMode::Live);
        assert!(matches!(decision, GateDecision::Rejected { .. }));
    }

    #[test]
    fn test_default_gate_still_filters() {
        // Default must behave exactly like new(): same threshold, so a
        // default-constructed gate rejects duplicates too
        let gate = TextChangeGate::default();
        gate.accept(1, "Hello world", TranslationMode::Live);
        let decision = gate.accept(1, "Hello world", TranslationMode::Live);
        assert!(matches!(decision, GateDecision::Rejected { .. }));
    }

    #[test]
    fn test_different_text_accepted_and_baseline_updated() {
        let gate = TextChangeGate::new();
        gate.accept(1, "Hello world", TranslationMode::Live);
        assert!(gate
            .accept(1, "Good morning", TranslationMode::Live)
            .is_accepted());
        assert_eq!(gate.baseline(1).as_deref(), Some("Good morning"));
    }

    #[test]
    fn test_rejection_keeps_baseline() {
        let gate = TextChangeGate::new();
        gate.accept(1, "one two three four five six seven eight nine ten", TranslationMode::Live);
        // Reordering leaves the token set identical
        let decision = gate.accept(
            1,
            "ten nine eight seven six five four three two one",
            TranslationMode::Live,
        );
        assert!(matches!(decision, GateDecision::Rejected { .. }));
        assert_eq!(
            gate.baseline(1).as_deref(),
            Some("one two three four five six seven eight nine ten")
        );
    }

    #[test]
    fn test_single_shot_bypasses_comparison() {
        let gate = TextChangeGate::new();
        gate.accept(1, "Hello world", TranslationMode::Live);
        assert!(gate
            .accept(1, "Hello world", TranslationMode::SingleShot)
            .is_accepted());
    }

    #[test]
    fn test_windows_are_independent() {
        let gate = TextChangeGate::new();
        gate.accept(1, "Hello world", TranslationMode::Live);
        assert!(gate.accept(2, "Hello world", TranslationMode::Live).is_accepted());
    }

    #[test]
    fn test_reset_clears_baselines() {
        let gate = TextChangeGate::new();
        gate.accept(1, "Hello world", TranslationMode::Live);
        gate.reset();
        assert!(gate.baseline(1).is_none());
        assert!(gate.accept(1, "Hello world", TranslationMode::Live).is_accepted());
    }

    #[test]
    fn test_jaccard_insertion_order_stable() {
        assert_eq!(token_jaccard("a b c", "c b a"), 1.0);
        assert_eq!(token_jaccard("", ""), 1.0);
        assert_eq!(token_jaccard("a b", "c d"), 0.0);
    }
}
