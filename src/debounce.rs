// src/debounce.rs
//
// Suppresses near-duplicate cues spoken in quick succession.

use crate::config::duration_from_secs;
use crate::types::SpeechConfig;
use std::collections::HashSet;
use std::time::{Duration, Instant};

const DEFAULT_WINDOW: Duration = Duration::from_millis(2500);

pub struct Debouncer {
    window: Duration,
    similarity_threshold: f64,
    last: Option<(String, Instant)>,
}

impl Debouncer {
    pub fn new(debounce_sec: f64, similarity_threshold: f64) -> Self {
        Self {
            window: duration_from_secs(debounce_sec.max(0.0), DEFAULT_WINDOW),
            similarity_threshold,
            last: None,
        }
    }

    pub fn from_config(config: &SpeechConfig) -> Self {
        Self::new(config.debounce_sec, config.similarity_threshold)
    }

    pub fn should_speak(&mut self, text: &str) -> bool {
        self.should_speak_at(text, Instant::now())
    }

    /// Suppress `text` when the last spoken cue is both recent and similar.
    /// Only an allowed cue updates the remembered text and time.
    pub fn should_speak_at(&mut self, text: &str, now: Instant) -> bool {
        if let Some((last_text, last_time)) = &self.last {
            let recent = now.saturating_duration_since(*last_time) < self.window;
            if recent && similarity(text, last_text) >= self.similarity_threshold {
                return false;
            }
        }

        self.last = Some((text.to_string(), now));
        true
    }
}

/// Jaccard overlap of lower-cased whitespace tokens. Empty text scores 0.
pub fn similarity(a: &str, b: &str) -> f64 {
    let lower_a = a.to_lowercase();
    let lower_b = b.to_lowercase();
    let ta: HashSet<&str> = lower_a.split_whitespace().collect();
    let tb: HashSet<&str> = lower_b.split_whitespace().collect();

    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let shared = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    shared as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    const CUE: &str = "Large, tight school around 55 feet. Drop to 55 and hold.";

    #[test]
    fn test_first_message_always_allowed() {
        let mut d = Debouncer::new(2.5, 0.8);
        assert!(d.should_speak_at(CUE, Instant::now()));
        assert_eq!(d.last.as_ref().map(|(t, _)| t.as_str()), Some(CUE));
    }

    #[test]
    fn test_repeat_within_window_suppressed() {
        let mut d = Debouncer::new(2.5, 0.8);
        let t0 = Instant::now();
        assert!(d.should_speak_at(CUE, t0));
        assert!(!d.should_speak_at(CUE, t0 + Duration::from_millis(500)));
        assert!(!d.should_speak_at(CUE, t0 + Duration::from_millis(2400)));
    }

    #[test]
    fn test_repeat_after_window_allowed() {
        let mut d = Debouncer::new(2.5, 0.8);
        let t0 = Instant::now();
        assert!(d.should_speak_at(CUE, t0));
        assert!(d.should_speak_at(CUE, t0 + Duration::from_millis(2600)));
    }

    #[test]
    fn test_suppression_does_not_refresh_window() {
        let mut d = Debouncer::new(2.5, 0.8);
        let t0 = Instant::now();
        assert!(d.should_speak_at(CUE, t0));
        assert!(!d.should_speak_at(CUE, t0 + Duration::from_secs(2)));
        // Measured from t0, not from the suppressed attempt.
        assert!(d.should_speak_at(CUE, t0 + Duration::from_secs(3)));
    }

    #[test]
    fn test_different_message_allowed_within_window() {
        let mut d = Debouncer::new(2.5, 0.8);
        let t0 = Instant::now();
        assert!(d.should_speak_at(CUE, t0));
        assert!(d.should_speak_at(
            "Likely debris - ignore for now.",
            t0 + Duration::from_millis(100)
        ));
    }

    #[test]
    fn test_unusable_window_falls_back_to_default() {
        assert_eq!(Debouncer::new(f64::INFINITY, 0.8).window, DEFAULT_WINDOW);
        assert_eq!(Debouncer::new(f64::NAN, 0.8).window, Duration::ZERO);
        assert_eq!(Debouncer::new(-3.0, 0.8).window, Duration::ZERO);
    }

    #[test]
    fn test_similarity() {
        assert_eq!(similarity("a b c", "A B C"), 1.0);
        assert_eq!(similarity("", ""), 0.0);
        assert_eq!(similarity("a", ""), 0.0);
        assert!((similarity("a b c d", "a b c e") - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_empty_text_never_similar() {
        let mut d = Debouncer::new(2.5, 0.8);
        let t0 = Instant::now();
        assert!(d.should_speak_at("", t0));
        assert!(d.should_speak_at("", t0 + Duration::from_millis(10)));
    }
}
