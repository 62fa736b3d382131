//! Recognition debouncing.
//!
//! A person standing in front of the camera matches on every frame. The
//! debouncer turns that stream into one event per arrival, plus a repeat
//! once the cooldown has elapsed.

use crate::matcher::MatchResult;
use std::time::{Duration, Instant};

/// Default suppression window for repeated matches of the same name.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RecognitionDebouncer {
    cooldown: Duration,
    last_matched_name: Option<String>,
    last_matched_at: Option<Instant>,
}

impl RecognitionDebouncer {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_matched_name: None,
            last_matched_at: None,
        }
    }

    /// Decide whether `result` should be emitted, recording it if so.
    ///
    /// Unknown results never emit and leave the state untouched.
    pub fn should_emit(&mut self, result: &MatchResult, now: Instant) -> bool {
        let Some(name) = result.name.as_deref() else {
            return false;
        };

        let same_name = self.last_matched_name.as_deref() == Some(name);
        let cooled_down = match self.last_matched_at {
            Some(at) => now.saturating_duration_since(at) > self.cooldown,
            None => true,
        };

        if !same_name || cooled_down {
            self.last_matched_name = Some(name.to_string());
            self.last_matched_at = Some(now);
            true
        } else {
            false
        }
    }

    pub fn last_matched_name(&self) -> Option<&str> {
        self.last_matched_name.as_deref()
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }
}

impl Default for RecognitionDebouncer {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(name: &str) -> MatchResult {
        MatchResult {
            name: Some(name.into()),
            distance: 0.1,
        }
    }

    #[test]
    fn test_same_name_within_cooldown_emits_once() {
        let mut d = RecognitionDebouncer::new(Duration::from_secs(5));
        let t0 = Instant::now();
        assert!(d.should_emit(&hit("alice"), t0));
        assert!(!d.should_emit(&hit("alice"), t0 + Duration::from_secs(1)));
        assert!(!d.should_emit(&hit("alice"), t0 + Duration::from_secs(5)));
    }

    #[test]
    fn test_same_name_after_cooldown_emits_again() {
        let mut d = RecognitionDebouncer::new(Duration::from_secs(5));
        let t0 = Instant::now();
        assert!(d.should_emit(&hit("alice"), t0));
        assert!(d.should_emit(&hit("alice"), t0 + Duration::from_millis(5001)));
    }

    #[test]
    fn test_different_name_emits_immediately() {
        let mut d = RecognitionDebouncer::new(Duration::from_secs(5));
        let t0 = Instant::now();
        assert!(d.should_emit(&hit("alice"), t0));
        assert!(d.should_emit(&hit("bob"), t0 + Duration::from_millis(10)));
        assert!(d.should_emit(&hit("alice"), t0 + Duration::from_millis(20)));
        assert_eq!(d.last_matched_name(), Some("alice"));
    }

    #[test]
    fn test_unknown_never_emits_nor_resets_clock() {
        let mut d = RecognitionDebouncer::new(Duration::from_secs(5));
        let t0 = Instant::now();
        assert!(d.should_emit(&hit("alice"), t0));
        assert!(!d.should_emit(&MatchResult::unknown(0.9), t0 + Duration::from_secs(1)));
        assert!(!d.should_emit(&MatchResult::unknown(f32::INFINITY), t0 + Duration::from_secs(2)));
        // Still inside alice's original window.
        assert!(!d.should_emit(&hit("alice"), t0 + Duration::from_secs(3)));
        assert_eq!(d.last_matched_name(), Some("alice"));
    }

    #[test]
    fn test_suppressed_hit_does_not_extend_window() {
        let mut d = RecognitionDebouncer::new(Duration::from_secs(5));
        let t0 = Instant::now();
        assert!(d.should_emit(&hit("alice"), t0));
        assert!(!d.should_emit(&hit("alice"), t0 + Duration::from_secs(4)));
        assert!(d.should_emit(&hit("alice"), t0 + Duration::from_secs(6)));
    }
}
