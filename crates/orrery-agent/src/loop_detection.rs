//! Detects repetitive tool-call patterns.

/// Watches a sliding window of `(name, args)` signatures and fires when the
/// window is a whole number of repeats of a short pattern.
pub struct LoopDetector {
    window: usize,
    history: Vec<String>,
}

impl LoopDetector {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            history: Vec::new(),
        }
    }

    /// Record one call and report whether a loop pattern now fills the
    /// window. Never fires with fewer than `window` recorded calls.
    pub fn record_and_check(&mut self, name: &str, args: &str) -> bool {
        self.history.push(format!("{name}:{args}"));
        if self.history.len() < self.window || self.window == 0 {
            return false;
        }

        let recent = &self.history[self.history.len() - self.window..];
        for pattern_len in [1usize, 2, 3] {
            if self.window % pattern_len != 0 {
                continue;
            }
            let pattern = &recent[..pattern_len];
            let repeats = recent
                .chunks(pattern_len)
                .all(|chunk| chunk == pattern);
            if repeats {
                return true;
            }
        }
        false
    }

    /// Clear recorded history (after a steering injection, for instance).
    pub fn reset(&mut self) {
        self.history.clear();
    }
}

/// Canned steering messages injected when problems are detected.
pub struct SteeringMessages;

impl SteeringMessages {
    pub fn loop_detected(tool_name: &str) -> String {
        format!(
            "You appear to be repeating the same '{tool_name}' call pattern. \
             Step back, reconsider the approach, and try something different."
        )
    }

    pub fn refocus(goal: &str) -> String {
        format!("Refocus on the current goal: {goal}. Consider what remains and change approach.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_window_never_fires() {
        let mut d = LoopDetector::new(4);
        assert!(!d.record_and_check("a", "{}"));
        assert!(!d.record_and_check("a", "{}"));
        assert!(!d.record_and_check("a", "{}"));
        // Fourth identical call fills the window.
        assert!(d.record_and_check("a", "{}"));
    }

    #[test]
    fn length_two_pattern_fires() {
        let mut d = LoopDetector::new(4);
        assert!(!d.record_and_check("A", "{}"));
        assert!(!d.record_and_check("B", "{}"));
        assert!(!d.record_and_check("A", "{}"));
        assert!(d.record_and_check("B", "{}"));
    }

    #[test]
    fn distinct_calls_do_not_fire() {
        let mut d = LoopDetector::new(4);
        assert!(!d.record_and_check("A", "{}"));
        assert!(!d.record_and_check("B", "{}"));
        assert!(!d.record_and_check("C", "{}"));
        assert!(!d.record_and_check("D", "{}"));
    }

    #[test]
    fn length_three_pattern_fires_when_window_divides() {
        let mut d = LoopDetector::new(6);
        assert!(!d.record_and_check("A", "{}"));
        assert!(!d.record_and_check("B", "{}"));
        assert!(!d.record_and_check("C", "{}"));
        assert!(!d.record_and_check("A", "{}"));
        assert!(!d.record_and_check("B", "{}"));
        // Window now holds A B C A B C.
        assert!(d.record_and_check("C", "{}"));
    }

    #[test]
    fn pattern_length_must_divide_window() {
        // Window 4 cannot hold a whole number of length-3 patterns.
        let mut d = LoopDetector::new(4);
        d.record_and_check("A", "{}");
        d.record_and_check("B", "{}");
        d.record_and_check("C", "{}");
        assert!(!d.record_and_check("A", "{}"));
    }

    #[test]
    fn same_name_different_args_is_not_a_loop() {
        let mut d = LoopDetector::new(3);
        assert!(!d.record_and_check("read_file", r#"{"path":"a"}"#));
        assert!(!d.record_and_check("read_file", r#"{"path":"b"}"#));
        assert!(!d.record_and_check("read_file", r#"{"path":"c"}"#));
    }

    #[test]
    fn reset_requires_refilling_the_window() {
        let mut d = LoopDetector::new(3);
        d.record_and_check("a", "{}");
        d.record_and_check("a", "{}");
        d.reset();
        assert!(!d.record_and_check("a", "{}"));
        assert!(!d.record_and_check("a", "{}"));
        assert!(d.record_and_check("a", "{}"));
    }

    #[test]
    fn steering_messages_mention_the_tool() {
        let msg = SteeringMessages::loop_detected("grep");
        assert!(msg.contains("grep"));
        assert!(SteeringMessages::refocus("ship v1").contains("ship v1"));
    }
}
