//! Two-stage truncation for tool output recorded into session history.
//!
//! Stage 1 caps characters per tool (head + marker + tail); stage 2 caps
//! lines for line-oriented tools. Events always carry the untruncated
//! output; only the history copy is truncated.

use std::collections::HashMap;

/// Default per-tool character caps. Callers may override via
/// `SessionConfig::tool_output_limits`.
const DEFAULT_CHAR_CAPS: &[(&str, usize)] = &[
    ("read_file", 50_000),
    ("bash", 30_000),
    ("grep", 20_000),
    ("glob", 10_000),
];

const FALLBACK_CHAR_CAP: usize = 50_000;

/// Line caps for tools whose output is line-oriented.
const LINE_CAPS: &[(&str, usize)] = &[("bash", 256), ("grep", 200), ("glob", 500)];

/// Room reserved for the visible truncation marker.
const MARKER_RESERVE: usize = 150;

pub fn char_cap_for(tool: &str, overrides: &HashMap<String, usize>) -> usize {
    if let Some(cap) = overrides.get(tool) {
        return *cap;
    }
    DEFAULT_CHAR_CAPS
        .iter()
        .find(|(name, _)| *name == tool)
        .map(|(_, cap)| *cap)
        .unwrap_or(FALLBACK_CHAR_CAP)
}

pub fn line_cap_for(tool: &str) -> Option<usize> {
    LINE_CAPS
        .iter()
        .find(|(name, _)| *name == tool)
        .map(|(_, cap)| *cap)
}

/// Largest index `<= at` that falls on a char boundary.
fn floor_boundary(s: &str, at: usize) -> usize {
    let mut i = at.min(s.len());
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Smallest index `>= at` that falls on a char boundary.
fn ceil_boundary(s: &str, at: usize) -> usize {
    let mut i = at.min(s.len());
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

/// Stage 1: character cap with a head/marker/tail splice.
pub fn truncate_chars(content: &str, cap: usize) -> String {
    if content.len() <= cap {
        return content.to_string();
    }
    let head_size = floor_boundary(content, cap * 3 / 4);
    let tail_size = cap.saturating_sub(head_size).saturating_sub(MARKER_RESERVE);
    let tail_start = ceil_boundary(content, content.len() - tail_size);

    let removed = tail_start - head_size;
    let marker = format!(
        "\n\n[WARNING: Tool output was truncated. {removed} characters removed from the middle. \
         The full output is available in the event stream.]\n\n"
    );

    let mut out = String::with_capacity(cap + marker.len());
    out.push_str(&content[..head_size]);
    out.push_str(&marker);
    if tail_size > 0 {
        out.push_str(&content[tail_start..]);
    }
    out
}

/// Stage 2: line cap keeping the first and last halves around a marker.
pub fn truncate_lines(content: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = content.split('\n').collect();
    if lines.len() <= max_lines {
        return content.to_string();
    }
    let head_count = max_lines / 2;
    let tail_count = max_lines - head_count;
    let omitted = lines.len() - head_count - tail_count;

    let mut out = String::new();
    out.push_str(&lines[..head_count].join("\n"));
    out.push_str(&format!("\n[... {omitted} lines omitted ...]\n"));
    out.push_str(&lines[lines.len() - tail_count..].join("\n"));
    out
}

/// The full pipeline: character cap first, then the tool's line cap.
pub fn apply(tool: &str, output: &str, overrides: &HashMap<String, usize>) -> String {
    let mut result = truncate_chars(output, char_cap_for(tool, overrides));
    if let Some(cap) = line_cap_for(tool) {
        result = truncate_lines(&result, cap);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn within_cap_is_unchanged() {
        let overrides = HashMap::new();
        let short = "small output";
        assert_eq!(apply("read_file", short, &overrides), short);
    }

    #[test]
    fn over_cap_contains_marker_and_bounds() {
        let overrides = HashMap::new();
        let long = "x".repeat(60_000);
        let result = apply("read_file", &long, &overrides);
        assert!(result.contains("[WARNING: Tool output was truncated."));
        assert!(result.contains("characters removed from the middle"));
        // Head is 3/4 of the 50000 cap.
        assert!(result.starts_with(&"x".repeat(37_500)));
        assert!(result.len() < long.len());
    }

    #[test]
    fn per_tool_caps_differ() {
        let overrides = HashMap::new();
        assert_eq!(char_cap_for("read_file", &overrides), 50_000);
        assert_eq!(char_cap_for("bash", &overrides), 30_000);
        assert_eq!(char_cap_for("grep", &overrides), 20_000);
        assert_eq!(char_cap_for("glob", &overrides), 10_000);
        assert_eq!(char_cap_for("unknown_tool", &overrides), 50_000);
    }

    #[test]
    fn caller_overrides_win() {
        let overrides = HashMap::from([("bash".to_string(), 100usize)]);
        assert_eq!(char_cap_for("bash", &overrides), 100);
        let result = apply("bash", &"y".repeat(500), &overrides);
        assert!(result.contains("[WARNING:"));
    }

    #[test]
    fn line_truncation_preserves_head_marker_tail_counts() {
        let content = (0..300)
            .map(|i| format!("line {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let result = truncate_lines(&content, 10);
        let lines: Vec<&str> = result.split('\n').collect();
        // 5 head + 1 marker + 5 tail.
        assert_eq!(lines.len(), 11);
        assert_eq!(lines[0], "line 0");
        assert_eq!(lines[5], "[... 290 lines omitted ...]");
        assert_eq!(lines[10], "line 299");
    }

    #[test]
    fn line_cap_only_for_line_oriented_tools() {
        assert_eq!(line_cap_for("bash"), Some(256));
        assert_eq!(line_cap_for("grep"), Some(200));
        assert_eq!(line_cap_for("glob"), Some(500));
        assert_eq!(line_cap_for("read_file"), None);
    }

    #[test]
    fn bash_gets_both_stages() {
        let overrides = HashMap::new();
        let content = (0..400)
            .map(|i| format!("row {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let result = apply("bash", &content, &overrides);
        let line_count = result.split('\n').count();
        assert_eq!(line_count, 257); // 256 kept + marker line
        assert!(result.contains("lines omitted"));
    }

    #[test]
    fn multibyte_content_is_split_on_char_boundaries() {
        let content = "é".repeat(200); // 2 bytes per char
        let result = truncate_chars(&content, 100);
        assert!(result.contains("[WARNING:"));
        // No panic and the output is valid UTF-8 by construction.
        assert!(result.starts_with('é'));
    }

    #[test]
    fn tiny_cap_keeps_head_only() {
        let content = "z".repeat(1000);
        let result = truncate_chars(&content, 100);
        // cap 100: head 75, no room for tail after the marker reserve.
        assert!(result.starts_with(&"z".repeat(75)));
        assert!(result.contains("[WARNING:"));
    }
}
