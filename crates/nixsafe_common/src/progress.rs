//! Progress reporting
//!
//! Caller-supplied callback invoked synchronously at fixed checkpoints. No
//! callback means no-op. Tool output lines of the form `[3/10 built]` or
//! `42%` are mapped into the execution band. Forwarded lines are redacted
//! first; the callback never sees raw tool output.

use crate::redaction::redact;
use regex::Regex;
use std::sync::{Arc, LazyLock};

/// `(message, percent)` callback
pub type ProgressCallback = Arc<dyn Fn(&str, u8) + Send + Sync>;

/// Fixed checkpoints on the 0..=100 scale
pub mod checkpoint {
    pub const VALIDATION_PASSED: u8 = 10;
    pub const SNAPSHOT_TAKEN: u8 = 20;
    pub const EXECUTION_STARTED: u8 = 30;
    pub const EXECUTION_BAND_END: u8 = 90;
    pub const EXECUTION_FINISHED: u8 = 100;
}

static FRACTION_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\[(\d+)/(\d+)").ok());

static PERCENT_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?:^|\s)(\d{1,3})%").ok());

/// Completion fraction (0..=100) reported by a tool output line
pub fn parse_tool_progress(line: &str) -> Option<u8> {
    if let Some(caps) = FRACTION_RE.as_ref().and_then(|re| re.captures(line)) {
        let done: u64 = caps.get(1)?.as_str().parse().ok()?;
        let total: u64 = caps.get(2)?.as_str().parse().ok()?;
        if total == 0 {
            return None;
        }
        return Some((done.min(total) * 100 / total) as u8);
    }

    let caps = PERCENT_RE.as_ref().and_then(|re| re.captures(line))?;
    let percent: u64 = caps.get(1)?.as_str().parse().ok()?;
    Some(percent.min(100) as u8)
}

/// Map a tool percentage into the execution band
pub fn execution_band(tool_percent: u8) -> u8 {
    let start = checkpoint::EXECUTION_STARTED as u32;
    let end = checkpoint::EXECUTION_BAND_END as u32;
    (start + (end - start) * tool_percent.min(100) as u32 / 100) as u8
}

/// Thin wrapper so call sites never branch on the callback
#[derive(Clone, Default)]
pub struct ProgressReporter {
    callback: Option<ProgressCallback>,
}

impl ProgressReporter {
    pub fn new(callback: Option<ProgressCallback>) -> Self {
        Self { callback }
    }

    pub fn silent() -> Self {
        Self { callback: None }
    }

    pub fn report(&self, message: &str, percent: u8) {
        if let Some(callback) = &self.callback {
            callback(message, percent.min(100));
        }
    }

    /// Forward a tool output line (redacted) when it carries progress
    pub fn report_tool_line(&self, line: &str) {
        if self.callback.is_none() {
            return;
        }
        if let Some(percent) = parse_tool_progress(line) {
            self.report(&redact(line.trim()), execution_band(percent));
        }
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_parse_fraction() {
        assert_eq!(parse_tool_progress("[3/10 built, 1 copied]"), Some(30));
        assert_eq!(parse_tool_progress("[0/0 built]"), None);
        assert_eq!(parse_tool_progress("[12/10 built]"), Some(100));
    }

    #[test]
    fn test_parse_percent() {
        assert_eq!(parse_tool_progress("downloading 45% done"), Some(45));
        assert_eq!(parse_tool_progress("50%"), Some(50));
        assert_eq!(parse_tool_progress("no progress here"), None);
    }

    #[test]
    fn test_execution_band() {
        assert_eq!(execution_band(0), checkpoint::EXECUTION_STARTED);
        assert_eq!(execution_band(100), checkpoint::EXECUTION_BAND_END);
        assert_eq!(execution_band(50), 60);
    }

    #[test]
    fn test_silent_reporter_is_noop() {
        let reporter = ProgressReporter::silent();
        reporter.report("anything", 50);
        reporter.report_tool_line("[1/2]");
    }

    #[test]
    fn test_callback_receives_checkpoints() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reporter = ProgressReporter::new(Some(Arc::new(move |msg: &str, pct: u8| {
            sink.lock().unwrap().push((msg.to_string(), pct));
        })));

        reporter.report("validation passed", checkpoint::VALIDATION_PASSED);
        reporter.report_tool_line("[1/2 built]");
        reporter.report_tool_line("plain output");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], ("validation passed".to_string(), 10));
        assert_eq!(seen[1].1, 60);
    }

    #[test]
    fn test_tool_line_redacted_before_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reporter = ProgressReporter::new(Some(Arc::new(move |msg: &str, _pct: u8| {
            sink.lock().unwrap().push(msg.to_string());
        })));

        reporter.report_tool_line("[1/2 built] password=hunter2");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(!seen[0].contains("hunter2"), "{}", seen[0]);
        assert!(seen[0].starts_with("[1/2 built]"));
    }
}
