//! Splits a device's logcat into one segment per test.
//!
//! The instrumentation runner logs a line under the `TestRunner` tag when a
//! test starts and when it finishes:
//!
//! ```text
//! 11-12 14:37:16.234 24855 24870 I TestRunner: started: logsIn(com.example.LoginTest)
//! 11-12 14:37:17.161 24855 24870 I TestRunner: finished: logsIn(com.example.LoginTest)
//! ```
//!
//! Everything between the two markers belongs to that test.

use tracing::warn;

use crate::module::TestDetails;

const TEST_RUNNER_TAG: &str = "TestRunner";
const STARTED: &str = "started";
const FINISHED: &str = "finished";
const STARTED_MARKER: &str = "TestRunner: started:";
const FINISHED_MARKER: &str = "TestRunner: finished:";

/// Log lines of one test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestLogSegment {
    pub details: TestDetails,
    /// Newline-terminated log lines.
    pub text: String,
}

impl TestLogSegment {
    fn open(details: TestDetails, first_line: &str) -> Self {
        let mut segment = Self {
            details,
            text: String::new(),
        };
        segment.append(first_line);
        segment
    }

    fn append(&mut self, line: &str) {
        self.text.push_str(line);
        self.text.push('\n');
    }
}

/// State machine holding at most one open segment.
#[derive(Debug, Default)]
pub struct LogDemuxer {
    current: Option<TestLogSegment>,
}

impl LogDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The test whose segment is open.
    pub fn open_test(&self) -> Option<&TestDetails> {
        self.current.as_ref().map(|s| &s.details)
    }

    /// Feeds one logcat line. Returns a segment when one is complete.
    pub fn push_line(&mut self, line: &str) -> Option<TestLogSegment> {
        if line.contains(STARTED_MARKER) {
            let flushed = self.current.take().map(|mut unfinished| {
                let note = format!(
                    "[droidshard]: Started next test without finishing the last one. \
                     Unfinished test: {}.{}",
                    unfinished.details.class, unfinished.details.method
                );
                warn!("{}", note);
                unfinished.append(&note);
                unfinished
            });
            let details = parse_test_details(line).unwrap_or_else(|| {
                TestDetails::new("CorruptFormatClass", "CorruptFormatMethod")
            });
            self.current = Some(TestLogSegment::open(details, line));
            return flushed;
        }

        if line.contains(FINISHED_MARKER) {
            let Some(current) = &self.current else {
                warn!("Finished a test before starting one, logcat cannot be recorded");
                return None;
            };
            if parse_test_details(line).as_ref() != Some(&current.details) {
                warn!(
                    "Finished a different test than {}, logcat cannot be recorded",
                    current.details
                );
                return None;
            }
            let mut finished = self.current.take()?;
            finished.append(line);
            return Some(finished);
        }

        if let Some(current) = &mut self.current {
            current.append(line);
        }
        None
    }
}

/// Extracts `method(class)` following a `TestRunner: started:` or
/// `TestRunner: finished:` marker.
pub fn parse_test_details(line: &str) -> Option<TestDetails> {
    let index = line.find(TEST_RUNNER_TAG)?;
    let tokens: Vec<&str> = line[index..].split(':').collect();
    let [_, kind, test] = tokens.as_slice() else {
        return None;
    };
    let kind = kind.trim_start();
    if kind != STARTED && kind != FINISHED {
        return None;
    }

    let test = test.trim();
    let (method, class) = match test.split_once('(') {
        Some((method, class)) => (method.trim(), class),
        None => (test, test),
    };
    let class = class.strip_suffix(')').unwrap_or(class);
    Some(TestDetails::new(class, method))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(method: &str, class: &str) -> String {
        format!("11-12 14:37:16.234 24855 24870 I TestRunner: started: {method}({class})")
    }

    fn finished(method: &str, class: &str) -> String {
        format!("11-12 14:37:17.161 24855 24870 I TestRunner: finished: {method}({class})")
    }

    #[test]
    fn test_parse_test_details() {
        assert_eq!(
            parse_test_details(&started("some_test", "com.example.SomeTest")),
            Some(TestDetails::new("com.example.SomeTest", "some_test"))
        );
        assert_eq!(parse_test_details("I ActivityManager: Start proc"), None);
        assert_eq!(parse_test_details("I TestRunner: run started: 3 tests"), None);
    }

    #[test]
    fn test_start_and_finish_produce_one_segment() {
        let mut demux = LogDemuxer::new();
        assert_eq!(demux.push_line("noise before any test"), None);
        assert_eq!(demux.push_line(&started("m", "C")), None);
        assert_eq!(demux.push_line("D Login: clicked"), None);

        let segment = demux.push_line(&finished("m", "C")).unwrap();
        assert_eq!(segment.details, TestDetails::new("C", "m"));
        assert_eq!(
            segment.text,
            format!("{}\nD Login: clicked\n{}\n", started("m", "C"), finished("m", "C"))
        );
        assert!(demux.open_test().is_none());
    }

    #[test]
    fn test_start_without_finish_closes_unfinished_segment() {
        let mut demux = LogDemuxer::new();
        let mut segments = Vec::new();
        for line in [
            started("m1", "C1"),
            started("m2", "C2"),
            finished("m2", "C2"),
        ] {
            segments.extend(demux.push_line(&line));
        }

        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].details, TestDetails::new("C1", "m1"));
        assert!(
            segments[0]
                .text
                .trim_end()
                .ends_with("Unfinished test: C1.m1")
        );
        assert_eq!(segments[1].details, TestDetails::new("C2", "m2"));
        assert_eq!(
            segments[1].text,
            format!("{}\n{}\n", started("m2", "C2"), finished("m2", "C2"))
        );
    }

    #[test]
    fn test_unmatched_finish_is_dropped() {
        let mut demux = LogDemuxer::new();
        assert_eq!(demux.push_line(&finished("m", "C")), None);
        assert!(demux.open_test().is_none());

        demux.push_line(&started("m", "C"));
        assert_eq!(demux.push_line(&finished("other", "C")), None);
        assert_eq!(demux.open_test(), Some(&TestDetails::new("C", "m")));

        let segment = demux.push_line(&finished("m", "C")).unwrap();
        assert!(!segment.text.contains("other"));
    }

    #[test]
    fn test_corrupt_start_line_gets_placeholder_identity() {
        let mut demux = LogDemuxer::new();
        demux.push_line("I TestRunner: started: weird:extra(C)");
        assert_eq!(
            demux.open_test(),
            Some(&TestDetails::new("CorruptFormatClass", "CorruptFormatMethod"))
        );
    }
}
