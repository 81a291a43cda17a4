//! Parser for the `am instrument -r` raw output protocol.
//!
//! The runner reports every test twice: once when it starts and once when it
//! ends. Each report is a block of `INSTRUMENTATION_STATUS: key=value` lines
//! closed by an `INSTRUMENTATION_STATUS_CODE: <code>` line:
//!
//! ```text
//! INSTRUMENTATION_STATUS: class=com.example.LoginTest
//! INSTRUMENTATION_STATUS: current=1
//! INSTRUMENTATION_STATUS: id=AndroidJUnitRunner
//! INSTRUMENTATION_STATUS: numtests=1
//! INSTRUMENTATION_STATUS: stream=
//! com.example.LoginTest:
//! INSTRUMENTATION_STATUS: test=logsIn
//! INSTRUMENTATION_STATUS_CODE: 1
//! ...
//! INSTRUMENTATION_STATUS_CODE: 0
//! INSTRUMENTATION_RESULT: stream=
//! OK (1 test)
//! INSTRUMENTATION_CODE: -1
//! ```
//!
//! Values may continue over several lines (streams and stack traces).
//! [`InstrumentationParser`] is fed one line at a time and yields a
//! [`InstrumentationTestResult`] whenever a start block is matched by its
//! terminal block.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::module::TestDetails;
use crate::tail::FileTail;

const STATUS_PREFIX: &str = "INSTRUMENTATION_STATUS:";
const STATUS_CODE_PREFIX: &str = "INSTRUMENTATION_STATUS_CODE:";
const RESULT_PREFIX: &str = "INSTRUMENTATION_RESULT:";
const FINAL_CODE_PREFIX: &str = "INSTRUMENTATION_CODE";
const CRASH_MARKER: &str = "INSTRUMENTATION_RESULT: shortMsg=";
const RUNNER_NOT_FOUND_MARKER: &str =
    "INSTRUMENTATION_STATUS: Error=Unable to find instrumentation info for";

/// Errors that end the parsing of one instrumentation run.
#[derive(Debug, thiserror::Error)]
pub enum InstrumentationError {
    /// The instrumented process crashed.
    #[error("Instrumentation crashed: {0}")]
    Crash(String),

    /// The requested runner is not installed on the device.
    #[error("Test runner {0} not found on device")]
    RunnerNotFound(String),

    #[error("Unknown instrumentation status code {0}")]
    UnknownStatusCode(String),

    #[error("Status block is missing {0}")]
    MissingField(&'static str),

    #[error("Status block has invalid {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },

    #[error("Test {details} (#{current}) started twice")]
    DuplicateStart { details: TestDetails, current: usize },

    /// Fewer results than the runner announced.
    #[error("Instrumentation reported {expected} tests but {actual} completed")]
    Inconsistent { expected: usize, actual: usize },

    #[error("Instrumentation output ended after {emitted} results")]
    UnexpectedEnd { emitted: usize },

    #[error("Failed to read instrumentation output: {0}")]
    Io(#[from] std::io::Error),
}

/// Status codes of `INSTRUMENTATION_STATUS_CODE` lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Start,
    Ok,
    Failure,
    Ignored,
    AssumptionFailure,
}

impl StatusCode {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().parse::<i32>().ok()? {
            1 => Some(Self::Start),
            0 => Some(Self::Ok),
            -2 => Some(Self::Failure),
            -3 => Some(Self::Ignored),
            -4 => Some(Self::AssumptionFailure),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Start => 1,
            Self::Ok => 0,
            Self::Failure => -2,
            Self::Ignored => -3,
            Self::AssumptionFailure => -4,
        }
    }
}

/// One decoded status block.
#[derive(Debug, Clone)]
pub struct InstrumentationEntry {
    pub num_tests: usize,
    pub stream: String,
    pub id: String,
    pub test: String,
    pub class: String,
    pub current: usize,
    pub stack: String,
    pub status_code: StatusCode,
    /// When the closing status code line was parsed.
    pub timestamp: Instant,
}

impl InstrumentationEntry {
    fn details(&self) -> TestDetails {
        TestDetails::new(&self.class, &self.test)
    }
}

/// Outcome of one test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    /// Skipped by the runner. Assumption failures carry their stack trace.
    Ignored { stacktrace: String },
    Failed { stacktrace: String },
}

impl TestStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// A start block paired with its terminal block.
#[derive(Debug, Clone)]
pub struct InstrumentationTestResult {
    /// 1-based position within the run.
    pub index: usize,
    /// Tests announced by the runner.
    pub total: usize,
    pub details: TestDetails,
    pub status: TestStatus,
    pub duration: Duration,
}

type OpenKey = (String, String, usize);

/// Line-fed state machine over instrumentation output.
#[derive(Debug, Default)]
pub struct InstrumentationParser {
    block: HashMap<String, String>,
    last_key: Option<String>,
    open: HashMap<OpenKey, InstrumentationEntry>,
    num_tests: Option<usize>,
    final_entries: usize,
    emitted: usize,
    finished: bool,
}

impl InstrumentationParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the run is complete. Further lines are ignored.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of results produced so far.
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    /// Feeds one line of output, timestamped now.
    pub fn push_line(
        &mut self,
        line: &str,
    ) -> Result<Option<InstrumentationTestResult>, InstrumentationError> {
        self.push_line_at(line, Instant::now())
    }

    /// Feeds one line of output parsed at `at`.
    pub fn push_line_at(
        &mut self,
        line: &str,
        at: Instant,
    ) -> Result<Option<InstrumentationTestResult>, InstrumentationError> {
        if self.finished {
            return Ok(None);
        }
        let trimmed = line.trim();

        if let Some(pos) = trimmed.find(CRASH_MARKER) {
            let message = trimmed[pos + CRASH_MARKER.len()..].trim().to_string();
            return Err(InstrumentationError::Crash(message));
        }
        if trimmed.contains(RUNNER_NOT_FOUND_MARKER) {
            return Err(InstrumentationError::RunnerNotFound(runner_from_component(
                trimmed,
            )));
        }

        if trimmed.starts_with(FINAL_CODE_PREFIX) {
            self.finished = true;
            return match self.num_tests {
                Some(expected) if self.emitted < expected => {
                    Err(InstrumentationError::Inconsistent {
                        expected,
                        actual: self.emitted,
                    })
                }
                _ => Ok(None),
            };
        }

        if let Some(code) = trimmed.strip_prefix(STATUS_CODE_PREFIX) {
            self.last_key = None;
            let entry = self.take_entry(code, at)?;
            return self.process_entry(entry);
        }

        if let Some(pair) = trimmed.strip_prefix(STATUS_PREFIX) {
            let (key, value) = pair.trim_start().split_once('=').unwrap_or((pair, ""));
            let key = key.trim().to_string();
            self.block.insert(key.clone(), value.to_string());
            self.last_key = Some(key);
            return Ok(None);
        }

        if trimmed.starts_with(RESULT_PREFIX) {
            self.last_key = None;
            return Ok(None);
        }

        if let Some(key) = &self.last_key
            && let Some(value) = self.block.get_mut(key)
        {
            value.push('\n');
            value.push_str(line.trim_end());
        }
        Ok(None)
    }

    /// Checks the state once the output has ended.
    pub fn finish(&self) -> Result<(), InstrumentationError> {
        if self.finished {
            Ok(())
        } else {
            Err(InstrumentationError::UnexpectedEnd {
                emitted: self.emitted,
            })
        }
    }

    fn take_entry(
        &mut self,
        code: &str,
        at: Instant,
    ) -> Result<InstrumentationEntry, InstrumentationError> {
        let mut block = std::mem::take(&mut self.block);
        let status_code = StatusCode::parse(code)
            .ok_or_else(|| InstrumentationError::UnknownStatusCode(code.trim().to_string()))?;

        let mut text = |key: &str| block.remove(key).map(|v| v.trim_end().to_string());
        let num_tests = text("numtests");
        let current = text("current");

        Ok(InstrumentationEntry {
            num_tests: parse_count("numtests", num_tests)?,
            current: parse_count("current", current)?,
            stream: text("stream").unwrap_or_default(),
            id: text("id").unwrap_or_default(),
            test: text("test").unwrap_or_default(),
            class: text("class").unwrap_or_default(),
            stack: text("stack").unwrap_or_default(),
            status_code,
            timestamp: at,
        })
    }

    fn process_entry(
        &mut self,
        entry: InstrumentationEntry,
    ) -> Result<Option<InstrumentationTestResult>, InstrumentationError> {
        self.num_tests = Some(entry.num_tests);
        let is_final = entry.current == entry.num_tests;
        let key = (entry.class.clone(), entry.test.clone(), entry.current);

        let result = if entry.status_code == StatusCode::Start {
            if self.open.contains_key(&key) {
                return Err(InstrumentationError::DuplicateStart {
                    details: entry.details(),
                    current: entry.current,
                });
            }
            self.open.insert(key, entry.clone());
            None
        } else if let Some(start) = self.open.remove(&key) {
            self.emitted += 1;
            Some(InstrumentationTestResult {
                index: entry.current,
                total: entry.num_tests,
                details: entry.details(),
                status: status_of(&entry),
                duration: entry.timestamp.saturating_duration_since(start.timestamp),
            })
        } else {
            warn!(
                "Ignoring {:?} for {} without a start",
                entry.status_code,
                entry.details()
            );
            None
        };

        if is_final {
            self.final_entries += 1;
            if self.final_entries >= 2 {
                debug!("Instrumentation finished after {} tests", self.emitted);
                self.finished = true;
                if self.emitted < entry.num_tests {
                    return Err(InstrumentationError::Inconsistent {
                        expected: entry.num_tests,
                        actual: self.emitted,
                    });
                }
            }
        }

        Ok(result)
    }
}

fn status_of(entry: &InstrumentationEntry) -> TestStatus {
    match entry.status_code {
        StatusCode::Ok | StatusCode::Start => TestStatus::Passed,
        StatusCode::Ignored => TestStatus::Ignored {
            stacktrace: String::new(),
        },
        StatusCode::AssumptionFailure => TestStatus::Ignored {
            stacktrace: entry.stack.clone(),
        },
        StatusCode::Failure => TestStatus::Failed {
            stacktrace: entry.stack.clone(),
        },
    }
}

fn parse_count(field: &'static str, raw: Option<String>) -> Result<usize, InstrumentationError> {
    let raw = raw.ok_or(InstrumentationError::MissingField(field))?;
    raw.trim()
        .parse()
        .map_err(|_| InstrumentationError::InvalidField { field, value: raw })
}

/// `... ComponentInfo{com.example.test/androidx.test.runner.AndroidJUnitRunner}`
/// yields the runner class.
fn runner_from_component(line: &str) -> String {
    let component = line
        .split_once("ComponentInfo{")
        .and_then(|(_, rest)| rest.split_once('}'))
        .map(|(inner, _)| inner)
        .unwrap_or(line);
    match component.split_once('/') {
        Some((_, runner)) => runner.to_string(),
        None => component.to_string(),
    }
}

/// Parses a whole instrumentation output file as it is being written.
///
/// Returns once the runner reported its last test or the final code line.
pub async fn read_test_results(
    mut tail: FileTail,
) -> Result<Vec<InstrumentationTestResult>, InstrumentationError> {
    let mut parser = InstrumentationParser::new();
    let mut results = Vec::new();
    while let Some(line) = tail.next_line().await? {
        if let Some(result) = parser.push_line(&line)? {
            results.push(result);
        }
        if parser.is_finished() {
            break;
        }
    }
    parser.finish()?;
    Ok(results)
}
