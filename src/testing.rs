//! Scripted in-memory device for unit tests.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::device::{Command, Device, DeviceError, DeviceResult, ExecResult, RunningProcess};

/// What a spawned command does.
#[derive(Debug, Clone)]
pub enum SpawnReply {
    /// Writes the output and exits.
    Output(String),
    /// Writes the output and keeps running until killed.
    Hang(String),
}

#[derive(Debug, Clone)]
enum ExecReply {
    Stdout(String),
    Timeout,
}

/// Replies are matched by command prefix. When a rule has several replies
/// they are used in order and the last one repeats.
struct Rule<T> {
    prefix: String,
    replies: VecDeque<T>,
}

fn next_reply<T: Clone>(rules: &Mutex<Vec<Rule<T>>>, command: &str) -> Option<T> {
    let mut rules = rules.lock().unwrap();
    let rule = rules
        .iter_mut()
        .find(|rule| command.starts_with(&rule.prefix))?;
    if rule.replies.len() > 1 {
        rule.replies.pop_front()
    } else {
        rule.replies.front().cloned()
    }
}

fn push_rule<T>(rules: &Mutex<Vec<Rule<T>>>, prefix: &str, reply: T) {
    let mut rules = rules.lock().unwrap();
    match rules.iter_mut().find(|rule| rule.prefix == prefix) {
        Some(rule) => rule.replies.push_back(reply),
        None => rules.push(Rule {
            prefix: prefix.to_string(),
            replies: VecDeque::from([reply]),
        }),
    }
}

/// A device whose command output is scripted up front.
///
/// Commands are recorded as `program arg1 arg2 ...` (unquoted). Unscripted
/// `exec` calls succeed with empty output; unscripted `spawn` calls exit
/// immediately without output.
pub struct FakeDevice {
    serial: String,
    exec_rules: Mutex<Vec<Rule<ExecReply>>>,
    spawn_rules: Mutex<Vec<Rule<SpawnReply>>>,
    executed: Mutex<Vec<String>>,
}

impl FakeDevice {
    pub fn new(serial: &str) -> Self {
        Self {
            serial: serial.to_string(),
            exec_rules: Mutex::new(Vec::new()),
            spawn_rules: Mutex::new(Vec::new()),
            executed: Mutex::new(Vec::new()),
        }
    }

    /// `exec` of a command starting with `prefix` prints `stdout`.
    pub fn with_exec_output(self, prefix: &str, stdout: &str) -> Self {
        push_rule(&self.exec_rules, prefix, ExecReply::Stdout(stdout.to_string()));
        self
    }

    /// `exec` of a command starting with `prefix` times out.
    pub fn with_exec_timeout(self, prefix: &str) -> Self {
        push_rule(&self.exec_rules, prefix, ExecReply::Timeout);
        self
    }

    /// `spawn` of a command starting with `prefix` writes `output` and exits.
    pub fn with_spawn_output(self, prefix: &str, output: &str) -> Self {
        self.with_spawn_reply(prefix, SpawnReply::Output(output.to_string()))
    }

    pub fn with_spawn_reply(self, prefix: &str, reply: SpawnReply) -> Self {
        push_rule(&self.spawn_rules, prefix, reply);
        self
    }

    /// Every command run so far, `exec` and `spawn` alike.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    fn record(&self, cmd: &Command) -> String {
        let rendered = std::iter::once(cmd.program.as_str())
            .chain(cmd.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        self.executed.lock().unwrap().push(rendered.clone());
        rendered
    }
}

#[async_trait]
impl Device for FakeDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn model(&self) -> &str {
        "Fake"
    }

    async fn exec(&self, cmd: &Command) -> DeviceResult<ExecResult> {
        let rendered = self.record(cmd);
        match next_reply(&self.exec_rules, &rendered) {
            Some(ExecReply::Timeout) => Err(DeviceError::Timeout {
                command: rendered,
                timeout: cmd.timeout.unwrap_or(Duration::ZERO),
            }),
            Some(ExecReply::Stdout(stdout)) => Ok(ExecResult {
                exit_code: 0,
                stdout,
                stderr: String::new(),
                duration: Duration::ZERO,
            }),
            None => Ok(ExecResult {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                duration: Duration::ZERO,
            }),
        }
    }

    async fn spawn(&self, cmd: &Command, output: &Path) -> DeviceResult<RunningProcess> {
        let rendered = self.record(cmd);
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match next_reply(&self.spawn_rules, &rendered) {
            Some(SpawnReply::Output(text)) => {
                std::fs::write(output, text)?;
                Ok(RunningProcess::finished())
            }
            Some(SpawnReply::Hang(text)) => {
                std::fs::write(output, text)?;
                let exited = CancellationToken::new();
                let kill = CancellationToken::new();
                let process = RunningProcess::new(exited.clone(), kill.clone());
                tokio::spawn(async move {
                    kill.cancelled().await;
                    exited.cancel();
                });
                Ok(process)
            }
            None => {
                std::fs::write(output, "")?;
                Ok(RunningProcess::finished())
            }
        }
    }
}

/// Instrumentation output for `tests` with the given status codes, ending
/// with the final code line.
pub fn instrumentation_output(tests: &[(&str, &str, i32)]) -> String {
    let total = tests.len();
    let mut output = String::new();
    for (i, (class, method, code)) in tests.iter().enumerate() {
        let current = i + 1;
        for status in [1, *code] {
            output.push_str(&format!(
                "INSTRUMENTATION_STATUS: class={class}\n\
                 INSTRUMENTATION_STATUS: current={current}\n\
                 INSTRUMENTATION_STATUS: id=AndroidJUnitRunner\n\
                 INSTRUMENTATION_STATUS: numtests={total}\n"
            ));
            if status == -2 {
                output.push_str("INSTRUMENTATION_STATUS: stack=java.lang.AssertionError\n");
            }
            output.push_str(&format!(
                "INSTRUMENTATION_STATUS: test={method}\n\
                 INSTRUMENTATION_STATUS_CODE: {status}\n"
            ));
        }
    }
    output.push_str("INSTRUMENTATION_RESULT: stream=\n\nINSTRUMENTATION_CODE: -1\n");
    output
}
