//! Scripted executor used by tests across the crate

use super::{CommandExecutor, CommandRequest, CommandResult};
use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Canned reply for a matching command
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Exit {
        code: i32,
        stdout: String,
        stderr: String,
    },
    SpawnFailure,
    Timeout,
}

impl Reply {
    pub(crate) fn ok(stdout: impl Into<String>) -> Self {
        Reply::Exit {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub(crate) fn fail(code: i32, stderr: impl Into<String>) -> Self {
        Reply::Exit {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

struct Rule {
    pattern: Vec<String>,
    replies: VecDeque<Reply>,
}

impl Rule {
    // Pattern tokens must appear in argv in order, not necessarily adjacent.
    fn matches(&self, argv: &[String]) -> bool {
        let mut tokens = argv.iter();
        self.pattern.iter().all(|p| tokens.any(|a| a == p))
    }

    // The last queued reply is sticky.
    fn next(&mut self) -> Reply {
        if self.replies.len() > 1 {
            self.replies.pop_front().unwrap_or_else(|| Reply::ok(""))
        } else {
            self.replies.front().cloned().unwrap_or_else(|| Reply::ok(""))
        }
    }
}

/// Records every request and answers from a script; unmatched commands succeed
#[derive(Default)]
pub(crate) struct ScriptedExecutor {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<CommandRequest>>,
}

impl ScriptedExecutor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue `reply` for commands containing `pattern`; rules match in insertion order
    pub(crate) fn on(self, pattern: &[&str], reply: Reply) -> Self {
        self.push(pattern, reply);
        self
    }

    /// Like [`on`](Self::on), for a script already in use
    pub(crate) fn push(&self, pattern: &[&str], reply: Reply) {
        let mut rules = self.rules.lock().unwrap();
        let pattern: Vec<String> = pattern.iter().map(|s| s.to_string()).collect();
        match rules.iter_mut().find(|r| r.pattern == pattern) {
            Some(rule) => rule.replies.push_back(reply),
            None => rules.push(Rule {
                pattern,
                replies: VecDeque::from([reply]),
            }),
        }
    }

    pub(crate) fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().iter().map(|r| r.argv.clone()).collect()
    }

    pub(crate) fn requests(&self) -> Vec<CommandRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn count_matching(&self, pattern: &[&str]) -> usize {
        let wanted = Rule {
            pattern: pattern.iter().map(|s| s.to_string()).collect(),
            replies: VecDeque::new(),
        };
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|r| wanted.matches(&r.argv))
            .count()
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn execute(&self, request: &CommandRequest) -> Result<CommandResult> {
        self.calls.lock().unwrap().push(request.clone());

        let reply = {
            let mut rules = self.rules.lock().unwrap();
            rules
                .iter_mut()
                .find(|r| r.matches(&request.argv))
                .map(Rule::next)
                .unwrap_or_else(|| Reply::ok(""))
        };

        let result = |code: Option<i32>, stdout: String, stderr: String| CommandResult {
            argv: request.argv.clone(),
            exit_code: code,
            stdout,
            stderr,
            elapsed: Duration::from_millis(1),
        };

        match reply {
            Reply::Exit { code, stdout, stderr } => Ok(result(Some(code), stdout, stderr)),
            Reply::SpawnFailure => {
                let io = std::io::Error::new(std::io::ErrorKind::NotFound, "No such file or directory");
                Err(OrchestratorError::execution(&request.argv, &io))
            }
            Reply::Timeout => Err(OrchestratorError::timeout(result(None, String::new(), String::new()))),
        }
    }
}
