use std::fmt;

use tokio::sync::mpsc::Receiver;

use crate::monitor::domain::SubjectCommand;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputSource {
    Stdout,
    Stderr,
}

/// A single line of subject output, newline stripped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputLine {
    pub source: OutputSource,
    pub text: String,
}

impl OutputLine {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            source: OutputSource::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            source: OutputSource::Stderr,
            text: text.into(),
        }
    }
}

/// Combined stdout/stderr stream. Closed once the subject (and anything
/// holding its pipes) is gone.
pub type OutputLines = Receiver<OutputLine>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitOutcome {
    Exited(i32),
    /// Killed by a signal. The number is absent on platforms without signals.
    Signaled(Option<i32>),
}

impl ExitOutcome {
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitOutcome::Exited(code) => Some(*code),
            ExitOutcome::Signaled(_) => None,
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Exited(code) => write!(f, "exited with code {}", code),
            ExitOutcome::Signaled(Some(signal)) => write!(f, "killed by signal {}", signal),
            ExitOutcome::Signaled(None) => write!(f, "terminated abnormally"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LaunchError {
    #[error("subject not found: {path}")]
    NotFound { path: String },
    #[error("failed to spawn {path}: {msg}")]
    SpawnFailed { path: String, msg: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to reap subject: {msg}")]
    Wait { msg: String },
    #[error("failed to terminate subject: {msg}")]
    Terminate { msg: String },
}

#[mockall::automock]
#[async_trait::async_trait]
pub trait ProcessRunner: fmt::Debug + Send + Sync {
    async fn start(
        &self,
        command: &SubjectCommand,
    ) -> Result<Box<dyn ProcessHandle>, LaunchError>;
}

/// A live subject process. Owned by exactly one run.
#[async_trait::async_trait]
pub trait ProcessHandle: fmt::Debug + Send {
    fn id(&self) -> Option<u32>;

    /// Hands out the output stream. Returns `None` on every call after the first.
    fn take_output(&mut self) -> Option<OutputLines>;

    /// Waits for the process to exit and reaps it. Cancel safe.
    async fn wait(&mut self) -> Result<ExitOutcome, ProcessError>;

    /// Forcibly kills the process. Safe to call after it has already exited.
    async fn terminate(&mut self) -> Result<(), ProcessError>;
}
