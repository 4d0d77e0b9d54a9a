use std::{fmt, path::PathBuf, str::FromStr, sync::Arc, time::Duration};

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_LOOP_COUNT: u32 = 5;
pub const DEFAULT_SLEEP_STEP_SECONDS: u64 = 3;

/// One timestamped progress line emitted by the subject.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Heartbeat {
    pub sequence: u32,
    pub wall_clock_time: NaiveTime,
    pub declared_sleep_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("loop count must be at least 1, got {0}")]
    InvalidLoopCount(u32),
    #[error("overall timeout must be positive")]
    ZeroTimeout,
    #[error("unknown expected-sleep formula: {0}")]
    UnknownFormula(String),
    #[error("invalid suite file {path}: {msg}")]
    Suite { path: PathBuf, msg: String },
}

/// Maps a 1-based iteration index to the sleep (in seconds) the subject is
/// expected to declare for it.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExpectedDuration {
    label: String,
    func: Arc<dyn Fn(u32) -> u64 + Send + Sync>,
}

impl ExpectedDuration {
    pub fn new<F>(label: impl Into<String>, func: F) -> Self
    where
        F: Fn(u32) -> u64 + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            func: Arc::new(func),
        }
    }

    pub fn linear(step: u64) -> Self {
        Self::new(format!("linear:{}", step), move |i| {
            u64::from(i).saturating_mul(step)
        })
    }

    pub fn cubic() -> Self {
        Self::new("cubic", |i| u64::from(i).saturating_pow(3))
    }

    pub fn constant(seconds: u64) -> Self {
        Self::new(format!("constant:{}", seconds), move |_| seconds)
    }

    pub fn seconds_for(&self, iteration_index: u32) -> u64 {
        (self.func)(iteration_index)
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Default for ExpectedDuration {
    fn default() -> Self {
        Self::linear(DEFAULT_SLEEP_STEP_SECONDS)
    }
}

impl fmt::Debug for ExpectedDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ExpectedDuration").field(&self.label).finish()
    }
}

impl fmt::Display for ExpectedDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

impl FromStr for ExpectedDuration {
    type Err = ConfigError;

    /// Accepts `linear`, `linear:<step>`, `cubic` and `constant:<seconds>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || ConfigError::UnknownFormula(s.to_string());
        let (name, arg) = match s.trim().split_once(':') {
            Some((name, arg)) => (name.trim(), Some(arg.trim())),
            None => (s.trim(), None),
        };
        let number = |arg: Option<&str>| -> Result<Option<u64>, ConfigError> {
            arg.map(|a| a.parse::<u64>().map_err(|_| unknown()))
                .transpose()
        };

        match name.to_ascii_lowercase().as_str() {
            "linear" => Ok(Self::linear(
                number(arg)?.unwrap_or(DEFAULT_SLEEP_STEP_SECONDS),
            )),
            "cubic" if arg.is_none() => Ok(Self::cubic()),
            "constant" => number(arg)?.map(Self::constant).ok_or_else(unknown),
            _ => Err(unknown()),
        }
    }
}

impl TryFrom<String> for ExpectedDuration {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ExpectedDuration> for String {
    fn from(value: ExpectedDuration) -> Self {
        value.label
    }
}

/// Caller-supplied contract for a single monitored run.
#[derive(Clone, Debug, Serialize)]
pub struct RunConfig {
    pub loop_count: u32,
    pub expected_exit_code: i32,
    pub per_heartbeat_tolerance_ms: u64,
    pub overall_timeout_ms: u64,
    pub expected_duration: ExpectedDuration,
    /// Extra silence allowed after a heartbeat's declared sleep (plus
    /// tolerance) before the subject is considered stalled. `None` disables
    /// the per-heartbeat deadline.
    pub heartbeat_grace_ms: Option<u64>,
}

impl RunConfig {
    pub fn new(
        loop_count: u32,
        expected_exit_code: i32,
        per_heartbeat_tolerance_ms: u64,
        overall_timeout_ms: u64,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            loop_count,
            expected_exit_code,
            per_heartbeat_tolerance_ms,
            overall_timeout_ms,
            expected_duration: ExpectedDuration::default(),
            heartbeat_grace_ms: None,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_expected_duration(self, expected_duration: ExpectedDuration) -> Self {
        Self {
            expected_duration,
            ..self
        }
    }

    pub fn with_heartbeat_grace_ms(self, heartbeat_grace_ms: Option<u64>) -> Self {
        Self {
            heartbeat_grace_ms,
            ..self
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.loop_count < 1 {
            return Err(ConfigError::InvalidLoopCount(self.loop_count));
        }
        if self.overall_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }

    /// The subject emits one heartbeat per loop except the last.
    pub fn expected_heartbeats(&self) -> usize {
        self.loop_count.saturating_sub(1) as usize
    }

    pub fn overall_timeout(&self) -> Duration {
        Duration::from_millis(self.overall_timeout_ms)
    }
}

/// Executable plus the arguments it is launched with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SubjectCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl SubjectCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Substitutes `{loops}` and `{exit}` placeholders with the run's values.
    pub fn render(&self, config: &RunConfig) -> Self {
        let loops = config.loop_count.to_string();
        let exit = config.expected_exit_code.to_string();
        Self {
            program: self.program.clone(),
            args: self
                .args
                .iter()
                .map(|arg| arg.replace("{loops}", &loops).replace("{exit}", &exit))
                .collect(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Pass,
    TimingViolation,
    Timeout,
    ExitCodeMismatch,
    Crashed,
    ParseError,
}

impl Verdict {
    /// Process exit code the CLI reports for this verdict.
    pub fn exit_code(&self) -> i32 {
        match self {
            Verdict::Pass => 0,
            Verdict::TimingViolation => 10,
            Verdict::Timeout => 11,
            Verdict::ExitCodeMismatch => 12,
            Verdict::Crashed => 13,
            Verdict::ParseError => 14,
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Verdict::Pass => "PASS",
            Verdict::TimingViolation => "TIMING VIOLATION",
            Verdict::Timeout => "TIMEOUT",
            Verdict::ExitCodeMismatch => "EXIT CODE MISMATCH",
            Verdict::Crashed => "CRASHED",
            Verdict::ParseError => "PARSE ERROR",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub subject: SubjectCommand,
    pub verdict: Verdict,
    pub heartbeats: Vec<Heartbeat>,
    pub actual_exit_code: Option<i32>,
    pub announced_exit_code: Option<i32>,
    pub diagnostics: Vec<String>,
    pub elapsed_ms: u64,
}
