use crate::monitor::{
    deadline::TripReason,
    domain::{Heartbeat, RunConfig, Verdict},
    timing::Violation,
    traits::process::{ExitOutcome, ProcessError},
};

/// Everything observed during one run, collected after both the output
/// reader and the supervisor have finished.
#[derive(Debug)]
pub struct RunSignals {
    pub tripped: Option<TripReason>,
    pub exit: Result<ExitOutcome, ProcessError>,
    pub heartbeats: Vec<Heartbeat>,
    pub violations: Vec<Violation>,
    pub announced_exit_code: Option<i32>,
}

impl RunSignals {
    pub fn actual_exit_code(&self) -> Option<i32> {
        match (&self.tripped, &self.exit) {
            (None, Ok(exit)) => exit.code(),
            _ => None,
        }
    }

    fn is_abnormal(&self, config: &RunConfig) -> bool {
        match self.exit {
            Err(_) | Ok(ExitOutcome::Signaled(_)) => true,
            Ok(ExitOutcome::Exited(code)) => {
                code != 0
                    && code != config.expected_exit_code
                    && self.heartbeats.is_empty()
                    && self.announced_exit_code.is_none()
            }
        }
    }
}

/// Picks the verdict, highest priority first:
/// timeout, crash, missing heartbeats, timing violations, exit code.
pub fn classify(signals: &RunSignals, config: &RunConfig) -> Verdict {
    if signals.tripped.is_some() {
        Verdict::Timeout
    } else if signals.is_abnormal(config) {
        Verdict::Crashed
    } else if signals.heartbeats.len() < config.expected_heartbeats() {
        Verdict::ParseError
    } else if !signals.violations.is_empty() {
        Verdict::TimingViolation
    } else if signals.actual_exit_code() != Some(config.expected_exit_code) {
        Verdict::ExitCodeMismatch
    } else {
        Verdict::Pass
    }
}

/// Classifies the run and appends the findings that explain the verdict.
/// Findings already in `diagnostics` are kept as they are.
pub fn conclude(signals: &RunSignals, config: &RunConfig, diagnostics: &mut Vec<String>) -> Verdict {
    if let Some(trip) = &signals.tripped {
        diagnostics.push(format!("deadline tripped: {}; subject terminated", trip));
    }

    match &signals.exit {
        Ok(exit) => diagnostics.push(format!("subject {}", exit)),
        Err(err) => diagnostics.push(err.to_string()),
    }

    let seen = signals.heartbeats.len();
    let expected = config.expected_heartbeats();
    if seen < expected {
        diagnostics.push(format!(
            "recognized {} of {} expected heartbeats",
            seen, expected
        ));
    }

    if !signals.violations.is_empty() {
        diagnostics.push(format!(
            "{} heartbeat(s) violated the timing contract",
            signals.violations.len()
        ));
    }

    if let (Some(announced), Some(actual)) =
        (signals.announced_exit_code, signals.actual_exit_code())
    {
        if announced != actual {
            diagnostics.push(format!(
                "subject announced exit code {} but exited with {}",
                announced, actual
            ));
        }
    }

    if let Some(actual) = signals.actual_exit_code() {
        if actual != config.expected_exit_code {
            diagnostics.push(format!(
                "exit code {}, expected {}",
                actual, config.expected_exit_code
            ));
        }
    }

    let verdict = classify(signals, config);
    diagnostics.push(format!("verdict: {}", verdict));
    verdict
}
