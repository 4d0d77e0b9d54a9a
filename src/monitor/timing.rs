use std::fmt;

use chrono::{NaiveTime, Timelike};
use itertools::Itertools;
use serde::Serialize;

use crate::monitor::domain::{ExpectedDuration, Heartbeat};

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum TimingIssue {
    DurationMismatch {
        expected_seconds: u64,
        declared_seconds: u64,
    },
    GapDrift {
        expected_ms: u64,
        observed_ms: u64,
        tolerance_ms: u64,
    },
    /// More heartbeats than the loop count allows.
    Surplus { allowed: usize },
}

impl fmt::Display for TimingIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimingIssue::DurationMismatch {
                expected_seconds,
                declared_seconds,
            } => write!(
                f,
                "declared {}s, expected {}s",
                declared_seconds, expected_seconds
            ),
            TimingIssue::GapDrift {
                expected_ms,
                observed_ms,
                tolerance_ms,
            } => write!(
                f,
                "gap since previous heartbeat {}ms, expected {}ms ± {}ms",
                observed_ms, expected_ms, tolerance_ms
            ),
            TimingIssue::Surplus { allowed } => {
                write!(f, "unexpected heartbeat, at most {} allowed", allowed)
            }
        }
    }
}

/// All timing problems found for one heartbeat.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub sequence: u32,
    pub issues: Vec<TimingIssue>,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "heartbeat #{}: {}",
            self.sequence,
            self.issues.iter().join("; ")
        )
    }
}

/// Time elapsed from `previous` to `current` on a 24h clock. A smaller
/// `current` means the clock wrapped past midnight.
pub fn wall_clock_gap_ms(previous: NaiveTime, current: NaiveTime) -> u64 {
    let diff = millis_of_day(current) - millis_of_day(previous);
    diff.rem_euclid(MS_PER_DAY) as u64
}

fn millis_of_day(time: NaiveTime) -> i64 {
    i64::from(time.num_seconds_from_midnight()) * 1000 + i64::from(time.nanosecond() / 1_000_000)
}

#[derive(Clone, Debug)]
pub struct TimingValidator {
    expected: ExpectedDuration,
    tolerance_ms: u64,
}

impl TimingValidator {
    pub fn new(expected: ExpectedDuration, tolerance_ms: u64) -> Self {
        Self {
            expected,
            tolerance_ms,
        }
    }

    /// Checks `current` against the expected-duration function and, when a
    /// previous heartbeat exists, checks the observed gap against the sleep
    /// that heartbeat declared.
    pub fn validate(
        &self,
        previous: Option<&Heartbeat>,
        current: &Heartbeat,
        iteration_index: u32,
    ) -> Option<Violation> {
        let mut issues = Vec::new();

        let expected_seconds = self.expected.seconds_for(iteration_index);
        if current.declared_sleep_seconds != expected_seconds {
            issues.push(TimingIssue::DurationMismatch {
                expected_seconds,
                declared_seconds: current.declared_sleep_seconds,
            });
        }

        if let Some(previous) = previous {
            let expected_ms = previous.declared_sleep_seconds.saturating_mul(1000);
            let observed_ms = wall_clock_gap_ms(previous.wall_clock_time, current.wall_clock_time);
            if observed_ms.abs_diff(expected_ms) > self.tolerance_ms {
                issues.push(TimingIssue::GapDrift {
                    expected_ms,
                    observed_ms,
                    tolerance_ms: self.tolerance_ms,
                });
            }
        }

        if issues.is_empty() {
            None
        } else {
            Some(Violation {
                sequence: current.sequence,
                issues,
            })
        }
    }
}
