use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Instant, timeout},
};
use uuid::Uuid;

use crate::monitor::{
    deadline::{DeadlineSupervisor, StallDeadline, SupervisorState},
    domain::{Heartbeat, RunConfig, RunResult, SubjectCommand},
    heartbeat::{HeartbeatParser, parse_exit_line},
    timing::{TimingIssue, TimingValidator, Violation},
    traits::process::{LaunchError, OutputLines, OutputSource, ProcessRunner},
    verdict::{RunSignals, conclude},
};

/// How long the output reader may keep going once the subject is gone.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_millis(500);
/// Stderr lines kept as diagnostics per run; the rest are only counted.
pub const STDERR_DIAGNOSTIC_LIMIT: usize = 100;

#[derive(Debug)]
enum Observation {
    Heartbeat(Heartbeat),
    Violation(Violation),
    ExitAnnounced(i32),
    Stderr(String),
    StderrLimitReached,
    StderrDropped(usize),
}

/// Runs subjects and turns what they do into a [`RunResult`].
#[derive(Debug, Clone)]
pub struct Monitor {
    runner: Arc<dyn ProcessRunner>,
    drain_grace: Duration,
}

impl Monitor {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            runner,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }

    pub fn with_drain_grace(self, drain_grace: Duration) -> Self {
        Self {
            drain_grace,
            ..self
        }
    }

    /// Launches the subject once and observes it until exit or timeout.
    ///
    /// Only a launch failure is returned as an error; every other outcome,
    /// including a killed subject, ends up in the returned result.
    #[tracing::instrument(skip(self, config), fields(loops = config.loop_count))]
    pub async fn run(
        &self,
        command: &SubjectCommand,
        config: &RunConfig,
    ) -> Result<RunResult, LaunchError> {
        let run_id = Uuid::new_v4();
        let command = command.render(config);
        let started = Instant::now();

        let mut handle = self.runner.start(&command).await?;
        tracing::info!("Run {} started: {:?}", run_id, command);

        let (observation_tx, mut observation_rx) = mpsc::unbounded_channel();
        let (stall_tx, stall_rx) = watch::channel(None);

        let reader = handle.take_output().map(|lines| {
            tokio::spawn(observe_output(
                lines,
                config.clone(),
                observation_tx,
                stall_tx,
            ))
        });

        let mut supervisor =
            DeadlineSupervisor::new(config.overall_timeout()).with_stall_updates(stall_rx);
        let supervision = supervisor.supervise(handle.as_mut(), started).await;

        let mut diagnostics = Vec::new();
        match reader {
            Some(reader) => self.join_reader(reader, &mut diagnostics).await,
            None => diagnostics.push("subject output was not captured".to_string()),
        }

        let mut signals = RunSignals {
            tripped: None,
            exit: supervision.exit,
            heartbeats: Vec::new(),
            violations: Vec::new(),
            announced_exit_code: None,
        };
        let mut observed = Vec::new();
        while let Some(observation) = observation_rx.recv().await {
            record(observation, &mut signals, &mut observed);
        }
        // Reader-side problems are reported after the subject's own output.
        observed.append(&mut diagnostics);
        let mut diagnostics = observed;

        if let SupervisorState::Tripped(reason) = supervision.state {
            signals.tripped = Some(reason);
        }

        let verdict = conclude(&signals, config, &mut diagnostics);
        let result = RunResult {
            run_id,
            actual_exit_code: signals.actual_exit_code(),
            announced_exit_code: signals.announced_exit_code,
            subject: command,
            verdict,
            heartbeats: signals.heartbeats,
            diagnostics,
            elapsed_ms: supervision.elapsed.as_millis() as u64,
        };

        tracing::info!(
            "Run {} finished: verdict={}, heartbeats={}, exit={:?}",
            run_id,
            result.verdict,
            result.heartbeats.len(),
            result.actual_exit_code
        );
        Ok(result)
    }

    /// Waits for the reader to drain the remaining output. A stream that stays
    /// open past the grace period is abandoned; what was read so far stands.
    async fn join_reader(&self, mut reader: JoinHandle<()>, diagnostics: &mut Vec<String>) {
        match timeout(self.drain_grace, &mut reader).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!("Output reader failed: {}", err);
                diagnostics.push(format!("output reader failed: {}", err));
            }
            Err(_) => {
                reader.abort();
                let _ = reader.await;
                tracing::warn!("Output stream still open after subject exit");
                diagnostics.push(format!(
                    "output stream still open {}ms after subject exit; remaining output ignored",
                    self.drain_grace.as_millis()
                ));
            }
        }
    }
}

fn record(observation: Observation, signals: &mut RunSignals, diagnostics: &mut Vec<String>) {
    match observation {
        Observation::Heartbeat(heartbeat) => {
            diagnostics.push(format!(
                "heartbeat #{} at {} declared {}s",
                heartbeat.sequence,
                heartbeat.wall_clock_time.format("%H:%M:%S%.3f"),
                heartbeat.declared_sleep_seconds
            ));
            signals.heartbeats.push(heartbeat);
        }
        Observation::Violation(violation) => {
            diagnostics.push(format!("timing violation at {}", violation));
            signals.violations.push(violation);
        }
        Observation::ExitAnnounced(code) => {
            diagnostics.push(format!("subject announced exit code {}", code));
            signals.announced_exit_code = Some(code);
        }
        Observation::Stderr(text) => diagnostics.push(format!("stderr: {}", text)),
        Observation::StderrLimitReached => diagnostics.push(format!(
            "stderr limit of {} lines reached; further stderr lines dropped",
            STDERR_DIAGNOSTIC_LIMIT
        )),
        Observation::StderrDropped(count) => {
            diagnostics.push(format!("{} stderr line(s) dropped", count))
        }
    }
}

/// Consumes subject output in arrival order, parsing and validating each
/// heartbeat against the one before it.
async fn observe_output(
    mut lines: OutputLines,
    config: RunConfig,
    observations: mpsc::UnboundedSender<Observation>,
    stall: watch::Sender<Option<StallDeadline>>,
) {
    let mut parser = HeartbeatParser::new();
    let validator =
        TimingValidator::new(config.expected_duration.clone(), config.per_heartbeat_tolerance_ms);
    let allowed = config.expected_heartbeats();
    let mut previous: Option<Heartbeat> = None;
    let mut stderr_lines = 0usize;

    let observe = |observation: Observation| {
        // The receiver outlives this task unless the run was abandoned.
        let _ = observations.send(observation);
    };

    while let Some(line) = lines.recv().await {
        tracing::debug!("subject {:?}: {}", line.source, line.text);

        if line.source == OutputSource::Stderr {
            stderr_lines += 1;
            if stderr_lines <= STDERR_DIAGNOSTIC_LIMIT {
                observe(Observation::Stderr(line.text));
            } else if stderr_lines == STDERR_DIAGNOSTIC_LIMIT + 1 {
                tracing::warn!("Subject stderr exceeded {} lines", STDERR_DIAGNOSTIC_LIMIT);
                observe(Observation::StderrLimitReached);
            }
            continue;
        }
        if let Some(code) = parse_exit_line(&line.text) {
            observe(Observation::ExitAnnounced(code));
            continue;
        }
        let Some(heartbeat) = parser.parse_line(&line.text) else {
            continue;
        };

        if heartbeat.sequence as usize > allowed {
            observe(Observation::Violation(Violation {
                sequence: heartbeat.sequence,
                issues: vec![TimingIssue::Surplus { allowed }],
            }));
            continue;
        }

        if let Some(grace_ms) = config.heartbeat_grace_ms {
            let window_ms = heartbeat
                .declared_sleep_seconds
                .saturating_mul(1000)
                .saturating_add(config.per_heartbeat_tolerance_ms)
                .saturating_add(grace_ms);
            stall.send_replace(Some(StallDeadline {
                after_sequence: heartbeat.sequence,
                at: Instant::now() + Duration::from_millis(window_ms),
            }));
        }

        let violation = validator.validate(previous.as_ref(), &heartbeat, heartbeat.sequence);
        observe(Observation::Heartbeat(heartbeat.clone()));
        if let Some(violation) = violation {
            observe(Observation::Violation(violation));
        }
        previous = Some(heartbeat);
    }

    if stderr_lines > STDERR_DIAGNOSTIC_LIMIT {
        observe(Observation::StderrDropped(stderr_lines - STDERR_DIAGNOSTIC_LIMIT));
    }
    tracing::debug!("Subject output closed after {} heartbeats", parser.recognized());
}
