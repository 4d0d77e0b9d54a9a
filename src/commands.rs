use std::{path::PathBuf, sync::Arc, time::Duration};

use crate::{
    config::Suite,
    constants::{EXIT_CONFIG_ERROR, EXIT_LAUNCH_ERROR, EXIT_OUTPUT_ERROR, EXIT_SUITE_FAILED},
    footprint::FootprintCheck,
    monitor::{
        domain::{ConfigError, ExpectedDuration, RunConfig, SubjectCommand},
        pipeline::{monitoring::Monitor, suite::run_suite},
        traits::process::{LaunchError, ProcessRunner},
    },
    native::runner::NativeRunner,
    report::{
        FootprintReport, Format, SuiteReport, SuiteRunReport, render_run, render_suite,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to render report: {0}")]
    Output(#[from] serde_json::Error),
}

impl CommandError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CommandError::Launch(_) => EXIT_LAUNCH_ERROR,
            CommandError::Config(_) => EXIT_CONFIG_ERROR,
            CommandError::Output(_) => EXIT_OUTPUT_ERROR,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub subject: PathBuf,
    pub subject_args: Vec<String>,
    pub loops: u32,
    pub expect_exit: i32,
    pub timeout_ms: u64,
    pub tolerance_ms: u64,
    pub expected_sleep: ExpectedDuration,
    pub heartbeat_grace_ms: Option<u64>,
    pub drain_grace_ms: u64,
    pub runs: u32,
    pub format: Format,
}

/// Monitors the subject `runs` times in a row. Returns the exit code of the
/// first run that did not pass, or 0.
#[tracing::instrument(skip(runner))]
pub async fn run_command(
    options: RunOptions,
    runner: Arc<dyn ProcessRunner>,
) -> Result<i32, CommandError> {
    let config = RunConfig::new(
        options.loops,
        options.expect_exit,
        options.tolerance_ms,
        options.timeout_ms,
    )?
    .with_expected_duration(options.expected_sleep.clone())
    .with_heartbeat_grace_ms(options.heartbeat_grace_ms);

    let command = SubjectCommand::new(&options.subject).args(options.subject_args.clone());
    let monitor =
        Monitor::new(runner).with_drain_grace(Duration::from_millis(options.drain_grace_ms));

    let mut exit_code = 0;
    for attempt in 1..=options.runs {
        tracing::info!("Run {}/{}", attempt, options.runs);
        let result = monitor.run(&command, &config).await?;
        print!("{}", render_run(&result, options.format)?);
        if exit_code == 0 {
            exit_code = result.verdict.exit_code();
        }
    }
    Ok(exit_code)
}

#[tracing::instrument(skip(runner))]
pub async fn suite_command(
    path: PathBuf,
    format: Format,
    runner: Arc<dyn ProcessRunner>,
) -> Result<i32, CommandError> {
    let suite = Suite::load(&path)?;
    let monitor = Monitor::new(runner);

    let (outcomes, footprints) = tokio::join!(
        run_suite(&monitor, &suite.runs),
        check_footprints(&suite.footprints)
    );

    let report = SuiteReport::new(
        outcomes.into_iter().map(SuiteRunReport::from).collect(),
        footprints,
    );
    print!("{}", render_suite(&report, format)?);

    Ok(if report.passed { 0 } else { EXIT_SUITE_FAILED })
}

async fn check_footprints(checks: &[FootprintCheck]) -> Vec<FootprintReport> {
    let mut reports = Vec::with_capacity(checks.len());
    for check in checks {
        let report = match check.evaluate().await {
            Ok(outcome) => FootprintReport {
                name: check.name.clone(),
                passed: outcome.passed,
                outcome: Some(outcome),
                error: None,
            },
            Err(err) => {
                tracing::error!("Footprint check {} failed: {}", check.name, err);
                FootprintReport {
                    name: check.name.clone(),
                    passed: false,
                    outcome: None,
                    error: Some(err.to_string()),
                }
            }
        };
        reports.push(report);
    }
    reports
}

pub fn native_runner() -> Arc<dyn ProcessRunner> {
    Arc::new(NativeRunner::new())
}
