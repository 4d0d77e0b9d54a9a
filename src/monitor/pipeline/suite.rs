use futures::stream::FuturesUnordered;
use tokio_stream::StreamExt;

use crate::monitor::{
    domain::{RunConfig, RunResult, SubjectCommand},
    pipeline::monitoring::Monitor,
    traits::process::LaunchError,
};

/// One configured run inside a suite.
#[derive(Clone, Debug)]
pub struct PlannedRun {
    pub name: String,
    pub command: SubjectCommand,
    pub config: RunConfig,
}

#[derive(Debug)]
pub struct SuiteRunOutcome {
    pub name: String,
    pub result: Result<RunResult, LaunchError>,
}

impl SuiteRunOutcome {
    pub fn passed(&self) -> bool {
        matches!(&self.result, Ok(result) if result.verdict.is_pass())
    }
}

/// Runs every planned run concurrently. Outcomes come back in plan order.
#[tracing::instrument(skip_all, fields(runs = runs.len()))]
pub async fn run_suite(monitor: &Monitor, runs: &[PlannedRun]) -> Vec<SuiteRunOutcome> {
    let mut futures: FuturesUnordered<_> = runs
        .iter()
        .enumerate()
        .map(|(idx, run)| async move {
            tracing::debug!("Starting suite run {} ({})", idx, run.name);
            (idx, monitor.run(&run.command, &run.config).await)
        })
        .collect();

    let mut outcomes: Vec<Option<SuiteRunOutcome>> = runs.iter().map(|_| None).collect();
    while let Some((idx, result)) = futures.next().await {
        if let Err(err) = &result {
            tracing::error!("Suite run {} failed to launch: {}", runs[idx].name, err);
        }
        outcomes[idx] = Some(SuiteRunOutcome {
            name: runs[idx].name.clone(),
            result,
        });
    }

    outcomes.into_iter().flatten().collect()
}
