use std::fmt::Write as _;

use itertools::Itertools;
use serde::Serialize;

use crate::{
    footprint::FootprintOutcome,
    monitor::{domain::RunResult, pipeline::suite::SuiteRunOutcome},
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Format {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Serialize)]
pub struct SuiteRunReport {
    pub name: String,
    pub passed: bool,
    pub result: Option<RunResult>,
    pub launch_error: Option<String>,
}

impl From<SuiteRunOutcome> for SuiteRunReport {
    fn from(outcome: SuiteRunOutcome) -> Self {
        let passed = outcome.passed();
        let (result, launch_error) = match outcome.result {
            Ok(result) => (Some(result), None),
            Err(err) => (None, Some(err.to_string())),
        };
        Self {
            name: outcome.name,
            passed,
            result,
            launch_error,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FootprintReport {
    pub name: String,
    pub passed: bool,
    pub outcome: Option<FootprintOutcome>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SuiteReport {
    pub passed: bool,
    pub runs: Vec<SuiteRunReport>,
    pub footprints: Vec<FootprintReport>,
}

impl SuiteReport {
    pub fn new(runs: Vec<SuiteRunReport>, footprints: Vec<FootprintReport>) -> Self {
        let passed = runs.iter().all(|r| r.passed) && footprints.iter().all(|f| f.passed);
        Self {
            passed,
            runs,
            footprints,
        }
    }
}

fn status(passed: bool) -> &'static str {
    if passed { "PASS" } else { "FAIL" }
}

pub fn render_run(result: &RunResult, format: Format) -> Result<String, serde_json::Error> {
    match format {
        Format::Json => serde_json::to_string_pretty(result),
        Format::Text => Ok(run_text(result)),
    }
}

fn run_text(result: &RunResult) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "[{}] {} {} ({}ms, run {})",
        result.verdict,
        result.subject.program.display(),
        result.subject.args.iter().join(" "),
        result.elapsed_ms,
        result.run_id
    );
    for line in &result.diagnostics {
        let _ = writeln!(out, "  {}", line);
    }
    out
}

pub fn render_suite(report: &SuiteReport, format: Format) -> Result<String, serde_json::Error> {
    if format == Format::Json {
        return serde_json::to_string_pretty(report);
    }

    let mut out = String::new();
    for run in &report.runs {
        let _ = writeln!(out, "== run {}: {}", run.name, status(run.passed));
        match (&run.result, &run.launch_error) {
            (Some(result), _) => out.push_str(&run_text(result)),
            (None, Some(err)) => {
                let _ = writeln!(out, "  launch error: {}", err);
            }
            (None, None) => {}
        }
    }
    for footprint in &report.footprints {
        let _ = writeln!(
            out,
            "== footprint {}: {}",
            footprint.name,
            status(footprint.passed)
        );
        if let Some(outcome) = &footprint.outcome {
            for line in &outcome.diagnostics {
                let _ = writeln!(out, "  {}", line);
            }
        }
        if let Some(err) = &footprint.error {
            let _ = writeln!(out, "  error: {}", err);
        }
    }

    let failed = report.runs.iter().filter(|r| !r.passed).count()
        + report.footprints.iter().filter(|f| !f.passed).count();
    let _ = writeln!(
        out,
        "suite {}: {} run(s), {} footprint check(s), {} failed",
        status(report.passed),
        report.runs.len(),
        report.footprints.len(),
        failed
    );
    Ok(out)
}
