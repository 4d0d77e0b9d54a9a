//! Suite files: TOML descriptions of several monitored runs plus optional
//! footprint reports.
//!
//! ```toml
//! [defaults]
//! timeout_ms = 60000
//! tolerance_ms = 500
//!
//! [[run]]
//! name = "five-loops"
//! subject = "build/test_app"
//! args = ["{loops}", "{exit}"]
//! loops = 5
//!
//! [[footprint]]
//! report = "build/sizes.txt"
//! budget_bytes = 12288
//! include_dirs = ["include", "config"]
//! flags = ["LOG_LEVEL=LOG_NONE"]
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{
    constants::{DEFAULT_TIMEOUT_MS, DEFAULT_TOLERANCE_MS},
    footprint::FootprintCheck,
    monitor::{
        domain::{ConfigError, DEFAULT_LOOP_COUNT, ExpectedDuration, RunConfig, SubjectCommand},
        pipeline::suite::PlannedRun,
    },
};

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunDefaults {
    pub loops: u32,
    pub expect_exit: i32,
    pub timeout_ms: u64,
    pub tolerance_ms: u64,
    pub expected_sleep: ExpectedDuration,
    pub heartbeat_grace_ms: Option<u64>,
}

impl Default for RunDefaults {
    fn default() -> Self {
        Self {
            loops: DEFAULT_LOOP_COUNT,
            expect_exit: 0,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            tolerance_ms: DEFAULT_TOLERANCE_MS,
            expected_sleep: ExpectedDuration::default(),
            heartbeat_grace_ms: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunEntry {
    pub name: Option<String>,
    pub subject: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    pub loops: Option<u32>,
    pub expect_exit: Option<i32>,
    pub timeout_ms: Option<u64>,
    pub tolerance_ms: Option<u64>,
    pub expected_sleep: Option<ExpectedDuration>,
    pub heartbeat_grace_ms: Option<u64>,
    /// Launch the same configuration this many times.
    #[serde(default = "one")]
    pub repeat: u32,
}

fn one() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FootprintEntry {
    pub name: Option<String>,
    pub report: PathBuf,
    pub budget_bytes: u64,
    #[serde(default)]
    pub include_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub flags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuiteFile {
    #[serde(default)]
    pub defaults: RunDefaults,
    #[serde(default, rename = "run")]
    pub runs: Vec<RunEntry>,
    #[serde(default, rename = "footprint")]
    pub footprints: Vec<FootprintEntry>,
}

/// A loaded suite with paths resolved against the suite file's directory.
#[derive(Debug)]
pub struct Suite {
    pub runs: Vec<PlannedRun>,
    pub footprints: Vec<FootprintCheck>,
}

impl Suite {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Suite {
            path: path.to_path_buf(),
            msg: e.to_string(),
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_toml(&text, base_dir).map_err(|err| match err {
            ConfigError::Suite { msg, .. } => ConfigError::Suite {
                path: path.to_path_buf(),
                msg,
            },
            other => other,
        })
    }

    pub fn from_toml(text: &str, base_dir: &Path) -> Result<Self, ConfigError> {
        let file: SuiteFile = toml::from_str(text).map_err(|e| ConfigError::Suite {
            path: PathBuf::new(),
            msg: e.to_string(),
        })?;

        if file.runs.is_empty() && file.footprints.is_empty() {
            return Err(ConfigError::Suite {
                path: PathBuf::new(),
                msg: "suite defines no [[run]] or [[footprint]] entries".to_string(),
            });
        }

        let mut runs = Vec::new();
        for (idx, entry) in file.runs.iter().enumerate() {
            runs.extend(plan_runs(idx, entry, &file.defaults, base_dir)?);
        }

        let footprints = file
            .footprints
            .into_iter()
            .enumerate()
            .map(|(idx, entry)| FootprintCheck {
                name: entry
                    .name
                    .unwrap_or_else(|| format!("footprint-{}", idx + 1)),
                report: base_dir.join(entry.report),
                budget_bytes: entry.budget_bytes,
                include_dirs: entry.include_dirs,
                flags: entry.flags,
            })
            .collect();

        Ok(Self { runs, footprints })
    }
}

fn plan_runs(
    idx: usize,
    entry: &RunEntry,
    defaults: &RunDefaults,
    base_dir: &Path,
) -> Result<Vec<PlannedRun>, ConfigError> {
    if entry.repeat == 0 {
        return Err(ConfigError::Suite {
            path: PathBuf::new(),
            msg: format!("run {} has repeat = 0", idx + 1),
        });
    }

    let config = RunConfig::new(
        entry.loops.unwrap_or(defaults.loops),
        entry.expect_exit.unwrap_or(defaults.expect_exit),
        entry.tolerance_ms.unwrap_or(defaults.tolerance_ms),
        entry.timeout_ms.unwrap_or(defaults.timeout_ms),
    )?
    .with_expected_duration(
        entry
            .expected_sleep
            .clone()
            .unwrap_or_else(|| defaults.expected_sleep.clone()),
    )
    .with_heartbeat_grace_ms(entry.heartbeat_grace_ms.or(defaults.heartbeat_grace_ms));

    let command = SubjectCommand::new(base_dir.join(&entry.subject)).args(entry.args.clone());
    let name = entry
        .name
        .clone()
        .unwrap_or_else(|| format!("run-{}", idx + 1));

    Ok((1..=entry.repeat)
        .map(|attempt| PlannedRun {
            name: if entry.repeat > 1 {
                format!("{}#{}", name, attempt)
            } else {
                name.clone()
            },
            command: command.clone(),
            config: config.clone(),
        })
        .collect())
}
