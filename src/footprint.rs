//! Memory-footprint reports produced by an external size analyzer.
//!
//! The monitor does not compute sizes itself. It reads the analyzer's report
//! and turns it into a pass/fail signal against a per-file byte budget.

use std::path::{Path, PathBuf};

use itertools::Itertools;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FootprintError {
    #[error("failed to read report {path}: {msg}")]
    Read { path: PathBuf, msg: String },
    #[error("malformed report line {line}: {text:?}")]
    Malformed { line: usize, text: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FootprintCheck {
    pub name: String,
    pub report: PathBuf,
    pub budget_bytes: u64,
    /// Handed to the analyzer; only echoed here.
    pub include_dirs: Vec<PathBuf>,
    pub flags: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FileFootprint {
    pub file: String,
    pub text_bytes: u64,
}

impl FileFootprint {
    pub fn reported_size(&self) -> String {
        format_kib(self.text_bytes)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct FootprintOutcome {
    pub name: String,
    pub passed: bool,
    pub files: Vec<FileFootprint>,
    pub diagnostics: Vec<String>,
}

/// Renders a byte count the way the analyzer reports it: KiB with one
/// decimal, and never less than `0.1K`.
pub fn format_kib(bytes: u64) -> String {
    let tenths = (bytes as f64 / 1024.0 * 10.0).round() / 10.0;
    if tenths == 0.0 {
        "0.1K".to_string()
    } else {
        format!("{:.1}K", tenths)
    }
}

/// Parses `1234`, `10.1K` or `2M` into bytes.
pub fn parse_size(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let (number, multiplier) = match raw.char_indices().last()? {
        (idx, 'K' | 'k') => (&raw[..idx], 1024.0),
        (idx, 'M' | 'm') => (&raw[..idx], 1024.0 * 1024.0),
        _ => (raw, 1.0),
    };
    let value: f64 = number.trim().parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value * multiplier).round() as u64)
}

/// Accepts either Berkeley `size` output (everything up to and including the
/// `text data bss dec hex filename` header is skipped) or plain
/// `<file> <size>` lines.
pub fn parse_report(report: &str) -> Result<Vec<FileFootprint>, FootprintError> {
    let lines: Vec<(usize, &str)> = report
        .lines()
        .enumerate()
        .map(|(idx, line)| (idx + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .collect();

    let header = lines
        .iter()
        .position(|(_, line)| line.split_whitespace().next() == Some("text"));

    match header {
        Some(header) => lines[header + 1..]
            .iter()
            .map(|(idx, line)| parse_berkeley_row(*idx, line))
            .collect(),
        None => lines
            .iter()
            .map(|(idx, line)| parse_sized_row(*idx, line))
            .collect(),
    }
}

fn parse_berkeley_row(idx: usize, line: &str) -> Result<FileFootprint, FootprintError> {
    let malformed = || FootprintError::Malformed {
        line: idx,
        text: line.to_string(),
    };
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 6 {
        return Err(malformed());
    }
    let text_bytes = parts[0].parse::<u64>().map_err(|_| malformed())?;
    let object = parts[5..].join(" ");

    Ok(FileFootprint {
        file: source_name(&object),
        text_bytes,
    })
}

fn parse_sized_row(idx: usize, line: &str) -> Result<FileFootprint, FootprintError> {
    let malformed = || FootprintError::Malformed {
        line: idx,
        text: line.to_string(),
    };
    let (file, size) = line.rsplit_once(char::is_whitespace).ok_or_else(malformed)?;
    Ok(FileFootprint {
        file: file.trim().to_string(),
        text_bytes: parse_size(size).ok_or_else(malformed)?,
    })
}

/// `build/3rdparty/foo.o` becomes `foo.c (third-party utility)`.
fn source_name(object: &str) -> String {
    let base = Path::new(object)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| object.to_string());
    let source = match base.strip_suffix(".o") {
        Some(stem) => format!("{}.c", stem),
        None => base,
    };
    if object.contains("3rdparty") {
        format!("{} (third-party utility)", source)
    } else {
        source
    }
}

impl FootprintCheck {
    #[tracing::instrument(skip(self), fields(name = %self.name))]
    pub async fn evaluate(&self) -> Result<FootprintOutcome, FootprintError> {
        let report = tokio::fs::read_to_string(&self.report)
            .await
            .map_err(|e| FootprintError::Read {
                path: self.report.clone(),
                msg: e.to_string(),
            })?;
        let files = parse_report(&report)?;
        Ok(self.judge(files))
    }

    fn judge(&self, files: Vec<FileFootprint>) -> FootprintOutcome {
        let mut diagnostics = vec![format!(
            "analyzed with include dirs [{}] and flags [{}]",
            self.include_dirs.iter().map(|dir| dir.display()).join(", "),
            self.flags.iter().join(", ")
        )];
        let budget = format_kib(self.budget_bytes);

        let mut passed = !files.is_empty();
        if files.is_empty() {
            diagnostics.push("report lists no files".to_string());
        }
        for file in &files {
            let over = file.text_bytes > self.budget_bytes;
            passed &= !over;
            diagnostics.push(format!(
                "{} {} (budget {}){}",
                file.file,
                file.reported_size(),
                budget,
                if over { " OVER BUDGET" } else { "" }
            ));
        }

        tracing::debug!("Footprint {} passed={}", self.name, passed);
        FootprintOutcome {
            name: self.name.clone(),
            passed,
            files,
            diagnostics,
        }
    }
}
