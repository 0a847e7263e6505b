//! Run results, summaries, and report files

use std::{
    fmt::{ self, Write as _ },
    fs::OpenOptions,
    io::{ self, Write as _ },
    path::{ Path, PathBuf },
    time::{ Duration, Instant },
};
use chrono::{ DateTime, Local };
use serde::{ Serialize, Serializer };
use crate::{
    devices::ReadingSource,
    error::PersistenceError,
    plan::{ level_name, TestPoint },
    verify::{ Verdict, Verification },
};

/// The sequence stage at which a test point was lost
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage
{
    /// The resistor did not accept the stimulus value
    StimulusConfig,
    /// The supply could not be cycled
    PowerCycle,
    /// No reading could be obtained
    Measurement,
}

impl fmt::Display for FailureStage
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(match self {
            Self::StimulusConfig => "stimulus configuration failed",
            Self::PowerCycle => "power cycle failed",
            Self::Measurement => "measurement failed",
        })
    }
}

/// The result of one test point
///
/// `measured` is absent only when no reading was obtained. A reading of exactly zero is a real
/// measurement and is verified like any other.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome
{
    pub measured: Option<f64>,
    pub verdict: Verdict,
    pub error_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureStage>,
    /// Description of the instrument error behind `failure`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ReadingSource>,
}

impl Outcome
{
    pub fn verified(measured: f64, verification: Verification, source: ReadingSource) -> Self
    {
        Self {
            measured: Some(measured),
            verdict: verification.verdict,
            error_percent: Some(verification.error_percent),
            failure: None,
            detail: None,
            source: Some(source),
        }
    }

    pub fn error(stage: FailureStage, detail: String) -> Self
    {
        Self {
            measured: None,
            verdict: Verdict::Error,
            error_percent: None,
            failure: Some(stage),
            detail: Some(detail),
            source: None,
        }
    }

    pub fn passed(&self) -> bool
    {
        self.verdict == Verdict::Pass
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entry
{
    pub point: TestPoint,
    pub outcome: Outcome,
}

fn serialize_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
{
    serializer.serialize_f64(duration.as_secs_f64())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary
{
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    /// Points attempted, errors included
    pub total: usize,
    #[serde(rename = "elapsed_secs", serialize_with = "serialize_secs")]
    pub elapsed: Duration,
}

impl Summary
{
    /// Share of attempted points that passed, in percent
    pub fn pass_rate(&self) -> Option<f64>
    {
        if self.total == 0 {
            None
        }
        else {
            Some(self.passed as f64 / self.total as f64 * 100.0)
        }
    }
}

/// Collects outcomes while a run is in progress
pub struct RunRecorder
{
    started: Instant,
    timestamp: DateTime<Local>,
    profile: String,
    levels: Vec<u32>,
    entries: Vec<Entry>,
}

impl RunRecorder
{
    /// Starts the clock for a run over `levels`
    pub fn start(profile: &str, levels: Vec<u32>) -> Self
    {
        Self::started_at(Local::now(), profile, levels)
    }

    /// Starts a run with an explicit wall-clock timestamp
    pub fn started_at(timestamp: DateTime<Local>, profile: &str, levels: Vec<u32>) -> Self
    {
        Self {
            started: Instant::now(),
            timestamp: timestamp,
            profile: profile.to_string(),
            levels: levels,
            entries: Vec::new(),
        }
    }

    pub fn record(&mut self, point: TestPoint, outcome: Outcome)
    {
        self.entries.push(Entry {
            point: point,
            outcome: outcome,
        });
    }

    pub fn len(&self) -> usize
    {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.entries.is_empty()
    }

    /// Closes the run and computes its summary
    ///
    /// Entries are put in plan order (level, then nominal/min/max) whatever order they were
    /// recorded in.
    pub fn finalize(self, aborted: bool) -> RunReport
    {
        let elapsed = self.started.elapsed();
        let mut entries = self.entries;
        entries.sort_by_key(|entry| entry.point.key());

        let count = |verdict: Verdict| entries.iter().filter(|entry| entry.outcome.verdict == verdict).count();
        let summary = Summary {
            passed: count(Verdict::Pass),
            failed: count(Verdict::Fail),
            errors: count(Verdict::Error),
            total: entries.len(),
            elapsed: elapsed,
        };

        RunReport {
            timestamp: self.timestamp,
            profile: self.profile,
            levels: self.levels,
            aborted: aborted,
            entries: entries,
            summary: summary,
        }
    }
}

/// A finished run. Read-only
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport
{
    pub timestamp: DateTime<Local>,
    pub profile: String,
    pub levels: Vec<u32>,
    pub aborted: bool,
    pub entries: Vec<Entry>,
    pub summary: Summary,
}

fn fmt_measured(measured: Option<f64>, decimals: usize) -> String
{
    match measured {
        Some(value) => format!("{:.*}", decimals, value),
        None => String::from("-"),
    }
}

fn fmt_error(error_percent: Option<f64>, decimals: usize) -> String
{
    match error_percent {
        Some(value) => format!("{:+.*}", decimals, value),
        None => String::from("-"),
    }
}

fn fmt_levels(levels: &[u32]) -> String
{
    levels.iter().map(|level| level_name(*level)).collect::<Vec<_>>().join(", ")
}

fn fmt_rate(summary: &Summary) -> String
{
    match summary.pass_rate() {
        Some(rate) => format!("{:.1}%", rate),
        None => String::from("n/a"),
    }
}

const RULE_WIDTH: usize = 86;

impl RunReport
{
    /// Fixed-column table for the console
    ///
    /// Depends only on the report contents, so rendering the same report twice yields identical
    /// text.
    pub fn render(&self) -> String
    {
        let mut out = String::new();
        // writing into a String cannot fail
        let _ = self.write_table(&mut out);
        out
    }

    fn write_table(&self, out: &mut String) -> fmt::Result
    {
        let rule = "-".repeat(RULE_WIDTH);

        writeln!(out, "{}", "=".repeat(RULE_WIDTH))?;
        writeln!(out, "BIN test results ({}) {}", self.profile, self.timestamp.format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(out, "{}", "=".repeat(RULE_WIDTH))?;
        writeln!(
            out,
            "{:<14} {:<8} {:>10} {:>12} {:>12} {:>9}  {}",
            "Level", "Variant", "Stimulus", "Expected", "Measured", "Error%", "Result"
        )?;
        writeln!(out, "{}", rule)?;

        for entry in self.entries.iter() {
            let point = &entry.point;
            let outcome = &entry.outcome;

            write!(
                out,
                "{:<14} {:<8} {:>10} {:>12.1} {:>12} {:>9}  {}",
                point.level_name(),
                point.variant,
                format!("{}", point.stimulus.display_anon()),
                point.expected,
                fmt_measured(outcome.measured, 1),
                fmt_error(outcome.error_percent, 1),
                outcome.verdict,
            )?;

            if let Some(stage) = outcome.failure {
                write!(out, " ({})", stage)?;
            }
            if outcome.source == Some(ReadingSource::Operator) {
                write!(out, " (manual)")?;
            }
            writeln!(out)?;
        }

        writeln!(out, "{}", rule)?;
        writeln!(
            out,
            "Total: {}/{} passed ({}), {} failed, {} errors, elapsed {:.1}s{}",
            self.summary.passed,
            self.summary.total,
            fmt_rate(&self.summary),
            self.summary.failed,
            self.summary.errors,
            self.summary.elapsed.as_secs_f64(),
            if self.aborted { " [aborted]" } else { "" },
        )
    }

    /// The persisted form: a `#` header block, a CSV body, and a trailing summary row
    pub fn render_csv(&self) -> String
    {
        let mut out = String::new();
        let _ = self.write_csv(&mut out);
        out
    }

    fn write_csv(&self, out: &mut String) -> fmt::Result
    {
        writeln!(out, "# BIN test results")?;
        writeln!(out, "# Time: {}", self.timestamp.format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(out, "# Profile: {}", self.profile)?;
        writeln!(out, "# Levels: {}", fmt_levels(&self.levels))?;
        writeln!(out, "# Passed: {}/{}", self.summary.passed, self.summary.total)?;
        if self.aborted {
            writeln!(out, "# Aborted by operator")?;
        }
        writeln!(out)?;
        writeln!(out, "Level,Variant,Resistance(Ω),Expected,Measured,Result,Error(%)")?;

        for entry in self.entries.iter() {
            let point = &entry.point;
            let outcome = &entry.outcome;

            writeln!(
                out,
                "{},{},{},{},{},{},{}",
                point.level_name(),
                point.variant.label(),
                point.stimulus.display_anon(),
                point.expected,
                fmt_measured(outcome.measured, 2),
                outcome.verdict,
                fmt_error(outcome.error_percent, 2),
            )?;
        }

        writeln!(out)?;
        writeln!(out, "Total,,,,{}/{},{},", self.summary.passed, self.summary.total, fmt_rate(&self.summary))
    }

    pub fn to_json(&self) -> serde_json::Result<String>
    {
        serde_json::to_string_pretty(self)
    }

    /// The report file name for this run
    pub fn file_name(&self) -> String
    {
        format!("bin_test_result_{}.csv", self.timestamp.format("%Y%m%d_%H%M%S"))
    }

    /// Writes the report into `dir` as a new file and returns its path
    ///
    /// An existing report is never overwritten: if the timestamped name is taken, a numeric suffix
    /// is added.
    pub fn persist(&self, dir: &Path) -> Result<PathBuf, PersistenceError>
    {
        std::fs::create_dir_all(dir).map_err(|err| PersistenceError::CreateDir {
            path: dir.to_path_buf(),
            source: err,
        })?;

        let base = self.file_name();
        let stem = base.trim_end_matches(".csv");
        let contents = self.render_csv();

        for attempt in 0..100 {
            let path = if attempt == 0 {
                dir.join(&base)
            }
            else {
                dir.join(format!("{}_{}.csv", stem, attempt))
            };

            let file = OpenOptions::new().write(true).create_new(true).open(&path);

            let mut file = match file {
                Ok(file) => file,
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(PersistenceError::Write {
                        path: path,
                        source: err,
                    });
                },
            };

            return file
                .write_all(contents.as_bytes())
                .and_then(|_| file.sync_all())
                .map(|_| path.clone())
                .map_err(|err| PersistenceError::Write {
                    path: path,
                    source: err,
                });
        }

        Err(PersistenceError::NamesExhausted {
            dir: dir.to_path_buf(),
        })
    }
}
