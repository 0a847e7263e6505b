//! Bench configuration
//!
//! Everything the sequencer needs to know about the bench is gathered into [`BenchConfig`] and
//! handed over explicitly; nothing is read from process-wide state once a run starts. The file
//! form is JSON and every field is optional:
//!
//! ```json
//! {
//!   "voltage": 13.5,
//!   "meter_channel": 4,
//!   "supply_patterns": ["ITECH", "2EC7"],
//!   "timing": { "settle_ms": 1500 },
//!   "commands": {
//!     "read_mean": { "program": "uv", "args": ["run", "yokogawa_pyvisa.py", "mean", "-c", "{channel}"], "cwd": "~/test_script/yokogawa" }
//!   }
//! }
//! ```

use std::{ path::{ Path, PathBuf }, time::Duration };
use serde::{ Serialize, Deserialize };
use crate::{
    cmd::{ expand_home, CommandSet },
    error::ConfigError,
    units::Volt,
};

/// Fixed waits and time budgets of the sequence, in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing
{
    /// How long the supply stays off during a power cycle
    pub off_hold_ms: u64,
    /// How long to wait after the supply comes back on
    pub on_hold_ms: u64,
    /// Wait between a completed power cycle and the measurement
    pub settle_ms: u64,
    /// Time budget of a meter read
    pub meter_timeout_ms: u64,
    /// Time budget of every other instrument command
    pub command_timeout_ms: u64,
}

impl Timing
{
    pub fn off_hold(&self) -> Duration
    {
        Duration::from_millis(self.off_hold_ms)
    }

    pub fn on_hold(&self) -> Duration
    {
        Duration::from_millis(self.on_hold_ms)
    }

    pub fn settle(&self) -> Duration
    {
        Duration::from_millis(self.settle_ms)
    }

    pub fn meter_timeout(&self) -> Duration
    {
        Duration::from_millis(self.meter_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration
    {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Every wait set to zero, timeouts kept. For dry runs against stand-in instruments
    pub fn without_waits(mut self) -> Self
    {
        self.off_hold_ms = 0;
        self.on_hold_ms = 0;
        self.settle_ms = 0;
        self
    }
}

impl Default for Timing
{
    fn default() -> Self
    {
        Self {
            off_hold_ms: 2_000,
            on_hold_ms: 1_000,
            settle_ms: 1_500,
            meter_timeout_ms: 10_000,
            command_timeout_ms: 30_000,
        }
    }
}

/// The kind of LED driver output under test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Profile
{
    /// Headlight driver, one channel per measurement path
    Headlight,
    /// Signal LED driver, 64 identical channels summed on one measurement path
    Signal,
}

impl Profile
{
    pub fn channel_multiplier(&self) -> u32
    {
        match self {
            Self::Headlight => 1,
            Self::Signal => 64,
        }
    }

    pub fn default_plan(&self) -> PathBuf
    {
        match self {
            Self::Headlight => expand_home("~/test_script/res_ctrl/bin_res.txt"),
            Self::Signal => expand_home("~/test_script/res_ctrl/bin_res_sigled.txt"),
        }
    }

    pub fn label(&self) -> &'static str
    {
        match self {
            Self::Headlight => "headlight",
            Self::Signal => "signal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig
{
    /// Supply voltage used for every power-up
    pub voltage: Volt,
    /// Scope channel carrying the DUT current
    pub meter_channel: u8,
    /// Acceptance band as a fraction of the expected value
    pub tolerance: f64,
    /// Substrings identifying the supply in the listing output
    pub supply_patterns: Vec<String>,
    /// Default resistor port when none is given on the command line
    pub resistor_port: String,
    /// Meter identifier substituted for `{address}` in meter commands
    pub meter_id: String,
    /// Directory receiving run reports
    pub report_dir: String,
    pub timing: Timing,
    pub commands: CommandSet,
}

impl Default for BenchConfig
{
    fn default() -> Self
    {
        Self {
            voltage: Volt::from_millis(13_500),
            meter_channel: 4,
            tolerance: crate::plan::DEFAULT_TOLERANCE,
            supply_patterns: vec![String::from("ITECH"), String::from("2EC7")],
            resistor_port: String::from("/dev/ttyUSB0"),
            meter_id: String::from("scope"),
            report_dir: String::from("~/test_script/res_ctrl"),
            timing: Timing::default(),
            commands: CommandSet::default(),
        }
    }
}

impl BenchConfig
{
    /// Reads a JSON bench file. Fields missing from the file keep their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError>
    {
        let text = std::fs::read_to_string(path).map_err(|err| ConfigError::BenchUnreadable {
            path: path.to_path_buf(),
            source: err,
        })?;

        serde_json::from_str(&text).map_err(|err| ConfigError::BenchInvalid {
            path: path.to_path_buf(),
            source: err,
        })
    }

    /// Loads `path` when given, otherwise the defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError>
    {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn report_dir(&self) -> PathBuf
    {
        expand_home(&self.report_dir)
    }
}
