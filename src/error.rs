//! Error taxonomy
//!
//! Errors fall into two groups. Setup errors ([`ConfigError`], [`DiscoveryError`], and a failed
//! bench power-up) stop a run before the first test point. [`DeviceError`]s raised while a point is
//! running are recoverable: the sequencer turns them into an `Error` verdict for that point and
//! moves on. A failing measurement is not an error at all, just a `Fail` verdict.

use std::{ io, path::PathBuf, time::Duration };
use crate::cmd::Role;

/// A failed interaction with one instrument
#[derive(Debug, thiserror::Error)]
pub enum DeviceError
{
    /// The control program could not be started at all
    #[error("failed to launch `{program}`: {source}")]
    Spawn
    {
        program: String,
        #[source]
        source: io::Error,
    },
    /// The control program did not finish within its time budget and was killed
    #[error("{role} `{action}` timed out after {after:?}")]
    Timeout
    {
        role: Role,
        action: String,
        after: Duration,
    },
    /// The control program ran and reported failure
    #[error("{role} rejected `{action}` ({status}){}", fmt_detail(.detail))]
    Rejected
    {
        role: Role,
        action: String,
        status: String,
        detail: String,
    },
    /// The meter answered with something that is not a reading
    #[error("meter read failed: {0}")]
    ReadFailure(String),
}

impl DeviceError
{
    /// Folds any failure into `ReadFailure`, keeping its description
    pub fn into_read_failure(self) -> Self
    {
        match self {
            Self::ReadFailure(_) => self,
            other => Self::ReadFailure(other.to_string()),
        }
    }
}

fn fmt_detail(detail: &str) -> String
{
    if detail.is_empty() {
        String::new()
    }
    else {
        format!(": {}", detail)
    }
}

/// The test plan or bench configuration could not be used
#[derive(Debug, thiserror::Error)]
pub enum ConfigError
{
    #[error("cannot read test plan {}: {source}", .path.display())]
    Unreadable
    {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("test plan {} contains no valid levels", .path.display())]
    Empty
    {
        path: PathBuf,
    },
    #[error("cannot read bench configuration {}: {source}", .path.display())]
    BenchUnreadable
    {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid bench configuration {}: {source}", .path.display())]
    BenchInvalid
    {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("channel multiplier must be at least 1")]
    ZeroMultiplier,
}

/// A required instrument could not be located
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError
{
    #[error("{role} port {} does not exist; bind the device and retry", .path.display())]
    PortMissing
    {
        role: Role,
        path: PathBuf,
    },
    #[error("no power supply found (looked for {})", .patterns.join(", "))]
    NoSupplyFound
    {
        patterns: Vec<String>,
    },
    #[error("power supply discovery failed: {0}")]
    ListFailed(#[source] DeviceError),
}

/// The run report could not be written
///
/// The in-memory report is unaffected and can still be rendered.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError
{
    #[error("cannot create report directory {}: {source}", .path.display())]
    CreateDir
    {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot write report {}: {source}", .path.display())]
    Write
    {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no free report file name left in {}", .dir.display())]
    NamesExhausted
    {
        dir: PathBuf,
    },
}

/// Anything that prevents a run from starting
#[derive(Debug, thiserror::Error)]
pub enum SetupError
{
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("failed to power up the bench: {0}")]
    PowerUp(#[source] DeviceError),
}
