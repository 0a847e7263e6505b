//! Pass/fail classification of a single measurement

use std::fmt;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict
{
    /// The measurement fell inside the tolerance band
    Pass,
    /// The measurement fell outside the tolerance band
    Fail,
    /// No trustworthy measurement was obtained
    Error,
}

impl Verdict
{
    pub fn label(&self) -> &'static str
    {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for Verdict
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.pad(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verification
{
    /// Either `Pass` or `Fail`
    pub verdict: Verdict,
    /// `(measured - expected) / expected * 100`, or 0 when nothing positive is expected
    pub error_percent: f64,
}

/// Checks `measured` against `expected ± tolerance`, bounds included
pub fn verify(measured: f64, expected: f64, tolerance: f64) -> Verification
{
    let tolerance = tolerance.abs();
    let passed = expected - tolerance <= measured && measured <= expected + tolerance;

    Verification {
        verdict: if passed { Verdict::Pass } else { Verdict::Fail },
        error_percent: error_percent(measured, expected),
    }
}

/// Signed deviation from `expected` in percent
///
/// A non-positive `expected` has no meaningful relative error; it yields 0 instead of dividing by
/// zero.
pub fn error_percent(measured: f64, expected: f64) -> f64
{
    if expected > 0.0 {
        (measured - expected) / expected * 100.0
    }
    else {
        0.0
    }
}
