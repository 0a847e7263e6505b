//! Test plans and their text format
//!
//! A plan file describes one BIN level per line:
//!
//! ```text
//! # nominal:min:max;expected
//! 100:95:105;200
//! 220:210:231;150
//! ```
//!
//! Levels are numbered from 1 in file order. Each level yields a nominal point and, unless the plan
//! is reduced to nominal values only, a lower-bound and an upper-bound point which share the
//! nominal's expected value and tolerance.

use std::{
    collections::{ BTreeSet, HashMap },
    fmt,
    error::Error,
    path::Path,
};
use serde::Serialize;
use crate::{ error::ConfigError, units::{ Ohm, MAX_WHOLE } };

/// Acceptance band as a fraction of the expected value
pub const DEFAULT_TOLERANCE: f64 = 0.05;

/// Which resistance of a level a point applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant
{
    Nominal,
    LowerBound,
    UpperBound,
}

impl Variant
{
    /// Report order within a level
    pub const ALL: [Variant; 3] = [Variant::Nominal, Variant::LowerBound, Variant::UpperBound];

    pub fn label(&self) -> &'static str
    {
        match self {
            Self::Nominal => "nominal",
            Self::LowerBound => "min",
            Self::UpperBound => "max",
        }
    }
}

impl fmt::Display for Variant
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.pad(self.label())
    }
}

/// A single stimulus/measurement pair
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestPoint
{
    pub level: u32,
    pub variant: Variant,
    pub stimulus: Ohm,
    pub expected: f64,
    pub tolerance: f64,
}

impl TestPoint
{
    pub fn new(level: u32, variant: Variant, stimulus: Ohm, expected: f64, tolerance: f64) -> Self
    {
        Self {
            level: level,
            variant: variant,
            stimulus: stimulus,
            expected: expected,
            tolerance: tolerance,
        }
    }

    pub fn key(&self) -> (u32, Variant)
    {
        (self.level, self.variant)
    }

    pub fn level_name(&self) -> String
    {
        level_name(self.level)
    }
}

pub fn level_name(level: u32) -> String
{
    format!("BIN_LEVEL_{}", level)
}

/// An ordered, immutable collection of test points
///
/// Points are kept sorted by level and then by variant (nominal, min, max). Lookup by
/// `(level, variant)` is constant time.
#[derive(Debug, Clone, Default)]
pub struct TestPlan
{
    points: Vec<TestPoint>,
    index: HashMap<(u32, Variant), usize>,
}

impl TestPlan
{
    /// Builds a plan, ordering the points and keeping the first point for any repeated key
    pub fn from_points(points: Vec<TestPoint>) -> Self
    {
        let mut points = points;
        points.sort_by_key(|point| point.key());
        points.dedup_by_key(|point| point.key());

        let index = points
            .iter()
            .enumerate()
            .map(|(position, point)| (point.key(), position))
            .collect();

        Self {
            points: points,
            index: index,
        }
    }

    pub fn get(&self, level: u32, variant: Variant) -> Option<&TestPoint>
    {
        self.index.get(&(level, variant)).map(|position| &self.points[*position])
    }

    pub fn points(&self) -> &[TestPoint]
    {
        &self.points
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TestPoint>
    {
        self.points.iter()
    }

    pub fn len(&self) -> usize
    {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.points.is_empty()
    }

    /// Level ids in ascending order
    pub fn levels(&self) -> Vec<u32>
    {
        self.points
            .iter()
            .map(|point| point.level)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Keeps only the given levels
    pub fn select(&self, levels: &[u32]) -> Self
    {
        Self::from_points(self.points.iter().filter(|point| levels.contains(&point.level)).cloned().collect())
    }

    /// Keeps only the nominal point of every level
    pub fn nominal_only(&self) -> Self
    {
        Self::from_points(self.points.iter().filter(|point| point.variant == Variant::Nominal).cloned().collect())
    }
}

impl <'a> IntoIterator for &'a TestPlan
{
    type Item = &'a TestPoint;
    type IntoIter = std::slice::Iter<'a, TestPoint>;

    fn into_iter(self) -> Self::IntoIter
    {
        self.points.iter()
    }
}

/// A description of the underlying cause of the parsing failure, if any
#[derive(Debug, Clone, PartialEq)]
pub enum FormatErrorCause
{
    /// Expected a whole number of ohms
    InvalidInteger(std::num::ParseIntError),
    /// Expected a decimal value
    InvalidDecimal(std::num::ParseFloatError),
    /// The value parsed but is zero, negative, or not finite
    NotPositive,
    /// The resistance cannot be represented with milliohm precision
    TooLarge,
}

impl fmt::Display for FormatErrorCause
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::InvalidInteger(int_err) => write!(f, "Caused by: {}", int_err),
            Self::InvalidDecimal(float_err) => write!(f, "Caused by: {}", float_err),
            Self::NotPositive => f.write_str("Value must be positive"),
            Self::TooLarge => write!(f, "Value must not exceed {}", MAX_WHOLE),
        }
    }
}

impl From<std::num::ParseIntError> for FormatErrorCause
{
    fn from(this: std::num::ParseIntError) -> Self
    {
        Self::InvalidInteger(this)
    }
}

impl From<std::num::ParseFloatError> for FormatErrorCause
{
    fn from(this: std::num::ParseFloatError) -> Self
    {
        Self::InvalidDecimal(this)
    }
}

/// A plan line that could not be used
///
/// Malformed lines are skipped rather than failing the whole load. These errors are collected so
/// they can be shown to the operator.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatError
{
    /// The offending line, trimmed
    pub raw_data: String,
    /// The line number in the file. Indexed from 1
    pub line: usize,
    /// Which field the error occurred at, if a single one can be blamed. Indexed from 1
    ///
    /// Fields are numbered in reading order: nominal, min, max, expected.
    pub field: Option<usize>,
    /// A message from the parsing routines about what went wrong
    pub mesg: &'static str,
    /// Some underlying cause, if any
    pub maybe_cause: Option<FormatErrorCause>,
}

impl fmt::Display for FormatError
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "At line {}", self.line)?;

        if let Some(field) = self.field {
            write!(f, ", field {}", field)?;
        }

        write!(f, ": {} ('{}')", self.mesg, self.raw_data)?;

        if let Some(cause) = &self.maybe_cause {
            write!(f, ". {}", cause)
        }
        else {
            Ok(())
        }
    }
}

impl Error for FormatError {}

macro_rules! parse_field
{
    ( $text:expr, $field_type:ty, $ln:expr, $idx:expr, $fail_mesg:expr, $raw_str:expr ) => {
        $text.trim()
            .parse::<$field_type>()
            .map_err(|err| {
                FormatError {
                    raw_data: String::from($raw_str),
                    line: $ln,
                    field: Some($idx),
                    mesg: $fail_mesg,
                    maybe_cause: Some(FormatErrorCause::from(err)),
                }
            })
    }
}

/// One level as written in the plan file, before scaling
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelSpec
{
    pub nominal: u64,
    pub min: u64,
    pub max: u64,
    pub expected: f64,
}

impl LevelSpec
{
    /// Parses `nominal:min:max;expected`
    pub fn parse_line(raw: &str, line: usize) -> Result<Self, FormatError>
    {
        let malformed = |mesg: &'static str, field: Option<usize>, cause: Option<FormatErrorCause>| FormatError {
            raw_data: String::from(raw),
            line: line,
            field: field,
            mesg: mesg,
            maybe_cause: cause,
        };

        let segments: Vec<&str> = raw.split(';').collect();
        if segments.len() != 2 {
            return Err(malformed("expected exactly one ';' between resistances and expected value", None, None));
        }

        let resistances: Vec<&str> = segments[0].split(':').collect();
        if resistances.len() != 3 {
            return Err(malformed("expected three ':'-separated resistances (nominal:min:max)", None, None));
        }

        let nominal = parse_field!(resistances[0], u64, line, 1, "failed to parse nominal resistance", raw)?;
        let min = parse_field!(resistances[1], u64, line, 2, "failed to parse minimum resistance", raw)?;
        let max = parse_field!(resistances[2], u64, line, 3, "failed to parse maximum resistance", raw)?;
        let expected = parse_field!(segments[1], f64, line, 4, "failed to parse expected value", raw)?;

        for (field, ohms) in [(1, nominal), (2, min), (3, max)] {
            if ohms == 0 {
                return Err(malformed("resistance must be positive", Some(field), Some(FormatErrorCause::NotPositive)));
            }
            if ohms > MAX_WHOLE {
                return Err(malformed("resistance out of range", Some(field), Some(FormatErrorCause::TooLarge)));
            }
        }

        if !expected.is_finite() || expected <= 0.0 {
            return Err(malformed("expected value must be positive", Some(4), Some(FormatErrorCause::NotPositive)));
        }

        Ok(Self {
            nominal: nominal,
            min: min,
            max: max,
            expected: expected,
        })
    }
}

/// The outcome of reading a plan: the usable plan plus every line that was skipped
#[derive(Debug, Clone)]
pub struct ParsedPlan
{
    pub plan: TestPlan,
    pub skipped: Vec<FormatError>,
}

/// Turns plan text into test points
///
/// The tolerance is computed from the unscaled expected value and then both are multiplied by the
/// channel multiplier, so a 64-channel measurement path expects 64 times the per-channel current
/// with a 64 times wider band.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlanLoader
{
    channel_multiplier: u32,
    tolerance: f64,
    nominal_only: bool,
}

impl PlanLoader
{
    pub fn new() -> Self
    {
        Self {
            channel_multiplier: 1,
            tolerance: DEFAULT_TOLERANCE,
            nominal_only: false,
        }
    }

    pub fn channel_multiplier(mut self, multiplier: u32) -> Self
    {
        self.channel_multiplier = multiplier;
        self
    }

    pub fn tolerance(mut self, fraction: f64) -> Self
    {
        self.tolerance = fraction.abs();
        self
    }

    /// Only generate the nominal point of each level
    pub fn nominal_only(mut self, nominal_only: bool) -> Self
    {
        self.nominal_only = nominal_only;
        self
    }

    fn points_for(&self, level: u32, spec: &LevelSpec) -> Vec<TestPoint>
    {
        let multiplier = self.channel_multiplier as f64;
        let expected = spec.expected * multiplier;
        let tolerance = spec.expected * self.tolerance * multiplier;

        let mut points = vec![TestPoint::new(level, Variant::Nominal, Ohm::from_whole(spec.nominal), expected, tolerance)];

        if !self.nominal_only {
            points.push(TestPoint::new(level, Variant::LowerBound, Ohm::from_whole(spec.min), expected, tolerance));
            points.push(TestPoint::new(level, Variant::UpperBound, Ohm::from_whole(spec.max), expected, tolerance));
        }

        points
    }

    /// Parses plan text. Never fails: malformed lines are reported in [`ParsedPlan::skipped`] and do
    /// not use up a level number
    pub fn parse(&self, text: &str) -> ParsedPlan
    {
        let mut points = Vec::new();
        let mut skipped = Vec::new();
        let mut level = 0u32;

        for (index, raw) in text.lines().enumerate() {
            let raw = raw.trim();

            if raw.is_empty() || raw.starts_with('#') {
                continue;
            }

            match LevelSpec::parse_line(raw, index + 1) {
                Ok(spec) => {
                    level += 1;
                    points.extend(self.points_for(level, &spec));
                },
                Err(err) => skipped.push(err),
            }
        }

        ParsedPlan {
            plan: TestPlan::from_points(points),
            skipped: skipped,
        }
    }

    /// Reads and parses a plan file
    ///
    /// A file that cannot be read, or that yields no usable level, is an error.
    pub fn load(&self, path: &Path) -> Result<ParsedPlan, ConfigError>
    {
        if self.channel_multiplier == 0 {
            return Err(ConfigError::ZeroMultiplier);
        }

        let text = std::fs::read_to_string(path).map_err(|err| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source: err,
        })?;

        let parsed = self.parse(&text);

        for err in parsed.skipped.iter() {
            tracing::warn!(path = %path.display(), "skipping plan line. {}", err);
        }

        if parsed.plan.is_empty() {
            return Err(ConfigError::Empty {
                path: path.to_path_buf(),
            });
        }

        Ok(parsed)
    }
}

impl Default for PlanLoader
{
    fn default() -> Self
    {
        Self::new()
    }
}

/// Levels requested by the operator
///
/// Accepts a comma separated list where each entry is a bare number (`3`) or a level name
/// (`BIN_LEVEL_3`, case-insensitive).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelSelection
{
    requested: Vec<String>,
}

/// The levels that will run, plus what was asked for but does not exist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSelection
{
    pub levels: Vec<u32>,
    pub ignored: Vec<String>,
}

impl LevelSelection
{
    /// Everything in the plan
    pub fn all() -> Self
    {
        Self {
            requested: Vec::new(),
        }
    }

    pub fn parse(text: &str) -> Self
    {
        Self {
            requested: text
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(String::from)
                .collect(),
        }
    }

    fn entry_level(entry: &str) -> Option<u32>
    {
        let upper = entry.to_ascii_uppercase();
        let digits = upper.strip_prefix("BIN_LEVEL_").unwrap_or(&upper);
        digits.parse::<u32>().ok()
    }

    /// Matches the request against `plan`
    ///
    /// Unknown entries are reported and dropped. If nothing valid remains, every level runs.
    pub fn resolve(&self, plan: &TestPlan) -> ResolvedSelection
    {
        let available = plan.levels();
        let mut levels = BTreeSet::new();
        let mut ignored = Vec::new();

        for entry in self.requested.iter() {
            match Self::entry_level(entry) {
                Some(level) if available.contains(&level) => {
                    levels.insert(level);
                },
                _ => ignored.push(entry.clone()),
            }
        }

        ResolvedSelection {
            levels: if levels.is_empty() { available } else { levels.into_iter().collect() },
            ignored: ignored,
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::{ FormatErrorCause, LevelSelection, LevelSpec, PlanLoader, TestPlan, TestPoint, Variant };
    use crate::{ error::ConfigError, units::{ Ohm, MAX_WHOLE } };

    fn close(a: f64, b: f64) -> bool
    {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn parse_single_level()
    {
        let parsed = PlanLoader::new().parse("100:95:105;200");
        let nominal = parsed.plan.get(1, Variant::Nominal).unwrap();

        assert!(parsed.skipped.is_empty());
        assert_eq!(parsed.plan.len(), 3);
        assert_eq!(nominal.stimulus, Ohm::from_whole(100));
        assert!(close(nominal.expected, 200.0));
        assert!(close(nominal.tolerance, 10.0));
        assert_eq!(parsed.plan.get(1, Variant::LowerBound).unwrap().stimulus, Ohm::from_whole(95));
        assert_eq!(parsed.plan.get(1, Variant::UpperBound).unwrap().stimulus, Ohm::from_whole(105));
    }

    #[test]
    fn channel_multiplier_scales_expected_and_tolerance()
    {
        let parsed = PlanLoader::new().channel_multiplier(64).parse("100:95:105;200");
        let nominal = parsed.plan.get(1, Variant::Nominal).unwrap();

        assert_eq!(nominal.stimulus, Ohm::from_whole(100));
        assert!(close(nominal.expected, 12_800.0));
        assert!(close(nominal.tolerance, 640.0));
    }

    #[test]
    fn malformed_lines_skip_without_numbering()
    {
        let text = "# header\n\n100:95;200\n200:190:210;300\nfoo\n1:2:3;4;5\n300:290:310;abc\n400:390:410;500\n";
        let parsed = PlanLoader::new().parse(text);

        assert_eq!(parsed.plan.levels(), vec![1, 2]);
        assert_eq!(parsed.plan.get(1, Variant::Nominal).unwrap().stimulus, Ohm::from_whole(200));
        assert_eq!(parsed.plan.get(2, Variant::Nominal).unwrap().stimulus, Ohm::from_whole(400));
        assert_eq!(parsed.skipped.iter().map(|err| err.line).collect::<Vec<_>>(), vec![3, 5, 6, 7]);
        assert_eq!(parsed.skipped[3].field, Some(4));
        assert!(matches!(parsed.skipped[3].maybe_cause, Some(FormatErrorCause::InvalidDecimal(_))));
    }

    #[test]
    fn non_positive_values_are_skipped()
    {
        let err = LevelSpec::parse_line("100:0:105;200", 9).unwrap_err();
        assert_eq!(err.field, Some(2));
        assert_eq!(err.maybe_cause, Some(FormatErrorCause::NotPositive));

        let err = LevelSpec::parse_line("100:95:105;0", 9).unwrap_err();
        assert_eq!(err.field, Some(4));

        let err = LevelSpec::parse_line("-100:95:105;10", 9).unwrap_err();
        assert!(matches!(err.maybe_cause, Some(FormatErrorCause::InvalidInteger(_))));
    }

    #[test]
    fn oversized_resistance_is_skipped()
    {
        let parsed = PlanLoader::new().parse("18446744073709551615:95:105;200\n100:95:105;200\n");

        assert_eq!(parsed.skipped.len(), 1);
        assert_eq!(parsed.skipped[0].field, Some(1));
        assert_eq!(parsed.skipped[0].maybe_cause, Some(FormatErrorCause::TooLarge));
        assert_eq!(parsed.plan.levels(), vec![1]);
        assert_eq!(parsed.plan.get(1, Variant::Nominal).unwrap().stimulus, Ohm::from_whole(100));

        let largest = format!("{}:95:105;200", MAX_WHOLE);
        assert_eq!(LevelSpec::parse_line(&largest, 1).unwrap().nominal, MAX_WHOLE);

        let err = LevelSpec::parse_line(&format!("100:95:{};200", MAX_WHOLE + 1), 1).unwrap_err();
        assert_eq!(err.field, Some(3));
    }

    #[test]
    fn format_error_names_line_and_field()
    {
        let err = LevelSpec::parse_line("100:9x:105;200", 4).unwrap_err();
        let text = err.to_string();

        assert!(text.starts_with("At line 4, field 2: failed to parse minimum resistance ('100:9x:105;200')"));
        assert!(text.contains("Caused by"));
    }

    #[test]
    fn whitespace_and_decimal_expected()
    {
        let parsed = PlanLoader::new().parse("  100 : 95 : 105 ; 12.5  ");
        let nominal = parsed.plan.get(1, Variant::Nominal).unwrap();

        assert!(close(nominal.expected, 12.5));
        assert!(close(nominal.tolerance, 0.625));
    }

    #[test]
    fn nominal_only_plans()
    {
        let parsed = PlanLoader::new().nominal_only(true).parse("100:95:105;200\n200:190:210;300");

        assert_eq!(parsed.plan.len(), 2);
        assert!(parsed.plan.iter().all(|point| point.variant == Variant::Nominal));
    }

    #[test]
    fn plan_orders_points_and_dedups()
    {
        let point = |level, variant| TestPoint::new(level, variant, Ohm::from_whole(10), 1.0, 0.05);
        let plan = TestPlan::from_points(vec![
            point(2, Variant::UpperBound),
            point(1, Variant::LowerBound),
            point(2, Variant::Nominal),
            point(1, Variant::Nominal),
            point(1, Variant::Nominal),
        ]);
        let keys: Vec<_> = plan.iter().map(|point| point.key()).collect();

        assert_eq!(keys, vec![
            (1, Variant::Nominal),
            (1, Variant::LowerBound),
            (2, Variant::Nominal),
            (2, Variant::UpperBound),
        ]);
        assert_eq!(plan.nominal_only().len(), 2);
        assert_eq!(plan.select(&[2]).levels(), vec![2]);
    }

    #[test]
    fn selection_accepts_numbers_and_names()
    {
        let plan = PlanLoader::new().parse("1:1:1;1\n2:2:2;2\n3:3:3;3\n4:4:4;4").plan;
        let resolved = LevelSelection::parse("3, bin_level_1,BIN_LEVEL_9, x,").resolve(&plan);

        assert_eq!(resolved.levels, vec![1, 3]);
        assert_eq!(resolved.ignored, vec![String::from("BIN_LEVEL_9"), String::from("x")]);
    }

    #[test]
    fn empty_or_invalid_selection_runs_everything()
    {
        let plan = PlanLoader::new().parse("1:1:1;1\n2:2:2;2").plan;

        assert_eq!(LevelSelection::all().resolve(&plan).levels, vec![1, 2]);
        assert_eq!(LevelSelection::parse("7").resolve(&plan).levels, vec![1, 2]);
    }

    #[test]
    fn load_reports_unreadable_and_empty_files()
    {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.txt");
        assert!(matches!(PlanLoader::new().load(&missing), Err(ConfigError::Unreadable { .. })));

        let empty = dir.path().join("empty.txt");
        std::fs::write(&empty, "# nothing here\n100:95;200\n").unwrap();
        assert!(matches!(PlanLoader::new().load(&empty), Err(ConfigError::Empty { .. })));

        let good = dir.path().join("good.txt");
        std::fs::write(&good, "100:95:105;200\n").unwrap();
        assert_eq!(PlanLoader::new().load(&good).unwrap().plan.len(), 3);

        assert!(matches!(PlanLoader::new().channel_multiplier(0).load(&good), Err(ConfigError::ZeroMultiplier)));
    }
}
