//! Fixed-point bench quantities
//!
//! Resistances and supply voltages are passed verbatim to instrument command lines, so they are
//! kept as exact decimals rather than floats. A value typed as `13.5` on the command line must reach
//! the power supply as `13.5`, not `13.499999999999998`.

use std::{
    fmt::{ self, Write },
    cmp::{ PartialEq, PartialOrd, Eq, Ord, Ordering },
};
use serde::{ Serialize, Serializer, Deserialize, Deserializer };

const MILLIS_PER_WHOLE: u64 = 1000;

/// Largest whole value that can be held with milli precision
pub const MAX_WHOLE: u64 = u64::MAX / MILLIS_PER_WHOLE;

/// Unsigned decimal value with milli (10e-3) precision
#[derive(Debug, Clone, Copy, Hash)]
struct FixedMilli
{
    millis: u64,
}

impl FixedMilli
{
    /// Values above [`MAX_WHOLE`] saturate
    fn from_whole(whole: u64) -> Self
    {
        Self { millis: whole.checked_mul(MILLIS_PER_WHOLE).unwrap_or(u64::MAX) }
    }

    /// Rounds to the nearest thousandth. Negative and non-finite inputs saturate to zero
    fn from_f64(num: f64) -> Self
    {
        if !num.is_finite() || num <= 0.0 {
            return Self { millis: 0 };
        }

        Self { millis: (num * MILLIS_PER_WHOLE as f64).round() as u64 }
    }

    fn as_f64(&self) -> f64
    {
        (self.millis / MILLIS_PER_WHOLE) as f64 + (self.millis % MILLIS_PER_WHOLE) as f64 / MILLIS_PER_WHOLE as f64
    }

    fn whole(&self) -> u64
    {
        self.millis / MILLIS_PER_WHOLE
    }

    fn fraction(&self) -> u64
    {
        self.millis % MILLIS_PER_WHOLE
    }
}

impl PartialEq for FixedMilli
{
    fn eq(&self, rhs: &Self) -> bool
    {
        self.millis == rhs.millis
    }
}

impl PartialOrd for FixedMilli
{
    fn partial_cmp(&self, rhs: &Self) -> Option<Ordering>
    {
        Some(self.cmp(rhs))
    }
}

impl Eq for FixedMilli {}
impl Ord for FixedMilli
{
    fn cmp(&self, rhs: &Self) -> Ordering
    {
        self.millis.cmp(&rhs.millis)
    }
}

/// A failure to read a decimal quantity from text
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseUnitError
{
    #[error("empty value")]
    Empty,
    #[error("'{0}' is not a non-negative decimal number")]
    Invalid(String),
    #[error("'{0}' has more than three decimal places")]
    TooPrecise(String),
}

impl std::str::FromStr for FixedMilli
{
    type Err = ParseUnitError;

    fn from_str(text: &str) -> Result<Self, Self::Err>
    {
        let text = text.trim();

        if text.is_empty() {
            return Err(ParseUnitError::Empty);
        }

        let (whole_str, fraction_str) = match text.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (text, ""),
        };

        let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());

        if (whole_str.is_empty() && fraction_str.is_empty()) || !all_digits(whole_str) || !all_digits(fraction_str) {
            return Err(ParseUnitError::Invalid(text.to_string()));
        }

        if fraction_str.len() > 3 {
            return Err(ParseUnitError::TooPrecise(text.to_string()));
        }

        let whole = if whole_str.is_empty() {
            0
        }
        else {
            whole_str.parse::<u64>().map_err(|_| ParseUnitError::Invalid(text.to_string()))?
        };

        let mut fraction = 0u64;
        for (index, digit) in fraction_str.bytes().enumerate() {
            fraction += (digit - b'0') as u64 * 10u64.pow(2 - index as u32);
        }

        whole
            .checked_mul(MILLIS_PER_WHOLE)
            .and_then(|millis| millis.checked_add(fraction))
            .map(|millis| Self { millis: millis })
            .ok_or_else(|| ParseUnitError::Invalid(text.to_string()))
    }
}

/// Formats a quantity, optionally followed by its symbol
///
/// Honours the formatter precision: `{:.2}` zero-extends or truncates to two places. Without a
/// precision, trailing zeros of the fraction are dropped and a whole value prints with no decimal
/// point.
pub struct UnitDisplay
{
    symbol: &'static str,
    value: FixedMilli,
    hide_unit: bool,
}

impl fmt::Display for UnitDisplay
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let mut text = String::with_capacity(16);
        write!(text, "{}", self.value.whole())?;

        let mut fraction = self.value.fraction();
        let mut divisor = MILLIS_PER_WHOLE;

        if let Some(precision) = f.precision() {
            if precision != 0 {
                text.push('.');
            }

            for _index in 0..precision {
                if divisor <= 1 {
                    text.push('0');
                }
                else {
                    divisor /= 10;
                    let digit = fraction / divisor;
                    fraction %= divisor;
                    text.push((b'0' + digit as u8) as char);
                }
            }
        }
        else if fraction != 0 {
            text.push('.');

            while fraction != 0 {
                divisor /= 10;
                let digit = fraction / divisor;
                fraction %= divisor;
                text.push((b'0' + digit as u8) as char);
            }
        }

        if !self.hide_unit {
            text.push_str(self.symbol);
        }

        // pad the assembled text so that width and alignment flags still apply
        f.pad_integral(true, "", &text)
    }
}

/// A resistance with milliohm precision
#[derive(Debug, Clone, Copy, Hash)]
pub struct Ohm
{
    value: FixedMilli,
}

/// A voltage with millivolt precision
#[derive(Debug, Clone, Copy, Hash)]
pub struct Volt
{
    value: FixedMilli,
}

macro_rules! impl_unit
{
    { $u:ty, $symbol:literal } => {
        impl $u
        {
            /// The written shorthand symbol
            pub const SYMBOL: &'static str = $symbol;

            /// Constructs a new value from a whole number of base units
            pub fn from_whole(whole: u64) -> Self
            {
                Self { value: FixedMilli::from_whole(whole) }
            }

            pub fn from_millis(millis: u64) -> Self
            {
                Self { value: FixedMilli { millis: millis } }
            }

            /// Constructs a value from a float, rounding to the nearest thousandth
            pub fn from_f64(num: f64) -> Self
            {
                Self { value: FixedMilli::from_f64(num) }
            }

            pub fn as_f64(&self) -> f64
            {
                self.value.as_f64()
            }

            pub fn as_millis(&self) -> u64
            {
                self.value.millis
            }

            /// Returns the digits before the decimal point
            pub fn whole(&self) -> u64
            {
                self.value.whole()
            }

            /// Displays the value followed by its symbol
            pub fn display(&self) -> UnitDisplay
            {
                UnitDisplay {
                    symbol: Self::SYMBOL,
                    value: self.value,
                    hide_unit: false,
                }
            }

            /// Displays the bare number, as instruments expect it on their command lines
            pub fn display_anon(&self) -> UnitDisplay
            {
                UnitDisplay {
                    symbol: Self::SYMBOL,
                    value: self.value,
                    hide_unit: true,
                }
            }
        }

        impl std::str::FromStr for $u
        {
            type Err = ParseUnitError;

            fn from_str(text: &str) -> Result<Self, Self::Err>
            {
                // tolerate a trailing symbol, e.g. "13.5V"
                let text = text.trim();
                let text = text.strip_suffix(Self::SYMBOL).unwrap_or(text);
                Ok(Self { value: text.parse::<FixedMilli>()? })
            }
        }

        impl fmt::Display for $u
        {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
            {
                fmt::Display::fmt(&self.display(), f)
            }
        }

        impl PartialEq for $u
        {
            fn eq(&self, rhs: &Self) -> bool
            {
                self.value == rhs.value
            }
        }

        impl PartialOrd for $u
        {
            fn partial_cmp(&self, rhs: &Self) -> Option<Ordering>
            {
                Some(self.cmp(rhs))
            }
        }

        impl Eq for $u {}
        impl Ord for $u
        {
            fn cmp(&self, rhs: &Self) -> Ordering
            {
                self.value.cmp(&rhs.value)
            }
        }

        impl Serialize for $u
        {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error>
            {
                if self.value.fraction() == 0 {
                    serializer.serialize_u64(self.value.whole())
                }
                else {
                    serializer.serialize_f64(self.as_f64())
                }
            }
        }

        impl <'de> Deserialize<'de> for $u
        {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error>
            {
                let num = f64::deserialize(deserializer)?;

                if !num.is_finite() || num < 0.0 {
                    return Err(serde::de::Error::custom(format!("{} must be a non-negative number", stringify!($u))));
                }

                Ok(Self::from_f64(num))
            }
        }
    }
}

impl_unit!{ Ohm, "Ω" }
impl_unit!{ Volt, "V" }
