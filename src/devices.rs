//! Bench instruments and typed access to them
//!
//! # Purpose
//! A [`Bench`] owns the executor and the resolved [`DeviceHandle`] of each instrument for the whole
//! run. Instruments are reached through short-lived role views borrowed from the bench:
//!   - [`ResistanceSetter`]: `set()` the stimulus resistance
//!   - [`PowerController`]: `on()`, `off()`, and the full `cycle()` protocol
//!   - [`Meter`]: `read_mean()` with optional operator fallback
//!
//! Each view mutably borrows the bench, so two instrument commands can never be in flight at the
//! same time. The borrow checker enforces the one-command-at-a-time rule that the shared fixture
//! requires.
//!
//! # Handles
//! Handles are resolved once, before any instrument is commanded. An identifier that looks like a
//! filesystem path (a serial port such as `/dev/ttyUSB0`) must exist. A missing power supply
//! address is found by listing attached supplies and picking the first line that mentions a
//! known vendor pattern.

use std::{
    fmt,
    io::{ self, BufRead, Write },
    path::Path,
    time::Duration,
};
use serde::Serialize;
use crate::{
    cmd::{ Action, Role },
    config::Timing,
    error::{ DeviceError, DiscoveryError },
    executor::{ Executor, Response },
    plan::TestPoint,
    units::{ Ohm, Volt },
};

/// Opaque identifier of one instrument: a port path or an instrument address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceHandle
{
    role: Role,
    id: String,
}

impl DeviceHandle
{
    pub fn new(role: Role, id: &str) -> Self
    {
        Self {
            role: role,
            id: id.to_string(),
        }
    }

    pub fn role(&self) -> Role
    {
        self.role
    }

    pub fn id(&self) -> &str
    {
        &self.id
    }

    fn looks_like_path(id: &str) -> bool
    {
        id.starts_with('/') || id.starts_with("./") || id.starts_with("../")
    }

    /// Accepts a user-supplied identifier, checking that port paths exist
    pub fn resolve(role: Role, id: &str) -> Result<Self, DiscoveryError>
    {
        if Self::looks_like_path(id) && !Path::new(id).exists() {
            return Err(DiscoveryError::PortMissing {
                role: role,
                path: id.into(),
            });
        }

        Ok(Self::new(role, id))
    }
}

impl fmt::Display for DeviceHandle
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{} {}", self.role, self.id)
    }
}

/// The resolved handle of every instrument on the bench
#[derive(Debug, Clone, Serialize)]
pub struct DeviceHandles
{
    pub resistor: DeviceHandle,
    pub power: DeviceHandle,
    pub meter: DeviceHandle,
}

/// Finds the power supply by listing attached supplies
///
/// Returns the first listed line containing any of `patterns`, trimmed.
pub async fn discover_supply<E: Executor>(
    executor: &mut E,
    patterns: &[String],
    timeout: Duration,
)
    -> Result<DeviceHandle, DiscoveryError>
{
    let probe = DeviceHandle::new(Role::PowerController, "");
    let listing = match executor.execute(&probe, &Action::ListSupplies, timeout).await {
        Ok(Response::Listing(listing)) => listing,
        Ok(other) => {
            return Err(DiscoveryError::ListFailed(DeviceError::ReadFailure(format!(
                "unexpected listing response {:?}",
                other
            ))));
        },
        Err(err) => return Err(DiscoveryError::ListFailed(err)),
    };

    listing
        .lines()
        .map(str::trim)
        .find(|line| patterns.iter().any(|pattern| line.contains(pattern.as_str())))
        .map(|line| DeviceHandle::new(Role::PowerController, line))
        .ok_or_else(|| DiscoveryError::NoSupplyFound {
            patterns: patterns.to_vec(),
        })
}

/// Supplies a measurement by other means when the meter cannot
///
/// Implementations may block. The sequence holds the fixture in its measured state until this
/// returns. Returning `None` gives up on the point.
pub trait FallbackResolver
{
    fn resolve(&mut self, point: &TestPoint, cause: &DeviceError) -> Option<f64>;
}

/// Asks the operator to type the reading in
///
/// Re-prompts until a finite number is entered. End of input counts as giving up.
pub struct ConsolePrompt<R, W>
{
    input: R,
    output: W,
}

impl ConsolePrompt<io::StdinLock<'static>, io::Stderr>
{
    pub fn stdio() -> Self
    {
        Self::with(io::stdin().lock(), io::stderr())
    }
}

impl <R, W> ConsolePrompt<R, W>
    where R: BufRead,
          W: Write
{
    pub fn with(input: R, output: W) -> Self
    {
        Self {
            input: input,
            output: output,
        }
    }

    fn ask(&mut self, point: &TestPoint, cause: &DeviceError) -> io::Result<Option<f64>>
    {
        writeln!(self.output, "  automatic read failed: {}", cause)?;
        writeln!(
            self.output,
            "  enter the measured value for {} {} (expected {}):",
            point.level_name(),
            point.variant,
            point.expected,
        )?;

        loop {
            write!(self.output, "  > ")?;
            self.output.flush()?;

            let mut line = String::new();
            if self.input.read_line(&mut line)? == 0 {
                return Ok(None);
            }

            match line.trim().parse::<f64>() {
                Ok(value) if value.is_finite() => return Ok(Some(value)),
                _ => writeln!(self.output, "  invalid input, enter a number")?,
            }
        }
    }
}

impl <R, W> FallbackResolver for ConsolePrompt<R, W>
    where R: BufRead,
          W: Write
{
    fn resolve(&mut self, point: &TestPoint, cause: &DeviceError) -> Option<f64>
    {
        match self.ask(point, cause) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, "operator prompt unavailable");
                None
            },
        }
    }
}

/// Where a measurement came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingSource
{
    Instrument,
    Operator,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement
{
    pub value: f64,
    pub source: ReadingSource,
}

/// Exclusive owner of the instruments for one run
pub struct Bench<E>
{
    executor: E,
    handles: DeviceHandles,
    timing: Timing,
    fallback: Option<Box<dyn FallbackResolver>>,
}

impl <E> Bench<E>
    where E: Executor
{
    pub fn with(executor: E, handles: DeviceHandles, timing: Timing) -> Self
    {
        Self {
            executor: executor,
            handles: handles,
            timing: timing,
            fallback: None,
        }
    }

    /// Enables operator fallback for failed meter reads
    pub fn fallback(mut self, resolver: Box<dyn FallbackResolver>) -> Self
    {
        self.fallback = Some(resolver);
        self
    }

    pub fn executor(&self) -> &E
    {
        &self.executor
    }

    pub fn resistor<'b>(&'b mut self) -> ResistanceSetter<'b, E>
    {
        ResistanceSetter { bench: self }
    }

    pub fn power<'b>(&'b mut self) -> PowerController<'b, E>
    {
        PowerController { bench: self }
    }

    pub fn meter<'b>(&'b mut self) -> Meter<'b, E>
    {
        Meter { bench: self }
    }

    async fn command(&mut self, role: Role, action: Action, timeout: Duration) -> Result<Response, DeviceError>
    {
        let handle = match role {
            Role::ResistanceSetter => &self.handles.resistor,
            Role::PowerController => &self.handles.power,
            Role::Meter => &self.handles.meter,
        };

        self.executor.execute(handle, &action, timeout).await
    }
}

pub struct ResistanceSetter<'b, E>
{
    bench: &'b mut Bench<E>,
}

impl <'b, E> ResistanceSetter<'b, E>
    where E: Executor
{
    pub async fn set(self, ohms: Ohm) -> Result<(), DeviceError>
    {
        let timeout = self.bench.timing.command_timeout();
        self.bench.command(Role::ResistanceSetter, Action::SetResistance(ohms), timeout).await?;
        Ok(())
    }
}

pub struct PowerController<'b, E>
{
    bench: &'b mut Bench<E>,
}

impl <'b, E> PowerController<'b, E>
    where E: Executor
{
    pub async fn off(&mut self) -> Result<(), DeviceError>
    {
        let timeout = self.bench.timing.command_timeout();
        self.bench.command(Role::PowerController, Action::PowerOff, timeout).await?;
        Ok(())
    }

    pub async fn on(&mut self, volts: Volt) -> Result<(), DeviceError>
    {
        let timeout = self.bench.timing.command_timeout();
        self.bench.command(Role::PowerController, Action::PowerOn(volts), timeout).await?;
        Ok(())
    }

    /// Switches the supply off, waits for residual charge to drain, switches it back on, and waits
    /// for the DUT to come up
    ///
    /// Stops at the first failing command. The supply may then be left off.
    pub async fn cycle(mut self, volts: Volt) -> Result<(), DeviceError>
    {
        self.off().await?;
        tokio::time::sleep(self.bench.timing.off_hold()).await;
        self.on(volts).await?;
        tokio::time::sleep(self.bench.timing.on_hold()).await;
        Ok(())
    }
}

pub struct Meter<'b, E>
{
    bench: &'b mut Bench<E>,
}

impl <'b, E> Meter<'b, E>
    where E: Executor
{
    /// Reads the mean of `channel` from the instrument only
    ///
    /// Every failure, a timeout or a control program that cannot be launched included, is reported
    /// as [`DeviceError::ReadFailure`].
    pub async fn read_mean(&mut self, channel: u8) -> Result<f64, DeviceError>
    {
        let timeout = self.bench.timing.meter_timeout();
        let response = self.bench
            .command(Role::Meter, Action::ReadMean { channel: channel }, timeout)
            .await
            .map_err(DeviceError::into_read_failure)?;

        match response {
            Response::Reading(value) => Ok(value),
            other => Err(DeviceError::ReadFailure(format!("unexpected meter response {:?}", other))),
        }
    }

    /// Reads the mean of `channel`, asking the fallback resolver when the instrument fails
    ///
    /// Without a resolver, or when it gives up, the instrument's error is returned.
    pub async fn measure(mut self, point: &TestPoint, channel: u8) -> Result<Measurement, DeviceError>
    {
        let cause = match self.read_mean(channel).await {
            Ok(value) => {
                return Ok(Measurement {
                    value: value,
                    source: ReadingSource::Instrument,
                });
            },
            Err(err) => err,
        };

        let resolved = self.bench.fallback.as_mut().and_then(|resolver| resolver.resolve(point, &cause));

        match resolved {
            Some(value) => {
                tracing::info!(value, cause = %cause, "using operator-entered reading");
                Ok(Measurement {
                    value: value,
                    source: ReadingSource::Operator,
                })
            },
            None => Err(cause),
        }
    }
}
