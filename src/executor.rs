//! Command execution against the bench instruments
//!
//! An [`Executor`] performs exactly one instrument action per call and reports what happened. It
//! does not retry and does not cache. Whether to try again, give up on a test point, or ask the
//! operator is decided further up, in the sequencer.
//!
//! # Cancel Safety
//! [`ProcessExecutor::execute`] spawns its child with kill-on-drop, so dropping the future (e.g.
//! because its timeout elapsed) terminates the instrument program rather than leaving it running
//! against the fixture. The sequencer still never races these futures against each other: a
//! half-finished command leaves the bench in an unknown state.

use std::{
    collections::{ HashMap, VecDeque },
    process::Stdio,
    time::Duration,
};
use tokio::{ process::Command, time::Instant };
use crate::{
    cmd::{ Action, ActionKind, CommandSet, Role },
    devices::DeviceHandle,
    error::DeviceError,
};

/// What an instrument gave back for a successful action
#[derive(Debug, Clone, PartialEq)]
pub enum Response
{
    /// The instrument accepted the command
    Ack,
    /// A numeric reading from the meter
    Reading(f64),
    /// Raw listing output, one device per line
    Listing(String),
}

/// Uniform access to the bench instruments
///
/// Implementations must honour `timeout`: a call never blocks longer than that, and an overrun
/// is reported as [`DeviceError::Timeout`].
#[allow(async_fn_in_trait)]
pub trait Executor
{
    async fn execute(&mut self, handle: &DeviceHandle, action: &Action, timeout: Duration) -> Result<Response, DeviceError>;
}

/// Runs each action as an external control program, as described by a [`CommandSet`]
pub struct ProcessExecutor
{
    commands: CommandSet,
}

impl ProcessExecutor
{
    pub fn with(commands: CommandSet) -> Self
    {
        Self {
            commands: commands,
        }
    }
}

impl Executor for ProcessExecutor
{
    async fn execute(&mut self, handle: &DeviceHandle, action: &Action, timeout: Duration) -> Result<Response, DeviceError>
    {
        let invocation = self.commands.render(handle.id(), action);
        tracing::debug!(role = %action.role(), command = %invocation, "executing");

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &invocation.cwd {
            command.current_dir(cwd);
        }

        let output = match tokio::time::timeout(timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Err(DeviceError::Spawn {
                    program: invocation.program,
                    source: err,
                });
            },
            Err(_elapsed) => {
                return Err(DeviceError::Timeout {
                    role: action.role(),
                    action: action.to_string(),
                    after: timeout,
                });
            },
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

            if action.kind() == ActionKind::ReadMean {
                return Err(DeviceError::ReadFailure(format!(
                    "{} ({})",
                    if stderr.is_empty() { &stdout } else { &stderr },
                    output.status,
                )));
            }

            return Err(DeviceError::Rejected {
                role: action.role(),
                action: action.to_string(),
                status: output.status.to_string(),
                detail: stderr,
            });
        }

        interpret(action, stdout)
    }
}

/// Converts the standard output of a successful action into a [`Response`]
fn interpret(action: &Action, stdout: String) -> Result<Response, DeviceError>
{
    match action.kind() {
        ActionKind::ReadMean => parse_reading(&stdout).map(Response::Reading),
        ActionKind::ListSupplies => Ok(Response::Listing(stdout)),
        _ => Ok(Response::Ack),
    }
}

/// Parses a meter reading, tolerating surrounding whitespace
///
/// Only finite numbers are accepted. Scope front ends print `NaN` or `INF` when a channel is
/// out of range; those are read failures, not readings.
pub fn parse_reading(text: &str) -> Result<f64, DeviceError>
{
    let text = text.trim();

    match text.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        Ok(_) => Err(DeviceError::ReadFailure(format!("out-of-range reading '{}'", text))),
        Err(_) if text.is_empty() => Err(DeviceError::ReadFailure(String::from("empty output"))),
        Err(_) => Err(DeviceError::ReadFailure(format!("non-numeric output '{}'", text))),
    }
}

/// One call observed by a [`ScriptedExecutor`]
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord
{
    pub device: String,
    pub action: Action,
    pub started: Instant,
    pub finished: Instant,
}

/// An in-memory bench that answers from a script
///
/// Readings are looked up by the resistance most recently set, falling back to a default. Any
/// call can be scripted to fail by its kind and 1-based occurrence. Every call is recorded with
/// its start and end instants so that command ordering can be audited after a run.
pub struct ScriptedExecutor
{
    readings: HashMap<u64, f64>,
    default_reading: f64,
    failures: Vec<(ActionKind, usize)>,
    stalls: Vec<(ActionKind, usize)>,
    latency: Duration,
    listing: String,
    last_stimulus: Option<u64>,
    counts: HashMap<ActionKind, usize>,
    calls: Vec<CallRecord>,
}

impl ScriptedExecutor
{
    pub fn new() -> Self
    {
        Self {
            readings: HashMap::new(),
            default_reading: 0.0,
            failures: Vec::new(),
            stalls: Vec::new(),
            latency: Duration::from_millis(10),
            listing: String::new(),
            last_stimulus: None,
            counts: HashMap::new(),
            calls: Vec::new(),
        }
    }

    /// Report `value` whenever the resistor was last set to `ohms` whole ohms
    pub fn reading(mut self, ohms: u64, value: f64) -> Self
    {
        self.readings.insert(ohms, value);
        self
    }

    pub fn default_reading(mut self, value: f64) -> Self
    {
        self.default_reading = value;
        self
    }

    /// Make the `nth` call (1-based) of `kind` fail
    pub fn fail(mut self, kind: ActionKind, nth: usize) -> Self
    {
        self.failures.push((kind, nth));
        self
    }

    /// Make the `nth` call (1-based) of `kind` hang until its timeout elapses
    pub fn stall(mut self, kind: ActionKind, nth: usize) -> Self
    {
        self.stalls.push((kind, nth));
        self
    }

    /// Time every call takes to complete
    pub fn latency(mut self, latency: Duration) -> Self
    {
        self.latency = latency;
        self
    }

    /// Output of the supply listing command
    pub fn listing(mut self, listing: &str) -> Self
    {
        self.listing = listing.to_string();
        self
    }

    pub fn calls(&self) -> &[CallRecord]
    {
        &self.calls
    }

    /// How many times an action of `kind` was issued
    pub fn count(&self, kind: ActionKind) -> usize
    {
        self.counts.get(&kind).copied().unwrap_or(0)
    }
}

impl Default for ScriptedExecutor
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl Executor for ScriptedExecutor
{
    async fn execute(&mut self, handle: &DeviceHandle, action: &Action, timeout: Duration) -> Result<Response, DeviceError>
    {
        let kind = action.kind();
        let nth = {
            let count = self.counts.entry(kind).or_insert(0);
            *count += 1;
            *count
        };
        let started = Instant::now();

        let stalled = self.stalls.contains(&(kind, nth));
        let delay = if stalled { timeout } else { self.latency.min(timeout) };
        tokio::time::sleep(delay).await;

        self.calls.push(CallRecord {
            device: handle.id().to_string(),
            action: action.clone(),
            started: started,
            finished: Instant::now(),
        });

        if stalled {
            return Err(DeviceError::Timeout {
                role: action.role(),
                action: action.to_string(),
                after: timeout,
            });
        }

        if self.failures.contains(&(kind, nth)) {
            if kind == ActionKind::ReadMean {
                return Err(DeviceError::ReadFailure(String::from("scripted failure")));
            }

            return Err(DeviceError::Rejected {
                role: action.role(),
                action: action.to_string(),
                status: String::from("scripted"),
                detail: String::new(),
            });
        }

        match action {
            Action::SetResistance(ohms) => {
                self.last_stimulus = Some(ohms.whole());
                Ok(Response::Ack)
            },
            Action::ReadMean { .. } => {
                let value = self.last_stimulus
                    .and_then(|ohms| self.readings.get(&ohms).copied())
                    .unwrap_or(self.default_reading);
                Ok(Response::Reading(value))
            },
            Action::ListSupplies => Ok(Response::Listing(self.listing.clone())),
            Action::PowerOff | Action::PowerOn(_) => Ok(Response::Ack),
        }
    }
}

/// Calls recorded against one role, in issue order
pub fn calls_for(calls: &[CallRecord], role: Role) -> Vec<&CallRecord>
{
    calls.iter().filter(|call| call.action.role() == role).collect()
}
