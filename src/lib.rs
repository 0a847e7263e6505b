//! **BIN**-level validation **seq**uencer for LED driver benches
//!
//! Drives a programmable resistor, a power supply, and an oscilloscope through a fixed protocol
//! for every point of a test plan, classifies each reading against its tolerance band, and writes
//! a report per run.
//!
//! ```no_run
//! use binseq::{ BenchConfig, PlanLoader, ProcessExecutor, RunRecorder, Sequencer, SequencerConfig };
//! # async fn demo(handles: binseq::DeviceHandles) -> anyhow::Result<()> {
//! let bench = BenchConfig::default();
//! let plan = PlanLoader::new().load("bin_res.txt".as_ref())?.plan;
//!
//! let config = SequencerConfig {
//!     timing: bench.timing.clone(),
//!     voltage: bench.voltage,
//!     channel: bench.meter_channel,
//! };
//! let mut sequencer = Sequencer::new(ProcessExecutor::with(bench.commands.clone()), handles, config);
//!
//! sequencer.power_up().await?;
//! let report = sequencer.run(&plan, RunRecorder::start("headlight", plan.levels())).await;
//! sequencer.power_down().await;
//!
//! print!("{}", report.render());
//! # Ok(())
//! # }
//! ```

pub mod units;
pub mod cmd;
pub mod error;
pub mod executor;
pub mod devices;
pub mod plan;
pub mod verify;
pub mod report;
pub mod config;
pub mod sequencer;

pub use units::{ Ohm, Volt };
pub use cmd::{ Action, ActionKind, CommandSet, CommandTemplate, Role };
pub use error::{ ConfigError, DeviceError, DiscoveryError, PersistenceError, SetupError };
pub use executor::{ Executor, ProcessExecutor, Response, ScriptedExecutor };
pub use devices::{ Bench, ConsolePrompt, DeviceHandle, DeviceHandles, FallbackResolver, ReadingSource };
pub use plan::{ LevelSelection, PlanLoader, TestPlan, TestPoint, Variant };
pub use verify::{ verify, Verdict, Verification };
pub use report::{ FailureStage, Outcome, RunRecorder, RunReport, Summary };
pub use config::{ BenchConfig, Profile, Timing };
pub use sequencer::{ AbortFlag, Sequencer, SequencerConfig };
