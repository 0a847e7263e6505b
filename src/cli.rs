use std::path::PathBuf;
use clap::{ ArgAction, Args, Parser, Subcommand };
use binseq::{ Profile, Volt };

#[derive(Parser, Debug)]
#[command(name = "binseq", version, about = "BIN-level validation sequencer")]
pub struct Cli
{
    #[arg(long, global = true, help = "Output machine-readable JSON")]
    pub json: bool,
    #[arg(short, long, global = true, action = ArgAction::Count, help = "More log output (-v debug, -vv trace)")]
    pub verbose: u8,
    #[arg(long, global = true, help = "Bench configuration file (JSON)")]
    pub bench: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands
{
    /// Run the test plan against the bench
    Run(RunArgs),
    /// Show the test points a plan file expands to
    Plan(PlanArgs),
    /// Look for the power supply and print its address
    Discover,
}

#[derive(Args, Debug, Clone)]
pub struct PlanArgs
{
    #[arg(long, help = "Test plan file (default depends on --profile)")]
    pub config: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = Profile::Headlight)]
    pub profile: Profile,
    #[arg(long, help = "Scale expected values and tolerances (default depends on --profile)")]
    pub channel_multiplier: Option<u32>,
    #[arg(long, default_value_t = false, help = "Only test the nominal value of each level")]
    pub nominal_only: bool,
    #[arg(long, help = "Comma separated levels to run, e.g. 1,3 or BIN_LEVEL_2 (default: all)")]
    pub levels: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs
{
    #[command(flatten)]
    pub plan: PlanArgs,
    #[arg(long, help = "Serial port of the programmable resistor")]
    pub resistor_port: Option<String>,
    #[arg(long, help = "Power supply address (discovered when omitted)")]
    pub power: Option<String>,
    #[arg(long, help = "Meter identifier")]
    pub meter: Option<String>,
    #[arg(long, help = "Supply voltage, e.g. 13.5")]
    pub voltage: Option<Volt>,
    #[arg(long, help = "Meter channel carrying the DUT current")]
    pub channel: Option<u8>,
    #[arg(long, default_value_t = false, help = "Ask for the reading when the meter fails")]
    pub manual_fallback: bool,
    #[arg(long, help = "Directory for the run report")]
    pub out_dir: Option<PathBuf>,
}
