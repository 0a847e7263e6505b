use std::{ io::IsTerminal, process::ExitCode };
use anyhow::Context;
use clap::Parser;
use serde_json::json;
use tracing_subscriber::EnvFilter;
use binseq::{
    devices::discover_supply,
    plan::{ FormatError, LevelSelection, PlanLoader, TestPlan },
    AbortFlag, BenchConfig, ConsolePrompt, DeviceHandle, DeviceHandles, ProcessExecutor, Role, RunRecorder,
    Sequencer, SequencerConfig,
};

mod cli;

use cli::{ Cli, Commands, PlanArgs, RunArgs };

/// Exit status when the run could not start
const SETUP_FAILURE: u8 = 2;

fn main() -> ExitCode
{
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build();

    let result = match runtime {
        Ok(runtime) => runtime.block_on(dispatch(cli)),
        Err(err) => Err(anyhow::Error::new(err).context("failed to start async runtime")),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::from(SETUP_FAILURE)
        },
    }
}

fn init_tracing(verbose: u8)
{
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false)
        .init();
}

/// Exit status after a second interrupt
const INTERRUPTED: i32 = 130;

/// Watches for Ctrl-C on a thread of its own, so that an operator prompt blocking the sequence
/// cannot hold it up
///
/// The first interrupt requests an abort at the next point boundary. The second one exits at once,
/// leaving the bench as it is.
fn watch_interrupts(abort: AbortFlag) -> std::io::Result<()>
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    std::thread::Builder::new()
        .name(String::from("interrupts"))
        .spawn(move || {
            runtime.block_on(async move {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                tracing::warn!("abort requested, stopping after the current point (Ctrl-C again to quit now)");
                abort.trigger();

                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::error!("interrupted again, exiting without powering down the bench");
                    std::process::exit(INTERRUPTED);
                }
            });
        })?;

    Ok(())
}

async fn dispatch(cli: Cli) -> anyhow::Result<()>
{
    let bench = BenchConfig::load_or_default(cli.bench.as_deref())?;

    match cli.command {
        Commands::Plan(args) => show_plan(&bench, &args, cli.json),
        Commands::Discover => discover(&bench, cli.json).await,
        Commands::Run(args) => run(&bench, &args, cli.json).await,
    }
}

struct LoadedPlan
{
    plan: TestPlan,
    levels: Vec<u32>,
    skipped: Vec<FormatError>,
}

fn load_plan(bench: &BenchConfig, args: &PlanArgs) -> anyhow::Result<LoadedPlan>
{
    let path = args.config.clone().unwrap_or_else(|| args.profile.default_plan());
    let multiplier = args.channel_multiplier.unwrap_or(args.profile.channel_multiplier());

    let parsed = PlanLoader::new()
        .channel_multiplier(multiplier)
        .tolerance(bench.tolerance)
        .nominal_only(args.nominal_only)
        .load(&path)?;

    let selection = args.levels
        .as_deref()
        .map(LevelSelection::parse)
        .unwrap_or_else(LevelSelection::all)
        .resolve(&parsed.plan);

    for entry in selection.ignored.iter() {
        tracing::warn!("ignoring unknown level '{}'", entry);
    }

    Ok(LoadedPlan {
        plan: parsed.plan.select(&selection.levels),
        levels: selection.levels,
        skipped: parsed.skipped,
    })
}

fn show_plan(bench: &BenchConfig, args: &PlanArgs, as_json: bool) -> anyhow::Result<()>
{
    let loaded = load_plan(bench, args)?;

    if as_json {
        let skipped: Vec<String> = loaded.skipped.iter().map(ToString::to_string).collect();
        let value = json!({
            "profile": args.profile.label(),
            "levels": loaded.levels,
            "points": loaded.plan.points(),
            "skipped": skipped,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("{:<14} {:<8} {:>10} {:>12} {:>10}", "Level", "Variant", "Stimulus", "Expected", "Tolerance");
    for point in loaded.plan.iter() {
        println!(
            "{:<14} {:<8} {:>10} {:>12.1} {:>10.1}",
            point.level_name(),
            point.variant,
            format!("{}", point.stimulus.display()),
            point.expected,
            point.tolerance,
        );
    }
    for err in loaded.skipped.iter() {
        println!("skipped: {}", err);
    }

    Ok(())
}

async fn discover(bench: &BenchConfig, as_json: bool) -> anyhow::Result<()>
{
    let mut executor = ProcessExecutor::with(bench.commands.clone());
    let handle = discover_supply(&mut executor, &bench.supply_patterns, bench.timing.command_timeout()).await?;

    if as_json {
        println!("{}", json!({ "power": handle.id() }));
    }
    else {
        println!("{}", handle.id());
    }

    Ok(())
}

async fn resolve_handles(executor: &mut ProcessExecutor, bench: &BenchConfig, args: &RunArgs) -> anyhow::Result<DeviceHandles>
{
    let resistor = DeviceHandle::resolve(
        Role::ResistanceSetter,
        args.resistor_port.as_deref().unwrap_or(&bench.resistor_port),
    )?;

    let power = match args.power.as_deref() {
        Some(id) => DeviceHandle::resolve(Role::PowerController, id)?,
        None => discover_supply(executor, &bench.supply_patterns, bench.timing.command_timeout()).await?,
    };

    let meter = DeviceHandle::resolve(Role::Meter, args.meter.as_deref().unwrap_or(&bench.meter_id))?;

    tracing::info!(resistor = %resistor.id(), power = %power.id(), meter = %meter.id(), "devices resolved");

    Ok(DeviceHandles {
        resistor: resistor,
        power: power,
        meter: meter,
    })
}

async fn run(bench: &BenchConfig, args: &RunArgs, as_json: bool) -> anyhow::Result<()>
{
    let loaded = load_plan(bench, &args.plan)?;

    let mut executor = ProcessExecutor::with(bench.commands.clone());
    let handles = resolve_handles(&mut executor, bench, args).await?;

    let config = SequencerConfig {
        timing: bench.timing.clone(),
        voltage: args.voltage.unwrap_or(bench.voltage),
        channel: args.channel.unwrap_or(bench.meter_channel),
    };

    let mut sequencer = Sequencer::new(executor, handles, config);
    if args.manual_fallback {
        sequencer = sequencer.with_fallback(Box::new(ConsolePrompt::stdio()));
    }

    watch_interrupts(sequencer.abort_handle()).context("failed to install interrupt handler")?;

    sequencer.power_up().await?;

    tracing::info!(points = loaded.plan.len(), levels = ?loaded.levels, "starting run");
    let recorder = RunRecorder::start(args.plan.profile.label(), loaded.levels.clone());
    let report = sequencer.run(&loaded.plan, recorder).await;

    sequencer.power_down().await;

    if as_json {
        println!("{}", report.to_json().context("failed to serialize report")?);
    }
    else {
        print!("{}", report.render());
    }

    let out_dir = args.out_dir.clone().unwrap_or_else(|| bench.report_dir());
    match report.persist(&out_dir) {
        Ok(path) => tracing::info!(path = %path.display(), "report saved"),
        Err(err) => tracing::warn!(error = %err, "report not saved"),
    }

    Ok(())
}
