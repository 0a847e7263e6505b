
use binseq::{
    ActionKind, CommandSet, CommandTemplate, DeviceHandle, DeviceHandles, FailureStage, PlanLoader,
    ProcessExecutor, Role, RunRecorder, ScriptedExecutor, Sequencer, SequencerConfig, Timing, Verdict, Volt,
};

const PLAN: &'static str = "\
# nominal:min:max;expected
100:95:105;200
garbage line
220:210:231;150
";

fn handles(resistor: &str) -> DeviceHandles
{
    DeviceHandles {
        resistor: DeviceHandle::new(Role::ResistanceSetter, resistor),
        power: DeviceHandle::new(Role::PowerController, "USB0::0x2EC7::0x6800::INSTR"),
        meter: DeviceHandle::new(Role::Meter, "scope"),
    }
}

fn config(timing: Timing) -> SequencerConfig
{
    SequencerConfig {
        timing: timing,
        voltage: Volt::from_millis(13_500),
        channel: 4,
    }
}

#[tokio::test(start_paused = true)]
async fn scripted_run_reports_every_point()
{
    let dir = tempfile::tempdir().unwrap();
    let plan_path = dir.path().join("bin_res.txt");
    std::fs::write(&plan_path, PLAN).unwrap();

    let parsed = PlanLoader::new().load(&plan_path).unwrap();
    assert_eq!(parsed.skipped.len(), 1);
    assert_eq!(parsed.plan.levels(), vec![1, 2]);

    let executor = ScriptedExecutor::new()
        .default_reading(200.0)
        .reading(220, 151.0)
        .reading(210, 149.0)
        .reading(231, 150.5)
        .fail(ActionKind::ReadMean, 3);

    let mut sequencer = Sequencer::new(executor, handles("/dev/ttyUSB0"), config(Timing::default()));
    sequencer.power_up().await.unwrap();
    let report = sequencer.run(&parsed.plan, RunRecorder::start("headlight", parsed.plan.levels())).await;
    sequencer.power_down().await;

    assert_eq!(report.summary.total, 6);
    assert_eq!(report.summary.passed, 5);
    assert_eq!(report.summary.errors, 1);
    assert_eq!(report.entries[2].outcome.failure, Some(FailureStage::Measurement));

    let out = dir.path().join("reports");
    let path = report.persist(&out).unwrap();
    let csv = std::fs::read_to_string(&path).unwrap();

    assert!(csv.contains("# Passed: 5/6"));
    assert!(csv.contains("BIN_LEVEL_1,max,105,200,-,ERROR,-"));
    assert!(csv.contains("Total,,,,5/6,83.3%,"));
}

fn shell(script: &str) -> CommandTemplate
{
    CommandTemplate::new("sh", &["-c", script])
}

#[tokio::test]
async fn process_run_uses_stimulus_from_resistor()
{
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("ohms");
    let state = state.to_str().unwrap();

    // the stand-in meter reads back whatever the stand-in resistor was last set to
    let commands = CommandSet {
        set_resistance: shell(&format!("echo {{ohms}} > {}", state)),
        power_off: shell("true"),
        power_on: shell("test {volts} = 13.5"),
        list_supplies: shell("true"),
        read_mean: shell(&format!("cat {}", state)),
    };

    let plan = PlanLoader::new().parse("200:190:210;200\n100:95:105;200\n").plan;
    let timing = Timing::default().without_waits();
    let mut sequencer = Sequencer::new(ProcessExecutor::with(commands), handles("res"), config(timing));

    sequencer.power_up().await.unwrap();
    let report = sequencer.run(&plan, RunRecorder::start("headlight", plan.levels())).await;

    let measured: Vec<_> = report.entries.iter().map(|entry| entry.outcome.measured).collect();
    assert_eq!(measured, vec![Some(200.0), Some(190.0), Some(210.0), Some(100.0), Some(95.0), Some(105.0)]);
    assert_eq!(report.summary.passed, 3);
    assert_eq!(report.summary.failed, 3);
    assert!(report.entries.iter().take(3).all(|entry| entry.outcome.verdict == Verdict::Pass));
}

#[tokio::test]
async fn process_run_turns_rejections_into_errors()
{
    let commands = CommandSet {
        set_resistance: shell("test {ohms} -lt 200"),
        power_off: shell("true"),
        power_on: shell("true"),
        list_supplies: shell("true"),
        read_mean: shell("echo 200"),
    };

    let plan = PlanLoader::new().nominal_only(true).parse("100:95:105;200\n300:290:310;200\n").plan;
    let timing = Timing::default().without_waits();
    let mut sequencer = Sequencer::new(ProcessExecutor::with(commands), handles("res"), config(timing));

    let report = sequencer.run(&plan, RunRecorder::start("headlight", plan.levels())).await;

    assert_eq!(report.entries.len(), 2);
    assert_eq!(report.entries[0].outcome.verdict, Verdict::Pass);
    assert_eq!(report.entries[1].outcome.failure, Some(FailureStage::StimulusConfig));
    assert_eq!(report.summary.passed, 1);
    assert_eq!(report.summary.total, 2);
}
