//! The per-point test sequence
//!
//! Every test point is driven through the same fixed protocol, one point at a time:
//!
//! ```text
//! Idle -> StimulusSet -> PowerCycled -> Settled -> Measured -> Verified -> Done
//!   \          \              \            \
//!    `----------`--------------`------------`--> ErrorTerminal(stage)
//! ```
//!
//! An instrument error ends the point in `ErrorTerminal`, naming the stage that failed, and the run
//! moves on to the next point. Nothing is retried: a point whose stimulus could not be applied is
//! lost rather than measured against a stale fixture configuration.
//!
//! The operator may ask for an abort at any time. It is honoured only between points, so the
//! fixture is never left halfway through a power cycle.

use std::sync::{
    atomic::{ AtomicBool, Ordering },
    Arc,
};
use tracing::Instrument;
use crate::{
    config::Timing,
    devices::{ Bench, DeviceHandles, FallbackResolver, Measurement },
    error::{ DeviceError, SetupError },
    executor::Executor,
    plan::{ TestPlan, TestPoint },
    report::{ FailureStage, Outcome, RunRecorder, RunReport },
    units::Volt,
    verify::verify,
};

/// Everything the sequence needs besides the instruments themselves
#[derive(Debug, Clone, PartialEq)]
pub struct SequencerConfig
{
    pub timing: Timing,
    /// Supply voltage applied at every power-up
    pub voltage: Volt,
    /// Meter channel carrying the DUT current
    pub channel: u8,
}

/// Operator abort request, shared between the signal handler and the sequencer
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag
{
    pub fn trigger(&self)
    {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool
    {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
enum PointState
{
    Idle,
    StimulusSet,
    PowerCycled,
    Settled,
    Measured(Measurement),
    Verified(Outcome),
    Done(Outcome),
    ErrorTerminal(FailureStage, DeviceError),
}

pub struct Sequencer<E>
{
    bench: Bench<E>,
    config: SequencerConfig,
    abort: AbortFlag,
}

impl <E> Sequencer<E>
    where E: Executor
{
    pub fn new(executor: E, handles: DeviceHandles, config: SequencerConfig) -> Self
    {
        Self {
            bench: Bench::with(executor, handles, config.timing.clone()),
            config: config,
            abort: AbortFlag::default(),
        }
    }

    /// Lets `resolver` supply readings the meter could not
    pub fn with_fallback(mut self, resolver: Box<dyn FallbackResolver>) -> Self
    {
        self.bench = self.bench.fallback(resolver);
        self
    }

    /// A handle that requests an abort at the next point boundary
    pub fn abort_handle(&self) -> AbortFlag
    {
        self.abort.clone()
    }

    pub fn bench(&self) -> &Bench<E>
    {
        &self.bench
    }

    /// Switches the supply on at the run voltage
    ///
    /// A bench that cannot be powered is not fit to run. Nothing is sequenced if this fails.
    pub async fn power_up(&mut self) -> Result<(), SetupError>
    {
        tracing::info!(volts = %self.config.voltage.display(), "powering up bench");
        self.bench.power().on(self.config.voltage).await.map_err(SetupError::PowerUp)
    }

    /// Switches the supply off. A failure is only logged
    pub async fn power_down(&mut self)
    {
        match self.bench.power().off().await {
            Ok(()) => tracing::info!("bench powered down"),
            Err(err) => tracing::warn!(error = %err, "failed to power down bench"),
        }
    }

    /// Runs every point of `plan` in order and finalizes the report
    ///
    /// Device errors never stop the run; each affected point is recorded with an `Error`
    /// verdict. An abort stops the run before the next point and marks the report aborted.
    pub async fn run(&mut self, plan: &TestPlan, recorder: RunRecorder) -> RunReport
    {
        let mut recorder = recorder;
        let mut aborted = false;

        for point in plan {
            if self.abort.is_set() {
                tracing::warn!(remaining = plan.len().saturating_sub(recorder.len()), "run aborted by operator");
                aborted = true;
                break;
            }

            let outcome = self.run_point(point).await;
            recorder.record(point.clone(), outcome);
        }

        recorder.finalize(aborted)
    }

    /// Drives a single point through the sequence
    pub async fn run_point(&mut self, point: &TestPoint) -> Outcome
    {
        let span = tracing::info_span!(
            "point",
            level = point.level,
            variant = %point.variant,
            stimulus = %point.stimulus.display(),
        );

        self.drive(point).instrument(span).await
    }

    async fn drive(&mut self, point: &TestPoint) -> Outcome
    {
        let mut state = PointState::Idle;

        loop {
            state = match state {
                PointState::Idle => match self.bench.resistor().set(point.stimulus).await {
                    Ok(()) => PointState::StimulusSet,
                    Err(err) => PointState::ErrorTerminal(FailureStage::StimulusConfig, err),
                },
                PointState::StimulusSet => match self.bench.power().cycle(self.config.voltage).await {
                    Ok(()) => PointState::PowerCycled,
                    Err(err) => PointState::ErrorTerminal(FailureStage::PowerCycle, err),
                },
                PointState::PowerCycled => {
                    tokio::time::sleep(self.config.timing.settle()).await;
                    PointState::Settled
                },
                PointState::Settled => match self.bench.meter().measure(point, self.config.channel).await {
                    Ok(measurement) => PointState::Measured(measurement),
                    Err(err) => PointState::ErrorTerminal(FailureStage::Measurement, err),
                },
                PointState::Measured(measurement) => {
                    let verification = verify(measurement.value, point.expected, point.tolerance);
                    PointState::Verified(Outcome::verified(measurement.value, verification, measurement.source))
                },
                PointState::Verified(outcome) => {
                    tracing::info!(
                        measured = outcome.measured,
                        expected = point.expected,
                        error_percent = outcome.error_percent,
                        verdict = %outcome.verdict,
                        "point done",
                    );
                    PointState::Done(outcome)
                },
                PointState::Done(outcome) => return outcome,
                PointState::ErrorTerminal(stage, err) => {
                    tracing::warn!(error = %err, "{}", stage);
                    return Outcome::error(stage, err.to_string());
                },
            };

            tracing::debug!(state = ?state, "transition");
        }
    }
}

#[cfg(test)]
mod tests
{
    use std::time::Duration;
    use super::{ AbortFlag, Sequencer, SequencerConfig };
    use crate::{
        cmd::{ Action, ActionKind, Role },
        config::Timing,
        devices::{ DeviceHandle, DeviceHandles, FallbackResolver, ReadingSource },
        error::{ DeviceError, SetupError },
        executor::{ calls_for, ScriptedExecutor },
        plan::{ PlanLoader, TestPlan, TestPoint },
        report::{ FailureStage, Outcome, RunRecorder },
        units::Volt,
        verify::Verdict,
    };

    const PLAN: &str = "100:95:105;200\n220:210:231;150\n";

    fn plan(text: &str) -> TestPlan
    {
        PlanLoader::new().parse(text).plan
    }

    fn handles() -> DeviceHandles
    {
        DeviceHandles {
            resistor: DeviceHandle::new(Role::ResistanceSetter, "/dev/ttyUSB0"),
            power: DeviceHandle::new(Role::PowerController, "USB0::0x2EC7::INSTR"),
            meter: DeviceHandle::new(Role::Meter, "scope"),
        }
    }

    fn config() -> SequencerConfig
    {
        SequencerConfig {
            timing: Timing::default(),
            voltage: Volt::from_millis(13_500),
            channel: 4,
        }
    }

    fn bench() -> ScriptedExecutor
    {
        ScriptedExecutor::new()
            .reading(100, 200.0)
            .reading(95, 196.0)
            .reading(105, 204.0)
            .reading(220, 150.0)
            .reading(210, 140.0)
            .reading(231, 157.0)
    }

    #[tokio::test(start_paused = true)]
    async fn meter_failure_loses_only_its_point()
    {
        let plan = plan(PLAN);
        let mut sequencer = Sequencer::new(bench().fail(ActionKind::ReadMean, 3), handles(), config());

        let report = sequencer.run(&plan, RunRecorder::start("headlight", plan.levels())).await;

        assert_eq!(report.entries.len(), 6);
        assert_eq!(sequencer.bench().executor().count(ActionKind::ReadMean), 6);

        let third = &report.entries[2].outcome;
        assert_eq!(third.verdict, Verdict::Error);
        assert_eq!(third.failure, Some(FailureStage::Measurement));
        assert_eq!(third.measured, None);

        let verdicts: Vec<_> = report.entries.iter().map(|entry| entry.outcome.verdict).collect();
        assert_eq!(verdicts, vec![
            Verdict::Pass, Verdict::Pass, Verdict::Error,
            Verdict::Pass, Verdict::Fail, Verdict::Pass,
        ]);
        assert_eq!(report.summary.passed, 4);
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.summary.errors, 1);
        assert_eq!(report.summary.total, 6);
        assert!(!report.aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn commands_never_overlap()
    {
        let plan = plan(PLAN);
        let timing = Timing::default();
        let mut sequencer = Sequencer::new(bench(), handles(), config());

        sequencer.run(&plan, RunRecorder::start("headlight", plan.levels())).await;

        let calls = sequencer.bench().executor().calls();
        assert_eq!(calls.len(), 6 * 4);
        for pair in calls.windows(2) {
            assert!(pair[1].started >= pair[0].finished, "{} overlaps {}", pair[1].action, pair[0].action);
        }

        for point in calls.chunks(4) {
            let kinds: Vec<_> = point.iter().map(|call| call.action.kind()).collect();
            assert_eq!(kinds, vec![ActionKind::SetResistance, ActionKind::PowerOff, ActionKind::PowerOn, ActionKind::ReadMean]);
            assert_eq!(point[2].started - point[1].finished, timing.off_hold());
            assert_eq!(point[3].started - point[2].finished, timing.on_hold() + timing.settle());
        }

        let stimuli: Vec<_> = calls_for(calls, Role::ResistanceSetter)
            .iter()
            .map(|call| call.action.to_string())
            .collect();
        assert_eq!(stimuli, vec!["set 100Ω", "set 95Ω", "set 105Ω", "set 220Ω", "set 210Ω", "set 231Ω"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stimulus_failure_skips_power_and_meter()
    {
        let plan = plan("100:95:105;200\n");
        let mut sequencer = Sequencer::new(bench().fail(ActionKind::SetResistance, 1), handles(), config());

        let outcome = sequencer.run_point(&plan.points()[0]).await;

        assert_eq!(outcome.verdict, Verdict::Error);
        assert_eq!(outcome.failure, Some(FailureStage::StimulusConfig));
        assert_eq!(sequencer.bench().executor().count(ActionKind::PowerOff), 0);
        assert_eq!(sequencer.bench().executor().count(ActionKind::ReadMean), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn power_cycle_failure_skips_meter()
    {
        let plan = plan("100:95:105;200\n");
        let mut sequencer = Sequencer::new(bench().fail(ActionKind::PowerOn, 2), handles(), config());

        let report = sequencer.run(&plan, RunRecorder::start("headlight", plan.levels())).await;

        assert_eq!(report.entries[1].outcome.failure, Some(FailureStage::PowerCycle));
        assert_eq!(report.entries[2].outcome.verdict, Verdict::Pass);
        assert_eq!(sequencer.bench().executor().count(ActionKind::ReadMean), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn meter_timeout_is_a_measurement_error()
    {
        let point = TestPoint::new(1, crate::plan::Variant::Nominal, crate::units::Ohm::from_whole(100), 200.0, 10.0);
        let mut sequencer = Sequencer::new(bench().stall(ActionKind::ReadMean, 1), handles(), config());

        let outcome = sequencer.run_point(&point).await;

        assert_eq!(outcome.failure, Some(FailureStage::Measurement));
        assert!(outcome.detail.unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_reading_is_measured_not_missing()
    {
        let plan = plan("100:95:105;200\n");
        let mut sequencer = Sequencer::new(ScriptedExecutor::new(), handles(), config());

        let outcome = sequencer.run_point(&plan.points()[0]).await;

        assert_eq!(outcome.measured, Some(0.0));
        assert_eq!(outcome.verdict, Verdict::Fail);
        assert_eq!(outcome.failure, None);
    }

    struct Operator(f64);

    impl FallbackResolver for Operator
    {
        fn resolve(&mut self, _point: &TestPoint, _cause: &DeviceError) -> Option<f64>
        {
            Some(self.0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_reading_is_verified()
    {
        let plan = plan("100:95:105;200\n");
        let mut sequencer = Sequencer::new(bench().fail(ActionKind::ReadMean, 1), handles(), config())
            .with_fallback(Box::new(Operator(205.0)));

        let outcome = sequencer.run_point(&plan.points()[0]).await;

        assert_eq!(outcome.verdict, Verdict::Pass);
        assert_eq!(outcome.measured, Some(205.0));
        assert_eq!(outcome.source, Some(ReadingSource::Operator));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_before_run_attempts_nothing()
    {
        let plan = plan(PLAN);
        let mut sequencer = Sequencer::new(bench(), handles(), config());
        sequencer.abort_handle().trigger();

        let report = sequencer.run(&plan, RunRecorder::start("headlight", plan.levels())).await;

        assert!(report.aborted);
        assert!(report.entries.is_empty());
        assert!(sequencer.bench().executor().calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn abort_waits_for_point_boundary()
    {
        let plan = plan(PLAN);
        let mut sequencer = Sequencer::new(bench(), handles(), config());
        let abort: AbortFlag = sequencer.abort_handle();

        // lands during the first point's power cycle
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1_000)).await;
            abort.trigger();
        });

        let report = sequencer.run(&plan, RunRecorder::start("headlight", plan.levels())).await;

        assert!(report.aborted);
        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.entries[0].outcome.verdict, Verdict::Pass);
        assert_eq!(sequencer.bench().executor().count(ActionKind::ReadMean), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_with_prefilled_recorder()
    {
        let plan = plan("100:95:105;200\n");
        let mut recorder = RunRecorder::start("headlight", plan.levels());
        for point in plan.iter().chain(plan.iter()) {
            recorder.record(point.clone(), Outcome::error(FailureStage::Measurement, String::from("earlier run")));
        }

        let mut sequencer = Sequencer::new(bench(), handles(), config());
        sequencer.abort_handle().trigger();
        let report = sequencer.run(&plan, recorder).await;

        assert!(report.aborted);
        assert_eq!(report.entries.len(), 6);
        assert!(sequencer.bench().executor().calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn power_up_and_down()
    {
        let mut sequencer = Sequencer::new(bench(), handles(), config());

        sequencer.power_up().await.unwrap();
        sequencer.power_down().await;

        let actions: Vec<_> = sequencer.bench().executor().calls().iter().map(|call| call.action.clone()).collect();
        assert_eq!(actions, vec![Action::PowerOn(Volt::from_millis(13_500)), Action::PowerOff]);
    }

    #[tokio::test(start_paused = true)]
    async fn power_up_failure_is_a_setup_error()
    {
        let mut sequencer = Sequencer::new(bench().fail(ActionKind::PowerOn, 1), handles(), config());
        assert!(matches!(sequencer.power_up().await, Err(SetupError::PowerUp(_))));

        let mut sequencer = Sequencer::new(bench().fail(ActionKind::PowerOff, 1), handles(), config());
        sequencer.power_down().await;
        assert_eq!(sequencer.bench().executor().count(ActionKind::PowerOff), 1);
    }
}
