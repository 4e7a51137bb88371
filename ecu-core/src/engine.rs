//! Engine control facade.
//!
//! [`EngineControl`] owns every piece of state shared between the crank
//! interrupt, the Planner, the Executor and the Monitor, and exposes the
//! lifecycle and calibration API. Each task keeps its own stage object
//! ([`Planner`], [`Executor`], [`Monitor`]) and drives it through the
//! matching method here, so the same wiring runs on the target, in the
//! emulator and in the host tests.

use core::fmt;

use crate::calibration::{
    Calibration, CalibrationError, ConfigStore, EoiCalibration, LoadOutcome, LoadReport, load_fuel_maps,
};
use crate::decoder::{DecoderConfig, DecoderConfigError, SyncState, ToothCallback, TriggerDecoder};
use crate::drivers::Driver;
use crate::fuel::{FuelConfig, fuel_enrichment_pct};
use crate::monitor::{Monitor, MonitorInputs, MonitorReport};
use crate::pipeline::{
    Clock, CommandRing, CycleOutcome, ExecContext, Executor, InjectionDiag, MapBank, PerfStats, PerfSummary,
    PipelineOutputs, PlanContext, Planner, RuntimeState,
};
use crate::safety::{LimpState, SafetyConfig, SafetyMonitor, Watchdog};
use crate::scheduler::{Actuators, AngleScheduler, FireReport, SchedulerConfig};
use crate::sensors::{SensorSnapshot, SensorSource, WidebandReading};
use crate::sync::{SeqLock, Shared};
use crate::tables::FuelMaps;
use crate::telemetry::{Millis, TelemetryEventKind, TelemetryPayload, TelemetryRecorder};

/// Initial tooth period the phase predictor starts from.
pub const HP_INITIAL_PERIOD_US: f32 = 10_000.0;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Lifecycle {
    Uninitialized,
    Stopped,
    Running,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EngineError {
    NotInitialized,
    AlreadyInitialized,
    NotRunning,
    /// No command has been applied yet.
    NoData,
    InvalidConfig(DecoderConfigError),
    Calibration(CalibrationError),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::InvalidConfig(err) => write!(f, "invalid decoder config: {err}"),
            EngineError::Calibration(err) => write!(f, "calibration: {err}"),
            other => write!(f, "{other:?}"),
        }
    }
}

impl From<CalibrationError> for EngineError {
    fn from(err: CalibrationError) -> Self {
        EngineError::Calibration(err)
    }
}

impl From<DecoderConfigError> for EngineError {
    fn from(err: DecoderConfigError) -> Self {
        EngineError::InvalidConfig(err)
    }
}

/// Static configuration applied when the engine is built.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct EngineConfig {
    pub decoder: DecoderConfig,
    pub scheduler: SchedulerConfig,
    pub safety: SafetyConfig,
}

impl EngineConfig {
    pub const fn new() -> Self {
        Self {
            decoder: DecoderConfig::new(),
            scheduler: SchedulerConfig::new(),
            safety: SafetyConfig::new(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// What `init` found in the store.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct InitReport {
    pub fuel_maps: LoadOutcome,
    pub calibration: LoadReport,
}

impl InitReport {
    /// `true` when any record had to be migrated or replaced by defaults.
    pub fn repaired(&self) -> bool {
        [
            self.fuel_maps,
            self.calibration.eoi,
            self.calibration.eoit_map,
            self.calibration.closed_loop,
        ]
        .iter()
        .any(|outcome| *outcome != LoadOutcome::Loaded)
    }
}

/// Operator-facing view of the last applied command.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct EngineParameters {
    pub rpm: u16,
    pub load: u16,
    pub advance_x10: u16,
    /// Pulsewidth relative to the reference fuel quantity, in percent.
    pub fuel_enrichment_pct: u16,
    pub limp: bool,
}

pub struct EngineControl<I, G> {
    lifecycle: Shared<Lifecycle>,
    decoder: Shared<TriggerDecoder>,
    actuators: Shared<Actuators<I, G>>,
    bank: Shared<MapBank>,
    safety: Shared<SafetyMonitor>,
    watchdog: Shared<Watchdog>,
    ring: Shared<CommandRing>,
    perf: Shared<PerfStats>,
    telemetry: Shared<TelemetryRecorder<Millis>>,
    outputs: PipelineOutputs,
    sensors: SeqLock<SensorSnapshot>,
    wideband: SeqLock<Option<WidebandReading>>,
    fuel: FuelConfig,
}

impl<I: Driver, G: Driver> EngineControl<I, G> {
    pub fn new(injection: I, ignition: G) -> Self {
        let config = EngineConfig::new();
        Self::build(config, TriggerDecoder::new(), injection, ignition)
    }

    pub fn with_config(config: EngineConfig, injection: I, ignition: G) -> Result<Self, EngineError> {
        let decoder = TriggerDecoder::with_config(config.decoder)?;
        Ok(Self::build(config, decoder, injection, ignition))
    }

    fn build(config: EngineConfig, decoder: TriggerDecoder, injection: I, ignition: G) -> Self {
        let scheduler = AngleScheduler::with_config(config.scheduler);
        Self {
            lifecycle: Shared::new(Lifecycle::Uninitialized),
            decoder: Shared::new(decoder),
            actuators: Shared::new(Actuators::with_scheduler(scheduler, injection, ignition)),
            bank: Shared::new(MapBank::default()),
            safety: Shared::new(SafetyMonitor::new(config.safety)),
            watchdog: Shared::new(Watchdog::new(config.safety.watchdog_timeout_ms)),
            ring: Shared::new(CommandRing::new()),
            perf: Shared::new(PerfStats::default()),
            telemetry: Shared::new(TelemetryRecorder::new()),
            outputs: PipelineOutputs::new(),
            sensors: SeqLock::new(SensorSnapshot::EMPTY),
            wideband: SeqLock::new(None),
            fuel: FuelConfig::new(),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.lock(|lifecycle| *lifecycle)
    }

    fn ensure_initialized(&self) -> Result<Lifecycle, EngineError> {
        match self.lifecycle() {
            Lifecycle::Uninitialized => Err(EngineError::NotInitialized),
            other => Ok(other),
        }
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        match self.ensure_initialized()? {
            Lifecycle::Running => Ok(()),
            _ => Err(EngineError::NotRunning),
        }
    }

    /// Loads persisted maps and calibration, repairing the store where a
    /// record is missing, corrupt or from an older layout.
    pub fn init<S: ConfigStore + ?Sized>(&self, store: &mut S, now_ms: u64) -> Result<InitReport, EngineError> {
        if self.lifecycle() != Lifecycle::Uninitialized {
            return Err(EngineError::AlreadyInitialized);
        }

        let (maps, fuel_maps) = load_fuel_maps(store);
        let (calibration, calibration_report) = Calibration::load(store);
        let report = InitReport {
            fuel_maps,
            calibration: calibration_report,
        };

        self.bank.lock(|bank| *bank = MapBank::new(maps, calibration));
        self.decoder.lock(TriggerDecoder::reset);
        self.ring.lock(|ring| *ring = CommandRing::new());
        self.actuators.lock(|actuators| {
            actuators.scheduler.cancel_all();
            actuators.hp.init(HP_INITIAL_PERIOD_US);
        });
        if report.repaired() {
            self.telemetry.lock(|telemetry| {
                telemetry.record(
                    TelemetryEventKind::CalibrationRepaired,
                    TelemetryPayload::None,
                    Millis(now_ms),
                )
            });
        }

        self.lifecycle.lock(|lifecycle| *lifecycle = Lifecycle::Stopped);
        Ok(report)
    }

    /// Starts edge processing and arms the watchdog.
    pub fn start(&self, now_ms: u64) -> Result<(), EngineError> {
        if self.ensure_initialized()? == Lifecycle::Running {
            return Ok(());
        }
        self.decoder.lock(TriggerDecoder::start);
        self.watchdog.lock(|watchdog| watchdog.enable(now_ms));
        self.lifecycle.lock(|lifecycle| *lifecycle = Lifecycle::Running);
        Ok(())
    }

    /// Stops edge processing and releases every output.
    pub fn stop(&self) -> Result<(), EngineError> {
        self.ensure_initialized()?;
        self.decoder.lock(TriggerDecoder::stop);
        self.actuators.lock(Actuators::shutdown);
        self.watchdog.lock(Watchdog::disable);
        self.lifecycle.lock(|lifecycle| *lifecycle = Lifecycle::Stopped);
        Ok(())
    }

    pub fn deinit(&self) -> Result<(), EngineError> {
        self.stop()?;
        self.decoder.lock(TriggerDecoder::unregister_tooth_callback);
        self.lifecycle.lock(|lifecycle| *lifecycle = Lifecycle::Uninitialized);
        Ok(())
    }

    /// Installs the hook that wakes the Planner after every tooth.
    pub fn register_tooth_callback(&self, callback: ToothCallback) {
        self.decoder.lock(|decoder| decoder.register_tooth_callback(callback));
    }

    /// Crank edge interrupt: decodes the edge, then fires due events.
    pub fn on_crank_edge(&self, capture_us: u32) -> FireReport {
        let sync = self.decoder.lock(|decoder| {
            decoder.on_tooth(capture_us);
            decoder.is_running().then(|| decoder.state())
        });
        match sync {
            Some(sync) => self.actuators.lock(|actuators| actuators.on_sync(&sync)),
            None => FireReport::default(),
        }
    }

    pub fn on_cam_edge(&self, capture_us: u32) {
        self.decoder.lock(|decoder| decoder.on_cam_edge(capture_us));
    }

    pub fn sync_data(&self, now_us: u32) -> SyncState {
        self.decoder.lock(|decoder| decoder.get_data(now_us))
    }

    /// Publishes a snapshot for the Planner, flagging an implausible
    /// manifold pressure first.
    pub fn publish_sensors(&self, snapshot: SensorSnapshot) {
        self.sensors.publish(snapshot.validated());
    }

    pub fn publish_wideband(&self, reading: Option<WidebandReading>) {
        self.wideband.publish(reading);
    }

    /// One Planner wake-up. Returns `true` when a command was queued.
    pub fn plan<C: Clock + ?Sized>(&self, planner: &mut Planner, clock: &C) -> Result<bool, EngineError> {
        self.ensure_running()?;
        let sync = self.sync_data(clock.now_us());
        let ctx = PlanContext {
            sensors: &self.sensors,
            wideband: &self.wideband,
            bank: &self.bank,
            safety: &self.safety,
            telemetry: &self.telemetry,
        };
        Ok(planner.run_cycle(&sync, &ctx, &self.ring, &self.perf, clock))
    }

    /// One Executor wake-up against the live decoder state.
    pub fn execute<C: Clock + ?Sized>(&self, executor: &mut Executor, clock: &C) -> Result<CycleOutcome, EngineError> {
        self.ensure_running()?;
        let live = self.sync_data(clock.now_us());
        let ctx = ExecContext {
            actuators: &self.actuators,
            safety: &self.safety,
            watchdog: &self.watchdog,
            outputs: &self.outputs,
            perf: &self.perf,
            telemetry: &self.telemetry,
        };
        Ok(executor.cycle(&self.ring, Some(live), &ctx, clock))
    }

    /// One Monitor tick: persists dirty maps when due, then builds the
    /// snapshots that fell due.
    pub fn monitor<S, C>(&self, monitor: &mut Monitor, store: &mut S, clock: &C) -> Result<MonitorReport, EngineError>
    where
        S: ConfigStore + ?Sized,
        C: Clock + ?Sized,
    {
        self.ensure_initialized()?;
        let now_ms = clock.now_ms();
        // A failed save leaves the bank dirty and is retried on the next tick.
        if let Ok(Some(version)) = monitor.persist_maps(&self.bank, store, now_ms) {
            self.telemetry
                .lock(|telemetry| telemetry.record_maps_persisted(version, Millis(now_ms)));
        }

        let (limp, limp_activations, safety_trips) =
            self.safety
                .lock(|safety| (safety.limp_state(), safety.activations(), safety.trips()));
        let (map_version, map_dirty) = self.bank.lock(|bank| (bank.version(), bank.is_dirty()));
        let inputs = MonitorInputs {
            runtime: self.outputs.runtime_state(),
            sensors: self.sensors.latest(),
            sync: self.sync_data(clock.now_us()),
            limp,
            limp_activations,
            safety_trips,
            perf: self.perf_summary(),
            diag: self.outputs.injection_diag(),
            map_version,
            map_dirty,
            jitter: self.actuators.lock(|actuators| actuators.hp.jitter_stats()),
        };
        Ok(monitor.poll(&inputs, now_ms))
    }

    pub fn engine_parameters(&self) -> Result<EngineParameters, EngineError> {
        self.ensure_initialized()?;
        let runtime = self.outputs.runtime_state().ok_or(EngineError::NoData)?;
        Ok(EngineParameters {
            rpm: runtime.rpm,
            load: runtime.load,
            advance_x10: runtime.advance_x10,
            fuel_enrichment_pct: fuel_enrichment_pct(&self.fuel, runtime.pulsewidth_us),
            limp: self.is_limp_mode(),
        })
    }

    pub fn runtime_state(&self) -> Option<RuntimeState> {
        self.outputs.runtime_state()
    }

    pub fn injection_diag(&self) -> Result<InjectionDiag, EngineError> {
        self.ensure_initialized()?;
        self.outputs.injection_diag().ok_or(EngineError::NoData)
    }

    pub fn perf_summary(&self) -> PerfSummary {
        self.perf.lock(|perf| perf.summary())
    }

    pub fn is_limp_mode(&self) -> bool {
        self.safety.lock(|safety| safety.is_limp_active())
    }

    pub fn limp_state(&self) -> LimpState {
        self.safety.lock(|safety| safety.limp_state())
    }

    /// `false` once the Executor stopped feeding the watchdog for longer
    /// than its timeout.
    pub fn watchdog_alive(&self, now_ms: u64) -> bool {
        self.watchdog.lock(|watchdog| watchdog.check(now_ms))
    }

    pub fn eoi_config(&self) -> Result<(f32, f32), EngineError> {
        self.ensure_initialized()?;
        Ok(self.bank.lock(|bank| bank.calibration().eoi_config()))
    }

    pub fn set_eoi_config<S: ConfigStore + ?Sized>(
        &self,
        store: &mut S,
        eoi_deg: f32,
        fallback_deg: f32,
    ) -> Result<(), EngineError> {
        self.update_calibration(|calibration| calibration.set_eoi_config(store, eoi_deg, fallback_deg))
    }

    pub fn eoit_calibration(&self) -> Result<EoiCalibration, EngineError> {
        self.ensure_initialized()?;
        Ok(self.bank.lock(|bank| bank.calibration().eoit_calibration()))
    }

    pub fn set_eoit_calibration<S: ConfigStore + ?Sized>(
        &self,
        store: &mut S,
        boundary: f32,
        normal: f32,
        fallback_normal: f32,
    ) -> Result<(), EngineError> {
        self.update_calibration(|calibration| {
            calibration.set_eoit_calibration(store, boundary, normal, fallback_normal)
        })
    }

    pub fn eoit_map_enabled(&self) -> Result<bool, EngineError> {
        self.ensure_initialized()?;
        Ok(self.bank.lock(|bank| bank.calibration().eoit_map.enabled))
    }

    pub fn set_eoit_map_enabled<S: ConfigStore + ?Sized>(&self, store: &mut S, enabled: bool) -> Result<(), EngineError> {
        self.update_calibration(|calibration| calibration.set_eoit_map_enabled(store, enabled))
    }

    pub fn eoit_map_cell(&self, rpm_index: usize, load_index: usize) -> Result<f32, EngineError> {
        self.ensure_initialized()?;
        Ok(self
            .bank
            .lock(|bank| bank.calibration().eoit_map_cell(rpm_index, load_index))?)
    }

    pub fn set_eoit_map_cell<S: ConfigStore + ?Sized>(
        &self,
        store: &mut S,
        rpm_index: usize,
        load_index: usize,
        normal: f32,
    ) -> Result<(), EngineError> {
        self.update_calibration(|calibration| calibration.set_eoit_map_cell(store, rpm_index, load_index, normal))
    }

    pub fn closed_loop_enabled(&self) -> Result<bool, EngineError> {
        self.ensure_initialized()?;
        Ok(self.bank.lock(|bank| bank.calibration().closed_loop_enabled))
    }

    pub fn set_closed_loop_enabled<S: ConfigStore + ?Sized>(
        &self,
        store: &mut S,
        enabled: bool,
    ) -> Result<(), EngineError> {
        self.update_calibration(|calibration| calibration.set_closed_loop_enabled(store, enabled))
    }

    /// Copies the calibration out, lets `edit` persist a change, and only
    /// then installs the result. The map lock is never held across the
    /// store write.
    fn update_calibration(
        &self,
        edit: impl FnOnce(&mut Calibration) -> Result<(), CalibrationError>,
    ) -> Result<(), EngineError> {
        self.ensure_initialized()?;
        let mut calibration = self.bank.lock(|bank| bank.calibration());
        edit(&mut calibration)?;
        self.bank.lock(|bank| bank.set_calibration(calibration));
        Ok(())
    }

    /// Visits the retained telemetry, oldest first.
    pub fn with_telemetry<R>(&self, f: impl FnOnce(&TelemetryRecorder<Millis>) -> R) -> R {
        self.telemetry.lock(|telemetry| f(telemetry))
    }

    /// Runs `f` with exclusive access to the actuators, e.g. to service a
    /// compare-match interrupt.
    pub fn with_actuators<R>(&self, f: impl FnOnce(&mut Actuators<I, G>) -> R) -> R {
        self.actuators.lock(f)
    }

    /// Installs new fuel maps, e.g. from a tuning tool; persisted by the
    /// next Monitor tick that finds them due.
    pub fn replace_maps(&self, maps: FuelMaps) -> Result<(), EngineError> {
        self.ensure_initialized()?;
        self.bank.lock(|bank| bank.replace_maps(maps));
        Ok(())
    }

    pub fn map_version(&self) -> u32 {
        self.bank.lock(|bank| bank.version())
    }

    pub fn fuel_maps(&self) -> Result<FuelMaps, EngineError> {
        self.ensure_initialized()?;
        Ok(self.bank.lock(|bank| *bank.maps()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{EOI_CONFIG_KEY, MemoryConfigStore};
    use crate::drivers::{IgnitionDriver, InjectionDriver, SimCompareUnit};
    use crate::pipeline::{ExecPath, ManualClock};
    use crate::sensors::SensorFaults;

    type TestEngine = EngineControl<InjectionDriver<SimCompareUnit>, IgnitionDriver<SimCompareUnit>>;

    fn engine() -> TestEngine {
        EngineControl::new(
            InjectionDriver::new(SimCompareUnit::new()),
            IgnitionDriver::new(SimCompareUnit::new()),
        )
    }

    fn warm_snapshot(timestamp_ms: u64) -> SensorSnapshot {
        SensorSnapshot {
            map_kpa10: 1_000,
            tps_pct10: 200,
            clt_c: 85,
            iat_c: 30,
            o2_mv: 0,
            vbat_dv: 138,
            knock: false,
            faults: SensorFaults::NONE,
            timestamp_ms,
        }
    }

    /// Spins a 60-2 wheel at 1000 rpm with a cam edge before each gap.
    fn crank(engine: &TestEngine, clock: &ManualClock, revolutions: u32) {
        let mut now = clock.now_us();
        engine.on_crank_edge(now);
        for _ in 0..revolutions {
            for _ in 0..57 {
                now += 1_000;
                engine.on_crank_edge(now);
            }
            engine.on_cam_edge(now);
            now += 3_000;
            engine.on_crank_edge(now);
        }
        clock.set_us(u64::from(now));
    }

    #[test]
    fn operations_require_init() {
        let engine = engine();
        let mut store = MemoryConfigStore::new();
        assert_eq!(engine.start(0), Err(EngineError::NotInitialized));
        assert_eq!(engine.stop(), Err(EngineError::NotInitialized));
        assert_eq!(engine.engine_parameters(), Err(EngineError::NotInitialized));
        assert_eq!(
            engine.set_closed_loop_enabled(&mut store, false),
            Err(EngineError::NotInitialized)
        );

        engine.init(&mut store, 0).expect("first init");
        assert_eq!(engine.init(&mut store, 0), Err(EngineError::AlreadyInitialized));
        assert_eq!(engine.lifecycle(), Lifecycle::Stopped);
    }

    #[test]
    fn init_on_empty_store_repairs_and_records_it() {
        let engine = engine();
        let mut store = MemoryConfigStore::new();
        let report = engine.init(&mut store, 5).expect("init");
        assert!(report.repaired());
        assert_eq!(report.fuel_maps, LoadOutcome::Defaulted);
        assert!(store.contains(EOI_CONFIG_KEY));

        let event = engine.with_telemetry(|telemetry| telemetry.latest().map(|record| record.event));
        assert_eq!(event, Some(TelemetryEventKind::CalibrationRepaired));

        let second = self::engine();
        let report = second.init(&mut store, 5).expect("init from saved store");
        assert!(!report.repaired());
    }

    #[test]
    fn calibration_edits_persist_before_taking_effect() {
        let engine = engine();
        let mut store = MemoryConfigStore::new();
        engine.init(&mut store, 0).expect("init");

        engine
            .set_eoit_calibration(&mut store, 7.0, 4.0, 3.0)
            .expect("calibration saved");
        let eoi = engine.eoit_calibration().expect("initialised");
        assert_eq!((eoi.boundary, eoi.normal, eoi.fallback_normal), (7.0, 4.0, 3.0));

        store.set_fail_saves(true);
        assert!(matches!(
            engine.set_closed_loop_enabled(&mut store, false),
            Err(EngineError::Calibration(_))
        ));
        assert_eq!(engine.closed_loop_enabled(), Ok(true));

        store.set_fail_saves(false);
        let reloaded = self::engine();
        reloaded.init(&mut store, 0).expect("reload");
        let eoi = reloaded.eoit_calibration().expect("initialised");
        assert_eq!(eoi.boundary, 7.0);
    }

    #[test]
    fn plan_and_execute_publish_parameters() {
        let engine = engine();
        let mut store = MemoryConfigStore::new();
        let clock = ManualClock::new(0);
        let mut planner = Planner::default();
        let mut executor = Executor::default();

        engine.init(&mut store, 0).expect("init");
        assert_eq!(engine.plan(&mut planner, &clock), Err(EngineError::NotRunning));
        engine.start(0).expect("start");
        assert_eq!(engine.engine_parameters(), Err(EngineError::NoData));

        crank(&engine, &clock, 2);
        engine.publish_sensors(warm_snapshot(clock.now_ms()));

        assert_eq!(engine.plan(&mut planner, &clock), Ok(true));
        assert_eq!(
            engine.execute(&mut executor, &clock),
            Ok(CycleOutcome::Applied(ExecPath::Sequential))
        );

        let params = engine.engine_parameters().expect("parameters published");
        assert_eq!(params.rpm, 1_000);
        assert_eq!(params.load, 1_000);
        assert_eq!(params.advance_x10, 150);
        assert_eq!(params.fuel_enrichment_pct, 100);
        assert!(!params.limp);
        assert!(engine.watchdog_alive(clock.now_ms()));
        assert!(engine.injection_diag().expect("diag published").sync_acquired);
    }

    #[test]
    fn stop_releases_outputs_and_ignores_edges() {
        let engine = engine();
        let mut store = MemoryConfigStore::new();
        let clock = ManualClock::new(0);
        engine.init(&mut store, 0).expect("init");
        engine.start(0).expect("start");
        crank(&engine, &clock, 1);
        assert!(engine.sync_data(clock.now_us()).sync_valid);

        engine.stop().expect("stop");
        let teeth = engine.sync_data(clock.now_us()).tooth_index;
        engine.on_crank_edge(clock.now_us() + 1_000);
        assert_eq!(engine.sync_data(clock.now_us()).tooth_index, teeth);
        assert!(engine.with_actuators(|actuators| actuators.injection.unit().disarms()) >= 4);

        engine.deinit().expect("deinit");
        assert_eq!(engine.lifecycle(), Lifecycle::Uninitialized);
    }

    #[test]
    fn monitor_persists_folded_maps() {
        let engine = engine();
        let mut store = MemoryConfigStore::new();
        let clock = ManualClock::new(0);
        let mut monitor = Monitor::default();
        engine.init(&mut store, 0).expect("init");

        let mut maps = engine.bank.lock(|bank| *bank.maps());
        maps.ve.set_cell(0, 0, 900);
        engine.replace_maps(maps).expect("initialised");
        clock.advance_ms(6_000);

        let report = engine
            .monitor(&mut monitor, &mut store, &clock)
            .expect("initialised");
        assert!(report.diagnostic.is_some_and(|diag| !diag.map_dirty));
        let event = engine.with_telemetry(|telemetry| telemetry.latest().map(|record| record.event));
        assert_eq!(event, Some(TelemetryEventKind::MapsPersisted));
    }
}
