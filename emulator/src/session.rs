use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use ecu_core::calibration::MemoryConfigStore;
use ecu_core::drivers::{ArmRecord, IgnitionDriver, InjectionDriver, SimCompareUnit};
use ecu_core::engine::{EngineControl, InitReport};
use ecu_core::monitor::{Monitor, MonitorReport};
use ecu_core::pipeline::{Clock, CycleOutcome, ExecPath, Executor, ManualClock, Planner};
use ecu_core::sensors::{SensorFaults, SensorSnapshot};
use ecu_core::telemetry::{EventId, Millis, TelemetryEventKind, TelemetryPayload, TelemetryRecord};

pub type SimEngine = EngineControl<InjectionDriver<SimCompareUnit>, IgnitionDriver<SimCompareUnit>>;

/// Tooth period of a 60-2 wheel at 1000 rpm.
const PERIOD_1000_RPM_US: u32 = 1_000;
const REGULAR_TEETH: u32 = 57;
/// The gap spans the two missing positions plus the tooth after them.
const GAP_POSITIONS: u32 = 3;
const MONITOR_TICK_MS: u64 = 100;
/// Overheat threshold is 120 °C; the scenario runs a few degrees above it.
const OVERHEAT_CLT_C: i16 = 125;
const WARM_CLT_C: i16 = 85;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Scenario {
    /// A: steady 1000 rpm with cam phase; sequential injection and ignition.
    FullSync,
    /// B: the cam never reports; semi-sequential injection and wasted spark.
    CamLost,
    /// C: coolant overheat trips limp mode, then the recovery gates clear it.
    Overheat,
}

impl Scenario {
    pub const ALL: [Scenario; 3] = [Scenario::FullSync, Scenario::CamLost, Scenario::Overheat];

    pub fn log_path(self) -> &'static str {
        match self {
            Scenario::FullSync => "evidence/scenario-a-full-sync.log",
            Scenario::CamLost => "evidence/scenario-b-cam-lost.log",
            Scenario::Overheat => "evidence/scenario-c-overheat-limp.log",
        }
    }

    pub fn header(self) -> &'static str {
        match self {
            Scenario::FullSync => "ECU emulator scenario A: full sync at 1000 rpm",
            Scenario::CamLost => "ECU emulator scenario B: crank sync without cam phase",
            Scenario::Overheat => "ECU emulator scenario C: coolant overheat and limp recovery",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self, String> {
        if tag.eq_ignore_ascii_case("a") || tag.eq_ignore_ascii_case("full-sync") {
            Ok(Self::FullSync)
        } else if tag.eq_ignore_ascii_case("b") || tag.eq_ignore_ascii_case("cam-lost") {
            Ok(Self::CamLost)
        } else if tag.eq_ignore_ascii_case("c") || tag.eq_ignore_ascii_case("overheat") {
            Ok(Self::Overheat)
        } else {
            Err(format!("Unknown scenario `{tag}`"))
        }
    }
}

/// Counters gathered while a scenario runs.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ScenarioSummary {
    pub cycles: u32,
    pub sequential: u32,
    pub semi_sequential: u32,
    pub stale: u32,
    pub skipped: u32,
    pub sync_acquired: bool,
    pub limp_entered: bool,
    pub limp_exited: bool,
    pub max_failures: u8,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Role {
    Host,
    Pipeline,
    Output,
    Monitor,
    Telemetry,
}

impl Role {
    fn prefix(self) -> &'static str {
        match self {
            Role::Host => "host     >",
            Role::Pipeline => "pipeline <",
            Role::Output => "output   <",
            Role::Monitor => "monitor  <",
            Role::Telemetry => "event    <",
        }
    }
}

/// Drives one `ecu-core` engine with a synthetic 60-2 wheel and a manual
/// clock, writing a transcript of what the pipeline did.
pub struct Session<W: Write> {
    engine: SimEngine,
    clock: ManualClock,
    store: MemoryConfigStore,
    planner: Planner,
    executor: Executor,
    monitor: Monitor,
    sensors: SensorSnapshot,
    transcript: Transcript<W>,
    summary: ScenarioSummary,
    period_us: u32,
    now_us: u32,
    primed: bool,
    revolutions: u32,
    next_event: EventId,
    next_monitor_ms: u64,
    trace_outputs: bool,
}

impl Session<BufWriter<fs::File>> {
    /// Opens the evidence log of `scenario`, truncating any earlier run.
    pub fn for_scenario(scenario: Scenario) -> io::Result<Self> {
        let path = Path::new(scenario.log_path());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Self::new(BufWriter::new(file), scenario)
    }
}

impl<W: Write> Session<W> {
    pub fn new(writer: W, scenario: Scenario) -> io::Result<Self> {
        let mut transcript = Transcript::new(writer);
        transcript.header(scenario)?;

        let mut store = MemoryConfigStore::new();
        let engine = SimEngine::new(
            InjectionDriver::new(SimCompareUnit::new()),
            IgnitionDriver::new(SimCompareUnit::new()),
        );
        let report = engine
            .init(&mut store, 0)
            .map_err(|err| io::Error::other(format!("engine init failed: {err}")))?;
        engine
            .start(0)
            .map_err(|err| io::Error::other(format!("engine start failed: {err}")))?;

        let mut session = Self {
            engine,
            clock: ManualClock::new(0),
            store,
            planner: Planner::default(),
            executor: Executor::default(),
            monitor: Monitor::default(),
            sensors: warm_sensors(),
            transcript,
            summary: ScenarioSummary::default(),
            period_us: PERIOD_1000_RPM_US,
            now_us: 0,
            primed: false,
            revolutions: 0,
            next_event: 0,
            next_monitor_ms: MONITOR_TICK_MS,
            trace_outputs: true,
        };
        session.log_init(&report)?;
        session.note(Role::Host, "engine started")?;
        Ok(session)
    }

    pub fn summary(&self) -> ScenarioSummary {
        self.summary
    }

    #[cfg(test)]
    pub fn into_writer(self) -> W {
        self.transcript.writer
    }

    /// Runs the scripted steps of `scenario` and returns what was observed.
    pub fn run(&mut self, scenario: Scenario) -> io::Result<ScenarioSummary> {
        match scenario {
            Scenario::FullSync => self.run_full_sync()?,
            Scenario::CamLost => self.run_cam_lost()?,
            Scenario::Overheat => self.run_overheat()?,
        }
        self.finish()?;
        Ok(self.summary)
    }

    fn run_full_sync(&mut self) -> io::Result<()> {
        self.note(Role::Host, "crank at 1000 rpm, cam edge every second revolution")?;
        self.run_for_ms(360, true)?;
        self.trace_outputs = false;
        self.run_for_ms(1_000, true)?;
        self.log_diag()
    }

    fn run_cam_lost(&mut self) -> io::Result<()> {
        self.note(Role::Host, "crank at 1000 rpm, cam sensor disconnected")?;
        self.run_for_ms(180, false)?;
        self.trace_outputs = false;
        self.run_for_ms(1_000, false)?;
        self.log_diag()
    }

    fn run_overheat(&mut self) -> io::Result<()> {
        self.note(Role::Host, "warm engine at 1000 rpm")?;
        self.trace_outputs = false;
        self.run_for_ms(500, true)?;
        self.log_runtime()?;

        self.sensors.clt_c = OVERHEAT_CLT_C;
        self.note(Role::Host, &format!("coolant raised to {OVERHEAT_CLT_C} C"))?;
        self.trace_outputs = true;
        self.revolution(true)?;
        self.cycle()?;

        self.sensors.clt_c = WARM_CLT_C;
        self.note(Role::Host, &format!("coolant back to {WARM_CLT_C} C"))?;
        self.revolution(true)?;
        self.cycle()?;
        self.log_runtime()?;

        self.trace_outputs = false;
        self.run_for_ms(6_400, true)?;
        self.note(Role::Host, "recovery gates still holding limp")?;
        self.log_runtime()?;
        self.run_for_ms(800, true)?;
        self.log_runtime()
    }

    fn finish(&mut self) -> io::Result<()> {
        self.drain_telemetry()?;
        let perf = self.engine.perf_summary();
        let line = format!(
            "perf planner p99={}us executor p99={}us misses={}/{} overruns={} stale={}",
            perf.planner.p99_us,
            perf.executor.p99_us,
            perf.planner.deadline_misses,
            perf.executor.deadline_misses,
            perf.queue_overruns,
            perf.stale_drops,
        );
        self.note(Role::Monitor, &line)?;
        let summary = self.summary;
        self.note(
            Role::Host,
            &format!(
                "summary cycles={} skipped={} sequential={} semi_sequential={} stale={} failures={} limp_entered={} limp_exited={}",
                summary.cycles,
                summary.skipped,
                summary.sequential,
                summary.semi_sequential,
                summary.stale,
                summary.max_failures,
                summary.limp_entered,
                summary.limp_exited,
            ),
        )
    }

    fn edge(&mut self, delta_us: u32) {
        self.now_us = self.now_us.wrapping_add(delta_us);
        let now = self.now_us;
        self.clock.set_us(u64::from(now));
        self.engine.with_actuators(|actuators| {
            actuators.injection.unit_mut().set_counter(now);
            actuators.ignition.unit_mut().set_counter(now);
        });
        let report = self.engine.on_crank_edge(now);
        if report.failed > 0 {
            self.summary.max_failures = self.summary.max_failures.max(report.failed);
        }
    }

    /// One crank revolution: the regular teeth, then the gap tooth. With
    /// `with_cam` the cam edge precedes every second gap.
    fn revolution(&mut self, with_cam: bool) -> io::Result<()> {
        if !self.primed {
            self.edge(0);
            self.primed = true;
        }
        for _ in 0..REGULAR_TEETH {
            self.edge(self.period_us);
        }
        if with_cam && self.revolutions % 2 == 0 {
            self.engine.on_cam_edge(self.now_us);
        }
        self.edge(self.period_us * GAP_POSITIONS);
        self.revolutions += 1;
        self.tick_monitor()
    }

    /// Planner then Executor, as after one tooth wake-up.
    fn cycle(&mut self) -> io::Result<Option<CycleOutcome>> {
        let mut snapshot = self.sensors;
        snapshot.timestamp_ms = self.clock.now_ms();
        self.engine.publish_sensors(snapshot);

        let planned = self
            .engine
            .plan(&mut self.planner, &self.clock)
            .map_err(|err| io::Error::other(format!("planner: {err}")))?;
        let outcome = if planned {
            let outcome = self
                .engine
                .execute(&mut self.executor, &self.clock)
                .map_err(|err| io::Error::other(format!("executor: {err}")))?;
            Some(outcome)
        } else {
            None
        };
        self.record_outcome(outcome)?;
        self.log_outputs()?;
        self.drain_telemetry()?;
        Ok(outcome)
    }

    fn run_for_ms(&mut self, millis: u64, with_cam: bool) -> io::Result<()> {
        let until = self.clock.now_ms() + millis;
        while self.clock.now_ms() < until {
            self.revolution(with_cam)?;
            self.cycle()?;
        }
        Ok(())
    }

    fn record_outcome(&mut self, outcome: Option<CycleOutcome>) -> io::Result<()> {
        self.summary.cycles += 1;
        let line = match outcome {
            None => {
                self.summary.skipped += 1;
                String::from("no command planned")
            }
            Some(CycleOutcome::Idle) => String::from("executor idle"),
            Some(CycleOutcome::Stale { age_us }) => {
                self.summary.stale += 1;
                format!("dropped stale command age={age_us}us")
            }
            Some(CycleOutcome::Applied(path)) => {
                match path {
                    ExecPath::Sequential => self.summary.sequential += 1,
                    ExecPath::SemiSequential => self.summary.semi_sequential += 1,
                }
                let diag = self.engine.injection_diag().ok();
                if let Some(diag) = diag
                    && diag.sync_acquired
                {
                    self.summary.sync_acquired = true;
                }
                if let Some(diag) = diag {
                    self.summary.max_failures = self.summary.max_failures.max(diag.failures);
                }
                let runtime = self.engine.runtime_state().unwrap_or_default();
                format!(
                    "applied {path:?} rpm={} pw={}us adv={}.{} limp={} fuel_cut={}",
                    runtime.rpm,
                    runtime.pulsewidth_us,
                    runtime.advance_x10 / 10,
                    runtime.advance_x10 % 10,
                    runtime.limp,
                    runtime.fuel_cut,
                )
            }
        };
        if self.trace_outputs {
            self.note(Role::Pipeline, &line)?;
        }
        Ok(())
    }

    fn log_outputs(&mut self) -> io::Result<()> {
        let (injection, ignition) = self.engine.with_actuators(|actuators| {
            let injection = actuators.injection.unit().records().to_vec();
            let ignition = actuators.ignition.unit().records().to_vec();
            actuators.injection.unit_mut().clear();
            actuators.ignition.unit_mut().clear();
            (injection, ignition)
        });
        if !self.trace_outputs {
            return Ok(());
        }
        for (label, records) in [("inj", injection), ("ign", ignition)] {
            for record in records {
                self.note(Role::Output, &format_arm(label, &record))?;
            }
        }
        Ok(())
    }

    fn drain_telemetry(&mut self) -> io::Result<()> {
        let next = self.next_event;
        let records: Vec<TelemetryRecord<Millis>> = self.engine.with_telemetry(|telemetry| {
            telemetry
                .oldest_first()
                .filter(|record| record.id >= next)
                .copied()
                .collect()
        });
        for record in records {
            self.next_event = record.id.wrapping_add(1);
            match record.event {
                TelemetryEventKind::LimpEntered => self.summary.limp_entered = true,
                TelemetryEventKind::LimpExited => self.summary.limp_exited = true,
                _ => {}
            }
            self.note(Role::Telemetry, &format_record(&record))?;
        }
        Ok(())
    }

    fn tick_monitor(&mut self) -> io::Result<()> {
        while self.clock.now_ms() >= self.next_monitor_ms {
            self.next_monitor_ms += MONITOR_TICK_MS;
            let report = self
                .engine
                .monitor(&mut self.monitor, &mut self.store, &self.clock)
                .map_err(|err| io::Error::other(format!("monitor: {err}")))?;
            self.log_report(&report)?;
        }
        Ok(())
    }

    fn log_report(&mut self, report: &MonitorReport) -> io::Result<()> {
        // Status is due every tick; the 1 Hz diagnostic is enough for a transcript.
        if let Some(diagnostic) = report.diagnostic {
            let line = format!(
                "diagnostic sync={} errors={:#04x} limp_activations={} trips={} stale={} map_version={} jitter_max={}us/{}",
                diagnostic.sync_acquired,
                diagnostic.error_bits,
                diagnostic.limp_activations,
                diagnostic.safety_trips,
                diagnostic.stale_drops,
                diagnostic.map_version,
                diagnostic.jitter.max_us,
                diagnostic.jitter.samples,
            );
            self.note(Role::Monitor, &line)?;
        }
        Ok(())
    }

    fn log_diag(&mut self) -> io::Result<()> {
        let Ok(diag) = self.engine.injection_diag() else {
            return self.note(Role::Monitor, "no injection diagnostics yet");
        };
        let soi = diag
            .soi_deg
            .iter()
            .map(|deg| format!("{deg:.1}"))
            .collect::<Vec<_>>()
            .join(",");
        let line = format!(
            "injection rpm={} sync_acquired={} eoi_target={:.1} eoi_fallback={:.1} soi=[{soi}] failures={}",
            diag.rpm, diag.sync_acquired, diag.eoi_target_deg, diag.eoi_fallback_deg, diag.failures,
        );
        self.note(Role::Monitor, &line)
    }

    fn log_runtime(&mut self) -> io::Result<()> {
        let line = match self.engine.runtime_state() {
            Some(runtime) => format!(
                "runtime rpm={} pw={}us adv={}.{} limp={}",
                runtime.rpm,
                runtime.pulsewidth_us,
                runtime.advance_x10 / 10,
                runtime.advance_x10 % 10,
                runtime.limp,
            ),
            None => String::from("runtime not published"),
        };
        self.note(Role::Monitor, &line)
    }

    fn log_init(&mut self, report: &InitReport) -> io::Result<()> {
        let line = format!(
            "init maps={:?} eoi={:?} eoit_map={:?} closed_loop={:?}",
            report.fuel_maps, report.calibration.eoi, report.calibration.eoit_map, report.calibration.closed_loop,
        );
        self.note(Role::Host, &line)
    }

    fn note(&mut self, role: Role, line: &str) -> io::Result<()> {
        self.transcript.append_line(self.clock.now_us(), role, line)
    }
}

fn warm_sensors() -> SensorSnapshot {
    SensorSnapshot {
        map_kpa10: 1_000,
        tps_pct10: 200,
        clt_c: WARM_CLT_C,
        iat_c: 30,
        o2_mv: 0,
        vbat_dv: 138,
        knock: false,
        faults: SensorFaults::NONE,
        timestamp_ms: 0,
    }
}

fn format_arm(label: &str, record: &ArmRecord) -> String {
    format!(
        "{label}{} assert={}us release={}us width={}us",
        record.channel,
        record.assert_at,
        record.release_at,
        record.release_at.wrapping_sub(record.assert_at),
    )
}

fn format_record(record: &TelemetryRecord<Millis>) -> String {
    let detail = match record.details {
        TelemetryPayload::None => String::new(),
        TelemetryPayload::Value(value) => format!(" value={value}"),
        TelemetryPayload::Limp { time_in_limp } => match time_in_limp {
            Some(elapsed) => format!(" in_limp={}ms", elapsed.as_millis()),
            None => String::new(),
        },
        TelemetryPayload::Plan { age_us } => format!(" age={age_us}us"),
        TelemetryPayload::Persist { version } => format!(" version={version}"),
    };
    format!("#{} {}{detail}", record.id, record.event)
}

struct Transcript<W: Write> {
    writer: W,
}

impl<W: Write> Transcript<W> {
    fn new(writer: W) -> Self {
        Self { writer }
    }

    fn header(&mut self, scenario: Scenario) -> io::Result<()> {
        writeln!(self.writer, "# {}", scenario.header())?;
        writeln!(self.writer, "# Timestamps are simulated milliseconds since power-on")?;
        writeln!(self.writer)?;
        self.writer.flush()
    }

    fn append_line(&mut self, now_us: u32, role: Role, line: &str) -> io::Result<()> {
        writeln!(
            self.writer,
            "[+{:>6}.{:03} ms] {} {}",
            now_us / 1_000,
            now_us % 1_000,
            role.prefix(),
            line
        )?;
        self.writer.flush()
    }
}
