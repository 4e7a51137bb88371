#![allow(dead_code)]

use ecu_core::calibration::MemoryConfigStore;
use ecu_core::drivers::{IgnitionDriver, InjectionDriver, SimCompareUnit};
use ecu_core::engine::EngineControl;
use ecu_core::pipeline::{Clock, CycleOutcome, Executor, ManualClock, Planner};
use ecu_core::sensors::{SensorFaults, SensorSnapshot};

pub type SimEngine = EngineControl<InjectionDriver<SimCompareUnit>, IgnitionDriver<SimCompareUnit>>;

pub const PERIOD_1000_RPM_US: u32 = 1_000;

pub fn warm_snapshot() -> SensorSnapshot {
    SensorSnapshot {
        map_kpa10: 1_000,
        tps_pct10: 200,
        clt_c: 85,
        iat_c: 30,
        o2_mv: 0,
        vbat_dv: 138,
        knock: false,
        faults: SensorFaults::NONE,
        timestamp_ms: 0,
    }
}

/// Engine, clock and pipeline stages driven by a synthetic 60-2 wheel.
pub struct Rig {
    pub engine: SimEngine,
    pub clock: ManualClock,
    pub store: MemoryConfigStore,
    pub planner: Planner,
    pub executor: Executor,
    pub sensors: SensorSnapshot,
    pub period_us: u32,
    now_us: u32,
    primed: bool,
    revolutions: u32,
}

impl Rig {
    pub fn new() -> Self {
        Self::with_store(MemoryConfigStore::new())
    }

    pub fn with_store(mut store: MemoryConfigStore) -> Self {
        let engine = SimEngine::new(
            InjectionDriver::new(SimCompareUnit::new()),
            IgnitionDriver::new(SimCompareUnit::new()),
        );
        engine.init(&mut store, 0).expect("init");
        engine.start(0).expect("start");
        Self {
            engine,
            clock: ManualClock::new(0),
            store,
            planner: Planner::default(),
            executor: Executor::default(),
            sensors: warm_snapshot(),
            period_us: PERIOD_1000_RPM_US,
            now_us: 0,
            primed: false,
            revolutions: 0,
        }
    }

    fn edge(&mut self, delta_us: u32) {
        self.now_us = self.now_us.wrapping_add(delta_us);
        let now = self.now_us;
        self.clock.set_us(u64::from(now));
        self.engine.with_actuators(|actuators| {
            actuators.injection.unit_mut().set_counter(now);
            actuators.ignition.unit_mut().set_counter(now);
        });
        self.engine.on_crank_edge(now);
    }

    /// One crank revolution: 57 regular teeth, then the gap tooth. With
    /// `with_cam` the cam edge precedes every second gap, as on a
    /// four-stroke engine.
    pub fn revolution(&mut self, with_cam: bool) {
        if !self.primed {
            self.edge(0);
            self.primed = true;
        }
        for _ in 0..57 {
            self.edge(self.period_us);
        }
        if with_cam && self.revolutions % 2 == 0 {
            self.engine.on_cam_edge(self.now_us);
        }
        self.edge(self.period_us * 3);
        self.revolutions += 1;
    }

    pub fn now_us(&self) -> u32 {
        self.now_us
    }

    pub fn clock_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Advances time without any crank edge.
    pub fn idle_us(&mut self, micros: u32) {
        self.now_us = self.now_us.wrapping_add(micros);
        self.clock.set_us(u64::from(self.now_us));
    }

    /// Planner then Executor, as after one wake-up.
    pub fn cycle(&mut self) -> Option<CycleOutcome> {
        let mut snapshot = self.sensors;
        snapshot.timestamp_ms = self.clock.now_ms();
        self.engine.publish_sensors(snapshot);
        let planned = self.engine.plan(&mut self.planner, &self.clock).expect("running");
        if !planned {
            return None;
        }
        Some(self.engine.execute(&mut self.executor, &self.clock).expect("running"))
    }

    /// Revolutions with one pipeline cycle each, until `millis` have passed.
    pub fn run_for_ms(&mut self, millis: u64, with_cam: bool) -> Option<CycleOutcome> {
        let until = self.clock.now_ms() + millis;
        let mut last = None;
        while self.clock.now_ms() < until {
            self.revolution(with_cam);
            last = self.cycle();
        }
        last
    }
}
