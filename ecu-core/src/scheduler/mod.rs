//! Angle-based actuation scheduler.
//!
//! Events are queued against a crank angle in the 720° cycle. On every tooth
//! the interrupt path converts the remaining angular distance into a delay
//! using the period the phase predictor expects for the coming tooth, and
//! hands an absolute compare target to the owning driver. Angle arithmetic
//! after queuing is Q16.16.

use core::fmt;

use crate::CYLINDER_COUNT;
use crate::angle::{AngleQ, Q_360, Q_ONE, angle_deg_to_q, forward_distance, q_to_deg, wrap_q720};
use crate::decoder::SyncState;
use crate::drivers::{ActuationParams, Driver, DriverError, dwell_time_us};
use crate::timing::HpState;

/// Fixed number of pending event slots.
pub const SCHEDULER_SLOTS: usize = 16;
/// Largest wheel the per-tooth angle table supports.
pub const MAX_TOOTH_POSITIONS: usize = 128;
/// Crank angle of tooth zero relative to cylinder 0 TDC.
pub const DEFAULT_TDC_OFFSET_DEG: u32 = 114;
const DEFAULT_POSITIONS: u16 = 60;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EventKind {
    InjectorOpen,
    InjectorClose,
    IgnitionDwell,
    IgnitionSpark,
}

impl EventKind {
    pub const fn is_injection(self) -> bool {
        matches!(self, EventKind::InjectorOpen | EventKind::InjectorClose)
    }
}

/// Queued actuation waiting for its crank angle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PendingEvent {
    pub kind: EventKind,
    pub cylinder: u8,
    pub angle: AngleQ,
    pub params: ActuationParams,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ScheduleError {
    QueueFull,
    InvalidCylinder,
    /// The requested angle is about to be crossed; re-arming now could fire
    /// the same event twice in one cycle.
    InsideFireWindow,
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Decoder output sampled by the tooth interrupt.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ToothTick {
    pub capture_us: u32,
    pub period_us: u32,
    pub tooth_index: u16,
    pub revolution_index: u8,
    pub rpm: u32,
    pub gap: bool,
    pub sync_valid: bool,
    pub sync_acquired: bool,
    /// Driver timebase sampled in the same interrupt; zero when unavailable.
    pub hw_counter: u32,
}

impl ToothTick {
    pub fn from_sync(sync: &SyncState, hw_counter: u32) -> Self {
        Self {
            capture_us: sync.last_capture_us,
            period_us: sync.tooth_period_us,
            tooth_index: sync.tooth_index,
            revolution_index: sync.revolution_index,
            rpm: sync.rpm,
            gap: sync.gap_detected,
            sync_valid: sync.sync_valid,
            sync_acquired: sync.sync_acquired,
            hw_counter,
        }
    }
}

/// Engine position as last seen by the scheduler.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct EngineAngleState {
    pub current_angle: AngleQ,
    pub base_time_us: u32,
    pub tooth_period_us: u32,
    pub rpm: u32,
    pub revolution_index: u8,
    pub sync_valid: bool,
    pub has_angle: bool,
}

impl EngineAngleState {
    pub fn current_angle_deg(&self) -> f32 {
        q_to_deg(self.current_angle)
    }
}

/// Outcome of one tooth pass.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FireReport {
    pub fired: u8,
    pub failed: u8,
    pub last_error: Option<DriverError>,
}

/// Trigger wheel geometry the scheduler converts angles with.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SchedulerConfig {
    /// Tooth positions per revolution, missing teeth included.
    pub positions: u16,
    /// Crank angle of tooth zero relative to cylinder 0 TDC.
    pub tdc_offset_deg: f32,
}

impl SchedulerConfig {
    #[allow(clippy::cast_precision_loss)]
    pub const fn new() -> Self {
        Self {
            positions: DEFAULT_POSITIONS,
            tdc_offset_deg: DEFAULT_TDC_OFFSET_DEG as f32,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new()
    }
}

pub struct AngleScheduler {
    slots: [Option<PendingEvent>; SCHEDULER_SLOTS],
    tooth_angles: [AngleQ; MAX_TOOTH_POSITIONS],
    positions: u16,
    deg_per_tooth_q: u32,
    fire_window_q: u32,
    tdc_offset_q: AngleQ,
    engine: EngineAngleState,
    last_counter: Option<u32>,
    timebase_mismatches: u32,
    fired_total: u32,
    fire_failures: u32,
}

#[allow(clippy::cast_possible_truncation)]
const fn build_tooth_angles(positions: u16, deg_per_tooth_q: u32, tdc_offset_q: AngleQ) -> [AngleQ; MAX_TOOTH_POSITIONS] {
    let mut table = [0; MAX_TOOTH_POSITIONS];
    let mut index = 0;
    while index < positions as usize && index < MAX_TOOTH_POSITIONS {
        table[index] = wrap_q720(index as u32 * deg_per_tooth_q + tdc_offset_q);
        index += 1;
    }
    table
}

impl AngleScheduler {
    /// Scheduler for a 60-position wheel with the default TDC offset.
    pub const fn new() -> Self {
        let deg_per_tooth_q = Q_360 / DEFAULT_POSITIONS as u32;
        let tdc_offset_q = DEFAULT_TDC_OFFSET_DEG * Q_ONE;
        Self {
            slots: [None; SCHEDULER_SLOTS],
            tooth_angles: build_tooth_angles(DEFAULT_POSITIONS, deg_per_tooth_q, tdc_offset_q),
            positions: DEFAULT_POSITIONS,
            deg_per_tooth_q,
            fire_window_q: deg_per_tooth_q * 3 / 2,
            tdc_offset_q,
            engine: EngineAngleState {
                current_angle: 0,
                base_time_us: 0,
                tooth_period_us: 0,
                rpm: 0,
                revolution_index: 0,
                sync_valid: false,
                has_angle: false,
            },
            last_counter: None,
            timebase_mismatches: 0,
            fired_total: 0,
            fire_failures: 0,
        }
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        let mut scheduler = Self::new();
        scheduler.set_trigger_teeth(config.positions);
        scheduler.set_tdc_offset(config.tdc_offset_deg);
        scheduler
    }

    /// Sets the crank angle of tooth zero and rebuilds the tooth table.
    pub fn set_tdc_offset(&mut self, degrees: f32) {
        self.tdc_offset_q = angle_deg_to_q(degrees);
        self.rebuild_table();
    }

    pub fn tdc_offset_deg(&self) -> f32 {
        q_to_deg(self.tdc_offset_q)
    }

    /// Sets the number of tooth positions per revolution, missing teeth
    /// included. Zero or oversized wheels are ignored.
    pub fn set_trigger_teeth(&mut self, positions: u16) {
        if positions == 0 || usize::from(positions) > MAX_TOOTH_POSITIONS {
            return;
        }
        self.positions = positions;
        self.deg_per_tooth_q = Q_360 / u32::from(positions);
        self.fire_window_q = self.deg_per_tooth_q * 3 / 2;
        self.rebuild_table();
    }

    pub fn positions(&self) -> u16 {
        self.positions
    }

    pub fn deg_per_tooth_q(&self) -> u32 {
        self.deg_per_tooth_q
    }

    fn rebuild_table(&mut self) {
        self.tooth_angles = build_tooth_angles(self.positions, self.deg_per_tooth_q, self.tdc_offset_q);
    }

    /// Queues an event in a free slot. Never overwrites an armed slot.
    pub fn schedule(
        &mut self,
        kind: EventKind,
        cylinder: u8,
        angle_deg: f32,
        params: ActuationParams,
    ) -> Result<(), ScheduleError> {
        self.schedule_q(kind, cylinder, angle_deg_to_q(angle_deg), params)
    }

    pub fn schedule_q(
        &mut self,
        kind: EventKind,
        cylinder: u8,
        angle: AngleQ,
        params: ActuationParams,
    ) -> Result<(), ScheduleError> {
        if usize::from(cylinder) >= CYLINDER_COUNT {
            return Err(ScheduleError::InvalidCylinder);
        }
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| slot.is_none())
            .ok_or(ScheduleError::QueueFull)?;
        *slot = Some(PendingEvent {
            kind,
            cylinder,
            angle: wrap_q720(angle),
            params,
        });
        Ok(())
    }

    /// Re-targets the armed event of the same kind and cylinder, or arms a
    /// new one. Angles already inside the imminent fire window are refused.
    pub fn replace(
        &mut self,
        kind: EventKind,
        cylinder: u8,
        angle_deg: f32,
        params: ActuationParams,
    ) -> Result<(), ScheduleError> {
        if usize::from(cylinder) >= CYLINDER_COUNT {
            return Err(ScheduleError::InvalidCylinder);
        }
        let angle = angle_deg_to_q(angle_deg);
        if self.engine.has_angle
            && forward_distance(self.engine.current_angle, angle) <= self.fire_window_q
        {
            return Err(ScheduleError::InsideFireWindow);
        }

        let existing = self.slots.iter_mut().flatten().find(|event| {
            event.kind == kind && event.cylinder == cylinder
        });
        match existing {
            Some(event) => {
                event.angle = angle;
                event.params = params;
                Ok(())
            }
            None => self.schedule_q(kind, cylinder, angle, params),
        }
    }

    pub fn cancel_cylinder(&mut self, cylinder: u8) {
        self.cancel_where(|event| event.cylinder == cylinder);
    }

    pub fn cancel_type(&mut self, kind: EventKind) {
        self.cancel_where(|event| event.kind == kind);
    }

    pub fn cancel_all(&mut self) {
        self.slots = [None; SCHEDULER_SLOTS];
    }

    fn cancel_where(&mut self, predicate: impl Fn(&PendingEvent) -> bool) {
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(&predicate) {
                *slot = None;
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingEvent> {
        self.slots.iter().flatten()
    }

    pub fn engine_state(&self) -> EngineAngleState {
        self.engine
    }

    pub fn timebase_mismatch_count(&self) -> u32 {
        self.timebase_mismatches
    }

    pub fn fired_total(&self) -> u32 {
        self.fired_total
    }

    /// Driver rejections since start-up.
    pub fn fire_failures(&self) -> u32 {
        self.fire_failures
    }

    /// Angle of `tooth_index` within the 720° cycle.
    pub fn tooth_angle(&self, tooth_index: u16, revolution_index: u8) -> AngleQ {
        let revolution = if revolution_index == 0 { 0 } else { Q_360 };
        let base = match self.tooth_angles.get(usize::from(tooth_index)) {
            Some(angle) if tooth_index < self.positions => *angle,
            _ => u32::from(tooth_index) * self.deg_per_tooth_q + self.tdc_offset_q,
        };
        wrap_q720(base + revolution)
    }

    /// Interrupt entry: advances the engine angle and fires due events.
    pub fn on_tooth<I: Driver, G: Driver>(
        &mut self,
        tick: &ToothTick,
        injection: &mut I,
        ignition: &mut G,
        hp: &mut HpState,
    ) -> FireReport {
        let base = if tick.hw_counter == 0 {
            tick.capture_us
        } else {
            tick.hw_counter
        };

        if let Some(last) = self.last_counter
            && tick.period_us > 0
            && !tick.gap
        {
            let delta = base.wrapping_sub(last);
            if u64::from(delta) * 2 > u64::from(tick.period_us) * 3 {
                self.timebase_mismatches = self.timebase_mismatches.wrapping_add(1);
            }
        }
        self.last_counter = Some(base);

        let ready = tick.sync_valid && tick.sync_acquired && tick.period_us > 0;
        self.engine = EngineAngleState {
            current_angle: self.tooth_angle(tick.tooth_index, tick.revolution_index),
            base_time_us: base,
            tooth_period_us: tick.period_us,
            rpm: tick.rpm,
            revolution_index: tick.revolution_index,
            sync_valid: ready,
            has_angle: ready,
        };

        let mut report = FireReport::default();
        if !ready {
            return report;
        }
        hp.update_period(tick.period_us, tick.capture_us);
        let period_us = hp.projected_period_us(tick.period_us);

        let current = self.engine.current_angle;
        for slot in &mut self.slots {
            let Some(event) = *slot else {
                continue;
            };
            let distance = forward_distance(current, event.angle);
            if distance > self.fire_window_q {
                continue;
            }
            *slot = None;

            let delay = u64::from(distance) * u64::from(period_us) / u64::from(self.deg_per_tooth_q);
            let target = base.wrapping_add(u32::try_from(delay).unwrap_or(u32::MAX));
            match fire(&event, target, injection, ignition, hp) {
                Ok(()) => {
                    report.fired = report.fired.saturating_add(1);
                    self.fired_total = self.fired_total.wrapping_add(1);
                }
                Err(error) => {
                    report.failed = report.failed.saturating_add(1);
                    report.last_error = Some(error);
                    self.fire_failures = self.fire_failures.wrapping_add(1);
                }
            }
        }
        report
    }
}

impl Default for AngleScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the tooth interrupt touches, kept behind one critical section.
pub struct Actuators<I, G> {
    pub scheduler: AngleScheduler,
    pub injection: I,
    pub ignition: G,
    pub hp: HpState,
}

impl<I: Driver, G: Driver> Actuators<I, G> {
    pub const fn new(injection: I, ignition: G) -> Self {
        Self {
            scheduler: AngleScheduler::new(),
            injection,
            ignition,
            hp: HpState::new(),
        }
    }

    pub fn with_scheduler(scheduler: AngleScheduler, injection: I, ignition: G) -> Self {
        Self {
            scheduler,
            injection,
            ignition,
            hp: HpState::new(),
        }
    }

    /// Advances the scheduler with the decoder state of the tooth just
    /// processed, sampling the injection timer as the compare timebase.
    pub fn on_sync(&mut self, sync: &SyncState) -> FireReport {
        let tick = ToothTick::from_sync(sync, self.injection.now());
        self.on_tooth(&tick)
    }

    pub fn on_tooth(&mut self, tick: &ToothTick) -> FireReport {
        self.scheduler
            .on_tooth(tick, &mut self.injection, &mut self.ignition, &mut self.hp)
    }

    /// Drops every queued event and releases every output.
    pub fn shutdown(&mut self) {
        self.scheduler.cancel_all();
        self.injection.stop_all();
        self.ignition.stop_all();
    }
}

fn fire<I: Driver, G: Driver>(
    event: &PendingEvent,
    target: u32,
    injection: &mut I,
    ignition: &mut G,
    hp: &HpState,
) -> Result<(), DriverError> {
    match (event.kind, event.params) {
        (EventKind::InjectorOpen, ActuationParams::Pulse { pulsewidth_us }) => {
            let pulsewidth_us = pulsewidth_us.saturating_add(hp.injector_latency_us());
            injection.schedule_absolute(event.cylinder, target, ActuationParams::Pulse { pulsewidth_us })
        }
        (EventKind::InjectorClose, ActuationParams::Pulse { pulsewidth_us }) => {
            let pulsewidth_us = pulsewidth_us.saturating_add(hp.injector_latency_us());
            injection.schedule_absolute(
                event.cylinder,
                target.wrapping_sub(pulsewidth_us),
                ActuationParams::Pulse { pulsewidth_us },
            )
        }
        (EventKind::IgnitionDwell, params @ ActuationParams::Ignition { rpm, vbat_dv }) => {
            let spark = target
                .wrapping_add(dwell_time_us(vbat_dv, rpm))
                .wrapping_sub(hp.coil_latency_us());
            ignition.schedule_absolute(event.cylinder, spark, params)
        }
        (EventKind::IgnitionSpark, params @ ActuationParams::Ignition { .. }) => {
            let spark = target.wrapping_sub(hp.coil_latency_us());
            ignition.schedule_absolute(event.cylinder, spark, params)
        }
        _ => Err(DriverError::InvalidParams),
    }
}
