//! Two-stage Planner/Executor pipeline.
//!
//! The Planner turns the current sync state and sensor snapshot into one
//! [`EngineCommand`] per wake-up and pushes it into a latest-wins
//! [`ring::PlanRing`]. The Executor drains the ring to the newest command,
//! drops it when stale, and otherwise arms injection and ignition through
//! the angle scheduler (or directly through the drivers when only partial
//! sync is available). Results are published through [`SeqLock`]s so any
//! reader can copy them without blocking either task.

#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]

use core::cell::Cell;
use core::fmt;

use libm::roundf;

use crate::CYLINDER_COUNT;
use crate::calibration::Calibration;
use crate::decoder::SyncState;
use crate::safety::SafetyTrip;
use crate::sync::SeqLock;
use crate::tables::{FuelMaps, MapCaches};
use crate::timing::OperatingPoint;

pub mod executor;
pub mod perf;
pub mod planner;
pub mod ring;

pub use executor::{CycleOutcome, ExecContext, ExecPath, Executor};
pub use perf::{PerfStats, PerfSummary};
pub use planner::{PlanContext, Planner};
pub use ring::PlanRing;

/// Commands the ring can hold before the oldest is overwritten.
pub const PLAN_RING_CAPACITY: usize = 16;
pub const PLANNER_DEADLINE_US: u32 = 700;
pub const MAX_PLAN_AGE_US: u32 = 3_000;
/// Bounded wait of both pipeline tasks on their wake signal.
pub const WAKE_TIMEOUT_MS: u64 = 50;
/// Minimum spacing between two fuel map saves.
pub const MAP_SAVE_INTERVAL_MS: u64 = 5_000;

pub type CommandRing = PlanRing<EngineCommand, PLAN_RING_CAPACITY>;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    pub planner_deadline_us: u32,
    pub max_plan_age_us: u32,
    pub wake_timeout_ms: u64,
    /// Crank angle of each cylinder's compression TDC in the 720° cycle.
    pub cylinder_tdc_deg: [f32; CYLINDER_COUNT],
}

impl PipelineConfig {
    pub const fn new() -> Self {
        Self {
            planner_deadline_us: PLANNER_DEADLINE_US,
            max_plan_age_us: MAX_PLAN_AGE_US,
            wake_timeout_ms: WAKE_TIMEOUT_MS,
            cylinder_tdc_deg: [0.0, 180.0, 360.0, 540.0],
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// One planning decision. Immutable once pushed into the ring.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct EngineCommand {
    pub rpm: u16,
    /// Manifold pressure in 0.1 kPa.
    pub load: u16,
    pub advance_x10: u16,
    pub pulsewidth_us: u32,
    pub fuel_cut: bool,
    pub limp: bool,
    pub eoi_boundary: f32,
    pub eoi_normal_used: f32,
    pub eoi_target_deg: f32,
    pub eoi_fallback_deg: f32,
    pub map_mode_enabled: bool,
    /// Battery voltage for the dwell calculation, already temperature biased.
    pub dwell_vbat_dv: u16,
    /// Battery voltage and coolant temperature the actuator latency is
    /// compensated for.
    pub operating_point: OperatingPoint,
    pub sync: SyncState,
    pub planned_at_us: u32,
}

/// Latest applied command, as seen by diagnostics and the engine API.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RuntimeState {
    pub rpm: u16,
    pub load: u16,
    pub advance_x10: u16,
    pub pulsewidth_us: u32,
    pub limp: bool,
    pub fuel_cut: bool,
    pub valid: bool,
}

impl RuntimeState {
    pub const EMPTY: Self = Self {
        rpm: 0,
        load: 0,
        advance_x10: 0,
        pulsewidth_us: 0,
        limp: false,
        fuel_cut: false,
        valid: false,
    };

    pub fn from_command(command: &EngineCommand) -> Self {
        Self {
            rpm: command.rpm,
            load: command.load,
            advance_x10: command.advance_x10,
            pulsewidth_us: command.pulsewidth_us,
            limp: command.limp,
            fuel_cut: command.fuel_cut,
            valid: true,
        }
    }
}

/// What the Executor did with the last command.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct InjectionDiag {
    pub rpm: u16,
    pub load: u16,
    pub boundary: f32,
    pub normal_used: f32,
    pub eoi_target_deg: f32,
    pub eoi_fallback_deg: f32,
    pub pulsewidth_us: u32,
    pub sync_acquired: bool,
    pub map_mode_enabled: bool,
    pub soi_deg: [f32; CYLINDER_COUNT],
    pub delay_us: [u32; CYLINDER_COUNT],
    /// Channels that could not be armed this cycle.
    pub failures: u8,
    pub updated_at_us: u32,
}

impl InjectionDiag {
    pub const EMPTY: Self = Self {
        rpm: 0,
        load: 0,
        boundary: 0.0,
        normal_used: 0.0,
        eoi_target_deg: 0.0,
        eoi_fallback_deg: 0.0,
        pulsewidth_us: 0,
        sync_acquired: false,
        map_mode_enabled: false,
        soi_deg: [0.0; CYLINDER_COUNT],
        delay_us: [0; CYLINDER_COUNT],
        failures: 0,
        updated_at_us: 0,
    };

    pub fn from_command(command: &EngineCommand, sync_acquired: bool) -> Self {
        Self {
            rpm: command.rpm,
            load: command.load,
            boundary: command.eoi_boundary,
            normal_used: command.eoi_normal_used,
            eoi_target_deg: command.eoi_target_deg,
            eoi_fallback_deg: command.eoi_fallback_deg,
            pulsewidth_us: command.pulsewidth_us,
            sync_acquired,
            map_mode_enabled: command.map_mode_enabled,
            ..Self::EMPTY
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PlanError {
    SyncLost,
    SensorUnavailable,
    SafetyTrip(SafetyTrip),
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Seqlock publications written by the Executor.
pub struct PipelineOutputs {
    pub runtime: SeqLock<RuntimeState>,
    pub diag: SeqLock<InjectionDiag>,
}

impl PipelineOutputs {
    pub const fn new() -> Self {
        Self {
            runtime: SeqLock::new(RuntimeState::EMPTY),
            diag: SeqLock::new(InjectionDiag::EMPTY),
        }
    }

    /// Latest runtime state, if one was ever published.
    pub fn runtime_state(&self) -> Option<RuntimeState> {
        self.runtime.read().filter(|state| state.valid)
    }

    pub fn injection_diag(&self) -> Option<InjectionDiag> {
        self.diag.read().filter(|diag| diag.updated_at_us != 0)
    }
}

impl Default for PipelineOutputs {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic time source shared by the pipeline tasks.
pub trait Clock {
    /// Microseconds on the same wrapping clock the decoder captures with.
    fn now_us(&self) -> u32;
    fn now_ms(&self) -> u64;
}

/// Clock advanced by hand, for host runs and tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    micros: Cell<u64>,
}

impl ManualClock {
    pub const fn new(start_us: u64) -> Self {
        Self {
            micros: Cell::new(start_us),
        }
    }

    pub fn set_us(&self, micros: u64) {
        self.micros.set(micros);
    }

    pub fn advance_us(&self, micros: u64) {
        self.micros.set(self.micros.get().saturating_add(micros));
    }

    pub fn advance_ms(&self, millis: u64) {
        self.advance_us(millis.saturating_mul(1_000));
    }

    pub fn micros(&self) -> u64 {
        self.micros.get()
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u32 {
        self.micros.get() as u32
    }

    fn now_ms(&self) -> u64 {
        self.micros.get() / 1_000
    }
}

/// Table values and calibration read by the Planner for one operating point.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MapLookup {
    pub ve_x10: u16,
    pub advance_x10: u16,
    pub lambda_x1000: u16,
    pub boundary: f32,
    pub normal_used: f32,
    pub fallback_normal: f32,
    pub map_mode_enabled: bool,
    pub closed_loop_enabled: bool,
}

/// Fuel maps and calibration behind the map lock.
///
/// Every method is one bounded table read or write; callers must never hold
/// the lock across a planning cycle or a store write.
pub struct MapBank {
    maps: FuelMaps,
    caches: MapCaches,
    calibration: Calibration,
    dirty: bool,
    version: u32,
    last_save_ms: u64,
}

impl MapBank {
    pub fn new(maps: FuelMaps, calibration: Calibration) -> Self {
        Self {
            maps,
            caches: MapCaches::new(),
            calibration,
            dirty: false,
            version: 0,
            last_save_ms: 0,
        }
    }

    pub fn lookup(&mut self, rpm: u16, load: u16) -> MapLookup {
        let calibration = &self.calibration;
        MapLookup {
            ve_x10: self.caches.ve.lookup(&self.maps.ve, rpm, load),
            advance_x10: self.caches.ignition.lookup(&self.maps.ignition, rpm, load),
            lambda_x1000: self.caches.lambda.lookup(&self.maps.lambda, rpm, load),
            boundary: calibration.eoi.boundary,
            normal_used: calibration.normal_for(rpm, load),
            fallback_normal: calibration.eoi.fallback_normal,
            map_mode_enabled: calibration.eoit_map.enabled,
            closed_loop_enabled: calibration.closed_loop_enabled,
        }
    }

    /// Scales the VE cell under the operating point by `1 + ltft`.
    pub fn fold_ltft(&mut self, rpm: u16, load: u16, ltft: f32) -> bool {
        if !ltft.is_finite() {
            return false;
        }
        let (load_index, rpm_index) = self.maps.ve.bins_for(rpm, load);
        let Some(current) = self.maps.ve.cell(load_index, rpm_index) else {
            return false;
        };
        let updated = roundf(f32::from(current) * (1.0 + ltft)).clamp(0.0, f32::from(u16::MAX)) as u16;
        if !self.maps.ve.set_cell(load_index, rpm_index, updated) {
            return false;
        }
        self.caches.ve.invalidate();
        self.mark_dirty();
        true
    }

    pub fn maps(&self) -> &FuelMaps {
        &self.maps
    }

    /// Installs new tables, e.g. written by a tuning tool, and schedules a save.
    pub fn replace_maps(&mut self, maps: FuelMaps) {
        self.maps = maps;
        self.caches = MapCaches::new();
        self.mark_dirty();
    }

    pub fn calibration(&self) -> Calibration {
        self.calibration
    }

    /// Swaps in calibration that has already been persisted.
    pub fn set_calibration(&mut self, calibration: Calibration) {
        self.calibration = calibration;
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
        self.version = self.version.wrapping_add(1);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Copy of the maps to persist, when dirty and the save interval elapsed.
    pub fn save_snapshot(&self, now_ms: u64, interval_ms: u64) -> Option<(FuelMaps, u32)> {
        if self.dirty && now_ms.saturating_sub(self.last_save_ms) >= interval_ms {
            Some((self.maps, self.version))
        } else {
            None
        }
    }

    /// Records a completed save. The dirty flag only clears when nothing
    /// changed since the snapshot was taken.
    pub fn mark_saved(&mut self, version: u32, now_ms: u64) {
        if self.version == version {
            self.dirty = false;
        }
        self.last_save_ms = now_ms;
    }
}

impl Default for MapBank {
    fn default() -> Self {
        Self::new(FuelMaps::new(), Calibration::new())
    }
}
