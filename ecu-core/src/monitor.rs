//! Low-rate monitor: periodic status snapshots and fuel-map persistence.
//!
//! Nothing here touches the actuators. The monitor only reads what the
//! pipeline already published and decides when each snapshot is due.

use crate::calibration::{CalibrationError, ConfigStore, save_fuel_maps};
use crate::decoder::SyncState;
use crate::fuel::{FuelConfig, fuel_enrichment_pct};
use crate::pipeline::{InjectionDiag, MAP_SAVE_INTERVAL_MS, MapBank, PerfSummary, RuntimeState};
use crate::safety::LimpState;
use crate::sensors::{SensorFaults, SensorSnapshot};
use crate::sync::Shared;
use crate::timing::JitterStats;

pub const STATUS_INTERVAL_MS: u64 = 100;
pub const SENSOR_INTERVAL_MS: u64 = 100;
pub const DIAGNOSTIC_INTERVAL_MS: u64 = 1_000;

/// Diagnostic error bit raised while limp mode is active.
pub const DIAG_ERR_LIMP: u8 = 1 << 0;
/// Diagnostic error bit raised while the crank position is not trusted.
pub const DIAG_ERR_SYNC: u8 = 1 << 1;
/// Diagnostic error bit raised while any sensor reports a fault.
pub const DIAG_ERR_SENSOR: u8 = 1 << 2;
/// Diagnostic error bit raised when the last applied command had failures.
pub const DIAG_ERR_SCHEDULE: u8 = 1 << 3;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MonitorConfig {
    pub status_interval_ms: u64,
    pub sensor_interval_ms: u64,
    pub diagnostic_interval_ms: u64,
    pub map_save_interval_ms: u64,
}

impl MonitorConfig {
    pub const fn new() -> Self {
        Self {
            status_interval_ms: STATUS_INTERVAL_MS,
            sensor_interval_ms: SENSOR_INTERVAL_MS,
            diagnostic_interval_ms: DIAGNOSTIC_INTERVAL_MS,
            map_save_interval_ms: MAP_SAVE_INTERVAL_MS,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Engine status at 10 Hz.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct EngineStatus {
    pub rpm: u16,
    pub load: u16,
    pub advance_x10: u16,
    pub pulsewidth_us: u32,
    pub fuel_enrichment_pct: u16,
    pub clt_c: i16,
    pub iat_c: i16,
    pub tps_pct10: u16,
    pub vbat_dv: u16,
    pub limp: bool,
    pub timestamp_ms: u64,
}

/// Filtered sensor values at 10 Hz.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SensorData {
    pub map_kpa10: u16,
    pub tps_pct10: u16,
    pub o2_mv: u16,
    pub faults: SensorFaults,
    pub timestamp_ms: u64,
}

/// Health summary at 1 Hz.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Diagnostic {
    pub uptime_ms: u64,
    pub tooth_index: u16,
    pub sync_acquired: bool,
    pub error_bits: u8,
    pub error_count: u8,
    pub limp_activations: u32,
    pub safety_trips: u32,
    pub planner_p99_us: u32,
    pub executor_p99_us: u32,
    pub stale_drops: u32,
    pub queue_overruns: u32,
    pub map_version: u32,
    pub map_dirty: bool,
    /// Output release error against the compare target.
    pub jitter: JitterStats,
}

/// Everything the monitor reads for one poll.
#[derive(Copy, Clone, Debug)]
pub struct MonitorInputs {
    pub runtime: Option<RuntimeState>,
    pub sensors: Option<SensorSnapshot>,
    pub sync: SyncState,
    pub limp: LimpState,
    pub limp_activations: u32,
    pub safety_trips: u32,
    pub perf: PerfSummary,
    pub diag: Option<InjectionDiag>,
    pub map_version: u32,
    pub map_dirty: bool,
    pub jitter: JitterStats,
}

/// Snapshots that fell due in one poll.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MonitorReport {
    pub status: Option<EngineStatus>,
    pub sensors: Option<SensorData>,
    pub diagnostic: Option<Diagnostic>,
}

impl MonitorReport {
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.sensors.is_none() && self.diagnostic.is_none()
    }
}

pub struct Monitor {
    config: MonitorConfig,
    fuel: FuelConfig,
    last_status_ms: Option<u64>,
    last_sensor_ms: Option<u64>,
    last_diagnostic_ms: Option<u64>,
    saves: u32,
    save_failures: u32,
}

impl Monitor {
    pub const fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            fuel: FuelConfig::new(),
            last_status_ms: None,
            last_sensor_ms: None,
            last_diagnostic_ms: None,
            saves: 0,
            save_failures: 0,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn saves(&self) -> u32 {
        self.saves
    }

    pub fn save_failures(&self) -> u32 {
        self.save_failures
    }

    /// Builds whichever snapshots are due at `now_ms`.
    pub fn poll(&mut self, inputs: &MonitorInputs, now_ms: u64) -> MonitorReport {
        let mut report = MonitorReport::default();
        let sensors = inputs.sensors.unwrap_or(SensorSnapshot::EMPTY);

        if due(&mut self.last_status_ms, self.config.status_interval_ms, now_ms) {
            let runtime = inputs.runtime.unwrap_or(RuntimeState::EMPTY);
            report.status = Some(EngineStatus {
                rpm: runtime.rpm,
                load: runtime.load,
                advance_x10: runtime.advance_x10,
                pulsewidth_us: runtime.pulsewidth_us,
                fuel_enrichment_pct: fuel_enrichment_pct(&self.fuel, runtime.pulsewidth_us),
                clt_c: sensors.clt_c,
                iat_c: sensors.iat_c,
                tps_pct10: sensors.tps_pct10,
                vbat_dv: sensors.vbat_dv,
                limp: inputs.limp.active,
                timestamp_ms: now_ms,
            });
        }

        if due(&mut self.last_sensor_ms, self.config.sensor_interval_ms, now_ms) {
            report.sensors = Some(SensorData {
                map_kpa10: sensors.map_kpa10,
                tps_pct10: sensors.tps_pct10,
                o2_mv: sensors.o2_mv,
                faults: sensors.faults,
                timestamp_ms: now_ms,
            });
        }

        if due(&mut self.last_diagnostic_ms, self.config.diagnostic_interval_ms, now_ms) {
            let mut error_bits = 0;
            if inputs.limp.active {
                error_bits |= DIAG_ERR_LIMP;
            }
            if !inputs.sync.sync_valid {
                error_bits |= DIAG_ERR_SYNC;
            }
            if !sensors.faults.is_empty() {
                error_bits |= DIAG_ERR_SENSOR;
            }
            if inputs.diag.is_some_and(|diag| diag.failures > 0) {
                error_bits |= DIAG_ERR_SCHEDULE;
            }
            report.diagnostic = Some(Diagnostic {
                uptime_ms: now_ms,
                tooth_index: inputs.sync.tooth_index,
                sync_acquired: inputs.sync.sync_acquired,
                error_bits,
                error_count: u8::try_from(error_bits.count_ones()).unwrap_or(u8::MAX),
                limp_activations: inputs.limp_activations,
                safety_trips: inputs.safety_trips,
                planner_p99_us: inputs.perf.planner.p99_us,
                executor_p99_us: inputs.perf.executor.p99_us,
                stale_drops: inputs.perf.stale_drops,
                queue_overruns: inputs.perf.queue_overruns,
                map_version: inputs.map_version,
                map_dirty: inputs.map_dirty,
                jitter: inputs.jitter,
            });
        }

        report
    }

    /// Writes the fuel maps when dirty and the save interval elapsed.
    ///
    /// The map lock is only held to copy the tables and to record the save;
    /// the store write itself runs unlocked. Returns the persisted version.
    pub fn persist_maps<S: ConfigStore + ?Sized>(
        &mut self,
        bank: &Shared<MapBank>,
        store: &mut S,
        now_ms: u64,
    ) -> Result<Option<u32>, CalibrationError> {
        let interval = self.config.map_save_interval_ms;
        let Some((maps, version)) = bank.lock(|bank| bank.save_snapshot(now_ms, interval)) else {
            return Ok(None);
        };
        if let Err(err) = save_fuel_maps(store, &maps) {
            self.save_failures = self.save_failures.wrapping_add(1);
            return Err(err);
        }
        bank.lock(|bank| bank.mark_saved(version, now_ms));
        self.saves = self.saves.wrapping_add(1);
        Ok(Some(version))
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new(MonitorConfig::new())
    }
}

fn due(last: &mut Option<u64>, interval_ms: u64, now_ms: u64) -> bool {
    if let Some(previous) = *last
        && now_ms.saturating_sub(previous) < interval_ms
    {
        return false;
    }
    *last = Some(now_ms);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{Calibration, LoadOutcome, MemoryConfigStore, load_fuel_maps};
    use crate::pipeline::PerfStats;
    use crate::safety::LimpOverrides;
    use crate::tables::FuelMaps;

    fn inputs() -> MonitorInputs {
        MonitorInputs {
            runtime: Some(RuntimeState {
                rpm: 3_000,
                load: 1_000,
                advance_x10: 150,
                pulsewidth_us: 7_730,
                limp: false,
                fuel_cut: false,
                valid: true,
            }),
            sensors: Some(SensorSnapshot {
                map_kpa10: 1_000,
                tps_pct10: 250,
                clt_c: 85,
                iat_c: 30,
                o2_mv: 450,
                vbat_dv: 138,
                knock: false,
                faults: SensorFaults::NONE,
                timestamp_ms: 0,
            }),
            sync: SyncState {
                tooth_index: 12,
                sync_valid: true,
                sync_acquired: true,
                ..SyncState::default()
            },
            limp: LimpState {
                active: false,
                activated_at_ms: 0,
                overrides: LimpOverrides::new(),
            },
            limp_activations: 0,
            safety_trips: 0,
            perf: PerfStats::default().summary(),
            diag: None,
            map_version: 0,
            map_dirty: false,
            jitter: JitterStats::default(),
        }
    }

    #[test]
    fn snapshots_follow_their_cadence() {
        let mut monitor = Monitor::default();
        let inputs = inputs();

        let first = monitor.poll(&inputs, 0);
        assert!(first.status.is_some());
        assert!(first.sensors.is_some());
        assert!(first.diagnostic.is_some());

        assert!(monitor.poll(&inputs, 50).is_empty());

        let second = monitor.poll(&inputs, 100);
        assert!(second.status.is_some());
        assert!(second.sensors.is_some());
        assert!(second.diagnostic.is_none());

        let mut diagnostics = 0;
        for now in (200..=1_000).step_by(100) {
            if monitor.poll(&inputs, now).diagnostic.is_some() {
                diagnostics += 1;
            }
        }
        assert_eq!(diagnostics, 1);
    }

    #[test]
    fn status_derives_from_runtime_and_sensors() {
        let mut monitor = Monitor::default();
        let status = monitor.poll(&inputs(), 10).status.expect("status due");
        assert_eq!(status.rpm, 3_000);
        assert_eq!(status.fuel_enrichment_pct, 100);
        assert_eq!(status.clt_c, 85);
        assert_eq!(status.vbat_dv, 138);
        assert!(!status.limp);
        assert_eq!(status.timestamp_ms, 10);
    }

    #[test]
    fn diagnostic_flags_limp_and_lost_sync() {
        let mut monitor = Monitor::default();
        let mut inputs = inputs();
        inputs.limp.active = true;
        inputs.sync.sync_valid = false;
        inputs.limp_activations = 2;

        let diagnostic = monitor.poll(&inputs, 0).diagnostic.expect("diagnostic due");
        assert_eq!(diagnostic.error_bits, DIAG_ERR_LIMP | DIAG_ERR_SYNC);
        assert_eq!(diagnostic.error_count, 2);
        assert_eq!(diagnostic.limp_activations, 2);
        assert_eq!(diagnostic.tooth_index, 12);
    }

    #[test]
    fn diagnostic_reports_fire_jitter() {
        let mut monitor = Monitor::default();
        let mut inputs = inputs();
        inputs.jitter = JitterStats {
            samples: 40,
            last_us: 3,
            min_us: 1,
            max_us: 9,
            avg_us: 4,
        };
        let diagnostic = monitor.poll(&inputs, 0).diagnostic.expect("diagnostic due");
        assert_eq!(diagnostic.jitter, inputs.jitter);
    }

    #[test]
    fn missing_publications_report_zeroes() {
        let mut monitor = Monitor::default();
        let mut inputs = inputs();
        inputs.runtime = None;
        inputs.sensors = None;

        let report = monitor.poll(&inputs, 0);
        let status = report.status.expect("status due");
        assert_eq!(status.rpm, 0);
        assert_eq!(status.fuel_enrichment_pct, 0);
        assert_eq!(report.sensors.expect("sensors due").map_kpa10, 0);
    }

    #[test]
    fn maps_persist_only_when_dirty_and_due() {
        let bank = Shared::new(MapBank::new(FuelMaps::new(), Calibration::new()));
        let mut store = MemoryConfigStore::new();
        let mut monitor = Monitor::default();

        assert_eq!(monitor.persist_maps(&bank, &mut store, 10_000), Ok(None));

        bank.lock(|bank| bank.fold_ltft(3_000, 1_000, 0.05));
        assert_eq!(monitor.persist_maps(&bank, &mut store, 10_000), Ok(Some(1)));
        assert!(!bank.lock(|bank| bank.is_dirty()));

        let (maps, outcome) = load_fuel_maps(&mut store);
        assert_eq!(outcome, LoadOutcome::Loaded);
        let current = bank.lock(|bank| *bank.maps());
        assert_eq!(maps, current);

        bank.lock(|bank| bank.fold_ltft(3_000, 1_000, 0.05));
        assert_eq!(monitor.persist_maps(&bank, &mut store, 12_000), Ok(None));
        assert_eq!(monitor.persist_maps(&bank, &mut store, 15_000), Ok(Some(2)));
        assert_eq!(monitor.saves(), 2);
    }

    #[test]
    fn failed_save_keeps_maps_dirty() {
        let bank = Shared::new(MapBank::new(FuelMaps::new(), Calibration::new()));
        let mut store = MemoryConfigStore::new();
        store.set_fail_saves(true);
        let mut monitor = Monitor::default();

        bank.lock(|bank| bank.fold_ltft(3_000, 1_000, 0.05));
        assert!(monitor.persist_maps(&bank, &mut store, 10_000).is_err());
        assert!(bank.lock(|bank| bank.is_dirty()));
        assert_eq!(monitor.save_failures(), 1);

        store.set_fail_saves(false);
        assert_eq!(monitor.persist_maps(&bank, &mut store, 10_010), Ok(Some(1)));
    }
}
