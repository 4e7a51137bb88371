mod support;

use ecu_core::calibration::{
    CalibrationError, ConfigStore, EOI_CONFIG_KEY, FUEL_MAPS_KEY, LoadOutcome, MemoryConfigStore, StoreError,
};
use ecu_core::drivers::{IgnitionDriver, InjectionDriver, SimCompareUnit};
use ecu_core::engine::EngineError;
use ecu_core::monitor::Monitor;
use ecu_core::pipeline::ManualClock;
use ecu_core::tables::FuelMaps;
use ecu_core::telemetry::{TelemetryEventKind, TelemetryPayload};

use support::SimEngine;

fn fresh_engine() -> SimEngine {
    SimEngine::new(
        InjectionDriver::new(SimCompareUnit::new()),
        IgnitionDriver::new(SimCompareUnit::new()),
    )
}

fn tuned_maps() -> FuelMaps {
    let mut maps = FuelMaps::new();
    assert!(maps.ve.set_cell(4, 7, 1_234));
    assert!(maps.ignition.set_cell(2, 3, 222));
    maps
}

#[test]
fn replaced_maps_survive_a_restart() {
    let mut store = MemoryConfigStore::new();
    let first = fresh_engine();
    let report = first.init(&mut store, 0).expect("init");
    assert_eq!(report.fuel_maps, LoadOutcome::Defaulted);

    first.replace_maps(tuned_maps()).expect("initialised");
    let mut monitor = Monitor::default();
    let clock = ManualClock::new(0);
    clock.advance_ms(5_000);
    first.monitor(&mut monitor, &mut store, &clock).expect("initialised");
    assert_eq!(monitor.saves(), 1);
    let persisted = first.with_telemetry(|telemetry| telemetry.latest().map(|record| record.details));
    assert_eq!(
        persisted,
        Some(TelemetryPayload::Persist {
            version: first.map_version()
        })
    );

    let second = fresh_engine();
    let report = second.init(&mut store, 0).expect("init");
    assert_eq!(report.fuel_maps, LoadOutcome::Loaded);
    assert!(!report.repaired());
    assert_eq!(second.fuel_maps().expect("initialised"), tuned_maps());
}

#[test]
fn maps_are_not_saved_before_the_interval() {
    let mut store = MemoryConfigStore::new();
    let engine = fresh_engine();
    engine.init(&mut store, 0).expect("init");
    engine.replace_maps(tuned_maps()).expect("initialised");

    let mut monitor = Monitor::default();
    let clock = ManualClock::new(0);
    clock.advance_ms(1_000);
    engine.monitor(&mut monitor, &mut store, &clock).expect("initialised");
    assert_eq!(monitor.saves(), 0);

    let (maps, outcome) = ecu_core::calibration::load_fuel_maps(&mut store);
    assert_eq!(outcome, LoadOutcome::Loaded);
    assert_eq!(maps, FuelMaps::new());
}

#[test]
fn corrupt_records_are_repaired_at_init() {
    let mut store = MemoryConfigStore::new();
    store.save(EOI_CONFIG_KEY, &[1, 2, 3]).expect("save");
    store.save(FUEL_MAPS_KEY, &[0xFF; 16]).expect("save");

    let engine = fresh_engine();
    let report = engine.init(&mut store, 42).expect("init");
    assert!(report.repaired());
    assert_eq!(report.fuel_maps, LoadOutcome::Defaulted);
    assert_eq!(report.calibration.eoi, LoadOutcome::Defaulted);
    assert_eq!(engine.fuel_maps().expect("initialised"), FuelMaps::new());
    let (target, fallback) = engine.eoi_config().expect("initialised");
    assert!(target.is_finite() && fallback.is_finite());

    let recorded = engine.with_telemetry(|telemetry| {
        telemetry
            .oldest_first()
            .any(|record| record.event == TelemetryEventKind::CalibrationRepaired)
    });
    assert!(recorded);

    let again = fresh_engine();
    let report = again.init(&mut store, 0).expect("init");
    assert!(!report.repaired());
}

#[test]
fn calibration_edits_survive_reinit() {
    let mut store = MemoryConfigStore::new();
    let engine = fresh_engine();
    engine.init(&mut store, 0).expect("init");
    engine
        .set_eoit_calibration(&mut store, 7.0, 4.5, 5.0)
        .expect("saved");
    engine.set_eoit_map_enabled(&mut store, true).expect("saved");
    engine.set_eoit_map_cell(&mut store, 3, 5, 6.25).expect("saved");
    engine.set_closed_loop_enabled(&mut store, false).expect("saved");

    engine.deinit().expect("deinit");
    assert_eq!(engine.eoi_config(), Err(EngineError::NotInitialized));
    let report = engine.init(&mut store, 0).expect("init");
    assert!(!report.repaired());

    let eoi = engine.eoit_calibration().expect("initialised");
    assert!(libm::fabsf(eoi.boundary - 7.0) < 0.01);
    assert!(libm::fabsf(eoi.normal - 4.5) < 0.01);
    assert!(libm::fabsf(eoi.fallback_normal - 5.0) < 0.01);
    assert_eq!(engine.eoit_map_enabled(), Ok(true));
    let cell = engine.eoit_map_cell(3, 5).expect("in range");
    assert!(libm::fabsf(cell - 6.25) < 0.01);
    assert_eq!(engine.closed_loop_enabled(), Ok(false));
}

#[test]
fn failed_save_leaves_calibration_unchanged() {
    let mut store = MemoryConfigStore::new();
    let engine = fresh_engine();
    engine.init(&mut store, 0).expect("init");
    let before = engine.eoit_calibration().expect("initialised");

    store.set_fail_saves(true);
    assert_eq!(
        engine.set_eoit_calibration(&mut store, 9.0, 1.0, 1.0),
        Err(EngineError::Calibration(CalibrationError::Store(StoreError::Io)))
    );
    assert_eq!(engine.eoit_calibration(), Ok(before));
    assert_eq!(
        engine.set_closed_loop_enabled(&mut store, false),
        Err(EngineError::Calibration(CalibrationError::Store(StoreError::Io)))
    );
    assert_eq!(engine.closed_loop_enabled(), Ok(true));
}

#[test]
fn failed_map_save_is_retried() {
    let mut store = MemoryConfigStore::new();
    let engine = fresh_engine();
    engine.init(&mut store, 0).expect("init");
    engine.replace_maps(tuned_maps()).expect("initialised");

    let mut monitor = Monitor::default();
    let clock = ManualClock::new(0);
    clock.advance_ms(5_000);
    store.set_fail_saves(true);
    engine.monitor(&mut monitor, &mut store, &clock).expect("initialised");
    assert_eq!(monitor.save_failures(), 1);

    store.set_fail_saves(false);
    clock.advance_ms(100);
    engine.monitor(&mut monitor, &mut store, &clock).expect("initialised");
    assert_eq!(monitor.saves(), 1);

    let (maps, outcome) = ecu_core::calibration::load_fuel_maps(&mut store);
    assert_eq!(outcome, LoadOutcome::Loaded);
    assert_eq!(maps, tuned_maps());
}

#[test]
fn out_of_range_map_cell_is_rejected() {
    let mut store = MemoryConfigStore::new();
    let engine = fresh_engine();
    engine.init(&mut store, 0).expect("init");
    assert_eq!(
        engine.eoit_map_cell(16, 0),
        Err(EngineError::Calibration(CalibrationError::IndexOutOfRange))
    );
    assert_eq!(
        engine.set_eoit_map_cell(&mut store, 0, 16, 5.0),
        Err(EngineError::Calibration(CalibrationError::IndexOutOfRange))
    );
}
