mod support;

use ecu_core::calibration::{LoadOutcome, load_fuel_maps};
use ecu_core::monitor::Monitor;
use ecu_core::pipeline::{CycleOutcome, ExecPath};
use ecu_core::safety::SafetyTrip;
use ecu_core::sensors::WidebandReading;
use ecu_core::tables::FuelMaps;
use ecu_core::telemetry::{TelemetryEventKind, TelemetryPayload};

use support::Rig;

fn injection_channels(rig: &Rig) -> [bool; 4] {
    rig.engine.with_actuators(|actuators| {
        let mut seen = [false; 4];
        for record in actuators.injection.unit().records() {
            seen[usize::from(record.channel)] = true;
        }
        seen
    })
}

fn recorded(rig: &Rig, event: TelemetryEventKind) -> bool {
    rig.engine
        .with_telemetry(|telemetry| telemetry.oldest_first().any(|record| record.event == event))
}

/// Open duration of the newest pulse armed on injector `channel`.
fn last_pulse_us(rig: &Rig, channel: u8) -> Option<u32> {
    rig.engine.with_actuators(|actuators| {
        actuators
            .injection
            .unit()
            .records()
            .iter()
            .rev()
            .find(|record| record.channel == channel)
            .map(|record| record.release_at.wrapping_sub(record.assert_at))
    })
}

fn synced_rig(vbat_dv: u16) -> Rig {
    let mut rig = Rig::new();
    rig.sensors.vbat_dv = vbat_dv;
    for _ in 0..4 {
        rig.revolution(true);
        assert_eq!(rig.cycle(), Some(CycleOutcome::Applied(ExecPath::Sequential)));
    }
    rig.revolution(true);
    rig
}

#[test]
fn full_sync_schedules_sequential_injection_and_ignition() {
    let mut rig = Rig::new();
    rig.revolution(true);

    assert_eq!(rig.cycle(), Some(CycleOutcome::Applied(ExecPath::Sequential)));
    let diag = rig.engine.injection_diag().expect("diag published");
    assert!(diag.sync_acquired);
    assert_eq!(diag.rpm, 1_000);
    assert_eq!(diag.failures, 0);
    for cylinder in 1..4 {
        assert!(diag.soi_deg[cylinder] != diag.soi_deg[0]);
    }
    let pending = rig.engine.with_actuators(|actuators| actuators.scheduler.pending_count());
    assert_eq!(pending, 8);

    for _ in 0..4 {
        rig.revolution(true);
        assert_eq!(rig.cycle(), Some(CycleOutcome::Applied(ExecPath::Sequential)));
    }
    assert_eq!(injection_channels(&rig), [true; 4]);
    let failures = rig.engine.with_actuators(|actuators| actuators.scheduler.fire_failures());
    assert_eq!(failures, 0);
    assert!(!rig.engine.is_limp_mode());
    assert!(recorded(&rig, TelemetryEventKind::SyncAcquired));
}

#[test]
fn missing_cam_falls_back_to_semi_sequential() {
    let mut rig = Rig::new();
    rig.revolution(false);
    rig.revolution(false);

    assert_eq!(rig.cycle(), Some(CycleOutcome::Applied(ExecPath::SemiSequential)));
    let diag = rig.engine.injection_diag().expect("diag published");
    assert!(!diag.sync_acquired);
    assert_eq!(diag.failures, 0);
    assert_eq!(diag.soi_deg[0], diag.soi_deg[3]);
    assert_eq!(diag.soi_deg[1], diag.soi_deg[2]);

    let (injection, ignition) = rig.engine.with_actuators(|actuators| {
        (
            actuators.injection.unit().records().to_vec(),
            actuators.ignition.unit().records().to_vec(),
        )
    });
    assert_eq!(injection.len(), 4);
    assert_eq!(ignition.len(), 4);
    let start = |channel: u8| {
        injection
            .iter()
            .find(|record| record.channel == channel)
            .map(|record| record.assert_at)
    };
    assert_eq!(start(0), start(3));
    assert_eq!(start(1), start(2));
    assert!(start(0) != start(1));

    let pending = rig.engine.with_actuators(|actuators| actuators.scheduler.pending_count());
    assert_eq!(pending, 0);
    assert!(!rig.engine.is_limp_mode());
}

#[test]
fn cam_lost_after_sync_drops_to_semi_sequential() {
    let mut rig = Rig::new();
    rig.revolution(true);
    assert_eq!(rig.cycle(), Some(CycleOutcome::Applied(ExecPath::Sequential)));

    // One silent gap is the normal second revolution of the cycle.
    rig.revolution(false);
    assert_eq!(rig.cycle(), Some(CycleOutcome::Applied(ExecPath::Sequential)));

    rig.revolution(false);
    assert_eq!(rig.cycle(), Some(CycleOutcome::Applied(ExecPath::SemiSequential)));
    assert!(!rig.engine.sync_data(rig.now_us()).sync_acquired);
    assert!(!rig.engine.injection_diag().expect("diag published").sync_acquired);
    assert!(recorded(&rig, TelemetryEventKind::SyncLost));
    let pending = rig.engine.with_actuators(|actuators| actuators.scheduler.pending_count());
    assert_eq!(pending, 0);

    for _ in 0..10 {
        rig.revolution(false);
        assert_eq!(rig.cycle(), Some(CycleOutcome::Applied(ExecPath::SemiSequential)));
    }

    rig.revolution(true);
    rig.revolution(true);
    assert_eq!(rig.cycle(), Some(CycleOutcome::Applied(ExecPath::Sequential)));
}

#[test]
fn low_battery_lengthens_armed_injector_pulse() {
    let nominal = synced_rig(138);
    let low = synced_rig(100);

    let point = low.engine.with_actuators(|actuators| actuators.hp.operating_point());
    assert!((point.battery_voltage - 10.0).abs() < f32::EPSILON);
    assert!((point.temperature_c - 85.0).abs() < f32::EPSILON);

    let runtime = |rig: &Rig| rig.engine.runtime_state().expect("runtime published").pulsewidth_us;
    assert_eq!(runtime(&nominal), runtime(&low));

    let nominal_pulse = last_pulse_us(&nominal, 0).expect("cylinder 0 armed");
    let low_pulse = last_pulse_us(&low, 0).expect("cylinder 0 armed");
    // 50 µs base latency: ×0.91×1.06 at 13.8 V, ×1.1×1.06 at 10 V, both at 85 °C.
    assert_eq!(nominal_pulse, runtime(&nominal) + 48);
    assert_eq!(low_pulse, runtime(&low) + 58);
}

#[test]
fn lean_wideband_reading_enriches_applied_pulse() {
    let mut rig = Rig::new();
    rig.run_for_ms(300, true);
    let open_loop = rig.engine.runtime_state().expect("runtime published").pulsewidth_us;
    assert_eq!(open_loop, 7_730);

    rig.engine.publish_wideband(Some(WidebandReading {
        lambda: 1.10,
        age_ms: 20,
    }));
    rig.revolution(true);
    assert_eq!(rig.cycle(), Some(CycleOutcome::Applied(ExecPath::Sequential)));
    let trimmed = rig.engine.runtime_state().expect("runtime published").pulsewidth_us;
    assert!(trimmed > open_loop, "{trimmed}");
    assert_eq!(rig.engine.injection_diag().expect("diag published").pulsewidth_us, trimmed);
    assert!(rig.planner.trim().stft() > 0.0);

    rig.engine.publish_wideband(Some(WidebandReading {
        lambda: 0.90,
        age_ms: 20,
    }));
    for _ in 0..5 {
        rig.revolution(true);
        rig.cycle();
    }
    let rich = rig.engine.runtime_state().expect("runtime published").pulsewidth_us;
    assert!(rich < open_loop, "{rich}");
}

#[test]
fn steady_trim_folds_into_maps_and_persists() {
    let mut rig = Rig::new();
    rig.engine.publish_wideband(Some(WidebandReading {
        lambda: 1.20,
        age_ms: 20,
    }));
    rig.run_for_ms(6_000, true);
    assert!(rig.planner.trim().folds() > 0);
    assert!(rig.engine.map_version() > 0);

    let mut monitor = Monitor::default();
    let report = rig
        .engine
        .monitor(&mut monitor, &mut rig.store, &rig.clock)
        .expect("initialised");
    assert!(report.diagnostic.is_some_and(|diagnostic| !diagnostic.map_dirty));
    assert!(recorded(&rig, TelemetryEventKind::MapsPersisted));

    let (stored, outcome) = load_fuel_maps(&mut rig.store);
    assert_eq!(outcome, LoadOutcome::Loaded);
    assert_eq!(stored, rig.engine.fuel_maps().expect("initialised"));
    assert!(stored.ve != FuelMaps::new().ve);
}

#[test]
fn knock_samples_retard_applied_advance() {
    let mut rig = Rig::new();
    rig.run_for_ms(200, true);
    assert_eq!(rig.engine.runtime_state().expect("runtime published").advance_x10, 150);

    rig.sensors.knock = true;
    for _ in 0..2 {
        rig.revolution(true);
        rig.cycle();
    }
    assert_eq!(rig.engine.runtime_state().expect("runtime published").advance_x10, 130);

    rig.sensors.knock = false;
    rig.revolution(true);
    rig.cycle();
    assert_eq!(rig.engine.runtime_state().expect("runtime published").advance_x10, 135);
}

#[test]
fn fire_jitter_reaches_the_diagnostic() {
    let mut rig = Rig::new();
    rig.revolution(true);
    rig.cycle();
    rig.engine.with_actuators(|actuators| {
        actuators.hp.record_jitter(10_000, 10_004);
        actuators.hp.record_jitter(20_000, 19_998);
    });

    let mut monitor = Monitor::default();
    let diagnostic = rig
        .engine
        .monitor(&mut monitor, &mut rig.store, &rig.clock)
        .expect("initialised")
        .diagnostic
        .expect("first diagnostic is due");
    assert_eq!(diagnostic.jitter.samples, 2);
    assert_eq!(diagnostic.jitter.max_us, 4);
    assert_eq!(diagnostic.jitter.min_us, 2);
}

#[test]
fn implausible_map_reading_is_flagged() {
    let mut rig = Rig::new();
    rig.sensors.map_kpa10 = 150;
    rig.revolution(true);
    rig.cycle();

    let mut monitor = Monitor::default();
    let report = rig
        .engine
        .monitor(&mut monitor, &mut rig.store, &rig.clock)
        .expect("initialised");
    let sensors = report.sensors.expect("sensor data due");
    assert!(sensors.faults.contains(ecu_core::sensors::SensorFaults::MAP));
    let diagnostic = report.diagnostic.expect("diagnostic due");
    assert!(diagnostic.error_bits & ecu_core::monitor::DIAG_ERR_SENSOR != 0);
}

#[test]
fn cam_edge_upgrades_to_sequential() {
    let mut rig = Rig::new();
    rig.revolution(false);
    rig.revolution(false);
    assert_eq!(rig.cycle(), Some(CycleOutcome::Applied(ExecPath::SemiSequential)));

    rig.revolution(true);
    assert_eq!(rig.cycle(), Some(CycleOutcome::Applied(ExecPath::Sequential)));
    assert!(rig.engine.injection_diag().expect("diag published").sync_acquired);
}

#[test]
fn overheat_enters_limp_until_recovery_completes() {
    let mut rig = Rig::new();
    rig.run_for_ms(500, true);
    let runtime = rig.engine.runtime_state().expect("runtime published");
    assert!(!runtime.limp);
    assert_eq!(runtime.advance_x10, 150);

    rig.sensors.clt_c = 125;
    rig.revolution(true);
    assert_eq!(rig.cycle(), None);
    assert!(rig.engine.is_limp_mode());
    let trip = rig.engine.with_telemetry(|telemetry| {
        telemetry
            .oldest_first()
            .find(|record| record.event == TelemetryEventKind::SafetyTrip(SafetyTrip::Overheat))
            .map(|record| record.details)
    });
    assert_eq!(trip, Some(TelemetryPayload::Value(125)));
    assert!(recorded(&rig, TelemetryEventKind::LimpEntered));

    rig.sensors.clt_c = 85;
    rig.revolution(true);
    assert_eq!(rig.cycle(), Some(CycleOutcome::Applied(ExecPath::Sequential)));
    let runtime = rig.engine.runtime_state().expect("runtime published");
    assert!(runtime.limp);
    assert_eq!(runtime.advance_x10, 100);
    assert_eq!(runtime.pulsewidth_us, 6_184);
    let params = rig.engine.engine_parameters().expect("initialised");
    assert!(params.limp);
    assert_eq!(params.fuel_enrichment_pct, 80);

    // Minimum time in limp plus the recovery window: not yet.
    rig.run_for_ms(6_400, true);
    assert!(rig.engine.is_limp_mode());
    assert!(rig.engine.runtime_state().expect("runtime published").limp);

    rig.run_for_ms(800, true);
    assert!(!rig.engine.is_limp_mode());
    let runtime = rig.engine.runtime_state().expect("runtime published");
    assert!(!runtime.limp);
    assert_eq!(runtime.advance_x10, 150);
    assert!(recorded(&rig, TelemetryEventKind::LimpExited));
}

#[test]
fn limp_cuts_fuel_above_the_limp_rpm() {
    let mut rig = Rig::new();
    rig.run_for_ms(300, true);
    rig.sensors.clt_c = 125;
    rig.revolution(true);
    assert_eq!(rig.cycle(), None);
    rig.sensors.clt_c = 85;

    // 286 µs teeth: just under 3500 rpm, above the 3000 rpm limp limit.
    rig.period_us = 286;
    rig.revolution(true);
    rig.revolution(true);
    assert_eq!(rig.cycle(), Some(CycleOutcome::Applied(ExecPath::Sequential)));
    let runtime = rig.engine.runtime_state().expect("runtime published");
    assert!(runtime.limp);
    assert!(runtime.fuel_cut);
    assert_eq!(runtime.pulsewidth_us, 0);
    let armed_injection = rig.engine.with_actuators(|actuators| {
        actuators
            .scheduler
            .pending()
            .filter(|event| event.kind.is_injection())
            .count()
    });
    assert_eq!(armed_injection, 0);
}
