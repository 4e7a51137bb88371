//! Planner stage: one [`EngineCommand`] per wake-up.

use crate::calibration::eoit_target_deg;
use crate::closed_loop::{ClosedLoopConfig, ClosedLoopTrim, measure_lambda};
use crate::decoder::SyncState;
use crate::drivers::dwell_voltage_dv;
use crate::fuel::{AccelEnrichment, FuelConfig, PulsewidthInputs, pulsewidth_us, warmup_enrichment_pct};
use crate::safety::{KnockProtection, SafetyMonitor};
use crate::sensors::{SensorFallback, SensorSource, WidebandSource};
use crate::sync::Shared;
use crate::telemetry::{Millis, TelemetryRecorder};
use crate::timing::OperatingPoint;

use super::{Clock, CommandRing, EngineCommand, MapBank, PerfStats, PlanError};

/// Shared state the Planner reads or updates during a cycle.
pub struct PlanContext<'a, S: ?Sized, W: ?Sized> {
    pub sensors: &'a S,
    pub wideband: &'a W,
    pub bank: &'a Shared<MapBank>,
    pub safety: &'a Shared<SafetyMonitor>,
    pub telemetry: &'a Shared<TelemetryRecorder<Millis>>,
}

pub struct Planner {
    fuel: FuelConfig,
    trim: ClosedLoopTrim,
    fallback: SensorFallback,
    accel: AccelEnrichment,
    knock: KnockProtection,
    /// Timestamp of the last snapshot whose knock flag was counted.
    knock_sample_ms: Option<u64>,
    sync_acquired: bool,
    planned: u32,
    last_error: Option<PlanError>,
}

impl Planner {
    pub const fn new(fuel: FuelConfig, closed_loop: ClosedLoopConfig) -> Self {
        Self {
            fuel,
            trim: ClosedLoopTrim::new(closed_loop),
            fallback: SensorFallback::new(),
            accel: AccelEnrichment::new(),
            knock: KnockProtection::new(),
            knock_sample_ms: None,
            sync_acquired: false,
            planned: 0,
            last_error: None,
        }
    }

    pub fn fuel_config(&self) -> &FuelConfig {
        &self.fuel
    }

    pub fn trim(&self) -> &ClosedLoopTrim {
        &self.trim
    }

    pub fn knock(&self) -> &KnockProtection {
        &self.knock
    }

    pub fn planned(&self) -> u32 {
        self.planned
    }

    pub fn last_error(&self) -> Option<PlanError> {
        self.last_error
    }

    pub fn sensor_fallbacks(&self) -> u32 {
        self.fallback.fallbacks_used()
    }

    /// Plans, pushes the command on success, and records the elapsed time
    /// whatever the outcome. Returns `true` when the Executor should wake.
    pub fn run_cycle<S, W, C>(
        &mut self,
        sync: &SyncState,
        ctx: &PlanContext<'_, S, W>,
        ring: &Shared<CommandRing>,
        perf: &Shared<PerfStats>,
        clock: &C,
    ) -> bool
    where
        S: SensorSource + ?Sized,
        W: WidebandSource + ?Sized,
        C: Clock + ?Sized,
    {
        let started = clock.now_us();
        let result = self.plan(sync, ctx, clock);
        let pushed = match result {
            Ok(command) => {
                let (outcome, overruns) = ring.lock(|ring| (ring.push(command), ring.overruns()));
                perf.lock(|perf| perf.record_ring(overruns, outcome.depth));
                true
            }
            Err(_) => false,
        };
        let elapsed = clock.now_us().wrapping_sub(started);
        perf.lock(|perf| perf.record_planner(elapsed));
        pushed
    }

    /// Builds one command from a single read of `sync`.
    ///
    /// Fails without side effects on the ring when sync is invalid, no usable
    /// sensor snapshot exists, or a safety check trips.
    pub fn plan<S, W, C>(
        &mut self,
        sync: &SyncState,
        ctx: &PlanContext<'_, S, W>,
        clock: &C,
    ) -> Result<EngineCommand, PlanError>
    where
        S: SensorSource + ?Sized,
        W: WidebandSource + ?Sized,
        C: Clock + ?Sized,
    {
        let result = self.build(sync, ctx, clock);
        match result {
            Ok(_) => {
                self.planned = self.planned.wrapping_add(1);
                self.last_error = None;
            }
            Err(error) => self.last_error = Some(error),
        }
        result
    }

    fn build<S, W, C>(
        &mut self,
        sync: &SyncState,
        ctx: &PlanContext<'_, S, W>,
        clock: &C,
    ) -> Result<EngineCommand, PlanError>
    where
        S: SensorSource + ?Sized,
        W: WidebandSource + ?Sized,
        C: Clock + ?Sized,
    {
        let now_ms = clock.now_ms();
        self.track_sync(sync, ctx, now_ms);
        if !sync.sync_valid {
            return Err(PlanError::SyncLost);
        }

        let snapshot = self
            .fallback
            .resolve(ctx.sensors.latest(), now_ms)
            .ok_or(PlanError::SensorUnavailable)?;
        if self.knock_sample_ms != Some(snapshot.timestamp_ms) {
            self.knock_sample_ms = Some(snapshot.timestamp_ms);
            self.knock.update(snapshot.knock);
        }
        let rpm = u16::try_from(sync.rpm).unwrap_or(u16::MAX);
        let load = snapshot.map_kpa10;

        let (trip, was_limp, limp) = ctx.safety.lock(|safety| {
            let was_limp = safety.is_limp_active();
            let trip = safety.check_envelope(sync.rpm, snapshot.clt_c, snapshot.vbat_dv, now_ms);
            if trip.is_none() && was_limp {
                safety.mark_conditions_safe(true);
                safety.try_deactivate(now_ms);
            }
            (trip.zip(safety.last_event()), was_limp, safety.limp_state())
        });
        ctx.telemetry.lock(|telemetry| {
            if let Some((trip, event)) = trip {
                telemetry.record_safety_trip(trip, event.value, Millis(now_ms));
            }
            if was_limp != limp.active {
                telemetry.record_limp_transition(limp.active, Millis(now_ms));
            }
        });
        if let Some((trip, _)) = trip {
            return Err(PlanError::SafetyTrip(trip));
        }

        let lookup = ctx.bank.lock(|bank| bank.lookup(rpm, load));
        let (ve_x10, advance_x10, lambda_x1000) = if limp.active {
            let overrides = limp.overrides;
            (overrides.ve_x10, overrides.advance_x10, overrides.lambda_x1000)
        } else {
            (lookup.ve_x10, lookup.advance_x10, lookup.lambda_x1000)
        };
        let fuel_cut = limp.active && sync.rpm > limp.overrides.rpm_limit;

        let mut correction = 0.0;
        if lookup.closed_loop_enabled && !limp.active {
            let measured = measure_lambda(self.trim.config(), ctx.wideband.latest(), snapshot.o2_mv);
            let lambda_target = f32::from(lambda_x1000) / 1_000.0;
            let outcome = self.trim.update(lambda_target, measured, rpm, load, now_ms);
            if let Some(ltft) = outcome.fold {
                ctx.bank.lock(|bank| bank.fold_ltft(rpm, load, ltft));
            }
            correction = outcome.correction;
        }

        let accel_pct = self.accel.update(&self.fuel, snapshot.map_kpa10, now_ms);
        let pulsewidth = if fuel_cut {
            0
        } else {
            pulsewidth_us(
                &self.fuel,
                &PulsewidthInputs {
                    rpm: sync.rpm,
                    ve_x10,
                    map_kpa10: snapshot.map_kpa10,
                    warmup_pct: warmup_enrichment_pct(&self.fuel, snapshot.clt_c),
                    accel_pct,
                    lambda_correction: correction,
                },
            )
        };

        Ok(EngineCommand {
            rpm,
            load,
            advance_x10: self.knock.apply(advance_x10),
            pulsewidth_us: pulsewidth,
            fuel_cut,
            limp: limp.active,
            eoi_boundary: lookup.boundary,
            eoi_normal_used: lookup.normal_used,
            eoi_target_deg: eoit_target_deg(lookup.boundary, lookup.normal_used),
            eoi_fallback_deg: eoit_target_deg(lookup.boundary, lookup.fallback_normal),
            map_mode_enabled: lookup.map_mode_enabled,
            dwell_vbat_dv: dwell_voltage_dv(snapshot.vbat_dv, snapshot.clt_c),
            operating_point: OperatingPoint::from_sensors(snapshot.vbat_dv, snapshot.clt_c),
            sync: *sync,
            planned_at_us: clock.now_us(),
        })
    }

    fn track_sync<S: ?Sized, W: ?Sized>(&mut self, sync: &SyncState, ctx: &PlanContext<'_, S, W>, now_ms: u64) {
        let acquired = sync.sync_valid && sync.sync_acquired;
        if acquired != self.sync_acquired {
            self.sync_acquired = acquired;
            ctx.telemetry
                .lock(|telemetry| telemetry.record_sync_change(acquired, Millis(now_ms)));
        }
    }
}

impl Default for Planner {
    fn default() -> Self {
        Self::new(FuelConfig::new(), ClosedLoopConfig::new())
    }
}
