//! Executor stage: applies the newest command to the actuators.

use libm::roundf;

use crate::CYLINDER_COUNT;
use crate::angle::{q_to_deg, wrap360, wrap720};
use crate::decoder::SyncState;
use crate::drivers::{ActuationParams, Driver, dwell_time_us, is_future};
use crate::safety::{SafetyMonitor, SafetyTrip, Watchdog};
use crate::scheduler::{Actuators, EventKind, ScheduleError};
use crate::sync::Shared;
use crate::telemetry::{Millis, TelemetryEventKind, TelemetryPayload, TelemetryRecorder};

use super::{Clock, CommandRing, EngineCommand, InjectionDiag, PerfStats, PipelineConfig, PipelineOutputs, RuntimeState};

/// Cylinder pairs sharing one event when only crank sync is available,
/// with their offset inside the 360° revolution.
const PAIRED_CYLINDERS: [((u8, u8), f32); 2] = [((0, 3), 0.0), ((1, 2), 180.0)];

/// Shared state the Executor drives or publishes to.
pub struct ExecContext<'a, I, G> {
    pub actuators: &'a Shared<Actuators<I, G>>,
    pub safety: &'a Shared<SafetyMonitor>,
    pub watchdog: &'a Shared<Watchdog>,
    pub outputs: &'a PipelineOutputs,
    pub perf: &'a Shared<PerfStats>,
    pub telemetry: &'a Shared<TelemetryRecorder<Millis>>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExecPath {
    /// Full sync: per-cylinder EOI injection and ignition via the scheduler.
    Sequential,
    /// Crank-only sync: paired injection and wasted spark straight to the drivers.
    SemiSequential,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CycleOutcome {
    /// Nothing was waiting in the ring.
    Idle,
    Stale { age_us: u32 },
    Applied(ExecPath),
}

pub struct Executor {
    config: PipelineConfig,
    seen_fire_failures: u32,
    applied: u32,
}

impl Executor {
    pub const fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            seen_fire_failures: 0,
            applied: 0,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn applied(&self) -> u32 {
        self.applied
    }

    /// Takes the newest command from the ring and applies it unless stale.
    pub fn cycle<I, G, C>(
        &mut self,
        ring: &Shared<CommandRing>,
        live_sync: Option<SyncState>,
        ctx: &ExecContext<'_, I, G>,
        clock: &C,
    ) -> CycleOutcome
    where
        I: Driver,
        G: Driver,
        C: Clock + ?Sized,
    {
        let Some(command) = ring.lock(|ring| ring.pop_latest()) else {
            return CycleOutcome::Idle;
        };

        let started = clock.now_us();
        let age_us = started.wrapping_sub(command.planned_at_us);
        if age_us > self.config.max_plan_age_us {
            ctx.perf.lock(|perf| perf.record_stale(age_us));
            ctx.telemetry
                .lock(|telemetry| telemetry.record_stale_plan(age_us, Millis(clock.now_ms())));
            return CycleOutcome::Stale { age_us };
        }

        let path = self.apply(&command, live_sync, ctx, clock);
        let elapsed = clock.now_us().wrapping_sub(started);
        ctx.perf.lock(|perf| perf.record_executor(elapsed, age_us));
        CycleOutcome::Applied(path)
    }

    /// Applies `command`, publishes the results and feeds the watchdog.
    pub fn apply<I, G, C>(
        &mut self,
        command: &EngineCommand,
        live_sync: Option<SyncState>,
        ctx: &ExecContext<'_, I, G>,
        clock: &C,
    ) -> ExecPath
    where
        I: Driver,
        G: Driver,
        C: Clock + ?Sized,
    {
        let sync = live_sync
            .filter(|sync| sync.sync_valid)
            .unwrap_or(command.sync);
        let mut diag = InjectionDiag::from_command(command, sync.sync_acquired);

        let path = if sync.sync_acquired {
            let failed = ctx
                .actuators
                .lock(|actuators| self.schedule_sequential(actuators, command, &sync, &mut diag));
            if failed {
                let now_ms = clock.now_ms();
                let value = i32::from(diag.failures);
                let was_limp = ctx.safety.lock(|safety| {
                    let was_limp = safety.is_limp_active();
                    safety.report(SafetyTrip::Scheduling, value, now_ms);
                    was_limp
                });
                ctx.telemetry.lock(|telemetry| {
                    telemetry.record(
                        TelemetryEventKind::ScheduleFailure,
                        TelemetryPayload::Value(value),
                        Millis(now_ms),
                    );
                    if !was_limp {
                        telemetry.record_limp_transition(true, Millis(now_ms));
                    }
                });
            }
            ExecPath::Sequential
        } else {
            ctx.actuators
                .lock(|actuators| self.schedule_semi_sequential(actuators, command, &sync, &mut diag));
            ExecPath::SemiSequential
        };

        diag.updated_at_us = clock.now_us().max(1);
        ctx.outputs.diag.publish(diag);
        ctx.outputs.runtime.publish(RuntimeState::from_command(command));
        ctx.watchdog.lock(|watchdog| watchdog.feed(clock.now_ms()));
        self.applied = self.applied.wrapping_add(1);
        path
    }

    /// Re-targets injection and ignition for every cylinder. Returns `true`
    /// when any cylinder could not be armed or a driver rejected an event
    /// since the previous cycle.
    fn schedule_sequential<I: Driver, G: Driver>(
        &mut self,
        actuators: &mut Actuators<I, G>,
        command: &EngineCommand,
        sync: &SyncState,
        diag: &mut InjectionDiag,
    ) -> bool {
        actuators.hp.set_operating_point(command.operating_point);
        let positions = actuators.scheduler.positions();
        let us_per_deg = us_per_degree(sync, positions);
        if us_per_deg <= 0.0 {
            diag.failures = u8::try_from(CYLINDER_COUNT).unwrap_or(u8::MAX);
            return true;
        }

        let current = q_to_deg(actuators.scheduler.tooth_angle(sync.tooth_index, sync.revolution_index));
        let latency = actuators.hp.injector_latency_us();
        let pulse_deg = f32_from_u32(command.pulsewidth_us.saturating_add(latency)) / us_per_deg;
        let advance_deg = f32::from(command.advance_x10) / 10.0;
        let rpm = u32::from(command.rpm);
        let dwell_deg = f32_from_u32(dwell_time_us(command.dwell_vbat_dv, rpm)) / us_per_deg;
        let pulse = ActuationParams::Pulse {
            pulsewidth_us: command.pulsewidth_us,
        };
        let spark = ActuationParams::Ignition {
            rpm,
            vbat_dv: command.dwell_vbat_dv,
        };

        if command.fuel_cut {
            actuators.scheduler.cancel_type(EventKind::InjectorOpen);
        }

        let mut failures = 0_u8;
        for (index, tdc) in self.config.cylinder_tdc_deg.iter().enumerate() {
            let Ok(cylinder) = u8::try_from(index) else {
                continue;
            };
            let eoi = wrap720(command.eoi_target_deg + tdc);
            let soi = wrap720(eoi - pulse_deg);
            diag.soi_deg[index] = soi;
            diag.delay_us[index] = delay_us(wrap720(soi - current), us_per_deg);

            let mut ok = true;
            if !command.fuel_cut {
                ok &= accepted(actuators.scheduler.replace(EventKind::InjectorOpen, cylinder, soi, pulse));
            }
            let dwell_start = wrap720(tdc - advance_deg - dwell_deg);
            ok &= accepted(
                actuators
                    .scheduler
                    .replace(EventKind::IgnitionDwell, cylinder, dwell_start, spark),
            );
            if !ok {
                failures = failures.saturating_add(1);
            }
        }

        let fire_failures = actuators.scheduler.fire_failures();
        let new_fire_failures = fire_failures != self.seen_fire_failures;
        self.seen_fire_failures = fire_failures;
        diag.failures = failures;
        failures > 0 || new_fire_failures
    }

    /// Paired injection on the fallback EOI and wasted spark, armed straight
    /// on the drivers from the decoder's angle within the revolution.
    fn schedule_semi_sequential<I: Driver, G: Driver>(
        &self,
        actuators: &mut Actuators<I, G>,
        command: &EngineCommand,
        sync: &SyncState,
        diag: &mut InjectionDiag,
    ) {
        // Angle events need full sync; whatever is still queued would fire
        // against a guessed phase once sync returns.
        actuators.scheduler.cancel_all();
        actuators.hp.set_operating_point(command.operating_point);
        let us_per_deg = us_per_degree(sync, actuators.scheduler.positions());
        if us_per_deg <= 0.0 {
            return;
        }
        let current = wrap360(q_to_deg(actuators.scheduler.tooth_angle(sync.tooth_index, 0)));
        let revolution_us = delay_us(360.0, us_per_deg);
        let latency = actuators.hp.injector_latency_us();
        let pulsewidth = command.pulsewidth_us.saturating_add(latency);
        let pulse_deg = f32_from_u32(pulsewidth) / us_per_deg;
        let advance_deg = f32::from(command.advance_x10) / 10.0;
        let spark = ActuationParams::Ignition {
            rpm: u32::from(command.rpm),
            vbat_dv: command.dwell_vbat_dv,
        };
        let coil_latency = actuators.hp.coil_latency_us();

        let mut failures = 0_u8;
        for ((first, second), offset) in PAIRED_CYLINDERS {
            let eoi = wrap360(command.eoi_fallback_deg + offset);
            let soi = wrap360(eoi - pulse_deg);
            let injection_delay = delay_us(wrap360(soi - current), us_per_deg);
            let spark_delay = delay_us(wrap360(offset - advance_deg - current), us_per_deg);

            for cylinder in [first, second] {
                let index = usize::from(cylinder);
                diag.soi_deg[index] = soi;
                diag.delay_us[index] = injection_delay;

                if !command.fuel_cut {
                    let now = actuators.injection.now();
                    let target = next_future(sync.last_capture_us, injection_delay, revolution_us, now);
                    let result = actuators.injection.schedule_absolute(
                        cylinder,
                        target,
                        ActuationParams::Pulse {
                            pulsewidth_us: pulsewidth,
                        },
                    );
                    if result.is_err() {
                        failures = failures.saturating_add(1);
                    }
                }

                let now = actuators.ignition.now();
                let target = next_future(sync.last_capture_us, spark_delay, revolution_us, now)
                    .wrapping_sub(coil_latency);
                if actuators.ignition.schedule_absolute(cylinder, target, spark).is_err() {
                    failures = failures.saturating_add(1);
                }
            }
        }
        diag.failures = failures;
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(PipelineConfig::new())
    }
}

/// A re-plan that lands inside the imminent fire window keeps the event
/// already armed, which is what the scheduler is about to fire anyway.
fn accepted(result: Result<(), ScheduleError>) -> bool {
    matches!(result, Ok(()) | Err(ScheduleError::InsideFireWindow))
}

#[allow(clippy::cast_precision_loss)]
fn f32_from_u32(value: u32) -> f32 {
    value as f32
}

fn us_per_degree(sync: &SyncState, positions: u16) -> f32 {
    if sync.tooth_period_us == 0 || positions == 0 {
        return 0.0;
    }
    f32_from_u32(sync.tooth_period_us) * f32::from(positions) / 360.0
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn delay_us(delta_deg: f32, us_per_deg: f32) -> u32 {
    let delay = delta_deg * us_per_deg;
    if delay.is_nan() || delay <= 0.0 {
        return 0;
    }
    if delay >= 4_294_967_040.0 {
        return u32::MAX;
    }
    roundf(delay) as u32
}

/// `base + delay`, pushed one revolution later when already behind `now`.
fn next_future(base: u32, delay: u32, revolution_us: u32, now: u32) -> u32 {
    let target = base.wrapping_add(delay);
    if is_future(target, now) {
        target
    } else {
        target.wrapping_add(revolution_us)
    }
}
