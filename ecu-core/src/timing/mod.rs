//! High-precision timing state shared by both actuation paths.
//!
//! One [`HpState`] instance is constructed at start-up and handed to the
//! scheduler. It bundles the tooth-period predictor, the coil/injector
//! latency model and the fire-time jitter accumulator.

#![allow(clippy::cast_precision_loss)]

use libm::{fabsf, roundf};

const MIN_ALPHA: f32 = 0.05;
const MAX_ALPHA: f32 = 0.5;
const INITIAL_ALPHA: f32 = 0.1;
/// Tooth gaps longer than this are treated as a restart, not acceleration.
const MAX_PREDICTOR_DT_US: f32 = 100_000.0;

/// Extrapolates the next tooth period from the recent trend.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PhasePredictor {
    predicted_period_us: f32,
    last_period_us: f32,
    acceleration: f32,
    alpha: f32,
    last_dt_us: f32,
    last_timestamp_us: Option<u32>,
    samples: u32,
}

impl PhasePredictor {
    pub const fn new(initial_period_us: f32) -> Self {
        Self {
            predicted_period_us: initial_period_us,
            last_period_us: initial_period_us,
            acceleration: 0.0,
            alpha: INITIAL_ALPHA,
            last_dt_us: 0.0,
            last_timestamp_us: None,
            samples: 0,
        }
    }

    /// Feeds one measured tooth period captured at `timestamp_us`.
    pub fn update(&mut self, period_us: f32, timestamp_us: u32) {
        if period_us.is_nan() || period_us <= 0.0 {
            return;
        }

        let mut dt = self
            .last_timestamp_us
            .map_or(0.0, |last| timestamp_us.wrapping_sub(last) as f32);
        if dt > MAX_PREDICTOR_DT_US {
            dt = 0.0;
        }
        self.last_dt_us = dt;

        if self.predicted_period_us > 0.0 && dt > 0.0 {
            self.acceleration = (period_us - self.predicted_period_us) / dt;
        }

        let alpha = MIN_ALPHA + (1.0 / (1.0 + fabsf(self.acceleration) * 0.001)) * 0.2;
        self.alpha = alpha.clamp(MIN_ALPHA, MAX_ALPHA);

        self.predicted_period_us = period_us + self.acceleration * dt * self.alpha;
        self.last_period_us = period_us;
        self.last_timestamp_us = Some(timestamp_us);
        self.samples = self.samples.wrapping_add(1);
    }

    /// Predicted period `dt_us` after the last update, or `fallback_us` when
    /// there is no history yet.
    pub fn predict(&self, dt_us: f32, fallback_us: f32) -> f32 {
        if self.samples == 0 || self.predicted_period_us.is_nan() || self.predicted_period_us <= 0.0 {
            return fallback_us;
        }
        let predicted = self.predicted_period_us + self.acceleration * dt_us * self.alpha;
        if predicted > 0.0 { predicted } else { fallback_us }
    }

    pub fn predicted_period_us(&self) -> f32 {
        self.predicted_period_us
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    pub fn last_period_us(&self) -> f32 {
        self.last_period_us
    }

    pub fn last_dt_us(&self) -> f32 {
        self.last_dt_us
    }
}

/// Voltage/temperature dependent actuator latency.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LatencyModel {
    pub coil_base_us: f32,
    pub injector_base_us: f32,
    pub voltage_factor: f32,
    pub temperature_factor: f32,
    pub reference_voltage: f32,
    pub reference_temperature_c: f32,
}

impl LatencyModel {
    pub const fn new() -> Self {
        Self {
            coil_base_us: 100.0,
            injector_base_us: 50.0,
            voltage_factor: 0.05,
            temperature_factor: 0.001,
            reference_voltage: 12.0,
            reference_temperature_c: 25.0,
        }
    }

    pub fn coil_latency_us(&self, battery_voltage: f32, temperature_c: f32) -> f32 {
        self.scaled(self.coil_base_us, battery_voltage, temperature_c)
    }

    pub fn injector_latency_us(&self, battery_voltage: f32, temperature_c: f32) -> f32 {
        self.scaled(self.injector_base_us, battery_voltage, temperature_c)
    }

    fn scaled(&self, base: f32, battery_voltage: f32, temperature_c: f32) -> f32 {
        let voltage = 1.0 + (self.reference_voltage - battery_voltage) * self.voltage_factor;
        let temperature = 1.0 + (temperature_c - self.reference_temperature_c) * self.temperature_factor;
        let latency = base * voltage * temperature;
        if latency.is_finite() && latency > 0.0 { latency } else { 0.0 }
    }
}

impl Default for LatencyModel {
    fn default() -> Self {
        Self::new()
    }
}

/// Absolute fire-time error statistics in microseconds.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct JitterStats {
    pub samples: u32,
    pub last_us: u32,
    pub min_us: u32,
    pub max_us: u32,
    pub avg_us: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct JitterTracker {
    samples: u32,
    last_us: u32,
    min_us: u32,
    max_us: u32,
    sum_us: u64,
}

impl JitterTracker {
    pub const fn new() -> Self {
        Self {
            samples: 0,
            last_us: 0,
            min_us: u32::MAX,
            max_us: 0,
            sum_us: 0,
        }
    }

    pub fn record(&mut self, expected_us: u32, actual_us: u32) {
        let forward = actual_us.wrapping_sub(expected_us);
        let jitter = forward.min(expected_us.wrapping_sub(actual_us));
        self.last_us = jitter;
        self.min_us = self.min_us.min(jitter);
        self.max_us = self.max_us.max(jitter);
        self.sum_us += u64::from(jitter);
        self.samples = self.samples.saturating_add(1);
    }

    pub fn stats(&self) -> JitterStats {
        if self.samples == 0 {
            return JitterStats::default();
        }
        let avg = self.sum_us / u64::from(self.samples);
        JitterStats {
            samples: self.samples,
            last_us: self.last_us,
            min_us: self.min_us,
            max_us: self.max_us,
            avg_us: u32::try_from(avg).unwrap_or(u32::MAX),
        }
    }
}

impl Default for JitterTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Battery voltage and coolant temperature the latency model is evaluated at.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct OperatingPoint {
    pub battery_voltage: f32,
    pub temperature_c: f32,
}

impl OperatingPoint {
    /// Charging-system voltage at room temperature. The latency model runs
    /// at this point until the first command carries a sensor snapshot.
    pub const NOMINAL: Self = Self {
        battery_voltage: 13.8,
        temperature_c: 25.0,
    };

    /// Battery voltage in 0.1 V and coolant temperature in °C. A zero
    /// voltage reading is a dead sense line and keeps the nominal voltage.
    pub fn from_sensors(vbat_dv: u16, clt_c: i16) -> Self {
        let battery_voltage = if vbat_dv == 0 {
            Self::NOMINAL.battery_voltage
        } else {
            f32::from(vbat_dv) / 10.0
        };
        Self {
            battery_voltage,
            temperature_c: f32::from(clt_c),
        }
    }
}

/// Shared predictor, latency model and jitter accumulator.
///
/// Every query before [`HpState::init`] returns a neutral value so callers
/// never act on an unprimed model.
pub struct HpState {
    initialized: bool,
    predictor: PhasePredictor,
    latency: LatencyModel,
    jitter: JitterTracker,
    operating_point: OperatingPoint,
}

impl HpState {
    pub const fn new() -> Self {
        Self {
            initialized: false,
            predictor: PhasePredictor::new(0.0),
            latency: LatencyModel::new(),
            jitter: JitterTracker::new(),
            operating_point: OperatingPoint::NOMINAL,
        }
    }

    /// Primes the predictor. Calling it again keeps the existing state.
    pub fn init(&mut self, initial_period_us: f32) -> bool {
        if self.initialized {
            return true;
        }
        if initial_period_us.is_nan() || initial_period_us <= 0.0 {
            return false;
        }
        self.predictor = PhasePredictor::new(initial_period_us);
        self.latency = LatencyModel::new();
        self.jitter = JitterTracker::new();
        self.initialized = true;
        true
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn set_latency_model(&mut self, model: LatencyModel) {
        self.latency = model;
    }

    pub fn set_operating_point(&mut self, point: OperatingPoint) {
        self.operating_point = point;
    }

    pub fn operating_point(&self) -> OperatingPoint {
        self.operating_point
    }

    pub fn update_period(&mut self, period_us: u32, timestamp_us: u32) {
        if self.initialized {
            self.predictor.update(period_us as f32, timestamp_us);
        }
    }

    pub fn predict_next_period(&self, fallback_us: f32) -> f32 {
        if self.initialized {
            self.predictor.predict(self.predictor.last_dt_us(), fallback_us)
        } else {
            fallback_us
        }
    }

    /// Whole-microsecond period for angle to time conversion: the predicted
    /// next period, kept within a factor of two of `measured_us`.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn projected_period_us(&self, measured_us: u32) -> u32 {
        let predicted = self.predict_next_period(measured_us as f32);
        if !predicted.is_finite() {
            return measured_us;
        }
        (roundf(predicted) as u32).clamp(measured_us / 2, measured_us.saturating_mul(2))
    }

    /// Coil latency at the current operating point, whole microseconds.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn coil_latency_us(&self) -> u32 {
        if !self.initialized {
            return 0;
        }
        let point = self.operating_point;
        self.latency
            .coil_latency_us(point.battery_voltage, point.temperature_c) as u32
    }

    /// Injector opening latency at the current operating point.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn injector_latency_us(&self) -> u32 {
        if !self.initialized {
            return 0;
        }
        let point = self.operating_point;
        self.latency
            .injector_latency_us(point.battery_voltage, point.temperature_c) as u32
    }

    pub fn record_jitter(&mut self, expected_us: u32, actual_us: u32) {
        if self.initialized {
            self.jitter.record(expected_us, actual_us);
        }
    }

    pub fn jitter_stats(&self) -> JitterStats {
        self.jitter.stats()
    }

    pub fn predictor(&self) -> &PhasePredictor {
        &self.predictor
    }
}

impl Default for HpState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_grows_with_low_voltage_and_heat() {
        let model = LatencyModel::new();
        let nominal = model.coil_latency_us(12.0, 25.0);
        assert!(fabsf(nominal - 100.0) < 1e-3);

        // (1 + 2 * 0.05) * (1 + 75 * 0.001) = 1.1 * 1.075
        let stressed = model.coil_latency_us(10.0, 100.0);
        assert!(fabsf(stressed - 118.25) < 1e-2);

        let injector = model.injector_latency_us(12.0, 25.0);
        assert!(fabsf(injector - 50.0) < 1e-3);
    }

    #[test]
    fn predictor_tracks_steady_period() {
        let mut predictor = PhasePredictor::new(1_000.0);
        let mut now = 0_u32;
        for _ in 0..10 {
            now += 1_000;
            predictor.update(1_000.0, now);
        }
        assert!(fabsf(predictor.predicted_period_us() - 1_000.0) < 1.0);
        assert!(predictor.alpha() >= MIN_ALPHA && predictor.alpha() <= MAX_ALPHA);
    }

    #[test]
    fn predictor_ignores_long_pauses() {
        let mut predictor = PhasePredictor::new(1_000.0);
        predictor.update(1_000.0, 10);
        predictor.update(900.0, 500_000);
        assert!(fabsf(predictor.last_dt_us()) < f32::EPSILON);
        assert!(fabsf(predictor.predicted_period_us() - 900.0) < 1e-3);
    }

    #[test]
    fn predictor_follows_deceleration() {
        let mut predictor = PhasePredictor::new(1_000.0);
        let mut now = 0_u32;
        let mut period = 1_000.0;
        for _ in 0..20 {
            period += 10.0;
            now += 1_000;
            predictor.update(period, now);
        }
        assert!(predictor.predict(1_000.0, 0.0) > period);
    }

    #[test]
    fn jitter_tracks_absolute_error() {
        let mut jitter = JitterTracker::new();
        jitter.record(1_000, 1_004);
        jitter.record(2_000, 1_998);
        jitter.record(u32::MAX - 1, 3);
        let stats = jitter.stats();
        assert_eq!(stats.samples, 3);
        assert_eq!(stats.min_us, 2);
        assert_eq!(stats.max_us, 5);
        assert_eq!(stats.last_us, 5);
        assert_eq!(stats.avg_us, 3);
    }

    #[test]
    fn hp_state_is_neutral_until_initialised() {
        let mut state = HpState::new();
        assert_eq!(state.coil_latency_us(), 0);
        state.record_jitter(10, 20);
        assert_eq!(state.jitter_stats().samples, 0);
        assert!(fabsf(state.predict_next_period(123.0) - 123.0) < f32::EPSILON);

        assert!(state.init(1_000.0));
        state.set_operating_point(OperatingPoint {
            battery_voltage: 12.0,
            temperature_c: 25.0,
        });
        assert_eq!(state.coil_latency_us(), 100);
        assert_eq!(state.injector_latency_us(), 50);
    }

    #[test]
    fn operating_point_follows_sensor_units() {
        let point = OperatingPoint::from_sensors(100, -10);
        assert!(fabsf(point.battery_voltage - 10.0) < f32::EPSILON);
        assert!(fabsf(point.temperature_c + 10.0) < f32::EPSILON);
        assert_eq!(OperatingPoint::from_sensors(0, 25), OperatingPoint::NOMINAL);
    }

    #[test]
    fn projected_period_leads_a_decelerating_wheel() {
        let mut state = HpState::new();
        assert_eq!(state.projected_period_us(1_000), 1_000);

        assert!(state.init(1_000.0));
        state.update_period(1_000, 10_000);
        assert_eq!(state.projected_period_us(1_000), 1_000);

        state.update_period(1_100, 11_100);
        state.update_period(1_200, 12_300);
        let projected = state.projected_period_us(1_200);
        assert!(projected > 1_200 && projected < 1_300, "{projected}");
        assert_eq!(state.projected_period_us(100), 200);
    }

    #[test]
    fn init_is_idempotent() {
        let mut state = HpState::new();
        assert!(state.init(1_000.0));
        state.record_jitter(0, 7);
        assert!(state.init(5_000.0));
        assert_eq!(state.jitter_stats().samples, 1);
        assert!(fabsf(state.predictor().last_period_us() - 1_000.0) < f32::EPSILON);
    }
}
