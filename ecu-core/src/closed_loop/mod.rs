//! Closed-loop lambda trim.
//!
//! A PID controller produces the short-term trim every planner cycle. The
//! long-term trim follows it slowly while the engine holds a steady
//! operating point and is periodically folded into the fuel table.

use libm::fabsf;

use crate::sensors::WidebandReading;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ClosedLoopConfig {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
    pub dt_s: f32,
    pub stft_limit: f32,
    pub ltft_limit: f32,
    pub ltft_alpha: f32,
    /// |LTFT| at which the trim is folded into the fuel table.
    pub ltft_apply_threshold: f32,
    pub stable_rpm_delta: u16,
    pub stable_load_delta: u16,
    pub stable_ms: u64,
    pub wideband_max_age_ms: u32,
    pub lambda_min: f32,
    pub lambda_max: f32,
}

impl ClosedLoopConfig {
    pub const fn new() -> Self {
        Self {
            kp: 0.6,
            ki: 0.08,
            kd: 0.01,
            dt_s: 0.01,
            stft_limit: 0.25,
            ltft_limit: 0.20,
            ltft_alpha: 0.01,
            ltft_apply_threshold: 0.03,
            stable_rpm_delta: 50,
            stable_load_delta: 50,
            stable_ms: 500,
            wideband_max_age_ms: 200,
            lambda_min: 0.7,
            lambda_max: 1.3,
        }
    }
}

impl Default for ClosedLoopConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// PID with clamped output and integrator.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LambdaPid {
    kp: f32,
    ki: f32,
    kd: f32,
    integrator: f32,
    prev_error: f32,
    output_min: f32,
    output_max: f32,
}

impl LambdaPid {
    pub const fn new(kp: f32, ki: f32, kd: f32, output_min: f32, output_max: f32) -> Self {
        Self {
            kp,
            ki,
            kd,
            integrator: 0.0,
            prev_error: 0.0,
            output_min,
            output_max,
        }
    }

    /// One controller step on `error`; zero for a non-positive `dt_s`.
    pub fn update(&mut self, error: f32, dt_s: f32) -> f32 {
        if dt_s.is_nan() || dt_s <= 0.0 || !error.is_finite() {
            return 0.0;
        }
        let proportional = self.kp * error;
        self.integrator = (self.integrator + self.ki * error * dt_s).clamp(self.output_min, self.output_max);
        let derivative = self.kd * (error - self.prev_error) / dt_s;
        self.prev_error = error;
        (proportional + self.integrator + derivative).clamp(self.output_min, self.output_max)
    }

    pub fn integrator(&self) -> f32 {
        self.integrator
    }

    pub fn reset(&mut self) {
        self.integrator = 0.0;
        self.prev_error = 0.0;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LambdaSource {
    Wideband,
    Narrowband,
}

/// Picks the lambda measurement for this cycle: a fresh wideband reading,
/// else the narrowband approximation, else nothing.
#[must_use]
pub fn measure_lambda(
    config: &ClosedLoopConfig,
    wideband: Option<WidebandReading>,
    o2_mv: u16,
) -> Option<(f32, LambdaSource)> {
    let (raw, source) = match wideband {
        Some(reading) if reading.age_ms < config.wideband_max_age_ms && reading.lambda.is_finite() => {
            (reading.lambda, LambdaSource::Wideband)
        }
        _ if o2_mv > 0 => ((f32::from(o2_mv) / 1_000.0) / 0.45, LambdaSource::Narrowband),
        _ => return None,
    };
    Some((raw.clamp(config.lambda_min, config.lambda_max), source))
}

/// Result of one trim update.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TrimOutcome {
    /// Fuel correction to apply this cycle, as a fraction.
    pub correction: f32,
    /// Long-term trim that must be folded into the fuel cell, if any.
    pub fold: Option<f32>,
    pub source: Option<LambdaSource>,
}

impl TrimOutcome {
    const NONE: Self = Self {
        correction: 0.0,
        fold: None,
        source: None,
    };
}

pub struct ClosedLoopTrim {
    config: ClosedLoopConfig,
    pid: LambdaPid,
    stft: f32,
    ltft: f32,
    last_point: Option<(u16, u16)>,
    stable_since_ms: Option<u64>,
    folds: u32,
}

impl ClosedLoopTrim {
    pub const fn new(config: ClosedLoopConfig) -> Self {
        Self {
            config,
            pid: LambdaPid::new(config.kp, config.ki, config.kd, -config.stft_limit, config.stft_limit),
            stft: 0.0,
            ltft: 0.0,
            last_point: None,
            stable_since_ms: None,
            folds: 0,
        }
    }

    pub fn config(&self) -> &ClosedLoopConfig {
        &self.config
    }

    pub fn stft(&self) -> f32 {
        self.stft
    }

    pub fn ltft(&self) -> f32 {
        self.ltft
    }

    pub fn folds(&self) -> u32 {
        self.folds
    }

    pub fn reset(&mut self) {
        self.pid.reset();
        self.stft = 0.0;
        self.ltft = 0.0;
        self.last_point = None;
        self.stable_since_ms = None;
    }

    /// Advances the trim with this cycle's lambda target and measurement.
    ///
    /// Without a measurement the short-term trim keeps its value, the
    /// long-term trim is left alone and no correction is applied.
    pub fn update(
        &mut self,
        lambda_target: f32,
        measured: Option<(f32, LambdaSource)>,
        rpm: u16,
        load: u16,
        now_ms: u64,
    ) -> TrimOutcome {
        let Some((lambda, source)) = measured else {
            return TrimOutcome::NONE;
        };
        if !lambda_target.is_finite() {
            return TrimOutcome::NONE;
        }

        // A lean reading (lambda above target) must add fuel.
        let error = lambda_target - lambda;
        let limit = self.config.stft_limit;
        self.stft = (-self.pid.update(error, self.config.dt_s)).clamp(-limit, limit);

        let mut fold = None;
        if self.is_stable(rpm, load, now_ms) {
            let ltft_limit = self.config.ltft_limit;
            self.ltft = (self.ltft + self.config.ltft_alpha * (self.stft - self.ltft))
                .clamp(-ltft_limit, ltft_limit);
            if fabsf(self.ltft) >= self.config.ltft_apply_threshold {
                fold = Some(self.ltft);
                self.ltft = 0.0;
                self.folds = self.folds.wrapping_add(1);
            }
        }

        TrimOutcome {
            correction: (self.stft + self.ltft).clamp(-limit, limit),
            fold,
            source: Some(source),
        }
    }

    fn is_stable(&mut self, rpm: u16, load: u16, now_ms: u64) -> bool {
        let previous = self.last_point.replace((rpm, load));
        let steady = previous.is_some_and(|(last_rpm, last_load)| {
            last_rpm.abs_diff(rpm) <= self.config.stable_rpm_delta
                && last_load.abs_diff(load) <= self.config.stable_load_delta
        });
        if !steady {
            self.stable_since_ms = None;
            return false;
        }
        let since = *self.stable_since_ms.get_or_insert(now_ms);
        now_ms.saturating_sub(since) >= self.config.stable_ms
    }
}

impl Default for ClosedLoopTrim {
    fn default() -> Self {
        Self::new(ClosedLoopConfig::new())
    }
}
