//! Injector pulsewidth calculation.

#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]

use crate::drivers::{MAX_PULSEWIDTH_US, MIN_PULSEWIDTH_US};

/// Pulsewidth delivering 100 % VE at 100 kPa.
pub const REQ_FUEL_US: u32 = 7_730;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FuelConfig {
    pub req_fuel_us: u32,
    pub warmup_temp_min_c: i16,
    pub warmup_temp_max_c: i16,
    pub warmup_enrich_max_pct: u16,
    /// MAP rise between two cycles, in 0.1 kPa, that starts enrichment.
    pub accel_threshold_kpa10: u16,
    pub accel_enrich_max_pct: u16,
    pub accel_decay_ms: u64,
    pub min_pulsewidth_us: u32,
    pub max_pulsewidth_us: u32,
}

impl FuelConfig {
    pub const fn new() -> Self {
        Self {
            req_fuel_us: REQ_FUEL_US,
            warmup_temp_min_c: 0,
            warmup_temp_max_c: 70,
            warmup_enrich_max_pct: 140,
            accel_threshold_kpa10: 5,
            accel_enrich_max_pct: 150,
            accel_decay_ms: 200,
            min_pulsewidth_us: MIN_PULSEWIDTH_US,
            max_pulsewidth_us: MAX_PULSEWIDTH_US,
        }
    }
}

impl Default for FuelConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Cold-engine enrichment in percent, tapering linearly to 100 %.
#[must_use]
pub fn warmup_enrichment_pct(config: &FuelConfig, clt_c: i16) -> u16 {
    if clt_c <= config.warmup_temp_min_c {
        return config.warmup_enrich_max_pct;
    }
    if clt_c >= config.warmup_temp_max_c {
        return 100;
    }
    let range = f32::from(config.warmup_temp_max_c - config.warmup_temp_min_c);
    let position = f32::from(clt_c - config.warmup_temp_min_c) / range;
    let extra = f32::from(config.warmup_enrich_max_pct.saturating_sub(100));
    (f32::from(config.warmup_enrich_max_pct) - extra * position + 0.5) as u16
}

/// Transient enrichment triggered by a rising manifold pressure.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct AccelEnrichment {
    previous_map_kpa10: Option<u16>,
    started_ms: Option<u64>,
}

impl AccelEnrichment {
    pub const fn new() -> Self {
        Self {
            previous_map_kpa10: None,
            started_ms: None,
        }
    }

    /// Feeds the current MAP and returns the enrichment in percent.
    pub fn update(&mut self, config: &FuelConfig, map_kpa10: u16, now_ms: u64) -> u16 {
        if let Some(previous) = self.previous_map_kpa10.replace(map_kpa10)
            && map_kpa10.saturating_sub(previous) > config.accel_threshold_kpa10
        {
            self.started_ms = Some(now_ms);
        }

        let Some(started) = self.started_ms else {
            return 100;
        };
        let elapsed = now_ms.saturating_sub(started);
        if elapsed >= config.accel_decay_ms || config.accel_decay_ms == 0 {
            self.started_ms = None;
            return 100;
        }
        let decay = 1.0 - elapsed as f32 / config.accel_decay_ms as f32;
        let extra = f32::from(config.accel_enrich_max_pct.saturating_sub(100));
        (100.0 + extra * decay + 0.5) as u16
    }

    pub fn is_active(&self) -> bool {
        self.started_ms.is_some()
    }
}

/// Everything the pulsewidth equation depends on for one cycle.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PulsewidthInputs {
    pub rpm: u32,
    /// Volumetric efficiency in 0.1 %.
    pub ve_x10: u16,
    pub map_kpa10: u16,
    pub warmup_pct: u16,
    pub accel_pct: u16,
    /// Closed-loop trim as a fraction, e.g. `0.05` for +5 %.
    pub lambda_correction: f32,
}

/// Final injector pulsewidth, clamped to the injector's usable range.
#[must_use]
pub fn pulsewidth_us(config: &FuelConfig, inputs: &PulsewidthInputs) -> u32 {
    if inputs.rpm == 0 {
        return config.min_pulsewidth_us;
    }
    let ve = f32::from(inputs.ve_x10) / 10.0;
    let load_factor = f32::from(inputs.map_kpa10) / 10.0 / 100.0;
    let base = config.req_fuel_us as f32 * (ve / 100.0) * load_factor;

    let warmup = f32::from(inputs.warmup_pct) / 100.0;
    let accel = f32::from(inputs.accel_pct) / 100.0;
    let correction = if inputs.lambda_correction.is_finite() {
        inputs.lambda_correction
    } else {
        0.0
    };
    let lambda = (1.0 + correction).clamp(0.75, 1.25);

    let pulsewidth = (base * warmup * accel * lambda)
        .clamp(config.min_pulsewidth_us as f32, config.max_pulsewidth_us as f32);
    (pulsewidth + 0.5) as u32
}

/// Fuel delivered relative to the 100 % VE, 100 kPa reference, in percent.
#[must_use]
pub fn fuel_enrichment_pct(config: &FuelConfig, pulsewidth_us: u32) -> u16 {
    if config.req_fuel_us == 0 {
        return 0;
    }
    u16::try_from(u64::from(pulsewidth_us) * 100 / u64::from(config.req_fuel_us)).unwrap_or(u16::MAX)
}
