//! Sensor snapshot consumed by the planner.
//!
//! Sampling and filtering happen elsewhere; the core only ever sees the
//! latest published [`SensorSnapshot`] and an optional wideband reading.

use crate::safety::{SensorStatus, validate_map_sensor};
use crate::sync::SeqLock;

/// Bitset of sensors currently reporting a fault.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SensorFaults(u8);

impl SensorFaults {
    pub const NONE: Self = Self(0);
    pub const MAP: Self = Self(1 << 0);
    pub const TPS: Self = Self(1 << 1);
    pub const CLT: Self = Self(1 << 2);
    pub const IAT: Self = Self(1 << 3);
    pub const O2: Self = Self(1 << 4);
    pub const VBAT: Self = Self(1 << 5);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SensorSnapshot {
    /// Manifold pressure in 0.1 kPa; doubles as engine load.
    pub map_kpa10: u16,
    /// Throttle position in 0.1 %.
    pub tps_pct10: u16,
    pub clt_c: i16,
    pub iat_c: i16,
    /// Narrowband O2 sensor voltage; zero means no reading.
    pub o2_mv: u16,
    /// Battery voltage in 0.1 V.
    pub vbat_dv: u16,
    /// The knock detector reported at least once since the previous sample.
    pub knock: bool,
    pub faults: SensorFaults,
    pub timestamp_ms: u64,
}

impl SensorSnapshot {
    pub const EMPTY: Self = Self {
        map_kpa10: 0,
        tps_pct10: 0,
        clt_c: 0,
        iat_c: 0,
        o2_mv: 0,
        vbat_dv: 0,
        knock: false,
        faults: SensorFaults::NONE,
        timestamp_ms: 0,
    };

    /// Flags a manifold pressure outside the sensor's electrical range.
    #[must_use]
    pub fn validated(mut self) -> Self {
        if validate_map_sensor(self.map_kpa10) != SensorStatus::Ok {
            self.faults = self.faults.union(SensorFaults::MAP);
        }
        self
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn battery_voltage(&self) -> f32 {
        f32::from(self.vbat_dv) / 10.0
    }
}

/// Wideband controller output with its age at the time of the query.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct WidebandReading {
    pub lambda: f32,
    pub age_ms: u32,
}

/// Non-blocking access to the latest sensor snapshot.
pub trait SensorSource {
    fn latest(&self) -> Option<SensorSnapshot>;
}

impl SensorSource for SeqLock<SensorSnapshot> {
    fn latest(&self) -> Option<SensorSnapshot> {
        if self.has_published() { self.read() } else { None }
    }
}

pub trait WidebandSource {
    fn latest(&self) -> Option<WidebandReading>;
}

/// Wideband source for installations without a wideband controller.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoWideband;

impl WidebandSource for NoWideband {
    fn latest(&self) -> Option<WidebandReading> {
        None
    }
}

impl WidebandSource for SeqLock<Option<WidebandReading>> {
    fn latest(&self) -> Option<WidebandReading> {
        self.read().flatten()
    }
}

/// How long a previous snapshot may stand in for a missing one.
pub const SENSOR_FALLBACK_TIMEOUT_MS: u64 = 100;

/// Reuses the last good snapshot for a short while when the source has
/// nothing new.
#[derive(Copy, Clone, Debug, Default)]
pub struct SensorFallback {
    last: Option<(SensorSnapshot, u64)>,
    used: u32,
}

impl SensorFallback {
    pub const fn new() -> Self {
        Self { last: None, used: 0 }
    }

    pub fn resolve(&mut self, fresh: Option<SensorSnapshot>, now_ms: u64) -> Option<SensorSnapshot> {
        if let Some(snapshot) = fresh {
            self.last = Some((snapshot, now_ms));
            return Some(snapshot);
        }
        let (snapshot, stored_at) = self.last?;
        if now_ms.saturating_sub(stored_at) <= SENSOR_FALLBACK_TIMEOUT_MS {
            self.used = self.used.wrapping_add(1);
            Some(snapshot)
        } else {
            None
        }
    }

    /// Cycles that ran on a reused snapshot.
    pub fn fallbacks_used(&self) -> u32 {
        self.used
    }
}
