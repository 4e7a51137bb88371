//! Envelope checks, limp mode and the watchdog liveness contract.
//!
//! [`SafetyMonitor`] is the only type allowed to change limp state. Every
//! trip is logged with the value that caused it and escalates to limp mode.
//! Leaving limp mode passes three gates in order: the minimum time in limp
//! has elapsed, the caller has asserted that conditions are safe, and they
//! have stayed safe for the hysteresis window.

use core::fmt;

use heapless::HistoryBuf;

/// Safety trips retained for diagnostics.
pub const SAFETY_LOG_CAPACITY: usize = 32;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SafetyConfig {
    pub fuel_cut_rpm: u32,
    pub max_rpm: u32,
    pub overheat_c: i16,
    pub vbat_min_dv: u16,
    pub vbat_max_dv: u16,
    pub limp_min_duration_ms: u64,
    pub limp_hysteresis_ms: u64,
    pub watchdog_timeout_ms: u64,
    pub limp: LimpOverrides,
}

impl SafetyConfig {
    pub const fn new() -> Self {
        Self {
            fuel_cut_rpm: 7_500,
            max_rpm: 8_000,
            overheat_c: 120,
            vbat_min_dv: 70,
            vbat_max_dv: 170,
            limp_min_duration_ms: 5_000,
            limp_hysteresis_ms: 2_000,
            watchdog_timeout_ms: 1_000,
            limp: LimpOverrides::new(),
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Actuation limits applied while limp mode is active.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LimpOverrides {
    /// Fuel is cut above this speed.
    pub rpm_limit: u32,
    /// VE in tenths of a percent.
    pub ve_x10: u16,
    /// Ignition advance in tenths of a degree.
    pub advance_x10: u16,
    /// Lambda target in thousandths.
    pub lambda_x1000: u16,
}

impl LimpOverrides {
    pub const fn new() -> Self {
        Self {
            rpm_limit: 3_000,
            ve_x10: 800,
            advance_x10: 100,
            lambda_x1000: 1_000,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LimpState {
    pub active: bool,
    pub activated_at_ms: u64,
    pub overrides: LimpOverrides,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SafetyTrip {
    OverRev,
    Overheat,
    Voltage,
    Scheduling,
}

impl fmt::Display for SafetyTrip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Logged trip and the value that caused it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SafetyEvent {
    pub trip: SafetyTrip,
    pub value: i32,
    pub timestamp_ms: u64,
}

pub struct SafetyMonitor {
    config: SafetyConfig,
    limp: LimpState,
    conditions_safe: bool,
    recovery_started_ms: Option<u64>,
    log: HistoryBuf<SafetyEvent, SAFETY_LOG_CAPACITY>,
    trips: u32,
    activations: u32,
}

impl SafetyMonitor {
    pub const fn new(config: SafetyConfig) -> Self {
        Self {
            config,
            limp: LimpState {
                active: false,
                activated_at_ms: 0,
                overrides: config.limp,
            },
            conditions_safe: false,
            recovery_started_ms: None,
            log: HistoryBuf::new(),
            trips: 0,
            activations: 0,
        }
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    pub fn check_over_rev(&mut self, rpm: u32, now_ms: u64) -> bool {
        if rpm >= self.config.fuel_cut_rpm || rpm > self.config.max_rpm {
            self.trip(SafetyTrip::OverRev, i32::try_from(rpm).unwrap_or(i32::MAX), now_ms);
            return true;
        }
        false
    }

    pub fn check_overheat(&mut self, clt_c: i16, now_ms: u64) -> bool {
        if clt_c > self.config.overheat_c {
            self.trip(SafetyTrip::Overheat, i32::from(clt_c), now_ms);
            return true;
        }
        false
    }

    pub fn check_battery_voltage(&mut self, vbat_dv: u16, now_ms: u64) -> bool {
        if vbat_dv < self.config.vbat_min_dv || vbat_dv > self.config.vbat_max_dv {
            self.trip(SafetyTrip::Voltage, i32::from(vbat_dv), now_ms);
            return true;
        }
        false
    }

    /// Runs every envelope check, logging each trip. Returns the first one.
    pub fn check_envelope(&mut self, rpm: u32, clt_c: i16, vbat_dv: u16, now_ms: u64) -> Option<SafetyTrip> {
        let over_rev = self.check_over_rev(rpm, now_ms);
        let overheat = self.check_overheat(clt_c, now_ms);
        let voltage = self.check_battery_voltage(vbat_dv, now_ms);
        if over_rev {
            Some(SafetyTrip::OverRev)
        } else if overheat {
            Some(SafetyTrip::Overheat)
        } else if voltage {
            Some(SafetyTrip::Voltage)
        } else {
            None
        }
    }

    /// Records a trip raised outside the envelope checks.
    pub fn report(&mut self, trip: SafetyTrip, value: i32, now_ms: u64) {
        self.trip(trip, value, now_ms);
    }

    fn trip(&mut self, trip: SafetyTrip, value: i32, now_ms: u64) {
        self.trips = self.trips.wrapping_add(1);
        self.log.write(SafetyEvent {
            trip,
            value,
            timestamp_ms: now_ms,
        });
        self.mark_conditions_safe(false);
        self.activate_limp(now_ms);
    }

    /// Enters limp mode. Returns `false` when it was already active.
    pub fn activate_limp(&mut self, now_ms: u64) -> bool {
        if self.limp.active {
            return false;
        }
        self.limp.active = true;
        self.limp.activated_at_ms = now_ms;
        self.conditions_safe = false;
        self.recovery_started_ms = None;
        self.activations = self.activations.wrapping_add(1);
        true
    }

    /// Unsafe observations restart the hysteresis window.
    pub fn mark_conditions_safe(&mut self, safe: bool) {
        if safe {
            self.conditions_safe = true;
        } else {
            self.conditions_safe = false;
            self.recovery_started_ms = None;
        }
    }

    /// Attempts to leave limp mode. Returns `true` on the transition.
    pub fn try_deactivate(&mut self, now_ms: u64) -> bool {
        if !self.limp.active {
            return false;
        }
        if now_ms.saturating_sub(self.limp.activated_at_ms) < self.config.limp_min_duration_ms {
            return false;
        }
        if !self.conditions_safe {
            return false;
        }
        let started = *self.recovery_started_ms.get_or_insert(now_ms);
        if now_ms.saturating_sub(started) < self.config.limp_hysteresis_ms {
            return false;
        }
        self.limp.active = false;
        self.limp.activated_at_ms = 0;
        self.conditions_safe = false;
        self.recovery_started_ms = None;
        true
    }

    pub fn is_limp_active(&self) -> bool {
        self.limp.active
    }

    pub fn limp_state(&self) -> LimpState {
        self.limp
    }

    pub fn recovery_started_ms(&self) -> Option<u64> {
        self.recovery_started_ms
    }

    pub fn trips(&self) -> u32 {
        self.trips
    }

    pub fn activations(&self) -> u32 {
        self.activations
    }

    pub fn last_event(&self) -> Option<SafetyEvent> {
        self.log.recent().copied()
    }

    /// Logged trips, oldest first.
    pub fn events(&self) -> impl Iterator<Item = &SafetyEvent> {
        self.log.oldest_ordered()
    }
}

impl Default for SafetyMonitor {
    fn default() -> Self {
        Self::new(SafetyConfig::new())
    }
}

/// Liveness contract with the external hardware watchdog.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Watchdog {
    enabled: bool,
    timeout_ms: u64,
    last_feed_ms: u64,
    feeds: u32,
}

impl Watchdog {
    pub const fn new(timeout_ms: u64) -> Self {
        Self {
            enabled: false,
            timeout_ms,
            last_feed_ms: 0,
            feeds: 0,
        }
    }

    pub fn enable(&mut self, now_ms: u64) {
        self.enabled = true;
        self.last_feed_ms = now_ms;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns `false` when the watchdog is not enabled.
    pub fn feed(&mut self, now_ms: u64) -> bool {
        if !self.enabled {
            return false;
        }
        self.last_feed_ms = now_ms;
        self.feeds = self.feeds.wrapping_add(1);
        true
    }

    /// `true` while the last feed is within the timeout.
    pub fn check(&self, now_ms: u64) -> bool {
        if !self.enabled {
            return true;
        }
        now_ms.saturating_sub(self.last_feed_ms) <= self.timeout_ms
    }

    pub fn feeds(&self) -> u32 {
        self.feeds
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }
}

pub const KNOCK_RETARD_STEP_X10: u16 = 10;
pub const KNOCK_RECOVERY_STEP_X10: u16 = 5;
pub const KNOCK_MAX_RETARD_X10: u16 = 100;

/// Ignition retard accumulated from knock events, in tenths of a degree.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct KnockProtection {
    pub knock_count: u32,
    pub retard_x10: u16,
}

impl KnockProtection {
    pub const fn new() -> Self {
        Self {
            knock_count: 0,
            retard_x10: 0,
        }
    }

    /// One combustion cycle: retard on knock, recover slowly otherwise.
    pub fn update(&mut self, knock_detected: bool) {
        if knock_detected {
            self.knock_count = self.knock_count.saturating_add(1);
            self.retard_x10 = (self.retard_x10 + KNOCK_RETARD_STEP_X10).min(KNOCK_MAX_RETARD_X10);
        } else {
            self.retard_x10 = self.retard_x10.saturating_sub(KNOCK_RECOVERY_STEP_X10);
            self.knock_count = self.knock_count.saturating_sub(1);
        }
    }

    /// Applies the retard to an advance in tenths of a degree.
    pub const fn apply(&self, advance_x10: u16) -> u16 {
        advance_x10.saturating_sub(self.retard_x10)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SensorStatus {
    Ok,
    ShortToGround,
    ShortToSupply,
}

pub const fn validate_sensor(value: i32, min_expected: i32, max_expected: i32) -> SensorStatus {
    if value < min_expected {
        SensorStatus::ShortToGround
    } else if value > max_expected {
        SensorStatus::ShortToSupply
    } else {
        SensorStatus::Ok
    }
}

pub const MAP_MIN_KPA10: i32 = 200;
pub const MAP_MAX_KPA10: i32 = 2_500;

pub fn validate_map_sensor(map_kpa10: u16) -> SensorStatus {
    validate_sensor(i32::from(map_kpa10), MAP_MIN_KPA10, MAP_MAX_KPA10)
}
