//! Missing-tooth crank decoder with cam-phase detection.
//!
//! The decoder consumes raw edge timestamps from a free-running 32-bit
//! microsecond clock and maintains a [`SyncState`] describing where the
//! crank is, how fast it turns, and whether the position is trustworthy.

use core::fmt;

/// Consecutive gaps without a cam edge after which the phase is dropped. The
/// cam fires once per cycle, so one silent gap in between is normal.
pub const CAM_LOSS_GAPS: u8 = 2;

/// Synchronisation snapshot shared with the scheduler and the planner.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SyncState {
    pub tooth_index: u16,
    pub tooth_period_us: u32,
    pub time_per_degree_us: u32,
    pub gap_detected: bool,
    pub phase_detected: bool,
    pub revolution_index: u8,
    pub rpm: u32,
    pub sync_valid: bool,
    pub sync_acquired: bool,
    pub last_capture_us: u32,
    pub latency_us: u32,
    pub cmp_tooth_index: u16,
}

impl SyncState {
    /// Crank angle within the current revolution, in degrees.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn revolution_angle_deg(&self, positions: u16) -> f32 {
        if positions == 0 {
            return 0.0;
        }
        f32::from(self.tooth_index) * 360.0 / f32::from(positions)
    }
}

/// Decoder tuning for one trigger wheel.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DecoderConfig {
    pub tooth_count: u16,
    pub missing_teeth: u16,
    pub gap_tooth: u16,
    pub min_rpm: u32,
    pub max_rpm: u32,
    pub enable_phase_detection: bool,
    pub sync_timeout_us: u32,
}

impl DecoderConfig {
    /// 60-2 wheel with cam phase detection.
    pub const fn new() -> Self {
        Self {
            tooth_count: 58,
            missing_teeth: 2,
            gap_tooth: 58,
            min_rpm: 500,
            max_rpm: 8_000,
            enable_phase_detection: true,
            sync_timeout_us: 200_000,
        }
    }

    /// Tooth positions per revolution, counting the missing ones.
    pub const fn positions(&self) -> u16 {
        self.tooth_count + self.missing_teeth
    }

    /// Checks the configuration without touching any decoder.
    pub const fn validate(&self) -> Result<(), DecoderConfigError> {
        if self.tooth_count == 0 {
            return Err(DecoderConfigError::ZeroTeeth);
        }
        if self.missing_teeth == 0 {
            return Err(DecoderConfigError::NoMissingTeeth);
        }
        if self.gap_tooth > self.tooth_count {
            return Err(DecoderConfigError::GapToothOutOfRange);
        }
        if self.min_rpm == 0 {
            return Err(DecoderConfigError::ZeroMinRpm);
        }
        if self.max_rpm < self.min_rpm {
            return Err(DecoderConfigError::InvertedRpmBand);
        }
        Ok(())
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DecoderConfigError {
    ZeroTeeth,
    NoMissingTeeth,
    GapToothOutOfRange,
    ZeroMinRpm,
    InvertedRpmBand,
}

impl fmt::Display for DecoderConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Observer invoked after every processed crank tooth. Runs in interrupt
/// context: must not block or allocate.
pub type ToothCallback = fn(&SyncState);

pub struct TriggerDecoder {
    config: DecoderConfig,
    state: SyncState,
    last_capture: Option<u32>,
    cmp_seen: bool,
    gaps_without_cam: u8,
    running: bool,
    callback: Option<ToothCallback>,
    teeth_seen: u32,
}

impl TriggerDecoder {
    /// Decoder for the default 60-2 wheel, stopped.
    pub const fn new() -> Self {
        Self::from_valid_config(DecoderConfig::new())
    }

    const fn from_valid_config(config: DecoderConfig) -> Self {
        Self {
            config,
            state: SyncState {
                tooth_index: 0,
                tooth_period_us: 0,
                time_per_degree_us: 0,
                gap_detected: false,
                phase_detected: false,
                revolution_index: 0,
                rpm: 0,
                sync_valid: false,
                sync_acquired: false,
                last_capture_us: 0,
                latency_us: u32::MAX,
                cmp_tooth_index: 0,
            },
            last_capture: None,
            cmp_seen: false,
            gaps_without_cam: 0,
            running: false,
            callback: None,
            teeth_seen: 0,
        }
    }

    /// Builds a decoder for a custom wheel.
    pub fn with_config(config: DecoderConfig) -> Result<Self, DecoderConfigError> {
        config.validate()?;
        Ok(Self::from_valid_config(config))
    }

    pub fn config(&self) -> DecoderConfig {
        self.config
    }

    /// Replaces the wheel configuration. Invalid input leaves everything
    /// untouched; valid input also clears the current sync.
    pub fn set_config(&mut self, config: DecoderConfig) -> Result<(), DecoderConfigError> {
        config.validate()?;
        self.config = config;
        self.reset();
        Ok(())
    }

    pub fn start(&mut self) {
        self.running = true;
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.invalidate();
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Drops all history and sync, keeping configuration and run state.
    pub fn reset(&mut self) {
        let running = self.running;
        let callback = self.callback;
        *self = Self::from_valid_config(self.config);
        self.running = running;
        self.callback = callback;
    }

    pub fn register_tooth_callback(&mut self, callback: ToothCallback) {
        self.callback = Some(callback);
    }

    pub fn unregister_tooth_callback(&mut self) {
        self.callback = None;
    }

    /// Total crank edges accepted since the last reset.
    pub fn teeth_seen(&self) -> u32 {
        self.teeth_seen
    }

    /// Raw state as last written by the edge path.
    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Processes one crank edge captured at `capture_us`.
    pub fn on_tooth(&mut self, capture_us: u32) {
        if !self.running {
            return;
        }

        let Some(previous) = self.last_capture.replace(capture_us) else {
            self.state.last_capture_us = capture_us;
            return;
        };
        self.state.last_capture_us = capture_us;

        let period = capture_us.wrapping_sub(previous);
        if period == 0 || period > u32::MAX / 2 {
            self.invalidate();
            return;
        }
        self.teeth_seen = self.teeth_seen.wrapping_add(1);

        let stored = self.state.tooth_period_us;
        let gap = stored > 0 && u64::from(period) * 2 > u64::from(stored) * 3;

        if gap {
            self.state.gap_detected = true;
            self.state.tooth_index = 0;
            if self.cmp_seen {
                self.state.phase_detected = true;
                self.state.revolution_index = 0;
                self.gaps_without_cam = 0;
            } else {
                self.state.phase_detected = false;
                self.state.revolution_index ^= 1;
                self.gaps_without_cam = self.gaps_without_cam.saturating_add(1);
                if self.gaps_without_cam >= CAM_LOSS_GAPS && self.config.enable_phase_detection {
                    self.state.sync_acquired = false;
                }
            }
            self.cmp_seen = false;
            self.state.tooth_period_us = period / (u32::from(self.config.missing_teeth) + 1);
        } else {
            self.state.gap_detected = false;
            self.state.tooth_index = (self.state.tooth_index + 1) % self.config.tooth_count;
            self.state.tooth_period_us = period;
        }

        let positions = u64::from(self.config.positions());
        let revolution_us = u64::from(self.state.tooth_period_us) * positions;
        self.state.time_per_degree_us = u32::try_from((revolution_us + 180) / 360).unwrap_or(u32::MAX);

        if !self.config.enable_phase_detection {
            self.state.phase_detected = true;
        }
        if self.state.gap_detected && self.state.phase_detected {
            self.state.sync_acquired = true;
        }

        self.state.rpm = rpm_from_revolution(revolution_us, &self.config);
        self.state.sync_valid = self.state.rpm > 0;
        self.state.latency_us = 0;
        if !self.state.sync_valid {
            self.state.sync_acquired = false;
        }

        if let Some(callback) = self.callback {
            callback(&self.state);
        }
    }

    /// Records a cam-phase edge; consumed on the next crank gap.
    pub fn on_cam_edge(&mut self, _capture_us: u32) {
        if !self.running {
            return;
        }
        self.cmp_seen = true;
        self.state.cmp_tooth_index = self.state.tooth_index;
    }

    /// Snapshot with latency recomputed against `now_us`. Sync goes invalid
    /// once the last edge is older than the configured timeout.
    pub fn get_data(&self, now_us: u32) -> SyncState {
        let mut data = self.state;
        if self.last_capture.is_none() {
            data.latency_us = u32::MAX;
            data.sync_valid = false;
            data.sync_acquired = false;
            data.rpm = 0;
            return data;
        }

        data.latency_us = now_us.wrapping_sub(data.last_capture_us);
        data.sync_valid = data.rpm > 0 && data.latency_us < self.config.sync_timeout_us;
        if !data.sync_valid {
            data.sync_acquired = false;
            data.rpm = 0;
        }
        data
    }

    fn invalidate(&mut self) {
        self.state.sync_valid = false;
        self.state.sync_acquired = false;
        self.state.rpm = 0;
    }
}

impl Default for TriggerDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// RPM for one revolution time; zero when outside the configured band.
fn rpm_from_revolution(revolution_us: u64, config: &DecoderConfig) -> u32 {
    if revolution_us == 0 {
        return 0;
    }
    let rpm = u32::try_from(60_000_000 / revolution_us).unwrap_or(u32::MAX);
    if rpm < config.min_rpm || rpm > config.max_rpm {
        0
    } else {
        rpm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_decoder() -> TriggerDecoder {
        let mut decoder = TriggerDecoder::new();
        decoder.start();
        decoder
    }

    /// Feeds `revolutions` turns of a 60-2 wheel, returning the next capture time.
    fn feed(decoder: &mut TriggerDecoder, mut now: u32, period: u32, revolutions: u32) -> u32 {
        for _ in 0..revolutions {
            for _ in 0..57 {
                now = now.wrapping_add(period);
                decoder.on_tooth(now);
            }
            now = now.wrapping_add(period * 3);
            decoder.on_tooth(now);
        }
        now
    }

    #[test]
    fn rejects_invalid_config_without_mutation() {
        let mut decoder = running_decoder();
        let before = decoder.config();

        let cases = [
            (DecoderConfig { tooth_count: 0, ..before }, DecoderConfigError::ZeroTeeth),
            (DecoderConfig { gap_tooth: 59, ..before }, DecoderConfigError::GapToothOutOfRange),
            (DecoderConfig { min_rpm: 0, ..before }, DecoderConfigError::ZeroMinRpm),
            (
                DecoderConfig { min_rpm: 900, max_rpm: 800, ..before },
                DecoderConfigError::InvertedRpmBand,
            ),
        ];
        for (config, expected) in cases {
            assert_eq!(decoder.set_config(config), Err(expected));
            assert_eq!(decoder.config(), before);
        }
        assert!(decoder.is_running());
    }

    #[test]
    fn first_capture_only_stores_timestamp() {
        let mut decoder = running_decoder();
        decoder.on_tooth(1_000);
        let state = decoder.state();
        assert_eq!(state.tooth_period_us, 0);
        assert_eq!(state.last_capture_us, 1_000);
        assert!(!state.sync_valid);
    }

    #[test]
    fn constant_period_converges_to_expected_rpm() {
        let mut decoder = running_decoder();
        decoder.on_tooth(0);
        let now = feed(&mut decoder, 0, 1_000, 2);

        let data = decoder.get_data(now + 10);
        assert_eq!(data.rpm, 1_000);
        assert!(data.sync_valid);
        assert_eq!(data.tooth_period_us, 1_000);
        assert_eq!(data.time_per_degree_us, 167);
    }

    #[test]
    fn gap_resets_tooth_index_and_divides_period() {
        let mut decoder = running_decoder();
        decoder.on_tooth(0);
        let mut now = 0;
        for _ in 0..10 {
            now += 1_000;
            decoder.on_tooth(now);
        }
        assert_eq!(decoder.state().tooth_index, 10);

        now += 3_000;
        decoder.on_tooth(now);
        let state = decoder.state();
        assert!(state.gap_detected);
        assert_eq!(state.tooth_index, 0);
        assert_eq!(state.tooth_period_us, 1_000);
    }

    #[test]
    fn cam_edge_before_gap_acquires_full_sync() {
        let mut decoder = running_decoder();
        decoder.on_tooth(0);
        let mut now = feed(&mut decoder, 0, 1_000, 1);
        assert!(!decoder.state().sync_acquired);

        decoder.on_cam_edge(now + 10);
        now = feed(&mut decoder, now, 1_000, 1);

        let state = decoder.get_data(now);
        assert!(state.phase_detected);
        assert!(state.sync_acquired);
        assert_eq!(state.revolution_index, 0);
        assert_eq!(state.cmp_tooth_index, 0);
    }

    #[test]
    fn gap_without_cam_toggles_revolution() {
        let mut decoder = running_decoder();
        decoder.on_tooth(0);
        let now = feed(&mut decoder, 0, 1_000, 1);
        let first = decoder.state().revolution_index;
        feed(&mut decoder, now, 1_000, 1);
        let second = decoder.state();
        assert_ne!(first, second.revolution_index);
        assert!(!second.phase_detected);
        assert!(!second.sync_acquired);
    }

    #[test]
    fn silent_cam_drops_acquired_sync_after_two_gaps() {
        let mut decoder = running_decoder();
        decoder.on_tooth(0);
        decoder.on_cam_edge(0);
        let mut now = feed(&mut decoder, 0, 1_000, 1);
        assert!(decoder.state().sync_acquired);

        now = feed(&mut decoder, now, 1_000, 1);
        assert!(decoder.state().sync_acquired);

        now = feed(&mut decoder, now, 1_000, 1);
        let lost = decoder.get_data(now);
        assert!(lost.sync_valid);
        assert!(!lost.sync_acquired);
        assert!(!lost.phase_detected);

        decoder.on_cam_edge(now + 10);
        now = feed(&mut decoder, now, 1_000, 1);
        assert!(decoder.get_data(now).sync_acquired);
    }

    #[test]
    fn disabled_phase_detection_forces_phase() {
        let config = DecoderConfig {
            enable_phase_detection: false,
            ..DecoderConfig::new()
        };
        let mut decoder = TriggerDecoder::with_config(config).expect("valid config");
        decoder.start();
        decoder.on_tooth(0);
        let now = feed(&mut decoder, 0, 1_000, 1);
        let state = decoder.get_data(now);
        assert!(state.phase_detected);
        assert!(state.sync_acquired);
    }

    #[test]
    fn out_of_band_rpm_invalidates_sync() {
        let mut decoder = running_decoder();
        decoder.on_tooth(0);
        // 60e6 / (3000 * 60) = 333 rpm, below the 500 rpm floor.
        let now = feed(&mut decoder, 0, 3_000, 1);
        let data = decoder.get_data(now);
        assert_eq!(data.rpm, 0);
        assert!(!data.sync_valid);

        // 60e6 / (100 * 60) = 10000 rpm, above the ceiling.
        let now = feed(&mut decoder, now, 100, 1);
        let data = decoder.get_data(now);
        assert_eq!(data.rpm, 0);
        assert!(!data.sync_valid);
    }

    #[test]
    fn stale_capture_invalidates_without_new_edge() {
        let mut decoder = running_decoder();
        decoder.on_tooth(0);
        let now = feed(&mut decoder, 0, 1_000, 1);

        assert!(decoder.get_data(now + 199_999).sync_valid);
        let stale = decoder.get_data(now + 200_000);
        assert!(!stale.sync_valid);
        assert_eq!(stale.rpm, 0);
    }

    #[test]
    fn latency_handles_clock_wraparound() {
        let mut decoder = running_decoder();
        let start = u32::MAX - 30_000;
        decoder.on_tooth(start);
        let now = feed(&mut decoder, start, 1_000, 1);
        assert!(now < start, "capture clock should have wrapped");

        let data = decoder.get_data(now.wrapping_add(50));
        assert_eq!(data.latency_us, 50);
        assert!(data.sync_valid);
    }

    #[test]
    fn no_capture_reports_max_latency() {
        let decoder = running_decoder();
        let data = decoder.get_data(1_000);
        assert_eq!(data.latency_us, u32::MAX);
        assert!(!data.sync_valid);
    }

    #[test]
    fn stopped_decoder_ignores_edges() {
        let mut decoder = TriggerDecoder::new();
        decoder.on_tooth(100);
        decoder.on_tooth(1_100);
        assert_eq!(decoder.teeth_seen(), 0);
    }

    #[test]
    fn tooth_callback_fires_per_edge() {
        use core::sync::atomic::{AtomicU32, Ordering};
        static CALLS: AtomicU32 = AtomicU32::new(0);

        fn on_tooth(_: &SyncState) {
            CALLS.fetch_add(1, Ordering::Relaxed);
        }

        let mut decoder = running_decoder();
        decoder.register_tooth_callback(on_tooth);
        decoder.on_tooth(0);
        decoder.on_tooth(1_000);
        decoder.on_tooth(2_000);
        decoder.unregister_tooth_callback();
        decoder.on_tooth(3_000);
        assert_eq!(CALLS.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn backwards_capture_drops_sync() {
        let mut decoder = running_decoder();
        decoder.on_tooth(0);
        let now = feed(&mut decoder, 0, 1_000, 1);
        assert!(decoder.state().sync_valid);
        decoder.on_tooth(now - 10);
        assert!(!decoder.state().sync_valid);
    }
}
