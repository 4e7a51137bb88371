//! Injector and coil output drivers.
//!
//! Each driver owns one continuously running timer with four compare
//! channels, one per cylinder. Targets are absolute counter values in
//! microseconds on the same wrapping 32-bit clock the decoder captures with.

use core::fmt;

use heapless::Vec;

use crate::CYLINDER_COUNT;

pub const MIN_PULSEWIDTH_US: u32 = 500;
pub const MAX_PULSEWIDTH_US: u32 = 18_000;
pub const MAX_DWELL_US: u32 = 5_000;

/// Per-event parameters a driver needs to shape its output.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ActuationParams {
    /// Injector opening held for `pulsewidth_us`.
    Pulse { pulsewidth_us: u32 },
    /// Coil charge ending in a spark; dwell derives from the snapshot.
    Ignition { rpm: u32, vbat_dv: u16 },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DriverError {
    InvalidChannel,
    InvalidParams,
    TargetInPast,
    PairOverlap,
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Capability exposed to the angle scheduler and the degraded executor path.
pub trait Driver {
    /// Current counter value of the owned timer.
    fn now(&self) -> u32;

    /// Arms `channel` so its output event lands on `target_us`.
    fn schedule_absolute(
        &mut self,
        channel: u8,
        target_us: u32,
        params: ActuationParams,
    ) -> Result<(), DriverError>;

    /// Cancels any pending output on `channel`.
    fn stop(&mut self, channel: u8);

    fn stop_all(&mut self);
}

/// One hardware timer with four output-compare channels.
pub trait CompareUnit {
    fn counter(&self) -> u32;

    /// Drives the output active at `assert_at` and inactive at `release_at`.
    fn arm(&mut self, channel: u8, assert_at: u32, release_at: u32);

    fn disarm(&mut self, channel: u8);
}

/// Bookkeeping for one compare channel.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ChannelStatus {
    pub armed: bool,
    pub assert_at: u32,
    pub release_at: u32,
    pub fired: u32,
}

/// `true` when `target` lies strictly after `now` on the wrapping clock.
#[must_use]
pub const fn is_future(target: u32, now: u32) -> bool {
    let delta = target.wrapping_sub(now);
    delta != 0 && delta < u32::MAX / 2
}

fn channel_index(channel: u8) -> Result<usize, DriverError> {
    let index = usize::from(channel);
    if index < CYLINDER_COUNT {
        Ok(index)
    } else {
        Err(DriverError::InvalidChannel)
    }
}

/// Shared channel state and compare-match handling.
struct Outputs<C> {
    unit: C,
    channels: [ChannelStatus; CYLINDER_COUNT],
}

impl<C: CompareUnit> Outputs<C> {
    const fn new(unit: C) -> Self {
        Self {
            unit,
            channels: [ChannelStatus {
                armed: false,
                assert_at: 0,
                release_at: 0,
                fired: 0,
            }; CYLINDER_COUNT],
        }
    }

    fn arm(&mut self, index: usize, assert_at: u32, release_at: u32) {
        #[allow(clippy::cast_possible_truncation)]
        self.unit.arm(index as u8, assert_at, release_at);
        let status = &mut self.channels[index];
        status.armed = true;
        status.assert_at = assert_at;
        status.release_at = release_at;
    }

    fn stop(&mut self, channel: u8) {
        if let Ok(index) = channel_index(channel) {
            self.unit.disarm(channel);
            self.channels[index].armed = false;
        }
    }

    fn stop_all(&mut self) {
        for channel in 0..CYLINDER_COUNT {
            #[allow(clippy::cast_possible_truncation)]
            self.stop(channel as u8);
        }
    }

    fn complete(&mut self, channel: u8) -> Option<u32> {
        let index = channel_index(channel).ok()?;
        let status = &mut self.channels[index];
        if !status.armed {
            return None;
        }
        status.armed = false;
        status.fired = status.fired.wrapping_add(1);
        Some(status.release_at)
    }
}

/// Sequential injector outputs. Cylinders `n` and `n ^ 2` share one timer.
pub struct InjectionDriver<C> {
    outputs: Outputs<C>,
}

impl<C: CompareUnit> InjectionDriver<C> {
    pub const fn new(unit: C) -> Self {
        Self {
            outputs: Outputs::new(unit),
        }
    }

    pub fn status(&self, channel: u8) -> Option<ChannelStatus> {
        channel_index(channel).ok().map(|index| self.outputs.channels[index])
    }

    /// Compare-match on the closing edge; returns the commanded end time.
    pub fn on_compare_match(&mut self, channel: u8) -> Option<u32> {
        self.outputs.complete(channel)
    }

    pub fn unit(&self) -> &C {
        &self.outputs.unit
    }

    pub fn unit_mut(&mut self) -> &mut C {
        &mut self.outputs.unit
    }

    fn overlaps_partner(&self, index: usize, start: u32, end: u32, now: u32) -> bool {
        let partner = self.outputs.channels[index ^ 2];
        if !partner.armed || !is_future(partner.release_at, now) {
            return false;
        }
        let starts_before_partner_ends = !is_future(start, partner.release_at);
        let ends_after_partner_starts = is_future(end, partner.assert_at);
        starts_before_partner_ends && ends_after_partner_starts
    }
}

impl<C: CompareUnit> Driver for InjectionDriver<C> {
    fn now(&self) -> u32 {
        self.outputs.unit.counter()
    }

    fn schedule_absolute(
        &mut self,
        channel: u8,
        target_us: u32,
        params: ActuationParams,
    ) -> Result<(), DriverError> {
        let index = channel_index(channel)?;
        let ActuationParams::Pulse { pulsewidth_us } = params else {
            return Err(DriverError::InvalidParams);
        };
        let pulsewidth = pulsewidth_us.clamp(MIN_PULSEWIDTH_US, MAX_PULSEWIDTH_US);

        let now = self.now();
        if !is_future(target_us, now) {
            return Err(DriverError::TargetInPast);
        }

        let end = target_us.wrapping_add(pulsewidth);
        if self.overlaps_partner(index, target_us, end, now) {
            return Err(DriverError::PairOverlap);
        }

        self.outputs.arm(index, target_us, end);
        Ok(())
    }

    fn stop(&mut self, channel: u8) {
        self.outputs.stop(channel);
    }

    fn stop_all(&mut self) {
        self.outputs.stop_all();
    }
}

/// Coil outputs. The compare target is the spark; dwell starts earlier.
pub struct IgnitionDriver<C> {
    outputs: Outputs<C>,
}

impl<C: CompareUnit> IgnitionDriver<C> {
    pub const fn new(unit: C) -> Self {
        Self {
            outputs: Outputs::new(unit),
        }
    }

    pub fn status(&self, channel: u8) -> Option<ChannelStatus> {
        channel_index(channel).ok().map(|index| self.outputs.channels[index])
    }

    /// Compare-match on the spark edge; returns the commanded spark time.
    pub fn on_compare_match(&mut self, channel: u8) -> Option<u32> {
        self.outputs.complete(channel)
    }

    pub fn unit(&self) -> &C {
        &self.outputs.unit
    }

    pub fn unit_mut(&mut self) -> &mut C {
        &mut self.outputs.unit
    }
}

impl<C: CompareUnit> Driver for IgnitionDriver<C> {
    fn now(&self) -> u32 {
        self.outputs.unit.counter()
    }

    fn schedule_absolute(
        &mut self,
        channel: u8,
        target_us: u32,
        params: ActuationParams,
    ) -> Result<(), DriverError> {
        let index = channel_index(channel)?;
        let ActuationParams::Ignition { rpm, vbat_dv } = params else {
            return Err(DriverError::InvalidParams);
        };
        if rpm == 0 {
            return Err(DriverError::InvalidParams);
        }

        let now = self.now();
        if !is_future(target_us, now) {
            return Err(DriverError::TargetInPast);
        }

        let dwell = dwell_time_us(vbat_dv, rpm);
        let lead = target_us.wrapping_sub(now);
        let dwell_start = if dwell >= lead {
            now
        } else {
            target_us.wrapping_sub(dwell)
        };

        self.outputs.arm(index, dwell_start, target_us);
        Ok(())
    }

    fn stop(&mut self, channel: u8) {
        self.outputs.stop(channel);
    }

    fn stop_all(&mut self) {
        self.outputs.stop_all();
    }
}

/// Coil dwell for the given battery voltage (decivolts) and engine speed.
#[must_use]
pub const fn dwell_time_us(vbat_dv: u16, rpm: u32) -> u32 {
    let base = if vbat_dv < 110 {
        4_500
    } else if vbat_dv < 125 {
        3_500
    } else if vbat_dv < 140 {
        3_000
    } else {
        2_800
    };
    let adjusted = if rpm > 8_000 {
        base * 85 / 100
    } else if rpm < 1_000 {
        base * 115 / 100
    } else {
        base
    };
    if adjusted > MAX_DWELL_US {
        MAX_DWELL_US
    } else {
        adjusted
    }
}

/// Biases the battery voltage used for dwell by coolant temperature, so a
/// hot coil charges shorter and a cold one longer.
#[must_use]
pub fn dwell_voltage_dv(vbat_dv: u16, clt_c: i16) -> u16 {
    let bias: i32 = if clt_c >= 105 {
        10
    } else if clt_c >= 95 {
        5
    } else if clt_c <= 0 {
        -7
    } else if clt_c <= 20 {
        -4
    } else {
        0
    };
    let biased = (i32::from(vbat_dv) + bias).clamp(80, 165);
    u16::try_from(biased).unwrap_or(vbat_dv)
}

/// Armed compare request captured by [`SimCompareUnit`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ArmRecord {
    pub channel: u8,
    pub assert_at: u32,
    pub release_at: u32,
}

pub const SIM_RECORD_CAPACITY: usize = 64;

/// Host-side compare unit that records every request instead of driving pins.
#[derive(Clone, Debug, Default)]
pub struct SimCompareUnit {
    counter: u32,
    records: Vec<ArmRecord, SIM_RECORD_CAPACITY>,
    disarms: u32,
}

impl SimCompareUnit {
    pub const fn new() -> Self {
        Self {
            counter: 0,
            records: Vec::new(),
            disarms: 0,
        }
    }

    pub fn set_counter(&mut self, counter: u32) {
        self.counter = counter;
    }

    pub fn records(&self) -> &[ArmRecord] {
        &self.records
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn disarms(&self) -> u32 {
        self.disarms
    }
}

impl CompareUnit for SimCompareUnit {
    fn counter(&self) -> u32 {
        self.counter
    }

    fn arm(&mut self, channel: u8, assert_at: u32, release_at: u32) {
        if self.records.is_full() {
            self.records.remove(0);
        }
        let _ = self.records.push(ArmRecord {
            channel,
            assert_at,
            release_at,
        });
    }

    fn disarm(&mut self, _channel: u8) {
        self.disarms = self.disarms.wrapping_add(1);
    }
}
