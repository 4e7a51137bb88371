//! Telemetry event catalog and the fixed-capacity event ring.
//!
//! The core never logs directly. Notable transitions (sync changes, safety
//! trips, limp entry and exit, stale or failed plans, map persistence) are
//! recorded here as compact events; the firmware mirrors them to `defmt` and
//! host builds print them.

use core::{fmt, time::Duration};

use heapless::{HistoryBuf, OldestOrdered};

use crate::safety::SafetyTrip;

/// Monotonic identifier assigned to each record.
pub type EventId = u32;

/// Total number of telemetry entries retained in memory.
pub const TELEMETRY_RING_CAPACITY: usize = 128;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TelemetryEventKind {
    SyncAcquired,
    SyncLost,
    SafetyTrip(SafetyTrip),
    LimpEntered,
    LimpExited,
    PlanStale,
    ScheduleFailure,
    MapsPersisted,
    CalibrationRepaired,
    Custom(u16),
}

impl fmt::Display for TelemetryEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryEventKind::SyncAcquired => f.write_str("sync-acquired"),
            TelemetryEventKind::SyncLost => f.write_str("sync-lost"),
            TelemetryEventKind::SafetyTrip(trip) => write!(f, "safety-trip {trip}"),
            TelemetryEventKind::LimpEntered => f.write_str("limp-entered"),
            TelemetryEventKind::LimpExited => f.write_str("limp-exited"),
            TelemetryEventKind::PlanStale => f.write_str("plan-stale"),
            TelemetryEventKind::ScheduleFailure => f.write_str("schedule-failure"),
            TelemetryEventKind::MapsPersisted => f.write_str("maps-persisted"),
            TelemetryEventKind::CalibrationRepaired => f.write_str("calibration-repaired"),
            TelemetryEventKind::Custom(code) => write!(f, "custom({code})"),
        }
    }
}

impl TelemetryEventKind {
    const SYNC_ACQUIRED_CODE: u16 = 0x0000;
    const SYNC_LOST_CODE: u16 = 0x0001;
    const SAFETY_TRIP_BASE: u16 = 0x0010;
    const LIMP_ENTERED_CODE: u16 = 0x0020;
    const LIMP_EXITED_CODE: u16 = 0x0021;
    const PLAN_STALE_CODE: u16 = 0x0030;
    const SCHEDULE_FAILURE_CODE: u16 = 0x0031;
    const MAPS_PERSISTED_CODE: u16 = 0x0040;
    const CALIBRATION_REPAIRED_CODE: u16 = 0x0041;

    /// Encodes the event into a compact transport-friendly discriminant.
    #[must_use]
    pub const fn to_raw(self) -> u16 {
        match self {
            TelemetryEventKind::SyncAcquired => Self::SYNC_ACQUIRED_CODE,
            TelemetryEventKind::SyncLost => Self::SYNC_LOST_CODE,
            TelemetryEventKind::SafetyTrip(trip) => Self::SAFETY_TRIP_BASE + trip_index(trip),
            TelemetryEventKind::LimpEntered => Self::LIMP_ENTERED_CODE,
            TelemetryEventKind::LimpExited => Self::LIMP_EXITED_CODE,
            TelemetryEventKind::PlanStale => Self::PLAN_STALE_CODE,
            TelemetryEventKind::ScheduleFailure => Self::SCHEDULE_FAILURE_CODE,
            TelemetryEventKind::MapsPersisted => Self::MAPS_PERSISTED_CODE,
            TelemetryEventKind::CalibrationRepaired => Self::CALIBRATION_REPAIRED_CODE,
            TelemetryEventKind::Custom(code) => code,
        }
    }

    /// Decodes a raw discriminant, falling back to [`TelemetryEventKind::Custom`].
    #[must_use]
    pub fn from_raw(code: u16) -> Self {
        match code {
            Self::SYNC_ACQUIRED_CODE => TelemetryEventKind::SyncAcquired,
            Self::SYNC_LOST_CODE => TelemetryEventKind::SyncLost,
            Self::LIMP_ENTERED_CODE => TelemetryEventKind::LimpEntered,
            Self::LIMP_EXITED_CODE => TelemetryEventKind::LimpExited,
            Self::PLAN_STALE_CODE => TelemetryEventKind::PlanStale,
            Self::SCHEDULE_FAILURE_CODE => TelemetryEventKind::ScheduleFailure,
            Self::MAPS_PERSISTED_CODE => TelemetryEventKind::MapsPersisted,
            Self::CALIBRATION_REPAIRED_CODE => TelemetryEventKind::CalibrationRepaired,
            value if (Self::SAFETY_TRIP_BASE..Self::LIMP_ENTERED_CODE).contains(&value) => {
                trip_from_index(value - Self::SAFETY_TRIP_BASE)
                    .map_or(TelemetryEventKind::Custom(value), TelemetryEventKind::SafetyTrip)
            }
            other => TelemetryEventKind::Custom(other),
        }
    }
}

const fn trip_index(trip: SafetyTrip) -> u16 {
    match trip {
        SafetyTrip::OverRev => 0,
        SafetyTrip::Overheat => 1,
        SafetyTrip::Voltage => 2,
        SafetyTrip::Scheduling => 3,
    }
}

fn trip_from_index(index: u16) -> Option<SafetyTrip> {
    match index {
        0 => Some(SafetyTrip::OverRev),
        1 => Some(SafetyTrip::Overheat),
        2 => Some(SafetyTrip::Voltage),
        3 => Some(SafetyTrip::Scheduling),
        _ => None,
    }
}

/// Payloads carried alongside telemetry events.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TelemetryPayload {
    None,
    /// Value that caused a safety trip.
    Value(i32),
    /// Time spent in limp mode before exiting.
    Limp { time_in_limp: Option<Duration> },
    /// Age of a command dropped by the executor.
    Plan { age_us: u32 },
    /// Map bank version written to storage.
    Persist { version: u32 },
}

/// Trait implemented by monotonic instant wrappers used for telemetry tracking.
pub trait TelemetryInstant: Copy {
    /// Returns the saturating duration from `earlier` to `self`.
    fn saturating_duration_since(&self, earlier: Self) -> Duration;
}

/// Millisecond timestamp used by host builds.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
pub struct Millis(pub u64);

impl TelemetryInstant for Millis {
    fn saturating_duration_since(&self, earlier: Self) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TelemetryRecord<TInstant>
where
    TInstant: Copy,
{
    pub id: EventId,
    pub timestamp: TInstant,
    pub event: TelemetryEventKind,
    pub details: TelemetryPayload,
}

pub type TelemetryRing<TInstant, const CAPACITY: usize = TELEMETRY_RING_CAPACITY> =
    HistoryBuf<TelemetryRecord<TInstant>, CAPACITY>;

/// Records telemetry events into a fixed-size ring buffer.
pub struct TelemetryRecorder<TInstant, const CAPACITY: usize = TELEMETRY_RING_CAPACITY>
where
    TInstant: Copy,
{
    ring: TelemetryRing<TInstant, CAPACITY>,
    limp_entered_at: Option<TInstant>,
    next_event_id: EventId,
}

impl<TInstant, const CAPACITY: usize> TelemetryRecorder<TInstant, CAPACITY>
where
    TInstant: Copy + TelemetryInstant,
{
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ring: HistoryBuf::new(),
            limp_entered_at: None,
            next_event_id: 0,
        }
    }

    /// Recorded telemetry in chronological order.
    pub fn oldest_first(&self) -> OldestOrdered<'_, TelemetryRecord<TInstant>> {
        self.ring.oldest_ordered()
    }

    pub fn latest(&self) -> Option<&TelemetryRecord<TInstant>> {
        self.ring.recent()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn record_sync_change(&mut self, acquired: bool, timestamp: TInstant) -> EventId {
        let event = if acquired {
            TelemetryEventKind::SyncAcquired
        } else {
            TelemetryEventKind::SyncLost
        };
        self.record(event, TelemetryPayload::None, timestamp)
    }

    pub fn record_safety_trip(&mut self, trip: SafetyTrip, value: i32, timestamp: TInstant) -> EventId {
        self.record(
            TelemetryEventKind::SafetyTrip(trip),
            TelemetryPayload::Value(value),
            timestamp,
        )
    }

    /// Records a limp transition; exits carry the time spent in limp.
    pub fn record_limp_transition(&mut self, active: bool, timestamp: TInstant) -> EventId {
        if active {
            self.limp_entered_at = Some(timestamp);
            return self.record(
                TelemetryEventKind::LimpEntered,
                TelemetryPayload::Limp { time_in_limp: None },
                timestamp,
            );
        }
        let time_in_limp = self
            .limp_entered_at
            .take()
            .map(|entered| timestamp.saturating_duration_since(entered));
        self.record(
            TelemetryEventKind::LimpExited,
            TelemetryPayload::Limp { time_in_limp },
            timestamp,
        )
    }

    pub fn record_stale_plan(&mut self, age_us: u32, timestamp: TInstant) -> EventId {
        self.record(
            TelemetryEventKind::PlanStale,
            TelemetryPayload::Plan { age_us },
            timestamp,
        )
    }

    pub fn record_maps_persisted(&mut self, version: u32, timestamp: TInstant) -> EventId {
        self.record(
            TelemetryEventKind::MapsPersisted,
            TelemetryPayload::Persist { version },
            timestamp,
        )
    }

    /// Records an arbitrary telemetry event with the supplied payload.
    pub fn record(&mut self, event: TelemetryEventKind, payload: TelemetryPayload, timestamp: TInstant) -> EventId {
        let id = self.next_event_id;
        self.next_event_id = self.next_event_id.wrapping_add(1);

        self.ring.write(TelemetryRecord {
            id,
            timestamp,
            event,
            details: payload,
        });

        id
    }
}

impl<TInstant, const CAPACITY: usize> Default for TelemetryRecorder<TInstant, CAPACITY>
where
    TInstant: Copy + TelemetryInstant,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_codes_round_trip() {
        let fixtures = [
            TelemetryEventKind::SyncAcquired,
            TelemetryEventKind::SyncLost,
            TelemetryEventKind::SafetyTrip(SafetyTrip::Overheat),
            TelemetryEventKind::SafetyTrip(SafetyTrip::Scheduling),
            TelemetryEventKind::LimpEntered,
            TelemetryEventKind::LimpExited,
            TelemetryEventKind::PlanStale,
            TelemetryEventKind::MapsPersisted,
        ];
        for event in fixtures {
            assert_eq!(TelemetryEventKind::from_raw(event.to_raw()), event);
        }
        assert_eq!(
            TelemetryEventKind::from_raw(0x0017),
            TelemetryEventKind::Custom(0x0017)
        );
    }

    #[test]
    fn limp_exit_reports_time_in_limp() {
        let mut recorder = TelemetryRecorder::<Millis>::new();
        recorder.record_limp_transition(true, Millis(1_000));
        let id = recorder.record_limp_transition(false, Millis(8_500));
        assert_eq!(id, 1);

        let record = recorder.latest().copied().expect("record");
        assert_eq!(record.event, TelemetryEventKind::LimpExited);
        match record.details {
            TelemetryPayload::Limp { time_in_limp } => {
                assert_eq!(time_in_limp, Some(Duration::from_millis(7_500)));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn ring_keeps_the_newest_records() {
        let mut recorder = TelemetryRecorder::<Millis, 4>::new();
        for step in 0..6 {
            recorder.record_stale_plan(step, Millis(u64::from(step)));
        }
        assert_eq!(recorder.len(), 4);
        let ids: heapless::Vec<EventId, 4> = recorder.oldest_first().map(|record| record.id).collect();
        assert_eq!(ids.as_slice(), &[2, 3, 4, 5]);
    }

    #[test]
    fn safety_trip_carries_value() {
        let mut recorder = TelemetryRecorder::<Millis>::new();
        recorder.record_safety_trip(SafetyTrip::OverRev, 7_600, Millis(3));
        let record = recorder.latest().copied().expect("record");
        assert_eq!(record.details, TelemetryPayload::Value(7_600));
        assert_eq!(record.event.to_raw(), 0x0010);
    }
}
