//! Mirrors the core telemetry ring to the log.
//!
//! `ecu-core` only records events; this module copies records that appeared
//! since the last drain out of the ring (under the engine lock) and logs them
//! afterwards through defmt on the target or stdout on the host.

#![cfg_attr(not(target_os = "none"), allow(dead_code))]

use ecu_core::telemetry::{
    EventId, Millis, TelemetryEventKind, TelemetryPayload, TelemetryRecord, TelemetryRecorder,
};
use heapless::Vec;

/// Records copied per drain; older unseen records are reported as skipped.
pub const DRAIN_BATCH: usize = 16;

pub type TelemetryBatch = Vec<TelemetryRecord<Millis>, DRAIN_BATCH>;

/// Tracks which records have already been logged.
#[derive(Debug, Default)]
pub struct TelemetryMirror {
    next_id: EventId,
    skipped: u32,
}

impl TelemetryMirror {
    pub const fn new() -> Self {
        Self { next_id: 0, skipped: 0 }
    }

    /// Copies records with ids at or after the cursor, newest last.
    pub fn collect(&mut self, recorder: &TelemetryRecorder<Millis>) -> TelemetryBatch {
        let mut batch = TelemetryBatch::new();
        for record in recorder.oldest_first() {
            if record.id.wrapping_sub(self.next_id) >= u32::MAX / 2 {
                continue;
            }
            if batch.is_full() {
                batch.remove(0);
                self.skipped = self.skipped.wrapping_add(1);
            }
            let _ = batch.push(*record);
        }
        if let Some(last) = batch.last() {
            self.next_id = last.id.wrapping_add(1);
        }
        batch
    }

    pub fn skipped(&self) -> u32 {
        self.skipped
    }
}

/// Logs every record in `batch`.
pub fn log_batch(batch: &TelemetryBatch) {
    for record in batch {
        log_record(record);
    }
}

fn log_record(record: &TelemetryRecord<Millis>) {
    let detail = match record.details {
        TelemetryPayload::None => None,
        TelemetryPayload::Value(value) => Some(("value", i64::from(value))),
        TelemetryPayload::Limp { time_in_limp } => {
            let in_limp_ms = time_in_limp.map_or(-1, |elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX));
            Some(("in_limp_ms", in_limp_ms))
        }
        TelemetryPayload::Plan { age_us } => Some(("age_us", i64::from(age_us))),
        TelemetryPayload::Persist { version } => Some(("version", i64::from(version))),
    };
    emit_log(record.id, record.event, record.timestamp.0, detail);
}

#[cfg(target_os = "none")]
fn emit_log(id: EventId, event: TelemetryEventKind, t_ms: u64, detail: Option<(&'static str, i64)>) {
    let event = defmt::Display2Format(&event);
    if let Some((name, value)) = detail {
        defmt::info!("telemetry #{} {} t={}ms {}={}", id, event, t_ms, name, value);
    } else {
        defmt::info!("telemetry #{} {} t={}ms", id, event, t_ms);
    }
}

#[cfg(not(target_os = "none"))]
fn emit_log(id: EventId, event: TelemetryEventKind, t_ms: u64, detail: Option<(&'static str, i64)>) {
    if let Some((name, value)) = detail {
        println!("telemetry #{id} {event} t={t_ms}ms {name}={value}");
    } else {
        println!("telemetry #{id} {event} t={t_ms}ms");
    }
}
