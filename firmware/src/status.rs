#![cfg_attr(not(target_os = "none"), allow(dead_code))]

//! Latest diagnostic snapshots for the wireless/diagnostic link.
//!
//! The Monitor task is the only writer. Readers copy through the seqlock and
//! never stall the Monitor; a slot reads `None` until its first publication.

use ecu_core::monitor::{Diagnostic, EngineStatus, MonitorReport, SensorData};
use ecu_core::sync::SeqLock;
use portable_atomic::{AtomicU32, Ordering};

static ENGINE_STATUS: SeqLock<Option<EngineStatus>> = SeqLock::new(None);
static SENSOR_DATA: SeqLock<Option<SensorData>> = SeqLock::new(None);
static DIAGNOSTIC: SeqLock<Option<Diagnostic>> = SeqLock::new(None);
/// Reports published since boot.
static REPORTS: AtomicU32 = AtomicU32::new(0);

/// Publishes whichever snapshots the Monitor produced this tick.
pub fn publish(report: &MonitorReport) {
    if report.is_empty() {
        return;
    }
    if let Some(status) = report.status {
        ENGINE_STATUS.publish(Some(status));
    }
    if let Some(sensors) = report.sensors {
        SENSOR_DATA.publish(Some(sensors));
    }
    if let Some(diagnostic) = report.diagnostic {
        DIAGNOSTIC.publish(Some(diagnostic));
    }
    REPORTS.fetch_add(1, Ordering::Relaxed);
}

pub fn engine_status() -> Option<EngineStatus> {
    ENGINE_STATUS.read().flatten()
}

pub fn sensor_data() -> Option<SensorData> {
    SENSOR_DATA.read().flatten()
}

pub fn diagnostic() -> Option<Diagnostic> {
    DIAGNOSTIC.read().flatten()
}

pub fn reports_published() -> u32 {
    REPORTS.load(Ordering::Relaxed)
}
