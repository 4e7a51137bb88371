use ecu_core::pipeline::{CycleOutcome, Executor, Planner, WAKE_TIMEOUT_MS};
use embassy_time::{Duration, with_timeout};

use super::{EXEC_WAKE, PLAN_WAKE};
use crate::hw::{FirmwareClock, FirmwareEngine};

/// Woken by every decoded tooth; the timeout keeps lost-sync detection
/// running while the crank is stopped.
#[embassy_executor::task]
pub async fn planner(engine: &'static FirmwareEngine) -> ! {
    let mut planner = Planner::default();
    let clock = FirmwareClock;
    loop {
        let _ = with_timeout(Duration::from_millis(WAKE_TIMEOUT_MS), PLAN_WAKE.wait()).await;
        match engine.plan(&mut planner, &clock) {
            Ok(true) => EXEC_WAKE.signal(()),
            Ok(false) => {}
            Err(err) => defmt::trace!("planner idle: {}", defmt::Display2Format(&err)),
        }
    }
}

#[embassy_executor::task]
pub async fn executor(engine: &'static FirmwareEngine) -> ! {
    let mut executor = Executor::default();
    let clock = FirmwareClock;
    loop {
        let _ = with_timeout(Duration::from_millis(WAKE_TIMEOUT_MS), EXEC_WAKE.wait()).await;
        match engine.execute(&mut executor, &clock) {
            Ok(CycleOutcome::Stale { age_us }) => defmt::debug!("dropped stale command ({} us)", age_us),
            Ok(_) => {}
            Err(err) => defmt::trace!("executor idle: {}", defmt::Display2Format(&err)),
        }
    }
}
