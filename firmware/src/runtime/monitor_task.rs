use ecu_core::monitor::Monitor;
use embassy_stm32::peripherals::IWDG;
use embassy_stm32::wdg::IndependentWatchdog;
use embassy_time::{Duration, Instant, Ticker};

use super::FirmwareStore;
use crate::hw::{FirmwareClock, FirmwareEngine};
use crate::status;
use crate::telemetry::{TelemetryMirror, log_batch};

const TICK_MS: u64 = 100;

/// Persists maps, publishes snapshots, mirrors telemetry and feeds the
/// hardware watchdog. A stalled pipeline stops the feeding and the IWDG
/// resets the part.
#[embassy_executor::task]
pub async fn run(
    engine: &'static FirmwareEngine,
    mut store: FirmwareStore,
    mut watchdog: IndependentWatchdog<'static, IWDG>,
) -> ! {
    let mut monitor = Monitor::default();
    let mut mirror = TelemetryMirror::new();
    let clock = FirmwareClock;
    let mut ticker = Ticker::every(Duration::from_millis(TICK_MS));
    loop {
        ticker.next().await;
        match engine.monitor(&mut monitor, &mut store, &clock) {
            Ok(report) => {
                if let Some(diagnostic) = report.diagnostic {
                    let jitter = diagnostic.jitter;
                    defmt::debug!(
                        "fire jitter last={}us avg={}us max={}us n={}",
                        jitter.last_us,
                        jitter.avg_us,
                        jitter.max_us,
                        jitter.samples
                    );
                }
                status::publish(&report);
            }
            Err(err) => defmt::warn!("monitor: {}", defmt::Display2Format(&err)),
        }

        let batch = engine.with_telemetry(|recorder| mirror.collect(recorder));
        log_batch(&batch);

        if engine.watchdog_alive(Instant::now().as_millis()) {
            watchdog.pet();
        }
    }
}
