use embassy_time::{Duration, Instant, Ticker};

use ecu_core::sensors::SensorSnapshot;

use super::KNOCK_LATCH;
use crate::hw::FirmwareEngine;
use crate::hw::sensors::{SensorAdc, snapshot_from_raw};

const SAMPLE_PERIOD_MS: u64 = 10;

#[embassy_executor::task]
pub async fn run(engine: &'static FirmwareEngine, mut adc: SensorAdc<'static>) -> ! {
    let mut ticker = Ticker::every(Duration::from_millis(SAMPLE_PERIOD_MS));
    loop {
        ticker.next().await;
        let raw = adc.sample();
        let snapshot = SensorSnapshot {
            knock: KNOCK_LATCH.lock(core::mem::take),
            ..snapshot_from_raw(&raw, Instant::now().as_millis())
        };
        if !snapshot.faults.is_empty() {
            defmt::trace!("sensor faults: {=u8:b}", snapshot.faults.bits());
        }
        engine.publish_sensors(snapshot);
    }
}
