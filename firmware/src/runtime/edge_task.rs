use embassy_stm32::exti::ExtiInput;

use crate::hw::{FirmwareEngine, micros_now};

/// Timestamps every falling crank edge and hands it to the decoder, which
/// fires whatever angle events fell due.
#[embassy_executor::task]
pub async fn crank(engine: &'static FirmwareEngine, mut input: ExtiInput<'static>) -> ! {
    loop {
        input.wait_for_falling_edge().await;
        let report = engine.on_crank_edge(micros_now());
        if report.failed > 0 {
            defmt::warn!(
                "{} event(s) failed to arm: {}",
                report.failed,
                defmt::Debug2Format(&report.last_error)
            );
        }
    }
}

#[embassy_executor::task]
pub async fn cam(engine: &'static FirmwareEngine, mut input: ExtiInput<'static>) -> ! {
    loop {
        input.wait_for_rising_edge().await;
        engine.on_cam_edge(micros_now());
    }
}

/// Latches the knock detector's interrupt line until the sensor task
/// picks it up with the next sample.
#[embassy_executor::task]
pub async fn knock(mut input: ExtiInput<'static>) -> ! {
    loop {
        input.wait_for_rising_edge().await;
        super::KNOCK_LATCH.lock(|seen| *seen = true);
    }
}
