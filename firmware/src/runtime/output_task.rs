use ecu_core::CYLINDER_COUNT;
use ecu_core::sync::Shared;
use embassy_futures::select::select;
use embassy_stm32::gpio::Output;
use embassy_time::Timer;

use super::{IGNITION_BANK, IGNITION_REARM, INJECTION_BANK, INJECTION_REARM};
use crate::hw::{CompareBank, Edge, EdgeBuffer, FirmwareEngine, RearmSignal, micros_now};

type Pins = [Output<'static>; CYLINDER_COUNT];

#[embassy_executor::task]
pub async fn injection(engine: &'static FirmwareEngine, pins: Pins) -> ! {
    drive(&INJECTION_BANK, &INJECTION_REARM, pins, |channel, now| {
        engine.with_actuators(|actuators| {
            if let Some(expected) = actuators.injection.on_compare_match(channel) {
                actuators.hp.record_jitter(expected, now);
            }
        });
    })
    .await
}

#[embassy_executor::task]
pub async fn ignition(engine: &'static FirmwareEngine, pins: Pins) -> ! {
    drive(&IGNITION_BANK, &IGNITION_REARM, pins, |channel, now| {
        engine.with_actuators(|actuators| {
            if let Some(expected) = actuators.ignition.on_compare_match(channel) {
                actuators.hp.record_jitter(expected, now);
            }
        });
    })
    .await
}

/// Services `bank`, switches the pins, and sleeps until the next edge or
/// until a driver re-arms a channel.
async fn drive(
    bank: &'static Shared<CompareBank>,
    rearm: &'static RearmSignal,
    mut pins: Pins,
    mut on_release: impl FnMut(u8, u32),
) -> ! {
    loop {
        let now = micros_now();
        let mut edges = EdgeBuffer::new();
        let delay = bank.lock(|bank| {
            bank.service(now, &mut edges);
            bank.next_delay_us(now)
        });

        for edge in &edges {
            match *edge {
                Edge::Assert(channel) => {
                    if let Some(pin) = pins.get_mut(usize::from(channel)) {
                        pin.set_high();
                    }
                }
                Edge::Release { channel, due_us } => {
                    if let Some(pin) = pins.get_mut(usize::from(channel)) {
                        pin.set_low();
                    }
                    // Forced stops have no commanded edge to measure against.
                    if due_us.is_some() {
                        on_release(channel, now);
                    }
                }
            }
        }

        match delay {
            Some(0) => {}
            Some(delay_us) => {
                let _ = select(Timer::after_micros(u64::from(delay_us)), rearm.wait()).await;
            }
            None => rearm.wait().await,
        }
    }
}
