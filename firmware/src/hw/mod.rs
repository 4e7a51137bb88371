//! Board glue between `ecu-core` and the STM32G0 peripherals.
//!
//! The injector and coil outputs are plain GPIOs switched by an output task
//! that sleeps on the Embassy time driver until the next compare edge; the
//! drivers in `ecu-core` only ever see the [`AlarmCompareUnit`] handle.

#![cfg_attr(not(target_os = "none"), allow(dead_code))]
#![allow(clippy::cast_possible_truncation)]

use ecu_core::drivers::{CompareUnit, IgnitionDriver, InjectionDriver};
use ecu_core::engine::EngineControl;
use ecu_core::pipeline::Clock;
use ecu_core::sync::Shared;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::Instant;

pub mod compare;
pub mod sensors;

pub use compare::{CompareBank, Edge, EdgeBuffer};

pub type RearmSignal = Signal<CriticalSectionRawMutex, ()>;

pub type FirmwareEngine = EngineControl<InjectionDriver<AlarmCompareUnit>, IgnitionDriver<AlarmCompareUnit>>;

/// Capture clock shared by the decoder, the drivers and the pipeline: the
/// Embassy tick counter at 1 MHz, truncated to 32 bits.
pub fn micros_now() -> u32 {
    Instant::now().as_micros() as u32
}

/// [`Clock`] over the Embassy time driver.
#[derive(Copy, Clone, Debug, Default)]
pub struct FirmwareClock;

impl Clock for FirmwareClock {
    fn now_us(&self) -> u32 {
        micros_now()
    }

    fn now_ms(&self) -> u64 {
        Instant::now().as_millis()
    }
}

/// Compare unit whose channels live in a [`CompareBank`] serviced by an
/// output task. Every change wakes that task so it can re-plan its sleep.
pub struct AlarmCompareUnit {
    bank: &'static Shared<CompareBank>,
    rearm: &'static RearmSignal,
}

impl AlarmCompareUnit {
    pub const fn new(bank: &'static Shared<CompareBank>, rearm: &'static RearmSignal) -> Self {
        Self { bank, rearm }
    }
}

impl CompareUnit for AlarmCompareUnit {
    fn counter(&self) -> u32 {
        micros_now()
    }

    fn arm(&mut self, channel: u8, assert_at: u32, release_at: u32) {
        if self.bank.lock(|bank| bank.arm(channel, assert_at, release_at)) {
            self.rearm.signal(());
        }
    }

    fn disarm(&mut self, channel: u8) {
        if self.bank.lock(|bank| bank.disarm(channel)) {
            self.rearm.signal(());
        }
    }
}
