use cortex_m::interrupt;
use cortex_m::register::primask;
use critical_section::{self, RawRestoreState};
use defmt_rtt as _;
use ecu_core::calibration::ConfigStore;
use ecu_core::decoder::SyncState;
use ecu_core::drivers::{IgnitionDriver, InjectionDriver};
use ecu_core::engine::EngineControl;
use ecu_core::sync::Shared;
use embassy_executor::{InterruptExecutor, Spawner};
use embassy_stm32 as hal;
use embassy_stm32::adc::{Adc, AdcChannel};
use embassy_stm32::exti::ExtiInput;
use embassy_stm32::flash::{Blocking, Flash};
use embassy_stm32::gpio::{Level, Output, Pull, Speed};
use embassy_stm32::interrupt::{InterruptExt, Priority};
use embassy_stm32::wdg::IndependentWatchdog;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::Instant;
use static_cell::StaticCell;

use crate::hw::sensors::SensorAdc;
use crate::hw::{AlarmCompareUnit, CompareBank, FirmwareEngine, RearmSignal};
use crate::store::FlashConfigStore;

mod edge_task;
mod monitor_task;
mod output_task;
mod pipeline_task;
mod sensor_task;

critical_section::set_impl!(InterruptCriticalSection);

struct InterruptCriticalSection;

unsafe impl critical_section::Impl for InterruptCriticalSection {
    unsafe fn acquire() -> RawRestoreState {
        let primask = primask::read();
        interrupt::disable();
        primask.is_active()
    }

    unsafe fn release(restore_state: RawRestoreState) {
        if restore_state {
            unsafe {
                interrupt::enable();
            }
        }
    }
}

pub(super) type WakeSignal = Signal<CriticalSectionRawMutex, ()>;
pub(super) type FirmwareStore = FlashConfigStore<Flash<'static, Blocking>>;

/// IWDG period; the Monitor pets it every tick while the pipeline is alive.
const IWDG_TIMEOUT_US: u32 = 500_000;

pub(super) static INJECTION_BANK: Shared<CompareBank> = Shared::new(CompareBank::new());
pub(super) static IGNITION_BANK: Shared<CompareBank> = Shared::new(CompareBank::new());
pub(super) static INJECTION_REARM: RearmSignal = Signal::new();
pub(super) static IGNITION_REARM: RearmSignal = Signal::new();
pub(super) static PLAN_WAKE: WakeSignal = Signal::new();
pub(super) static EXEC_WAKE: WakeSignal = Signal::new();
pub(super) static KNOCK_LATCH: Shared<bool> = Shared::new(false);

static ENGINE: StaticCell<FirmwareEngine> = StaticCell::new();
/// Crank, cam and output tasks preempt the pipeline tasks on this executor.
static EDGE_EXECUTOR: InterruptExecutor = InterruptExecutor::new();

#[hal::interrupt]
unsafe fn USART3_4_5_6_LPUART1() {
    unsafe { EDGE_EXECUTOR.on_interrupt() }
}

fn wake_planner(_: &SyncState) {
    PLAN_WAKE.signal(());
}

#[embassy_executor::main]
pub async fn main(spawner: Spawner) {
    let config = hal::Config::default();
    let p = hal::init(config);

    let mut store = FlashConfigStore::new(Flash::new_blocking(p.FLASH));
    let engine: &'static FirmwareEngine = ENGINE.init(EngineControl::new(
        InjectionDriver::new(AlarmCompareUnit::new(&INJECTION_BANK, &INJECTION_REARM)),
        IgnitionDriver::new(AlarmCompareUnit::new(&IGNITION_BANK, &IGNITION_REARM)),
    ));
    start_engine(engine, &mut store);
    engine.register_tooth_callback(wake_planner);

    let mut watchdog = IndependentWatchdog::new(p.IWDG, IWDG_TIMEOUT_US);
    watchdog.unleash();

    let crank = ExtiInput::new(p.PA8, p.EXTI8, Pull::None);
    let cam = ExtiInput::new(p.PA15, p.EXTI15, Pull::Up);
    let knock = ExtiInput::new(p.PB9, p.EXTI9, Pull::Down);
    let injectors = [
        Output::new(p.PB0, Level::Low, Speed::VeryHigh),
        Output::new(p.PB1, Level::Low, Speed::VeryHigh),
        Output::new(p.PB3, Level::Low, Speed::VeryHigh),
        Output::new(p.PB4, Level::Low, Speed::VeryHigh),
    ];
    let coils = [
        Output::new(p.PB5, Level::Low, Speed::VeryHigh),
        Output::new(p.PB6, Level::Low, Speed::VeryHigh),
        Output::new(p.PB7, Level::Low, Speed::VeryHigh),
        Output::new(p.PB8, Level::Low, Speed::VeryHigh),
    ];
    let adc = SensorAdc::new(
        Adc::new(p.ADC1),
        [
            p.PA0.degrade_adc(),
            p.PA1.degrade_adc(),
            p.PA4.degrade_adc(),
            p.PA5.degrade_adc(),
            p.PA6.degrade_adc(),
            p.PA7.degrade_adc(),
        ],
    );

    hal::interrupt::USART3_4_5_6_LPUART1.set_priority(Priority::P1);
    let edge_spawner = EDGE_EXECUTOR.start(hal::interrupt::USART3_4_5_6_LPUART1);
    edge_spawner
        .spawn(edge_task::crank(engine, crank))
        .expect("failed to spawn crank task");
    edge_spawner
        .spawn(edge_task::cam(engine, cam))
        .expect("failed to spawn cam task");
    edge_spawner
        .spawn(edge_task::knock(knock))
        .expect("failed to spawn knock task");
    edge_spawner
        .spawn(output_task::injection(engine, injectors))
        .expect("failed to spawn injection output task");
    edge_spawner
        .spawn(output_task::ignition(engine, coils))
        .expect("failed to spawn ignition output task");

    spawner
        .spawn(pipeline_task::planner(engine))
        .expect("failed to spawn planner task");
    spawner
        .spawn(pipeline_task::executor(engine))
        .expect("failed to spawn executor task");
    spawner
        .spawn(sensor_task::run(engine, adc))
        .expect("failed to spawn sensor task");
    spawner
        .spawn(monitor_task::run(engine, store, watchdog))
        .expect("failed to spawn monitor task");

    core::future::pending::<()>().await;
}

/// Brings the engine up from flash; a failed init leaves it stopped and the
/// pipeline tasks report `NotInitialized` until the next reset.
fn start_engine<S: ConfigStore>(engine: &FirmwareEngine, store: &mut S) {
    let now_ms = Instant::now().as_millis();
    match engine.init(store, now_ms) {
        Ok(report) if report.repaired() => {
            defmt::warn!(
                "calibration repaired: maps={} eoi={} eoit_map={} closed_loop={}",
                defmt::Debug2Format(&report.fuel_maps),
                defmt::Debug2Format(&report.calibration.eoi),
                defmt::Debug2Format(&report.calibration.eoit_map),
                defmt::Debug2Format(&report.calibration.closed_loop),
            );
        }
        Ok(_) => defmt::info!("calibration loaded"),
        Err(err) => {
            defmt::error!("engine init failed: {}", defmt::Display2Format(&err));
            return;
        }
    }
    if let Err(err) = engine.start(now_ms) {
        defmt::error!("engine start failed: {}", defmt::Display2Format(&err));
    }
}
