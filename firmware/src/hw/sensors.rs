//! ADC front end for the engine sensors.
//!
//! Raw 12-bit conversions are turned into a [`SensorSnapshot`] here; a
//! reading outside its plausible electrical window sets the sensor's fault
//! bit and falls back to a safe substitute value.

use ecu_core::safety::{SensorStatus, validate_map_sensor, validate_sensor};
use ecu_core::sensors::{SensorFaults, SensorSnapshot};

const ADC_FULL_SCALE: u32 = 4_095;
const ADC_REF_MV: u32 = 3_300;
/// Battery sense divider (ratio 1:6).
const VBAT_DIVIDER: u32 = 6;

/// Below this the line is shorted to ground or the sensor is unplugged.
const OPEN_OR_SHORT_LOW: u16 = 40;
/// Above this the line is shorted to the reference.
const OPEN_OR_SHORT_HIGH: u16 = 4_055;

const MAP_MIN_KPA10: u32 = 100;
const MAP_MAX_KPA10: u32 = 2_500;
const SUBSTITUTE_MAP_KPA10: u16 = 1_000;
const SUBSTITUTE_TEMP_C: i16 = 60;

/// NTC thermistor curve as `(raw, °C)`, raw decreasing with temperature.
const THERMISTOR_CURVE: [(u16, i16); 8] = [
    (3_900, -30),
    (3_550, 0),
    (3_000, 20),
    (2_300, 40),
    (1_550, 60),
    (950, 80),
    (560, 100),
    (330, 120),
];

/// One round of raw conversions.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RawSample {
    pub map: u16,
    pub tps: u16,
    pub clt: u16,
    pub iat: u16,
    pub o2: u16,
    pub vbat: u16,
}

fn line_status(raw: u16) -> SensorStatus {
    validate_sensor(
        i32::from(raw),
        i32::from(OPEN_OR_SHORT_LOW),
        i32::from(OPEN_OR_SHORT_HIGH),
    )
}

fn millivolts(raw: u16) -> u32 {
    u32::from(raw.min(4_095)) * ADC_REF_MV / ADC_FULL_SCALE
}

/// Linear MAP sensor, 0.5 V .. 4.5 V at the sensor scaled to 10 .. 250 kPa.
fn map_kpa10(raw: u16) -> u16 {
    let span = u32::from(OPEN_OR_SHORT_HIGH - OPEN_OR_SHORT_LOW);
    let offset = u32::from(raw.saturating_sub(OPEN_OR_SHORT_LOW)).min(span);
    let kpa10 = MAP_MIN_KPA10 + offset * (MAP_MAX_KPA10 - MAP_MIN_KPA10) / span;
    u16::try_from(kpa10).unwrap_or(u16::MAX)
}

fn tps_pct10(raw: u16) -> u16 {
    let span = u32::from(OPEN_OR_SHORT_HIGH - OPEN_OR_SHORT_LOW);
    let offset = u32::from(raw.saturating_sub(OPEN_OR_SHORT_LOW)).min(span);
    u16::try_from(offset * 1_000 / span).unwrap_or(1_000)
}

fn thermistor_c(raw: u16) -> i16 {
    let (first_raw, first_c) = THERMISTOR_CURVE[0];
    if raw >= first_raw {
        return first_c;
    }
    for pair in THERMISTOR_CURVE.windows(2) {
        let (hi_raw, hi_c) = pair[0];
        let (lo_raw, lo_c) = pair[1];
        if raw >= lo_raw {
            let span = i32::from(hi_raw - lo_raw);
            let into = i32::from(hi_raw - raw);
            let c = i32::from(hi_c) + (i32::from(lo_c) - i32::from(hi_c)) * into / span;
            return i16::try_from(c).unwrap_or(hi_c);
        }
    }
    THERMISTOR_CURVE[THERMISTOR_CURVE.len() - 1].1
}

fn vbat_dv(raw: u16) -> u16 {
    u16::try_from(millivolts(raw) * VBAT_DIVIDER / 100).unwrap_or(u16::MAX)
}

/// Converts one round of samples into a snapshot stamped `now_ms`.
pub fn snapshot_from_raw(raw: &RawSample, now_ms: u64) -> SensorSnapshot {
    let mut faults = SensorFaults::NONE;
    let mut checked = |value: u16, fault: SensorFaults| {
        let ok = line_status(value) == SensorStatus::Ok;
        if !ok {
            faults = faults.union(fault);
        }
        ok
    };

    let map_kpa10 = if checked(raw.map, SensorFaults::MAP) {
        map_kpa10(raw.map)
    } else {
        SUBSTITUTE_MAP_KPA10
    };
    let tps_pct10 = if checked(raw.tps, SensorFaults::TPS) {
        tps_pct10(raw.tps)
    } else {
        0
    };
    let clt_c = if checked(raw.clt, SensorFaults::CLT) {
        thermistor_c(raw.clt)
    } else {
        SUBSTITUTE_TEMP_C
    };
    let iat_c = if checked(raw.iat, SensorFaults::IAT) {
        thermistor_c(raw.iat)
    } else {
        SUBSTITUTE_TEMP_C
    };
    let map_kpa10 = if validate_map_sensor(map_kpa10) == SensorStatus::Ok {
        map_kpa10
    } else {
        faults = faults.union(SensorFaults::MAP);
        SUBSTITUTE_MAP_KPA10
    };
    // Narrowband O2 idles near 0 V when cold; only a pegged rail is a fault.
    let o2_mv = if raw.o2 > OPEN_OR_SHORT_HIGH {
        faults = faults.union(SensorFaults::O2);
        0
    } else {
        u16::try_from(millivolts(raw.o2)).unwrap_or(0)
    };
    let vbat_dv = vbat_dv(raw.vbat);
    if raw.vbat < OPEN_OR_SHORT_LOW {
        faults = faults.union(SensorFaults::VBAT);
    }

    SensorSnapshot {
        map_kpa10,
        tps_pct10,
        clt_c,
        iat_c,
        o2_mv,
        vbat_dv,
        knock: false,
        faults,
        timestamp_ms: now_ms,
    }
}

#[cfg(target_os = "none")]
pub use target::SensorAdc;

#[cfg(target_os = "none")]
mod target {
    use embassy_stm32::adc::{Adc, AnyAdcChannel, SampleTime};
    use embassy_stm32::peripherals::ADC1;

    use super::RawSample;

    /// The six sensor inputs on ADC1.
    pub struct SensorAdc<'d> {
        adc: Adc<'d, ADC1>,
        map: AnyAdcChannel<ADC1>,
        tps: AnyAdcChannel<ADC1>,
        clt: AnyAdcChannel<ADC1>,
        iat: AnyAdcChannel<ADC1>,
        o2: AnyAdcChannel<ADC1>,
        vbat: AnyAdcChannel<ADC1>,
    }

    impl<'d> SensorAdc<'d> {
        pub fn new(mut adc: Adc<'d, ADC1>, channels: [AnyAdcChannel<ADC1>; 6]) -> Self {
            adc.set_sample_time(SampleTime::CYCLES79_5);
            let [map, tps, clt, iat, o2, vbat] = channels;
            Self {
                adc,
                map,
                tps,
                clt,
                iat,
                o2,
                vbat,
            }
        }

        pub fn sample(&mut self) -> RawSample {
            RawSample {
                map: self.adc.blocking_read(&mut self.map),
                tps: self.adc.blocking_read(&mut self.tps),
                clt: self.adc.blocking_read(&mut self.clt),
                iat: self.adc.blocking_read(&mut self.iat),
                o2: self.adc.blocking_read(&mut self.o2),
                vbat: self.adc.blocking_read(&mut self.vbat),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nominal() -> RawSample {
        RawSample {
            map: 1_600,
            tps: 40,
            clt: 950,
            iat: 3_000,
            o2: 560,
            vbat: 2_900,
        }
    }

    #[test]
    fn nominal_sample_converts_without_faults() {
        let snapshot = snapshot_from_raw(&nominal(), 1_234);
        assert!(snapshot.faults.is_empty());
        assert_eq!(snapshot.clt_c, 80);
        assert_eq!(snapshot.iat_c, 20);
        assert_eq!(snapshot.tps_pct10, 0);
        assert_eq!(snapshot.o2_mv, 451);
        assert_eq!(snapshot.vbat_dv, 140);
        assert!((1_000..=1_050).contains(&snapshot.map_kpa10));
        assert_eq!(snapshot.timestamp_ms, 1_234);
    }

    #[test]
    fn implausibly_low_manifold_pressure_is_substituted() {
        // 15 kPa: inside the electrical window, below the plausible range.
        let raw = RawSample { map: 160, ..nominal() };
        let snapshot = snapshot_from_raw(&raw, 0);
        assert!(snapshot.faults.contains(SensorFaults::MAP));
        assert_eq!(snapshot.map_kpa10, SUBSTITUTE_MAP_KPA10);
    }

    #[test]
    fn rail_status_distinguishes_ground_and_supply() {
        assert_eq!(line_status(0), SensorStatus::ShortToGround);
        assert_eq!(line_status(4_095), SensorStatus::ShortToSupply);
        assert_eq!(line_status(2_000), SensorStatus::Ok);
    }

    #[test]
    fn thermistor_interpolates_between_points() {
        assert_eq!(thermistor_c(1_250), 70);
        assert_eq!(thermistor_c(4_000), -30);
        assert_eq!(thermistor_c(100), 120);
    }

    #[test]
    fn shorted_inputs_fall_back_and_flag() {
        let raw = RawSample {
            map: 0,
            clt: 4_095,
            vbat: 0,
            ..nominal()
        };
        let snapshot = snapshot_from_raw(&raw, 0);
        assert!(snapshot.faults.contains(SensorFaults::MAP));
        assert!(snapshot.faults.contains(SensorFaults::CLT));
        assert!(snapshot.faults.contains(SensorFaults::VBAT));
        assert!(!snapshot.faults.contains(SensorFaults::IAT));
        assert_eq!(snapshot.map_kpa10, SUBSTITUTE_MAP_KPA10);
        assert_eq!(snapshot.clt_c, SUBSTITUTE_TEMP_C);
    }
}
