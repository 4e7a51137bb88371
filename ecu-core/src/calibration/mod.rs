//! Persisted calibration records.
//!
//! Each record lives under its own store key as a versioned blob (see
//! [`store::encode_blob`]). Loading never fails: a missing, corrupt or
//! out-of-range blob is replaced by the record's default, which is saved
//! back immediately. Setters validate first, save second and only then
//! apply, so a failed save leaves the running calibration untouched.

#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use core::fmt;

use libm::roundf;

use crate::angle::wrap720;
use crate::tables::{FuelMaps, TABLE_BLOB_LEN, TABLE_DIM, Table16};

pub mod store;

pub use store::{
    BlobError, ConfigStore, MAX_BLOB_LEN, MemoryConfigStore, StoreError, decode_blob, encode_blob,
};

pub const FUEL_MAPS_KEY: &str = "fuel_maps";
pub const FUEL_MAPS_VERSION: u32 = 1;
pub const EOI_CONFIG_KEY: &str = "eoi_config";
pub const EOI_CONFIG_VERSION: u32 = 2;
pub const EOI_CONFIG_LEGACY_VERSION: u32 = 1;
pub const EOIT_MAP_CONFIG_KEY: &str = "eoit_map_config";
pub const EOIT_MAP_CONFIG_VERSION: u32 = 1;
pub const CLOSED_LOOP_CONFIG_KEY: &str = "closed_loop_cfg";
pub const CLOSED_LOOP_CONFIG_VERSION: u32 = 1;

pub const EOIT_DEFAULT_BOUNDARY: f32 = 6.5;
pub const EOIT_DEFAULT_NORMAL: f32 = 5.55;
pub const EOIT_BOUNDARY_MIN: f32 = 0.0;
pub const EOIT_BOUNDARY_MAX: f32 = 20.0;
pub const EOIT_NORMAL_MIN: f32 = -8.0;
pub const EOIT_NORMAL_MAX: f32 = 16.0;
const EOIT_SCALE_DEG: f32 = 90.0;
const EOIT_OFFSET_DEG: f32 = 784.0;
const EOIT_NORMAL_SCALE: f32 = 100.0;
/// Target used when the calibration produces a non-finite angle.
const EOIT_FALLBACK_TARGET_DEG: f32 = 360.0;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CalibrationError {
    NonFinite,
    IndexOutOfRange,
    Store(StoreError),
    Encode(BlobError),
}

impl fmt::Display for CalibrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<StoreError> for CalibrationError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<BlobError> for CalibrationError {
    fn from(err: BlobError) -> Self {
        Self::Encode(err)
    }
}

/// How a record was obtained at load time.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LoadOutcome {
    Loaded,
    Migrated,
    Defaulted,
}

/// End-of-injection target in crank degrees for a boundary/normal pair.
#[must_use]
pub fn eoit_target_deg(boundary: f32, normal: f32) -> f32 {
    let target = (boundary + normal) * EOIT_SCALE_DEG - EOIT_OFFSET_DEG;
    if target.is_finite() {
        wrap720(target)
    } else {
        EOIT_FALLBACK_TARGET_DEG
    }
}

/// Inverse of [`eoit_target_deg`] for a fixed boundary.
#[must_use]
pub fn eoit_normal_from_target(boundary: f32, target_deg: f32) -> f32 {
    let normal = (target_deg + EOIT_OFFSET_DEG) / EOIT_SCALE_DEG - boundary;
    if normal.is_finite() {
        normal
    } else {
        EOIT_DEFAULT_NORMAL
    }
}

pub fn clamp_boundary(boundary: f32) -> f32 {
    boundary.clamp(EOIT_BOUNDARY_MIN, EOIT_BOUNDARY_MAX)
}

pub fn clamp_normal(normal: f32) -> f32 {
    normal.clamp(EOIT_NORMAL_MIN, EOIT_NORMAL_MAX)
}

/// Normal-map cell encoding: hundredths, saturated to `u16`.
#[must_use]
pub fn normal_to_cell(normal: f32) -> u16 {
    let scaled = clamp_normal(normal) * EOIT_NORMAL_SCALE;
    if scaled <= 0.0 {
        0
    } else {
        roundf(scaled).min(65_535.0) as u16
    }
}

#[must_use]
pub fn normal_from_cell(raw: u16) -> f32 {
    f32::from(raw) / EOIT_NORMAL_SCALE
}

/// EOI boundary and normal angles, stored in degrees.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct EoiCalibration {
    pub boundary: f32,
    pub normal: f32,
    pub fallback_normal: f32,
}

impl EoiCalibration {
    const PAYLOAD_LEN: usize = 12;
    const LEGACY_PAYLOAD_LEN: usize = 8;

    pub const fn new() -> Self {
        Self {
            boundary: EOIT_DEFAULT_BOUNDARY,
            normal: EOIT_DEFAULT_NORMAL,
            fallback_normal: EOIT_DEFAULT_NORMAL,
        }
    }

    fn clamped(self) -> Self {
        Self {
            boundary: clamp_boundary(self.boundary),
            normal: clamp_normal(self.normal),
            fallback_normal: clamp_normal(self.fallback_normal),
        }
    }

    fn is_finite(&self) -> bool {
        self.boundary.is_finite() && self.normal.is_finite() && self.fallback_normal.is_finite()
    }

    pub fn target_deg(&self) -> f32 {
        eoit_target_deg(self.boundary, self.normal)
    }

    pub fn fallback_target_deg(&self) -> f32 {
        eoit_target_deg(self.boundary, self.fallback_normal)
    }

    fn encode(&self) -> [u8; Self::PAYLOAD_LEN] {
        let mut out = [0_u8; Self::PAYLOAD_LEN];
        out[0..4].copy_from_slice(&self.boundary.to_le_bytes());
        out[4..8].copy_from_slice(&self.normal.to_le_bytes());
        out[8..12].copy_from_slice(&self.fallback_normal.to_le_bytes());
        out
    }

    fn decode(version: u32, payload: &[u8]) -> Result<(Self, LoadOutcome), BlobError> {
        match (version, payload.len()) {
            (EOI_CONFIG_VERSION, Self::PAYLOAD_LEN) => {
                let decoded = Self {
                    boundary: read_f32(payload, 0)?,
                    normal: read_f32(payload, 4)?,
                    fallback_normal: read_f32(payload, 8)?,
                };
                if !decoded.is_finite() {
                    return Err(BlobError::InvalidPayload);
                }
                Ok((decoded.clamped(), LoadOutcome::Loaded))
            }
            // Legacy blobs stored absolute EOI angles.
            (EOI_CONFIG_LEGACY_VERSION, Self::LEGACY_PAYLOAD_LEN) => {
                let eoi_deg = read_f32(payload, 0)?;
                let fallback_deg = read_f32(payload, 4)?;
                let boundary = EOIT_DEFAULT_BOUNDARY;
                let migrated = Self {
                    boundary,
                    normal: eoit_normal_from_target(boundary, eoi_deg),
                    fallback_normal: eoit_normal_from_target(boundary, fallback_deg),
                };
                Ok((migrated.clamped(), LoadOutcome::Migrated))
            }
            (EOI_CONFIG_VERSION | EOI_CONFIG_LEGACY_VERSION, _) => Err(BlobError::InvalidPayload),
            (other, _) => Err(BlobError::UnsupportedVersion(other)),
        }
    }
}

impl Default for EoiCalibration {
    fn default() -> Self {
        Self::new()
    }
}

/// Per RPM/load correction of the EOI normal angle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EoitMapConfig {
    pub enabled: bool,
    pub normal_map: Table16,
}

impl EoitMapConfig {
    const PAYLOAD_LEN: usize = 4 + TABLE_BLOB_LEN;

    pub fn new() -> Self {
        Self {
            enabled: false,
            normal_map: Table16::new(normal_to_cell(EOIT_DEFAULT_NORMAL)),
        }
    }

    /// Normal angle at the operating point, clamped to the legal range.
    pub fn normal_at(&self, rpm: u16, load: u16) -> f32 {
        clamp_normal(normal_from_cell(self.normal_map.interpolate(rpm, load)))
    }

    fn encode(&self) -> [u8; Self::PAYLOAD_LEN] {
        let mut out = [0_u8; Self::PAYLOAD_LEN];
        out[0] = u8::from(self.enabled);
        let mut table = [0_u8; TABLE_BLOB_LEN];
        self.normal_map.write_le(&mut table);
        out[4..].copy_from_slice(&table);
        out
    }

    fn decode(version: u32, payload: &[u8]) -> Result<Self, BlobError> {
        if version != EOIT_MAP_CONFIG_VERSION {
            return Err(BlobError::UnsupportedVersion(version));
        }
        if payload.len() != Self::PAYLOAD_LEN {
            return Err(BlobError::InvalidPayload);
        }
        let normal_map = Table16::read_le(&payload[4..]).ok_or(BlobError::InvalidPayload)?;
        Ok(Self {
            enabled: payload[0] != 0,
            normal_map,
        })
    }
}

impl Default for EoitMapConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_closed_loop(enabled: bool) -> [u8; 4] {
    [u8::from(enabled), 0, 0, 0]
}

fn decode_closed_loop(version: u32, payload: &[u8]) -> Result<bool, BlobError> {
    if version != CLOSED_LOOP_CONFIG_VERSION {
        return Err(BlobError::UnsupportedVersion(version));
    }
    match payload {
        [enabled, _, _, _] => Ok(*enabled != 0),
        _ => Err(BlobError::InvalidPayload),
    }
}

const FUEL_MAPS_PAYLOAD_LEN: usize = TABLE_BLOB_LEN * 3;

fn encode_fuel_maps(maps: &FuelMaps) -> [u8; FUEL_MAPS_PAYLOAD_LEN] {
    let mut out = [0_u8; FUEL_MAPS_PAYLOAD_LEN];
    let mut table = [0_u8; TABLE_BLOB_LEN];
    for (chunk, source) in out
        .chunks_exact_mut(TABLE_BLOB_LEN)
        .zip([&maps.ve, &maps.ignition, &maps.lambda])
    {
        source.write_le(&mut table);
        chunk.copy_from_slice(&table);
    }
    out
}

fn decode_fuel_maps(version: u32, payload: &[u8]) -> Result<FuelMaps, BlobError> {
    if version != FUEL_MAPS_VERSION {
        return Err(BlobError::UnsupportedVersion(version));
    }
    if payload.len() != FUEL_MAPS_PAYLOAD_LEN {
        return Err(BlobError::InvalidPayload);
    }
    let mut tables = payload.chunks_exact(TABLE_BLOB_LEN).map(Table16::read_le);
    let mut next = || tables.next().flatten().ok_or(BlobError::InvalidPayload);
    Ok(FuelMaps {
        ve: next()?,
        ignition: next()?,
        lambda: next()?,
    })
}

fn read_f32(payload: &[u8], offset: usize) -> Result<f32, BlobError> {
    let bytes = payload.get(offset..offset + 4).ok_or(BlobError::Truncated)?;
    Ok(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn save_record<S: ConfigStore + ?Sized>(
    store: &mut S,
    key: &str,
    version: u32,
    payload: &[u8],
) -> Result<(), CalibrationError> {
    let mut buf = [0_u8; MAX_BLOB_LEN];
    let blob = encode_blob(version, payload, &mut buf)?;
    store.save(key, blob)?;
    Ok(())
}

fn load_record<S, T>(
    store: &mut S,
    key: &str,
    decode: impl FnOnce(u32, &[u8]) -> Result<T, BlobError>,
) -> Option<T>
where
    S: ConfigStore + ?Sized,
{
    let mut buf = [0_u8; MAX_BLOB_LEN];
    let len = store.load(key, &mut buf).ok()?;
    let (version, payload) = decode_blob(&buf[..len]).ok()?;
    decode(version, payload).ok()
}

/// Loads the fuel maps, installing and saving defaults when the stored
/// blob is missing or corrupt.
pub fn load_fuel_maps<S: ConfigStore + ?Sized>(store: &mut S) -> (FuelMaps, LoadOutcome) {
    if let Some(maps) = load_record(store, FUEL_MAPS_KEY, decode_fuel_maps) {
        return (maps, LoadOutcome::Loaded);
    }
    let maps = FuelMaps::new();
    // A failed default save is retried by the next map persistence pass.
    let _ = save_fuel_maps(store, &maps);
    (maps, LoadOutcome::Defaulted)
}

pub fn save_fuel_maps<S: ConfigStore + ?Sized>(store: &mut S, maps: &FuelMaps) -> Result<(), CalibrationError> {
    save_record(store, FUEL_MAPS_KEY, FUEL_MAPS_VERSION, &encode_fuel_maps(maps))
}

/// Outcome of [`Calibration::load`] per record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LoadReport {
    pub eoi: LoadOutcome,
    pub eoit_map: LoadOutcome,
    pub closed_loop: LoadOutcome,
}

/// Runtime calibration that the planner reads every cycle.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Calibration {
    pub eoi: EoiCalibration,
    pub eoit_map: EoitMapConfig,
    pub closed_loop_enabled: bool,
}

impl Calibration {
    pub fn new() -> Self {
        Self {
            eoi: EoiCalibration::new(),
            eoit_map: EoitMapConfig::new(),
            closed_loop_enabled: true,
        }
    }

    /// Loads every record, repairing the store where needed.
    pub fn load<S: ConfigStore + ?Sized>(store: &mut S) -> (Self, LoadReport) {
        let mut calibration = Self::new();

        let eoi = match load_record(store, EOI_CONFIG_KEY, EoiCalibration::decode) {
            Some((eoi, LoadOutcome::Loaded)) => {
                calibration.eoi = eoi;
                LoadOutcome::Loaded
            }
            Some((eoi, _)) => {
                calibration.eoi = eoi;
                let _ = save_record(store, EOI_CONFIG_KEY, EOI_CONFIG_VERSION, &eoi.encode());
                LoadOutcome::Migrated
            }
            None => {
                let _ = save_record(store, EOI_CONFIG_KEY, EOI_CONFIG_VERSION, &calibration.eoi.encode());
                LoadOutcome::Defaulted
            }
        };

        let eoit_map = if let Some(config) = load_record(store, EOIT_MAP_CONFIG_KEY, EoitMapConfig::decode) {
            calibration.eoit_map = config;
            LoadOutcome::Loaded
        } else {
            let _ = save_record(
                store,
                EOIT_MAP_CONFIG_KEY,
                EOIT_MAP_CONFIG_VERSION,
                &calibration.eoit_map.encode(),
            );
            LoadOutcome::Defaulted
        };

        let closed_loop = if let Some(enabled) = load_record(store, CLOSED_LOOP_CONFIG_KEY, decode_closed_loop) {
            calibration.closed_loop_enabled = enabled;
            LoadOutcome::Loaded
        } else {
            let _ = save_record(
                store,
                CLOSED_LOOP_CONFIG_KEY,
                CLOSED_LOOP_CONFIG_VERSION,
                &encode_closed_loop(calibration.closed_loop_enabled),
            );
            LoadOutcome::Defaulted
        };

        (
            calibration,
            LoadReport {
                eoi,
                eoit_map,
                closed_loop,
            },
        )
    }

    /// Absolute EOI targets in degrees: `(target, fallback)`.
    pub fn eoi_config(&self) -> (f32, f32) {
        (self.eoi.target_deg(), self.eoi.fallback_target_deg())
    }

    /// Sets absolute EOI targets, keeping the current boundary.
    pub fn set_eoi_config<S: ConfigStore + ?Sized>(
        &mut self,
        store: &mut S,
        eoi_deg: f32,
        fallback_deg: f32,
    ) -> Result<(), CalibrationError> {
        if !eoi_deg.is_finite() || !fallback_deg.is_finite() {
            return Err(CalibrationError::NonFinite);
        }
        let boundary = self.eoi.boundary;
        let next = EoiCalibration {
            boundary,
            normal: eoit_normal_from_target(boundary, wrap720(eoi_deg)),
            fallback_normal: eoit_normal_from_target(boundary, wrap720(fallback_deg)),
        }
        .clamped();
        save_record(store, EOI_CONFIG_KEY, EOI_CONFIG_VERSION, &next.encode())?;
        self.eoi = next;
        Ok(())
    }

    pub fn eoit_calibration(&self) -> EoiCalibration {
        self.eoi
    }

    pub fn set_eoit_calibration<S: ConfigStore + ?Sized>(
        &mut self,
        store: &mut S,
        boundary: f32,
        normal: f32,
        fallback_normal: f32,
    ) -> Result<(), CalibrationError> {
        let next = EoiCalibration {
            boundary,
            normal,
            fallback_normal,
        };
        if !next.is_finite() {
            return Err(CalibrationError::NonFinite);
        }
        let next = next.clamped();
        save_record(store, EOI_CONFIG_KEY, EOI_CONFIG_VERSION, &next.encode())?;
        self.eoi = next;
        Ok(())
    }

    pub fn set_eoit_map_enabled<S: ConfigStore + ?Sized>(
        &mut self,
        store: &mut S,
        enabled: bool,
    ) -> Result<(), CalibrationError> {
        let next = EoitMapConfig {
            enabled,
            normal_map: self.eoit_map.normal_map,
        };
        save_record(store, EOIT_MAP_CONFIG_KEY, EOIT_MAP_CONFIG_VERSION, &next.encode())?;
        self.eoit_map = next;
        Ok(())
    }

    pub fn set_eoit_map_cell<S: ConfigStore + ?Sized>(
        &mut self,
        store: &mut S,
        rpm_index: usize,
        load_index: usize,
        normal: f32,
    ) -> Result<(), CalibrationError> {
        if rpm_index >= TABLE_DIM || load_index >= TABLE_DIM {
            return Err(CalibrationError::IndexOutOfRange);
        }
        if !normal.is_finite() {
            return Err(CalibrationError::NonFinite);
        }
        let mut next = self.eoit_map;
        if !next.normal_map.set_cell(load_index, rpm_index, normal_to_cell(normal)) {
            return Err(CalibrationError::IndexOutOfRange);
        }
        save_record(store, EOIT_MAP_CONFIG_KEY, EOIT_MAP_CONFIG_VERSION, &next.encode())?;
        self.eoit_map = next;
        Ok(())
    }

    pub fn eoit_map_cell(&self, rpm_index: usize, load_index: usize) -> Result<f32, CalibrationError> {
        self.eoit_map
            .normal_map
            .cell(load_index, rpm_index)
            .map(normal_from_cell)
            .ok_or(CalibrationError::IndexOutOfRange)
    }

    pub fn set_closed_loop_enabled<S: ConfigStore + ?Sized>(
        &mut self,
        store: &mut S,
        enabled: bool,
    ) -> Result<(), CalibrationError> {
        if self.closed_loop_enabled == enabled {
            return Ok(());
        }
        save_record(
            store,
            CLOSED_LOOP_CONFIG_KEY,
            CLOSED_LOOP_CONFIG_VERSION,
            &encode_closed_loop(enabled),
        )?;
        self.closed_loop_enabled = enabled;
        Ok(())
    }

    /// Normal angle for the operating point, from the map when enabled.
    pub fn normal_for(&self, rpm: u16, load: u16) -> f32 {
        if self.eoit_map.enabled {
            self.eoit_map.normal_at(rpm, load)
        } else {
            self.eoi.normal
        }
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use libm::fabsf;

    use super::*;

    fn close(a: f32, b: f32) -> bool {
        fabsf(a - b) < 1e-3
    }

    #[test]
    fn default_targets_follow_the_calibration_formula() {
        let eoi = EoiCalibration::new();
        // (6.5 + 5.55) * 90 - 784 = 300.5
        assert!(close(eoi.target_deg(), 300.5));
        assert!(close(eoit_target_deg(0.0, -8.0), wrap720(-720.0 - 784.0)));
        assert!(close(eoit_target_deg(f32::INFINITY, 0.0), 360.0));
    }

    #[test]
    fn normal_cells_saturate() {
        assert_eq!(normal_to_cell(5.55), 555);
        assert_eq!(normal_to_cell(-3.0), 0);
        assert_eq!(normal_to_cell(40.0), 1_600);
        assert!(close(normal_from_cell(555), 5.55));
    }

    #[test]
    fn empty_store_installs_and_persists_defaults() {
        let mut store = MemoryConfigStore::new();
        let (calibration, report) = Calibration::load(&mut store);
        assert_eq!(calibration, Calibration::new());
        assert_eq!(report.eoi, LoadOutcome::Defaulted);
        assert_eq!(report.eoit_map, LoadOutcome::Defaulted);
        assert_eq!(report.closed_loop, LoadOutcome::Defaulted);
        assert!(store.contains(EOI_CONFIG_KEY));
        assert!(store.contains(EOIT_MAP_CONFIG_KEY));
        assert!(store.contains(CLOSED_LOOP_CONFIG_KEY));

        let (reloaded, report) = Calibration::load(&mut store);
        assert_eq!(reloaded, calibration);
        assert_eq!(report.eoi, LoadOutcome::Loaded);
    }

    #[test]
    fn legacy_eoi_blob_is_migrated() {
        let mut store = MemoryConfigStore::new();
        let mut payload = [0_u8; 8];
        payload[..4].copy_from_slice(&300.5_f32.to_le_bytes());
        payload[4..].copy_from_slice(&210.5_f32.to_le_bytes());
        save_record(&mut store, EOI_CONFIG_KEY, EOI_CONFIG_LEGACY_VERSION, &payload).expect("seed");

        let (calibration, report) = Calibration::load(&mut store);
        assert_eq!(report.eoi, LoadOutcome::Migrated);
        assert!(close(calibration.eoi.boundary, EOIT_DEFAULT_BOUNDARY));
        assert!(close(calibration.eoi.normal, 5.55));
        assert!(close(calibration.eoi.fallback_normal, 4.55));

        let (_, report) = Calibration::load(&mut store);
        assert_eq!(report.eoi, LoadOutcome::Loaded);
    }

    #[test]
    fn corrupt_blob_is_replaced_by_default() {
        let mut store = MemoryConfigStore::new();
        let mut calibration = Calibration::new();
        calibration
            .set_eoit_calibration(&mut store, 8.0, 4.0, 3.0)
            .expect("set");
        let mut raw = [0_u8; 20];
        raw.copy_from_slice(store.raw(EOI_CONFIG_KEY).expect("stored"));
        raw[6] ^= 0xFF;
        store.save(EOI_CONFIG_KEY, &raw).expect("corrupt");

        let (loaded, report) = Calibration::load(&mut store);
        assert_eq!(report.eoi, LoadOutcome::Defaulted);
        assert_eq!(loaded.eoi, EoiCalibration::new());
    }

    #[test]
    fn setters_validate_and_clamp() {
        let mut store = MemoryConfigStore::new();
        let mut calibration = Calibration::new();
        assert_eq!(
            calibration.set_eoit_calibration(&mut store, f32::NAN, 1.0, 1.0),
            Err(CalibrationError::NonFinite)
        );
        assert_eq!(
            calibration.set_eoit_map_cell(&mut store, 16, 0, 1.0),
            Err(CalibrationError::IndexOutOfRange)
        );
        calibration
            .set_eoit_calibration(&mut store, 25.0, -20.0, 30.0)
            .expect("set");
        let eoi = calibration.eoit_calibration();
        assert!(close(eoi.boundary, 20.0));
        assert!(close(eoi.normal, -8.0));
        assert!(close(eoi.fallback_normal, 16.0));
    }

    #[test]
    fn failed_save_leaves_state_unchanged() {
        let mut store = MemoryConfigStore::new();
        let mut calibration = Calibration::new();
        store.set_fail_saves(true);
        assert_eq!(
            calibration.set_eoit_calibration(&mut store, 7.0, 5.0, 5.0),
            Err(CalibrationError::Store(StoreError::Io))
        );
        assert_eq!(
            calibration.set_eoit_map_cell(&mut store, 1, 1, 7.0),
            Err(CalibrationError::Store(StoreError::Io))
        );
        assert_eq!(
            calibration.set_closed_loop_enabled(&mut store, false),
            Err(CalibrationError::Store(StoreError::Io))
        );
        assert_eq!(calibration, Calibration::new());
    }

    #[test]
    fn eoi_config_round_trips_through_targets() {
        let mut store = MemoryConfigStore::new();
        let mut calibration = Calibration::new();
        calibration
            .set_eoi_config(&mut store, 300.5, 210.5)
            .expect("set");
        let (target, fallback) = calibration.eoi_config();
        assert!(close(target, 300.5));
        assert!(close(fallback, 210.5));
    }

    #[test]
    fn map_cells_drive_the_normal_when_enabled() {
        let mut store = MemoryConfigStore::new();
        let mut calibration = Calibration::new();
        for rpm_index in 0..TABLE_DIM {
            for load_index in 0..TABLE_DIM {
                calibration
                    .set_eoit_map_cell(&mut store, rpm_index, load_index, 7.25)
                    .expect("cell");
            }
        }
        assert!(close(calibration.normal_for(2_000, 600), EOIT_DEFAULT_NORMAL));
        calibration.set_eoit_map_enabled(&mut store, true).expect("enable");
        assert!(close(calibration.normal_for(2_000, 600), 7.25));
        assert!(close(calibration.eoit_map_cell(3, 4).expect("cell"), 7.25));

        let (reloaded, report) = Calibration::load(&mut store);
        assert_eq!(report.eoit_map, LoadOutcome::Loaded);
        assert!(reloaded.eoit_map.enabled);
        assert_eq!(reloaded.eoit_map, calibration.eoit_map);
    }

    #[test]
    fn fuel_maps_persist_with_defaults_on_corruption() {
        let mut store = MemoryConfigStore::new();
        let (maps, outcome) = load_fuel_maps(&mut store);
        assert_eq!(outcome, LoadOutcome::Defaulted);
        assert_eq!(maps, FuelMaps::new());

        let mut edited = maps;
        assert!(edited.ve.set_cell(2, 3, 1_234));
        save_fuel_maps(&mut store, &edited).expect("save");
        let (loaded, outcome) = load_fuel_maps(&mut store);
        assert_eq!(outcome, LoadOutcome::Loaded);
        assert_eq!(loaded, edited);

        store.save(FUEL_MAPS_KEY, &[1, 0, 0, 0, 9, 9, 9, 9]).expect("corrupt");
        let (_, outcome) = load_fuel_maps(&mut store);
        assert_eq!(outcome, LoadOutcome::Defaulted);
    }
}
