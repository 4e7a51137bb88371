//! Flash-backed [`ConfigStore`].
//!
//! Every calibration record owns one erase page at the top of flash. A page
//! starts with a small header (magic, payload length) followed by the blob
//! produced by `ecu-core`, padded to the flash write granule. Saves erase and
//! rewrite the whole page; a torn save shows up as a header or blob
//! mismatch and is repaired by the core on the next load.

#![cfg_attr(not(target_os = "none"), allow(dead_code))]

use ecu_core::calibration::{
    CLOSED_LOOP_CONFIG_KEY, ConfigStore, EOI_CONFIG_KEY, EOIT_MAP_CONFIG_KEY, FUEL_MAPS_KEY, MAX_BLOB_LEN,
    StoreError,
};

pub const PAGE_SIZE: u32 = 2_048;
/// Offset of the first record page from the start of flash.
pub const STORE_BASE: u32 = 0x0007_E000;
const WRITE_GRANULE: usize = 8;
const SLOT_MAGIC: [u8; 4] = *b"ECUC";
const HEADER_LEN: usize = 8;

/// Record keys in page order.
pub const SLOT_KEYS: [&str; 4] = [FUEL_MAPS_KEY, EOI_CONFIG_KEY, EOIT_MAP_CONFIG_KEY, CLOSED_LOOP_CONFIG_KEY];

/// Raw flash access with offsets relative to the start of flash.
pub trait FlashRegion {
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), StoreError>;

    /// Erases `[from, to)`; both ends are page aligned.
    fn erase(&mut self, from: u32, to: u32) -> Result<(), StoreError>;

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), StoreError>;
}

pub struct FlashConfigStore<F> {
    flash: F,
    page: [u8; PAGE_SIZE as usize],
}

fn slot_offset(key: &str) -> Option<u32> {
    let index = SLOT_KEYS.iter().position(|slot| *slot == key)?;
    let index = u32::try_from(index).ok()?;
    Some(STORE_BASE + index * PAGE_SIZE)
}

impl<F: FlashRegion> FlashConfigStore<F> {
    pub const fn new(flash: F) -> Self {
        Self {
            flash,
            page: [0xFF; PAGE_SIZE as usize],
        }
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }
}

impl<F: FlashRegion> ConfigStore for FlashConfigStore<F> {
    fn load(&mut self, key: &str, buf: &mut [u8]) -> Result<usize, StoreError> {
        let offset = slot_offset(key).ok_or(StoreError::NotFound)?;
        let mut header = [0_u8; HEADER_LEN];
        self.flash.read(offset, &mut header)?;
        if header[..4] != SLOT_MAGIC {
            return Err(StoreError::NotFound);
        }
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let len = usize::try_from(len).map_err(|_| StoreError::NotFound)?;
        if len > MAX_BLOB_LEN {
            return Err(StoreError::NotFound);
        }
        let target = buf.get_mut(..len).ok_or(StoreError::BufferTooSmall)?;
        let data_offset = offset + u32::try_from(HEADER_LEN).map_err(|_| StoreError::Io)?;
        self.flash.read(data_offset, target)?;
        Ok(len)
    }

    fn save(&mut self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let offset = slot_offset(key).ok_or(StoreError::Full)?;
        if data.len() > MAX_BLOB_LEN {
            return Err(StoreError::BufferTooSmall);
        }
        let len = u32::try_from(data.len()).map_err(|_| StoreError::BufferTooSmall)?;

        self.page.fill(0xFF);
        self.page[..4].copy_from_slice(&SLOT_MAGIC);
        self.page[4..HEADER_LEN].copy_from_slice(&len.to_le_bytes());
        self.page[HEADER_LEN..HEADER_LEN + data.len()].copy_from_slice(data);
        let written = (HEADER_LEN + data.len()).next_multiple_of(WRITE_GRANULE);

        self.flash.erase(offset, offset + PAGE_SIZE)?;
        self.flash.write(offset, &self.page[..written])
    }
}

#[cfg(target_os = "none")]
mod target {
    use ecu_core::calibration::StoreError;
    use embassy_stm32::flash::{Blocking, Flash};

    use super::FlashRegion;

    impl FlashRegion for Flash<'static, Blocking> {
        fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), StoreError> {
            self.blocking_read(offset, buf).map_err(|_| StoreError::Io)
        }

        fn erase(&mut self, from: u32, to: u32) -> Result<(), StoreError> {
            self.blocking_erase(from, to).map_err(|_| StoreError::Io)
        }

        fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), StoreError> {
            self.blocking_write(offset, data).map_err(|_| StoreError::Io)
        }
    }
}
