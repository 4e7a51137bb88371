//! Keyed blob storage and the versioned, CRC-checked blob envelope.

use core::fmt;

use heapless::{String, Vec};

/// Longest key accepted by [`MemoryConfigStore`].
pub const MAX_KEY_LEN: usize = 24;
/// Largest blob any calibration record produces.
pub const MAX_BLOB_LEN: usize = 1_792;
pub const STORE_SLOTS: usize = 8;

/// Bytes the envelope adds around a payload.
pub const BLOB_OVERHEAD: usize = 8;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StoreError {
    NotFound,
    KeyTooLong,
    BufferTooSmall,
    Full,
    Io,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Persistent key/value storage for opaque blobs.
///
/// A save either replaces the whole blob or leaves the old one in place.
pub trait ConfigStore {
    /// Copies the blob into `buf` and returns its length.
    fn load(&mut self, key: &str, buf: &mut [u8]) -> Result<usize, StoreError>;

    fn save(&mut self, key: &str, data: &[u8]) -> Result<(), StoreError>;
}

impl<S: ConfigStore + ?Sized> ConfigStore for &mut S {
    fn load(&mut self, key: &str, buf: &mut [u8]) -> Result<usize, StoreError> {
        (**self).load(key, buf)
    }

    fn save(&mut self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        (**self).save(key, data)
    }
}

struct Entry {
    key: String<MAX_KEY_LEN>,
    data: Vec<u8, MAX_BLOB_LEN>,
}

/// RAM-backed store used by host builds and tests.
pub struct MemoryConfigStore {
    entries: Vec<Entry, STORE_SLOTS>,
    fail_saves: bool,
    saves: u32,
}

impl MemoryConfigStore {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            fail_saves: false,
            saves: 0,
        }
    }

    /// Makes every following save fail with [`StoreError::Io`].
    pub fn set_fail_saves(&mut self, fail: bool) {
        self.fail_saves = fail;
    }

    /// Successful saves since construction.
    pub fn saves(&self) -> u32 {
        self.saves
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|entry| entry.key.as_str() == key)
    }

    /// Raw stored bytes, for inspection.
    pub fn raw(&self, key: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|entry| entry.key.as_str() == key)
            .map(|entry| entry.data.as_slice())
    }
}

impl Default for MemoryConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&mut self, key: &str, buf: &mut [u8]) -> Result<usize, StoreError> {
        let data = self.raw(key).ok_or(StoreError::NotFound)?;
        let target = buf.get_mut(..data.len()).ok_or(StoreError::BufferTooSmall)?;
        target.copy_from_slice(data);
        Ok(data.len())
    }

    fn save(&mut self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        if self.fail_saves {
            return Err(StoreError::Io);
        }
        let mut blob = Vec::new();
        blob.extend_from_slice(data).map_err(|_| StoreError::BufferTooSmall)?;

        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.key.as_str() == key) {
            entry.data = blob;
        } else {
            let mut name = String::new();
            name.push_str(key).map_err(|_| StoreError::KeyTooLong)?;
            self.entries
                .push(Entry { key: name, data: blob })
                .map_err(|_| StoreError::Full)?;
        }
        self.saves = self.saves.wrapping_add(1);
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BlobError {
    Truncated,
    BufferTooSmall,
    ChecksumMismatch,
    UnsupportedVersion(u32),
    InvalidPayload,
}

impl fmt::Display for BlobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Writes `version ‖ payload ‖ crc32(payload)` into `out`.
pub fn encode_blob<'a>(version: u32, payload: &[u8], out: &'a mut [u8]) -> Result<&'a [u8], BlobError> {
    let len = payload.len() + BLOB_OVERHEAD;
    let out = out.get_mut(..len).ok_or(BlobError::BufferTooSmall)?;
    let (head, rest) = out.split_at_mut(4);
    head.copy_from_slice(&version.to_le_bytes());
    let (body, tail) = rest.split_at_mut(payload.len());
    body.copy_from_slice(payload);
    tail.copy_from_slice(&crc32fast::hash(payload).to_le_bytes());
    Ok(out)
}

/// Splits an envelope into its version and checksum-verified payload.
pub fn decode_blob(bytes: &[u8]) -> Result<(u32, &[u8]), BlobError> {
    if bytes.len() < BLOB_OVERHEAD {
        return Err(BlobError::Truncated);
    }
    let (head, rest) = bytes.split_at(4);
    let (payload, tail) = rest.split_at(rest.len() - 4);
    let version = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
    let crc = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
    if crc32fast::hash(payload) != crc {
        return Err(BlobError::ChecksumMismatch);
    }
    Ok((version, payload))
}
