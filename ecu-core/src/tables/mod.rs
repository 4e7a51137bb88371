//! 16x16 calibration tables indexed by RPM and load.
//!
//! Values are raw `u16` cells in table-specific units (VE in 0.1 %, advance
//! in 0.1°, lambda in 0.001). Rows are load bins, columns are RPM bins.

#![allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]

pub const TABLE_DIM: usize = 16;

pub const DEFAULT_RPM_BINS: [u16; TABLE_DIM] = [
    500, 800, 1_200, 1_600, 2_000, 2_500, 3_000, 3_500, 4_000, 4_500, 5_000, 5_500, 6_000, 6_500,
    7_000, 8_000,
];

/// Load bins in 0.1 kPa manifold pressure.
pub const DEFAULT_LOAD_BINS: [u16; TABLE_DIM] = [
    200, 300, 400, 500, 600, 650, 700, 750, 800, 850, 900, 950, 1_000, 1_020, 1_050, 1_100,
];

pub const DEFAULT_VE: u16 = 1_000;
pub const DEFAULT_IGNITION: u16 = 150;
pub const DEFAULT_LAMBDA: u16 = 1_000;

/// Serialized size: both bin axes, every cell, then the checksum.
pub const TABLE_BLOB_LEN: usize = (TABLE_DIM * 2 + TABLE_DIM * TABLE_DIM + 1) * 2;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Table16 {
    pub rpm_bins: [u16; TABLE_DIM],
    pub load_bins: [u16; TABLE_DIM],
    pub values: [[u16; TABLE_DIM]; TABLE_DIM],
    pub checksum: u16,
}

/// Index of the lower bin bracketing `value`; the last pair is reused past the end.
#[must_use]
pub fn bin_index(bins: &[u16; TABLE_DIM], value: u16) -> usize {
    (0..TABLE_DIM - 1)
        .find(|&index| value < bins[index + 1])
        .unwrap_or(TABLE_DIM - 2)
}

impl Table16 {
    /// Table with default bins and every cell set to `fill`.
    pub const fn new(fill: u16) -> Self {
        Self::with_bins(DEFAULT_RPM_BINS, DEFAULT_LOAD_BINS, fill)
    }

    pub const fn with_bins(rpm_bins: [u16; TABLE_DIM], load_bins: [u16; TABLE_DIM], fill: u16) -> Self {
        let mut table = Self {
            rpm_bins,
            load_bins,
            values: [[fill; TABLE_DIM]; TABLE_DIM],
            checksum: 0,
        };
        table.checksum = table.compute_checksum();
        table
    }

    /// 16-bit wrapping sum over both axes and every cell.
    pub const fn compute_checksum(&self) -> u16 {
        let mut sum: u32 = 0;
        let mut i = 0;
        while i < TABLE_DIM {
            sum = sum.wrapping_add(self.rpm_bins[i] as u32);
            sum = sum.wrapping_add(self.load_bins[i] as u32);
            i += 1;
        }
        let mut row = 0;
        while row < TABLE_DIM {
            let mut col = 0;
            while col < TABLE_DIM {
                sum = sum.wrapping_add(self.values[row][col] as u32);
                col += 1;
            }
            row += 1;
        }
        (sum & 0xFFFF) as u16
    }

    pub fn validate(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    pub fn refresh_checksum(&mut self) {
        self.checksum = self.compute_checksum();
    }

    pub fn cell(&self, load_index: usize, rpm_index: usize) -> Option<u16> {
        self.values.get(load_index)?.get(rpm_index).copied()
    }

    /// Writes one cell and keeps the checksum consistent.
    pub fn set_cell(&mut self, load_index: usize, rpm_index: usize, value: u16) -> bool {
        let Some(cell) = self
            .values
            .get_mut(load_index)
            .and_then(|row| row.get_mut(rpm_index))
        else {
            return false;
        };
        *cell = value;
        self.refresh_checksum();
        true
    }

    /// Bins bracketing the operating point as `(load_index, rpm_index)`.
    pub fn bins_for(&self, rpm: u16, load: u16) -> (usize, usize) {
        (bin_index(&self.load_bins, load), bin_index(&self.rpm_bins, rpm))
    }

    /// Bilinear interpolation. Inputs outside the axes are held at the edge.
    pub fn interpolate(&self, rpm: u16, load: u16) -> u16 {
        let rpm = rpm.clamp(self.rpm_bins[0], self.rpm_bins[TABLE_DIM - 1]);
        let load = load.clamp(self.load_bins[0], self.load_bins[TABLE_DIM - 1]);
        let x = bin_index(&self.rpm_bins, rpm);
        let y = bin_index(&self.load_bins, load);

        let dx = fraction(rpm, self.rpm_bins[x], self.rpm_bins[x + 1]);
        let dy = fraction(load, self.load_bins[y], self.load_bins[y + 1]);

        let v00 = f32::from(self.values[y][x]);
        let v10 = f32::from(self.values[y][x + 1]);
        let v01 = f32::from(self.values[y + 1][x]);
        let v11 = f32::from(self.values[y + 1][x + 1]);

        let v0 = v00 + dx * (v10 - v00);
        let v1 = v01 + dx * (v11 - v01);
        let value = (v0 + dy * (v1 - v0)).clamp(0.0, 65_535.0);
        (value + 0.5) as u16
    }

    pub fn write_le(&self, out: &mut [u8; TABLE_BLOB_LEN]) {
        let words = self
            .rpm_bins
            .iter()
            .chain(self.load_bins.iter())
            .chain(self.values.iter().flatten())
            .chain(core::iter::once(&self.checksum));
        for (chunk, word) in out.chunks_exact_mut(2).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
    }

    /// Decodes a table and rejects it when the embedded checksum disagrees.
    pub fn read_le(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != TABLE_BLOB_LEN {
            return None;
        }
        let mut words = bytes
            .chunks_exact(2)
            .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]));
        let mut table = Self::new(0);
        for bin in &mut table.rpm_bins {
            *bin = words.next()?;
        }
        for bin in &mut table.load_bins {
            *bin = words.next()?;
        }
        for cell in table.values.iter_mut().flatten() {
            *cell = words.next()?;
        }
        table.checksum = words.next()?;
        table.validate().then_some(table)
    }
}

impl Default for Table16 {
    fn default() -> Self {
        Self::new(0)
    }
}

fn fraction(value: u16, low: u16, high: u16) -> f32 {
    if high > low {
        f32::from(value.saturating_sub(low)) / f32::from(high - low)
    } else {
        0.0
    }
}

/// Deadbands inside which a cached interpolation is reused.
pub const CACHE_RPM_DEADBAND: u16 = 50;
pub const CACHE_LOAD_DEADBAND: u16 = 20;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct CacheEntry {
    rpm: u16,
    load: u16,
    checksum: u16,
    value: u16,
}

/// Memoizes the last lookup of one table. Any table edit changes the
/// checksum and invalidates the entry.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct InterpolationCache {
    entry: Option<CacheEntry>,
    hits: u32,
    misses: u32,
}

impl InterpolationCache {
    pub const fn new() -> Self {
        Self {
            entry: None,
            hits: 0,
            misses: 0,
        }
    }

    pub fn lookup(&mut self, table: &Table16, rpm: u16, load: u16) -> u16 {
        if let Some(entry) = self.entry
            && entry.checksum == table.checksum
            && entry.rpm.abs_diff(rpm) <= CACHE_RPM_DEADBAND
            && entry.load.abs_diff(load) <= CACHE_LOAD_DEADBAND
        {
            self.hits = self.hits.wrapping_add(1);
            return entry.value;
        }
        self.misses = self.misses.wrapping_add(1);
        let value = table.interpolate(rpm, load);
        self.entry = Some(CacheEntry {
            rpm,
            load,
            checksum: table.checksum,
            value,
        });
        value
    }

    pub fn invalidate(&mut self) {
        self.entry = None;
    }

    pub fn hits(&self) -> u32 {
        self.hits
    }

    pub fn misses(&self) -> u32 {
        self.misses
    }
}

/// The fuel, ignition and lambda-target tables as one persisted bank.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FuelMaps {
    pub ve: Table16,
    pub ignition: Table16,
    pub lambda: Table16,
}

impl FuelMaps {
    pub const fn new() -> Self {
        Self {
            ve: Table16::new(DEFAULT_VE),
            ignition: Table16::new(DEFAULT_IGNITION),
            lambda: Table16::new(DEFAULT_LAMBDA),
        }
    }

    pub fn validate(&self) -> bool {
        self.ve.validate() && self.ignition.validate() && self.lambda.validate()
    }
}

impl Default for FuelMaps {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-table caches used by the planner.
#[derive(Copy, Clone, Debug, Default)]
pub struct MapCaches {
    pub ve: InterpolationCache,
    pub ignition: InterpolationCache,
    pub lambda: InterpolationCache,
}

impl MapCaches {
    pub const fn new() -> Self {
        Self {
            ve: InterpolationCache::new(),
            ignition: InterpolationCache::new(),
            lambda: InterpolationCache::new(),
        }
    }
}
