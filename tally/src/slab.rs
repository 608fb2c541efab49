//! Memory-mapped slab file format for durable window storage.
//!
//! One slab holds the retained windows of one namespace. Each slot is one
//! bucket; each value column is one declared metric field.
//!
//! # File Format
//!
//! ```text
//! [0..64)          Header
//! [64..64+S*8)     Bucket column (u64 bucket_start per slot, u64::MAX = empty)
//! [64+S*8..)       Value columns (F columns of S little-endian f64, NaN = absent)
//! ```
//!
//! Header fields (little-endian):
//!
//! ```text
//! 0   magic          [u8; 4]  "TLLY"
//! 4   version        u32
//! 8   layout_hash    u64
//! 16  slot_count     u32
//! 20  field_count    u32
//! 24  granularity_ns u64
//! 32  write_cursor   u32
//! 36  reserved       [u8; 28]
//! ```
//!
//! All access goes through bounds-checked byte slices of the mapping.

use std::fs::OpenOptions;
use std::path::Path;

use memmap2::MmapMut;

use crate::error::SlabIoError;

/// Magic bytes identifying a tally slab file.
const SLAB_MAGIC: [u8; 4] = *b"TLLY";

/// Current slab format version.
const SLAB_VERSION: u32 = 1;

/// Size of the slab header in bytes.
const HEADER_SIZE: usize = 64;

/// Size of bucket and value entries in bytes.
const ENTRY_SIZE: usize = 8;

/// Bucket column sentinel for an unused slot.
const EMPTY_BUCKET: u64 = u64::MAX;

const OFF_VERSION: usize = 4;
const OFF_LAYOUT_HASH: usize = 8;
const OFF_SLOT_COUNT: usize = 16;
const OFF_FIELD_COUNT: usize = 20;
const OFF_GRANULARITY: usize = 24;
const OFF_WRITE_CURSOR: usize = 32;

type SlabResult<T> = std::result::Result<T, SlabIoError>;

/// Helper for computing slab layout sizes and offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlabLayout {
    slot_count: usize,
    field_count: usize,
    bucket_column_offset: usize,
    value_columns_offset: usize,
    value_column_size: usize,
    file_size: usize,
}

impl SlabLayout {
    fn new(slot_count: u32, field_count: u32) -> Self {
        let slot_count = slot_count as usize;
        let field_count = field_count as usize;
        let column_size = slot_count * ENTRY_SIZE;
        let bucket_column_offset = HEADER_SIZE;
        let value_columns_offset = bucket_column_offset + column_size;

        Self {
            slot_count,
            field_count,
            bucket_column_offset,
            value_columns_offset,
            value_column_size: column_size,
            file_size: value_columns_offset + field_count * column_size,
        }
    }

    fn bucket_offset(&self, slot: usize) -> usize {
        self.bucket_column_offset + slot * ENTRY_SIZE
    }

    fn value_offset(&self, slot: usize, column: usize) -> usize {
        self.value_columns_offset + column * self.value_column_size + slot * ENTRY_SIZE
    }
}

/// Memory-mapped slab file holding one namespace's windows.
///
/// Single writer: callers serialize mutation (the durable store keeps each
/// slab behind its own mutex).
#[derive(Debug)]
pub struct Slab {
    mmap: MmapMut,
    layout: SlabLayout,
    path: String,
}

impl Slab {
    /// Creates a new slab file, truncating any existing file at `path`.
    ///
    /// Every slot starts empty and every value starts as NaN.
    ///
    /// # Errors
    ///
    /// Returns [`SlabIoError`] if file creation or memory mapping fails.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use tally::slab::Slab;
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// // 60 one-minute buckets with 4 metric fields
    /// let slab = Slab::create("ns.slab", 0x1234, 60, 4, 60_000_000_000)?;
    /// assert_eq!(slab.slot_count(), 60);
    /// # Ok(())
    /// # }
    /// ```
    pub fn create<P: AsRef<Path>>(
        path: P,
        layout_hash: u64,
        slot_count: u32,
        field_count: u32,
        granularity_ns: u64,
    ) -> SlabResult<Self> {
        let path = path.as_ref();
        let path_str = path.to_string_lossy().to_string();
        let layout = SlabLayout::new(slot_count, field_count);

        let write_failed = |source| SlabIoError::WriteFailed {
            path: path_str.clone(),
            source,
        };

        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(write_failed)?;

        file.set_len(layout.file_size as u64).map_err(write_failed)?;

        // SAFETY: The file was just created with the correct length and is
        // not shared with any other mapping in this process.
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(write_failed)?;

        let mut slab = Self {
            mmap,
            layout,
            path: path_str,
        };

        slab.mmap[0..4].copy_from_slice(&SLAB_MAGIC);
        slab.put_u32(OFF_VERSION, SLAB_VERSION);
        slab.put_u64(OFF_LAYOUT_HASH, layout_hash);
        slab.put_u32(OFF_SLOT_COUNT, slot_count);
        slab.put_u32(OFF_FIELD_COUNT, field_count);
        slab.put_u64(OFF_GRANULARITY, granularity_ns);
        slab.put_u32(OFF_WRITE_CURSOR, 0);
        slab.initialize_data_region();

        Ok(slab)
    }

    /// Opens an existing slab file and validates its header and size.
    ///
    /// # Errors
    ///
    /// Returns [`SlabIoError`] if the file cannot be opened or mapped, or
    /// is corrupted.
    pub fn open<P: AsRef<Path>>(path: P) -> SlabResult<Self> {
        let path = path.as_ref();
        let path_str = path.to_string_lossy().to_string();

        let read_failed = |source| SlabIoError::ReadFailed {
            path: path_str.clone(),
            source,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(read_failed)?;

        // SAFETY: The file was opened read/write; this process holds the
        // only mapping because the durable store opens each slab once.
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(read_failed)?;

        if mmap.len() < HEADER_SIZE {
            return Err(SlabIoError::CorruptedSlab {
                path: path_str,
                reason: format!(
                    "file too small: {} bytes, expected at least {HEADER_SIZE}",
                    mmap.len()
                ),
            });
        }

        let mut slab = Self {
            mmap,
            layout: SlabLayout::new(0, 0),
            path: path_str,
        };

        if slab.mmap[0..4] != SLAB_MAGIC {
            return Err(slab.corrupted(format!(
                "invalid magic bytes: expected {SLAB_MAGIC:?}, found {:?}",
                &slab.mmap[0..4]
            )));
        }

        let version = slab.get_u32(OFF_VERSION);
        if version != SLAB_VERSION {
            return Err(slab.corrupted(format!(
                "unsupported version: expected {SLAB_VERSION}, found {version}"
            )));
        }

        let layout = SlabLayout::new(slab.get_u32(OFF_SLOT_COUNT), slab.get_u32(OFF_FIELD_COUNT));
        if slab.mmap.len() != layout.file_size {
            return Err(slab.corrupted(format!(
                "file size mismatch: {} bytes, expected {}",
                slab.mmap.len(),
                layout.file_size
            )));
        }
        slab.layout = layout;

        Ok(slab)
    }

    fn corrupted(&self, reason: String) -> SlabIoError {
        SlabIoError::CorruptedSlab {
            path: self.path.clone(),
            reason,
        }
    }

    fn initialize_data_region(&mut self) {
        let layout = self.layout;
        let empty = EMPTY_BUCKET.to_le_bytes();
        for entry in self.mmap[layout.bucket_column_offset..layout.value_columns_offset].chunks_exact_mut(ENTRY_SIZE) {
            entry.copy_from_slice(&empty);
        }

        let nan = f64::NAN.to_le_bytes();
        for entry in self.mmap[layout.value_columns_offset..layout.file_size].chunks_exact_mut(ENTRY_SIZE) {
            entry.copy_from_slice(&nan);
        }
    }

    fn get_u32(&self, offset: usize) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.mmap[offset..offset + 4]);
        u32::from_le_bytes(buf)
    }

    fn put_u32(&mut self, offset: usize, value: u32) {
        self.mmap[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn get_u64(&self, offset: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.mmap[offset..offset + 8]);
        u64::from_le_bytes(buf)
    }

    fn put_u64(&mut self, offset: usize, value: u64) {
        self.mmap[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn check(&self, slot: u32, column: u32) -> SlabResult<()> {
        if (slot as usize) < self.layout.slot_count && (column as usize) < self.layout.field_count.max(1) {
            Ok(())
        } else {
            Err(SlabIoError::BoundsViolation {
                slot,
                column,
                slot_count: self.slot_count(),
                field_count: self.field_count(),
            })
        }
    }

    /// Returns the layout hash recorded at creation.
    pub fn layout_hash(&self) -> u64 {
        self.get_u64(OFF_LAYOUT_HASH)
    }

    /// Returns the number of slots.
    pub fn slot_count(&self) -> u32 {
        self.get_u32(OFF_SLOT_COUNT)
    }

    /// Returns the number of value columns.
    pub fn field_count(&self) -> u32 {
        self.get_u32(OFF_FIELD_COUNT)
    }

    /// Returns the bucket granularity in nanoseconds.
    pub fn granularity_ns(&self) -> u64 {
        self.get_u64(OFF_GRANULARITY)
    }

    /// Returns the slot of the newest written bucket.
    pub fn write_cursor(&self) -> u32 {
        self.get_u32(OFF_WRITE_CURSOR)
    }

    /// Sets the write cursor.
    ///
    /// # Errors
    ///
    /// Returns [`SlabIoError::BoundsViolation`] if `slot` is out of range.
    pub fn set_write_cursor(&mut self, slot: u32) -> SlabResult<()> {
        self.check(slot, 0)?;
        self.put_u32(OFF_WRITE_CURSOR, slot);
        Ok(())
    }

    /// Reads the bucket stored in `slot`, or `None` if the slot is empty.
    ///
    /// # Errors
    ///
    /// Returns [`SlabIoError::BoundsViolation`] if `slot` is out of range.
    pub fn read_bucket(&self, slot: u32) -> SlabResult<Option<u64>> {
        self.check(slot, 0)?;
        let bucket = self.get_u64(self.layout.bucket_offset(slot as usize));
        Ok((bucket != EMPTY_BUCKET).then_some(bucket))
    }

    /// Writes the bucket stored in `slot`; `None` marks the slot empty.
    ///
    /// # Errors
    ///
    /// Returns [`SlabIoError::BoundsViolation`] if `slot` is out of range.
    pub fn write_bucket(&mut self, slot: u32, bucket_start: Option<u64>) -> SlabResult<()> {
        self.check(slot, 0)?;
        let offset = self.layout.bucket_offset(slot as usize);
        self.put_u64(offset, bucket_start.unwrap_or(EMPTY_BUCKET));
        Ok(())
    }

    /// Reads a value; NaN means absent.
    ///
    /// # Errors
    ///
    /// Returns [`SlabIoError::BoundsViolation`] if either index is out of range.
    pub fn read_value(&self, slot: u32, column: u32) -> SlabResult<f64> {
        self.check(slot, column)?;
        let offset = self.layout.value_offset(slot as usize, column as usize);
        Ok(f64::from_bits(self.get_u64(offset)))
    }

    /// Writes a value; NaN marks it absent.
    ///
    /// # Errors
    ///
    /// Returns [`SlabIoError::BoundsViolation`] if either index is out of range.
    pub fn write_value(&mut self, slot: u32, column: u32, value: f64) -> SlabResult<()> {
        self.check(slot, column)?;
        let offset = self.layout.value_offset(slot as usize, column as usize);
        self.put_u64(offset, value.to_bits());
        Ok(())
    }

    /// Syncs the memory mapping to disk.
    ///
    /// # Errors
    ///
    /// Returns [`SlabIoError::SyncFailed`] if the sync operation fails.
    pub fn sync(&self) -> SlabResult<()> {
        self.mmap.flush().map_err(|source| SlabIoError::SyncFailed {
            path: self.path.clone(),
            source,
        })
    }

    /// Returns the path to this slab file.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the size of the file in bytes.
    pub fn file_size(&self) -> usize {
        self.layout.file_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_slab_layout() {
        let layout = SlabLayout::new(100, 3);

        // Header: 64, bucket column: 800, value columns: 3 * 800
        assert_eq!(layout.bucket_column_offset, 64);
        assert_eq!(layout.value_columns_offset, 864);
        assert_eq!(layout.value_column_size, 800);
        assert_eq!(layout.file_size, 864 + 2400);
        assert_eq!(layout.value_offset(0, 1), 1664);
        assert_eq!(layout.value_offset(5, 2), 2464 + 40);
    }

    #[test]
    fn test_slab_create_and_open() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("ns.slab");

        let slab = Slab::create(&path, 0xfeed, 10, 4, 60_000_000_000).unwrap();
        assert_eq!(slab.layout_hash(), 0xfeed);
        assert_eq!(slab.slot_count(), 10);
        assert_eq!(slab.field_count(), 4);
        assert_eq!(slab.granularity_ns(), 60_000_000_000);
        assert_eq!(slab.write_cursor(), 0);
        assert_eq!(slab.read_bucket(0).unwrap(), None);
        assert!(slab.read_value(9, 3).unwrap().is_nan());
        drop(slab);

        let slab = Slab::open(&path).unwrap();
        assert_eq!(slab.layout_hash(), 0xfeed);
        assert_eq!(slab.slot_count(), 10);
        assert_eq!(slab.field_count(), 4);
    }

    #[test]
    fn test_bucket_zero_is_not_empty() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut slab = Slab::create(temp_dir.path().join("z.slab"), 1, 4, 1, 1).unwrap();

        slab.write_bucket(0, Some(0)).unwrap();
        assert_eq!(slab.read_bucket(0).unwrap(), Some(0));
        slab.write_bucket(0, None).unwrap();
        assert_eq!(slab.read_bucket(0).unwrap(), None);
    }

    #[test]
    fn test_persistence() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("persist.slab");

        {
            let mut slab = Slab::create(&path, 7, 5, 2, 1_000).unwrap();
            slab.write_bucket(3, Some(3_000)).unwrap();
            slab.write_value(3, 0, 42.5).unwrap();
            slab.write_value(3, 1, -1.0).unwrap();
            slab.set_write_cursor(3).unwrap();
            slab.sync().unwrap();
        }

        let slab = Slab::open(&path).unwrap();
        assert_eq!(slab.write_cursor(), 3);
        assert_eq!(slab.read_bucket(3).unwrap(), Some(3_000));
        assert_eq!(slab.read_value(3, 0).unwrap(), 42.5);
        assert_eq!(slab.read_value(3, 1).unwrap(), -1.0);
        assert!(slab.read_value(2, 0).unwrap().is_nan());
    }

    #[test]
    fn test_bounds() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut slab = Slab::create(temp_dir.path().join("b.slab"), 1, 4, 2, 1).unwrap();

        assert!(matches!(slab.read_value(4, 0), Err(SlabIoError::BoundsViolation { .. })));
        assert!(slab.write_value(0, 2, 1.0).is_err());
        assert!(slab.read_bucket(4).is_err());
        assert!(slab.set_write_cursor(4).is_err());
    }

    #[test]
    fn test_invalid_header() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("invalid.slab");

        let mut header = vec![0u8; 64];
        header[0..4].copy_from_slice(b"BAD\0");
        fs::write(&path, header).unwrap();

        let err = Slab::open(&path).unwrap_err();
        assert!(err.to_string().contains("invalid magic bytes"));
    }

    #[test]
    fn test_file_size_validation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("small.slab");
        fs::write(&path, b"small").unwrap();
        assert!(Slab::open(&path).unwrap_err().to_string().contains("file too small"));

        let path = temp_dir.path().join("truncated.slab");
        let slab = Slab::create(&path, 1, 8, 2, 1).unwrap();
        drop(slab);
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 8]).unwrap();
        assert!(Slab::open(&path).unwrap_err().to_string().contains("size mismatch"));
    }
}
