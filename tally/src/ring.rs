//! Bucket ring over a slab, the durable tier's retention structure.
//!
//! A slot holds exactly one bucket. The ring keeps a bucket-to-slot index,
//! rebuilt from the bucket column when the slab is opened:
//! - A bucket already indexed is rewritten in place
//! - A new bucket takes a free slot while one remains
//! - Once every slot is taken, a new bucket replaces the oldest one
//! - A new bucket older than every retained bucket of a full ring is
//!   ignored, since it would be the one evicted
//!
//! Retention is therefore oldest-first whatever the spacing of the
//! buckets, matching the in-memory partitions.

use std::collections::{BTreeMap, HashMap};

use crate::error::{SlabIoError, StoreError, StoreResult};
use crate::slab::Slab;
use crate::window::WindowState;

/// Result of a ring write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The window was stored.
    Written,
    /// The ring is full of newer buckets; nothing changed.
    Superseded {
        /// The oldest retained bucket.
        oldest: u64,
    },
}

/// Where a write lands.
enum Placement {
    /// Write into `slot`, dropping `displaced` from the index.
    Slot { slot: u32, displaced: Option<u64> },
    /// Leave the ring unchanged.
    Skip(WriteOutcome),
}

/// A slab with bucket-ring semantics and named value columns.
#[derive(Debug)]
pub struct SlabRing {
    namespace: String,
    slab: Slab,
    columns: HashMap<String, u32>,
    fields: Vec<String>,
    index: BTreeMap<u64, u32>,
    free: Vec<u32>,
}

impl SlabRing {
    /// Wraps a slab, naming its value columns in order.
    ///
    /// # Errors
    ///
    /// Returns [`SlabIoError::CorruptedSlab`] if the number of fields does
    /// not match the slab's column count or two slots hold the same bucket.
    pub fn new(namespace: impl Into<String>, slab: Slab, fields: Vec<String>) -> Result<Self, SlabIoError> {
        if fields.len() != slab.field_count() as usize {
            return Err(SlabIoError::CorruptedSlab {
                path: slab.path().to_string(),
                reason: format!(
                    "slab has {} value columns but {} fields are declared",
                    slab.field_count(),
                    fields.len()
                ),
            });
        }

        #[allow(clippy::cast_possible_truncation)] // bounded by field_count (u32)
        let columns = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.clone(), i as u32))
            .collect();

        // Free slots are popped from the back, lowest slot first.
        let mut index = BTreeMap::new();
        let mut free = Vec::new();
        for slot in (0..slab.slot_count()).rev() {
            match slab.read_bucket(slot)? {
                Some(bucket) => {
                    if let Some(other) = index.insert(bucket, slot) {
                        return Err(SlabIoError::CorruptedSlab {
                            path: slab.path().to_string(),
                            reason: format!("bucket {bucket} is stored in slots {slot} and {other}"),
                        });
                    }
                }
                None => free.push(slot),
            }
        }

        Ok(Self {
            namespace: namespace.into(),
            slab,
            columns,
            fields,
            index,
            free,
        })
    }

    /// Returns the underlying slab.
    pub fn slab(&self) -> &Slab {
        &self.slab
    }

    /// Returns the value column names in order.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    fn place(&self, bucket_start: u64) -> StoreResult<Placement> {
        if let Some(&slot) = self.index.get(&bucket_start) {
            return Ok(Placement::Slot { slot, displaced: None });
        }
        if let Some(&slot) = self.free.last() {
            return Ok(Placement::Slot { slot, displaced: None });
        }
        match self.index.first_key_value() {
            Some((&oldest, _)) if oldest > bucket_start => Ok(Placement::Skip(WriteOutcome::Superseded { oldest })),
            Some((&oldest, &slot)) => Ok(Placement::Slot {
                slot,
                displaced: Some(oldest),
            }),
            None => Err(SlabIoError::CorruptedSlab {
                path: self.slab.path().to_string(),
                reason: "slab has no slots".to_string(),
            }
            .into()),
        }
    }

    /// Stores the full state of one bucket.
    ///
    /// Fields absent from `state` are stored as absent, so a put always
    /// replaces the bucket rather than merging into it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownField`] if `state` carries a field with
    /// no column, or a slab error on out-of-range access.
    pub fn write(&mut self, bucket_start: u64, state: &WindowState) -> StoreResult<WriteOutcome> {
        let (slot, displaced) = match self.place(bucket_start)? {
            Placement::Slot { slot, displaced } => (slot, displaced),
            Placement::Skip(outcome) => return Ok(outcome),
        };

        // Resolve every column before touching the slab so a bad field
        // never leaves a half-written row.
        let mut row = Vec::with_capacity(state.len());
        for (field, value) in state.iter() {
            let column = self.columns.get(field).ok_or_else(|| StoreError::UnknownField {
                namespace: self.namespace.clone(),
                field: field.to_string(),
            })?;
            row.push((*column, value));
        }

        for column in 0..self.slab.field_count() {
            self.slab.write_value(slot, column, f64::NAN)?;
        }
        for (column, value) in row {
            self.slab.write_value(slot, column, value)?;
        }
        self.slab.write_bucket(slot, Some(bucket_start))?;

        if self.free.last() == Some(&slot) {
            self.free.pop();
        }
        if let Some(displaced) = displaced {
            self.index.remove(&displaced);
        }
        self.index.insert(bucket_start, slot);

        if let Some((_, &newest)) = self.index.last_key_value() {
            self.slab.set_write_cursor(newest)?;
        }

        Ok(WriteOutcome::Written)
    }

    /// Reads the state of one bucket, if retained.
    ///
    /// # Errors
    ///
    /// Returns a slab error on out-of-range access.
    pub fn read(&self, bucket_start: u64) -> StoreResult<Option<WindowState>> {
        match self.index.get(&bucket_start) {
            Some(&slot) => Ok(Some(self.read_row(slot)?)),
            None => Ok(None),
        }
    }

    fn read_row(&self, slot: u32) -> StoreResult<WindowState> {
        let mut state = WindowState::new();
        for (column, field) in (0u32..).zip(&self.fields) {
            let value = self.slab.read_value(slot, column)?;
            if !value.is_nan() {
                state.set(field.as_str(), value);
            }
        }
        Ok(state)
    }

    /// Returns retained buckets with `start <= bucket_start < end`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a slab error on out-of-range access.
    pub fn range(&self, start: u64, end: u64) -> StoreResult<Vec<(u64, WindowState)>> {
        if start >= end {
            return Ok(Vec::new());
        }
        self.index
            .range(start..end)
            .map(|(&bucket, &slot)| Ok((bucket, self.read_row(slot)?)))
            .collect()
    }

    /// Returns every retained bucket start, oldest first.
    pub fn buckets(&self) -> Vec<u64> {
        self.index.keys().copied().collect()
    }

    /// Syncs the slab to disk.
    ///
    /// # Errors
    ///
    /// Returns [`SlabIoError::SyncFailed`] if the sync fails.
    pub fn sync(&self) -> Result<(), SlabIoError> {
        self.slab.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const G: u64 = 60;

    fn ring(slots: u32) -> (tempfile::TempDir, SlabRing) {
        let dir = tempfile::tempdir().unwrap();
        let fields = vec!["success".to_string(), "total".to_string()];
        let slab = Slab::create(dir.path().join("ns.slab"), 1, slots, 2, G).unwrap();
        let ring = SlabRing::new("NS1", slab, fields).unwrap();
        (dir, ring)
    }

    fn state(total: f64) -> WindowState {
        [("total", total)].into_iter().collect()
    }

    #[test]
    fn test_write_and_read() {
        let (_dir, mut ring) = ring(4);
        assert_eq!(ring.write(0, &state(3.0)).unwrap(), WriteOutcome::Written);

        let stored = ring.read(0).unwrap().unwrap();
        assert_eq!(stored.get("total"), Some(3.0));
        assert_eq!(stored.get("success"), None);
        assert_eq!(ring.read(G).unwrap(), None);
    }

    #[test]
    fn test_put_replaces_row() {
        let (_dir, mut ring) = ring(4);
        let full: WindowState = [("total", 2.0), ("success", 2.0)].into_iter().collect();
        ring.write(G, &full).unwrap();
        ring.write(G, &state(5.0)).unwrap();

        let stored = ring.read(G).unwrap().unwrap();
        assert_eq!(stored, state(5.0));
    }

    #[test]
    fn test_wraparound_evicts_oldest() {
        let (_dir, mut ring) = ring(3);
        for i in 0..5u64 {
            ring.write(i * G, &state(i as f64)).unwrap();
        }

        assert_eq!(ring.buckets(), vec![2 * G, 3 * G, 4 * G]);
        assert_eq!(ring.read(0).unwrap(), None);
        assert_eq!(ring.read(G).unwrap(), None);
        assert_eq!(ring.slab().write_cursor(), 1);
    }

    #[test]
    fn test_stale_write_is_ignored() {
        let (_dir, mut ring) = ring(3);
        for bucket in [3 * G, 4 * G, 5 * G] {
            ring.write(bucket, &state(1.0)).unwrap();
        }

        let outcome = ring.write(0, &state(9.0)).unwrap();
        assert_eq!(outcome, WriteOutcome::Superseded { oldest: 3 * G });
        assert_eq!(ring.buckets(), vec![3 * G, 4 * G, 5 * G]);
        assert_eq!(ring.read(0).unwrap(), None);
    }

    #[test]
    fn test_late_write_fills_free_slot() {
        let (_dir, mut ring) = ring(3);
        ring.write(3 * G, &state(1.0)).unwrap();

        assert_eq!(ring.write(0, &state(9.0)).unwrap(), WriteOutcome::Written);
        assert_eq!(ring.buckets(), vec![0, 3 * G]);
        assert_eq!(ring.read(0).unwrap(), Some(state(9.0)));
    }

    #[test]
    fn test_sparse_buckets_evict_oldest() {
        let (_dir, mut ring) = ring(3);
        // Gaps between buckets never change which one is evicted.
        for bucket in [0, 10 * G, 13 * G, 14 * G] {
            ring.write(bucket, &state(1.0)).unwrap();
        }

        assert_eq!(ring.buckets(), vec![10 * G, 13 * G, 14 * G]);
        assert_eq!(ring.read(0).unwrap(), None);
        assert_eq!(ring.read(10 * G).unwrap(), Some(state(1.0)));
    }

    #[test]
    fn test_index_rebuilt_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ns.slab");
        let fields = vec!["success".to_string(), "total".to_string()];
        {
            let slab = Slab::create(&path, 1, 3, 2, G).unwrap();
            let mut ring = SlabRing::new("NS1", slab, fields.clone()).unwrap();
            for bucket in [G, 7 * G, 9 * G] {
                ring.write(bucket, &state(1.0)).unwrap();
            }
            ring.sync().unwrap();
        }

        let slab = Slab::open(&path).unwrap();
        let mut ring = SlabRing::new("NS1", slab, fields).unwrap();
        assert_eq!(ring.buckets(), vec![G, 7 * G, 9 * G]);

        ring.write(20 * G, &state(2.0)).unwrap();
        assert_eq!(ring.buckets(), vec![7 * G, 9 * G, 20 * G]);
    }

    #[test]
    fn test_range_is_ordered() {
        let (_dir, mut ring) = ring(4);
        for bucket in [3 * G, G, 2 * G] {
            ring.write(bucket, &state(1.0)).unwrap();
        }

        let starts: Vec<u64> = ring.range(G, 3 * G).unwrap().into_iter().map(|(b, _)| b).collect();
        assert_eq!(starts, vec![G, 2 * G]);
        assert!(ring.range(3 * G, G).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_field_leaves_slot_untouched() {
        let (_dir, mut ring) = ring(4);
        ring.write(0, &state(1.0)).unwrap();

        let bad: WindowState = [("total", 2.0), ("bogus", 1.0)].into_iter().collect();
        let err = ring.write(0, &bad).unwrap_err();
        assert!(matches!(err, StoreError::UnknownField { ref field, .. } if field == "bogus"));
        assert_eq!(ring.read(0).unwrap(), Some(state(1.0)));
    }

    #[test]
    fn test_field_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let slab = Slab::create(dir.path().join("x.slab"), 1, 4, 2, G).unwrap();
        assert!(SlabRing::new("NS1", slab, vec!["total".to_string()]).is_err());
    }
}
