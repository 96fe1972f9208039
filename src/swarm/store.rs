//! Chunked file store: positioned unit I/O over one backing file

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use tracing::warn;

use super::bitfield::Bitfield;
use super::descriptor::Descriptor;
use super::merkle::read_full_at;
use super::{SwarmError, UNIT_SIZE};

/// Range-based storage for a swarm's backing file.
///
/// The file is opened read-write and truncated to the descriptor's exact
/// length, so positioned reads and writes are always in-bounds once range
/// checks pass. Positioned I/O takes `&self` and is safe to issue in
/// parallel; only the have-bitfield and the open-handle swap serialize.
pub struct UnitStore {
    descriptor: Arc<Descriptor>,
    file: RwLock<File>,
    path: PathBuf,
    unit_count: u64,
    have: Mutex<Bitfield>,
}

impl UnitStore {
    /// Opens (creating if needed) the backing file under `location`.
    ///
    /// # Errors
    ///
    /// - `SwarmError::Io` - directory creation, open, or truncate failure
    pub fn open(descriptor: Arc<Descriptor>, location: &Path) -> Result<Self, SwarmError> {
        std::fs::create_dir_all(location)?;

        let path = location.join(&descriptor.name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if file.metadata()?.len() != descriptor.length {
            file.set_len(descriptor.length)?;
        }

        let unit_count = descriptor.unit_count();
        Ok(Self {
            descriptor,
            file: RwLock::new(file),
            path,
            unit_count,
            have: Mutex::new(Bitfield::new(unit_count)),
        })
    }

    /// Reads an arbitrary byte range.
    ///
    /// # Errors
    ///
    /// - `SwarmError::OutOfBounds` - range extends past the file
    /// - `SwarmError::Io` - read failure
    pub fn read_range(&self, offset: u64, length: u64) -> Result<Vec<u8>, SwarmError> {
        let end = offset.checked_add(length).filter(|&e| e <= self.descriptor.length);
        if end.is_none() {
            return Err(SwarmError::OutOfBounds { offset, length });
        }

        let mut buf = vec![0u8; length as usize];
        let file = self.file.read().expect("store file lock poisoned");
        let n = read_full_at(&file, &mut buf, offset)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Writes data at an arbitrary byte offset.
    ///
    /// # Errors
    ///
    /// - `SwarmError::OutOfBounds` - range extends past the file
    /// - `SwarmError::ShortWrite` - the write completed partially
    /// - `SwarmError::Io` - write failure
    pub fn write_range(&self, offset: u64, data: &[u8]) -> Result<(), SwarmError> {
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|&e| e <= self.descriptor.length);
        if end.is_none() {
            return Err(SwarmError::OutOfBounds {
                offset,
                length: data.len() as u64,
            });
        }

        let file = self.file.read().expect("store file lock poisoned");
        let written = file.write_at(data, offset)?;
        if written != data.len() {
            return Err(SwarmError::ShortWrite {
                expected: data.len(),
                written,
            });
        }

        Ok(())
    }

    /// Reads one full transfer unit.
    ///
    /// # Errors
    ///
    /// - `SwarmError::OutOfBounds` - unit index past the last unit
    /// - `SwarmError::Io` - read failure
    pub fn read_unit(&self, index: u64) -> Result<Vec<u8>, SwarmError> {
        let size = self.descriptor.unit_size(index)?;
        self.read_range(index * UNIT_SIZE, size)
    }

    /// Writes one full transfer unit and marks it present.
    ///
    /// # Errors
    ///
    /// - `SwarmError::OutOfBounds` - unit index past the last unit
    /// - `SwarmError::Malformed` - data is not exactly the unit's size
    /// - `SwarmError::Io` - write failure
    pub fn write_unit(&self, index: u64, data: &[u8]) -> Result<(), SwarmError> {
        let expected = self.descriptor.unit_size(index)?;
        if data.len() as u64 != expected {
            return Err(SwarmError::Malformed {
                message: format!(
                    "unit {index} size mismatch: got {} bytes, expected {expected}",
                    data.len()
                ),
            });
        }

        self.write_range(index * UNIT_SIZE, data)?;

        self.have
            .lock()
            .expect("have bitfield lock poisoned")
            .set(index);
        Ok(())
    }

    /// Returns whether unit `index` is present.
    pub fn has_unit(&self, index: u64) -> bool {
        if index >= self.unit_count {
            return false;
        }
        self.have
            .lock()
            .expect("have bitfield lock poisoned")
            .has(index)
    }

    /// Returns a copy of the have-bitfield.
    pub fn bitfield(&self) -> Bitfield {
        self.have
            .lock()
            .expect("have bitfield lock poisoned")
            .clone()
    }

    /// Returns true if every unit is present.
    pub fn all_units(&self) -> bool {
        self.have
            .lock()
            .expect("have bitfield lock poisoned")
            .all_set(self.unit_count)
    }

    /// Returns the number of transfer units.
    pub fn unit_count(&self) -> u64 {
        self.unit_count
    }

    /// Returns the descriptor this store backs.
    pub fn descriptor(&self) -> &Arc<Descriptor> {
        &self.descriptor
    }

    /// Marks every unit present. Used when importing a file already known
    /// to be complete (seeding).
    pub fn mark_all_units(&self) {
        let mut have = self.have.lock().expect("have bitfield lock poisoned");
        for i in 0..self.unit_count {
            have.set(i);
        }
    }

    /// Bootstrap resume heuristic: marks a unit present iff it contains a
    /// non-zero byte.
    ///
    /// This is a stand-in for a real resume mechanism and is wrong in both
    /// directions: a legitimate all-zero unit reads as missing (it will be
    /// re-downloaded), and partially-written garbage reads as present until
    /// a peer fails to verify it. Returns the number of units marked.
    ///
    /// # Errors
    ///
    /// - `SwarmError::Io` - never currently; per-unit read failures are
    ///   logged and skipped so one bad region cannot block startup
    pub fn scan_existing_units(&self) -> Result<u64, SwarmError> {
        let mut marked = 0;
        for index in 0..self.unit_count {
            let data = match self.read_unit(index) {
                Ok(data) => data,
                Err(e) => {
                    warn!("failed to read unit {index} during startup scan: {e}");
                    continue;
                }
            };
            if data.iter().any(|&b| b != 0) {
                self.have
                    .lock()
                    .expect("have bitfield lock poisoned")
                    .set(index);
                marked += 1;
            }
        }
        Ok(marked)
    }

    /// Runs `f` with the open file handle, for tree hashing over the store.
    pub(crate) fn with_file<T>(&self, f: impl FnOnce(&File) -> T) -> T {
        let file = self.file.read().expect("store file lock poisoned");
        f(&file)
    }

    /// Closes and reopens the backing file read-only.
    ///
    /// An optimization for completed files; subsequent writes fail at the
    /// OS level.
    ///
    /// # Errors
    ///
    /// - `SwarmError::Io` - reopen failure; the old handle stays in place
    pub fn switch_to_read_only(&self) -> Result<(), SwarmError> {
        let replacement = File::open(&self.path)?;
        let mut file = self.file.write().expect("store file lock poisoned");
        *file = replacement;
        Ok(())
    }

    /// Flushes file contents to disk.
    ///
    /// # Errors
    ///
    /// - `SwarmError::Io` - sync failure
    pub fn sync(&self) -> Result<(), SwarmError> {
        let file = self.file.read().expect("store file lock poisoned");
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_descriptor(length: u64) -> Arc<Descriptor> {
        Arc::new(
            Descriptor::new(
                "unit_store_test.bin".to_string(),
                length,
                hex::encode([0x11u8; 32]),
                vec![],
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_open_truncates_to_length() {
        let dir = tempfile::tempdir().unwrap();
        let store = UnitStore::open(test_descriptor(100_000), dir.path()).unwrap();
        let meta = std::fs::metadata(dir.path().join("unit_store_test.bin")).unwrap();
        assert_eq!(meta.len(), 100_000);
        assert_eq!(store.unit_count(), 2);
        assert_eq!(store.bitfield().count(), 0);
    }

    #[test]
    fn test_unit_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = UnitStore::open(test_descriptor(100_000), dir.path()).unwrap();

        let data = vec![0xABu8; UNIT_SIZE as usize];
        store.write_unit(0, &data).unwrap();
        assert!(store.has_unit(0));
        assert!(!store.has_unit(1));
        assert_eq!(store.read_unit(0).unwrap(), data);

        // Last unit is short
        let tail_len = 100_000 - UNIT_SIZE;
        let tail = vec![0xCDu8; tail_len as usize];
        store.write_unit(1, &tail).unwrap();
        assert_eq!(store.read_unit(1).unwrap(), tail);
        assert!(store.all_units());
    }

    #[test]
    fn test_write_unit_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = UnitStore::open(test_descriptor(100_000), dir.path()).unwrap();
        let err = store.write_unit(0, &[0u8; 10]).unwrap_err();
        assert!(matches!(err, SwarmError::Malformed { .. }));
        assert!(!store.has_unit(0));
    }

    #[test]
    fn test_range_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let store = UnitStore::open(test_descriptor(1000), dir.path()).unwrap();

        assert!(matches!(
            store.read_range(990, 20),
            Err(SwarmError::OutOfBounds { .. })
        ));
        assert!(matches!(
            store.write_range(999, &[0u8; 2]),
            Err(SwarmError::OutOfBounds { .. })
        ));
        assert!(store.read_unit(1).is_err());

        store.write_range(990, &[1u8; 10]).unwrap();
        assert_eq!(store.read_range(990, 10).unwrap(), vec![1u8; 10]);
    }

    #[test]
    fn test_scan_existing_units() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = test_descriptor(3 * UNIT_SIZE);

        {
            let store = UnitStore::open(descriptor.clone(), dir.path()).unwrap();
            store.write_range(UNIT_SIZE + 17, &[0x42]).unwrap();
        }

        // A fresh store sees the unit with data; all-zero units stay missing
        let store = UnitStore::open(descriptor, dir.path()).unwrap();
        let marked = store.scan_existing_units().unwrap();
        assert_eq!(marked, 1);
        assert!(!store.has_unit(0));
        assert!(store.has_unit(1));
        assert!(!store.has_unit(2));
    }

    #[test]
    fn test_switch_to_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = UnitStore::open(test_descriptor(UNIT_SIZE), dir.path()).unwrap();

        let data = vec![0x33u8; UNIT_SIZE as usize];
        store.write_unit(0, &data).unwrap();
        store.switch_to_read_only().unwrap();

        assert_eq!(store.read_unit(0).unwrap(), data);
        assert!(store.write_range(0, &[1]).is_err());
    }
}
