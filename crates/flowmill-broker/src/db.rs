//! The partition's runtime key-value database.
//!
//! The broker only depends on the [`StateDb`] and [`DbFactory`] seams: a
//! database lives in a directory, supports point reads and writes, and can
//! write a consistent snapshot of itself into another directory. [`FileDb`]
//! implements the seam with an in-memory image persisted as numbered `.sst`
//! table files.
//!
//! ## Table file format
//!
//! ```text
//! ┌───────┬─────────┬───────┬──────────────────────────────┬───────┐
//! │ Magic │ Version │ Count │ Entries                      │ CRC32 │
//! │ "FMT1"│ u16     │ u32   │ [klen u32, key, vlen, value] │ u32   │
//! └───────┴─────────┴───────┴──────────────────────────────┴───────┘
//! ```
//!
//! The CRC covers everything between the magic bytes and the checksum
//! itself; a mismatch on open surfaces as [`DbError::Corrupted`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

const MAGIC: &[u8; 4] = b"FMT1";
const FORMAT_VERSION: u16 = 1;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted table file: {0}")]
    Corrupted(String),

    #[error("database is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, DbError>;

/// The embedded key-value store seam consumed by the state controller.
pub trait StateDb: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Write a consistent snapshot of the database into `dir`. Safe to call
    /// concurrently with reads and writes.
    fn create_snapshot(&self, dir: &Path) -> Result<()>;

    /// Rough number of live entries, for monitoring only.
    fn approximate_entry_count(&self) -> Result<u64>;

    fn close(&self) -> Result<()>;
}

pub trait DbFactory: Send + Sync {
    /// Open the database in `dir`, creating it when absent.
    fn create_db(&self, dir: &Path) -> Result<Arc<dyn StateDb>>;
}

struct FileDbInner {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
    next_table: u64,
    closed: bool,
}

/// File-backed [`StateDb`]: the live image is in memory, durability comes
/// from snapshots.
pub struct FileDb {
    dir: PathBuf,
    inner: Mutex<FileDbInner>,
}

impl FileDb {
    fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let mut tables: Vec<(u64, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map(|e| e == "sst").unwrap_or(false) {
                if let Some(number) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<u64>().ok())
                {
                    tables.push((number, path));
                }
            }
        }
        tables.sort();

        // Each table is a full image; only the newest one matters.
        let (map, next_table) = match tables.last() {
            Some((number, path)) => (Self::read_table(path)?, number + 1),
            None => (BTreeMap::new(), 1),
        };

        debug!(dir = %dir.display(), entries = map.len(), "Opened database");
        Ok(Self {
            dir: dir.to_path_buf(),
            inner: Mutex::new(FileDbInner {
                map,
                next_table,
                closed: false,
            }),
        })
    }

    fn read_table(path: &Path) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        let name = path.display().to_string();
        let data = std::fs::read(path)?;
        if data.len() < MAGIC.len() + 2 + 4 + 4 || &data[..4] != MAGIC {
            return Err(DbError::Corrupted(name));
        }

        let body = &data[4..data.len() - 4];
        let recorded_crc = u32::from_le_bytes(
            data[data.len() - 4..]
                .try_into()
                .map_err(|_| DbError::Corrupted(name.clone()))?,
        );
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(body);
        if hasher.finalize() != recorded_crc {
            return Err(DbError::Corrupted(name));
        }

        let mut cursor = 0usize;
        let read_u16 = |cursor: &mut usize| -> Option<u16> {
            let bytes = body.get(*cursor..*cursor + 2)?;
            *cursor += 2;
            Some(u16::from_le_bytes(bytes.try_into().ok()?))
        };
        let read_u32 = |cursor: &mut usize| -> Option<u32> {
            let bytes = body.get(*cursor..*cursor + 4)?;
            *cursor += 4;
            Some(u32::from_le_bytes(bytes.try_into().ok()?))
        };
        let read_bytes = |cursor: &mut usize, len: usize| -> Option<Vec<u8>> {
            let bytes = body.get(*cursor..*cursor + len)?;
            *cursor += len;
            Some(bytes.to_vec())
        };

        let corrupted = || DbError::Corrupted(name.clone());
        let version = read_u16(&mut cursor).ok_or_else(&corrupted)?;
        if version != FORMAT_VERSION {
            return Err(corrupted());
        }
        let count = read_u32(&mut cursor).ok_or_else(&corrupted)?;

        let mut map = BTreeMap::new();
        for _ in 0..count {
            let key_len = read_u32(&mut cursor).ok_or_else(&corrupted)? as usize;
            let key = read_bytes(&mut cursor, key_len).ok_or_else(&corrupted)?;
            let value_len = read_u32(&mut cursor).ok_or_else(&corrupted)? as usize;
            let value = read_bytes(&mut cursor, value_len).ok_or_else(&corrupted)?;
            map.insert(key, value);
        }
        if cursor != body.len() {
            return Err(corrupted());
        }
        Ok(map)
    }

    fn write_table(
        path: &Path,
        map: &BTreeMap<Vec<u8>, Vec<u8>>,
    ) -> std::io::Result<()> {
        let mut body = Vec::new();
        body.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        body.extend_from_slice(&(map.len() as u32).to_le_bytes());
        for (key, value) in map {
            body.extend_from_slice(&(key.len() as u32).to_le_bytes());
            body.extend_from_slice(key);
            body.extend_from_slice(&(value.len() as u32).to_le_bytes());
            body.extend_from_slice(value);
        }

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&body);
        let crc = hasher.finalize();

        let mut file_contents = Vec::with_capacity(body.len() + 8);
        file_contents.extend_from_slice(MAGIC);
        file_contents.extend_from_slice(&body);
        file_contents.extend_from_slice(&crc.to_le_bytes());

        std::fs::write(path, file_contents)?;
        std::fs::File::open(path)?.sync_all()
    }

    fn check_open(inner: &FileDbInner) -> Result<()> {
        if inner.closed {
            Err(DbError::Closed)
        } else {
            Ok(())
        }
    }
}

impl StateDb for FileDb {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().expect("db state poisoned");
        Self::check_open(&inner)?;
        inner.map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.lock().expect("db state poisoned");
        Self::check_open(&inner)?;
        Ok(inner.map.get(key).cloned())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().expect("db state poisoned");
        Self::check_open(&inner)?;
        inner.map.remove(key);
        Ok(())
    }

    fn create_snapshot(&self, dir: &Path) -> Result<()> {
        let (image, table_number) = {
            let mut inner = self.inner.lock().expect("db state poisoned");
            Self::check_open(&inner)?;
            let number = inner.next_table;
            inner.next_table += 1;
            (inner.map.clone(), number)
        };
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{table_number:06}.sst"));
        Self::write_table(&path, &image)?;
        debug!(
            dir = %dir.display(),
            table = table_number,
            entries = image.len(),
            "Wrote database snapshot"
        );
        Ok(())
    }

    fn approximate_entry_count(&self) -> Result<u64> {
        let inner = self.inner.lock().expect("db state poisoned");
        Self::check_open(&inner)?;
        Ok(inner.map.len() as u64)
    }

    fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("db state poisoned");
        inner.closed = true;
        debug!(dir = %self.dir.display(), "Closed database");
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct FileDbFactory;

impl FileDbFactory {
    pub fn new() -> Self {
        Self
    }
}

impl DbFactory for FileDbFactory {
    fn create_db(&self, dir: &Path) -> Result<Arc<dyn StateDb>> {
        Ok(Arc::new(FileDb::open(dir)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &Path) -> Arc<dyn StateDb> {
        FileDbFactory::new().create_db(dir).unwrap()
    }

    #[test]
    fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let db = open(dir.path());

        db.put(b"x", b"3").unwrap();
        assert_eq!(db.get(b"x").unwrap(), Some(b"3".to_vec()));

        db.delete(b"x").unwrap();
        assert_eq!(db.get(b"x").unwrap(), None);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = TempDir::new().unwrap();
        let snapshot_dir = TempDir::new().unwrap();
        let db = open(dir.path());

        db.put(b"x", b"3").unwrap();
        db.put(b"y", b"4").unwrap();
        db.create_snapshot(snapshot_dir.path()).unwrap();

        let restored = open(snapshot_dir.path());
        assert_eq!(restored.get(b"x").unwrap(), Some(b"3".to_vec()));
        assert_eq!(restored.get(b"y").unwrap(), Some(b"4".to_vec()));
    }

    #[test]
    fn test_snapshot_is_point_in_time() {
        let dir = TempDir::new().unwrap();
        let snapshot_dir = TempDir::new().unwrap();
        let db = open(dir.path());

        db.put(b"x", b"3").unwrap();
        db.create_snapshot(snapshot_dir.path()).unwrap();
        db.put(b"x", b"4").unwrap();

        let restored = open(snapshot_dir.path());
        assert_eq!(restored.get(b"x").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn test_open_empty_directory_starts_empty() {
        let dir = TempDir::new().unwrap();
        let db = open(dir.path());
        assert_eq!(db.get(b"anything").unwrap(), None);
    }

    #[test]
    fn test_corrupted_table_fails_open() {
        let dir = TempDir::new().unwrap();
        let snapshot_dir = TempDir::new().unwrap();
        let db = open(dir.path());
        db.put(b"x", b"3").unwrap();
        db.create_snapshot(snapshot_dir.path()).unwrap();

        // Truncate the table file the way a torn write would.
        let table = snapshot_dir.path().join("000001.sst");
        std::fs::write(&table, b"<--corrupted-->").unwrap();

        let result = FileDbFactory::new().create_db(snapshot_dir.path());
        assert!(matches!(result, Err(DbError::Corrupted(_))));
    }

    #[test]
    fn test_operations_fail_after_close() {
        let dir = TempDir::new().unwrap();
        let db = open(dir.path());
        db.close().unwrap();
        assert!(matches!(db.put(b"x", b"1"), Err(DbError::Closed)));
        assert!(matches!(db.get(b"x"), Err(DbError::Closed)));
    }

    #[test]
    fn test_successive_snapshots_use_increasing_table_numbers() {
        let dir = TempDir::new().unwrap();
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        let db = open(dir.path());

        db.put(b"x", b"1").unwrap();
        db.create_snapshot(first.path()).unwrap();
        db.put(b"x", b"2").unwrap();
        db.create_snapshot(second.path()).unwrap();

        assert!(first.path().join("000001.sst").exists());
        assert!(second.path().join("000002.sst").exists());

        // Restoring from the second snapshot continues the numbering.
        let restored = open(second.path());
        let third = TempDir::new().unwrap();
        restored.create_snapshot(third.path()).unwrap();
        assert!(third.path().join("000003.sst").exists());
    }
}
