//! Persistent storage for the VM record.
//!
//! The core only needs a get/update accessor for a single [`VmRecord`].
//! [`QvmdDb`] stores it in redb; [`MemoryStore`] keeps it in memory.

use crate::config::{RecordState, VmRecord};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Table for the VM record (key -> JSON-serialized VmRecord).
const VM_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("vm");

/// Key of the single VM record.
const RECORD_KEY: &str = "default";

/// Read/write accessor for the single VM record.
pub trait RecordStore: Send + Sync {
    /// Read the record. A store that has never been written returns
    /// [`VmRecord::default`].
    fn get(&self) -> Result<VmRecord>;

    /// Replace the record.
    fn put(&self, record: &VmRecord) -> Result<()>;

    /// Modify the record in place and return the updated copy.
    fn update(&self, f: &mut dyn FnMut(&mut VmRecord)) -> Result<VmRecord> {
        let mut record = self.get()?;
        f(&mut record);
        self.put(&record)?;
        Ok(record)
    }

    /// Write only the status field.
    fn set_status(&self, status: RecordState) -> Result<()> {
        self.update(&mut |r| r.status = status).map(|_| ())
    }
}

/// redb-backed record store.
#[derive(Clone)]
pub struct QvmdDb {
    db: Arc<Database>,
    path: PathBuf,
}

impl std::fmt::Debug for QvmdDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QvmdDb")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl QvmdDb {
    /// Open the database at a specific path.
    ///
    /// Creates parent directories if they don't exist.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Database(format!("failed to create database directory: {}", e))
            })?;
        }

        let db = Database::create(path)
            .map_err(|e| Error::Database(format!("failed to open database: {}", e)))?;

        let instance = Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
        };
        instance.init_tables()?;

        Ok(instance)
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init_tables(&self) -> Result<()> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| Error::Database(format!("failed to begin write transaction: {}", e)))?;
        write_txn
            .open_table(VM_TABLE)
            .map_err(|e| Error::Database(format!("failed to create vm table: {}", e)))?;
        write_txn
            .commit()
            .map_err(|e| Error::Database(format!("failed to commit table creation: {}", e)))?;
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<VmRecord> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::Database(format!("failed to deserialize VmRecord: {}", e)))
    }
}

impl RecordStore for QvmdDb {
    fn get(&self) -> Result<VmRecord> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| Error::Database(format!("failed to begin read transaction: {}", e)))?;
        let table = read_txn
            .open_table(VM_TABLE)
            .map_err(|e| Error::Database(format!("failed to open vm table: {}", e)))?;

        match table
            .get(RECORD_KEY)
            .map_err(|e| Error::Database(format!("failed to read vm record: {}", e)))?
        {
            Some(value) => Self::decode(value.value()),
            None => Ok(VmRecord::default()),
        }
    }

    fn put(&self, record: &VmRecord) -> Result<()> {
        let json = serde_json::to_vec(record)
            .map_err(|e| Error::Database(format!("failed to serialize VmRecord: {}", e)))?;

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| Error::Database(format!("failed to begin write transaction: {}", e)))?;
        {
            let mut table = write_txn
                .open_table(VM_TABLE)
                .map_err(|e| Error::Database(format!("failed to open vm table: {}", e)))?;
            table
                .insert(RECORD_KEY, json.as_slice())
                .map_err(|e| Error::Database(format!("failed to write vm record: {}", e)))?;
        }
        write_txn
            .commit()
            .map_err(|e| Error::Database(format!("failed to commit vm record: {}", e)))?;

        Ok(())
    }

    /// Read-modify-write inside a single write transaction.
    fn update(&self, f: &mut dyn FnMut(&mut VmRecord)) -> Result<VmRecord> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| Error::Database(format!("failed to begin write transaction: {}", e)))?;

        let record = {
            let mut table = write_txn
                .open_table(VM_TABLE)
                .map_err(|e| Error::Database(format!("failed to open vm table: {}", e)))?;

            let mut record = match table
                .get(RECORD_KEY)
                .map_err(|e| Error::Database(format!("failed to read vm record: {}", e)))?
            {
                Some(value) => Self::decode(value.value())?,
                None => VmRecord::default(),
            };
            f(&mut record);

            let json = serde_json::to_vec(&record)
                .map_err(|e| Error::Database(format!("failed to serialize VmRecord: {}", e)))?;
            table
                .insert(RECORD_KEY, json.as_slice())
                .map_err(|e| Error::Database(format!("failed to write vm record: {}", e)))?;
            record
        };

        write_txn
            .commit()
            .map_err(|e| Error::Database(format!("failed to commit vm record: {}", e)))?;

        Ok(record)
    }
}

/// In-memory record store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    record: Mutex<VmRecord>,
}

impl MemoryStore {
    /// Create a store holding the given record.
    pub fn new(record: VmRecord) -> Self {
        Self {
            record: Mutex::new(record),
        }
    }
}

impl RecordStore for MemoryStore {
    fn get(&self) -> Result<VmRecord> {
        Ok(self.record.lock().clone())
    }

    fn put(&self, record: &VmRecord) -> Result<()> {
        *self.record.lock() = record.clone();
        Ok(())
    }

    fn update(&self, f: &mut dyn FnMut(&mut VmRecord)) -> Result<VmRecord> {
        let mut record = self.record.lock();
        f(&mut record);
        Ok(record.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_db() -> (TempDir, QvmdDb) {
        let dir = TempDir::new().unwrap();
        let db = QvmdDb::open_at(&dir.path().join("state").join("qvmd.redb")).unwrap();
        (dir, db)
    }

    #[test]
    fn test_db_empty_reads_default() {
        let (_dir, db) = temp_db();
        let record = db.get().unwrap();
        assert_eq!(record.status, RecordState::Stopped);
        assert!(record.image_path.is_none());
    }

    #[test]
    fn test_db_put_and_update() {
        let (_dir, db) = temp_db();

        let record = VmRecord {
            image_path: Some(PathBuf::from("/x/flex.bin")),
            ram_mb: 2048,
            ..Default::default()
        };
        db.put(&record).unwrap();
        assert_eq!(db.get().unwrap(), record);

        let updated = db.update(&mut |r| r.vram_mb = 32).unwrap();
        assert_eq!(updated.vram_mb, 32);
        assert_eq!(updated.ram_mb, 2048);

        db.set_status(RecordState::Running).unwrap();
        assert_eq!(db.get().unwrap().status, RecordState::Running);
    }

    #[test]
    fn test_db_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("qvmd.redb");

        {
            let db = QvmdDb::open_at(&path).unwrap();
            db.set_status(RecordState::Running).unwrap();
        }

        let db = QvmdDb::open_at(&path).unwrap();
        assert_eq!(db.get().unwrap().status, RecordState::Running);
    }

    #[test]
    fn test_db_concurrent_updates() {
        let (_dir, db) = temp_db();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let db = db.clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        db.update(&mut |r| r.ram_mb += 1).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(db.get().unwrap().ram_mb, crate::config::DEFAULT_RAM_MB + 40);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::default();
        store.set_status(RecordState::Error).unwrap();
        assert_eq!(store.get().unwrap().status, RecordState::Error);
    }
}
