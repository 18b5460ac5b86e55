//! # MatrixDB: Persistent Storage Engine
//!
//! The persistence layer for the triad matrix, built on sled's embedded
//! key-value store. All on-disk data flows through this module.
//!
//! ## Key Layout
//!
//! Everything lives in a single sled tree named `matrix`:
//!
//! | Key                     | Value                       |
//! |-------------------------|-----------------------------|
//! | `triad:<id>`            | `json(Triad)`               |
//! | `matrix:state_metadata` | `json(StateMetadata)`       |
//!
//! A prefix scan over `triad:` yields exactly the stored triads. The
//! metadata key deliberately does not share that prefix.
//!
//! ## Durability
//!
//! Every write method flushes before returning. The store relies on this:
//! an event is only emitted after the matching write has returned `Ok`.
//!
//! ## Exclusivity
//!
//! sled holds an exclusive file lock on its directory, so a second
//! `MatrixDB::open` on the same path fails instead of sharing the namespace.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sled::{Batch, Db, Tree};

use crate::config::{METADATA_KEY, MATRIX_TREE, TRIAD_KEY_PREFIX};
use crate::matrix::Triad;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

// ---------------------------------------------------------------------------
// Metadata Record
// ---------------------------------------------------------------------------

/// Matrix-wide state persisted under `matrix:state_metadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMetadata {
    pub dimensions: u32,
    pub complexity: u32,
    pub consensus_threshold: f64,
    /// Registered validator addresses.
    pub validators: BTreeSet<String>,
    /// Unix milliseconds of the last metadata write.
    pub last_updated: u64,
}

fn triad_key(id: &str) -> Vec<u8> {
    format!("{TRIAD_KEY_PREFIX}{id}").into_bytes()
}

fn encode<T: Serialize>(value: &T) -> DbResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| DbError::Serialization(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> DbResult<T> {
    serde_json::from_slice(bytes).map_err(|e| DbError::Serialization(e.to_string()))
}

// ---------------------------------------------------------------------------
// MatrixDB
// ---------------------------------------------------------------------------

/// Persistent storage engine for triads and matrix metadata.
///
/// Cloning is cheap and shares the same underlying sled handle.
#[derive(Debug, Clone)]
pub struct MatrixDB {
    /// The underlying sled database handle.
    db: Db,
    /// The `matrix` tree holding triads and metadata.
    matrix: Tree,
}

impl MatrixDB {
    /// Open or create a database at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Create a temporary database that is removed when dropped.
    ///
    /// Used by tests and throwaway nodes.
    pub fn open_temporary() -> DbResult<Self> {
        let config = sled::Config::new().temporary(true);
        let db = config.open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> DbResult<Self> {
        let matrix = db.open_tree(MATRIX_TREE)?;
        Ok(Self { db, matrix })
    }

    // -- Triad operations ---------------------------------------------------

    /// Persist a triad under `triad:<id>`, replacing any previous record.
    pub fn put_triad(&self, triad: &Triad) -> DbResult<()> {
        self.matrix.insert(triad_key(&triad.id), encode(triad)?)?;
        self.flush()
    }

    /// Persist a triad and the metadata record in one atomic batch.
    pub fn put_triad_with_metadata(
        &self,
        triad: &Triad,
        metadata: &StateMetadata,
    ) -> DbResult<()> {
        let mut batch = Batch::default();
        batch.insert(triad_key(&triad.id), encode(triad)?);
        batch.insert(METADATA_KEY.as_bytes(), encode(metadata)?);
        self.matrix.apply_batch(batch)?;
        self.flush()
    }

    /// Retrieve a triad by id. Returns `None` if it was never stored.
    pub fn get_triad(&self, id: &str) -> DbResult<Option<Triad>> {
        match self.matrix.get(triad_key(id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every stored triad, in key order.
    pub fn triads(&self) -> DbResult<Vec<Triad>> {
        let mut triads = Vec::new();
        for entry in self.matrix.scan_prefix(TRIAD_KEY_PREFIX.as_bytes()) {
            let (_key, value) = entry?;
            triads.push(decode(&value)?);
        }
        Ok(triads)
    }

    /// Number of stored triads.
    pub fn triad_count(&self) -> usize {
        self.matrix
            .scan_prefix(TRIAD_KEY_PREFIX.as_bytes())
            .keys()
            .filter(|k| k.is_ok())
            .count()
    }

    // -- Metadata operations ------------------------------------------------

    /// Persist the metadata record.
    pub fn put_metadata(&self, metadata: &StateMetadata) -> DbResult<()> {
        self.matrix.insert(METADATA_KEY.as_bytes(), encode(metadata)?)?;
        self.flush()
    }

    /// Load the metadata record. `None` means a fresh database.
    pub fn get_metadata(&self) -> DbResult<Option<StateMetadata>> {
        match self.matrix.get(METADATA_KEY.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    // -- Utility operations -------------------------------------------------

    /// Force a flush of all pending writes to disk.
    pub fn flush(&self) -> DbResult<()> {
        self.db.flush()?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn corrupt_metadata_for_tests(&self) {
        self.matrix
            .insert(METADATA_KEY.as_bytes(), b"{not json".to_vec())
            .unwrap();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::Position;
    use serde_json::json;

    fn make_triad(id: &str) -> Triad {
        Triad {
            id: id.to_string(),
            data: json!({"note": id}),
            validator: "TRDvalidator".to_string(),
            timestamp: 1_700_000_000_000,
            position: Position::new(1, 2, 0),
            validated: false,
            consensus: 0.0,
            validation_attempts: 0,
        }
    }

    fn make_metadata() -> StateMetadata {
        StateMetadata {
            dimensions: 3,
            complexity: 4,
            consensus_threshold: 0.67,
            validators: BTreeSet::from(["TRDa".to_string()]),
            last_updated: 1,
        }
    }

    #[test]
    fn open_temporary_database() {
        let db = MatrixDB::open_temporary().expect("should create temp db");
        assert_eq!(db.triad_count(), 0);
        assert!(db.get_metadata().unwrap().is_none());
    }

    #[test]
    fn store_and_retrieve_triad() {
        let db = MatrixDB::open_temporary().unwrap();
        let triad = make_triad("aa");
        db.put_triad(&triad).unwrap();

        let retrieved = db.get_triad("aa").unwrap().expect("triad should exist");
        assert_eq!(retrieved, triad);
    }

    #[test]
    fn get_triad_returns_none_for_missing_id() {
        let db = MatrixDB::open_temporary().unwrap();
        assert!(db.get_triad("nonexistent").unwrap().is_none());
    }

    #[test]
    fn prefix_scan_excludes_metadata() {
        let db = MatrixDB::open_temporary().unwrap();
        db.put_metadata(&make_metadata()).unwrap();
        db.put_triad(&make_triad("01")).unwrap();
        db.put_triad(&make_triad("02")).unwrap();

        let triads = db.triads().unwrap();
        assert_eq!(triads.len(), 2);
        assert_eq!(db.triad_count(), 2);
        assert!(triads.iter().all(|t| t.id == "01" || t.id == "02"));
    }

    #[test]
    fn overwrite_updates_record() {
        let db = MatrixDB::open_temporary().unwrap();
        let mut triad = make_triad("cc");
        db.put_triad(&triad).unwrap();

        triad.validated = true;
        triad.consensus = 0.9;
        triad.validation_attempts = 1;
        db.put_triad(&triad).unwrap();

        let retrieved = db.get_triad("cc").unwrap().unwrap();
        assert!(retrieved.validated);
        assert_eq!(retrieved.validation_attempts, 1);
        assert_eq!(db.triad_count(), 1);
    }

    #[test]
    fn batch_write_persists_triad_and_metadata() {
        let db = MatrixDB::open_temporary().unwrap();
        let triad = make_triad("dd");
        let metadata = make_metadata();
        db.put_triad_with_metadata(&triad, &metadata).unwrap();

        assert!(db.get_triad("dd").unwrap().is_some());
        assert_eq!(db.get_metadata().unwrap(), Some(metadata));
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let db = MatrixDB::open(dir.path()).expect("should open db");
            db.put_triad(&make_triad("ee")).unwrap();
            db.put_metadata(&make_metadata()).unwrap();
        }

        let db = MatrixDB::open(dir.path()).expect("should reopen db");
        assert!(db.get_triad("ee").unwrap().is_some());
        assert_eq!(db.get_metadata().unwrap().unwrap().validators.len(), 1);
    }

    #[test]
    fn corrupt_record_surfaces_serialization_error() {
        let db = MatrixDB::open_temporary().unwrap();
        db.matrix.insert(triad_key("bad"), b"{not json".to_vec()).unwrap();

        assert!(matches!(db.get_triad("bad"), Err(DbError::Serialization(_))));
        assert!(matches!(db.triads(), Err(DbError::Serialization(_))));
    }

    #[test]
    fn metadata_uses_wire_field_names() {
        let json = serde_json::to_value(make_metadata()).unwrap();
        assert!(json.get("consensusThreshold").is_some());
        assert!(json.get("lastUpdated").is_some());
    }
}
