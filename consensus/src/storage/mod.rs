// Storage layer implementation using RocksDB
//
// Persists consensus snapshots (sequenced, keeping a recent window) and the
// latest copy of every operation record so an engine can be rebuilt after
// restart and operations can be looked up by id without loading a snapshot.

use crate::crypto::Hash;
use crate::engine::ConsensusSnapshot;
use crate::operation::Operation;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Column family names
const CF_SNAPSHOTS: &str = "snapshots";
const CF_OPERATIONS: &str = "operations";
const CF_METADATA: &str = "metadata";

/// Metadata keys
const KEY_LATEST_SEQUENCE: &[u8] = b"latest_snapshot_sequence";

/// Snapshots kept after each save by default
pub const DEFAULT_SNAPSHOT_RETENTION: u64 = 8;

/// Durable home for consensus snapshots
pub trait SnapshotStore: Send + Sync {
    /// Persist `snapshot` and the records of the `changed` operations; returns its sequence
    fn save_snapshot(&self, snapshot: &ConsensusSnapshot, changed: &[Hash]) -> Result<u64>;

    fn load_latest_snapshot(&self) -> Result<Option<ConsensusSnapshot>>;

    /// Keep the newest `keep` snapshots; returns how many were removed
    fn prune_snapshots(&self, keep: u64) -> Result<usize>;
}

pub struct ConsensusStore {
    db: Arc<DB>,
}

impl ConsensusStore {
    /// Open (or create) the store at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_SNAPSHOTS, Options::default()),
            ColumnFamilyDescriptor::new(CF_OPERATIONS, Options::default()),
            ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&opts, path, cfs)?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Persist a snapshot and the `changed` operations atomically; returns its sequence
    ///
    /// Ids missing from the snapshot are skipped.
    pub fn save_snapshot(&self, snapshot: &ConsensusSnapshot, changed: &[Hash]) -> Result<u64> {
        let sequence = self.latest_sequence()?.map_or(0, |s| s + 1);
        let snapshot_bytes = encode(snapshot)?;

        let cf_snapshots = self.get_cf(CF_SNAPSHOTS)?;
        let cf_operations = self.get_cf(CF_OPERATIONS)?;
        let cf_metadata = self.get_cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_snapshots, sequence.to_be_bytes(), &snapshot_bytes);
        let mut written = 0;
        for id in changed {
            if let Some(operation) = snapshot.operations.get(id) {
                batch.put_cf(cf_operations, id.as_bytes(), encode(operation)?);
                written += 1;
            }
        }
        batch.put_cf(cf_metadata, KEY_LATEST_SEQUENCE, sequence.to_le_bytes());
        self.db.write(batch)?;

        debug!(
            sequence,
            operations = written,
            bytes = snapshot_bytes.len(),
            "Consensus snapshot saved"
        );
        Ok(sequence)
    }

    pub fn load_latest_snapshot(&self) -> Result<Option<ConsensusSnapshot>> {
        match self.latest_sequence()? {
            Some(sequence) => self.load_snapshot(sequence),
            None => Ok(None),
        }
    }

    pub fn load_snapshot(&self, sequence: u64) -> Result<Option<ConsensusSnapshot>> {
        let cf_snapshots = self.get_cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(cf_snapshots, sequence.to_be_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Latest persisted copy of an operation
    pub fn load_operation(&self, id: &Hash) -> Result<Option<Operation>> {
        let cf_operations = self.get_cf(CF_OPERATIONS)?;
        match self.db.get_cf(cf_operations, id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn latest_sequence(&self) -> Result<Option<u64>> {
        let cf_metadata = self.get_cf(CF_METADATA)?;
        match self.db.get_cf(cf_metadata, KEY_LATEST_SEQUENCE)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StorageError::InvalidData("Invalid sequence bytes".into()))?;
                Ok(Some(u64::from_le_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    /// Keep the newest `keep` snapshots and delete the rest; returns how many were removed
    pub fn prune_snapshots(&self, keep: u64) -> Result<usize> {
        let Some(latest) = self.latest_sequence()? else {
            return Ok(0);
        };
        let cutoff = (latest + 1).saturating_sub(keep.max(1));

        let cf_snapshots = self.get_cf(CF_SNAPSHOTS)?;
        let mut batch = WriteBatch::default();
        let mut removed = 0;
        for item in self.db.iterator_cf(cf_snapshots, IteratorMode::Start) {
            let (key, _) = item?;
            let raw: [u8; 8] = key
                .as_ref()
                .try_into()
                .map_err(|_| StorageError::InvalidData("Invalid snapshot key".into()))?;
            if u64::from_be_bytes(raw) >= cutoff {
                break;
            }
            batch.delete_cf(cf_snapshots, key);
            removed += 1;
        }
        self.db.write(batch)?;

        debug!(removed, keep, "Pruned consensus snapshots");
        Ok(removed)
    }

    fn get_cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::InvalidData(format!("Column family not found: {}", name)))
    }
}

impl SnapshotStore for ConsensusStore {
    fn save_snapshot(&self, snapshot: &ConsensusSnapshot, changed: &[Hash]) -> Result<u64> {
        ConsensusStore::save_snapshot(self, snapshot, changed)
    }

    fn load_latest_snapshot(&self) -> Result<Option<ConsensusSnapshot>> {
        ConsensusStore::load_latest_snapshot(self)
    }

    fn prune_snapshots(&self, keep: u64) -> Result<usize> {
        ConsensusStore::prune_snapshots(self, keep)
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| StorageError::SerializationError(e.to_string()))
}
