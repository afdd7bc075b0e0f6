use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use tracing::debug;

use super::{Durability, FileRecord, Filter, MetaError, MetaStore, Sort};

const FILES_PARTITION: &str = "_FILES";

/// Metadata store backed by a local fjall keyspace, one JSON record per id.
pub struct FjallMetaStore {
    keyspace: Keyspace,
    files: PartitionHandle,
    durability: Option<Durability>,
}

impl FjallMetaStore {
    /// Opens (or creates) the keyspace at `path`.
    ///
    /// With a durability of `None` writes are left to fjall's own journal
    /// flushing.
    pub fn open(path: PathBuf, durability: Option<Durability>) -> Result<Self, MetaError> {
        debug!("opening fjall metadata store at {}", path.display());
        let keyspace = fjall::Config::new(path).open()?;
        let files = keyspace.open_partition(FILES_PARTITION, PartitionCreateOptions::default())?;
        Ok(Self {
            keyspace,
            files,
            durability,
        })
    }

    /// Returns the number of records.
    pub fn num_keys(&self) -> Result<usize, MetaError> {
        Ok(self.files.len()?)
    }

    /// Returns the disk space used by the keyspace.
    pub fn disk_space(&self) -> u64 {
        self.keyspace.disk_space()
    }

    fn persist(&self) -> Result<(), MetaError> {
        let mode = match self.durability {
            None => return Ok(()),
            Some(Durability::Buffer) => PersistMode::Buffer,
            Some(Durability::Fsync) => PersistMode::SyncAll,
            Some(Durability::Fdatasync) => PersistMode::SyncData,
        };
        self.keyspace.persist(mode)?;
        Ok(())
    }
}

impl fmt::Debug for FjallMetaStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FjallMetaStore")
            .field("partition", &FILES_PARTITION)
            .field("durability", &self.durability)
            .finish()
    }
}

#[async_trait]
impl MetaStore for FjallMetaStore {
    async fn find_one(&self, id: &str) -> Result<Option<FileRecord>, MetaError> {
        match self.files.get(id.as_bytes())? {
            Some(raw) => Ok(Some(FileRecord::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    async fn upsert(&self, record: &FileRecord) -> Result<(), MetaError> {
        self.files.insert(record.id.as_bytes(), record.to_vec()?)?;
        self.persist()
    }

    async fn find(
        &self,
        filter: &Filter,
        sort: Option<&Sort>,
    ) -> Result<Vec<FileRecord>, MetaError> {
        let mut records = Vec::new();
        for item in self.files.iter() {
            let (_key, value) = item?;
            let record = FileRecord::from_slice(&value)?;
            if filter.matches(&record) {
                records.push(record);
            }
        }
        if let Some(sort) = sort {
            sort.apply(&mut records);
        }
        Ok(records)
    }
}
