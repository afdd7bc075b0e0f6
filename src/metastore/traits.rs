use async_trait::async_trait;

use super::record::{FileRecord, Filter, Sort};

use std::fmt::Debug;
use std::str::FromStr;

/// Errors returned by a metadata store backend.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    #[error("fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// The store cannot be reached right now.
    #[error("metadata store unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    OtherDBError(String),
}

/// MetaStore is the interface the file store uses to persist and query the
/// metadata records of stored items.
///
/// Implementations provide their own atomicity for a single call; the file
/// store never wraps several calls in a transaction.
#[async_trait]
pub trait MetaStore: Send + Sync + Debug + 'static {
    /// Gets the record for the given id.
    async fn find_one(&self, id: &str) -> Result<Option<FileRecord>, MetaError>;

    /// Inserts the record, replacing any record with the same id.
    async fn upsert(&self, record: &FileRecord) -> Result<(), MetaError>;

    /// Returns all records matching `filter`, ordered by `sort` if given.
    /// Without a sort the order is backend defined.
    async fn find(&self, filter: &Filter, sort: Option<&Sort>)
        -> Result<Vec<FileRecord>, MetaError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Durability {
    Buffer,
    Fsync,
    #[default]
    Fdatasync,
}

impl FromStr for Durability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "buffer" => Ok(Durability::Buffer),
            "fsync" => Ok(Durability::Fsync),
            "fdatasync" => Ok(Durability::Fdatasync),
            _ => Err(format!("Unknown durability option: {}", s)),
        }
    }
}
