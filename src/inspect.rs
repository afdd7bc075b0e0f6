use std::path::PathBuf;

use anyhow::Result;

use crate::metastore::FjallMetaStore;

fn open_meta_store(meta_root: PathBuf) -> Result<FjallMetaStore> {
    Ok(FjallMetaStore::open(meta_root, None)?)
}

/// Number of records in the metadata store at `meta_root`.
pub fn num_keys(meta_root: PathBuf) -> Result<usize> {
    let meta_store = open_meta_store(meta_root)?;
    Ok(meta_store.num_keys()?)
}

/// Disk space, in bytes, used by the metadata store at `meta_root`.
pub fn disk_space(meta_root: PathBuf) -> Result<u64> {
    let meta_store = open_meta_store(meta_root)?;
    Ok(meta_store.disk_space())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metastore::{Durability, FileRecord, MetaStore};
    use chrono::Utc;

    #[tokio::test]
    async fn test_num_keys_counts_records() {
        let dir = tempfile::tempdir().unwrap();
        let meta_root = dir.path().join("meta");
        {
            let store = FjallMetaStore::open(meta_root.clone(), Some(Durability::Fsync)).unwrap();
            for id in ["a", "b", "a"] {
                let record = FileRecord {
                    id: id.to_string(),
                    path: id.to_string(),
                    metadata: Default::default(),
                    created_at: Utc::now(),
                    extensions: Default::default(),
                };
                store.upsert(&record).await.unwrap();
            }
        }

        assert_eq!(num_keys(meta_root.clone()).unwrap(), 2);
        assert!(disk_space(meta_root).is_ok());
    }
}
