use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{FileRecord, Filter, MetaError, MetaStore, Sort};

/// In-process metadata store. Records are kept ordered by id.
#[derive(Debug, Default)]
pub struct MemoryMetaStore {
    records: RwLock<BTreeMap<String, FileRecord>>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn find_one(&self, id: &str) -> Result<Option<FileRecord>, MetaError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn upsert(&self, record: &FileRecord) -> Result<(), MetaError> {
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn find(
        &self,
        filter: &Filter,
        sort: Option<&Sort>,
    ) -> Result<Vec<FileRecord>, MetaError> {
        let mut records: Vec<FileRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        if let Some(sort) = sort {
            sort.apply(&mut records);
        }
        Ok(records)
    }
}
