//! Shared test fixtures.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;

use crate::handle::Metadata;
use crate::metastore::{FileRecord, Filter, MemoryMetaStore, MetaError, MetaStore, Sort};
use crate::store::{FileStore, StoreOptions};

/// Wraps [`MemoryMetaStore`], counting `find_one` calls. Can be switched
/// offline, after which every call fails.
#[derive(Debug, Default)]
pub(crate) struct ProbeStore {
    inner: MemoryMetaStore,
    find_one_calls: AtomicUsize,
    offline: AtomicBool,
}

impl ProbeStore {
    pub(crate) fn find_one_calls(&self) -> usize {
        self.find_one_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub(crate) async fn is_empty(&self) -> bool {
        self.inner.is_empty().await
    }

    fn check(&self) -> Result<(), MetaError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(MetaError::Unavailable("probe store is offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MetaStore for ProbeStore {
    async fn find_one(&self, id: &str) -> Result<Option<FileRecord>, MetaError> {
        self.find_one_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.find_one(id).await
    }

    async fn upsert(&self, record: &FileRecord) -> Result<(), MetaError> {
        self.check()?;
        self.inner.upsert(record).await
    }

    async fn find(
        &self,
        filter: &Filter,
        sort: Option<&Sort>,
    ) -> Result<Vec<FileRecord>, MetaError> {
        self.check()?;
        self.inner.find(filter, sort).await
    }
}

/// A store over a [`ProbeStore`] inside a scratch directory.
pub(crate) struct Fixture {
    dir: TempDir,
    pub(crate) store: FileStore,
    pub(crate) meta: Arc<ProbeStore>,
}

impl Fixture {
    pub(crate) fn new() -> Self {
        Self::with_options(StoreOptions::default())
    }

    pub(crate) fn with_options(options: StoreOptions) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let meta = Arc::new(ProbeStore::default());
        let store = FileStore::new(dir.path().join("storage"), meta.clone()).with_options(options);
        Self { dir, store, meta }
    }

    pub(crate) fn storage_root(&self) -> &Path {
        self.store.storage_root()
    }

    pub(crate) fn cache_root(&self) -> PathBuf {
        self.dir.path().join("cache")
    }

    pub(crate) fn source_file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join("src").join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    /// A small tree: `a.txt` ("alpha") and `nested/b.txt` ("beta").
    pub(crate) fn source_dir(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join("src").join(name);
        std::fs::create_dir_all(path.join("nested")).unwrap();
        std::fs::write(path.join("a.txt"), "alpha").unwrap();
        std::fs::write(path.join("nested").join("b.txt"), "beta").unwrap();
        path
    }

    /// A destination path whose parent does not exist yet.
    pub(crate) fn dest(&self, name: &str) -> PathBuf {
        self.dir.path().join("out").join(name)
    }
}

pub(crate) fn metadata(value: Value) -> Metadata {
    match value {
        Value::Object(map) => map,
        other => panic!("metadata must be an object, got {other}"),
    }
}
