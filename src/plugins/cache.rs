//! Cache-aside mirror of primary content on local media.
//!
//! An entry for `id` is two artifacts under the cache root: the content at
//! `<root>/<id>` and a JSON sidecar at `<root>/<id>.meta` holding the
//! record, its `path` pointing at the cached content. A lookup that cannot
//! load both is a miss.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::fs;
use crate::handle::FileHandle;
use crate::hooks::{
    AfterReadHook, AfterWriteHook, BeforeReadHook, HookRegistry, Inbox, Plugin, ReadInbox,
};
use crate::metastore::FileRecord;
use crate::metrics::SharedMetrics;
use crate::store::Options;

const SIDECAR_SUFFIX: &str = ".meta";

#[derive(Debug, Clone)]
pub struct FileCache {
    root: PathBuf,
    metrics: SharedMetrics,
}

impl FileCache {
    /// Creates the cache root if needed.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            metrics: SharedMetrics::default(),
        })
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn content_path(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    pub fn sidecar_path(&self, id: &str) -> PathBuf {
        fs::with_suffix(&self.content_path(id), SIDECAR_SUFFIX)
    }

    /// Loads the entry for `id`. Any failure is a miss.
    pub async fn load(&self, id: &str) -> Option<FileHandle> {
        let sidecar = self.sidecar_path(id);
        let record: FileRecord = match fs::read_json(&sidecar).await {
            Ok(record) => record,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(id, "cache miss");
                return None;
            }
            Err(e) => {
                warn!(id, "unreadable cache sidecar {}: {e}", sidecar.display());
                return None;
            }
        };
        if record.id != id {
            warn!(id, found = %record.id, "cache sidecar names another id");
            return None;
        }

        let mut handle = FileHandle::from_record(record);
        match handle.set_path(self.content_path(id)) {
            Ok(()) => Some(handle),
            Err(e) => {
                debug!(id, "cache content unusable: {e}");
                None
            }
        }
    }

    /// Copies `source` into the entry for `record.id`, then writes the
    /// sidecar. Both go through `suffix`-then-rename. The old sidecar is
    /// dropped first, so a failed copy leaves a miss rather than old content.
    pub async fn store(&self, source: &Path, record: &FileRecord, suffix: &str) -> Result<()> {
        fs::ensure_dir(&self.root).await?;
        let sidecar = self.sidecar_path(&record.id);
        fs::remove_path(&sidecar).await?;

        let content = self.content_path(&record.id);
        let partial = fs::with_suffix(&content, suffix);
        fs::remove_path(&partial).await?;
        let copied = fs::copy_path(source, &partial).await?;

        // rename cannot replace a directory, or replace a file with one
        let replacing_tree = fs::is_directory(&partial).await?
            || matches!(fs::is_directory(&content).await, Ok(true));
        if replacing_tree {
            fs::remove_path(&content).await?;
        }
        fs::atomic_rename(&partial, &content).await?;

        let mut sidecar_record = record.clone();
        sidecar_record.path = content.to_string_lossy().into_owned();
        let sidecar_partial = fs::with_suffix(&sidecar, suffix);
        fs::write_json(&sidecar_partial, &sidecar_record).await?;
        fs::atomic_rename(&sidecar_partial, &sidecar).await?;

        debug!(id = %record.id, bytes = copied, "cached");
        Ok(())
    }

    /// Drops the entry for `id`, sidecar first so a concurrent lookup misses.
    pub async fn invalidate(&self, id: &str) -> Result<()> {
        fs::remove_path(&self.sidecar_path(id)).await?;
        fs::remove_path(&self.content_path(id)).await?;
        debug!(id, "cache entry dropped");
        Ok(())
    }
}

impl Plugin for FileCache {
    fn attach(self: Arc<Self>, hooks: &mut HookRegistry) {
        hooks
            .on_before_read(self.clone())
            .on_after_read(self.clone())
            .on_after_write(self);
    }
}

impl BeforeReadHook for FileCache {
    fn before_read(
        &self,
        inbox: &mut ReadInbox,
        id: &str,
        _destination: &Path,
        options: &Options,
    ) -> Result<()> {
        if !options.cache_allowed {
            return Ok(());
        }
        let cache = self.clone();
        let id = id.to_string();
        inbox.defer_lookup(async move {
            let found = cache.load(&id).await;
            match found {
                Some(_) => cache.metrics.cache_hit(),
                None => cache.metrics.cache_miss(),
            }
            found
        });
        Ok(())
    }
}

impl AfterReadHook for FileCache {
    fn after_read(
        &self,
        inbox: &mut Inbox,
        handle: &FileHandle,
        _destination: &Path,
        options: &Options,
    ) -> Result<()> {
        if !options.cache_allowed {
            return Ok(());
        }
        let Some(placed) = handle.path().map(Path::to_path_buf) else {
            return Ok(());
        };
        let record = record_for(handle);
        let suffix = options.suffix().to_string();
        let cache = self.clone();
        inbox.defer(async move { cache.store(&placed, &record, &suffix).await });
        Ok(())
    }
}

impl AfterWriteHook for FileCache {
    fn after_write(
        &self,
        inbox: &mut Inbox,
        handle: &FileHandle,
        record: &FileRecord,
        options: &Options,
    ) -> Result<()> {
        let cache = self.clone();
        // the source path holds the content before any stream-write transform
        let source = handle.path().map(Path::to_path_buf);
        match source {
            Some(source) if options.cache_allowed => {
                let record = record.clone();
                let suffix = options.suffix().to_string();
                inbox.defer(async move { cache.store(&source, &record, &suffix).await });
            }
            // an entry written earlier no longer matches the primary
            _ => {
                let id = record.id.clone();
                inbox.defer(async move { cache.invalidate(&id).await });
            }
        }
        Ok(())
    }
}

fn record_for(handle: &FileHandle) -> FileRecord {
    FileRecord {
        id: handle.id().to_string(),
        path: String::new(),
        metadata: handle.metadata().clone(),
        created_at: handle.created_at().unwrap_or_else(Utc::now),
        extensions: handle.extensions().clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::plugins::Gzip;
    use crate::stream::bytes_stream;
    use crate::testing::{metadata, Fixture};
    use serde_json::json;

    fn cached_fixture() -> (Fixture, Arc<FileCache>) {
        let mut fx = Fixture::new();
        let cache = Arc::new(FileCache::new(fx.cache_root()).unwrap());
        fx.store.hooks_mut().attach(cache.clone());
        (fx, cache)
    }

    #[tokio::test]
    async fn test_read_after_write_is_served_by_cache() {
        let (fx, cache) = cached_fixture();
        let src = fx.source_file("doc.txt", "cached content");
        let opts = Options::new().cache_allowed(true);
        let handle = FileHandle::from_path("doc", &src).with_metadata(metadata(json!({"k": "v"})));
        let written = fx.store.write(handle, opts.clone()).await.unwrap();

        let calls_before = fx.meta.find_one_calls();
        let dest = fx.dest("doc.txt");
        let read = fx.store.read("doc", &dest, opts).await.unwrap();

        assert_eq!(fx.meta.find_one_calls(), calls_before);
        assert_eq!(read.path(), Some(cache.content_path("doc").as_path()));
        assert_eq!(std::fs::read_to_string(read.path().unwrap()).unwrap(), "cached content");
        assert_eq!(read.metadata(), &metadata(json!({"k": "v"})));
        assert_eq!(read.created_at(), written.created_at());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_cache_survives_offline_primary() {
        let (fx, cache) = cached_fixture();
        let src = fx.source_file("a2.txt", "from cache");
        let opts = Options::new().cache_allowed(true);
        fx.store
            .write(FileHandle::from_path("a2", &src), opts.clone())
            .await
            .unwrap();

        fx.meta.set_offline(true);
        let read = fx.store.read("a2", fx.dest("a2"), opts).await.unwrap();
        let path = read.path().unwrap();
        assert!(path.starts_with(cache.root()));
        assert!(!path.starts_with(fx.storage_root()));

        // without the cache the same read reaches the dead primary
        let err = fx.store.read("a2", fx.dest("a2"), Options::new()).await.unwrap_err();
        assert!(matches!(err, Error::Store(_)));
    }

    #[tokio::test]
    async fn test_cache_disabled_per_operation() {
        let (fx, cache) = cached_fixture();
        let src = fx.source_file("plain.txt", "x");
        fx.store
            .write(FileHandle::from_path("plain", &src), Options::new())
            .await
            .unwrap();
        assert!(!cache.sidecar_path("plain").exists());

        let calls_before = fx.meta.find_one_calls();
        fx.store.read("plain", fx.dest("plain"), Options::new()).await.unwrap();
        assert_eq!(fx.meta.find_one_calls(), calls_before + 1);
    }

    #[tokio::test]
    async fn test_primary_read_populates_cache() {
        let (fx, cache) = cached_fixture();
        fx.store
            .write(FileHandle::from_stream("s", bytes_stream("streamed")), Options::new())
            .await
            .unwrap();
        // stream-sourced writes are not cached
        assert!(cache.load("s").await.is_none());

        let opts = Options::new().cache_allowed(true);
        let first = fx.store.read("s", fx.dest("s1"), opts.clone()).await.unwrap();
        assert_eq!(first.path(), Some(fx.dest("s1").as_path()));

        let calls = fx.meta.find_one_calls();
        let second = fx.store.read("s", fx.dest("s2"), opts).await.unwrap();
        assert_eq!(fx.meta.find_one_calls(), calls);
        assert_eq!(std::fs::read_to_string(second.path().unwrap()).unwrap(), "streamed");
    }

    #[tokio::test]
    async fn test_half_entries_are_misses() {
        let (fx, cache) = cached_fixture();
        fx.store
            .write(FileHandle::from_stream("half", bytes_stream("primary")), Options::new())
            .await
            .unwrap();

        // content without sidecar
        std::fs::write(cache.content_path("half"), "stale").unwrap();
        assert!(cache.load("half").await.is_none());

        // corrupt sidecar
        std::fs::write(cache.sidecar_path("half"), "{not json").unwrap();
        assert!(cache.load("half").await.is_none());

        let dest = fx.dest("half");
        let read = fx
            .store
            .read("half", &dest, Options::new().cache_allowed(true))
            .await
            .unwrap();
        assert_eq!(read.path(), Some(dest.as_path()));
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "primary");
    }

    #[tokio::test]
    async fn test_sidecar_without_content_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path()).unwrap();
        let src = dir.path().join("src");
        std::fs::write(&src, "data").unwrap();
        let record = FileRecord {
            id: "gone".into(),
            path: String::new(),
            metadata: Default::default(),
            created_at: Utc::now(),
            extensions: Default::default(),
        };
        cache.store(&src, &record, ".part").await.unwrap();
        assert!(cache.load("gone").await.is_some());

        std::fs::remove_file(cache.content_path("gone")).unwrap();
        assert!(cache.load("gone").await.is_none());
    }

    #[tokio::test]
    async fn test_cache_holds_untransformed_content() {
        let mut fx = Fixture::new();
        let cache = Arc::new(FileCache::new(fx.cache_root()).unwrap());
        fx.store.hooks_mut().register(Gzip::default()).attach(cache.clone());

        let src = fx.source_file("z.txt", "plain text");
        let opts = Options::new().cache_allowed(true);
        fx.store.write(FileHandle::from_path("z", &src), opts.clone()).await.unwrap();

        assert_eq!(std::fs::read_to_string(cache.content_path("z")).unwrap(), "plain text");
        let sidecar: FileRecord = fs::read_json(&cache.sidecar_path("z")).await.unwrap();
        assert_eq!(sidecar.path, cache.content_path("z").to_string_lossy());
        assert!(sidecar.extensions.flag("gzip", "gzipped"));
        assert!(!fs::with_suffix(&cache.sidecar_path("z"), ".part").exists());
    }

    #[tokio::test]
    async fn test_directory_entries_are_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().join("cache")).unwrap();
        let tree = dir.path().join("tree");
        std::fs::create_dir_all(tree.join("sub")).unwrap();
        std::fs::write(tree.join("sub").join("f"), "1").unwrap();
        let record = FileRecord {
            id: "t".into(),
            path: String::new(),
            metadata: Default::default(),
            created_at: Utc::now(),
            extensions: Default::default(),
        };

        cache.store(&tree, &record, ".part").await.unwrap();
        std::fs::remove_file(tree.join("sub").join("f")).unwrap();
        std::fs::write(tree.join("g"), "2").unwrap();
        cache.store(&tree, &record, ".part").await.unwrap();

        let content = cache.content_path("t");
        assert!(!content.join("sub").join("f").exists());
        assert_eq!(std::fs::read_to_string(content.join("g")).unwrap(), "2");
        let hit = cache.load("t").await.unwrap();
        assert!(hit.is_directory());
    }

    #[tokio::test]
    async fn test_stream_rewrite_replaces_cached_entry() {
        let (fx, cache) = cached_fixture();
        let src = fx.source_file("v1.txt", "v1");
        let opts = Options::new().cache_allowed(true);
        fx.store
            .write(FileHandle::from_path("doc", &src), opts.clone())
            .await
            .unwrap();
        assert!(cache.load("doc").await.is_some());

        fx.store
            .write(FileHandle::from_stream("doc", bytes_stream("v2")), opts.clone())
            .await
            .unwrap();
        assert!(!cache.sidecar_path("doc").exists());

        let calls_before = fx.meta.find_one_calls();
        let dest = fx.dest("doc");
        let read = fx.store.read("doc", &dest, opts).await.unwrap();
        assert_eq!(fx.meta.find_one_calls(), calls_before + 1);
        assert_eq!(std::fs::read_to_string(read.path().unwrap()).unwrap(), "v2");
    }

    #[tokio::test]
    async fn test_uncached_rewrite_drops_cached_entry() {
        let (fx, cache) = cached_fixture();
        let v1 = fx.source_file("v1.txt", "v1");
        let opts = Options::new().cache_allowed(true);
        fx.store
            .write(FileHandle::from_path("doc", &v1), opts.clone())
            .await
            .unwrap();

        let v2 = fx.source_file("v2.txt", "v2");
        fx.store
            .write(FileHandle::from_path("doc", &v2), Options::new())
            .await
            .unwrap();
        assert!(cache.load("doc").await.is_none());
        assert!(!cache.content_path("doc").exists());

        let read = fx.store.read("doc", fx.dest("doc"), opts).await.unwrap();
        assert_eq!(std::fs::read_to_string(read.path().unwrap()).unwrap(), "v2");
    }
}
