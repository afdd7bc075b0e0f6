//! The orchestrator: drives read and write operations through their
//! lifecycle phases, emitting hook events along the way.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::fs;
use crate::handle::FileHandle;
use crate::hooks::{HookEvent, HookRegistry, Inbox, ReadInbox};
use crate::lifecycle::{Lifecycle, Operation, Phase};
use crate::metastore::{Durability, FileRecord, Filter, MetaStore, Sort};
use crate::metrics::SharedMetrics;
use crate::pipeline::{FileSink, Pipeline, PipelineReport, Source};

pub const DEFAULT_PARTIAL_SUFFIX: &str = ".part";
pub const DEFAULT_DB_FILE_PATH_HOLDER: &str = ".filedock";

/// Per-operation options. Before-write hooks may change them.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Lets cache collaborators take part in this operation.
    pub cache_allowed: bool,
    /// Suffix of in-flight destination paths. `None` takes the store default.
    pub partial_suffix: Option<String>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_allowed(mut self, allowed: bool) -> Self {
        self.cache_allowed = allowed;
        self
    }

    pub fn partial_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.partial_suffix = Some(suffix.into());
        self
    }

    /// The effective suffix. Always set once an operation has started.
    pub fn suffix(&self) -> &str {
        self.partial_suffix
            .as_deref()
            .unwrap_or(DEFAULT_PARTIAL_SUFFIX)
    }
}

/// Store-wide settings.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub partial_suffix: String,
    /// Marker file, relative to the storage root, created by setup.
    pub db_file_path_holder: String,
    pub durability: Durability,
    /// Delete the partial artifact of a failed pipeline instead of leaving it.
    pub remove_partials_on_failure: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            partial_suffix: DEFAULT_PARTIAL_SUFFIX.to_string(),
            db_file_path_holder: DEFAULT_DB_FILE_PATH_HOLDER.to_string(),
            durability: Durability::default(),
            remove_partials_on_failure: false,
        }
    }
}

/// File store keeping content under `storage_root` and records in a
/// [`MetaStore`].
pub struct FileStore {
    storage_root: PathBuf,
    meta: Arc<dyn MetaStore>,
    hooks: HookRegistry,
    options: StoreOptions,
    metrics: SharedMetrics,
}

impl FileStore {
    pub fn new(storage_root: impl Into<PathBuf>, meta: Arc<dyn MetaStore>) -> Self {
        Self {
            storage_root: storage_root.into(),
            meta,
            hooks: HookRegistry::new(),
            options: StoreOptions::default(),
            metrics: SharedMetrics::default(),
        }
    }

    pub fn with_options(mut self, options: StoreOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// Hooks are registered before the store is shared.
    pub fn hooks_mut(&mut self) -> &mut HookRegistry {
        &mut self.hooks
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    pub fn meta_store(&self) -> &Arc<dyn MetaStore> {
        &self.meta
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    /// Ensures the storage root exists and is writable by creating the
    /// marker file. Returns the marker path.
    pub async fn setup(&self) -> Result<PathBuf> {
        let marker = self.storage_root.join(&self.options.db_file_path_holder);
        fs::ensure_file(&marker).await?;
        Ok(marker)
    }

    /// Stores `handle`'s content and upserts its record.
    ///
    /// The returned handle carries the creation time of the new record.
    /// Failures of after-write hooks are logged and do not fail the write.
    pub async fn write(&self, mut handle: FileHandle, mut options: Options) -> Result<FileHandle> {
        let mut lifecycle = Lifecycle::new(Operation::Write, handle.id());
        match self.write_phases(&mut lifecycle, &mut handle, &mut options).await {
            Ok(()) => Ok(handle),
            Err(err) => {
                lifecycle.fail(&err);
                self.metrics.operation_failed(Operation::Write);
                Err(err)
            }
        }
    }

    async fn write_phases(
        &self,
        lifecycle: &mut Lifecycle,
        handle: &mut FileHandle,
        options: &mut Options,
    ) -> Result<()> {
        validate_id(handle.id())?;
        self.resolve_options(options)?;
        if !handle.has_source() {
            return Err(Error::InvalidInput(format!(
                "file '{}' must have a path or a stream",
                handle.id()
            )));
        }

        lifecycle.advance(Phase::PreHookRun);
        let mut inbox = Inbox::new();
        self.hooks.emit_before_write(&mut inbox, handle, options)?;
        inbox
            .settle_all()
            .await
            .map_err(|e| Error::hook(HookEvent::BeforeWrite, e))?;

        lifecycle.advance(Phase::PipelineRunning);
        let source_path = handle.path().map(Path::to_path_buf);
        let stream = handle.take_stream()?;
        self.setup().await?;

        let destination = self.storage_root.join(handle.id());
        let partial = fs::with_suffix(&destination, options.suffix());
        let mut pipeline = Pipeline::new(
            Source::new("handle-source", stream).with_path(source_path),
            Box::new(FileSink::new(&partial, self.options.durability)),
        );
        self.hooks.emit_stream_write(handle, &mut pipeline, options)?;
        let report = self.run_pipeline(pipeline).await?;
        self.metrics.bytes_written(report.bytes_out);

        lifecycle.advance(Phase::Placed);
        place(&report, &partial, &destination).await?;
        let record = FileRecord {
            id: handle.id().to_string(),
            path: fs::relative_to(&self.storage_root, &destination),
            metadata: handle.metadata().clone(),
            created_at: Utc::now(),
            extensions: handle.extensions().clone(),
        };
        self.meta.upsert(&record).await?;
        handle.set_created_at(record.created_at);
        debug!(id = %record.id, path = %record.path, bytes = report.bytes_out, "stored");

        lifecycle.advance(Phase::PostHookRun);
        let mut inbox = Inbox::new();
        let failures = self
            .hooks
            .emit_after_write(&mut inbox, handle, &record, options);
        report_post_hooks(HookEvent::AfterWrite, handle.id(), failures, inbox).await;

        lifecycle.advance(Phase::Completed);
        Ok(())
    }

    /// Fetches `id` into `destination`.
    ///
    /// A before-read hook (the cache) may satisfy the read on its own, in
    /// which case the returned handle points wherever that hook placed the
    /// content and `destination` is left untouched. Otherwise the content
    /// goes to `destination + suffix` first and is renamed into place, so
    /// `destination` never holds a partial file.
    pub async fn read(
        &self,
        id: &str,
        destination: impl AsRef<Path>,
        mut options: Options,
    ) -> Result<FileHandle> {
        let destination = destination.as_ref();
        let mut lifecycle = Lifecycle::new(Operation::Read, id);
        match self
            .read_phases(&mut lifecycle, id, destination, &mut options)
            .await
        {
            Ok(handle) => Ok(handle),
            Err(err) => {
                lifecycle.fail(&err);
                self.metrics.operation_failed(Operation::Read);
                Err(err)
            }
        }
    }

    async fn read_phases(
        &self,
        lifecycle: &mut Lifecycle,
        id: &str,
        destination: &Path,
        options: &mut Options,
    ) -> Result<FileHandle> {
        validate_id(id)?;
        if destination.as_os_str().is_empty() {
            return Err(Error::InvalidInput("read destination is empty".to_string()));
        }
        self.resolve_options(options)?;

        lifecycle.advance(Phase::PreHookRun);
        let mut inbox = ReadInbox::new();
        self.hooks
            .emit_before_read(&mut inbox, id, destination, options)?;
        let satisfied = inbox
            .resolve()
            .await
            .map_err(|e| Error::hook(HookEvent::BeforeRead, e))?;
        if let Some(handle) = satisfied {
            lifecycle.advance(Phase::ShortCircuited);
            debug!(id, path = ?handle.path(), "read satisfied by hook");
            lifecycle.advance(Phase::Completed);
            return Ok(handle);
        }

        lifecycle.advance(Phase::PipelineRunning);
        self.setup().await?;
        let record = self
            .meta
            .find_one(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if let Some(parent) = destination.parent() {
            if !parent.as_os_str().is_empty() {
                fs::ensure_dir(parent).await?;
            }
        }

        let partial = fs::with_suffix(destination, options.suffix());
        let source = Source::file(self.storage_root.join(&record.path));
        let mut handle = FileHandle::from_record(record);
        let mut pipeline = Pipeline::new(
            source,
            Box::new(FileSink::new(&partial, self.options.durability)),
        );
        self.hooks.emit_stream_read(&handle, &mut pipeline, options)?;
        let report = self.run_pipeline(pipeline).await?;
        self.metrics.bytes_read(report.bytes_out);

        lifecycle.advance(Phase::Placed);
        place(&report, &partial, destination).await?;
        handle.set_path(destination)?;

        lifecycle.advance(Phase::PostHookRun);
        let mut inbox = Inbox::new();
        let failures = self
            .hooks
            .emit_after_read(&mut inbox, &handle, destination, options);
        report_post_hooks(HookEvent::AfterRead, id, failures, inbox).await;

        lifecycle.advance(Phase::Completed);
        Ok(handle)
    }

    /// Returns handles for all records matching `filter`. The handles carry
    /// metadata, creation time and extensions, but no source.
    pub async fn find(&self, filter: &Filter, sort: Option<&Sort>) -> Result<Vec<FileHandle>> {
        let records = self.meta.find(filter, sort).await?;
        Ok(records.into_iter().map(FileHandle::from_record).collect())
    }

    fn resolve_options(&self, options: &mut Options) -> Result<()> {
        match options.partial_suffix.as_deref() {
            None => options.partial_suffix = Some(self.options.partial_suffix.clone()),
            Some("") => {
                return Err(Error::InvalidInput(
                    "partial suffix must not be empty".to_string(),
                ))
            }
            Some(_) => {}
        }
        Ok(())
    }

    async fn run_pipeline(&self, pipeline: Pipeline) -> Result<PipelineReport> {
        let sink_path = pipeline.sink_path().to_path_buf();
        match pipeline.run().await {
            Ok(report) => Ok(report),
            Err(err) => {
                if self.options.remove_partials_on_failure {
                    match fs::remove_path(&sink_path).await {
                        Ok(()) => debug!("removed partial output {}", sink_path.display()),
                        Err(e) => {
                            warn!("could not remove partial output {}: {e}", sink_path.display())
                        }
                    }
                } else {
                    warn!(
                        "pipeline failed, partial output may remain at {}",
                        sink_path.display()
                    );
                }
                Err(err.into())
            }
        }
    }
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("storage_root", &self.storage_root)
            .field("meta", &self.meta)
            .field("hooks", &self.hooks)
            .field("options", &self.options)
            .finish()
    }
}

/// Identifiers name files directly, so they must be one plain path component.
fn validate_id(id: &str) -> Result<()> {
    let invalid = id.is_empty()
        || id == "."
        || id == ".."
        || id.contains(['/', '\\', '\0']);
    if invalid {
        return Err(Error::InvalidInput(format!("invalid file id '{id}'")));
    }
    Ok(())
}

/// Renames the partial output to `target`. Rename cannot replace a
/// directory, or replace a file with one, so such a target is removed first.
async fn place(report: &PipelineReport, partial: &Path, target: &Path) -> Result<()> {
    if report.sink_path != partial {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::Other,
            format!(
                "sink wrote to {}, expected the partial path {}",
                report.sink_path.display(),
                partial.display()
            ),
        )));
    }
    let replacing_tree = fs::is_directory(partial).await?
        || matches!(fs::is_directory(target).await, Ok(true));
    if replacing_tree {
        fs::remove_path(target).await?;
    }
    fs::atomic_rename(partial, target).await?;
    Ok(())
}

async fn report_post_hooks(event: HookEvent, id: &str, failures: Vec<Error>, inbox: Inbox) {
    for err in failures {
        warn!(%event, id, "hook failed: {err}");
    }
    for result in inbox.settle().await {
        if let Err(err) = result {
            warn!(%event, id, "deferred hook work failed: {err}");
        }
    }
}
