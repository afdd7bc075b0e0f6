//! Named extension points of the store.
//!
//! Every event has its own handler trait. Handlers of one event run in
//! registration order; the asynchronous work they defer is collected in an
//! [`Inbox`] and awaited as one batch before the operation moves on, so two
//! handlers for the same event must not assume exclusive access to anything
//! they share.

use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::handle::FileHandle;
use crate::metastore::FileRecord;
use crate::pipeline::Pipeline;
use crate::store::Options;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookEvent {
    BeforeRead,
    AfterRead,
    BeforeWrite,
    AfterWrite,
    StreamRead,
    StreamWrite,
}

impl HookEvent {
    pub const ALL: [HookEvent; 6] = [
        HookEvent::BeforeRead,
        HookEvent::AfterRead,
        HookEvent::BeforeWrite,
        HookEvent::AfterWrite,
        HookEvent::StreamRead,
        HookEvent::StreamWrite,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::BeforeRead => "before-read",
            HookEvent::AfterRead => "after-read",
            HookEvent::BeforeWrite => "before-write",
            HookEvent::AfterWrite => "after-write",
            HookEvent::StreamRead => "stream-read",
            HookEvent::StreamWrite => "stream-write",
        }
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Deferred = BoxFuture<'static, Result<()>>;

/// Collects the asynchronous work handlers start during one event.
#[derive(Default)]
pub struct Inbox {
    pending: Vec<Deferred>,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defer<F>(&mut self, work: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.pending.push(work.boxed());
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Awaits all deferred work concurrently, returning every outcome in
    /// registration order.
    pub async fn settle(self) -> Vec<Result<()>> {
        join_all(self.pending).await
    }

    /// Awaits all deferred work and fails with the first error.
    pub async fn settle_all(self) -> Result<()> {
        self.settle().await.into_iter().collect()
    }
}

/// Inbox for `before-read`, with a result slot a handler may fill to
/// satisfy the read on its own.
///
/// The slot has a single writer: the first handler to fill it wins and
/// the remaining handlers for the event are skipped. Deferred lookups are
/// consulted only if no handler filled the slot directly, first success in
/// registration order winning.
#[derive(Default)]
pub struct ReadInbox {
    work: Inbox,
    lookups: Vec<BoxFuture<'static, Option<FileHandle>>>,
    result: Option<FileHandle>,
}

impl ReadInbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defer<F>(&mut self, work: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.work.defer(work);
    }

    /// Defers a lookup that may satisfy the read once it resolves.
    pub fn defer_lookup<F>(&mut self, lookup: F)
    where
        F: Future<Output = Option<FileHandle>> + Send + 'static,
    {
        self.lookups.push(lookup.boxed());
    }

    /// Fills the result slot. Returns false, dropping `handle`, if the slot
    /// was already filled.
    pub fn satisfy(&mut self, handle: FileHandle) -> bool {
        if self.result.is_some() {
            return false;
        }
        self.result = Some(handle);
        true
    }

    pub fn is_satisfied(&self) -> bool {
        self.result.is_some()
    }

    /// Awaits deferred work and lookups, returning the satisfying handle if
    /// any.
    pub async fn resolve(self) -> Result<Option<FileHandle>> {
        let ReadInbox {
            work,
            lookups,
            result,
        } = self;
        let (work, found) = futures::join!(work.settle_all(), join_all(lookups));
        work?;
        Ok(result.or_else(|| found.into_iter().flatten().next()))
    }
}

pub trait BeforeReadHook: Send + Sync {
    fn before_read(
        &self,
        inbox: &mut ReadInbox,
        id: &str,
        destination: &Path,
        options: &Options,
    ) -> Result<()>;
}

pub trait AfterReadHook: Send + Sync {
    fn after_read(
        &self,
        inbox: &mut Inbox,
        handle: &FileHandle,
        destination: &Path,
        options: &Options,
    ) -> Result<()>;
}

/// May mutate the handle (extensions, metadata) and the options, but cannot
/// complete the write itself.
pub trait BeforeWriteHook: Send + Sync {
    fn before_write(
        &self,
        inbox: &mut Inbox,
        handle: &mut FileHandle,
        options: &mut Options,
    ) -> Result<()>;
}

pub trait AfterWriteHook: Send + Sync {
    fn after_write(
        &self,
        inbox: &mut Inbox,
        handle: &FileHandle,
        record: &FileRecord,
        options: &Options,
    ) -> Result<()>;
}

/// Runs once the read pipeline is assembled. `handle` carries the fetched
/// record's metadata and extensions.
pub trait StreamReadHook: Send + Sync {
    fn stream_read(
        &self,
        handle: &FileHandle,
        pipeline: &mut Pipeline,
        options: &Options,
    ) -> Result<()>;
}

/// Runs once the write pipeline is assembled. Extensions set on `handle`
/// are persisted with the record.
pub trait StreamWriteHook: Send + Sync {
    fn stream_write(
        &self,
        handle: &mut FileHandle,
        pipeline: &mut Pipeline,
        options: &Options,
    ) -> Result<()>;
}

/// A collaborator subscribing to one or more events.
pub trait Plugin: Send + Sync + 'static {
    fn attach(self: Arc<Self>, hooks: &mut HookRegistry);
}

#[derive(Default)]
pub struct HookRegistry {
    before_read: Vec<Arc<dyn BeforeReadHook>>,
    after_read: Vec<Arc<dyn AfterReadHook>>,
    before_write: Vec<Arc<dyn BeforeWriteHook>>,
    after_write: Vec<Arc<dyn AfterWriteHook>>,
    stream_read: Vec<Arc<dyn StreamReadHook>>,
    stream_write: Vec<Arc<dyn StreamWriteHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: Plugin>(&mut self, plugin: P) -> &mut Self {
        self.attach(Arc::new(plugin))
    }

    pub fn attach<P: Plugin>(&mut self, plugin: Arc<P>) -> &mut Self {
        plugin.attach(self);
        self
    }

    pub fn on_before_read(&mut self, hook: Arc<dyn BeforeReadHook>) -> &mut Self {
        self.before_read.push(hook);
        self
    }

    pub fn on_after_read(&mut self, hook: Arc<dyn AfterReadHook>) -> &mut Self {
        self.after_read.push(hook);
        self
    }

    pub fn on_before_write(&mut self, hook: Arc<dyn BeforeWriteHook>) -> &mut Self {
        self.before_write.push(hook);
        self
    }

    pub fn on_after_write(&mut self, hook: Arc<dyn AfterWriteHook>) -> &mut Self {
        self.after_write.push(hook);
        self
    }

    pub fn on_stream_read(&mut self, hook: Arc<dyn StreamReadHook>) -> &mut Self {
        self.stream_read.push(hook);
        self
    }

    pub fn on_stream_write(&mut self, hook: Arc<dyn StreamWriteHook>) -> &mut Self {
        self.stream_write.push(hook);
        self
    }

    /// Number of handlers subscribed to `event`.
    pub fn count(&self, event: HookEvent) -> usize {
        match event {
            HookEvent::BeforeRead => self.before_read.len(),
            HookEvent::AfterRead => self.after_read.len(),
            HookEvent::BeforeWrite => self.before_write.len(),
            HookEvent::AfterWrite => self.after_write.len(),
            HookEvent::StreamRead => self.stream_read.len(),
            HookEvent::StreamWrite => self.stream_write.len(),
        }
    }

    pub(crate) fn emit_before_read(
        &self,
        inbox: &mut ReadInbox,
        id: &str,
        destination: &Path,
        options: &Options,
    ) -> Result<()> {
        for (index, hook) in self.before_read.iter().enumerate() {
            hook.before_read(inbox, id, destination, options)
                .map_err(|e| Error::hook(HookEvent::BeforeRead, e))?;
            if inbox.is_satisfied() {
                debug!(
                    "{} satisfied by handler {index}, skipping {} more",
                    HookEvent::BeforeRead,
                    self.before_read.len() - index - 1
                );
                break;
            }
        }
        Ok(())
    }

    pub(crate) fn emit_after_read(
        &self,
        inbox: &mut Inbox,
        handle: &FileHandle,
        destination: &Path,
        options: &Options,
    ) -> Vec<Error> {
        self.after_read
            .iter()
            .filter_map(|hook| hook.after_read(inbox, handle, destination, options).err())
            .collect()
    }

    pub(crate) fn emit_before_write(
        &self,
        inbox: &mut Inbox,
        handle: &mut FileHandle,
        options: &mut Options,
    ) -> Result<()> {
        for hook in &self.before_write {
            hook.before_write(inbox, handle, options)
                .map_err(|e| Error::hook(HookEvent::BeforeWrite, e))?;
        }
        Ok(())
    }

    pub(crate) fn emit_after_write(
        &self,
        inbox: &mut Inbox,
        handle: &FileHandle,
        record: &FileRecord,
        options: &Options,
    ) -> Vec<Error> {
        self.after_write
            .iter()
            .filter_map(|hook| hook.after_write(inbox, handle, record, options).err())
            .collect()
    }

    pub(crate) fn emit_stream_read(
        &self,
        handle: &FileHandle,
        pipeline: &mut Pipeline,
        options: &Options,
    ) -> Result<()> {
        for hook in &self.stream_read {
            hook.stream_read(handle, pipeline, options)
                .map_err(|e| Error::hook(HookEvent::StreamRead, e))?;
        }
        Ok(())
    }

    pub(crate) fn emit_stream_write(
        &self,
        handle: &mut FileHandle,
        pipeline: &mut Pipeline,
        options: &Options,
    ) -> Result<()> {
        for hook in &self.stream_write {
            hook.stream_write(handle, pipeline, options)
                .map_err(|e| Error::hook(HookEvent::StreamWrite, e))?;
        }
        Ok(())
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for event in HookEvent::ALL {
            map.entry(&event.as_str(), &self.count(event));
        }
        map.finish()
    }
}
