//! Directory-as-item: a directory source is stored as a tar archive and
//! unpacked into a directory again on read.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::Result;
use crate::handle::FileHandle;
use crate::hooks::{HookRegistry, Plugin, StreamReadHook, StreamWriteHook};
use crate::pipeline::{Pipeline, Sink, Source};
use crate::store::Options;
use crate::stream::{blocking_stream, ByteStream, ChannelReader};

pub const NAMESPACE: &str = "tar";
pub const TARRED: &str = "tarred";

#[derive(Debug, Clone, Copy, Default)]
pub struct TarDirectory;

impl Plugin for TarDirectory {
    fn attach(self: Arc<Self>, hooks: &mut HookRegistry) {
        hooks.on_stream_write(self.clone()).on_stream_read(self);
    }
}

impl StreamWriteHook for TarDirectory {
    fn stream_write(
        &self,
        handle: &mut FileHandle,
        pipeline: &mut Pipeline,
        _options: &Options,
    ) -> Result<()> {
        let Some(dir) = pipeline
            .source_path()
            .filter(|p| p.is_dir())
            .map(Path::to_path_buf)
        else {
            return Ok(());
        };
        debug!(id = handle.id(), "packing directory {}", dir.display());
        let source = Source::new("tar-pack", pack(dir.clone())).with_path(Some(dir));
        pipeline.replace_source(source);
        handle.set_extension(NAMESPACE, TARRED, true);
        Ok(())
    }
}

impl StreamReadHook for TarDirectory {
    fn stream_read(
        &self,
        handle: &FileHandle,
        pipeline: &mut Pipeline,
        _options: &Options,
    ) -> Result<()> {
        if handle.extensions().flag(NAMESPACE, TARRED) {
            let sink = TarExtractSink::new(pipeline.sink_path());
            pipeline.replace_sink(Box::new(sink));
        }
        Ok(())
    }
}

/// Streams a tar archive of `dir`, entries relative to `dir`.
pub fn pack(dir: PathBuf) -> ByteStream {
    blocking_stream(move |writer| {
        let mut builder = tar::Builder::new(writer);
        builder.follow_symlinks(false);
        builder.append_dir_all(".", &dir)?;
        builder.finish()
    })
}

/// Unpacks a tar stream into the directory at `path`.
///
/// The archive is read on a blocking thread fed through a bounded channel.
/// Data after the end-of-archive marker is discarded.
pub struct TarExtractSink {
    path: PathBuf,
    tx: Option<mpsc::Sender<Bytes>>,
    task: Option<JoinHandle<io::Result<()>>>,
    done: bool,
}

impl TarExtractSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            tx: None,
            task: None,
            done: false,
        }
    }

    fn start(&mut self) {
        if self.task.is_some() {
            return;
        }
        let (tx, reader) = ChannelReader::new();
        let path = self.path.clone();
        self.task = Some(tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&path)?;
            let mut archive = tar::Archive::new(reader);
            archive.set_preserve_permissions(true);
            archive.unpack(&path)
        }));
        self.tx = Some(tx);
    }

    async fn join(&mut self) -> io::Result<()> {
        self.tx = None;
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Sink for TarExtractSink {
    fn name(&self) -> &str {
        "tar-extract"
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn write(&mut self, chunk: Bytes) -> io::Result<()> {
        if self.done {
            return Ok(());
        }
        self.start();
        let sent = match &self.tx {
            Some(tx) => tx.send(chunk).await.is_ok(),
            None => false,
        };
        if !sent {
            // the extractor stopped reading: end of archive, or an error
            self.join().await?;
            self.done = true;
        }
        Ok(())
    }

    async fn finish(&mut self) -> io::Result<()> {
        if self.task.is_none() && !self.done {
            tokio::fs::create_dir_all(&self.path).await?;
            return Ok(());
        }
        self.join().await
    }
}
