//! Ordered stage chains: one source, any number of transforms, one sink.
//!
//! Hooks receive the assembled [`Pipeline`] before it runs and may insert,
//! remove or replace stages. The source always stays first and the sink
//! always stays last; only their replacement is allowed.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{Error, Result};
use crate::metastore::Durability;
use crate::stream::{file_stream, ByteStream};

/// A stage that failed, with the underlying I/O or codec error.
#[derive(Debug, thiserror::Error)]
#[error("pipeline stage '{stage}' failed: {source}")]
pub struct PipelineError {
    pub stage: String,
    #[source]
    pub source: io::Error,
}

impl PipelineError {
    pub fn new(stage: impl Into<String>, source: io::Error) -> Self {
        Self {
            stage: stage.into(),
            source,
        }
    }
}

/// A synchronous byte transform (compression, encoding...).
///
/// `process` may buffer and emit nothing; whatever is still buffered must be
/// emitted by `finish`, which is called exactly once after the last input.
pub trait Transform: Send {
    fn name(&self) -> &str;

    fn process(&mut self, input: &[u8], output: &mut BytesMut) -> io::Result<()>;

    fn finish(&mut self, output: &mut BytesMut) -> io::Result<()>;
}

/// Terminal stage of a pipeline.
#[async_trait]
pub trait Sink: Send {
    fn name(&self) -> &str;

    /// Where this sink places its output.
    fn path(&self) -> &Path;

    async fn write(&mut self, chunk: Bytes) -> io::Result<()>;

    /// Signals the end of data and returns once everything is flushed.
    async fn finish(&mut self) -> io::Result<()>;
}

/// First stage of a pipeline.
pub struct Source {
    name: String,
    path: Option<PathBuf>,
    stream: ByteStream,
}

impl Source {
    pub fn new(name: impl Into<String>, stream: ByteStream) -> Self {
        Self {
            name: name.into(),
            path: None,
            stream,
        }
    }

    /// A source reading the file at `path`.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: "file-source".to_string(),
            stream: file_stream(path.clone()),
            path: Some(path),
        }
    }

    /// Records which path the stream was opened from.
    pub fn with_path(mut self, path: Option<PathBuf>) -> Self {
        self.path = path;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Writes into a single file. The file is created on the first write, or on
/// finish if no data arrived.
pub struct FileSink {
    path: PathBuf,
    file: Option<tokio::fs::File>,
    durability: Durability,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>, durability: Durability) -> Self {
        Self {
            path: path.into(),
            file: None,
            durability,
        }
    }

    async fn file(&mut self) -> io::Result<&mut tokio::fs::File> {
        if self.file.is_none() {
            self.file = Some(tokio::fs::File::create(&self.path).await?);
        }
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "sink file not open"))
    }
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &str {
        "file-sink"
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn write(&mut self, chunk: Bytes) -> io::Result<()> {
        self.file().await?.write_all(&chunk).await
    }

    async fn finish(&mut self) -> io::Result<()> {
        let durability = self.durability;
        let file = self.file().await?;
        file.flush().await?;
        match durability {
            Durability::Buffer => Ok(()),
            Durability::Fsync => file.sync_all().await,
            Durability::Fdatasync => file.sync_data().await,
        }
    }
}

/// Totals reported by a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub sink_path: PathBuf,
}

pub struct Pipeline {
    source: Source,
    transforms: Vec<Box<dyn Transform>>,
    sink: Box<dyn Sink>,
}

impl Pipeline {
    pub fn new(source: Source, sink: Box<dyn Sink>) -> Self {
        Self {
            source,
            transforms: Vec::new(),
            sink,
        }
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source.path()
    }

    pub fn sink_path(&self) -> &Path {
        self.sink.path()
    }

    /// Number of stages, source and sink included.
    pub fn len(&self) -> usize {
        self.transforms.len() + 2
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn stage_names(&self) -> Vec<String> {
        std::iter::once(self.source.name())
            .chain(self.transforms.iter().map(|t| t.name()))
            .chain(std::iter::once(self.sink.name()))
            .map(str::to_string)
            .collect()
    }

    /// Inserts a transform at stage position `index`, where 0 is the source
    /// and `len() - 1` the sink. Valid positions are `1..=len() - 1`.
    pub fn insert(&mut self, index: usize, transform: Box<dyn Transform>) -> Result<()> {
        if index == 0 || index >= self.len() {
            return Err(Error::InvalidInput(format!(
                "cannot insert stage '{}' at position {index} of {}",
                transform.name(),
                self.len()
            )));
        }
        self.transforms.insert(index - 1, transform);
        Ok(())
    }

    /// Inserts a transform directly after the source.
    pub fn push_front(&mut self, transform: Box<dyn Transform>) {
        self.transforms.insert(0, transform);
    }

    /// Inserts a transform directly before the sink.
    pub fn push_back(&mut self, transform: Box<dyn Transform>) {
        self.transforms.push(transform);
    }

    /// Removes the transform at stage position `index`. The source and sink
    /// cannot be removed.
    pub fn remove(&mut self, index: usize) -> Option<Box<dyn Transform>> {
        if index == 0 || index > self.transforms.len() {
            return None;
        }
        Some(self.transforms.remove(index - 1))
    }

    pub fn replace_source(&mut self, source: Source) -> Source {
        std::mem::replace(&mut self.source, source)
    }

    pub fn replace_sink(&mut self, sink: Box<dyn Sink>) -> Box<dyn Sink> {
        std::mem::replace(&mut self.sink, sink)
    }

    /// Connects the stages in order and runs until the sink has flushed.
    /// The first failing stage aborts the run.
    pub async fn run(self) -> std::result::Result<PipelineReport, PipelineError> {
        debug!(stages = ?self.stage_names(), "running pipeline");
        let Pipeline {
            source,
            mut transforms,
            mut sink,
        } = self;
        let Source {
            name: source_name,
            mut stream,
            ..
        } = source;

        let mut bytes_in = 0u64;
        let mut bytes_out = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| PipelineError::new(source_name.as_str(), e))?;
            bytes_in += chunk.len() as u64;
            let out = push_through(&mut transforms, chunk)?;
            if !out.is_empty() {
                bytes_out += out.len() as u64;
                sink.write(out)
                    .await
                    .map_err(|e| PipelineError::new(sink.name(), e))?;
            }
        }

        // Each transform receives everything still pending upstream before
        // it finishes itself.
        let mut tail = Bytes::new();
        for transform in transforms.iter_mut() {
            let mut out = BytesMut::new();
            if !tail.is_empty() {
                transform
                    .process(&tail, &mut out)
                    .map_err(|e| PipelineError::new(transform.name(), e))?;
            }
            transform
                .finish(&mut out)
                .map_err(|e| PipelineError::new(transform.name(), e))?;
            tail = out.freeze();
        }
        if !tail.is_empty() {
            bytes_out += tail.len() as u64;
            sink.write(tail)
                .await
                .map_err(|e| PipelineError::new(sink.name(), e))?;
        }
        sink.finish()
            .await
            .map_err(|e| PipelineError::new(sink.name(), e))?;

        Ok(PipelineReport {
            bytes_in,
            bytes_out,
            sink_path: sink.path().to_path_buf(),
        })
    }
}

fn push_through(
    transforms: &mut [Box<dyn Transform>],
    chunk: Bytes,
) -> std::result::Result<Bytes, PipelineError> {
    let mut data = chunk;
    for transform in transforms.iter_mut() {
        if data.is_empty() {
            break;
        }
        let mut out = BytesMut::new();
        transform
            .process(&data, &mut out)
            .map_err(|e| PipelineError::new(transform.name(), e))?;
        data = out.freeze();
    }
    Ok(data)
}
