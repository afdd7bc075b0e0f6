use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::metastore::FileRecord;
use crate::stream::{file_stream, ByteStream};

/// Caller-defined metadata, opaque to the store.
pub type Metadata = serde_json::Map<String, Value>;

/// Namespaced facts attached by hooks, persisted with the record.
///
/// A namespace that was never written reads as absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Extensions(BTreeMap<String, BTreeMap<String, Value>>);

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, namespace: &str, key: &str) -> Option<&Value> {
        self.0.get(namespace).and_then(|ns| ns.get(key))
    }

    /// Sets `key` in `namespace`, creating the namespace on first write.
    pub fn set(&mut self, namespace: &str, key: &str, value: impl Into<Value>) {
        self.0
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }

    /// True only if the value is present and `true`.
    pub fn flag(&self, namespace: &str, key: &str) -> bool {
        matches!(self.get(namespace, key), Some(Value::Bool(true)))
    }

    pub fn namespace(&self, namespace: &str) -> Option<&BTreeMap<String, Value>> {
        self.0.get(namespace)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One stored item: identity, a lazily resolved source, metadata, creation
/// time and hook extensions.
pub struct FileHandle {
    id: String,
    path: Option<PathBuf>,
    stream: Option<ByteStream>,
    metadata: Metadata,
    created_at: Option<DateTime<Utc>>,
    extensions: Extensions,
    allow_directories: bool,
}

impl FileHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: None,
            stream: None,
            metadata: Metadata::new(),
            created_at: None,
            extensions: Extensions::new(),
            allow_directories: false,
        }
    }

    /// A handle sourced from `path`. The path is checked when the stream is
    /// resolved, not here.
    pub fn from_path(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let mut handle = Self::new(id);
        handle.path = Some(path.into());
        handle
    }

    pub fn from_stream(id: impl Into<String>, stream: ByteStream) -> Self {
        let mut handle = Self::new(id);
        handle.stream = Some(stream);
        handle
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_extensions(mut self, extensions: Extensions) -> Self {
        self.extensions = extensions;
        self
    }

    /// Permit directory paths as sources (directory-as-item).
    pub fn allow_directories(mut self, allow: bool) -> Self {
        self.allow_directories = allow;
        self
    }

    /// Rebuilds a handle from a persisted record. The record's path is
    /// relative to a storage root, so it is not carried over.
    pub(crate) fn from_record(record: FileRecord) -> Self {
        Self {
            id: record.id,
            path: None,
            stream: None,
            metadata: record.metadata,
            created_at: Some(record.created_at),
            extensions: record.extensions,
            allow_directories: true,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub(crate) fn set_created_at(&mut self, created_at: DateTime<Utc>) {
        self.created_at = Some(created_at);
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    pub fn get_extension(&self, namespace: &str, key: &str) -> Option<&Value> {
        self.extensions.get(namespace, key)
    }

    pub fn set_extension(&mut self, namespace: &str, key: &str, value: impl Into<Value>) {
        self.extensions.set(namespace, key, value);
    }

    pub fn has_source(&self) -> bool {
        self.path.is_some() || self.stream.is_some()
    }

    /// Points the handle at a new path and drops any memoized stream.
    pub fn set_path(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        check_source_path(&path, self.allow_directories)?;
        self.stream = None;
        self.path = Some(path);
        Ok(())
    }

    /// Replaces the memoized stream. The path, if any, is kept.
    pub fn set_stream(&mut self, stream: ByteStream) {
        self.stream = Some(stream);
    }

    /// Returns the memoized stream, opening it from the path on first access.
    pub fn resolve_stream(&mut self) -> Result<&mut ByteStream> {
        if self.stream.is_none() {
            let path = self.path.as_ref().ok_or_else(|| {
                Error::InvalidInput(format!("file '{}' must have a path or a stream", self.id))
            })?;
            check_source_path(path, self.allow_directories)?;
            self.stream = Some(file_stream(path.clone()));
        }
        // populated above
        self.stream
            .as_mut()
            .ok_or_else(|| Error::InvalidInput(format!("file '{}' has no stream", self.id)))
    }

    /// Resolves the stream and hands ownership to the caller. A later
    /// resolve reopens the path.
    pub fn take_stream(&mut self) -> Result<ByteStream> {
        self.resolve_stream()?;
        self.stream
            .take()
            .ok_or_else(|| Error::InvalidInput(format!("file '{}' has no stream", self.id)))
    }

    /// True if the handle's path currently points at a directory.
    pub fn is_directory(&self) -> bool {
        self.path.as_deref().map(Path::is_dir).unwrap_or(false)
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("stream", &self.stream.as_ref().map(|_| "<stream>"))
            .field("metadata", &self.metadata)
            .field("created_at", &self.created_at)
            .field("extensions", &self.extensions)
            .finish()
    }
}

fn check_source_path(path: &Path, allow_directories: bool) -> Result<()> {
    let meta = std::fs::metadata(path)
        .map_err(|e| Error::invalid_path(path, format!("not a readable file: {e}")))?;
    if meta.is_dir() && !allow_directories {
        return Err(Error::invalid_path(path, "is a directory"));
    }
    Ok(())
}
