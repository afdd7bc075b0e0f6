use std::io::{self, Write};
use std::mem;
use std::sync::Arc;

use bytes::BytesMut;
use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression;

use crate::error::Result;
use crate::handle::FileHandle;
use crate::hooks::{HookRegistry, Plugin, StreamReadHook, StreamWriteHook};
use crate::pipeline::{Pipeline, Transform};
use crate::store::Options;

pub const NAMESPACE: &str = "gzip";
pub const GZIPPED: &str = "gzipped";

/// Compresses stored content and marks the record, so reads of marked
/// records are decompressed again.
#[derive(Debug, Clone, Copy)]
pub struct Gzip {
    level: Compression,
}

impl Gzip {
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level),
        }
    }
}

impl Default for Gzip {
    fn default() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

impl Plugin for Gzip {
    fn attach(self: Arc<Self>, hooks: &mut HookRegistry) {
        hooks.on_stream_write(self.clone()).on_stream_read(self);
    }
}

impl StreamWriteHook for Gzip {
    fn stream_write(
        &self,
        handle: &mut FileHandle,
        pipeline: &mut Pipeline,
        _options: &Options,
    ) -> Result<()> {
        pipeline.push_back(Box::new(GzipEncode::new(self.level)));
        handle.set_extension(NAMESPACE, GZIPPED, true);
        Ok(())
    }
}

impl StreamReadHook for Gzip {
    fn stream_read(
        &self,
        handle: &FileHandle,
        pipeline: &mut Pipeline,
        _options: &Options,
    ) -> Result<()> {
        if handle.extensions().flag(NAMESPACE, GZIPPED) {
            pipeline.push_front(Box::new(GzipDecode::new()));
        }
        Ok(())
    }
}

pub struct GzipEncode {
    encoder: GzEncoder<Vec<u8>>,
}

impl GzipEncode {
    pub fn new(level: Compression) -> Self {
        Self {
            encoder: GzEncoder::new(Vec::new(), level),
        }
    }
}

impl Transform for GzipEncode {
    fn name(&self) -> &str {
        "gzip-encode"
    }

    fn process(&mut self, input: &[u8], output: &mut BytesMut) -> io::Result<()> {
        self.encoder.write_all(input)?;
        output.extend_from_slice(&mem::take(self.encoder.get_mut()));
        Ok(())
    }

    fn finish(&mut self, output: &mut BytesMut) -> io::Result<()> {
        self.encoder.try_finish()?;
        output.extend_from_slice(&mem::take(self.encoder.get_mut()));
        Ok(())
    }
}

pub struct GzipDecode {
    decoder: GzDecoder<Vec<u8>>,
}

impl GzipDecode {
    pub fn new() -> Self {
        Self {
            decoder: GzDecoder::new(Vec::new()),
        }
    }
}

impl Default for GzipDecode {
    fn default() -> Self {
        Self::new()
    }
}

impl Transform for GzipDecode {
    fn name(&self) -> &str {
        "gzip-decode"
    }

    fn process(&mut self, input: &[u8], output: &mut BytesMut) -> io::Result<()> {
        self.decoder.write_all(input)?;
        output.extend_from_slice(&mem::take(self.decoder.get_mut()));
        Ok(())
    }

    fn finish(&mut self, output: &mut BytesMut) -> io::Result<()> {
        self.decoder.try_finish()?;
        output.extend_from_slice(&mem::take(self.decoder.get_mut()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::bytes_stream;
    use crate::testing::Fixture;

    fn run(transform: &mut dyn Transform, chunks: &[&[u8]]) -> Vec<u8> {
        let mut out = BytesMut::new();
        for chunk in chunks {
            transform.process(chunk, &mut out).unwrap();
        }
        transform.finish(&mut out).unwrap();
        out.to_vec()
    }

    #[test]
    fn test_encoder_output_decodes_across_chunk_boundaries() {
        let text = b"the quick brown fox jumps over the lazy dog ".repeat(200);
        let mut encoder = GzipEncode::new(Compression::best());
        let compressed = run(&mut encoder, &[&text[..100], &text[100..]]);
        assert_eq!(&compressed[..2], &[0x1f, 0x8b]);
        assert!(compressed.len() < text.len());

        let pieces: Vec<&[u8]> = compressed.chunks(7).collect();
        assert_eq!(run(&mut GzipDecode::new(), &pieces), text);
    }

    #[tokio::test]
    async fn test_stored_compressed_read_plain() {
        let mut fx = Fixture::new();
        fx.store.hooks_mut().register(Gzip::default());
        let content = "compress me ".repeat(1000);
        let written = fx
            .store
            .write(FileHandle::from_stream("gz", bytes_stream(content.clone())), Options::new())
            .await
            .unwrap();
        assert!(written.extensions().flag(NAMESPACE, GZIPPED));

        let stored = std::fs::read(fx.storage_root().join("gz")).unwrap();
        assert_eq!(&stored[..2], &[0x1f, 0x8b]);
        assert!(stored.len() < content.len());

        let dest = fx.dest("gz.txt");
        fx.store.read("gz", &dest, Options::new()).await.unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), content);
    }

    #[tokio::test]
    async fn test_unmarked_records_are_not_decoded() {
        let mut fx = Fixture::new();
        fx.store
            .write(FileHandle::from_stream("raw", bytes_stream("raw bytes")), Options::new())
            .await
            .unwrap();

        // registered after the write, so the record carries no flag
        fx.store.hooks_mut().register(Gzip::default());
        let dest = fx.dest("raw");
        fx.store.read("raw", &dest, Options::new()).await.unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "raw bytes");
    }
}
