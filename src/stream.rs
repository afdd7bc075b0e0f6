//! Byte streams flowing through the pipeline, and the bridges that let
//! blocking codecs (tar) produce or consume them.

use std::io::{self, Read, Write};
use std::path::PathBuf;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

/// Size of the chunks read from files.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Number of chunks buffered between a blocking codec and the async side.
const CHANNEL_DEPTH: usize = 8;

pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Stream the content of any async reader in chunks of at most `CHUNK_SIZE`.
pub fn reader_stream<R>(reader: R) -> ByteStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    stream::try_unfold(reader, |mut reader| async move {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some((Bytes::from(buf), reader)))
    })
    .boxed()
}

/// Stream a file. The file is only opened when the stream is first polled.
pub fn file_stream(path: PathBuf) -> ByteStream {
    stream::once(async move { tokio::fs::File::open(&path).await })
        .map_ok(reader_stream)
        .try_flatten()
        .boxed()
}

/// Stream a single in-memory buffer.
pub fn bytes_stream(data: impl Into<Bytes>) -> ByteStream {
    let data = data.into();
    stream::once(async move { Ok(data) }).boxed()
}

/// Stream whatever `produce` writes, running it on a blocking thread.
///
/// The producer starts on first poll. Its writes block once the channel is
/// full, so a slow consumer throttles it.
pub fn blocking_stream<F>(produce: F) -> ByteStream
where
    F: FnOnce(&mut ChannelWriter) -> io::Result<()> + Send + 'static,
{
    stream::once(async move {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        tokio::task::spawn_blocking(move || {
            let mut writer = ChannelWriter { tx };
            let result = produce(&mut writer).and_then(|_| writer.flush());
            if let Err(err) = result {
                // the receiver may already be gone, nothing left to report to
                let _ = writer.tx.blocking_send(Err(err));
            }
        });
        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
    })
    .flatten()
    .boxed()
}

/// Collect a stream into memory.
pub async fn collect(mut stream: ByteStream) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

/// `Write` end of a channel whose `Read`/`Stream` end lives on the async side.
/// Must only be used from a blocking thread.
pub struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "stream consumer went away"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// `Read` end fed by an async producer. Must only be used from a blocking
/// thread.
pub struct ChannelReader {
    rx: mpsc::Receiver<Bytes>,
    current: Bytes,
}

impl ChannelReader {
    /// Returns the sending half and the reader.
    pub fn new() -> (mpsc::Sender<Bytes>, Self) {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        (
            tx,
            Self {
                rx,
                current: Bytes::new(),
            },
        )
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.current.is_empty() {
            match self.rx.blocking_recv() {
                Some(chunk) => self.current = chunk,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current.split_to(n));
        Ok(n)
    }
}
