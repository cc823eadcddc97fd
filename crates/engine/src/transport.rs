//! Byte transports a connection runs over

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// Read side of a transport.
///
/// `recv` must be cancel safe: the worker races it against lookup results.
#[async_trait]
pub trait ByteSource: Send {
    /// Next chunk of bytes, `None` at end of stream
    async fn recv(&mut self) -> io::Result<Option<Bytes>>;
}

/// Write side of a transport
#[async_trait]
pub trait ByteSink: Send {
    async fn send(&mut self, data: Bytes) -> io::Result<()>;

    async fn shutdown(&mut self) -> io::Result<()>;
}

const READ_CHUNK: usize = 16 * 1024;

/// `ByteSource` over any async reader
pub struct StreamSource<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin + Send> StreamSource<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> ByteSource for StreamSource<R> {
    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        self.buf.reserve(READ_CHUNK);
        let n = self.inner.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(self.buf.split().freeze()))
    }
}

/// `ByteSink` over any async writer
pub struct StreamSink<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin + Send> StreamSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ByteSink for StreamSink<W> {
    async fn send(&mut self, data: Bytes) -> io::Result<()> {
        self.inner.write_all(&data).await?;
        self.inner.flush().await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

/// Split a bidirectional stream into a source and a sink
pub fn split_stream<S>(stream: S) -> (StreamSource<ReadHalf<S>>, StreamSink<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite + Send,
{
    let (read, write) = tokio::io::split(stream);
    (StreamSource::new(read), StreamSink::new(write))
}
