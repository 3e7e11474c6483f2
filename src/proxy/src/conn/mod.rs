use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};

pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

pub type BoxStream = Box<dyn Stream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Upstream,
}

impl Side {
    pub fn label(&self) -> &'static str {
        match self {
            Side::Client => "client",
            Side::Upstream => "upstream",
        }
    }
}

/// One side of a flow: a reader with a prepend buffer plus the write
/// half. Peeked bytes, TLS-decrypted prefixes and accumulated HTTP
/// headers are all pushed back through the same mechanism, so the
/// parser never loses bytes and there is exactly one reader per side.
pub struct FlowConn {
    side: Side,
    prefix: Vec<u8>,
    pos: usize,
    reader: ReadHalf<BoxStream>,
    writer: WriteHalf<BoxStream>,
}

impl FlowConn {
    pub fn new(side: Side, stream: BoxStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            side,
            prefix: Vec::new(),
            pos: 0,
            reader,
            writer,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Push bytes back so the next read yields them before anything
    /// still buffered and before any new socket bytes.
    pub fn prepend(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut rebuilt = Vec::with_capacity(bytes.len() + self.prefix.len() - self.pos);
        rebuilt.extend_from_slice(bytes);
        rebuilt.extend_from_slice(&self.prefix[self.pos..]);
        self.prefix = rebuilt;
        self.pos = 0;
    }

    fn buffered(&self) -> &[u8] {
        &self.prefix[self.pos..]
    }

    /// Observe up to `limit` bytes without consuming them. Waits at
    /// most `wait` for the first byte; an empty result means the peer
    /// stayed silent, which is itself a protocol-selection signal.
    pub async fn peek_initial(&mut self, limit: usize, wait: Duration) -> io::Result<Vec<u8>> {
        if !self.buffered().is_empty() {
            let take = self.buffered().len().min(limit);
            return Ok(self.buffered()[..take].to_vec());
        }
        let mut scratch = vec![0u8; limit];
        match tokio::time::timeout(wait, self.reader.read(&mut scratch)).await {
            Ok(Ok(0)) => Ok(Vec::new()),
            Ok(Ok(n)) => {
                scratch.truncate(n);
                self.prepend(&scratch);
                Ok(scratch)
            }
            Ok(Err(e)) => Err(e),
            Err(_elapsed) => Ok(Vec::new()),
        }
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        self.writer.shutdown().await
    }
}

impl AsyncRead for FlowConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos < self.prefix.len() {
            let remaining = &self.prefix[self.pos..];
            let take = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..take]);
            self.pos += take;
            if self.pos == self.prefix.len() {
                self.prefix.clear();
                self.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for FlowConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

/// Plain byte tunnel for pass-through flows.
pub async fn tunnel(client: &mut FlowConn, upstream: &mut FlowConn) -> io::Result<(u64, u64)> {
    tokio::io::copy_bidirectional(client, upstream).await
}
