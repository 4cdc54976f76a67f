//! Async stream over an allocated flow.

use rina_fabric::Flow;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::UnixStream;

/// Non-blocking stream driving one flow
#[derive(Debug)]
pub struct FlowStream {
    port_id: u64,
    inner: UnixStream,
}

impl FlowStream {
    /// Adopt a flow; must be called from within a Tokio runtime
    pub fn from_flow(flow: Flow) -> io::Result<Self> {
        let port_id = flow.port_id();
        let stream = flow.into_std();
        stream.set_nonblocking(true)?;
        Ok(Self {
            port_id,
            inner: UnixStream::from_std(stream)?,
        })
    }

    /// Fabric port id of the flow
    pub fn port_id(&self) -> u64 {
        self.port_id
    }

    /// Split into independently owned read and write halves
    pub fn split(self) -> (ReadHalf<FlowStream>, WriteHalf<FlowStream>) {
        tokio::io::split(self)
    }
}

impl AsyncRead for FlowStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for FlowStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_split_halves_carry_bytes() {
        let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        let left = FlowStream::from_flow(Flow::new(1, a)).unwrap();
        let right = FlowStream::from_flow(Flow::new(2, b)).unwrap();
        assert_eq!(left.port_id(), 1);

        let (_left_rd, mut left_wr) = left.split();
        let (mut right_rd, _right_wr) = right.split();

        left_wr.write_all(b"OPTIONS").await.unwrap();
        let mut buf = [0u8; 7];
        right_rd.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"OPTIONS");
    }
}
