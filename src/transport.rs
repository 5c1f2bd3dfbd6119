use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tracing::warn;

pub type StreamReader = Box<dyn AsyncRead + Send + Sync + Unpin>;
pub type StreamWriter = Box<dyn AsyncWrite + Send + Sync + Unpin>;

#[async_trait]
pub trait AsyncListener: Send + Sync {
    async fn accept(&self) -> io::Result<Box<dyn AsyncStream>>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {
    fn peer_addr(&self) -> Option<SocketAddr>;
    fn into_split(self: Box<Self>) -> (StreamReader, StreamWriter);
}

// --- TCP ---

pub struct TcpAsyncListener {
    listener: TcpListener,
}

impl TcpAsyncListener {
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }
}

#[async_trait]
impl AsyncListener for TcpAsyncListener {
    async fn accept(&self) -> io::Result<Box<dyn AsyncStream>> {
        let (stream, peer) = self.listener.accept().await?;
        // Frames are small and latency matters more than coalescing
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {peer}: {e}");
        }
        Ok(Box::new(TcpAsyncStream {
            stream,
            peer: Some(peer),
        }))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

pub struct TcpAsyncStream {
    stream: TcpStream,
    peer: Option<SocketAddr>,
}

impl AsyncRead for TcpAsyncStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpAsyncStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

impl AsyncStream for TcpAsyncStream {
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn into_split(self: Box<Self>) -> (StreamReader, StreamWriter) {
        let (r, w) = self.stream.into_split();
        (Box::new(r), Box::new(w))
    }
}
