//! Portable socket layer
//!
//! Thin wrappers over tokio's TCP types with one closed error taxonomy so
//! the layers above never branch on raw OS codes. Reads and writes are
//! bounded: connects carry a caller-supplied timeout, readiness waits take a
//! short timeout instead of blocking indefinitely, and `close` is idempotent.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};

/// Normalized socket errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketError {
    #[error("operation would block")]
    WouldBlock,

    #[error("operation timed out")]
    Timeout,

    #[error("connection refused")]
    Refused,

    #[error("connection reset by peer")]
    Reset,

    #[error("address already in use")]
    AddressInUse,

    #[error("permission denied")]
    PermissionDenied,

    #[error("host unreachable")]
    HostUnreachable,

    #[error("socket is closed")]
    Closed,

    #[error("socket error: {0:?}")]
    Other(io::ErrorKind),
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        use io::ErrorKind::*;
        match e.kind() {
            WouldBlock | Interrupted => SocketError::WouldBlock,
            TimedOut => SocketError::Timeout,
            ConnectionRefused => SocketError::Refused,
            ConnectionReset | ConnectionAborted | BrokenPipe | UnexpectedEof => SocketError::Reset,
            AddrInUse => SocketError::AddressInUse,
            PermissionDenied => SocketError::PermissionDenied,
            HostUnreachable | NetworkUnreachable => SocketError::HostUnreachable,
            kind => SocketError::Other(kind),
        }
    }
}

pub type SocketResult<T> = Result<T, SocketError>;

/// A connected stream socket
#[derive(Debug)]
pub struct Socket {
    stream: Option<TcpStream>,
    peer: SocketAddr,
}

impl Socket {
    /// Connect to a remote address, failing after `timeout`
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> SocketResult<Self> {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true).ok();
                Ok(Self {
                    stream: Some(stream),
                    peer: addr,
                })
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(SocketError::Timeout),
        }
    }

    /// Wrap a stream accepted by a [`Listener`]
    pub fn from_accepted(stream: TcpStream, peer: SocketAddr) -> Self {
        stream.set_nodelay(true).ok();
        Self {
            stream: Some(stream),
            peer,
        }
    }

    /// Remote peer address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Whether the socket has not been closed locally
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn stream_mut(&mut self) -> SocketResult<&mut TcpStream> {
        self.stream.as_mut().ok_or(SocketError::Closed)
    }

    /// Write the whole buffer. `write_all` loops until every byte is out,
    /// retrying transient interruptions; reset or broken-pipe surfaces as
    /// [`SocketError::Reset`].
    pub async fn send_all(&mut self, bytes: &[u8]) -> SocketResult<()> {
        let stream = self.stream_mut()?;
        stream.write_all(bytes).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Read available bytes into `buf`. Returns `Ok(0)` on clean peer
    /// shutdown.
    pub async fn recv(&mut self, buf: &mut [u8]) -> SocketResult<usize> {
        let stream = self.stream_mut()?;
        Ok(stream.read(buf).await?)
    }

    /// Non-blocking read: `Ok(None)` when no data is pending.
    pub fn try_recv(&mut self, buf: &mut [u8]) -> SocketResult<Option<usize>> {
        let stream = self.stream_mut()?;
        match stream.try_read(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Wait until the socket has pending input, up to `timeout`.
    /// Returns false on timeout.
    pub async fn readable_timeout(&self, timeout: Duration) -> SocketResult<bool> {
        let stream = self.stream.as_ref().ok_or(SocketError::Closed)?;
        match tokio::time::timeout(timeout, stream.readable()).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(false),
        }
    }

    /// Close the socket. Safe to call multiple times.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }
}

/// A listening socket accepting game connections
pub struct Listener {
    inner: tokio::net::TcpListener,
}

impl Listener {
    /// Bind and listen with an explicit backlog
    pub fn bind(addr: SocketAddr, backlog: u32) -> SocketResult<Self> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let inner = socket.listen(backlog)?;
        Ok(Self { inner })
    }

    /// Local address the listener is bound to
    pub fn local_addr(&self) -> SocketResult<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    /// Accept the next pending connection
    pub async fn accept(&self) -> SocketResult<(Socket, SocketAddr)> {
        let (stream, peer) = self.inner.accept().await?;
        Ok((Socket::from_accepted(stream, peer), peer))
    }

    /// Non-blocking accept: `Ok(None)` when nothing is pending within
    /// `timeout`.
    pub async fn accept_timeout(&self, timeout: Duration) -> SocketResult<Option<(Socket, SocketAddr)>> {
        match tokio::time::timeout(timeout, self.accept()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }
}

/// Multiplexed readiness wait: returns the indices of sockets with pending
/// input, or an empty set once `timeout` elapses.
pub async fn poll_readiness(sockets: &[&Socket], timeout: Duration) -> Vec<usize> {
    use futures::FutureExt;

    let waits: Vec<_> = sockets
        .iter()
        .filter_map(|s| s.stream.as_ref())
        .map(|stream| Box::pin(stream.readable()))
        .collect();

    if waits.is_empty() {
        tokio::time::sleep(timeout).await;
        return Vec::new();
    }

    // Block (bounded) until at least one socket wakes, then sweep them all
    // so a single call reports the full ready subset.
    let _ = tokio::time::timeout(timeout, futures::future::select_all(waits)).await;

    sockets
        .iter()
        .enumerate()
        .filter(|(_, s)| {
            s.stream
                .as_ref()
                .and_then(|stream| stream.readable().now_or_never())
                .map_or(false, |r| r.is_ok())
        })
        .map(|(i, _)| i)
        .collect()
}
