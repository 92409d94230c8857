//! Stream transport carrying one letter per connection
//!
//! The sender writes a single envelope and closes the socket; the receiver
//! reads to EOF and treats the collected bytes as one frame. Outgoing
//! connections therefore reconnect on every send while the cache entry
//! keeps the resolved address.

use crate::error::Result;
use std::future::poll_fn;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::Poll;
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, warn};

const READ_CHUNK_BYTES: usize = 16 * 1024;

pub(crate) struct TcpListenerState {
    listener: TcpListener,
}

impl TcpListenerState {
    /// Bind a reusable, non-blocking listener. Port 0 lets the OS choose.
    pub(crate) async fn bind(port: u16, max_clients: u32) -> Result<Self> {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(SocketAddr::from(([0, 0, 0, 0], port)))?;
        let listener = socket.listen(max_clients)?;
        Ok(Self { listener })
    }

    pub(crate) fn port(&self) -> Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Accept every connection that is already pending, without blocking.
    pub(crate) async fn accept_pending(&mut self) -> Vec<TcpIncoming> {
        let mut accepted = Vec::new();
        loop {
            match poll_fn(|cx| Poll::Ready(self.listener.poll_accept(cx))).await {
                Poll::Ready(Ok((stream, peer))) => {
                    debug!("tcp connection accepted from {}", peer);
                    accepted.push(TcpIncoming {
                        stream,
                        peer,
                        buffer: Vec::new(),
                    });
                }
                Poll::Ready(Err(err)) => {
                    warn!("tcp accept failed: {}", err);
                    break;
                }
                Poll::Pending => break,
            }
        }
        accepted
    }
}

pub(crate) struct TcpIncoming {
    stream: TcpStream,
    peer: SocketAddr,
    buffer: Vec<u8>,
}

impl TcpIncoming {
    /// Drain whatever is readable right now. Returns the frames completed
    /// by this pass and whether the connection is still alive.
    pub(crate) async fn read_available(&mut self) -> (Vec<Vec<u8>>, bool) {
        loop {
            let mut chunk = [0u8; READ_CHUNK_BYTES];
            let mut buf = ReadBuf::new(&mut chunk);
            let poll =
                poll_fn(|cx| Poll::Ready(Pin::new(&mut self.stream).poll_read(cx, &mut buf)))
                    .await;
            match poll {
                Poll::Pending => return (Vec::new(), true),
                Poll::Ready(Ok(())) => {
                    let filled = buf.filled();
                    if filled.is_empty() {
                        // EOF delimits the letter
                        let frame = std::mem::take(&mut self.buffer);
                        let frames = if frame.is_empty() {
                            Vec::new()
                        } else {
                            vec![frame]
                        };
                        return (frames, false);
                    }
                    self.buffer.extend_from_slice(filled);
                }
                Poll::Ready(Err(err)) => {
                    warn!("tcp read from {} failed: {}", self.peer, err);
                    return (Vec::new(), false);
                }
            }
        }
    }
}

/// Cached outgoing endpoint. The socket opened at establish time serves the
/// first send; every later send opens a fresh one because the previous was
/// closed to mark the end of its letter.
pub(crate) struct TcpOutgoing {
    ip: String,
    port: u16,
    stream: Option<TcpStream>,
}

impl TcpOutgoing {
    pub(crate) async fn connect(ip: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((ip, port)).await?;
        Ok(Self {
            ip: ip.to_string(),
            port,
            stream: Some(stream),
        })
    }

    pub(crate) async fn send(&mut self, data: &[u8]) -> Result<()> {
        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => TcpStream::connect((self.ip.as_str(), self.port)).await?,
        };
        stream.write_all(data).await?;
        stream.shutdown().await?;
        Ok(())
    }
}
