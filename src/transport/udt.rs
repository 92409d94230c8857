//! Datagram-reliable message transport
//!
//! Messages are delivered reliably and with their boundaries intact: every
//! send becomes exactly one length-prefixed frame on a persistent
//! per-receiver stream, and every completed frame becomes exactly one
//! observer notification. Shared runtime state is reference-counted across
//! all udt transports of the process.

use crate::error::{Error, Result};
use std::future::poll_fn;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::Poll;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, warn};

/// Largest message accepted for sending.
pub const MAX_MESSAGE_SIZE_BYTES: usize = 20 * 1024 * 1024;

/// Default capacity of the receive buffer of one incoming connection.
pub const RECEIVE_BUFFER_SIZE_BYTES: usize = 10_000_000;

const LENGTH_PREFIX_BYTES: usize = 4;
const READ_CHUNK_BYTES: usize = 64 * 1024;

static RUNTIME_USERS: AtomicUsize = AtomicUsize::new(0);

/// Guard for the process-wide shared state of the udt transports. The first
/// transport brings it up, dropping the last one tears it down.
pub(crate) struct RuntimeGuard(());

impl RuntimeGuard {
    pub(crate) fn acquire() -> Self {
        if RUNTIME_USERS.fetch_add(1, Ordering::SeqCst) == 0 {
            debug!("udt runtime started");
        }
        RuntimeGuard(())
    }
}

impl Drop for RuntimeGuard {
    fn drop(&mut self) {
        if RUNTIME_USERS.fetch_sub(1, Ordering::SeqCst) == 1 {
            debug!("udt runtime stopped");
        }
    }
}

pub(crate) struct UdtListenerState {
    listener: TcpListener,
}

impl UdtListenerState {
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

    /// Accept all pending clients in one pass.
    pub(crate) async fn accept_pending(&mut self) -> Vec<UdtIncoming> {
        let mut accepted = Vec::new();
        loop {
            match poll_fn(|cx| Poll::Ready(self.listener.poll_accept(cx))).await {
                Poll::Ready(Ok((stream, peer))) => {
                    debug!("udt connection accepted from {}", peer);
                    accepted.push(UdtIncoming {
                        stream,
                        peer,
                        buffer: Vec::new(),
                    });
                }
                Poll::Ready(Err(err)) => {
                    warn!("udt accept failed: {}", err);
                    break;
                }
                Poll::Pending => break,
            }
        }
        accepted
    }
}

pub(crate) struct UdtIncoming {
    stream: TcpStream,
    peer: SocketAddr,
    buffer: Vec<u8>,
}

impl UdtIncoming {
    /// Drain readable bytes and split completed messages out of the buffer.
    /// Returns the messages and whether the connection is still usable.
    pub(crate) async fn read_available(&mut self) -> (Vec<Vec<u8>>, bool) {
        let mut frames = Vec::new();
        loop {
            let mut chunk = [0u8; READ_CHUNK_BYTES];
            let mut buf = ReadBuf::new(&mut chunk);
            let poll =
                poll_fn(|cx| Poll::Ready(Pin::new(&mut self.stream).poll_read(cx, &mut buf)))
                    .await;
            match poll {
                Poll::Pending => return (frames, true),
                Poll::Ready(Ok(())) => {
                    let filled = buf.filled();
                    if filled.is_empty() {
                        // Peer is gone; no partial message survives
                        return (frames, false);
                    }
                    self.buffer.extend_from_slice(filled);
                    match self.extract_frames() {
                        Ok(mut complete) => frames.append(&mut complete),
                        Err(err) => {
                            warn!("udt read from {} failed: {}", self.peer, err);
                            return (frames, false);
                        }
                    }
                }
                Poll::Ready(Err(err)) => {
                    warn!("udt read from {} failed: {}", self.peer, err);
                    return (frames, false);
                }
            }
        }
    }

    fn extract_frames(&mut self) -> Result<Vec<Vec<u8>>> {
        let mut frames = Vec::new();
        loop {
            if self.buffer.len() < LENGTH_PREFIX_BYTES {
                break;
            }
            let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
            prefix.copy_from_slice(&self.buffer[..LENGTH_PREFIX_BYTES]);
            let length = u32::from_be_bytes(prefix) as usize;
            if length > RECEIVE_BUFFER_SIZE_BYTES {
                return Err(Error::TooLarge {
                    size: length,
                    limit: RECEIVE_BUFFER_SIZE_BYTES,
                });
            }
            if self.buffer.len() < LENGTH_PREFIX_BYTES + length {
                break;
            }
            let frame = self.buffer[LENGTH_PREFIX_BYTES..LENGTH_PREFIX_BYTES + length].to_vec();
            self.buffer.drain(..LENGTH_PREFIX_BYTES + length);
            frames.push(frame);
        }
        Ok(frames)
    }
}

/// Persistent outgoing socket, one per receiver.
pub(crate) struct UdtOutgoing {
    stream: TcpStream,
}

impl UdtOutgoing {
    pub(crate) async fn connect(ip: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((ip, port)).await?;
        Ok(Self { stream })
    }

    /// Send one message. A non-negative ttl bounds the time the write may
    /// take, in milliseconds; the framing keeps messages in order on the
    /// stream regardless of `in_order`.
    pub(crate) async fn send(&mut self, data: &[u8], ttl_ms: i64, _in_order: bool) -> Result<()> {
        if data.len() > MAX_MESSAGE_SIZE_BYTES {
            return Err(Error::TooLarge {
                size: data.len(),
                limit: MAX_MESSAGE_SIZE_BYTES,
            });
        }
        let prefix = (data.len() as u32).to_be_bytes();
        let write = async {
            self.stream.write_all(&prefix).await?;
            self.stream.write_all(data).await?;
            self.stream.flush().await
        };
        if ttl_ms >= 0 {
            match tokio::time::timeout(Duration::from_millis(ttl_ms as u64), write).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(Error::Transport(format!(
                        "message ran into its {} ms deadline",
                        ttl_ms
                    )));
                }
            }
        } else {
            write.await?;
        }
        Ok(())
    }
}
