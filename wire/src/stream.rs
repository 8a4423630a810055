//! Blocking byte stream over a socket.
//!
//! This is the lowest primitsive the framing layer builds on: a stream that
//! blocks until an operation completes, fails, or times out. Everything
//! above this layer (frame decoding, message dispatch) is written against
//! the [`ByteStream`] trait so that tests can substitute an in-memory pair
//! instead of a real socket.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use crate::error::{WireError, WireResult};

/// A blocking, timeout-aware duplex byte stream.
///
/// Implementors must retry on `ErrorKind::Interrupted` transparently; callers
/// never see `WireError::Interrupted` from a well-behaved implementation.
pub trait ByteStream: Send {
    /// Blocks until exactly `buf.len()` bytes have been read.
    ///
    /// Returns `Closed` if the peer closes before any byte of this call is
    /// read (the normal "connection gone" case). Returns a `Corrupt` error
    /// if the peer closes after some but not all of the requested bytes have
    /// arrived (a frame truncated mid-flight, never a clean disconnect).
    fn read_exact(&mut self, buf: &mut [u8]) -> WireResult<()>;

    /// Blocks until all of `buf` has been written.
    fn write_all(&mut self, buf: &[u8]) -> WireResult<()>;

    /// Returns the number of bytes that can be read right now without
    /// blocking. Does not consume them.
    fn available(&self) -> WireResult<usize>;

    /// Idempotently shuts down both halves of the connection. Safe to call
    /// more than once and from any thread; it is the universal "unblock a
    /// blocked peer read/write right now" mechanism.
    fn close(&self) -> WireResult<()>;

    /// Idempotently shuts down the read half only.
    fn close_read(&self) -> WireResult<()>;

    /// Idempotently shuts down the write half only.
    fn close_write(&self) -> WireResult<()>;

    fn set_read_timeout(&self, timeout: Option<Duration>) -> WireResult<()>;
    fn set_write_timeout(&self, timeout: Option<Duration>) -> WireResult<()>;

    fn peer_addr(&self) -> WireResult<SocketAddr>;
}

/// A [`ByteStream`] backed by `std::net::TcpStream`.
///
/// Cloning (via [`TcpByteStream::try_clone`]) shares the underlying socket,
/// the way a session's input and output worker share one socket without
/// either of them owning it outright.
pub struct TcpByteStream {
    inner: TcpStream,
}

impl TcpByteStream {
    pub fn new(inner: TcpStream) -> Self {
        Self { inner }
    }

    /// Produces a second handle to the same underlying socket. Both halves
    /// can be read/written independently; shutting down one shuts down both,
    /// since they share one file descriptor.
    pub fn try_clone(&self) -> WireResult<Self> {
        Ok(Self {
            inner: self.inner.try_clone()?,
        })
    }
}

impl ByteStream for TcpByteStream {
    fn read_exact(&mut self, buf: &mut [u8]) -> WireResult<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => {
                    return if filled == 0 {
                        Err(WireError::Closed)
                    } else {
                        Err(WireError::Corrupt {
                            reason: "connection closed mid-read",
                        })
                    };
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if is_timeout(&e) => return Err(WireError::Timeout),
                Err(e) => return Err(WireError::Io(e)),
            }
        }
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8]) -> WireResult<()> {
        let mut sent = 0;
        while sent < buf.len() {
            match self.inner.write(&buf[sent..]) {
                Ok(0) => {
                    return Err(WireError::Corrupt {
                        reason: "connection closed mid-write",
                    })
                }
                Ok(n) => sent += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if is_timeout(&e) => return Err(WireError::Timeout),
                Err(e) => return Err(WireError::Io(e)),
            }
        }
        Ok(())
    }

    fn available(&self) -> WireResult<usize> {
        // std exposes no portable FIONREAD, so this flips to nonblocking
        // mode and peeks into a generously sized buffer: exact up to
        // PEEK_BUFFER_SIZE bytes queued, saturating at that size if more is
        // actually waiting. `peek` does not consume the bytes it reports.
        const PEEK_BUFFER_SIZE: usize = 64 * 1024;
        self.inner.set_nonblocking(true).map_err(WireError::Io)?;
        let mut buf = vec![0u8; PEEK_BUFFER_SIZE];
        let peeked = self.inner.peek(&mut buf);
        let restore = self.inner.set_nonblocking(false);
        match peeked {
            Ok(n) => {
                restore.map_err(WireError::Io)?;
                Ok(n)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                restore.map_err(WireError::Io)?;
                Ok(0)
            }
            Err(e) => {
                let _ = restore;
                Err(WireError::Io(e))
            }
        }
    }

    fn close(&self) -> WireResult<()> {
        match self.inner.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(WireError::Io(e)),
        }
    }

    fn close_read(&self) -> WireResult<()> {
        match self.inner.shutdown(Shutdown::Read) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(WireError::Io(e)),
        }
    }

    fn close_write(&self) -> WireResult<()> {
        match self.inner.shutdown(Shutdown::Write) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(WireError::Io(e)),
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> WireResult<()> {
        self.inner.set_read_timeout(timeout).map_err(WireError::Io)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> WireResult<()> {
        self.inner.set_write_timeout(timeout).map_err(WireError::Io)
    }

    fn peer_addr(&self) -> WireResult<SocketAddr> {
        self.inner.peer_addr().map_err(WireError::Io)
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock)
}

/// An in-memory [`ByteStream`] over a byte buffer, with no socket underneath.
///
/// Used to build a reply payload with the framing primitives when there is
/// no live connection to write through yet (a protocol's default
/// "no handler" reply), and as a cheaper test double than a loopback TCP
/// pair where the timing semantics of a real socket don't matter.
pub struct MemoryByteStream {
    read: io::Cursor<Vec<u8>>,
    written: Vec<u8>,
}

impl MemoryByteStream {
    pub fn new() -> Self {
        Self {
            read: io::Cursor::new(Vec::new()),
            written: Vec::new(),
        }
    }

    pub fn with_input(data: Vec<u8>) -> Self {
        Self {
            read: io::Cursor::new(data),
            written: Vec::new(),
        }
    }

    /// Consumes the stream, returning everything written to it.
    pub fn into_written(self) -> Vec<u8> {
        self.written
    }
}

impl Default for MemoryByteStream {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteStream for MemoryByteStream {
    fn read_exact(&mut self, buf: &mut [u8]) -> WireResult<()> {
        let remaining = (self.read.get_ref().len() as u64).saturating_sub(self.read.position());
        if (remaining as usize) < buf.len() {
            return Err(WireError::Corrupt {
                reason: "memory stream exhausted before read completed",
            });
        }
        self.read.read_exact(buf).map_err(WireError::Io)
    }

    fn write_all(&mut self, buf: &[u8]) -> WireResult<()> {
        self.written.extend_from_slice(buf);
        Ok(())
    }

    fn available(&self) -> WireResult<usize> {
        Ok((self.read.get_ref().len() as u64 - self.read.position()) as usize)
    }

    fn close(&self) -> WireResult<()> {
        Ok(())
    }

    fn close_read(&self) -> WireResult<()> {
        Ok(())
    }

    fn close_write(&self) -> WireResult<()> {
        Ok(())
    }

    fn set_read_timeout(&self, _timeout: Option<Duration>) -> WireResult<()> {
        Ok(())
    }

    fn set_write_timeout(&self, _timeout: Option<Duration>) -> WireResult<()> {
        Ok(())
    }

    fn peer_addr(&self) -> WireResult<SocketAddr> {
        Err(WireError::Io(io::Error::new(
            ErrorKind::AddrNotAvailable,
            "memory stream has no peer address",
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn loopback_pair() -> (TcpByteStream, TcpByteStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || TcpStream::connect(addr).unwrap());
        let (server, _) = listener.accept().unwrap();
        let client = client.join().unwrap();
        (TcpByteStream::new(server), TcpByteStream::new(client))
    }

    #[test]
    fn read_exact_round_trips() {
        let (mut server, mut client) = loopback_pair();
        thread::spawn(move || {
            client.write_all(b"hello").unwrap();
        });
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn closed_before_any_byte_is_closed_not_corrupt() {
        let (mut server, client) = loopback_pair();
        drop(client);
        let mut buf = [0u8; 4];
        match server.read_exact(&mut buf) {
            Err(WireError::Closed) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[test]
    fn closed_mid_frame_is_corrupt() {
        let (mut server, mut client) = loopback_pair();
        client.write_all(&[1, 2]).unwrap();
        drop(client);
        let mut buf = [0u8; 4];
        match server.read_exact(&mut buf) {
            Err(WireError::Corrupt { .. }) => {}
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }

    #[test]
    fn read_timeout_is_reported_distinctly() {
        let (mut server, _client) = loopback_pair();
        server
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        let mut buf = [0u8; 4];
        match server.read_exact(&mut buf) {
            Err(WireError::Timeout) => {}
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[test]
    fn available_reports_queued_bytes_without_consuming_them() {
        let (mut server, mut client) = loopback_pair();
        assert_eq!(server.available().unwrap(), 0);

        client.write_all(b"hi").unwrap();
        // Give the bytes time to arrive in the server's receive buffer.
        thread::sleep(Duration::from_millis(100));
        assert_eq!(server.available().unwrap(), 2);

        // A peek must not consume: the bytes are still there for a real read.
        let mut buf = [0u8; 2];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
        assert_eq!(server.available().unwrap(), 0);
    }

    #[test]
    fn close_is_idempotent() {
        let (server, _client) = loopback_pair();
        server.close().unwrap();
        server.close().unwrap();
    }

    #[test]
    fn memory_stream_round_trips_without_a_socket() {
        let mut mem = MemoryByteStream::with_input(vec![1, 2, 3]);
        let mut buf = [0u8; 3];
        mem.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
        mem.write_all(&[9, 9]).unwrap();
        assert_eq!(mem.into_written(), vec![9, 9]);
    }

    #[test]
    fn memory_stream_exhaustion_is_corrupt() {
        let mut mem = MemoryByteStream::with_input(vec![1]);
        let mut buf = [0u8; 2];
        match mem.read_exact(&mut buf) {
            Err(WireError::Corrupt { .. }) => {}
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }
}
