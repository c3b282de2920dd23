//! Duplex byte stream abstraction
//!
//! The board client is transport-agnostic: anything presenting a reliable
//! ordered byte stream works. Reads come from the decode-loop thread while
//! sends come from arbitrary caller threads, so all methods take `&self`.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::debug;

/// How long a [`Transport::read`] may block before reporting "no data yet"
pub const READ_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// An open duplex byte stream to the board
///
/// `read` returns the bytes currently available, up to `buf.len()`, blocking
/// at most briefly; `Ok(0)` means nothing arrived within the poll interval
/// or the stream has closed (distinguished via [`Transport::is_open`]).
pub trait Transport: Send + Sync {
    /// Read available bytes into `buf`
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Send bytes, returning how many were accepted
    fn send(&self, data: &[u8]) -> io::Result<usize>;

    /// True while the stream is usable
    fn is_open(&self) -> bool;

    /// Close the stream; idempotent
    fn close(&self);
}

/// TCP-backed transport (e.g. a serial-over-TCP bridge to the board)
pub struct TcpTransport {
    stream: TcpStream,
    open: AtomicBool,
}

impl TcpTransport {
    /// Connect to `addr` and configure the polling read timeout
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        Self::from_stream(stream)
    }

    /// Wrap an already-connected stream
    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        stream.set_read_timeout(Some(READ_POLL_INTERVAL))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            open: AtomicBool::new(true),
        })
    }
}

impl Transport for TcpTransport {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.is_open() {
            return Ok(0);
        }
        match (&self.stream).read(buf) {
            // EOF: peer closed the stream
            Ok(0) => {
                debug!("transport reached EOF");
                self.open.store(false, Ordering::SeqCst);
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                Ok(0)
            }
            Err(e) => {
                self.open.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn send(&self, data: &[u8]) -> io::Result<usize> {
        (&self.stream).write(data)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }
}
