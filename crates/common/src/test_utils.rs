//! Test utilities shared across crates
//!
//! Provides a scriptable in-memory [`Transport`] so tests can play the part
//! of the board: push inbound frames, observe the exact bytes the client
//! sent, and drop the link mid-conversation.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::transport::Transport;

/// Default timeout for waiting on expected traffic in tests
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

struct MockState {
    /// Bytes the "board" has queued for the client to read
    rx: VecDeque<u8>,
    /// Bytes the client has sent
    tx: Vec<u8>,
    open: bool,
}

/// In-memory scriptable transport
pub struct MockTransport {
    state: Mutex<MockState>,
    rx_available: Condvar,
    tx_written: Condvar,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                rx: VecDeque::new(),
                tx: Vec::new(),
                open: true,
            }),
            rx_available: Condvar::new(),
            tx_written: Condvar::new(),
        }
    }

    /// Queue bytes for the client to read, as if sent by the board
    pub fn push_incoming(&self, bytes: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.rx.extend(bytes.iter().copied());
        self.rx_available.notify_all();
    }

    /// Drain and return everything the client has sent so far
    pub fn take_outgoing(&self) -> Vec<u8> {
        let mut state = self.state.lock().unwrap();
        std::mem::take(&mut state.tx)
    }

    /// Copy of the undrained outbound capture
    pub fn outgoing_snapshot(&self) -> Vec<u8> {
        self.state.lock().unwrap().tx.clone()
    }

    /// Block until at least `len` outbound bytes have accumulated, then
    /// drain and return them; panics on timeout with the partial capture
    pub fn wait_for_outgoing(&self, len: usize, timeout: Duration) -> Vec<u8> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while state.tx.len() < len {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .unwrap_or_else(|| {
                    panic!(
                        "timed out waiting for {} outbound bytes, got {}: {:?}",
                        len,
                        state.tx.len(),
                        state.tx
                    )
                });
            let (guard, _) = self.tx_written.wait_timeout(state, remaining).unwrap();
            state = guard;
        }
        std::mem::take(&mut state.tx)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.rx.is_empty() && state.open {
            let (guard, _) = self
                .rx_available
                .wait_timeout(state, Duration::from_millis(10))
                .unwrap();
            state = guard;
        }
        let n = buf.len().min(state.rx.len());
        for slot in buf.iter_mut().take(n) {
            *slot = state.rx.pop_front().unwrap();
        }
        Ok(n)
    }

    fn send(&self, data: &[u8]) -> std::io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if !state.open {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "mock transport closed",
            ));
        }
        state.tx.extend_from_slice(data);
        self.tx_written.notify_all();
        Ok(data.len())
    }

    fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.open = false;
        self.rx_available.notify_all();
        self.tx_written.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_transport_roundtrip() {
        let mock = MockTransport::new();
        mock.push_incoming(&[1, 2, 3]);

        let mut buf = [0u8; 2];
        assert_eq!(mock.read(&mut buf).unwrap(), 2);
        assert_eq!(buf, [1, 2]);
        assert_eq!(mock.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], 3);

        mock.send(&[9, 8]).unwrap();
        assert_eq!(mock.take_outgoing(), vec![9, 8]);
    }

    #[test]
    fn test_mock_transport_close_rejects_sends() {
        let mock = MockTransport::new();
        mock.close();
        assert!(!mock.is_open());
        assert!(mock.send(&[0]).is_err());

        // Reads drain nothing but do not error
        let mut buf = [0u8; 4];
        assert_eq!(mock.read(&mut buf).unwrap(), 0);
    }
}
