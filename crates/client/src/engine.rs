//! Protocol engine: connection state machine and decode loop
//!
//! One dedicated thread per connection reads the inbound stream, decodes
//! frames and dispatches them to subscribers in arrival order. Callers on
//! other threads interact only through the handler registry, the shared
//! connection state and [`Link::send`], which serializes writes so
//! multi-byte frames never interleave.
//!
//! Protocol violations (unknown opcode, payload short after the retry
//! budget) are unrecoverable: the loop closes the transport,
//! transitions to [`ConnectionState::Dead`] and exits. A new engine is
//! required to reconnect.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use common::{Error, Result, Transport};
use protocol::{commands, Event, FrameReader};
use tracing::{debug, error, info, trace, warn};

use crate::registry::{EventKind, HandlerRegistry};

/// Poll interval for [`ProtocolEngine::connect`]
const CONNECT_POLL: Duration = Duration::from_millis(10);
/// Connect iterations before nudging the board with a soft reset
const SOFT_NUDGE_AT: u32 = 50;
/// Connect iterations before kicking it harder with a hard reset
const HARD_NUDGE_AT: u32 = 100;

/// Attempts to complete a short payload read before giving up
const READ_RETRY_BUDGET: u32 = 50;
/// Pause between payload read attempts
const READ_RETRY_PAUSE: Duration = Duration::from_millis(10);

/// Connection lifecycle states
///
/// Transitions are monotonic except for [`ProtocolEngine::reset`], which
/// re-arms `Init` ahead of a renewed handshake. `Dead` and `Incompatible`
/// are terminal for a given engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Awaiting the establish-connection handshake
    Init = 0,
    /// Handshake accepted, traffic flowing
    Connected = 1,
    /// Handshake rejected the firmware; no further traffic expected
    Incompatible = 2,
    /// Connection ended (graceful close, fatal error or transport loss)
    Dead = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Init,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Incompatible,
            _ => ConnectionState::Dead,
        }
    }
}

/// Identity fields from the establish-connection handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeIds {
    pub hardware: String,
    pub bootloader: String,
    pub firmware: String,
}

/// Called with the handshake identifiers; returns whether to accept
pub type EstablishCallback = Box<dyn Fn(&HandshakeIds) -> bool + Send + Sync>;
/// Called when the board reports a reset or graceful close
pub type ResetCallback = Box<dyn Fn() + Send + Sync>;

/// Shared transport handle plus connection state
///
/// Everything a subscriber needs to issue commands lives here, so channel
/// and pin objects can hold a `Link` without holding the whole engine.
pub struct Link {
    transport: Arc<dyn Transport>,
    state: AtomicU8,
    write_lock: Mutex<()>,
}

impl Link {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            state: AtomicU8::new(ConnectionState::Init as u8),
            write_lock: Mutex::new(()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// Fail fast unless the connection is usable
    ///
    /// Every outward-facing operation goes through here first.
    pub fn check_state(&self) -> Result<()> {
        if !self.transport.is_open() {
            warn!("no connection transport");
            return Err(Error::TransportUnavailable);
        }
        match self.state() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Dead => {
                warn!("connection was lost");
                Err(Error::ConnectionLost)
            }
            ConnectionState::Init => {
                Err(Error::IllegalState("never connected".into()))
            }
            ConnectionState::Incompatible => {
                Err(Error::IllegalState("incompatible firmware version".into()))
            }
        }
    }

    /// Send one complete frame; writes are serialized across threads
    pub fn send(&self, data: &[u8]) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let mut written = 0;
        while written < data.len() {
            let n = self.transport.send(&data[written..])?;
            if n == 0 {
                return Err(Error::TransportUnavailable);
            }
            written += n;
        }
        Ok(())
    }
}

struct EngineShared {
    link: Arc<Link>,
    registry: Arc<HandlerRegistry>,
    running: AtomicBool,
    establish_cb: EstablishCallback,
    reset_cb: ResetCallback,
}

/// The per-connection protocol engine
///
/// Do not reuse after the connection dies; create a new engine (and
/// transport) to reconnect.
pub struct ProtocolEngine {
    shared: Arc<EngineShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ProtocolEngine {
    pub fn new(
        transport: Arc<dyn Transport>,
        establish_cb: EstablishCallback,
        reset_cb: ResetCallback,
    ) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                link: Arc::new(Link::new(transport)),
                registry: Arc::new(HandlerRegistry::new()),
                running: AtomicBool::new(false),
                establish_cb,
                reset_cb,
            }),
            thread: Mutex::new(None),
        }
    }

    pub fn link(&self) -> Arc<Link> {
        Arc::clone(&self.shared.link)
    }

    pub fn registry(&self) -> Arc<HandlerRegistry> {
        Arc::clone(&self.shared.registry)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.link.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn check_state(&self) -> Result<()> {
        self.shared.link.check_state()
    }

    /// Start the decode loop and wait for the handshake
    ///
    /// Blocks until the state leaves `Init` or `timeout` elapses. While
    /// waiting, a closed transport fails immediately; after a while with no
    /// handshake the board is nudged with a soft then a hard reset (best
    /// effort). A timeout is not an error: the state simply remains `Init`
    /// and the caller must treat that as failure.
    pub fn connect(&self, timeout: Duration) -> Result<()> {
        if !self.shared.link.transport().is_open() {
            error!("no connection transport");
            return Err(Error::TransportUnavailable);
        }
        self.start_decode_loop();

        let iterations = (timeout.as_millis() / CONNECT_POLL.as_millis()).max(1) as u32;
        let mut count = 0u32;
        while self.state() == ConnectionState::Init {
            if !self.shared.link.transport().is_open() {
                error!("no connection transport");
                return Err(Error::TransportUnavailable);
            }
            thread::sleep(CONNECT_POLL);
            count += 1;
            if count >= iterations {
                break;
            }
            if count == SOFT_NUDGE_AT {
                debug!("no handshake yet, nudging board with soft reset");
                let _ = self.shared.link.send(&commands::soft_reset());
            }
            if count == HARD_NUDGE_AT {
                debug!("still no handshake, kicking board with hard reset");
                let _ = self.shared.link.send(&commands::hard_reset());
            }
        }
        if count > 0 && self.state() != ConnectionState::Init {
            info!(
                "got handshake after {:.3}s",
                (count * CONNECT_POLL.as_millis() as u32) as f64 / 1000.0
            );
        }
        Ok(())
    }

    /// Send a graceful close if connected; the Dead transition happens when
    /// the board acknowledges by echoing the close frame
    pub fn disconnect(&self) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Ok(());
        }
        self.check_state()?;
        self.shared.link.send(&commands::soft_close())
    }

    /// Wait for the Dead state; true if reached within `timeout`
    pub fn wait_for_disconnect(&self, timeout: Duration) -> bool {
        let poll = Duration::from_millis(100);
        let mut remaining = timeout;
        while self.state() != ConnectionState::Dead {
            if remaining.is_zero() {
                return false;
            }
            let step = poll.min(remaining);
            thread::sleep(step);
            remaining -= step;
        }
        true
    }

    /// Reset all board configuration to its startup state
    pub fn soft_reset(&self) -> Result<()> {
        self.check_state()?;
        self.shared.link.send(&commands::soft_reset())
    }

    /// Reset the board back to its bootloader
    pub fn hard_reset(&self) -> Result<()> {
        self.check_state()?;
        self.shared.link.send(&commands::hard_reset())
    }

    /// Re-arm the Init state ahead of a renewed handshake
    ///
    /// Subscriber registrations survive; only the state machine rewinds.
    /// No-op unless currently connected.
    pub fn reset(&self) {
        if self.state() == ConnectionState::Connected {
            info!("re-arming connection state for a new handshake");
            self.shared.link.set_state(ConnectionState::Init);
        }
    }

    fn start_decode_loop(&self) {
        let mut thread = self.thread.lock().unwrap();
        if thread.is_some() {
            return;
        }
        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("ioio-listener".into())
            .spawn(move || run_loop(shared))
            .expect("failed to spawn decode loop thread");
        *thread = Some(handle);
    }
}

impl Drop for ProtocolEngine {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.link.transport().close();
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// Payload reader applying the bounded-retry exact-read policy
///
/// Each underlying read attempt gets the full retry budget; running out of
/// budget is reported as `TimedOut`, which the decode loop treats as a
/// fatal protocol violation rather than a transient condition.
struct RetryReader<'a> {
    transport: &'a dyn Transport,
}

impl Read for RetryReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        for _ in 0..READ_RETRY_BUDGET {
            match self.transport.read(buf)? {
                0 => {
                    if !self.transport.is_open() {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "transport closed mid-frame",
                        ));
                    }
                    thread::sleep(READ_RETRY_PAUSE);
                }
                n => return Ok(n),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "payload read retry budget exhausted",
        ))
    }
}

fn run_loop(shared: Arc<EngineShared>) {
    info!("decode loop started");
    let mut reader = FrameReader::new();

    loop {
        let opcode = match wait_for_opcode(&shared) {
            Some(op) => op,
            None => break,
        };

        let mut payload = RetryReader {
            transport: shared.link.transport(),
        };
        match reader.decode_frame(opcode, &mut payload) {
            Ok(Event::SoftClose) => {
                info!("received soft close");
                (shared.reset_cb)();
                shared.link.set_state(ConnectionState::Dead);
                break;
            }
            Ok(event) => handle_event(&shared, event),
            Err(e) => {
                error!("protocol error, closing connection: {}", e);
                shared.link.transport().close();
                shared.link.set_state(ConnectionState::Dead);
                break;
            }
        }
    }

    debug!("decode loop stopped");
}

/// Block until one opcode byte arrives; None when stopping or the
/// transport closed (which forces the Dead state)
fn wait_for_opcode(shared: &Arc<EngineShared>) -> Option<u8> {
    let mut byte = [0u8; 1];
    loop {
        if !shared.running.load(Ordering::SeqCst) {
            return None;
        }
        match shared.link.transport().read(&mut byte) {
            Ok(0) => {
                if !shared.link.transport().is_open() {
                    if shared.link.state() != ConnectionState::Dead {
                        warn!("transport closed, connection lost");
                        shared.link.set_state(ConnectionState::Dead);
                    }
                    return None;
                }
            }
            Ok(_) => return Some(byte[0]),
            Err(e) => {
                error!("transport read failed: {}", e);
                shared.link.transport().close();
                shared.link.set_state(ConnectionState::Dead);
                return None;
            }
        }
    }
}

fn handle_event(shared: &Arc<EngineShared>, event: Event) {
    match &event {
        Event::Established {
            hardware_id,
            bootloader_id,
            firmware_id,
        } => {
            let ids = HandshakeIds {
                hardware: String::from_utf8_lossy(hardware_id).into_owned(),
                bootloader: String::from_utf8_lossy(bootloader_id).into_owned(),
                firmware: String::from_utf8_lossy(firmware_id).into_owned(),
            };
            if (shared.establish_cb)(&ids) {
                info!("connection established with firmware {}", ids.firmware);
                shared.link.set_state(ConnectionState::Connected);
            } else {
                warn!("firmware {} rejected as incompatible", ids.firmware);
                shared.link.set_state(ConnectionState::Incompatible);
            }
        }

        Event::SoftReset => {
            info!("board reported soft reset");
            (shared.reset_cb)();
        }

        Event::InterfaceResponse { supported } => {
            info!("interface check response: supported={}", supported);
        }

        Event::DigitalInStatus { pin, .. } => {
            shared
                .registry
                .dispatch(EventKind::DigitalInStatus, *pin, &event);
        }

        Event::ChangeNotify { pin, .. } => {
            shared.registry.dispatch(EventKind::ChangeNotify, *pin, &event);
        }

        Event::UartData { channel, .. } => {
            shared.registry.dispatch(EventKind::UartData, *channel, &event);
        }

        Event::UartTxStatus { channel, .. } => {
            shared
                .registry
                .dispatch(EventKind::UartTxStatus, *channel, &event);
        }

        Event::UartStatus { channel, open } => {
            let kind = if *open {
                EventKind::UartOpened
            } else {
                EventKind::UartClosed
            };
            shared.registry.dispatch(kind, *channel, &event);
        }

        Event::Skipped { opcode } => {
            trace!("skipped frame for unhandled subsystem, opcode {:#04x}", opcode);
        }

        // Terminal frame, handled in the loop itself
        Event::SoftClose => unreachable!("soft close terminates the decode loop"),
    }
}
