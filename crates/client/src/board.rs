//! Connection facade
//!
//! Wires the resource tracker, protocol engine and channel objects
//! together. The facade owns a descriptor for every open child keyed by a
//! stable handle; children hold only a non-owning reference back, used to
//! release their pins and function blocks on close. On a device-side reset
//! every child is force-closed before the tracker is cleared, so stale
//! allocations never survive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use common::{Error, Result, Transport};
use protocol::{DigitalInMode, DigitalOutMode, Pin};
use tracing::{error, info};

use crate::digital::{DigitalInput, DigitalOutput};
use crate::engine::{ConnectionState, HandshakeIds, ProtocolEngine};
use crate::tracker::{Function, PinTracker};
use crate::uart::{Uart, UartConfig, UartPins};

/// This library's own version, reported alongside the board identifiers
pub const LIB_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Firmware releases this client is known to talk to
const SUPPORTED_FIRMWARE: &[&str] = &["IOIO0311", "IOIO0323", "IOIO0324", "IOIO0326"];

/// Deterministic teardown hook for facade children
pub(crate) trait ForceClose: Send + Sync {
    fn force_close(&self);
}

pub(crate) struct BoardShared {
    tracker: Mutex<PinTracker>,
    children: Mutex<HashMap<u64, Arc<dyn ForceClose>>>,
    next_handle: AtomicU64,
    ids: Mutex<Option<HandshakeIds>>,
}

impl BoardShared {
    /// Handshake callback: record identity, check firmware, build the
    /// capability table for the reported hardware
    fn on_establish(&self, ids: &HandshakeIds) -> bool {
        info!(
            "establish connection: hardware={} bootloader={} firmware={}",
            ids.hardware, ids.bootloader, ids.firmware
        );
        *self.ids.lock().unwrap() = Some(ids.clone());
        if !SUPPORTED_FIRMWARE.contains(&ids.firmware.as_str()) {
            error!("untested firmware version: {}", ids.firmware);
            return false;
        }
        *self.tracker.lock().unwrap() = PinTracker::new(&ids.hardware);
        self.reset_children();
        true
    }

    /// Force-close every child, then return the tracker to a clean slate
    fn reset_children(&self) {
        let drained: Vec<Arc<dyn ForceClose>> = {
            let mut children = self.children.lock().unwrap();
            children.drain().map(|(_, child)| child).collect()
        };
        for child in drained {
            child.force_close();
        }
        self.tracker.lock().unwrap().reset();
    }

    pub(crate) fn release_pin(&self, handle: u64, pin: u8) {
        self.tracker.lock().unwrap().free_pin(pin);
        self.children.lock().unwrap().remove(&handle);
    }

    pub(crate) fn release_uart(&self, handle: u64, pins: &[u8], channel: u8) {
        {
            let mut tracker = self.tracker.lock().unwrap();
            for &pin in pins {
                tracker.free_pin(pin);
            }
            tracker.free_function(Function::Uart, channel);
        }
        self.children.lock().unwrap().remove(&handle);
    }
}

/// Top-level interface to one board connection
///
/// Do not reuse after the connection dies; create a new `Board` (with a
/// fresh transport) to reconnect.
pub struct Board {
    engine: ProtocolEngine,
    shared: Arc<BoardShared>,
}

impl Board {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let shared = Arc::new(BoardShared {
            tracker: Mutex::new(PinTracker::empty()),
            children: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            ids: Mutex::new(None),
        });

        let establish_shared = Arc::downgrade(&shared);
        let reset_shared = Arc::downgrade(&shared);
        let engine = ProtocolEngine::new(
            transport,
            Box::new(move |ids| match establish_shared.upgrade() {
                Some(shared) => shared.on_establish(ids),
                None => false,
            }),
            Box::new(move || {
                if let Some(shared) = reset_shared.upgrade() {
                    shared.reset_children();
                }
            }),
        );

        Self { engine, shared }
    }

    pub fn engine(&self) -> &ProtocolEngine {
        &self.engine
    }

    /// Connect and wait for the handshake
    ///
    /// An incompatible board is an error; a plain timeout is not. On
    /// timeout the state stays `Init` and [`Board::is_connected`] reports
    /// false.
    pub fn connect(&self, timeout: Duration) -> Result<()> {
        self.engine.connect(timeout)?;
        if self.engine.state() == ConnectionState::Incompatible {
            let firmware = self
                .versions()
                .map(|ids| ids.firmware)
                .unwrap_or_else(|| "unknown".into());
            return Err(Error::Incompatible(firmware));
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.engine.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.engine.state()
    }

    pub fn check_state(&self) -> Result<()> {
        self.engine.check_state()
    }

    /// Identity reported by the board at handshake time
    pub fn versions(&self) -> Option<HandshakeIds> {
        self.shared.ids.lock().unwrap().clone()
    }

    /// Request a graceful shutdown; wait with [`Board::wait_for_disconnect`]
    pub fn disconnect(&self) -> Result<()> {
        self.engine.disconnect()
    }

    /// True once the connection reached its dead state
    pub fn wait_for_disconnect(&self, timeout: Duration) -> bool {
        self.engine.wait_for_disconnect(timeout)
    }

    /// Reset all board configuration to its startup state
    ///
    /// Every open pin and channel object is closed when the board's reset
    /// report arrives.
    pub fn soft_reset(&self) -> Result<()> {
        self.engine.soft_reset()
    }

    /// Reboot the board into its bootloader and await a fresh handshake
    pub fn hard_reset(&self) -> Result<()> {
        self.engine.hard_reset()?;
        self.engine.reset();
        Ok(())
    }

    /// Configure `pin` as a digital output
    pub fn open_digital_output(
        &self,
        pin: Pin,
        mode: DigitalOutMode,
        start_value: bool,
    ) -> Result<DigitalOutput> {
        self.engine.check_state()?;
        let index = pin.index();
        self.shared
            .tracker
            .lock()
            .unwrap()
            .allocate_pin(index, Function::DigitalOut)?;

        let handle = self.shared.next_handle.fetch_add(1, Ordering::Relaxed);
        match DigitalOutput::open(
            self.engine.link(),
            Arc::downgrade(&self.shared),
            handle,
            pin,
            mode,
            start_value,
        ) {
            Ok(output) => {
                self.shared
                    .children
                    .lock()
                    .unwrap()
                    .insert(handle, Arc::clone(&output.shared) as Arc<dyn ForceClose>);
                Ok(output)
            }
            Err(e) => {
                self.shared.tracker.lock().unwrap().free_pin(index);
                Err(e)
            }
        }
    }

    /// Configure `pin` as a digital input with change notification
    pub fn open_digital_input(&self, pin: Pin, mode: DigitalInMode) -> Result<DigitalInput> {
        self.engine.check_state()?;
        let index = pin.index();
        self.shared
            .tracker
            .lock()
            .unwrap()
            .allocate_pin(index, Function::DigitalIn)?;

        let handle = self.shared.next_handle.fetch_add(1, Ordering::Relaxed);
        match DigitalInput::open(
            self.engine.link(),
            self.engine.registry(),
            Arc::downgrade(&self.shared),
            handle,
            pin,
            mode,
        ) {
            Ok(input) => {
                self.shared
                    .children
                    .lock()
                    .unwrap()
                    .insert(handle, Arc::clone(&input.shared) as Arc<dyn ForceClose>);
                Ok(input)
            }
            Err(e) => {
                self.shared.tracker.lock().unwrap().free_pin(index);
                Err(e)
            }
        }
    }

    /// Open a UART on the given pins
    ///
    /// Reserves flow-control pins, then rx, then tx, then a free UART
    /// function block; on any failure everything already reserved is
    /// released before the error propagates.
    pub fn open_uart(&self, pins: UartPins, config: UartConfig) -> Result<Uart> {
        if config.baud == 0 {
            return Err(Error::IllegalArgument("baud must be > 0".into()));
        }
        if pins.rx.is_none() && pins.tx.is_none() {
            return Err(Error::IllegalArgument(
                "at least a receive or transmit pin must be given".into(),
            ));
        }
        if config.flow.uses_rts_cts() && (pins.rts.is_none() || pins.cts.is_none()) {
            return Err(Error::IllegalArgument(
                "both RTS and CTS pins are required for hardware flow control".into(),
            ));
        }
        self.engine.check_state()?;

        let mut wanted: Vec<u8> = Vec::new();
        if config.flow.uses_rts_cts() {
            wanted.extend(pins.rts);
            wanted.extend(pins.cts);
        }
        wanted.extend(pins.rx);
        wanted.extend(pins.tx);

        let (allocated, channel) = {
            let mut tracker = self.shared.tracker.lock().unwrap();
            let mut allocated: Vec<u8> = Vec::new();
            let result: Result<u8> = (|| {
                for &pin in &wanted {
                    tracker.allocate_pin(pin, Function::Uart)?;
                    allocated.push(pin);
                }
                tracker.allocate_function(Function::Uart)
            })();
            match result {
                Ok(channel) => (allocated, channel),
                Err(e) => {
                    for &pin in &allocated {
                        tracker.free_pin(pin);
                    }
                    return Err(e);
                }
            }
        };

        let handle = self.shared.next_handle.fetch_add(1, Ordering::Relaxed);
        match Uart::open(
            self.engine.link(),
            self.engine.registry(),
            Arc::downgrade(&self.shared),
            handle,
            channel,
            pins,
            &config,
        ) {
            Ok(uart) => {
                self.shared
                    .children
                    .lock()
                    .unwrap()
                    .insert(handle, Arc::clone(&uart.shared) as Arc<dyn ForceClose>);
                Ok(uart)
            }
            Err(e) => {
                let mut tracker = self.shared.tracker.lock().unwrap();
                tracker.free_function(Function::Uart, channel);
                for &pin in &allocated {
                    tracker.free_pin(pin);
                }
                Err(e)
            }
        }
    }
}
