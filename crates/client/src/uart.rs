//! UART serial channel
//!
//! A credit-based flow-controlled byte pipe over one allocated UART
//! function block. Writes are queued immediately and drained while the
//! board has granted transmit credit; inbound chunks land in a receive
//! queue on the decode-loop thread and are consumed by the caller.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::Duration;

use common::{Error, Result};
use protocol::{commands, Event, FlowControl, Parity, Pin, StopBits, MAX_UART_PAYLOAD};
use tracing::{debug, info, trace, warn};

use crate::board::{BoardShared, ForceClose};
use crate::engine::{ConnectionState, Link};
use crate::registry::{EventKind, HandlerRegistry, SubscriptionToken};

/// Poll interval for [`Uart::flush`]; callers needing faster drain
/// detection should watch [`Uart::output_pending`] instead
const FLUSH_POLL: Duration = Duration::from_millis(100);

/// Reference clock for 4x oversampling mode
const CLOCK_4X_HZ: f64 = 4_000_000.0;
/// Reference clock for 1x oversampling mode
const CLOCK_1X_HZ: f64 = 1_000_000.0;
/// Relative baud error above which a warning is emitted
const BAUD_ERROR_THRESHOLD: f64 = 0.00625;

/// UART line configuration
#[derive(Debug, Clone)]
pub struct UartConfig {
    pub baud: u32,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow: FlowControl,
}

impl UartConfig {
    /// 8N1 with no flow control at the given baud rate
    pub fn new(baud: u32) -> Self {
        Self {
            baud,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow: FlowControl::None,
        }
    }
}

/// Pin assignment for a UART; `None` means the line is not wired
#[derive(Debug, Clone, Default)]
pub struct UartPins {
    pub rx: Option<u8>,
    pub tx: Option<u8>,
    pub rts: Option<u8>,
    pub cts: Option<u8>,
}

/// Derived clock selection for a requested baud rate
#[derive(Debug, Clone, Copy)]
pub(crate) struct RateSetup {
    pub four_x: bool,
    pub divisor: u16,
    pub achieved: f64,
    pub relative_error: f64,
}

/// Pick the clock and divisor for `baud`
///
/// Prefers the 4 MHz 4x-oversampling clock; falls back to the 1 MHz clock
/// when the divisor overflows 16 bits or the flow mode requires it (IrDA).
pub(crate) fn derive_rate(baud: u32, flow: FlowControl) -> RateSetup {
    let mut four_x = true;
    let mut divisor = (CLOCK_4X_HZ / baud as f64).round() as i64 - 1;
    if divisor > u16::MAX as i64 || flow == FlowControl::Irda {
        four_x = false;
        divisor = (CLOCK_1X_HZ / baud as f64).round() as i64 - 1;
    }
    let divisor = divisor.clamp(0, u16::MAX as i64) as u16;
    let reference = if four_x { CLOCK_4X_HZ } else { CLOCK_1X_HZ };
    let achieved = reference / (divisor as f64 + 1.0);
    RateSetup {
        four_x,
        divisor,
        achieved,
        relative_error: (achieved - baud as f64).abs() / baud as f64,
    }
}

struct RxState {
    chunks: VecDeque<Vec<u8>>,
    readahead: Vec<u8>,
}

struct TxState {
    chunks: VecDeque<Vec<u8>>,
    pending: Vec<u8>,
    /// Bytes the board has authorized us to send
    credit: usize,
}

pub(crate) struct UartShared {
    channel: u8,
    /// Pins to release on close, in release order
    owned_pins: Vec<u8>,
    config: UartConfig,
    link: Arc<Link>,
    registry: Arc<HandlerRegistry>,
    board: Weak<BoardShared>,
    handle: u64,
    tokens: Mutex<Vec<SubscriptionToken>>,
    rx: Mutex<RxState>,
    rx_available: Condvar,
    tx: Mutex<TxState>,
    closed: AtomicBool,
}

impl UartShared {
    fn on_data(&self, data: Vec<u8>) {
        if self.closed.load(Ordering::SeqCst) {
            trace!("dropping {} bytes for closed uart {}", data.len(), self.channel);
            return;
        }
        trace!("uart {} received {} bytes", self.channel, data.len());
        let mut rx = self.rx.lock().unwrap();
        rx.chunks.push_back(data);
        self.rx_available.notify_all();
    }

    fn on_tx_status(&self, bytes_freed: u16) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut tx = self.tx.lock().unwrap();
        tx.credit += bytes_freed as usize;
        debug!(
            "uart {} granted {} transmit bytes, credit now {}",
            self.channel, bytes_freed, tx.credit
        );
        if let Err(e) = self.drain_tx(&mut tx) {
            warn!("uart {} transmit drain failed: {}", self.channel, e);
        }
    }

    fn on_status(&self, open: bool) {
        info!("uart {} reported {}", self.channel, if open { "open" } else { "closed" });
    }

    /// Send queued output while credit lasts, at most 64 bytes per frame
    fn drain_tx(&self, tx: &mut MutexGuard<'_, TxState>) -> Result<()> {
        while tx.credit > 0 && (!tx.pending.is_empty() || !tx.chunks.is_empty()) {
            let budget = tx.credit.min(MAX_UART_PAYLOAD);
            let take = budget.min(tx.pending.len());
            let mut frame: Vec<u8> = tx.pending.drain(..take).collect();
            while frame.len() < budget {
                let Some(chunk) = tx.chunks.pop_front() else {
                    break;
                };
                let room = budget - frame.len();
                if chunk.len() <= room {
                    frame.extend_from_slice(&chunk);
                } else {
                    frame.extend_from_slice(&chunk[..room]);
                    // pending is empty here or the frame would already be full
                    tx.pending = chunk[room..].to_vec();
                }
            }
            if frame.is_empty() {
                break;
            }
            let bytes = commands::uart_data(self.channel, &frame)?;
            self.link.send(&bytes)?;
            tx.credit -= frame.len();
            trace!(
                "uart {} sent {} bytes, credit now {}",
                self.channel,
                frame.len(),
                tx.credit
            );
        }
        Ok(())
    }

    fn output_pending(&self) -> usize {
        let tx = self.tx.lock().unwrap();
        tx.pending.len() + tx.chunks.iter().map(Vec::len).sum::<usize>()
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionLost);
        }
        self.link.check_state()
    }

    /// Idempotent teardown: disable the channel, drop subscriptions,
    /// release the function block and every pin, wake blocked readers
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("closing uart {}", self.channel);
        if self.link.state() == ConnectionState::Connected {
            if let Ok(frame) = commands::uart_close(self.channel) {
                let _ = self.link.send(&frame);
            }
        }
        for token in self.tokens.lock().unwrap().drain(..) {
            self.registry.unsubscribe(token);
        }
        if let Some(board) = self.board.upgrade() {
            board.release_uart(self.handle, &self.owned_pins, self.channel);
        }
        // Hold the queue lock so a reader between its predicate check and
        // its condvar wait cannot miss this wakeup
        let _rx = self.rx.lock().unwrap();
        self.rx_available.notify_all();
    }
}

impl ForceClose for UartShared {
    fn force_close(&self) {
        self.close();
    }
}

/// An open UART serial channel
///
/// Closing (explicitly or by drop) releases the function block, its pins
/// and its event subscriptions; afterwards every operation fails with
/// [`Error::ConnectionLost`]. Close is safe to call more than once.
pub struct Uart {
    pub(crate) shared: Arc<UartShared>,
}

impl Uart {
    /// Register subscriptions and send the pin-role and channel
    /// configuration frames. Pin and function-block allocation (and the
    /// rollback on failure) is the caller's job.
    pub(crate) fn open(
        link: Arc<Link>,
        registry: Arc<HandlerRegistry>,
        board: Weak<BoardShared>,
        handle: u64,
        channel: u8,
        pins: UartPins,
        config: &UartConfig,
    ) -> Result<Self> {
        let flow = config.flow;
        let mut owned_pins = Vec::new();
        if flow.uses_rts_cts() {
            owned_pins.extend(pins.rts);
            owned_pins.extend(pins.cts);
        }
        owned_pins.extend(pins.rx);
        owned_pins.extend(pins.tx);

        let shared = Arc::new(UartShared {
            channel,
            owned_pins,
            config: config.clone(),
            link,
            registry: Arc::clone(&registry),
            board,
            handle,
            tokens: Mutex::new(Vec::new()),
            rx: Mutex::new(RxState {
                chunks: VecDeque::new(),
                readahead: Vec::new(),
            }),
            rx_available: Condvar::new(),
            tx: Mutex::new(TxState {
                chunks: VecDeque::new(),
                pending: Vec::new(),
                credit: 0,
            }),
            closed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&shared);
        let data_token = registry.subscribe(EventKind::UartData, channel, move |event| {
            if let Some(uart) = weak.upgrade() {
                if let Event::UartData { data, .. } = event {
                    uart.on_data(data.clone());
                }
            }
        });
        let weak = Arc::downgrade(&shared);
        let tx_token = registry.subscribe(EventKind::UartTxStatus, channel, move |event| {
            if let Some(uart) = weak.upgrade() {
                if let Event::UartTxStatus { bytes_freed, .. } = event {
                    uart.on_tx_status(*bytes_freed);
                }
            }
        });
        let weak = Arc::downgrade(&shared);
        let open_token = registry.subscribe(EventKind::UartOpened, channel, move |_| {
            if let Some(uart) = weak.upgrade() {
                uart.on_status(true);
            }
        });
        let weak = Arc::downgrade(&shared);
        let close_token = registry.subscribe(EventKind::UartClosed, channel, move |_| {
            if let Some(uart) = weak.upgrade() {
                uart.on_status(false);
            }
        });
        shared
            .tokens
            .lock()
            .unwrap()
            .extend([data_token, tx_token, open_token, close_token]);

        let uart = Uart {
            shared: Arc::clone(&shared),
        };
        uart.configure(&pins, config).inspect_err(|_| {
            // Roll back the registrations; the caller rolls back resources
            for token in shared.tokens.lock().unwrap().drain(..) {
                registry.unsubscribe(token);
            }
            shared.closed.store(true, Ordering::SeqCst);
        })?;
        Ok(uart)
    }

    fn configure(&self, pins: &UartPins, config: &UartConfig) -> Result<()> {
        let shared = &self.shared;
        let channel = shared.channel;
        let flow = config.flow;

        // RTS/CTS first so unsupported firmware lets RX/TX override
        if flow.uses_rts_cts() {
            if let Some(rts) = pins.rts {
                shared
                    .link
                    .send(&commands::set_pin_uart(Pin::Num(rts), channel, true, true, true)?)?;
            }
            if let Some(cts) = pins.cts {
                shared
                    .link
                    .send(&commands::set_pin_uart(Pin::Num(cts), channel, false, true, true)?)?;
            }
        }
        if let Some(rx) = pins.rx {
            shared
                .link
                .send(&commands::set_pin_uart(Pin::Num(rx), channel, false, false, true)?)?;
        }
        if let Some(tx) = pins.tx {
            shared
                .link
                .send(&commands::set_pin_uart(Pin::Num(tx), channel, true, false, true)?)?;
        }

        let rate = derive_rate(config.baud, flow);
        if rate.relative_error >= BAUD_ERROR_THRESHOLD {
            warn!(
                "true baud {:.1} != requested baud {}: {:.2}% error",
                rate.achieved,
                config.baud,
                rate.relative_error * 100.0
            );
        }
        info!(
            "uart {}: baud {} -> 4x={} divisor={} stop={:?} parity={:?} flow={:?}",
            channel, config.baud, rate.four_x, rate.divisor, config.stop_bits, config.parity, flow
        );
        shared.link.send(&commands::uart_config(
            channel,
            rate.divisor,
            rate.four_x,
            config.stop_bits,
            config.parity,
            flow,
        )?)?;
        Ok(())
    }

    /// Allocated function-block instance index
    pub fn channel(&self) -> u8 {
        self.shared.channel
    }

    /// Line configuration this channel was opened with
    pub fn config(&self) -> &UartConfig {
        &self.shared.config
    }

    /// Drain whatever has arrived without blocking
    pub fn read_available(&self) -> Result<Vec<u8>> {
        self.shared.ensure_usable()?;
        let mut rx = self.shared.rx.lock().unwrap();
        let mut out = std::mem::take(&mut rx.readahead);
        while let Some(chunk) = rx.chunks.pop_front() {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Read exactly `len` bytes, blocking per missing chunk
    ///
    /// The timeout applies to each queue wait, not the whole read, so a
    /// slow trickle can take longer than `timeout` in total. On timeout
    /// (or close) the bytes collected so far are returned.
    pub fn read(&self, len: usize, timeout: Option<Duration>) -> Result<Vec<u8>> {
        self.shared.ensure_usable()?;
        let shared = &self.shared;
        let mut out = Vec::with_capacity(len);

        let mut rx = shared.rx.lock().unwrap();
        let take = len.min(rx.readahead.len());
        out.extend(rx.readahead.drain(..take));

        while out.len() < len {
            if rx.chunks.is_empty() {
                let wait_done = |state: &mut RxState| {
                    state.chunks.is_empty() && !shared.closed.load(Ordering::SeqCst)
                };
                match timeout {
                    Some(t) => {
                        let (guard, result) = shared
                            .rx_available
                            .wait_timeout_while(rx, t, wait_done)
                            .unwrap();
                        rx = guard;
                        if result.timed_out() && rx.chunks.is_empty() {
                            debug!("uart {} read timed out with {} of {} bytes", shared.channel, out.len(), len);
                            break;
                        }
                    }
                    None => {
                        rx = shared.rx_available.wait_while(rx, wait_done).unwrap();
                    }
                }
                if rx.chunks.is_empty() {
                    // woken by close
                    break;
                }
            }
            let chunk = rx.chunks.pop_front().expect("chunk queue checked non-empty");
            let need = len - out.len();
            if chunk.len() <= need {
                out.extend_from_slice(&chunk);
            } else {
                out.extend_from_slice(&chunk[..need]);
                rx.readahead = chunk[need..].to_vec();
            }
        }
        Ok(out)
    }

    /// Queue `data` for transmission; never blocks on the device
    ///
    /// Bytes are sent immediately up to the available transmit credit; the
    /// rest drains as the board grants more.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.shared.ensure_usable()?;
        if data.is_empty() {
            return Ok(());
        }
        let mut tx = self.shared.tx.lock().unwrap();
        tx.chunks.push_back(data.to_vec());
        self.shared.drain_tx(&mut tx)
    }

    /// Bytes queued but not yet sent to the board
    pub fn output_pending(&self) -> usize {
        self.shared.output_pending()
    }

    /// Block until the transmit queue and remainder are empty
    pub fn flush(&self) -> Result<()> {
        loop {
            self.shared.ensure_usable()?;
            let pending = self.shared.output_pending();
            if pending == 0 {
                return Ok(());
            }
            info!("waiting for uart {} output to drain ({} bytes)", self.shared.channel, pending);
            thread::sleep(FLUSH_POLL);
        }
    }

    /// Close the channel and release everything it holds; idempotent
    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for Uart {
    fn drop(&mut self) {
        self.shared.close();
    }
}


/// Property: cumulative bytes sent never exceed cumulative credit granted,
/// no matter how writes and credit grants interleave.
#[cfg(test)]
mod proptests {
    use super::tests_support::*;
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Write(Vec<u8>),
        Grant(u16),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            proptest::collection::vec(any::<u8>(), 1..200).prop_map(Op::Write),
            (0u16..300).prop_map(Op::Grant),
        ]
    }

    proptest! {
        #[test]
        fn prop_sent_never_exceeds_granted(ops in proptest::collection::vec(op_strategy(), 1..40)) {
            let (transport, uart) = open_plain_uart();

            let mut granted: usize = 0;
            let mut written: usize = 0;
            for op in ops {
                match op {
                    Op::Write(data) => {
                        written += data.len();
                        uart.write(&data).unwrap();
                    }
                    Op::Grant(credit) => {
                        granted += credit as usize;
                        uart.shared.on_tx_status(credit);
                    }
                }
                let sent = total_sent(&transport);
                prop_assert!(sent <= granted, "sent {} > granted {}", sent, granted);
                prop_assert!(sent <= written);
            }

            // Nothing is lost either: queued + sent covers every write
            let sent = total_sent(&transport);
            prop_assert_eq!(sent + uart.output_pending(), written);
        }
    }
}
