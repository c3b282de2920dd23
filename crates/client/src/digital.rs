//! Digital input and output pin objects
//!
//! Thin wrappers over the protocol engine and resource tracker: a digital
//! output sends level frames, a digital input listens for change-notify
//! reports. All allocation happens in the facade; these objects release
//! their pin on close.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use common::{Error, Result};
use protocol::{commands, DigitalInMode, DigitalOutMode, Event, Pin};
use tracing::{debug, trace};

use crate::board::{BoardShared, ForceClose};
use crate::engine::{ConnectionState, Link};
use crate::registry::{EventKind, HandlerRegistry, SubscriptionToken};

pub(crate) struct DigitalOutShared {
    pin: Pin,
    link: Arc<Link>,
    board: Weak<BoardShared>,
    handle: u64,
    closed: AtomicBool,
}

impl DigitalOutShared {
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(board) = self.board.upgrade() {
            board.release_pin(self.handle, self.pin.index());
        }
    }
}

impl ForceClose for DigitalOutShared {
    fn force_close(&self) {
        self.close();
    }
}

/// A pin configured as a digital output
pub struct DigitalOutput {
    pub(crate) shared: Arc<DigitalOutShared>,
}

impl DigitalOutput {
    pub(crate) fn open(
        link: Arc<Link>,
        board: Weak<BoardShared>,
        handle: u64,
        pin: Pin,
        mode: DigitalOutMode,
        start_value: bool,
    ) -> Result<Self> {
        link.send(&commands::set_pin_digital_out(pin, mode, start_value))?;
        Ok(Self {
            shared: Arc::new(DigitalOutShared {
                pin,
                link,
                board,
                handle,
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn pin(&self) -> Pin {
        self.shared.pin
    }

    /// Drive the pin high or low
    pub fn write(&self, level: bool) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionLost);
        }
        self.shared.link.check_state()?;
        self.shared
            .link
            .send(&commands::set_digital_out_level(self.shared.pin, level))
    }

    /// Release the pin; idempotent
    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for DigitalOutput {
    fn drop(&mut self) {
        self.shared.close();
    }
}

struct InState {
    level: Option<bool>,
    /// Echo of the last change-notify toggle we sent
    notify_enabled: Option<bool>,
}

pub(crate) struct DigitalInShared {
    pin: Pin,
    link: Arc<Link>,
    registry: Arc<HandlerRegistry>,
    board: Weak<BoardShared>,
    handle: u64,
    tokens: Mutex<Vec<SubscriptionToken>>,
    state: Mutex<InState>,
    changed: Condvar,
    closed: AtomicBool,
}

impl DigitalInShared {
    fn on_status(&self, level: bool) {
        trace!("digital in {} reported level {}", self.pin, level);
        let mut state = self.state.lock().unwrap();
        state.level = Some(level);
        self.changed.notify_all();
    }

    fn on_change_notify(&self, enabled: bool) {
        debug!("change notify echo for pin {}: {}", self.pin, enabled);
        self.state.lock().unwrap().notify_enabled = Some(enabled);
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionLost);
        }
        self.link.check_state()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.link.state() == ConnectionState::Connected {
            let _ = self
                .link
                .send(&commands::set_change_notify(self.pin, false));
        }
        for token in self.tokens.lock().unwrap().drain(..) {
            self.registry.unsubscribe(token);
        }
        if let Some(board) = self.board.upgrade() {
            board.release_pin(self.handle, self.pin.index());
        }
        // Hold the state lock so a waiter between its predicate check and
        // its condvar wait cannot miss this wakeup
        let _state = self.state.lock().unwrap();
        self.changed.notify_all();
    }
}

impl ForceClose for DigitalInShared {
    fn force_close(&self) {
        self.close();
    }
}

/// A pin configured as a digital input with change notification
///
/// The board pushes level reports; reads only consult the latest report
/// and never poll the device.
pub struct DigitalInput {
    pub(crate) shared: Arc<DigitalInShared>,
}

impl DigitalInput {
    pub(crate) fn open(
        link: Arc<Link>,
        registry: Arc<HandlerRegistry>,
        board: Weak<BoardShared>,
        handle: u64,
        pin: Pin,
        mode: DigitalInMode,
    ) -> Result<Self> {
        let shared = Arc::new(DigitalInShared {
            pin,
            link,
            registry: Arc::clone(&registry),
            board,
            handle,
            tokens: Mutex::new(Vec::new()),
            state: Mutex::new(InState {
                level: None,
                notify_enabled: None,
            }),
            changed: Condvar::new(),
            closed: AtomicBool::new(false),
        });

        // Two kinds against the same pin index
        let weak = Arc::downgrade(&shared);
        let notify_token =
            registry.subscribe(EventKind::ChangeNotify, pin.index(), move |event| {
                if let Some(input) = weak.upgrade() {
                    if let Event::ChangeNotify { enabled, .. } = event {
                        input.on_change_notify(*enabled);
                    }
                }
            });
        let weak = Arc::downgrade(&shared);
        let status_token =
            registry.subscribe(EventKind::DigitalInStatus, pin.index(), move |event| {
                if let Some(input) = weak.upgrade() {
                    if let Event::DigitalInStatus { level, .. } = event {
                        input.on_status(*level);
                    }
                }
            });
        shared
            .tokens
            .lock()
            .unwrap()
            .extend([notify_token, status_token]);

        let configure = || -> Result<()> {
            shared.link.send(&commands::set_pin_digital_in(pin, mode))?;
            shared.link.send(&commands::set_change_notify(pin, true))?;
            Ok(())
        };
        if let Err(e) = configure() {
            for token in shared.tokens.lock().unwrap().drain(..) {
                registry.unsubscribe(token);
            }
            shared.closed.store(true, Ordering::SeqCst);
            return Err(e);
        }
        Ok(Self { shared })
    }

    pub fn pin(&self) -> Pin {
        self.shared.pin
    }

    /// Latest reported level, waiting up to `timeout` for the first report
    pub fn read(&self, timeout: Duration) -> Result<Option<bool>> {
        self.shared.ensure_usable()?;
        let shared = &self.shared;
        let state = shared.state.lock().unwrap();
        let (state, _) = shared
            .changed
            .wait_timeout_while(state, timeout, |s| {
                s.level.is_none() && !shared.closed.load(Ordering::SeqCst)
            })
            .unwrap();
        Ok(state.level)
    }

    /// Block until the pin reports `level`; false on timeout
    pub fn wait_for_value(&self, level: bool, timeout: Option<Duration>) -> Result<bool> {
        self.shared.ensure_usable()?;
        let shared = &self.shared;
        let not_there = |s: &mut InState| {
            s.level != Some(level) && !shared.closed.load(Ordering::SeqCst)
        };
        let state = shared.state.lock().unwrap();
        let state = match timeout {
            Some(t) => {
                let (guard, _) = shared
                    .changed
                    .wait_timeout_while(state, t, not_there)
                    .unwrap();
                guard
            }
            None => shared.changed.wait_while(state, not_there).unwrap(),
        };
        Ok(state.level == Some(level))
    }

    /// Release the pin and its subscriptions; idempotent
    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for DigitalInput {
    fn drop(&mut self) {
        self.shared.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::MockTransport;
    use common::Transport;
    use std::thread;

    fn connected_link() -> (Arc<MockTransport>, Arc<Link>) {
        let transport = Arc::new(MockTransport::new());
        let link = Arc::new(Link::new(Arc::clone(&transport) as Arc<dyn Transport>));
        link.set_state(ConnectionState::Connected);
        (transport, link)
    }

    #[test]
    fn test_output_open_and_write_frames() {
        let (transport, link) = connected_link();
        let out = DigitalOutput::open(
            link,
            Weak::new(),
            1,
            Pin::Num(5),
            DigitalOutMode::OpenDrain,
            true,
        )
        .unwrap();
        assert_eq!(transport.take_outgoing(), vec![0x03, 0x17]);

        out.write(false).unwrap();
        out.write(true).unwrap();
        assert_eq!(transport.take_outgoing(), vec![0x04, 0x14, 0x04, 0x15]);
    }

    #[test]
    fn test_output_close_rejects_writes() {
        let (_transport, link) = connected_link();
        let out = DigitalOutput::open(
            link,
            Weak::new(),
            1,
            Pin::Led,
            DigitalOutMode::PushPull,
            false,
        )
        .unwrap();
        out.close();
        out.close();
        assert!(matches!(out.write(true), Err(Error::ConnectionLost)));
    }

    #[test]
    fn test_input_registers_two_kinds_for_one_pin() {
        let (transport, link) = connected_link();
        let registry = Arc::new(HandlerRegistry::new());
        let input = DigitalInput::open(
            Arc::clone(&link),
            Arc::clone(&registry),
            Weak::new(),
            1,
            Pin::Num(9),
            DigitalInMode::PullUp,
        )
        .unwrap();
        // pin config then change-notify enable
        assert_eq!(transport.take_outgoing(), vec![0x05, 0x25, 0x06, 0x25]);

        assert_eq!(input.read(Duration::from_millis(20)).unwrap(), None);

        registry.dispatch(
            EventKind::DigitalInStatus,
            9,
            &Event::DigitalInStatus { pin: 9, level: true },
        );
        assert_eq!(input.read(Duration::from_secs(1)).unwrap(), Some(true));

        registry.dispatch(
            EventKind::ChangeNotify,
            9,
            &Event::ChangeNotify { pin: 9, enabled: true },
        );
        assert_eq!(input.shared.state.lock().unwrap().notify_enabled, Some(true));
    }

    #[test]
    fn test_input_wait_for_value() {
        let (_transport, link) = connected_link();
        let registry = Arc::new(HandlerRegistry::new());
        let input = DigitalInput::open(
            link,
            Arc::clone(&registry),
            Weak::new(),
            1,
            Pin::Num(9),
            DigitalInMode::Floating,
        )
        .unwrap();

        assert!(!input.wait_for_value(true, Some(Duration::from_millis(20))).unwrap());

        let registry2 = Arc::clone(&registry);
        let feeder = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            registry2.dispatch(
                EventKind::DigitalInStatus,
                9,
                &Event::DigitalInStatus { pin: 9, level: true },
            );
        });
        assert!(input.wait_for_value(true, Some(Duration::from_secs(5))).unwrap());
        feeder.join().unwrap();
    }

    #[test]
    fn test_input_close_disables_notify() {
        let (transport, link) = connected_link();
        let registry = Arc::new(HandlerRegistry::new());
        let input = DigitalInput::open(
            link,
            registry,
            Weak::new(),
            1,
            Pin::Num(9),
            DigitalInMode::Floating,
        )
        .unwrap();
        transport.take_outgoing();

        input.close();
        assert_eq!(transport.take_outgoing(), vec![0x06, 0x24]);
        input.close();
        assert!(transport.take_outgoing().is_empty());
        assert!(matches!(
            input.read(Duration::from_millis(10)),
            Err(Error::ConnectionLost)
        ));
    }
}
