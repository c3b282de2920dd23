//! Event subscription registry
//!
//! Maps `(event kind, instance index)` to an ordered list of subscriber
//! callbacks. Multiple subscribers per key are allowed (a digital input
//! registers two kinds against one pin; a UART registers four kinds against
//! one channel). Dispatch happens on the decode-loop thread in registration
//! order; callbacks are invoked outside the table lock so a subscriber may
//! register or unregister concurrently without deadlocking.
//!
//! Removal is by token, handed out at registration time. A subscriber being
//! unregistered concurrently with a dispatch may still see one final event.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use protocol::Event;
use tracing::warn;

/// Kinds of dispatched events, keyed together with an instance index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Level report for a digital input pin
    DigitalInStatus,
    /// Echo of a change-notification toggle
    ChangeNotify,
    /// Bytes arrived on a UART channel
    UartData,
    /// Transmit buffer space freed on a UART channel
    UartTxStatus,
    /// UART channel opened on the board
    UartOpened,
    /// UART channel closed on the board
    UartClosed,
}

/// Proof of registration, used for removal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionToken(u64);

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

struct Subscription {
    token: u64,
    handler: Handler,
}

/// Table of event subscribers
#[derive(Default)]
pub struct HandlerRegistry {
    table: Mutex<HashMap<(EventKind, u8), Vec<Subscription>>>,
    next_token: AtomicU64,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `kind` on `index`
    pub fn subscribe<F>(&self, kind: EventKind, index: u8, handler: F) -> SubscriptionToken
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut table = self.table.lock().unwrap();
        table.entry((kind, index)).or_default().push(Subscription {
            token,
            handler: Arc::new(handler),
        });
        SubscriptionToken(token)
    }

    /// Remove a previous registration; false if the token is gone already
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut table = self.table.lock().unwrap();
        for subs in table.values_mut() {
            if let Some(pos) = subs.iter().position(|s| s.token == token.0) {
                subs.remove(pos);
                return true;
            }
        }
        false
    }

    /// Invoke every subscriber for `(kind, index)` in registration order
    ///
    /// A missing key is not an error: the event is logged and dropped.
    pub fn dispatch(&self, kind: EventKind, index: u8, event: &Event) {
        let handlers: Vec<Handler> = {
            let table = self.table.lock().unwrap();
            match table.get(&(kind, index)) {
                Some(subs) if !subs.is_empty() => {
                    subs.iter().map(|s| Arc::clone(&s.handler)).collect()
                }
                _ => {
                    warn!("no subscriber for {:?} on index {}, dropping event", kind, index);
                    return;
                }
            }
        };
        for handler in handlers {
            handler(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_dispatch_in_registration_order() {
        let registry = HandlerRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for id in 0..3 {
            let order = Arc::clone(&order);
            registry.subscribe(EventKind::UartData, 1, move |_| {
                order.lock().unwrap().push(id);
            });
        }

        registry.dispatch(
            EventKind::UartData,
            1,
            &Event::UartData {
                channel: 1,
                data: vec![0],
            },
        );
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_dispatch_is_keyed_by_kind_and_index() {
        let registry = HandlerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        registry.subscribe(EventKind::DigitalInStatus, 5, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        let event = Event::DigitalInStatus { pin: 5, level: true };
        registry.dispatch(EventKind::DigitalInStatus, 5, &event);
        registry.dispatch(EventKind::DigitalInStatus, 6, &event);
        registry.dispatch(EventKind::ChangeNotify, 5, &event);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_by_token() {
        let registry = HandlerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        let keep = registry.subscribe(EventKind::UartTxStatus, 0, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let h = Arc::clone(&hits);
        let drop_me = registry.subscribe(EventKind::UartTxStatus, 0, move |_| {
            h.fetch_add(10, Ordering::SeqCst);
        });

        assert!(registry.unsubscribe(drop_me));
        assert!(!registry.unsubscribe(drop_me));

        registry.dispatch(
            EventKind::UartTxStatus,
            0,
            &Event::UartTxStatus {
                channel: 0,
                bytes_freed: 64,
            },
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(registry.unsubscribe(keep));
    }

    #[test]
    fn test_dispatch_without_subscribers_is_harmless() {
        let registry = HandlerRegistry::new();
        registry.dispatch(
            EventKind::UartClosed,
            3,
            &Event::UartStatus {
                channel: 3,
                open: false,
            },
        );
    }
}
