//! Host-side client for the IOIO I/O expansion board
//!
//! Talks to the board over any reliable ordered byte stream (see
//! [`common::Transport`]). Three subsystems do the real work:
//!
//! - the **protocol engine** ([`engine`]) turns the raw stream into typed
//!   events on a dedicated decode-loop thread and encodes outbound
//!   commands;
//! - the **resource tracker** ([`tracker`]) knows what every pin can do and
//!   who currently owns each pin and function block;
//! - the **serial channel** ([`uart`]) layers a credit-based
//!   flow-controlled byte pipe over one allocated UART instance.
//!
//! [`Board`] wires them together:
//!
//! ```no_run
//! use client::{Board, UartConfig, UartPins};
//! use common::TcpTransport;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn main() -> common::Result<()> {
//! let transport = Arc::new(TcpTransport::connect("10.0.0.5:4000")?);
//! let board = Board::new(transport);
//! board.connect(Duration::from_secs(5))?;
//!
//! let uart = board.open_uart(
//!     UartPins { rx: Some(6), tx: Some(7), ..Default::default() },
//!     UartConfig::new(115_200),
//! )?;
//! uart.write(b"hello")?;
//! # Ok(())
//! # }
//! ```

pub mod board;
pub mod digital;
pub mod engine;
pub mod registry;
pub mod tracker;
pub mod uart;

pub use board::{Board, LIB_VERSION};
pub use digital::{DigitalInput, DigitalOutput};
pub use engine::{ConnectionState, HandshakeIds, ProtocolEngine};
pub use registry::{EventKind, HandlerRegistry, SubscriptionToken};
pub use tracker::{Function, PinTracker};
pub use uart::{Uart, UartConfig, UartPins};
