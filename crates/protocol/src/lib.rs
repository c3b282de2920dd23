//! Wire protocol for the IOIO I/O expansion board
//!
//! This crate defines the byte-level protocol spoken over the board's
//! duplex stream: opcode constants, bit-packed outbound command encoders,
//! and a stateful decoder turning the inbound stream into typed events.
//! It performs no I/O of its own beyond reading from a caller-supplied
//! [`std::io::Read`].
//!
//! # Example
//!
//! ```
//! use protocol::{commands, DigitalOutMode, Pin};
//!
//! // Configure pin 5 as an open-drain output driven high
//! let frame = commands::set_pin_digital_out(Pin::Num(5), DigitalOutMode::OpenDrain, true);
//! assert_eq!(frame, [0x03, 0x17]);
//! ```
//!
//! # Decoding
//!
//! ```
//! use protocol::{Event, FrameReader};
//! use std::io::Cursor;
//!
//! let mut reader = FrameReader::new();
//! let mut stream = Cursor::new(vec![0x0E, 0x02, b'a', b'b', b'c']);
//! let event = reader.read_event(&mut stream).unwrap();
//! assert_eq!(event, Event::UartData { channel: 0, data: b"abc".to_vec() });
//! ```

pub mod commands;
pub mod error;
pub mod frames;
pub mod opcode;
pub mod types;

pub use commands::{MAX_UART_PAYLOAD, UART_CHANNEL_COUNT};
pub use error::{ProtocolError, Result};
pub use frames::{Event, FrameReader};
pub use types::{DigitalInMode, DigitalOutMode, FlowControl, Parity, Pin, StopBits};
