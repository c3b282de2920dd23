//! Inbound frame decoding
//!
//! The wire format is one opcode byte followed by a fixed or length-prefixed
//! payload; there is no self-describing frame length. Every recognized
//! opcode must therefore be consumed in full even when its subsystem is not
//! handled, or every later frame is misparsed. Opcodes with no defined
//! layout are unrecoverable: the caller is expected to drop the connection.
//!
//! [`FrameReader`] is stateful because analog status frames have no length
//! field at all; their size is fixed by the most recent analog format frame.

use std::io::Read;

use crate::error::{ProtocolError, Result};
use crate::opcode;

/// One decoded inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Connection handshake with the three firmware identity fields
    Established {
        hardware_id: [u8; 8],
        bootloader_id: [u8; 8],
        firmware_id: [u8; 8],
    },
    /// Board reset all of its configuration
    SoftReset,
    /// Board accepted a graceful shutdown
    SoftClose,
    /// Response to an interface check
    InterfaceResponse { supported: bool },
    /// Level report for a digital input pin
    DigitalInStatus { pin: u8, level: bool },
    /// Echo of a change-notification toggle
    ChangeNotify { pin: u8, enabled: bool },
    /// A UART channel opened or closed on the board
    UartStatus { channel: u8, open: bool },
    /// Bytes received on a UART channel
    UartData { channel: u8, data: Vec<u8> },
    /// Additional transmit buffer space freed on a UART channel
    UartTxStatus { channel: u8, bytes_freed: u16 },
    /// A frame from an unhandled subsystem, consumed to keep the stream in
    /// sync but carrying no data
    Skipped { opcode: u8 },
}

fn read_u8<R: Read>(r: &mut R) -> Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_array<R: Read, const N: usize>(r: &mut R) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_vec<R: Read>(r: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn skip<R: Read>(r: &mut R, len: usize) -> Result<()> {
    if len > 0 {
        read_vec(r, len)?;
    }
    Ok(())
}

/// Stateful decoder for the inbound byte stream
#[derive(Debug, Default)]
pub struct FrameReader {
    /// Pins in the current analog report frame, from the last format frame
    analog_pins: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read one opcode byte and decode its frame
    pub fn read_event<R: Read>(&mut self, r: &mut R) -> Result<Event> {
        let op = read_u8(r)?;
        self.decode_frame(op, r)
    }

    /// Decode the payload of `opcode`, consuming exactly its frame length
    pub fn decode_frame<R: Read>(&mut self, op: u8, r: &mut R) -> Result<Event> {
        match op {
            opcode::ESTABLISH_CONNECTION => {
                let magic: [u8; 4] = read_array(r)?;
                if &magic != opcode::MAGIC {
                    return Err(ProtocolError::BadMagic);
                }
                Ok(Event::Established {
                    hardware_id: read_array(r)?,
                    bootloader_id: read_array(r)?,
                    firmware_id: read_array(r)?,
                })
            }

            opcode::SOFT_RESET => Ok(Event::SoftReset),

            opcode::CHECK_INTERFACE_RESPONSE => {
                let b = read_u8(r)?;
                Ok(Event::InterfaceResponse {
                    supported: b & 0x01 == 1,
                })
            }

            opcode::REPORT_DIGITAL_IN_STATUS => {
                let b = read_u8(r)?;
                Ok(Event::DigitalInStatus {
                    pin: b >> 2,
                    level: b & 0x01 == 1,
                })
            }

            opcode::SET_CHANGE_NOTIFY => {
                let b = read_u8(r)?;
                Ok(Event::ChangeNotify {
                    pin: b >> 2,
                    enabled: b & 0x01 == 1,
                })
            }

            opcode::REPORT_ANALOG_IN_STATUS => {
                // One value byte per pin plus a packed header byte per four
                // pins; the pin list comes from the last format frame.
                let n = self.analog_pins.len();
                skip(r, n + n.div_ceil(4))?;
                Ok(Event::Skipped { opcode: op })
            }

            opcode::REPORT_ANALOG_IN_FORMAT => {
                let n = read_u8(r)? as usize;
                self.analog_pins = read_vec(r, n)?;
                Ok(Event::Skipped { opcode: op })
            }

            opcode::UART_STATUS => {
                let b = read_u8(r)?;
                Ok(Event::UartStatus {
                    channel: b & 0x03,
                    open: b & 0x80 != 0,
                })
            }

            opcode::UART_DATA => {
                let b = read_u8(r)?;
                let len = (b & 0x3F) as usize + 1;
                Ok(Event::UartData {
                    channel: b >> 6,
                    data: read_vec(r, len)?,
                })
            }

            opcode::UART_REPORT_TX_STATUS => {
                let b1 = read_u8(r)?;
                let b2 = read_u8(r)?;
                Ok(Event::UartTxStatus {
                    channel: b1 & 0x03,
                    bytes_freed: (b1 >> 2) as u16 | (b2 as u16) << 6,
                })
            }

            opcode::SPI_DATA => {
                let b1 = read_u8(r)?;
                let _ss_pin = read_u8(r)?;
                skip(r, (b1 & 0x3F) as usize + 1)?;
                Ok(Event::Skipped { opcode: op })
            }

            opcode::I2C_RESULT => {
                let _channel = read_u8(r)?;
                let len = read_u8(r)?;
                // 0xFF signals a failed transaction with no data bytes
                if len != 0xFF {
                    skip(r, len as usize)?;
                }
                Ok(Event::Skipped { opcode: op })
            }

            opcode::INCAP_REPORT => {
                let b = read_u8(r)?;
                let len = match b >> 6 {
                    0 => 4,
                    n => n as usize,
                };
                skip(r, len)?;
                Ok(Event::Skipped { opcode: op })
            }

            // One status byte: open/close flag plus instance index
            opcode::SPI_STATUS | opcode::I2C_STATUS | opcode::ICSP_CONFIG
            | opcode::INCAP_STATUS => {
                skip(r, 1)?;
                Ok(Event::Skipped { opcode: op })
            }

            // Two-byte reports: remaining-byte counters and register reads
            opcode::SPI_REPORT_TX_STATUS
            | opcode::I2C_REPORT_TX_STATUS
            | opcode::ICSP_REPORT_RX_STATUS
            | opcode::ICSP_RESULT => {
                skip(r, 2)?;
                Ok(Event::Skipped { opcode: op })
            }

            opcode::SOFT_CLOSE => Ok(Event::SoftClose),

            _ => Err(ProtocolError::UnknownOpcode(op)),
        }
    }
}
