//! Outbound command frame encoders
//!
//! Every function returns the exact byte sequence the firmware expects.
//! Commands pack the target index and flags into single bytes; nothing here
//! performs I/O, so encoders can be unit-tested against known byte strings.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{ProtocolError, Result};
use crate::opcode;
use crate::types::{DigitalInMode, DigitalOutMode, FlowControl, Parity, Pin, StopBits};

/// Largest payload a single UART data frame can carry
pub const MAX_UART_PAYLOAD: usize = 64;

/// Number of UART channels addressable by the 2-bit channel field
pub const UART_CHANNEL_COUNT: u8 = 4;

fn check_channel(channel: u8) -> Result<()> {
    if channel >= UART_CHANNEL_COUNT {
        return Err(ProtocolError::InvalidChannel(channel));
    }
    Ok(())
}

/// Reset the board back to its bootloader
pub fn hard_reset() -> [u8; 5] {
    let m = opcode::MAGIC;
    [opcode::HARD_RESET, m[0], m[1], m[2], m[3]]
}

/// Reset all board configuration to its startup state
pub fn soft_reset() -> [u8; 1] {
    [opcode::SOFT_RESET]
}

/// Request a graceful connection shutdown
pub fn soft_close() -> [u8; 1] {
    [opcode::SOFT_CLOSE]
}

/// Configure a pin as a digital output with an initial level
pub fn set_pin_digital_out(pin: Pin, mode: DigitalOutMode, value: bool) -> [u8; 2] {
    let value = if value { 0x02 } else { 0 };
    [
        opcode::SET_PIN_DIGITAL_OUT,
        pin.index() << 2 | value | mode.bit(),
    ]
}

/// Set the level of a pin already configured as a digital output
pub fn set_digital_out_level(pin: Pin, level: bool) -> [u8; 2] {
    let level = if level { 0x01 } else { 0 };
    [opcode::SET_DIGITAL_OUT_LEVEL, pin.index() << 2 | level]
}

/// Configure a pin as a digital input
pub fn set_pin_digital_in(pin: Pin, mode: DigitalInMode) -> [u8; 2] {
    [opcode::SET_PIN_DIGITAL_IN, pin.index() << 2 | mode.bits()]
}

/// Enable or disable change notification for an input pin
pub fn set_change_notify(pin: Pin, enable: bool) -> [u8; 2] {
    let enable = if enable { 0x01 } else { 0 };
    [opcode::SET_CHANGE_NOTIFY, pin.index() << 2 | enable]
}

/// Configure a UART channel
///
/// `divisor` is the rate divisor for the selected reference clock; `four_x`
/// selects the 4 MHz 4x-oversampling clock over the 1 MHz one.
pub fn uart_config(
    channel: u8,
    divisor: u16,
    four_x: bool,
    stop_bits: StopBits,
    parity: Parity,
    flow: FlowControl,
) -> Result<[u8; 4]> {
    check_channel(channel)?;
    let four_x = if four_x { 0x08 } else { 0 };
    let conf = channel << 6 | flow.bits() << 4 | four_x | stop_bits.bit() | parity.bits();
    let mut frame = [opcode::UART_CONFIG, conf, 0, 0];
    LittleEndian::write_u16(&mut frame[2..], divisor);
    Ok(frame)
}

/// Disable a UART channel
pub fn uart_close(channel: u8) -> Result<[u8; 4]> {
    check_channel(channel)?;
    Ok([opcode::UART_CONFIG, channel << 6, 0, 0])
}

/// Assign a pin a role on a UART channel
///
/// With `flow` set, `tx` selects RTS (output) over CTS (input); without it,
/// `tx` selects the transmit line over the receive line.
pub fn set_pin_uart(pin: Pin, channel: u8, tx: bool, flow: bool, enable: bool) -> Result<[u8; 3]> {
    check_channel(channel)?;
    let enable = if enable { 0x80 } else { 0 };
    let tx = if tx { 0x40 } else { 0 };
    let flow = if flow { 0x20 } else { 0 };
    Ok([
        opcode::SET_PIN_UART,
        pin.index(),
        enable | tx | flow | channel,
    ])
}

/// Encode one UART data frame (1-64 payload bytes)
///
/// Oversized or empty payloads are rejected here rather than sent as a
/// malformed frame; the length field on the wire is `len - 1`.
pub fn uart_data(channel: u8, data: &[u8]) -> Result<Vec<u8>> {
    check_channel(channel)?;
    if data.is_empty() || data.len() > MAX_UART_PAYLOAD {
        return Err(ProtocolError::BadPayloadSize(data.len()));
    }
    let mut frame = Vec::with_capacity(2 + data.len());
    frame.push(opcode::UART_DATA);
    frame.push(channel << 6 | (data.len() - 1) as u8);
    frame.extend_from_slice(data);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hard_reset_carries_magic() {
        assert_eq!(hard_reset(), [0x00, b'I', b'O', b'I', b'O']);
    }

    #[test]
    fn test_set_pin_digital_out_bit_packing() {
        // pin 5 -> 0x14, value bit 0x02, open-drain bit 0x01
        assert_eq!(
            set_pin_digital_out(Pin::Num(5), DigitalOutMode::OpenDrain, true),
            [0x03, 0x17]
        );
        assert_eq!(
            set_pin_digital_out(Pin::Num(5), DigitalOutMode::PushPull, false),
            [0x03, 0x14]
        );
    }

    #[test]
    fn test_led_alias_maps_to_pin_zero() {
        assert_eq!(set_digital_out_level(Pin::Led, true), [0x04, 0x01]);
        assert_eq!(
            set_pin_digital_out(Pin::Led, DigitalOutMode::PushPull, true),
            [0x03, 0x02]
        );
    }

    #[test]
    fn test_set_digital_out_level() {
        assert_eq!(set_digital_out_level(Pin::Num(3), true), [0x04, 0x0D]);
        assert_eq!(set_digital_out_level(Pin::Num(3), false), [0x04, 0x0C]);
    }

    #[test]
    fn test_set_pin_digital_in_modes() {
        assert_eq!(
            set_pin_digital_in(Pin::Num(6), DigitalInMode::Floating),
            [0x05, 0x18]
        );
        assert_eq!(
            set_pin_digital_in(Pin::Num(6), DigitalInMode::PullUp),
            [0x05, 0x19]
        );
        assert_eq!(
            set_pin_digital_in(Pin::Num(6), DigitalInMode::PullDown),
            [0x05, 0x1A]
        );
    }

    #[test]
    fn test_uart_config_fields() {
        // channel 1, divisor 34, 4x clock, one stop bit, no parity, no flow
        let frame = uart_config(1, 34, true, StopBits::One, Parity::None, FlowControl::None)
            .unwrap();
        assert_eq!(frame, [0x0D, 0x48, 34, 0]);

        // divisor is little-endian
        let frame = uart_config(0, 0x0102, false, StopBits::Two, Parity::Odd, FlowControl::Irda)
            .unwrap();
        assert_eq!(frame, [0x0D, 0x16, 0x02, 0x01]);
    }

    #[test]
    fn test_uart_close_zeroes_config() {
        assert_eq!(uart_close(2).unwrap(), [0x0D, 0x80, 0, 0]);
    }

    #[test]
    fn test_set_pin_uart_roles() {
        // rx pin: not tx, not flow
        assert_eq!(
            set_pin_uart(Pin::Num(6), 0, false, false, true).unwrap(),
            [0x0F, 6, 0x80]
        );
        // rts pin on channel 1: tx + flow
        assert_eq!(
            set_pin_uart(Pin::Num(46), 1, true, true, true).unwrap(),
            [0x0F, 46, 0xE1]
        );
        // disable
        assert_eq!(
            set_pin_uart(Pin::Num(7), 3, true, false, false).unwrap(),
            [0x0F, 7, 0x43]
        );
    }

    #[test]
    fn test_uart_data_header() {
        let frame = uart_data(1, b"hello").unwrap();
        assert_eq!(frame[0], 0x0E);
        assert_eq!(frame[1], 1 << 6 | 4);
        assert_eq!(&frame[2..], b"hello");
    }

    #[test]
    fn test_uart_data_rejects_bad_sizes() {
        assert!(matches!(
            uart_data(0, &[]),
            Err(ProtocolError::BadPayloadSize(0))
        ));
        assert!(matches!(
            uart_data(0, &[0u8; 65]),
            Err(ProtocolError::BadPayloadSize(65))
        ));
        // 64 bytes is the maximum and must pass
        let frame = uart_data(0, &[0xAA; 64]).unwrap();
        assert_eq!(frame[1], 63);
        assert_eq!(frame.len(), 66);
    }

    #[test]
    fn test_invalid_channel_rejected() {
        assert!(matches!(
            uart_data(4, b"x"),
            Err(ProtocolError::InvalidChannel(4))
        ));
        assert!(uart_close(4).is_err());
        assert!(set_pin_uart(Pin::Num(1), 4, false, false, true).is_err());
    }
}
