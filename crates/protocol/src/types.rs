//! Wire-level types shared by command encoders and frame decoding
//!
//! These enums encode directly into the bit fields the firmware expects;
//! the discriminant values are part of the wire format and must not change.

use std::fmt;

/// A board pin, addressed either by number or by the on-board stat LED alias
///
/// The LED is wired to physical pin 0; the alias exists so application code
/// does not need to know that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pin {
    /// The on-board stat LED (physical pin 0)
    Led,
    /// A numbered header pin
    Num(u8),
}

impl Pin {
    /// Physical pin index as encoded on the wire
    pub fn index(self) -> u8 {
        match self {
            Pin::Led => 0,
            Pin::Num(n) => n,
        }
    }
}

impl From<u8> for Pin {
    fn from(n: u8) -> Self {
        Pin::Num(n)
    }
}

impl fmt::Display for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pin::Led => write!(f, "LED"),
            Pin::Num(n) => write!(f, "{}", n),
        }
    }
}

/// Output driver mode for a digital output pin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigitalOutMode {
    /// Actively driven high and low
    PushPull,
    /// Driven low, floating high (wire-AND buses, LEDs to VCC)
    OpenDrain,
}

impl DigitalOutMode {
    pub(crate) fn bit(self) -> u8 {
        match self {
            DigitalOutMode::PushPull => 0,
            DigitalOutMode::OpenDrain => 1,
        }
    }
}

/// Input termination mode for a digital input pin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigitalInMode {
    /// No internal resistor
    Floating,
    /// Internal pull-up
    PullUp,
    /// Internal pull-down
    PullDown,
}

impl DigitalInMode {
    pub(crate) fn bits(self) -> u8 {
        match self {
            DigitalInMode::Floating => 0,
            DigitalInMode::PullUp => 1,
            DigitalInMode::PullDown => 2,
        }
    }
}

/// UART parity setting (low two bits of the config byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

impl Parity {
    pub(crate) fn bits(self) -> u8 {
        match self {
            Parity::None => 0,
            Parity::Even => 1,
            Parity::Odd => 2,
        }
    }
}

/// UART stop bit count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

impl StopBits {
    pub(crate) fn bit(self) -> u8 {
        match self {
            StopBits::One => 0,
            StopBits::Two => 0x04,
        }
    }
}

/// UART flow control mode
///
/// IrDA requires the slower 1 MHz reference clock; RTS/CTS allocates two
/// extra pins. The two-bit value lands in bits 4-5 of the config byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    None,
    Irda,
    RtsCts,
    Rs485,
}

impl FlowControl {
    pub(crate) fn bits(self) -> u8 {
        match self {
            FlowControl::None => 0,
            FlowControl::Irda => 1,
            FlowControl::RtsCts => 2,
            FlowControl::Rs485 => 3,
        }
    }

    /// True for modes that hold RTS/CTS pins
    pub fn uses_rts_cts(self) -> bool {
        matches!(self, FlowControl::RtsCts | FlowControl::Rs485)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_led_alias_is_pin_zero() {
        assert_eq!(Pin::Led.index(), 0);
        assert_eq!(Pin::Num(34).index(), 34);
        assert_eq!(Pin::from(7), Pin::Num(7));
    }

    #[test]
    fn test_flow_control_pin_usage() {
        assert!(!FlowControl::None.uses_rts_cts());
        assert!(!FlowControl::Irda.uses_rts_cts());
        assert!(FlowControl::RtsCts.uses_rts_cts());
        assert!(FlowControl::Rs485.uses_rts_cts());
    }
}
