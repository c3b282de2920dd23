//! Pin and function-block resource tracking
//!
//! Holds the capability table for a hardware variant and the current
//! allocation state of every pin and shared function-block instance. A pin
//! is either available or owned by exactly one function; function-block
//! instances are allocated lowest-index-first so allocation order is
//! deterministic and testable.
//!
//! Free operations never fail: they return a flag instead, so teardown code
//! can run unconditionally.

use std::collections::HashMap;

use common::{Error, Result};
use tracing::{error, warn};

/// Pin can be routed to the analog-to-digital converter
pub const CAP_ANALOG: u8 = 1 << 0;
/// Pin supports peripheral-select input routing
pub const CAP_PERIPHERAL_IN: u8 = 1 << 1;
/// Pin supports peripheral-select output routing
pub const CAP_PERIPHERAL_OUT: u8 = 1 << 2;
/// Pin is wired to an I2C bus
pub const CAP_I2C: u8 = 1 << 3;

/// Function categories a pin or function block can be assigned to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {
    AnalogIn,
    PwmOut,
    InCap,
    Uart,
    Spi,
    Twi,
    DigitalIn,
    DigitalOut,
}

impl Function {
    pub const ALL: [Function; 8] = [
        Function::AnalogIn,
        Function::PwmOut,
        Function::InCap,
        Function::Uart,
        Function::Spi,
        Function::Twi,
        Function::DigitalIn,
        Function::DigitalOut,
    ];

    /// Capability bit a pin must have for this function; None means any pin
    ///
    /// UART and SPI need both input and output routing but are gated on the
    /// output capability only, matching the board's pin groups.
    fn required_capability(self) -> Option<u8> {
        match self {
            Function::AnalogIn => Some(CAP_ANALOG),
            Function::PwmOut => Some(CAP_PERIPHERAL_OUT),
            Function::InCap => Some(CAP_PERIPHERAL_IN),
            Function::Uart => Some(CAP_PERIPHERAL_OUT),
            Function::Spi => Some(CAP_PERIPHERAL_OUT),
            Function::Twi => Some(CAP_I2C),
            Function::DigitalIn | Function::DigitalOut => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PinUse {
    Available,
    InUse(Function),
}

/// Capability table and allocation state for one board
#[derive(Debug)]
pub struct PinTracker {
    caps: HashMap<u8, u8>,
    counts: HashMap<Function, u8>,
    pin_mode: HashMap<u8, PinUse>,
    function_mode: HashMap<Function, Vec<bool>>,
}

/// Capability table for the SPRK0015/SPRK0016 board family
///
/// Pin 0 is the stat LED. Analog input lives on pins 31-46, peripheral
/// routing on 3-7, 10-14 and 27-48, I2C on 4/5, 25/26 and 47/48.
fn sprk_capabilities() -> (HashMap<u8, u8>, HashMap<Function, u8>) {
    let mut caps = HashMap::new();
    for pin in 0..=48u8 {
        let mut bits = 0u8;
        if (31..=46).contains(&pin) {
            bits |= CAP_ANALOG;
        }
        if (3..=7).contains(&pin) || (10..=14).contains(&pin) || (27..=48).contains(&pin) {
            bits |= CAP_PERIPHERAL_IN | CAP_PERIPHERAL_OUT;
        }
        if matches!(pin, 4 | 5 | 25 | 26 | 47 | 48) {
            bits |= CAP_I2C;
        }
        caps.insert(pin, bits);
    }

    let counts = HashMap::from([
        (Function::AnalogIn, 16),
        (Function::PwmOut, 9),
        (Function::InCap, 9),
        (Function::Uart, 4),
        (Function::Spi, 3),
        (Function::Twi, 3),
        (Function::DigitalIn, 48),
        (Function::DigitalOut, 48),
    ]);

    (caps, counts)
}

impl PinTracker {
    /// Build the tracker for a hardware variant
    ///
    /// An unknown variant yields an empty table: every allocation fails.
    pub fn new(hardware_id: &str) -> Self {
        let (caps, counts) = match hardware_id {
            "SPRK0016" | "SPRK0015" => sprk_capabilities(),
            _ => {
                error!("hardware {:?} not in internal database", hardware_id);
                (HashMap::new(), HashMap::new())
            }
        };
        let mut tracker = Self {
            caps,
            counts,
            pin_mode: HashMap::new(),
            function_mode: HashMap::new(),
        };
        tracker.reset();
        tracker
    }

    /// Tracker with no hardware attached; every allocation fails
    pub fn empty() -> Self {
        Self {
            caps: HashMap::new(),
            counts: HashMap::new(),
            pin_mode: HashMap::new(),
            function_mode: HashMap::new(),
        }
    }

    /// Return every pin and function instance to the available state
    ///
    /// Called whenever the connection is (re)established or soft-reset so
    /// stale allocations never survive a device-side reset.
    pub fn reset(&mut self) {
        self.pin_mode = self.caps.keys().map(|&p| (p, PinUse::Available)).collect();
        self.function_mode = Function::ALL
            .iter()
            .map(|&f| {
                let count = self.counts.get(&f).copied().unwrap_or(0);
                (f, vec![false; count as usize])
            })
            .collect();
    }

    /// True if the pin exists on this hardware
    pub fn is_valid(&self, pin: u8) -> bool {
        self.pin_mode.contains_key(&pin)
    }

    /// True if the pin exists and is unallocated
    pub fn is_available(&self, pin: u8) -> bool {
        self.pin_mode.get(&pin) == Some(&PinUse::Available)
    }

    /// True if the pin has the capability `function` requires
    pub fn can_do(&self, pin: u8, function: Function) -> bool {
        match function.required_capability() {
            None => true,
            Some(bit) => self.caps.get(&pin).copied().unwrap_or(0) & bit != 0,
        }
    }

    /// Mark a pin as in use by `function`
    pub fn allocate_pin(&mut self, pin: u8, function: Function) -> Result<()> {
        if !self.is_valid(pin) {
            warn!("invalid pin {}", pin);
            return Err(Error::IllegalArgument(format!("invalid pin {}", pin)));
        }
        if !self.is_available(pin) {
            warn!("pin {} already in use", pin);
            return Err(Error::IllegalArgument(format!("pin {} in use", pin)));
        }
        if !self.can_do(pin, function) {
            warn!("pin {} cannot be used for {:?}", pin, function);
            return Err(Error::IllegalArgument(format!(
                "pin {} cannot be used for {:?}",
                pin, function
            )));
        }
        self.pin_mode.insert(pin, PinUse::InUse(function));
        Ok(())
    }

    /// Free a pin; false (not an error) if the pin is unknown
    pub fn free_pin(&mut self, pin: u8) -> bool {
        match self.pin_mode.get_mut(&pin) {
            Some(state) => {
                *state = PinUse::Available;
                true
            }
            None => {
                warn!("freeing invalid pin {}", pin);
                false
            }
        }
    }

    /// Allocate the lowest-indexed free instance of `function`
    pub fn allocate_function(&mut self, function: Function) -> Result<u8> {
        let instances = self.function_mode.entry(function).or_default();
        match instances.iter().position(|&in_use| !in_use) {
            Some(index) => {
                instances[index] = true;
                Ok(index as u8)
            }
            None => {
                warn!("no free function block of type {:?}", function);
                Err(Error::IllegalArgument(format!(
                    "no free function block of type {:?}",
                    function
                )))
            }
        }
    }

    /// Free a function-block instance; false if the index is unknown
    pub fn free_function(&mut self, function: Function, index: u8) -> bool {
        match self
            .function_mode
            .get_mut(&function)
            .and_then(|v| v.get_mut(index as usize))
        {
            Some(slot) => {
                *slot = false;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowest_free_instance_policy() {
        let mut tracker = PinTracker::new("SPRK0016");

        assert_eq!(tracker.allocate_function(Function::Uart).unwrap(), 0);
        assert_eq!(tracker.allocate_function(Function::Uart).unwrap(), 1);
        assert_eq!(tracker.allocate_function(Function::Uart).unwrap(), 2);
        assert_eq!(tracker.allocate_function(Function::Uart).unwrap(), 3);
        assert!(tracker.allocate_function(Function::Uart).is_err());

        // Freeing 2 while 0, 1, 3 stay in use hands back exactly 2
        assert!(tracker.free_function(Function::Uart, 2));
        assert_eq!(tracker.allocate_function(Function::Uart).unwrap(), 2);

        // Freeing 0 and 2 hands back 0 first
        assert!(tracker.free_function(Function::Uart, 2));
        assert!(tracker.free_function(Function::Uart, 0));
        assert_eq!(tracker.allocate_function(Function::Uart).unwrap(), 0);
    }

    #[test]
    fn test_free_function_unknown_index() {
        let mut tracker = PinTracker::new("SPRK0016");
        assert!(!tracker.free_function(Function::Uart, 200));
        assert!(tracker.free_function(Function::Uart, 3));
    }

    #[test]
    fn test_capability_mismatch_leaves_pin_untouched() {
        let mut tracker = PinTracker::new("SPRK0016");

        // Pin 8 has no peripheral routing, pin 1 no analog, pin 2 no I2C
        for (pin, function) in [
            (8, Function::Uart),
            (1, Function::AnalogIn),
            (2, Function::Twi),
            (8, Function::PwmOut),
        ] {
            assert!(!tracker.can_do(pin, function));
            assert!(matches!(
                tracker.allocate_pin(pin, function),
                Err(Error::IllegalArgument(_))
            ));
            assert!(tracker.is_available(pin));
        }

        // Digital I/O has no capability requirement, even on pin 8
        tracker.allocate_pin(8, Function::DigitalOut).unwrap();
    }

    #[test]
    fn test_pin_reuse_after_free() {
        let mut tracker = PinTracker::new("SPRK0016");

        tracker.allocate_pin(6, Function::Uart).unwrap();
        assert!(matches!(
            tracker.allocate_pin(6, Function::DigitalIn),
            Err(Error::IllegalArgument(_))
        ));
        assert!(tracker.free_pin(6));
        tracker.allocate_pin(6, Function::DigitalIn).unwrap();
    }

    #[test]
    fn test_invalid_pin_rejected_and_free_tolerated() {
        let mut tracker = PinTracker::new("SPRK0016");
        assert!(matches!(
            tracker.allocate_pin(99, Function::DigitalOut),
            Err(Error::IllegalArgument(_))
        ));
        assert!(!tracker.free_pin(99));
    }

    #[test]
    fn test_unknown_hardware_has_empty_table() {
        let mut tracker = PinTracker::new("ACME0001");
        assert!(!tracker.is_valid(0));
        assert!(tracker.allocate_pin(0, Function::DigitalOut).is_err());
        assert!(tracker.allocate_function(Function::Uart).is_err());
        assert!(!tracker.free_pin(0));
    }

    #[test]
    fn test_reset_clears_all_allocations() {
        let mut tracker = PinTracker::new("SPRK0016");
        tracker.allocate_pin(6, Function::Uart).unwrap();
        tracker.allocate_pin(7, Function::Uart).unwrap();
        tracker.allocate_function(Function::Uart).unwrap();
        tracker.allocate_function(Function::Spi).unwrap();

        tracker.reset();
        assert!(tracker.is_available(6));
        assert!(tracker.is_available(7));
        assert_eq!(tracker.allocate_function(Function::Uart).unwrap(), 0);
        assert_eq!(tracker.allocate_function(Function::Spi).unwrap(), 0);
    }

    #[test]
    fn test_analog_pins_accept_analog() {
        let mut tracker = PinTracker::new("SPRK0015");
        tracker.allocate_pin(31, Function::AnalogIn).unwrap();
        tracker.allocate_pin(46, Function::AnalogIn).unwrap();
        tracker.allocate_pin(4, Function::Twi).unwrap();
    }
}
