//! Wire opcode constants
//!
//! Several opcode values carry a different meaning depending on direction;
//! both names are kept so call sites read like the frame they handle.

pub const HARD_RESET: u8 = 0x00;
pub const ESTABLISH_CONNECTION: u8 = 0x00;
pub const SOFT_RESET: u8 = 0x01;
pub const CHECK_INTERFACE: u8 = 0x02;
pub const CHECK_INTERFACE_RESPONSE: u8 = 0x02;
pub const SET_PIN_DIGITAL_OUT: u8 = 0x03;
pub const SET_DIGITAL_OUT_LEVEL: u8 = 0x04;
pub const REPORT_DIGITAL_IN_STATUS: u8 = 0x04;
pub const SET_PIN_DIGITAL_IN: u8 = 0x05;
pub const REPORT_PERIODIC_DIGITAL_IN_STATUS: u8 = 0x05;
pub const SET_CHANGE_NOTIFY: u8 = 0x06;
pub const REGISTER_PERIODIC_DIGITAL_SAMPLING: u8 = 0x07;
pub const SET_PIN_PWM: u8 = 0x08;
pub const SET_PWM_DUTY_CYCLE: u8 = 0x09;
pub const SET_PWM_PERIOD: u8 = 0x0A;
pub const SET_PIN_ANALOG_IN: u8 = 0x0B;
pub const REPORT_ANALOG_IN_STATUS: u8 = 0x0B;
pub const SET_ANALOG_IN_SAMPLING: u8 = 0x0C;
pub const REPORT_ANALOG_IN_FORMAT: u8 = 0x0C;
pub const UART_CONFIG: u8 = 0x0D;
pub const UART_STATUS: u8 = 0x0D;
pub const UART_DATA: u8 = 0x0E;
pub const SET_PIN_UART: u8 = 0x0F;
pub const UART_REPORT_TX_STATUS: u8 = 0x0F;
pub const SPI_CONFIGURE_MASTER: u8 = 0x10;
pub const SPI_STATUS: u8 = 0x10;
pub const SPI_MASTER_REQUEST: u8 = 0x11;
pub const SPI_DATA: u8 = 0x11;
pub const SET_PIN_SPI: u8 = 0x12;
pub const SPI_REPORT_TX_STATUS: u8 = 0x12;
pub const I2C_CONFIGURE_MASTER: u8 = 0x13;
pub const I2C_STATUS: u8 = 0x13;
pub const I2C_WRITE_READ: u8 = 0x14;
pub const I2C_RESULT: u8 = 0x14;
pub const I2C_REPORT_TX_STATUS: u8 = 0x15;
pub const ICSP_SIX: u8 = 0x16;
pub const ICSP_REPORT_RX_STATUS: u8 = 0x16;
pub const ICSP_REGOUT: u8 = 0x17;
pub const ICSP_RESULT: u8 = 0x17;
pub const ICSP_PROG_ENTER: u8 = 0x18;
pub const ICSP_PROG_EXIT: u8 = 0x19;
pub const ICSP_CONFIG: u8 = 0x1A;
pub const INCAP_CONFIGURE: u8 = 0x1B;
pub const INCAP_STATUS: u8 = 0x1B;
pub const SET_PIN_INCAP: u8 = 0x1C;
pub const INCAP_REPORT: u8 = 0x1C;
pub const SOFT_CLOSE: u8 = 0x1D;

/// Handshake magic sent in both the establish frame and the hard reset
pub const MAGIC: &[u8; 4] = b"IOIO";
