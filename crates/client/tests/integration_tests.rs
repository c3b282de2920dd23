//! Full-stack tests against a scripted mock transport
//!
//! The mock plays the board: it feeds the handshake, grants transmit
//! credit and echoes data, while the tests observe the exact bytes the
//! client puts on the wire.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use client::{Board, UartConfig, UartPins};
use common::test_utils::MockTransport;
use common::{Error, Transport};
use protocol::{DigitalOutMode, Pin};

fn handshake_bytes() -> Vec<u8> {
    let mut bytes = vec![0x00];
    bytes.extend_from_slice(b"IOIO");
    bytes.extend_from_slice(b"SPRK0016");
    bytes.extend_from_slice(b"IOIO0300");
    bytes.extend_from_slice(b"IOIO0326");
    bytes
}

fn connected_board() -> (Arc<MockTransport>, Board) {
    let transport = Arc::new(MockTransport::new());
    transport.push_incoming(&handshake_bytes());
    let board = Board::new(Arc::clone(&transport) as Arc<dyn Transport>);
    board.connect(Duration::from_secs(2)).unwrap();
    assert!(board.is_connected());
    transport.take_outgoing();
    (transport, board)
}

/// UART transmit-status frame granting `bytes` of credit on `channel`
fn credit_grant(channel: u8, bytes: u16) -> [u8; 3] {
    [
        0x0F,
        channel | ((bytes & 0x3F) as u8) << 2,
        (bytes >> 6) as u8,
    ]
}

#[test]
fn test_uart_echo_roundtrip() {
    let (transport, board) = connected_board();

    let uart = board
        .open_uart(
            UartPins {
                rx: Some(6),
                tx: Some(7),
                ..Default::default()
            },
            UartConfig::new(57_600),
        )
        .unwrap();

    // Open configures the pin roles and then the channel itself
    assert_eq!(
        transport.take_outgoing(),
        vec![
            0x0F, 6, 0x80, // rx
            0x0F, 7, 0xC0, // tx
            0x0D, 0x08, 68, 0, // 4x clock, divisor 68
        ]
    );

    // No credit yet: the write queues without touching the wire
    uart.write(b"hello").unwrap();
    assert_eq!(uart.output_pending(), 5);
    assert!(transport.take_outgoing().is_empty());

    // Board grants 64 bytes; the queued write drains as one frame
    transport.push_incoming(&credit_grant(0, 64));
    let sent = transport.wait_for_outgoing(7, Duration::from_secs(2));
    assert_eq!(sent, [&[0x0E, 0x04][..], b"hello"].concat());

    // Board echoes the data back; it is read exactly once
    let mut echo = vec![0x0E, 0x04];
    echo.extend_from_slice(b"hello");
    transport.push_incoming(&echo);

    let got = uart.read(5, Some(Duration::from_secs(2))).unwrap();
    assert_eq!(got, b"hello");
    assert_eq!(uart.read_available().unwrap(), b"");
}

#[test]
fn test_uart_credit_trickle_never_oversends() {
    let (transport, board) = connected_board();

    let uart = board
        .open_uart(
            UartPins {
                rx: Some(6),
                tx: Some(7),
                ..Default::default()
            },
            UartConfig::new(9_600),
        )
        .unwrap();
    transport.take_outgoing();

    let payload: Vec<u8> = (0..100u8).collect();
    uart.write(&payload).unwrap();

    let mut granted = 0usize;
    for _ in 0..5 {
        transport.push_incoming(&credit_grant(0, 10));
        granted += 10;

        // Each grant moves exactly 10 more payload bytes (plus 2 header
        // bytes per frame)
        let expected_wire = granted + 2 * (granted / 10);
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let sent = transport.outgoing_snapshot();
            assert!(
                payload_bytes(&sent) <= granted,
                "client sent beyond its credit"
            );
            if sent.len() == expected_wire {
                break;
            }
            assert!(Instant::now() < deadline, "credit never consumed");
            thread::sleep(Duration::from_millis(10));
        }
    }
    assert_eq!(uart.output_pending(), 50);
}

fn payload_bytes(wire: &[u8]) -> usize {
    let mut total = 0;
    let mut i = 0;
    while i < wire.len() {
        assert_eq!(wire[i], 0x0E);
        let len = (wire[i + 1] & 0x3F) as usize + 1;
        total += len;
        i += 2 + len;
    }
    total
}

#[test]
fn test_uart_double_close_does_not_free_twice() {
    let (transport, board) = connected_board();

    let pins = UartPins {
        rx: Some(6),
        tx: Some(7),
        ..Default::default()
    };
    let first = board.open_uart(pins.clone(), UartConfig::new(9_600)).unwrap();
    assert_eq!(first.channel(), 0);

    first.close();
    first.close();
    assert!(matches!(first.write(b"x"), Err(Error::ConnectionLost)));

    // The same pins and channel are free again exactly once
    let second = board.open_uart(pins, UartConfig::new(9_600)).unwrap();
    assert_eq!(second.channel(), 0);

    // Closing the first channel yet again must not free the second's pins
    first.close();
    transport.take_outgoing();
    assert!(matches!(
        board.open_digital_output(Pin::Num(6), DigitalOutMode::PushPull, false),
        Err(Error::IllegalArgument(_))
    ));
}

#[test]
fn test_soft_reset_report_kills_open_channels() {
    let (transport, board) = connected_board();

    let uart = board
        .open_uart(
            UartPins {
                rx: Some(6),
                tx: Some(7),
                ..Default::default()
            },
            UartConfig::new(9_600),
        )
        .unwrap();

    transport.push_incoming(&[0x01]);

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if matches!(uart.write(b"x"), Err(Error::ConnectionLost)) {
            break;
        }
        assert!(Instant::now() < deadline, "reset never reached the channel");
        thread::sleep(Duration::from_millis(10));
    }

    // Board still connected; the freed pins are reusable
    assert!(board.is_connected());
    board
        .open_uart(
            UartPins {
                rx: Some(6),
                tx: Some(7),
                ..Default::default()
            },
            UartConfig::new(9_600),
        )
        .unwrap();
}

#[test]
fn test_graceful_shutdown() {
    let (transport, board) = connected_board();

    let uart = board
        .open_uart(
            UartPins {
                rx: Some(6),
                tx: Some(7),
                ..Default::default()
            },
            UartConfig::new(9_600),
        )
        .unwrap();
    transport.take_outgoing();

    board.disconnect().unwrap();
    assert_eq!(
        transport.wait_for_outgoing(1, Duration::from_secs(1)),
        vec![0x1D]
    );

    // Board acknowledges by echoing the close frame
    transport.push_incoming(&[0x1D]);
    assert!(board.wait_for_disconnect(Duration::from_secs(2)));

    // Everything fails fast and cheap from here on
    assert!(matches!(uart.write(b"x"), Err(Error::ConnectionLost)));
    assert!(matches!(
        board.open_digital_output(Pin::Led, DigitalOutMode::PushPull, false),
        Err(Error::ConnectionLost)
    ));
}

#[test]
fn test_led_blink_sequence() {
    let (transport, board) = connected_board();

    let led = board
        .open_digital_output(Pin::Led, DigitalOutMode::PushPull, true)
        .unwrap();
    led.write(false).unwrap();
    led.write(true).unwrap();

    assert_eq!(
        transport.take_outgoing(),
        vec![
            0x03, 0x02, // configure pin 0 as output, high
            0x04, 0x00, // low
            0x04, 0x01, // high
        ]
    );
}
