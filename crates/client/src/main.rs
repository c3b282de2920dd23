//! ioio-talk: serial monitor bridged through an IOIO board
//!
//! Connects to a board reachable over a serial-over-TCP bridge, opens a
//! UART on the given pins and pumps stdin to the port and port output to
//! stdout, blinking the stat LED on traffic.

use std::io::{BufRead, Write};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;

use client::{Board, UartConfig, UartPins, LIB_VERSION};
use common::{setup_logging, TcpTransport};
use protocol::{DigitalOutMode, FlowControl, Pin};

#[derive(Parser, Debug)]
#[command(name = "ioio-talk")]
#[command(author, version, about = "Talk to a serial port wired to an IOIO board")]
struct Args {
    /// Address of the board's byte-stream bridge (host:port)
    #[arg(short, long, value_name = "ADDR")]
    addr: String,

    /// Baud rate
    #[arg(short, long, default_value_t = 115_200)]
    baud: u32,

    /// Pins as RX,TX or RX,TX,RTS,CTS
    #[arg(short, long, default_value = "40,39,46,45")]
    pins: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn parse_pins(list: &str) -> Result<Vec<u8>> {
    let pins: Vec<u8> = list
        .split(',')
        .map(|p| p.trim().parse::<u8>())
        .collect::<std::result::Result<_, _>>()
        .with_context(|| format!("bad pin list {:?}", list))?;
    if pins.len() != 2 && pins.len() != 4 {
        bail!("expected 2 or 4 pins (RX,TX[,RTS,CTS]), got {}", pins.len());
    }
    Ok(pins)
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level)?;

    let pins = parse_pins(&args.pins)?;

    info!("ioio-talk {} connecting to board at {}", LIB_VERSION, args.addr);
    let transport = Arc::new(TcpTransport::connect(&args.addr).context("transport connect")?);
    let board = Board::new(transport);
    board.connect(Duration::from_secs(10))?;
    if !board.is_connected() {
        bail!("no handshake from board at {}", args.addr);
    }
    info!("connected: {:?}", board.versions());

    let led = board.open_digital_output(Pin::Led, DigitalOutMode::PushPull, true)?;

    let mut config = UartConfig::new(args.baud);
    let uart_pins = if pins.len() == 2 {
        UartPins {
            rx: Some(pins[0]),
            tx: Some(pins[1]),
            ..Default::default()
        }
    } else {
        config.flow = FlowControl::RtsCts;
        UartPins {
            rx: Some(pins[0]),
            tx: Some(pins[1]),
            rts: Some(pins[2]),
            cts: Some(pins[3]),
        }
    };
    info!("opening uart on pins {:?} at {} baud", pins, args.baud);
    let uart = board.open_uart(uart_pins, config)?;

    // stdin lines flow to the port from a helper thread
    let (line_tx, line_rx) = mpsc::channel::<String>();
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    let mut stdout = std::io::stdout();
    let mut blink = 0u32;
    loop {
        board.check_state()?;

        match line_rx.try_recv() {
            Ok(mut line) => {
                line.push('\n');
                uart.write(line.as_bytes())?;
            }
            Err(mpsc::TryRecvError::Disconnected) => break,
            Err(mpsc::TryRecvError::Empty) => {}
        }

        let data = uart.read_available()?;
        if !data.is_empty() {
            stdout.write_all(&data)?;
            stdout.flush()?;
            blink += 1;
            led.write(blink % 2 == 0)?;
        }
        thread::sleep(Duration::from_millis(10));
    }

    info!("closing");
    led.write(false)?;
    uart.flush()?;
    uart.close();
    board.disconnect()?;
    board.wait_for_disconnect(Duration::from_secs(2));
    Ok(())
}
