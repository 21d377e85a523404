//! Transport abstraction for byte-stream links to the device.
//!
//! The protocol layers never talk to a serial port directly. They go through
//! the [`Transport`] trait, which any byte stream can implement:
//!
//! - **Native platforms** (Linux, macOS, Windows): [`NativeTransport`] over the
//!   `serialport` crate
//! - **Other links** (Web Serial, TCP bridges, test doubles): any type that
//!   implements [`Transport`]
//!
//! ## Architecture
//!
//! ```text
//! +------------------+     +------------------+
//! |  Command Channel |     |   REPL Session   |
//! |  (binary frames) |     |  (raw REPL text) |
//! +--------+---------+     +--------+---------+
//!          |                        |
//!          v                        v
//! +--------+------------------------+---------+
//! |        Link (transport + subscription)    |
//! +--------+----------------------------------+
//!          |
//!          v
//! +--------+---------+
//! |  Transport Trait |  write_raw() ---> device
//! |                  |  subscribe() <--- pushed byte chunks
//! +------------------+
//! ```
//!
//! Inbound data is push-based: the transport delivers chunks to the
//! [`Receiver`] returned by [`Transport::subscribe`] as soon as they arrive.
//! Chunk boundaries carry no meaning; framing is done by the layers above.
//! The queue behind that receiver is bounded by [`INBOUND_QUEUE_DEPTH`]; when
//! nobody drains it, newer chunks are dropped.

#[cfg(feature = "native")]
pub mod native;

use std::sync::mpsc::Receiver;
use std::time::Duration;

use crate::error::Result;

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Poll interval of the reader thread.
    pub timeout: Duration,
    /// Data bits (typically 8).
    pub data_bits: DataBits,
    /// Parity (typically None).
    pub parity: Parity,
    /// Stop bits (typically One).
    pub stop_bits: StopBits,
    /// Flow control (typically None).
    pub flow_control: FlowControl,
}

/// Inbound chunks held for a subscriber before new ones are dropped.
pub const INBOUND_QUEUE_DEPTH: usize = 64;

/// Default baud rate of MicroPython firmware on ESP32 boards.
pub const DEFAULT_BAUD: u32 = 115_200;

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD,
            timeout: Duration::from_millis(20),
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the reader poll interval.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Number of data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 2 stop bits.
    Two,
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,
    /// Hardware flow control (RTS/CTS).
    Hardware,
    /// Software flow control (XON/XOFF).
    Software,
}

/// A byte-stream link to the device.
///
/// Implementations must not interpret the bytes they carry.
pub trait Transport: Send {
    /// Open the underlying link.
    fn open(&mut self) -> Result<()>;

    /// Close the link and stop delivering inbound data.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes to the device.
    fn write_raw(&mut self, data: &[u8]) -> Result<()>;

    /// Subscribe to inbound data.
    ///
    /// Each call replaces the previous subscriber; only the newest receiver
    /// gets data. At most [`INBOUND_QUEUE_DEPTH`] chunks are queued for it.
    fn subscribe(&mut self) -> Receiver<Vec<u8>>;

    /// Human-readable endpoint name.
    fn name(&self) -> &str;

    /// Whether the link is currently open.
    fn is_open(&self) -> bool;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open(&mut self) -> Result<()> {
        (**self).open()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        (**self).write_raw(data)
    }

    fn subscribe(&mut self) -> Receiver<Vec<u8>> {
        (**self).subscribe()
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}

#[cfg(feature = "native")]
pub use native::NativeTransport;
