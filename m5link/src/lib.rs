//! # m5link
//!
//! Talk to MicroPython boards (M5Stack and other ESP32 devices) over a
//! serial link.
//!
//! Two protocol modes share one transport abstraction:
//!
//! - **Binary**: framed commands (`AA AB AA | len | cmd | payload | crc16 |
//!   AB CC AB`) with CRC16 validation and a strict one-request-at-a-time
//!   channel
//! - **REPL**: the interpreter's raw mode, driven with control bytes, with
//!   output scraped from the terminal stream
//!
//! File transfers are chunked, retried per chunk and report progress in
//! either mode.
//!
//! ## Features
//!
//! - `native` (default): serial ports via the `serialport` crate
//! - `serde`: serialization support for reported data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use m5link::{Device, DeviceConfig, NativeTransport, ProtocolMode};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = NativeTransport::with_port("/dev/ttyUSB0", 115_200);
//!     let config = DeviceConfig {
//!         mode: ProtocolMode::Repl,
//!         ..DeviceConfig::default()
//!     };
//!
//!     let mut device = Device::new(transport, config);
//!     device.connect()?;
//!
//!     device.write_file("/main.py", b"print('hello')\n")?;
//!     let result = device.execute_file("/main.py")?;
//!     println!("{}", result.output);
//!
//!     device.disconnect()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod channel;
pub mod device;
pub mod error;
pub mod host;
mod link;
pub mod port;
pub mod protocol;
pub mod repl;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(feature = "native")]
pub use port::NativeTransport;
pub use {
    channel::CommandChannel,
    device::{
        Device, DeviceConfig, DeviceEvent, DeviceInfo, DirEntry, EntryKind, InfoFormat,
        ProtocolMode,
    },
    error::{Error, Result},
    host::{DetectedPort, DeviceKind, auto_detect_port, discover_ports, format_port_list},
    port::{SerialConfig, Transport},
    protocol::{Command, Frame, FrameError, StatusError, crc::crc16},
    repl::{ExecutionResult, ReplConfig, ReplSession, SessionState},
    transfer::{TransferJob, TransferOptions, TransferTarget, WriteMode},
};
