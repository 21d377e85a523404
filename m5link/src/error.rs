//! Error types for m5link.

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::frame::{Command, FrameError};
use crate::repl::SessionState;

/// Result type for m5link operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for m5link operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (transport open/read/write, local files).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Malformed or checksum-invalid binary frame.
    #[error("Frame error on {command}: {source} (raw: {raw})")]
    Frame {
        /// Command whose response was being parsed.
        command: Command,
        /// What was wrong with the frame.
        source: FrameError,
        /// Hex dump of the offending bytes.
        raw: String,
    },

    /// The device reported a failure status for a command.
    #[error("Device rejected {command} with status {code:#04x}")]
    Status {
        /// Command that failed.
        command: Command,
        /// Non-zero status byte from the response payload.
        code: u8,
    },

    /// No valid response before the deadline.
    #[error("Timeout: {operation} after {elapsed:?} ({received} bytes received, tail: {tail})")]
    Timeout {
        /// Opcode name or source snippet.
        operation: String,
        /// Time spent waiting.
        elapsed: Duration,
        /// Number of bytes received while waiting.
        received: usize,
        /// Last bytes seen, hex encoded.
        tail: String,
    },

    /// A command was attempted while another one is pending.
    #[error("Device busy: {0} is still pending")]
    Busy(String),

    /// File operation on a missing path.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Interpreter response did not end with any recognized terminator.
    #[error("Unrecognized REPL response to {snippet:?} after {elapsed:?}: {tail:?}")]
    Scrape {
        /// First line of the submitted source.
        snippet: String,
        /// Time spent waiting.
        elapsed: Duration,
        /// Last text seen.
        tail: String,
    },

    /// The interpreter session is not ready for code execution.
    #[error("REPL session not ready (state: {0:?}), call initialize() first")]
    NotReady(SessionState),

    /// The device is not connected.
    #[error("Device not connected")]
    NotConnected,

    /// Port auto-detection found nothing usable.
    #[error("No serial port found; pass one explicitly")]
    NoPortFound,

    /// Response frame carried a different opcode than the request.
    #[error("Unexpected response: sent {expected}, got opcode {actual:#04x}")]
    UnexpectedResponse {
        /// Command that was sent.
        expected: Command,
        /// Opcode found in the response.
        actual: u8,
    },

    /// A payload does not fit in a single frame.
    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Requested payload size.
        size: usize,
        /// Largest size that fits.
        max: usize,
    },

    /// A chunk of a file transfer failed permanently.
    #[error("Transfer of {path} failed at offset {offset} after {attempts} attempts: {source}")]
    Transfer {
        /// Remote path.
        path: String,
        /// Offset of the failed chunk.
        offset: usize,
        /// Attempts made on the failed chunk.
        attempts: u32,
        /// Error from the last attempt.
        source: Box<Error>,
    },

    /// A response could not be interpreted.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The embedding application requested interruption.
    #[error("Operation interrupted")]
    Interrupted,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the transfer manager may retry a chunk after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Status { .. } | Self::Frame { .. } | Self::Scrape { .. }
        )
    }

    /// Build a timeout error with a hex tail of the received bytes.
    pub(crate) fn timeout(
        operation: impl Into<String>,
        elapsed: Duration,
        received: &[u8],
    ) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed,
            received: received.len(),
            tail: hex_tail(received),
        }
    }
}

/// Number of trailing bytes kept in error messages.
const TAIL_LEN: usize = 32;

/// Hex-encode at most the last `TAIL_LEN` bytes.
pub(crate) fn hex_tail(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "<none>".to_string();
    }
    let start = bytes.len().saturating_sub(TAIL_LEN);
    hex::encode(&bytes[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_tail_empty() {
        assert_eq!(hex_tail(&[]), "<none>");
    }

    #[test]
    fn test_hex_tail_truncates() {
        let bytes: Vec<u8> = (0..40).collect();
        let tail = hex_tail(&bytes);
        assert_eq!(tail.len(), TAIL_LEN * 2);
        assert!(tail.starts_with("08"));
        assert!(tail.ends_with("27"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::timeout("GET_FILE", Duration::from_millis(5), &[]).is_retryable());
        assert!(
            Error::Status {
                command: Command::WriteFile,
                code: 1
            }
            .is_retryable()
        );
        assert!(
            Error::Scrape {
                snippet: "print(1)".into(),
                elapsed: Duration::from_millis(5),
                tail: "garbled".into(),
            }
            .is_retryable()
        );
        assert!(!Error::Busy("PING".into()).is_retryable());
        assert!(!Error::NotFound("/x.py".into()).is_retryable());
    }

    #[test]
    fn test_timeout_message_has_context() {
        let err = Error::timeout("EXECUTE", Duration::from_millis(5000), &[0xAA, 0xAB]);
        let msg = err.to_string();
        assert!(msg.contains("EXECUTE"));
        assert!(msg.contains("2 bytes"));
        assert!(msg.contains("aaab"));
    }
}
