//! Binary command frame codec.
//!
//! ## Frame Format
//!
//! ```text
//! +----------------+--------+-----+-------------+--------+----------------+
//! |     Header     | Length | CMD |   Payload   | CRC16  |     Footer     |
//! +----------------+--------+-----+-------------+--------+----------------+
//! |     3 bytes    | 1 byte | 1   |  Length - 1 | 2 (BE) |     3 bytes    |
//! +----------------+--------+-----+-------------+--------+----------------+
//! | 0xAA 0xAB 0xAA | 1 + n  | cmd |   payload   |  CRC   | 0xAB 0xCC 0xAB |
//! +----------------+--------+-----+-------------+--------+----------------+
//! ```
//!
//! The CRC covers `CMD + Payload` only. Responses use the same layout; their
//! first payload byte is a status code.

use {
    crate::protocol::crc::crc16,
    byteorder::{BigEndian, ByteOrder},
    std::fmt,
    thiserror::Error,
};

/// Frame start marker.
pub const FRAME_HEADER: [u8; 3] = [0xAA, 0xAB, 0xAA];

/// Frame end marker.
pub const FRAME_FOOTER: [u8; 3] = [0xAB, 0xCC, 0xAB];

/// Bytes around the payload: header, length, command, CRC, footer.
pub const FRAME_OVERHEAD: usize = 3 + 1 + 1 + 2 + 3;

/// Smallest buffer that [`is_complete`] will consider.
pub const MIN_COMPLETE_LEN: usize = 8;

/// Largest payload whose length byte (`1 + payload`) still fits in a `u8`.
pub const MAX_PAYLOAD: usize = u8::MAX as usize - 1;

/// Status byte for a successful response.
pub const STATUS_OK: u8 = 0x00;

/// Status byte for a generic command failure.
pub const STATUS_FAILED: u8 = 0x01;

/// Status byte for a missing file or directory.
pub const STATUS_NOT_FOUND: u8 = 0x02;

/// Status byte for an opcode the firmware does not implement.
pub const STATUS_UNSUPPORTED: u8 = 0x03;

/// Binary protocol opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Online check, answered with `done`.
    OnlineCheck = 0x00,
    /// Device information text.
    GetInfo = 0x01,
    /// Execute source code.
    Execute = 0x02,
    /// List a directory.
    ListDir = 0x03,
    /// Read a file (older firmware).
    ReadFileLegacy = 0x04,
    /// Read a whole file.
    GetFile = 0x05,
    /// Write or append a file chunk.
    WriteFile = 0x06,
    /// Remove a file.
    RemoveFile = 0x07,
    /// Store Wi-Fi credentials.
    SetWifi = 0x08,
}

impl Command {
    /// All opcodes, in wire order.
    pub const ALL: [Self; 9] = [
        Self::OnlineCheck,
        Self::GetInfo,
        Self::Execute,
        Self::ListDir,
        Self::ReadFileLegacy,
        Self::GetFile,
        Self::WriteFile,
        Self::RemoveFile,
        Self::SetWifi,
    ];

    /// Wire opcode.
    pub fn opcode(self) -> u8 {
        self as u8
    }

    /// Short name used in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            Self::OnlineCheck => "ONLINE_CHECK",
            Self::GetInfo => "GET_INFO",
            Self::Execute => "EXECUTE",
            Self::ListDir => "LIST_DIR",
            Self::ReadFileLegacy => "READ_FILE_LEGACY",
            Self::GetFile => "GET_FILE",
            Self::WriteFile => "WRITE_FILE",
            Self::RemoveFile => "REMOVE_FILE",
            Self::SetWifi => "SET_WIFI",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#04x})", self.name(), self.opcode())
    }
}

impl TryFrom<u8> for Command {
    type Error = FrameError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|cmd| cmd.opcode() == value)
            .ok_or(FrameError::UnknownCommand(value))
    }
}

/// Reasons a buffer is not a valid frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Fewer bytes than the smallest possible frame.
    #[error("frame too short ({0} bytes)")]
    TooShort(usize),
    /// Buffer does not start with the frame header.
    #[error("bad frame header")]
    BadHeader,
    /// Buffer does not end with the frame footer.
    #[error("bad frame footer")]
    BadFooter,
    /// Length byte disagrees with the bytes actually present.
    #[error("length mismatch: header says {declared}, frame carries {actual}")]
    LengthMismatch {
        /// Value of the length byte.
        declared: usize,
        /// Command + payload bytes present.
        actual: usize,
    },
    /// Checksum disagrees with the frame contents.
    #[error("CRC mismatch: frame says {expected:#06x}, computed {actual:#06x}")]
    CrcMismatch {
        /// CRC embedded in the frame.
        expected: u16,
        /// CRC computed over command + payload.
        actual: u16,
    },
    /// Payload does not fit the one-byte length field.
    #[error("payload too large ({0} bytes, max {MAX_PAYLOAD})")]
    PayloadTooLarge(usize),
    /// Opcode outside the command table.
    #[error("unknown command opcode {0:#04x}")]
    UnknownCommand(u8),
}

impl FrameError {
    /// Whether more bytes could still turn the buffer into a valid frame.
    pub fn needs_more_data(&self) -> bool {
        match self {
            Self::TooShort(_) => true,
            Self::LengthMismatch { declared, actual } => declared > actual,
            _ => false,
        }
    }
}

/// Device-reported failure carried in a response status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("device status {code:#04x}")]
pub struct StatusError {
    /// Non-zero status code.
    pub code: u8,
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Opcode.
    pub command: Command,
    /// Payload bytes (status byte included for responses).
    pub payload: Vec<u8>,
}

/// Encode a frame for `command` carrying `payload`.
pub fn encode_frame(command: Command, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }

    let mut frame = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
    frame.extend_from_slice(&FRAME_HEADER);
    #[allow(clippy::cast_possible_truncation)] // bounded by MAX_PAYLOAD
    frame.push((1 + payload.len()) as u8);
    frame.push(command.opcode());
    frame.extend_from_slice(payload);

    let mut crc = [0u8; 2];
    BigEndian::write_u16(&mut crc, crc16(&frame[4..]));
    frame.extend_from_slice(&crc);
    frame.extend_from_slice(&FRAME_FOOTER);

    Ok(frame)
}

/// Check whether `buffer` is delimited like a whole frame.
///
/// This only looks at the markers; [`parse_frame`] does the validation.
pub fn is_complete(buffer: &[u8]) -> bool {
    buffer.len() >= MIN_COMPLETE_LEN
        && buffer.starts_with(&FRAME_HEADER)
        && buffer.ends_with(&FRAME_FOOTER)
}

/// Parse and validate a frame.
pub fn parse_frame(buffer: &[u8]) -> Result<Frame, FrameError> {
    if buffer.len() < FRAME_OVERHEAD {
        return Err(FrameError::TooShort(buffer.len()));
    }
    if !buffer.starts_with(&FRAME_HEADER) {
        return Err(FrameError::BadHeader);
    }
    if !buffer.ends_with(&FRAME_FOOTER) {
        return Err(FrameError::BadFooter);
    }

    let declared = usize::from(buffer[3]);
    // command + payload bytes between the length byte and the CRC
    let actual = buffer.len() - (FRAME_OVERHEAD - 1);
    if declared != actual {
        return Err(FrameError::LengthMismatch { declared, actual });
    }

    let body = &buffer[4..4 + declared];
    let expected = BigEndian::read_u16(&buffer[4 + declared..6 + declared]);
    let computed = crc16(body);
    if expected != computed {
        return Err(FrameError::CrcMismatch {
            expected,
            actual: computed,
        });
    }

    Ok(Frame {
        command: Command::try_from(body[0])?,
        payload: body[1..].to_vec(),
    })
}

/// Split a response payload into its status byte and data.
///
/// An empty payload counts as success with no data.
pub fn extract_payload(frame: &Frame) -> Result<&[u8], StatusError> {
    match frame.payload.split_first() {
        None => Ok(&[]),
        Some((&STATUS_OK, data)) => Ok(data),
        Some((&code, _)) => Err(StatusError { code }),
    }
}

/// Upper bound on bytes held while waiting for a frame.
pub const MAX_RX_BUFFER: usize = 4096;

/// Accumulates inbound bytes until they form a frame.
///
/// Leading bytes that cannot start a frame (boot messages, REPL chatter) are
/// dropped, and the buffer never grows past [`MAX_RX_BUFFER`].
#[derive(Debug, Default)]
pub struct RxBuffer {
    data: Vec<u8>,
    discarded: usize,
}

impl RxBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes and realign on the frame header.
    pub fn push(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
        if self.data.len() > MAX_RX_BUFFER {
            let excess = self.data.len() - MAX_RX_BUFFER;
            self.data.drain(..excess);
            self.discarded += excess;
        }
        self.resync();
    }

    /// Current contents.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes dropped so far while looking for a header.
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.data.clear();
        self.discarded = 0;
    }

    fn resync(&mut self) {
        if self.data.starts_with(&FRAME_HEADER) {
            return;
        }

        let keep_from = self
            .data
            .windows(FRAME_HEADER.len())
            .position(|w| w == FRAME_HEADER)
            .unwrap_or_else(|| {
                // keep a trailing partial header
                let len = self.data.len();
                (1..FRAME_HEADER.len())
                    .rev()
                    .find(|&n| n <= len && self.data[len - n..] == FRAME_HEADER[..n])
                    .map_or(len, |n| len - n)
            });

        if keep_from > 0 {
            self.data.drain(..keep_from);
            self.discarded += keep_from;
        }
    }
}
