//! Binary command channel.
//!
//! One request frame out, one response frame back. The channel holds at most
//! one pending exchange; a second request while one is outstanding fails with
//! [`Error::Busy`] instead of queueing, so replies can never be matched to
//! the wrong request.

use {
    crate::{
        error::{Error, Result, hex_tail},
        link::Link,
        port::Transport,
        protocol::frame::{
            Command, Frame, MAX_PAYLOAD, RxBuffer, STATUS_NOT_FOUND, STATUS_UNSUPPORTED,
            encode_frame, extract_payload, is_complete, parse_frame,
        },
        repl::script::ONLINE_MARKER,
        transfer::{TransferTarget, WriteMode},
    },
    log::{debug, trace},
    std::{
        sync::{Mutex, MutexGuard, PoisonError},
        time::{Duration, Instant},
    },
};

/// Default response deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Raw bytes kept for error reports.
const RAW_TAIL: usize = 64;

/// Bytes of write-file payload spent on the mode and path length.
const WRITE_HEADER_LEN: usize = 2;

#[derive(Debug)]
struct PendingExchange {
    command: Command,
    started: Instant,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct ChannelState {
    pending: Option<PendingExchange>,
    rx: RxBuffer,
}

/// Clears the pending exchange however `send_command` returns.
struct PendingGuard<'a> {
    state: &'a Mutex<ChannelState>,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(pending) = state.pending.take() {
            trace!(
                "{} settled after {:?} ({:?} before deadline)",
                pending.command,
                pending.started.elapsed(),
                pending.deadline.saturating_duration_since(Instant::now())
            );
        }
        state.rx.clear();
    }
}

/// Request/response channel speaking the binary frame protocol.
pub struct CommandChannel<T: Transport> {
    link: Link<T>,
    state: Mutex<ChannelState>,
    timeout: Duration,
}

impl<T: Transport> CommandChannel<T> {
    /// Wrap an open transport. `timeout` applies to the typed helpers.
    pub fn new(transport: T, timeout: Duration) -> Self {
        Self {
            link: Link::new(transport),
            state: Mutex::new(ChannelState::default()),
            timeout,
        }
    }

    /// Deadline used by the typed helpers.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether an exchange is outstanding.
    pub fn is_busy(&self) -> bool {
        self.lock().pending.is_some()
    }

    /// Give the transport back.
    pub fn into_transport(self) -> T {
        self.link.into_transport()
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send `command` and wait up to `timeout` for its response.
    ///
    /// Returns the response data with the status byte removed.
    pub fn send_command(
        &self,
        command: Command,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let started = Instant::now();
        let deadline = started + timeout;

        let _guard = {
            let mut state = self.lock();
            if let Some(pending) = &state.pending {
                return Err(Error::Busy(pending.command.name().to_string()));
            }
            state.pending = Some(PendingExchange {
                command,
                started,
                deadline,
            });
            state.rx.clear();
            PendingGuard { state: &self.state }
        };

        let request = encode_frame(command, payload).map_err(|_| Error::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD,
        })?;

        let stale = self.link.drain_stale();
        if stale > 0 {
            debug!("Dropped {stale} unsolicited bytes before {command}");
        }

        trace!("TX {command}: {}", hex::encode(&request));
        self.link.write(&request)?;

        let mut received = 0usize;
        let mut tail: Vec<u8> = Vec::new();
        let mut foreign: Option<u8> = None;
        loop {
            let Some(chunk) = self.link.recv_until(deadline)? else {
                debug!("{command} timed out after {:?}", started.elapsed());
                if let Some(actual) = foreign {
                    return Err(Error::UnexpectedResponse {
                        expected: command,
                        actual,
                    });
                }
                return Err(Error::Timeout {
                    operation: command.name().to_string(),
                    elapsed: started.elapsed(),
                    received,
                    tail: hex_tail(&tail),
                });
            };

            trace!("RX {command}: {}", hex::encode(&chunk));
            received += chunk.len();
            tail.extend_from_slice(&chunk);
            if tail.len() > RAW_TAIL {
                tail.drain(..tail.len() - RAW_TAIL);
            }

            let mut state = self.lock();
            state.rx.push(&chunk);
            if !is_complete(state.rx.as_slice()) {
                continue;
            }
            match parse_frame(state.rx.as_slice()) {
                Ok(frame) if frame.command != command => {
                    // late reply to an abandoned request
                    debug!("Discarded {} reply while waiting for {command}", frame.command);
                    state.rx.clear();
                    foreign = Some(frame.command.opcode());
                },
                Ok(frame) => {
                    drop(state);
                    return finish(command, &frame, started);
                },
                Err(e) if e.needs_more_data() => {},
                Err(source) => {
                    return Err(Error::Frame {
                        command,
                        source,
                        raw: hex::encode(state.rx.as_slice()),
                    });
                },
            }
        }
    }

    fn send(&self, command: Command, payload: &[u8]) -> Result<Vec<u8>> {
        self.send_command(command, payload, self.timeout)
    }

    /// Like `send`, but status "not found" becomes [`Error::NotFound`].
    fn send_file_op(&self, command: Command, payload: &[u8], path: &str) -> Result<Vec<u8>> {
        match self.send(command, payload) {
            Err(Error::Status { code, .. }) if code == STATUS_NOT_FOUND => {
                Err(Error::NotFound(path.to_string()))
            },
            other => other,
        }
    }

    /// Online check.
    pub fn ping(&self) -> Result<()> {
        let data = self.send(Command::OnlineCheck, &[])?;
        if data.is_empty() || data.trim_ascii() == ONLINE_MARKER.as_bytes() {
            Ok(())
        } else {
            Err(Error::InvalidResponse(format!(
                "online check answered {:?}",
                String::from_utf8_lossy(&data)
            )))
        }
    }

    /// Raw device info text.
    pub fn get_info(&self) -> Result<String> {
        let data = self.send(Command::GetInfo, &[])?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    /// Run source on the device and return what it printed.
    pub fn execute(&self, source: &str) -> Result<String> {
        let data = self.send(Command::Execute, source.as_bytes())?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    /// Raw directory listing text.
    pub fn list_dir(&self, path: &str) -> Result<String> {
        let data = self.send_file_op(Command::ListDir, path.as_bytes(), path)?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    /// Read a file with the legacy opcode.
    pub fn read_file_legacy(&self, path: &str) -> Result<Vec<u8>> {
        self.send_file_op(Command::ReadFileLegacy, path.as_bytes(), path)
    }

    /// Read a file.
    pub fn get_file(&self, path: &str) -> Result<Vec<u8>> {
        self.send_file_op(Command::GetFile, path.as_bytes(), path)
    }

    /// Read a file, falling back to the legacy opcode on older firmware.
    pub fn download(&self, path: &str) -> Result<Vec<u8>> {
        match self.get_file(path) {
            Err(Error::Status { code, .. }) if code == STATUS_UNSUPPORTED => {
                debug!("GET_FILE unsupported, falling back to READ_FILE_LEGACY");
                self.read_file_legacy(path)
            },
            other => other,
        }
    }

    /// Largest data chunk a single write-file frame can carry for `path`.
    pub fn write_capacity(path: &str) -> usize {
        MAX_PAYLOAD.saturating_sub(WRITE_HEADER_LEN + path.len())
    }

    /// Write one chunk of a file.
    pub fn write_file_chunk(&self, path: &str, chunk: &[u8], mode: WriteMode) -> Result<()> {
        let path_len = u8::try_from(path.len()).map_err(|_| Error::PayloadTooLarge {
            size: path.len(),
            max: usize::from(u8::MAX),
        })?;

        let mut payload = Vec::with_capacity(WRITE_HEADER_LEN + path.len() + chunk.len());
        payload.push(match mode {
            WriteMode::Truncate => 0,
            WriteMode::Append => 1,
        });
        payload.push(path_len);
        payload.extend_from_slice(path.as_bytes());
        payload.extend_from_slice(chunk);

        self.send_file_op(Command::WriteFile, &payload, path)
            .map(|_| ())
    }

    /// Delete a file.
    pub fn remove_file(&self, path: &str) -> Result<()> {
        self.send_file_op(Command::RemoveFile, path.as_bytes(), path)
            .map(|_| ())
    }

    /// Store Wi-Fi credentials.
    pub fn set_wifi(&self, ssid: &str, password: &str) -> Result<()> {
        let mut payload = Vec::with_capacity(ssid.len() + 1 + password.len());
        payload.extend_from_slice(ssid.as_bytes());
        payload.push(0);
        payload.extend_from_slice(password.as_bytes());
        self.send(Command::SetWifi, &payload).map(|_| ())
    }
}

fn finish(command: Command, frame: &Frame, started: Instant) -> Result<Vec<u8>> {
    let data = extract_payload(frame).map_err(|e| Error::Status {
        command,
        code: e.code,
    })?;
    debug!(
        "{command} answered with {} bytes in {:?}",
        data.len(),
        started.elapsed()
    );
    Ok(data.to_vec())
}

impl<T: Transport> TransferTarget for CommandChannel<T> {
    fn max_chunk_len(&self, path: &str) -> Option<usize> {
        Some(Self::write_capacity(path))
    }

    fn write_chunk(&self, path: &str, chunk: &[u8], mode: WriteMode) -> Result<()> {
        self.write_file_chunk(path, chunk, mode)
    }

    fn read_file(&self, path: &str, _chunk_size: usize) -> Result<Vec<u8>> {
        self.download(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{FrameError, STATUS_FAILED, STATUS_OK};
    use crate::testing::{FakeDevice, MockTransport, binary_device, response};
    use std::sync::Arc;
    use std::thread;

    const SHORT: Duration = Duration::from_millis(100);

    fn replying(frames: Vec<Vec<u8>>) -> MockTransport {
        MockTransport::new(move |_| frames.clone())
    }

    #[test]
    fn test_ping_writes_exact_frame() {
        let transport = replying(vec![response(Command::OnlineCheck, STATUS_OK, b"done")]);
        let writes = transport.writes();
        let channel = CommandChannel::new(transport, SHORT);

        channel.ping().unwrap();
        assert_eq!(
            writes.lock().unwrap()[0],
            vec![0xAA, 0xAB, 0xAA, 0x01, 0x00, 0x40, 0xBF, 0xAB, 0xCC, 0xAB]
        );
        assert!(!channel.is_busy());
    }

    #[test]
    fn test_response_split_across_chunks() {
        let frame = response(Command::Execute, STATUS_OK, b"1");
        let chunks: Vec<Vec<u8>> = frame.iter().map(|b| vec![*b]).collect();
        let channel = CommandChannel::new(replying(chunks), SHORT);
        assert_eq!(channel.execute("print(1)").unwrap(), "1");
    }

    #[test]
    fn test_noise_before_frame_is_skipped() {
        let channel = CommandChannel::new(
            replying(vec![
                b"I (312) boot: chatter\r\n".to_vec(),
                response(Command::GetInfo, STATUS_OK, b"platform=esp32"),
            ]),
            SHORT,
        );
        assert_eq!(channel.get_info().unwrap(), "platform=esp32");
    }

    #[test]
    fn test_footer_bytes_inside_payload() {
        let data = [0x01, 0xAB, 0xCC, 0xAB, 0x02];
        let frame = response(Command::GetFile, STATUS_OK, &data);
        // cut right after the embedded footer pattern
        let (head, rest) = frame.split_at(4 + 1 + 1 + 4);
        let channel = CommandChannel::new(replying(vec![head.to_vec(), rest.to_vec()]), SHORT);
        assert_eq!(channel.get_file("/f").unwrap(), data);
    }

    #[test]
    fn test_busy_without_touching_transport() {
        let transport = MockTransport::silent();
        let writes = transport.writes();
        let channel = Arc::new(CommandChannel::new(transport, SHORT));

        let worker = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || {
                channel.send_command(Command::GetInfo, &[], Duration::from_millis(300))
            })
        };

        while writes.lock().unwrap().is_empty() {
            thread::yield_now();
        }
        match channel.send_command(Command::OnlineCheck, &[], SHORT) {
            Err(Error::Busy(pending)) => assert_eq!(pending, "GET_INFO"),
            other => panic!("expected busy, got {other:?}"),
        }
        assert_eq!(writes.lock().unwrap().len(), 1);

        assert!(matches!(
            worker.join().unwrap(),
            Err(Error::Timeout { .. })
        ));
        assert!(!channel.is_busy());
    }

    #[test]
    fn test_timeout_clears_state_for_next_command() {
        let mut calls = 0;
        let transport = MockTransport::new(move |_| {
            calls += 1;
            if calls == 1 {
                vec![b"\xAA\xAB".to_vec()]
            } else {
                vec![response(Command::OnlineCheck, STATUS_OK, b"done")]
            }
        });
        let channel = CommandChannel::new(transport, Duration::from_millis(50));

        match channel.ping() {
            Err(Error::Timeout {
                operation,
                received,
                tail,
                ..
            }) => {
                assert_eq!(operation, "ONLINE_CHECK");
                assert_eq!(received, 2);
                assert_eq!(tail, "aaab");
            },
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(!channel.is_busy());
        channel.ping().unwrap();
    }

    #[test]
    fn test_late_reply_is_discarded() {
        let mut calls = 0;
        let transport = MockTransport::new(move |_| {
            calls += 1;
            if calls == 1 {
                Vec::new()
            } else {
                vec![response(Command::GetInfo, STATUS_OK, b"fresh")]
            }
        });
        let injector = transport.injector();
        let channel = CommandChannel::new(transport, Duration::from_millis(50));

        assert!(channel.ping().is_err());
        // the reply to the abandoned ping shows up late
        injector.inject(&response(Command::OnlineCheck, STATUS_OK, b"done"));

        assert_eq!(channel.get_info().unwrap(), "fresh");
    }

    #[test]
    fn test_late_reply_after_request_is_skipped() {
        let mut calls = 0;
        let transport = MockTransport::new(move |_| {
            calls += 1;
            if calls == 1 {
                Vec::new()
            } else {
                // the abandoned ping is answered just ahead of the new request
                vec![
                    response(Command::OnlineCheck, STATUS_OK, b"done"),
                    response(Command::GetInfo, STATUS_OK, b"fresh"),
                ]
            }
        });
        let channel = CommandChannel::new(transport, Duration::from_millis(50));

        assert!(matches!(channel.ping(), Err(Error::Timeout { .. })));
        assert_eq!(channel.get_info().unwrap(), "fresh");
        assert!(!channel.is_busy());
    }

    #[test]
    fn test_crc_error_is_frame_error() {
        let mut frame = response(Command::Execute, STATUS_OK, b"1");
        let crc_at = frame.len() - 4;
        frame[crc_at] ^= 0xFF;
        let channel = CommandChannel::new(replying(vec![frame]), SHORT);

        match channel.execute("print(1)") {
            Err(Error::Frame {
                command, source, ..
            }) => {
                assert_eq!(command, Command::Execute);
                assert!(matches!(source, FrameError::CrcMismatch { .. }));
            },
            other => panic!("expected frame error, got {other:?}"),
        }
        assert!(!channel.is_busy());
    }

    #[test]
    fn test_status_error() {
        let channel = CommandChannel::new(
            replying(vec![response(Command::Execute, STATUS_FAILED, &[])]),
            SHORT,
        );
        assert!(matches!(
            channel.execute("boom()"),
            Err(Error::Status {
                command: Command::Execute,
                code: 1
            })
        ));
    }

    #[test]
    fn test_only_foreign_reply_is_unexpected_response() {
        let channel = CommandChannel::new(
            replying(vec![response(Command::GetInfo, STATUS_OK, &[])]),
            SHORT,
        );
        assert!(matches!(
            channel.ping(),
            Err(Error::UnexpectedResponse {
                expected: Command::OnlineCheck,
                actual: 0x01
            })
        ));
    }

    #[test]
    fn test_oversized_payload_never_written() {
        let transport = MockTransport::silent();
        let writes = transport.writes();
        let channel = CommandChannel::new(transport, SHORT);

        let source = "x".repeat(300);
        assert!(matches!(
            channel.execute(&source),
            Err(Error::PayloadTooLarge { size: 300, .. })
        ));
        assert!(writes.lock().unwrap().is_empty());
        assert!(!channel.is_busy());
    }

    #[test]
    fn test_write_file_chunk_layout() {
        let state = Arc::new(Mutex::new(FakeDevice::default()));
        let transport = binary_device(Arc::clone(&state));
        let writes = transport.writes();
        let channel = CommandChannel::new(transport, SHORT);

        channel
            .write_file_chunk("/x.py", b"ab", WriteMode::Append)
            .unwrap();

        let written = writes.lock().unwrap()[0].clone();
        // header, length, opcode, then mode, path length, path, data
        assert_eq!(&written[3..6], &[10, 0x06, 1]);
        assert_eq!(written[6], 5);
        assert_eq!(&written[7..14], b"/x.pyab");
        assert_eq!(state.lock().unwrap().files["/x.py"], b"ab");
    }

    #[test]
    fn test_not_found_and_legacy_fallback() {
        let state = Arc::new(Mutex::new(FakeDevice {
            legacy_only: true,
            ..FakeDevice::default()
        }));
        state
            .lock()
            .unwrap()
            .files
            .insert("/boot.py".into(), b"# boot".to_vec());
        let channel = CommandChannel::new(binary_device(state), SHORT);

        assert_eq!(channel.download("/boot.py").unwrap(), b"# boot");
        assert!(matches!(
            channel.download("/nope.py"),
            Err(Error::NotFound(path)) if path == "/nope.py"
        ));
        assert!(matches!(
            channel.remove_file("/nope.py"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_set_wifi_payload() {
        let state = Arc::new(Mutex::new(FakeDevice::default()));
        let channel = CommandChannel::new(binary_device(Arc::clone(&state)), SHORT);
        channel.set_wifi("lab", "secret").unwrap();
        assert_eq!(
            state.lock().unwrap().wifi,
            Some(("lab".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn test_write_capacity() {
        assert_eq!(CommandChannel::<MockTransport>::write_capacity("/x.py"), 247);
        assert_eq!(
            CommandChannel::<MockTransport>::write_capacity(&"a".repeat(300)),
            0
        );
    }
}
