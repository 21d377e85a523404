//! In-memory transports and device fakes for unit tests.

use {
    crate::{
        error::Result,
        port::{INBOUND_QUEUE_DEPTH, Transport},
        protocol::frame::{
            Command, Frame, RxBuffer, STATUS_FAILED, STATUS_NOT_FOUND, STATUS_OK,
            STATUS_UNSUPPORTED, encode_frame, is_complete, parse_frame,
        },
        repl::control,
    },
    std::{
        collections::BTreeMap,
        sync::{
            Arc, Mutex, PoisonError,
            mpsc::{self, Receiver, SyncSender},
        },
    },
};

type Subscriber = Arc<Mutex<Option<SyncSender<Vec<u8>>>>>;
type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

/// Transport whose replies come from a closure called on every write.
pub(crate) struct MockTransport {
    responder: Responder,
    subscriber: Subscriber,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    open: bool,
}

/// Pushes unsolicited bytes into a [`MockTransport`].
#[derive(Clone)]
pub(crate) struct Injector {
    subscriber: Subscriber,
}

impl Injector {
    pub(crate) fn inject(&self, bytes: &[u8]) {
        deliver(&self.subscriber, bytes);
    }
}

fn deliver(subscriber: &Subscriber, bytes: &[u8]) {
    if let Some(tx) = subscriber
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .as_ref()
    {
        // a full queue drops the chunk, like a real transport
        let _ = tx.try_send(bytes.to_vec());
    }
}

impl MockTransport {
    pub(crate) fn new<F>(responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        Self {
            responder: Box::new(responder),
            subscriber: Arc::new(Mutex::new(None)),
            writes: Arc::new(Mutex::new(Vec::new())),
            open: false,
        }
    }

    /// A device that never answers.
    pub(crate) fn silent() -> Self {
        Self::new(|_| Vec::new())
    }

    /// Every write, in order.
    pub(crate) fn writes(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        Arc::clone(&self.writes)
    }

    pub(crate) fn injector(&self) -> Injector {
        Injector {
            subscriber: Arc::clone(&self.subscriber),
        }
    }
}

impl Transport for MockTransport {
    fn open(&mut self) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(data.to_vec());
        for reply in (self.responder)(data) {
            deliver(&self.subscriber, &reply);
        }
        Ok(())
    }

    fn subscribe(&mut self) -> Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::sync_channel(INBOUND_QUEUE_DEPTH);
        *self
            .subscriber
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// Encode a response frame with a status byte in front of `data`.
pub(crate) fn response(command: Command, status: u8, data: &[u8]) -> Vec<u8> {
    let mut payload = vec![status];
    payload.extend_from_slice(data);
    encode_frame(command, &payload).unwrap()
}

/// State of the binary-protocol device fake.
#[derive(Debug, Default)]
pub(crate) struct FakeDevice {
    pub files: BTreeMap<String, Vec<u8>>,
    pub info: String,
    /// Answer GET_FILE with "unsupported" so callers fall back.
    pub legacy_only: bool,
    /// Number of upcoming WRITE_FILE commands to reject.
    pub fail_writes: usize,
    /// `(mode, data length)` of every accepted WRITE_FILE.
    pub chunks: Vec<(u8, usize)>,
    pub wifi: Option<(String, String)>,
}

impl FakeDevice {
    fn handle(&mut self, frame: &Frame) -> Vec<u8> {
        let payload = frame.payload.as_slice();
        let text = || String::from_utf8_lossy(payload).into_owned();
        let cmd = frame.command;
        match cmd {
            Command::OnlineCheck => response(cmd, STATUS_OK, b"done"),
            Command::GetInfo => response(cmd, STATUS_OK, self.info.as_bytes()),
            Command::Execute => {
                let source = text();
                let printed = source
                    .strip_prefix("print(")
                    .and_then(|s| s.strip_suffix(')'))
                    .map(|s| s.trim_matches(['\'', '"']).to_string())
                    .unwrap_or_default();
                response(cmd, STATUS_OK, printed.as_bytes())
            },
            Command::ListDir => {
                let dir = text();
                let prefix = if dir.ends_with('/') { dir } else { format!("{dir}/") };
                let mut names: Vec<String> = Vec::new();
                for path in self.files.keys() {
                    let Some(rest) = path.strip_prefix(&prefix) else {
                        continue;
                    };
                    let name = match rest.split_once('/') {
                        Some((sub, _)) => format!("{sub}/"),
                        None => rest.to_string(),
                    };
                    if !names.contains(&name) {
                        names.push(name);
                    }
                }
                response(cmd, STATUS_OK, names.join("\n").as_bytes())
            },
            Command::GetFile if self.legacy_only => response(cmd, STATUS_UNSUPPORTED, &[]),
            Command::GetFile | Command::ReadFileLegacy => match self.files.get(&text()) {
                Some(data) => response(cmd, STATUS_OK, data),
                None => response(cmd, STATUS_NOT_FOUND, &[]),
            },
            Command::WriteFile => {
                if self.fail_writes > 0 {
                    self.fail_writes -= 1;
                    return response(cmd, STATUS_FAILED, &[]);
                }
                let mode = payload[0];
                let path_len = usize::from(payload[1]);
                let path = String::from_utf8_lossy(&payload[2..2 + path_len]).into_owned();
                let data = &payload[2 + path_len..];
                self.chunks.push((mode, data.len()));
                let file = self.files.entry(path).or_default();
                if mode == 0 {
                    file.clear();
                }
                file.extend_from_slice(data);
                response(cmd, STATUS_OK, &[])
            },
            Command::RemoveFile => match self.files.remove(&text()) {
                Some(_) => response(cmd, STATUS_OK, &[]),
                None => response(cmd, STATUS_NOT_FOUND, &[]),
            },
            Command::SetWifi => {
                let mut parts = payload.splitn(2, |&b| b == 0);
                let ssid = String::from_utf8_lossy(parts.next().unwrap_or_default()).into_owned();
                let password =
                    String::from_utf8_lossy(parts.next().unwrap_or_default()).into_owned();
                self.wifi = Some((ssid, password));
                response(cmd, STATUS_OK, &[])
            },
        }
    }
}

/// A binary-protocol device backed by `state`.
pub(crate) fn binary_device(state: Arc<Mutex<FakeDevice>>) -> MockTransport {
    let mut rx = RxBuffer::new();
    MockTransport::new(move |data| {
        rx.push(data);
        if !is_complete(rx.as_slice()) {
            return Vec::new();
        }
        let parsed = parse_frame(rx.as_slice());
        rx.clear();
        match parsed {
            Ok(frame) => vec![state.lock().unwrap().handle(&frame)],
            Err(_) => Vec::new(),
        }
    })
}

/// How the fake interpreter frames its replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplStyle {
    /// `OK<stdout>\x04<stderr>\x04>`
    Raw,
    /// Echoed source, output, `>>> ` prompt.
    Echo,
}

/// A raw-REPL device; `handler` maps submitted source to stdout or a traceback.
pub(crate) fn repl_device<F>(style: ReplStyle, mut handler: F) -> MockTransport
where
    F: FnMut(&str) -> std::result::Result<String, String> + Send + 'static,
{
    let mut pending: Vec<u8> = Vec::new();
    MockTransport::new(move |data| {
        match data {
            [control::INTERRUPT, ..] => return vec![b"\r\nKeyboardInterrupt\r\n>>> ".to_vec()],
            [control::ENTER_RAW] => {
                return vec![b"raw REPL; CTRL-B to exit\r\n>".to_vec()];
            },
            [control::EXIT_RAW] => return vec![b"\r\nMicroPython v1.22\r\n>>> ".to_vec()],
            _ => {},
        }

        pending.extend_from_slice(data);
        if pending.last() != Some(&control::EXECUTE) {
            return Vec::new();
        }
        pending.pop();
        let source = String::from_utf8_lossy(&pending).into_owned();
        pending.clear();

        let reply = match (style, handler(&source)) {
            (ReplStyle::Raw, Ok(out)) if out.is_empty() => "OK\x04\x04>".to_string(),
            (ReplStyle::Raw, Ok(out)) => format!("OK{out}\r\n\x04\x04>"),
            (ReplStyle::Raw, Err(err)) => format!("OK\x04{err}\r\n\x04>"),
            (ReplStyle::Echo, Ok(out)) if out.is_empty() => format!("{source}\r\n>>> "),
            (ReplStyle::Echo, Ok(out)) => format!("{source}\r\n{out}\r\n>>> "),
            (ReplStyle::Echo, Err(err)) => format!("{source}\r\n{err}\r\n>>> "),
        };
        vec![reply.into_bytes()]
    })
}
