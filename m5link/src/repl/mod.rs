//! Interactive interpreter (REPL) adapter.
//!
//! Drives the MicroPython raw REPL with control bytes and turns the text
//! that comes back into an [`ExecutionResult`].
//!
//! ## Session States
//!
//! ```text
//! Unknown --Ctrl-C--> Interrupted --Ctrl-A--> RawModeEntered
//! RawModeEntered --source + Ctrl-D--> Executing --terminator--> RawModeEntered
//! RawModeEntered --Ctrl-B--> RawModeExited
//! any --timeout / unrecognized reply / firmware fault--> Unknown
//! ```

pub mod scrape;
pub mod script;

use {
    crate::{
        error::{Error, Result},
        link::Link,
        port::Transport,
        transfer::{TransferTarget, WriteMode},
    },
    log::{debug, trace, warn},
    scrape::{ResponseBuffer, Scrape, Terminators, error_summary, is_not_found, scrape},
    std::{
        sync::{Mutex, MutexGuard, PoisonError},
        time::{Duration, Instant},
    },
};

/// REPL control bytes.
pub mod control {
    /// Ctrl-A: enter raw mode.
    pub const ENTER_RAW: u8 = 0x01;
    /// Ctrl-B: leave raw mode.
    pub const EXIT_RAW: u8 = 0x02;
    /// Ctrl-C: interrupt the running program.
    pub const INTERRUPT: u8 = 0x03;
    /// Ctrl-D: execute the buffered source.
    pub const EXECUTE: u8 = 0x04;
}

/// Characters of REPL text kept in error messages.
const ERROR_TAIL_CHARS: usize = 120;

/// Interpreter session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Nothing is known about the interpreter.
    #[default]
    Unknown,
    /// The running program was interrupted.
    Interrupted,
    /// Raw mode is active and idle.
    RawModeEntered,
    /// Source was submitted and its output is awaited.
    Executing,
    /// Raw mode was left; the friendly REPL is active.
    RawModeExited,
}

/// REPL timing and terminator settings.
#[derive(Debug, Clone)]
pub struct ReplConfig {
    /// Deadline for code execution.
    pub exec_timeout: Duration,
    /// Deadline for each file operation round trip.
    pub file_timeout: Duration,
    /// Quiet time allowed for the device after control bytes.
    pub settle: Duration,
    /// Response terminators.
    pub terminators: Terminators,
}

impl Default for ReplConfig {
    fn default() -> Self {
        Self {
            exec_timeout: Duration::from_secs(10),
            file_timeout: Duration::from_secs(20),
            settle: Duration::from_millis(100),
            terminators: Terminators::default(),
        }
    }
}

/// Outcome of running source on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ExecutionResult {
    /// Printed output, echo and prompts removed.
    pub output: String,
    /// Traceback or firmware fault text.
    pub error: Option<String>,
    /// 0 on success, 1 for a program error, -1 for a firmware fault.
    pub exit_code: i32,
    /// Wall time of the exchange.
    pub elapsed: Duration,
}

impl ExecutionResult {
    /// Whether the program ran without error.
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Default)]
struct SessionInner {
    state: SessionState,
    buffer: ResponseBuffer,
}

/// A raw-REPL session over one transport.
///
/// At most one execution is in flight; a second caller gets [`Error::Busy`].
pub struct ReplSession<T: Transport> {
    link: Link<T>,
    config: ReplConfig,
    inner: Mutex<SessionInner>,
}

/// Leaves the session in a defined state on every exit path of an execution.
struct ExecGuard<'a> {
    inner: &'a Mutex<SessionInner>,
    next: SessionState,
}

impl Drop for ExecGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        inner.state = self.next;
        inner.buffer.clear();
    }
}

/// Wrap source so the interpreter sees a single statement line.
pub fn wrap_source(source: &str) -> String {
    let trimmed = source.trim_end();
    if trimmed.contains('\n') {
        format!("exec(\"{}\")", script::escape_source(source))
    } else {
        trimmed.trim_start().to_string()
    }
}

fn snippet(source: &str) -> String {
    let first = source.lines().next().unwrap_or_default();
    if first.chars().count() > 40 {
        format!("{}...", first.chars().take(40).collect::<String>())
    } else {
        first.to_string()
    }
}

impl<T: Transport> ReplSession<T> {
    /// Wrap an open transport. The session starts in [`SessionState::Unknown`].
    pub fn new(transport: T, config: ReplConfig) -> Self {
        Self {
            link: Link::new(transport),
            config,
            inner: Mutex::new(SessionInner::default()),
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Session configuration.
    pub fn config(&self) -> &ReplConfig {
        &self.config
    }

    /// Forget the session state, e.g. after a disconnect.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = SessionState::Unknown;
        inner.buffer.clear();
    }

    /// Give the transport back.
    pub fn into_transport(self) -> T {
        self.link.into_transport()
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SessionState) {
        trace!("REPL state -> {state:?}");
        self.lock().state = state;
    }

    fn ensure_idle(&self, operation: &str) -> Result<()> {
        if self.lock().state == SessionState::Executing {
            return Err(Error::Busy(operation.to_string()));
        }
        Ok(())
    }

    /// Read and discard inbound text for the settle period.
    fn settle(&self) -> Result<String> {
        let deadline = Instant::now() + self.config.settle;
        let mut buffer = ResponseBuffer::new();
        while let Some(chunk) = self.link.recv_until(deadline)? {
            buffer.push(&chunk);
        }
        Ok(buffer.text().to_string())
    }

    /// Interrupt any running program and enter raw mode.
    ///
    /// Must succeed before [`ReplSession::execute_code`] is used.
    pub fn initialize(&self) -> Result<()> {
        self.ensure_idle("initialize")?;
        self.reset();
        self.link.drain_stale();

        let result = self.enter_raw_mode();
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn enter_raw_mode(&self) -> Result<()> {
        self.link
            .write(&[control::INTERRUPT, control::INTERRUPT])?;
        self.set_state(SessionState::Interrupted);
        self.settle()?;

        self.link.write(&[control::ENTER_RAW])?;
        let banner = self.settle()?;
        if banner.contains("raw REPL") {
            debug!("Raw REPL banner received");
        } else {
            trace!("No raw REPL banner seen ({} chars)", banner.len());
        }

        self.set_state(SessionState::RawModeEntered);
        self.link.drain_stale();
        Ok(())
    }

    /// Re-enter raw mode if an earlier exchange left the session unusable.
    ///
    /// A session that is executing is left alone so the caller gets
    /// [`Error::Busy`] from the execution itself.
    pub fn ensure_raw_mode(&self) -> Result<()> {
        match self.state() {
            SessionState::RawModeEntered | SessionState::Executing => Ok(()),
            state => {
                debug!("REPL session in {state:?}, re-initializing");
                self.initialize()
            },
        }
    }

    /// Leave raw mode.
    pub fn exit_raw_mode(&self) -> Result<()> {
        self.ensure_idle("exit_raw_mode")?;
        self.link.write(&[control::EXIT_RAW])?;
        self.set_state(SessionState::RawModeExited);
        Ok(())
    }

    /// Run `source` with the default execution timeout.
    pub fn execute_code(&self, source: &str) -> Result<ExecutionResult> {
        self.execute_with_timeout(source, self.config.exec_timeout)
    }

    /// Run `source`, giving up after `timeout`.
    pub fn execute_with_timeout(&self, source: &str, timeout: Duration) -> Result<ExecutionResult> {
        let started = Instant::now();
        let wire = wrap_source(source);
        let snippet = snippet(source);

        let mut guard = {
            let mut inner = self.lock();
            match inner.state {
                SessionState::RawModeEntered => {},
                SessionState::Executing => return Err(Error::Busy(snippet)),
                other => return Err(Error::NotReady(other)),
            }
            inner.state = SessionState::Executing;
            inner.buffer.clear();
            ExecGuard {
                inner: &self.inner,
                next: SessionState::Unknown,
            }
        };

        self.link.drain_stale();
        let mut payload = Vec::with_capacity(wire.len() + 1);
        payload.extend_from_slice(wire.as_bytes());
        payload.push(control::EXECUTE);
        debug!("REPL exec: {snippet}");
        self.link.write(&payload)?;

        let deadline = started + timeout;
        loop {
            let Some(chunk) = self.link.recv_until(deadline)? else {
                let inner = self.lock();
                let elapsed = started.elapsed();
                warn!("REPL exec of {snippet:?} timed out after {elapsed:?}");
                return Err(if inner.buffer.received() == 0 {
                    Error::timeout(snippet, elapsed, &[])
                } else {
                    Error::Scrape {
                        snippet,
                        elapsed,
                        tail: inner.buffer.tail(ERROR_TAIL_CHARS),
                    }
                });
            };

            let scraped = {
                let mut inner = self.lock();
                inner.buffer.push(&chunk);
                scrape(inner.buffer.text(), &wire, &self.config.terminators)
            };

            if let Scrape::Complete(out) = scraped {
                let exit_code = if out.fault {
                    warn!("Firmware fault during {snippet:?}: {:?}", out.error);
                    -1
                } else {
                    guard.next = SessionState::RawModeEntered;
                    i32::from(out.error.is_some())
                };
                return Ok(ExecutionResult {
                    output: out.output,
                    error: out.error,
                    exit_code,
                    elapsed: started.elapsed(),
                });
            }
        }
    }

    /// Run a file-operation script and turn Python errors into [`Error`]s.
    pub(crate) fn run_file_script(&self, script: &str, path: &str) -> Result<String> {
        let result = self.execute_with_timeout(script, self.config.file_timeout)?;
        match result.error {
            None => Ok(result.output),
            Some(err) if is_not_found(&err) => Err(Error::NotFound(path.to_string())),
            Some(err) => Err(Error::InvalidResponse(format!(
                "{path}: {}",
                error_summary(&err)
            ))),
        }
    }

    /// Read `len` bytes of `path` at `offset`.
    pub fn read_chunk(&self, path: &str, offset: usize, len: usize) -> Result<Vec<u8>> {
        let output = self.run_file_script(&script::read_chunk(path, offset, len), path)?;
        hex::decode(output.trim())
            .map_err(|e| Error::InvalidResponse(format!("{path}: bad hex read-back: {e}")))
    }
}

// Every attempt starts from raw mode, so a retry after a timed-out chunk
// script finds a usable session.
impl<T: Transport> TransferTarget for ReplSession<T> {
    fn preferred_chunk_len(&self) -> usize {
        script::TEXT_CHUNK_SIZE
    }

    fn max_chunk_len(&self, _path: &str) -> Option<usize> {
        Some(script::TEXT_CHUNK_SIZE)
    }

    fn write_chunk(&self, path: &str, chunk: &[u8], mode: WriteMode) -> Result<()> {
        self.ensure_raw_mode()?;
        self.run_file_script(&script::write_chunk(path, chunk, mode), path)
            .map(|_| ())
    }

    fn read_file(&self, path: &str, chunk_size: usize) -> Result<Vec<u8>> {
        self.ensure_raw_mode()?;
        let chunk_size = chunk_size.clamp(1, script::TEXT_CHUNK_SIZE);
        let mut data = Vec::new();
        loop {
            let chunk = self.read_chunk(path, data.len(), chunk_size)?;
            let done = chunk.len() < chunk_size;
            data.extend_from_slice(&chunk);
            if done {
                return Ok(data);
            }
        }
    }
}
