//! High-level device operations over either protocol mode.
//!
//! [`Device`] owns the transport. In [`ProtocolMode::Binary`] operations map
//! onto framed commands; in [`ProtocolMode::Repl`] they become inline
//! MicroPython scripts run through the raw REPL.

pub mod info;
pub mod listing;

use {
    crate::{
        channel::{self, CommandChannel},
        error::{Error, Result},
        port::Transport,
        repl::{
            ExecutionResult, ReplConfig, ReplSession, SessionState,
            scrape::{TRACEBACK_HEADER, error_summary, is_not_found},
            script,
        },
        transfer::{self, TransferJob, TransferOptions, TransferTarget},
    },
    log::{debug, info, warn},
    std::{
        fmt,
        str::FromStr,
        sync::{
            Mutex, PoisonError,
            mpsc::{self, Receiver, Sender},
        },
        time::{Duration, Instant},
    },
};

pub use {
    info::{DeviceInfo, InfoFormat},
    listing::{DirEntry, EntryKind},
};

/// Which protocol the device speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ProtocolMode {
    /// Framed binary commands.
    Binary,
    /// Raw REPL scripts.
    #[default]
    Repl,
}

impl fmt::Display for ProtocolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Binary => "binary",
            Self::Repl => "repl",
        })
    }
}

impl FromStr for ProtocolMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "binary" | "bin" => Ok(Self::Binary),
            "repl" | "text" => Ok(Self::Repl),
            other => Err(Error::Config(format!(
                "unknown protocol mode {other:?} (expected binary or repl)"
            ))),
        }
    }
}

/// Settings for a [`Device`].
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Protocol mode.
    pub mode: ProtocolMode,
    /// Binary command deadline.
    pub command_timeout: Duration,
    /// REPL settings.
    pub repl: ReplConfig,
    /// File transfer settings.
    pub transfer: TransferOptions,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            mode: ProtocolMode::default(),
            command_timeout: channel::DEFAULT_TIMEOUT,
            repl: ReplConfig::default(),
            transfer: TransferOptions::default(),
        }
    }
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The link was opened and the protocol is ready.
    Connected {
        /// Transport endpoint name.
        port: String,
        /// Active mode.
        mode: ProtocolMode,
    },
    /// The link was closed.
    Disconnected {
        /// Transport endpoint name.
        port: String,
    },
    /// An operation failed.
    Error {
        /// Error description.
        message: String,
    },
}

enum Session<T: Transport> {
    Binary(CommandChannel<T>),
    Repl(ReplSession<T>),
}

impl<T: Transport> Session<T> {
    fn into_transport(self) -> T {
        match self {
            Self::Binary(channel) => channel.into_transport(),
            Self::Repl(session) => session.into_transport(),
        }
    }
}

/// A MicroPython device behind one transport.
pub struct Device<T: Transport> {
    config: DeviceConfig,
    name: String,
    idle: Option<T>,
    session: Option<Session<T>>,
    observers: Mutex<Vec<Sender<DeviceEvent>>>,
}

impl<T: Transport> Device<T> {
    /// Wrap a transport. Nothing is opened until [`Device::connect`].
    pub fn new(transport: T, config: DeviceConfig) -> Self {
        Self {
            name: transport.name().to_string(),
            config,
            idle: Some(transport),
            session: None,
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Protocol mode in use.
    pub fn mode(&self) -> ProtocolMode {
        self.config.mode
    }

    /// Transport endpoint name.
    pub fn port_name(&self) -> &str {
        &self.name
    }

    /// Whether [`Device::connect`] succeeded and no disconnect followed.
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Receive lifecycle events from now on.
    pub fn subscribe_events(&self) -> Receiver<DeviceEvent> {
        let (tx, rx) = mpsc::channel();
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    fn emit(&self, event: &DeviceEvent) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn report<R>(&self, result: Result<R>) -> Result<R> {
        if let Err(e) = &result {
            if !matches!(e, Error::NotFound(_) | Error::NotConnected) {
                self.emit(&DeviceEvent::Error {
                    message: e.to_string(),
                });
            }
        }
        result
    }

    /// Open the transport and bring the protocol up.
    pub fn connect(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        let mut transport = self.idle.take().ok_or(Error::NotConnected)?;

        if let Err(e) = transport.open() {
            self.idle = Some(transport);
            return self.report(Err(e));
        }

        let session = match self.config.mode {
            ProtocolMode::Binary => Session::Binary(CommandChannel::new(
                transport,
                self.config.command_timeout,
            )),
            ProtocolMode::Repl => {
                let session = ReplSession::new(transport, self.config.repl.clone());
                if let Err(e) = session.initialize() {
                    let mut transport = session.into_transport();
                    let _ = transport.close();
                    self.idle = Some(transport);
                    return self.report(Err(e));
                }
                Session::Repl(session)
            },
        };

        self.session = Some(session);
        info!("Connected to {} ({} mode)", self.name, self.config.mode);
        self.emit(&DeviceEvent::Connected {
            port: self.name.clone(),
            mode: self.config.mode,
        });
        Ok(())
    }

    /// Close the transport. A no-op when not connected.
    pub fn disconnect(&mut self) -> Result<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };

        if let Session::Repl(repl) = &session {
            if repl.state() == SessionState::RawModeEntered {
                // hand the board back in friendly mode
                if let Err(e) = repl.exit_raw_mode() {
                    debug!("Leaving raw mode on {} failed: {e}", self.name);
                }
            }
        }

        let mut transport = session.into_transport();
        let result = transport.close();
        self.idle = Some(transport);

        info!("Disconnected from {}", self.name);
        self.emit(&DeviceEvent::Disconnected {
            port: self.name.clone(),
        });
        self.report(result)
    }

    /// Give the transport back, closing it if it is open.
    pub fn into_transport(mut self) -> Option<T> {
        let _ = self.disconnect();
        self.idle.take()
    }

    fn session(&self) -> Result<&Session<T>> {
        self.session.as_ref().ok_or(Error::NotConnected)
    }

    /// A REPL session that is ready to execute, re-initializing if needed.
    fn ready_repl<'a>(&self, session: &'a ReplSession<T>) -> Result<&'a ReplSession<T>> {
        session.ensure_raw_mode()?;
        Ok(session)
    }

    fn target(&self) -> Result<&dyn TransferTarget> {
        let target: &dyn TransferTarget = match self.session()? {
            Session::Binary(channel) => channel,
            Session::Repl(session) => self.ready_repl(session)?,
        };
        Ok(target)
    }

    /// Whether the device answers the online check.
    pub fn is_online(&self) -> bool {
        let result = match self.session() {
            Ok(Session::Binary(channel)) => channel.ping(),
            Ok(Session::Repl(session)) => self
                .ready_repl(session)
                .and_then(|s| s.execute_code(&script::online_check()))
                .and_then(|r| {
                    if r.output.trim() == script::ONLINE_MARKER {
                        Ok(())
                    } else {
                        Err(Error::InvalidResponse(r.output))
                    }
                }),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                debug!("Online check failed: {e}");
                false
            },
        }
    }

    /// Platform, firmware and hardware facts.
    pub fn get_device_info(&self) -> Result<DeviceInfo> {
        let result = match self.session()? {
            Session::Binary(channel) => channel.get_info(),
            Session::Repl(session) => {
                let result = self
                    .ready_repl(session)?
                    .execute_code(&script::device_info())?;
                match result.error {
                    None => Ok(result.output),
                    Some(err) => Err(Error::InvalidResponse(error_summary(&err).to_string())),
                }
            },
        };
        self.report(result.and_then(|text| DeviceInfo::parse(&text)))
    }

    /// Entries of the directory at `path`.
    pub fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>> {
        let raw = match self.session()? {
            Session::Binary(channel) => channel.list_dir(path),
            Session::Repl(session) => self
                .ready_repl(session)?
                .run_file_script(&script::list_dir(path), path),
        };
        self.report(raw.map(|raw| listing::parse_listing(path, &raw)))
    }

    /// Contents of the file at `path`.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let target = self.target()?;
        self.report(transfer::download(target, path, &self.config.transfer))
    }

    /// Replace the file at `path` with `data`.
    pub fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        self.write_file_with_progress(path, data, |_, _| {})
            .map(|_| ())
    }

    /// Replace the file at `path`, reporting `(acknowledged, total)` bytes.
    pub fn write_file_with_progress<F>(
        &self,
        path: &str,
        data: &[u8],
        progress: F,
    ) -> Result<TransferJob>
    where
        F: FnMut(usize, usize),
    {
        let target = self.target()?;
        self.report(transfer::upload(
            target,
            path,
            data,
            &self.config.transfer,
            progress,
        ))
    }

    /// Remove the file at `path`.
    pub fn delete_file(&self, path: &str) -> Result<()> {
        let result = match self.session()? {
            Session::Binary(channel) => channel.remove_file(path),
            Session::Repl(session) => self
                .ready_repl(session)?
                .run_file_script(&script::remove_file(path), path)
                .map(|_| ()),
        };
        self.report(result)
    }

    /// Run source code and collect its output.
    pub fn execute_code(&self, code: &str) -> Result<ExecutionResult> {
        let result = match self.session()? {
            Session::Binary(channel) => {
                let started = Instant::now();
                channel
                    .execute(code)
                    .map(|output| binary_result(&output, started.elapsed()))
            },
            Session::Repl(session) => self.ready_repl(session)?.execute_code(code),
        };
        self.report(result)
    }

    /// Run a file that is already on the device.
    pub fn execute_file(&self, path: &str) -> Result<ExecutionResult> {
        let result = self.execute_code(&script::execute_file(path))?;
        match &result.error {
            Some(err) if is_not_found(err) => Err(Error::NotFound(path.to_string())),
            _ => Ok(result),
        }
    }

    /// Point the station interface at a network.
    pub fn set_wifi_config(&self, ssid: &str, password: &str) -> Result<()> {
        let result = match self.session()? {
            Session::Binary(channel) => channel.set_wifi(ssid, password),
            Session::Repl(session) => self
                .ready_repl(session)?
                .execute_code(&script::set_wifi(ssid, password))
                .and_then(|r| match r.error {
                    None => Ok(()),
                    Some(err) => {
                        warn!("Wi-Fi setup failed on {}", self.name);
                        Err(Error::InvalidResponse(error_summary(&err).to_string()))
                    },
                }),
        };
        self.report(result)
    }
}

/// Binary execute replies carry output and any traceback in one text.
fn binary_result(output: &str, elapsed: Duration) -> ExecutionResult {
    let output = output.replace("\r\n", "\n");
    match output.find(TRACEBACK_HEADER) {
        Some(pos) => ExecutionResult {
            output: output[..pos].trim_end().to_string(),
            error: Some(output[pos..].trim_end().to_string()),
            exit_code: 1,
            elapsed,
        },
        None => ExecutionResult {
            output: output.trim_end().to_string(),
            error: None,
            exit_code: 0,
            elapsed,
        },
    }
}
