//! Connection settings and device sessions.
//!
//! Every device command goes through [`Settings`]: flags and environment
//! variables (already merged by clap) win over the config file, which wins
//! over built-in defaults. The serial port falls back to auto-detection when
//! neither names one.

use {
    crate::{Cli, CliError, ModeArg, config::Config},
    anyhow::{Context, Result},
    log::{debug, info},
    m5link::{
        Device, DeviceConfig, NativeTransport, ProtocolMode, SerialConfig, auto_detect_port,
        port::DEFAULT_BAUD,
        transfer::DEFAULT_MAX_ATTEMPTS,
    },
    std::time::Duration,
};

/// Resolved connection and transfer settings for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Explicit port, if any; `None` means auto-detect.
    pub port: Option<String>,
    /// Baud rate.
    pub baud: u32,
    /// Protocol mode.
    pub mode: ProtocolMode,
    /// Command deadline, if overridden.
    pub timeout: Option<Duration>,
    /// Upload chunk size; `None` leaves it to the protocol mode.
    pub chunk_size: Option<usize>,
    /// Attempts per chunk.
    pub retries: u32,
}

impl From<ModeArg> for ProtocolMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Repl => Self::Repl,
            ModeArg::Binary => Self::Binary,
        }
    }
}

impl Settings {
    /// Merge CLI arguments over the loaded configuration.
    pub fn resolve(cli: &Cli, config: &Config) -> Result<Self> {
        let connection = &config.connection;

        let mode = match (cli.mode, connection.mode.as_deref()) {
            (Some(mode), _) => mode.into(),
            (None, Some(text)) => text
                .parse()
                .map_err(|e: m5link::Error| CliError::Config(e.to_string()))?,
            (None, None) => ProtocolMode::default(),
        };

        let retries = config.transfer.retries.unwrap_or(DEFAULT_MAX_ATTEMPTS);
        if retries == 0 {
            return Err(CliError::Config("transfer.retries must be at least 1".into()).into());
        }

        Ok(Self {
            port: cli.port.clone().or_else(|| connection.port.clone()),
            baud: cli.baud.or(connection.baud).unwrap_or(DEFAULT_BAUD),
            mode,
            timeout: cli
                .timeout
                .or(connection.timeout)
                .map(Duration::from_millis),
            chunk_size: config.transfer.chunk_size,
            retries,
        })
    }

    /// Library configuration for these settings.
    pub fn device_config(&self) -> DeviceConfig {
        let mut config = DeviceConfig {
            mode: self.mode,
            ..DeviceConfig::default()
        };
        if let Some(timeout) = self.timeout {
            config.command_timeout = timeout;
            config.repl.exec_timeout = timeout;
            config.repl.file_timeout = timeout;
        }
        config.transfer.chunk_size = self.chunk_size;
        config.transfer.max_attempts = self.retries;
        config
    }

    fn port_name(&self) -> Result<String> {
        if let Some(port) = &self.port {
            debug!("Using port {port}");
            return Ok(port.clone());
        }
        let detected = auto_detect_port().context("No port given and none detected")?;
        Ok(detected.name)
    }

    /// Connect, run `op` against the device, then disconnect.
    pub fn with_device<R>(
        &self,
        op: impl FnOnce(&Device<NativeTransport>) -> Result<R>,
    ) -> Result<R> {
        let port = self.port_name()?;
        let transport = NativeTransport::new(SerialConfig::new(&port, self.baud));
        let mut device = Device::new(transport, self.device_config());

        device
            .connect()
            .with_context(|| format!("Failed to connect to {port}"))?;
        info!("Connected to {port} ({} mode, {} baud)", self.mode, self.baud);

        let result = op(&device);
        if let Err(e) = device.disconnect() {
            debug!("Disconnect from {port} failed: {e}");
        }
        result
    }
}
