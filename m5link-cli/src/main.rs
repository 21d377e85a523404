//! m5link CLI - talk to MicroPython boards over a serial link.
//!
//! ## Features
//!
//! - Run code and scripts through the raw REPL or the binary protocol
//! - List, read, upload and delete files on the device
//! - Query device information and configure Wi-Fi
//! - Serial port auto-detection
//! - Shell completion generation
//! - Environment variable and config file support

use {
    anyhow::Result,
    clap::{Parser, Subcommand, ValueEnum},
    clap_complete::Shell,
    config::Config,
    console::style,
    env_logger::Env,
    log::debug,
    std::{
        env,
        path::PathBuf,
        sync::atomic::{AtomicBool, Ordering},
    },
    thiserror::Error,
};

mod commands;
mod config;
mod serial;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Errors the CLI raises itself, classified for exit codes.
#[derive(Debug, Error)]
pub(crate) enum CliError {
    /// Bad invocation.
    #[error("{0}")]
    Usage(String),
    /// Bad configuration file or value.
    #[error("{0}")]
    Config(String),
    /// Interrupted by the user.
    #[error("{0}")]
    Cancelled(String),
    /// Code ran on the device and raised.
    #[error("script failed with exit code {0}")]
    Script(i32),
}

/// m5link - talk to MicroPython boards (M5Stack, ESP32) over serial.
///
/// Environment variables:
///   M5LINK_PORT     - Default serial port
///   M5LINK_BAUD     - Default baud rate (default: 115200)
///   M5LINK_MODE     - Protocol mode (repl, binary)
#[derive(Parser)]
#[command(name = "m5link")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:
  m5link list-ports
  m5link -p /dev/ttyACM0 run \"print(1 + 1)\"
  m5link put main.py /main.py
  m5link --mode binary info --json")]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "M5LINK_PORT")]
    port: Option<String>,

    /// Baud rate [default: 115200].
    #[arg(short, long, global = true, env = "M5LINK_BAUD")]
    baud: Option<u32>,

    /// Protocol mode [default: repl].
    #[arg(long, global = true, value_enum, env = "M5LINK_MODE")]
    mode: Option<ModeArg>,

    /// Timeout in milliseconds for each device exchange.
    #[arg(long, global = true, value_name = "MS")]
    timeout: Option<u64>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Protocol modes accepted on the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum ModeArg {
    /// Raw REPL with output scraping.
    Repl,
    /// Framed binary commands.
    Binary,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// List available serial ports.
    ListPorts {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Check whether the device answers.
    Ping,

    /// Show device information.
    Info {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List a directory on the device.
    Ls {
        /// Directory to list.
        #[arg(default_value = "/")]
        path: String,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print a file from the device.
    Cat {
        /// File on the device.
        path: String,
    },

    /// Download a file from the device.
    Get {
        /// File on the device.
        remote: String,

        /// Local destination (defaults to the remote file name).
        local: Option<PathBuf>,
    },

    /// Upload a file to the device.
    Put {
        /// Local file.
        local: PathBuf,

        /// Destination on the device (defaults to /<file name>).
        remote: Option<String>,

        /// Bytes per chunk.
        #[arg(long, value_name = "N")]
        chunk_size: Option<usize>,
    },

    /// Delete a file on the device.
    Rm {
        /// File on the device.
        path: String,
    },

    /// Run a snippet of code.
    Run {
        /// Source code.
        code: String,
    },

    /// Run a file stored on the device.
    Exec {
        /// File on the device.
        path: String,
    },

    /// Set the Wi-Fi network the device joins.
    Wifi {
        /// Network name.
        ssid: String,

        /// Network password.
        password: String,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Map an error to the process exit code.
///
/// 1 generic failure, 2 usage, 3 configuration, 4 device not found or
/// unreachable, 130 cancelled.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Config(_) => 3,
            CliError::Cancelled(_) => 130,
            CliError::Script(_) => 1,
        };
    }

    match err.downcast_ref::<m5link::Error>() {
        Some(m5link::Error::Interrupted) => 130,
        Some(m5link::Error::Config(_)) => 3,
        Some(
            m5link::Error::NoPortFound | m5link::Error::NotConnected | m5link::Error::Serial(_),
        ) => 4,
        _ => 1,
    }
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

fn install_interrupt_handler() {
    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Failed to install Ctrl-C handler: {e}");
    }
    m5link::set_interrupt_checker(was_interrupted);
}

fn run(cli: &Cli) -> Result<()> {
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::ListPorts { json } => commands::ports::cmd_list_ports(*json),
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        },
        Commands::Ping => commands::device::cmd_ping(cli, &config),
        Commands::Info { json } => commands::device::cmd_info(cli, &config, *json),
        Commands::Ls { path, json } => commands::files::cmd_ls(cli, &config, path, *json),
        Commands::Cat { path } => commands::files::cmd_cat(cli, &config, path),
        Commands::Get { remote, local } => {
            commands::files::cmd_get(cli, &config, remote, local.as_deref())
        },
        Commands::Put {
            local,
            remote,
            chunk_size,
        } => commands::files::cmd_put(cli, &config, local, remote.as_deref(), *chunk_size),
        Commands::Rm { path } => commands::files::cmd_rm(cli, &config, path),
        Commands::Run { code } => commands::device::cmd_run(cli, &config, code),
        Commands::Exec { path } => commands::device::cmd_exec(cli, &config, path),
        Commands::Wifi { ssid, password } => {
            commands::device::cmd_wifi(cli, &config, ssid, password)
        },
    }
}

fn main() {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(&cli);
    install_interrupt_handler();

    debug!(
        "m5link v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(err) = run(&cli) {
        let code = exit_code_for(&err);
        if !matches!(err.downcast_ref::<CliError>(), Some(CliError::Script(_))) {
            eprintln!("{} {err:#}", style("Error:").red().bold());
        }
        std::process::exit(code);
    }
}

#[cfg(test)]
mod tests {
    use {super::*, clap::CommandFactory};

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_put() {
        let cli = Cli::parse_from(["m5link", "put", "main.py", "/app/main.py", "--chunk-size", "128"]);
        match cli.command {
            Commands::Put {
                local,
                remote,
                chunk_size,
            } => {
                assert_eq!(local, PathBuf::from("main.py"));
                assert_eq!(remote.as_deref(), Some("/app/main.py"));
                assert_eq!(chunk_size, Some(128));
            },
            _ => panic!("Expected Put command"),
        }
    }

    #[test]
    fn test_cli_parse_ls_default_path() {
        let cli = Cli::parse_from(["m5link", "ls"]);
        match cli.command {
            Commands::Ls { path, json } => {
                assert_eq!(path, "/");
                assert!(!json);
            },
            _ => panic!("Expected Ls command"),
        }
    }

    #[test]
    fn test_cli_parse_get_without_local() {
        let cli = Cli::parse_from(["m5link", "get", "/boot.py"]);
        match cli.command {
            Commands::Get { remote, local } => {
                assert_eq!(remote, "/boot.py");
                assert!(local.is_none());
            },
            _ => panic!("Expected Get command"),
        }
    }

    #[test]
    fn test_cli_parse_wifi() {
        let cli = Cli::parse_from(["m5link", "wifi", "home", "secret"]);
        assert!(matches!(
            cli.command,
            Commands::Wifi { ref ssid, ref password } if ssid == "home" && password == "secret"
        ));
    }

    #[test]
    fn test_cli_global_options() {
        let cli = Cli::parse_from([
            "m5link",
            "run",
            "print(1)",
            "-p",
            "/dev/ttyUSB0",
            "-b",
            "921600",
            "--mode",
            "binary",
            "--timeout",
            "2000",
            "-vv",
        ]);
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(cli.baud, Some(921_600));
        assert_eq!(cli.mode, Some(ModeArg::Binary));
        assert_eq!(cli.timeout, Some(2000));
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_cli_missing_subcommand() {
        assert!(Cli::try_parse_from(["m5link"]).is_err());
    }

    #[test]
    fn test_cli_invalid_mode() {
        assert!(Cli::try_parse_from(["m5link", "--mode", "morse", "ping"]).is_err());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code_for(&CliError::Usage("x".into()).into()), 2);
        assert_eq!(exit_code_for(&CliError::Config("x".into()).into()), 3);
        assert_eq!(exit_code_for(&CliError::Cancelled("x".into()).into()), 130);
        assert_eq!(exit_code_for(&CliError::Script(1).into()), 1);
        assert_eq!(exit_code_for(&m5link::Error::NoPortFound.into()), 4);
        assert_eq!(exit_code_for(&m5link::Error::Interrupted.into()), 130);
        assert_eq!(exit_code_for(&anyhow::anyhow!("boom")), 1);
    }

    #[test]
    fn test_exit_code_sees_through_context() {
        use anyhow::Context as _;

        let err = Err::<(), _>(m5link::Error::NotConnected)
            .context("Failed to connect to COM3")
            .unwrap_err();
        assert_eq!(exit_code_for(&err), 4);
    }
}
