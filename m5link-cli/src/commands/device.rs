//! Device commands: ping, info, code execution and Wi-Fi setup.

use {
    super::ensure_not_interrupted,
    crate::{Cli, CliError, config::Config, serial::Settings},
    anyhow::{Context, Result, bail},
    console::style,
    m5link::{DeviceInfo, ExecutionResult},
    std::io::{self, Write as _},
};

/// Ping command implementation.
pub(crate) fn cmd_ping(cli: &Cli, config: &Config) -> Result<()> {
    ensure_not_interrupted()?;
    let settings = Settings::resolve(cli, config)?;

    let online = settings.with_device(|device| Ok(device.is_online()))?;
    if !online {
        bail!("Device did not answer");
    }
    if !cli.quiet {
        eprintln!("{} Device is online", style("✓").green());
    }
    Ok(())
}

/// Info command implementation.
pub(crate) fn cmd_info(cli: &Cli, config: &Config, json: bool) -> Result<()> {
    ensure_not_interrupted()?;
    let settings = Settings::resolve(cli, config)?;

    let info = settings.with_device(|device| {
        device
            .get_device_info()
            .context("Failed to read device info")
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        for (key, value) in info_rows(&info) {
            println!("{:<12} {value}", style(format!("{key}:")).bold());
        }
    }
    Ok(())
}

fn info_rows(info: &DeviceInfo) -> Vec<(String, String)> {
    let mut rows = Vec::new();
    let mut push = |key: &str, value: Option<String>| {
        if let Some(value) = value {
            rows.push((key.to_string(), value));
        }
    };

    push("Platform", info.platform.clone());
    push("Version", info.version.clone());
    push("Chip ID", info.chip_id.clone());
    push("Flash", info.flash_size.map(format_size));
    push("RAM", info.ram_size.map(format_size));
    push("MAC", info.mac_address.clone());

    rows.extend(info.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    rows
}

/// `4194304` becomes `4194304 (4 MiB)`.
fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;

    if bytes >= MIB && bytes % MIB == 0 {
        format!("{bytes} ({} MiB)", bytes / MIB)
    } else if bytes >= KIB && bytes % KIB == 0 {
        format!("{bytes} ({} KiB)", bytes / KIB)
    } else {
        bytes.to_string()
    }
}

/// Run command implementation.
pub(crate) fn cmd_run(cli: &Cli, config: &Config, code: &str) -> Result<()> {
    ensure_not_interrupted()?;
    let settings = Settings::resolve(cli, config)?;

    let result = settings.with_device(|device| Ok(device.execute_code(code)?))?;
    report_execution(&result)
}

/// Exec command implementation.
pub(crate) fn cmd_exec(cli: &Cli, config: &Config, path: &str) -> Result<()> {
    ensure_not_interrupted()?;
    let settings = Settings::resolve(cli, config)?;

    let result = settings.with_device(|device| Ok(device.execute_file(path)?))?;
    report_execution(&result)
}

/// Output goes to stdout, the traceback to stderr.
fn report_execution(result: &ExecutionResult) -> Result<()> {
    let mut stdout = io::stdout().lock();
    stdout.write_all(result.output.as_bytes())?;
    if !result.output.is_empty() && !result.output.ends_with('\n') {
        stdout.write_all(b"\n")?;
    }
    stdout.flush()?;

    match &result.error {
        Some(error) => {
            eprintln!("{}", style(error.trim_end()).red());
            Err(CliError::Script(result.exit_code).into())
        },
        None => {
            log::debug!("Finished in {:?}", result.elapsed);
            Ok(())
        },
    }
}

/// Wifi command implementation.
pub(crate) fn cmd_wifi(cli: &Cli, config: &Config, ssid: &str, password: &str) -> Result<()> {
    ensure_not_interrupted()?;
    if ssid.is_empty() {
        return Err(CliError::Usage("SSID must not be empty".to_string()).into());
    }
    let settings = Settings::resolve(cli, config)?;

    settings.with_device(|device| {
        device
            .set_wifi_config(ssid, password)
            .context("Failed to set Wi-Fi configuration")
    })?;

    if !cli.quiet {
        eprintln!(
            "{} Wi-Fi set to {}",
            style("✓").green(),
            style(ssid).cyan()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use {super::*, std::time::Duration};

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(4_194_304), "4194304 (4 MiB)");
        assert_eq!(format_size(327_680), "327680 (320 KiB)");
        assert_eq!(format_size(1000), "1000");
    }

    #[test]
    fn test_info_rows_skip_missing_fields() {
        let mut info = DeviceInfo {
            platform: Some("esp32".into()),
            flash_size: Some(8 * 1024 * 1024),
            ..DeviceInfo::default()
        };
        info.extra.insert("uptime".into(), "12s".into());

        let rows = info_rows(&info);
        assert_eq!(
            rows,
            vec![
                ("Platform".to_string(), "esp32".to_string()),
                ("Flash".to_string(), "8388608 (8 MiB)".to_string()),
                ("uptime".to_string(), "12s".to_string()),
            ]
        );
    }

    #[test]
    fn test_failed_execution_maps_to_script_error() {
        let result = ExecutionResult {
            output: String::new(),
            error: Some("Traceback (most recent call last):\nNameError: x".into()),
            exit_code: 1,
            elapsed: Duration::from_millis(3),
        };
        let err = report_execution(&result).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Script(1))
        ));
    }
}
