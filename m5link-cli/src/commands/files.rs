//! File commands: ls, cat, get, put and rm.

use {
    super::ensure_not_interrupted,
    crate::{Cli, CliError, config::Config, serial::Settings, use_fancy_output},
    anyhow::{Context, Result},
    console::style,
    indicatif::{ProgressBar, ProgressStyle},
    m5link::EntryKind,
    std::{
        fs,
        io::{self, Write as _},
        path::{Path, PathBuf},
    },
};

/// Ls command implementation.
pub(crate) fn cmd_ls(cli: &Cli, config: &Config, path: &str, json: bool) -> Result<()> {
    ensure_not_interrupted()?;
    let settings = Settings::resolve(cli, config)?;

    let entries = settings.with_device(|device| {
        device
            .list_directory(path)
            .with_context(|| format!("Failed to list {path}"))
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    for entry in &entries {
        match entry.kind {
            EntryKind::Directory => println!("{}/", style(&entry.name).blue().bold()),
            EntryKind::File => println!("{}", entry.name),
        }
    }
    Ok(())
}

/// Cat command implementation.
pub(crate) fn cmd_cat(cli: &Cli, config: &Config, path: &str) -> Result<()> {
    ensure_not_interrupted()?;
    let settings = Settings::resolve(cli, config)?;

    let data = settings.with_device(|device| {
        device
            .read_file(path)
            .with_context(|| format!("Failed to read {path}"))
    })?;

    let mut stdout = io::stdout().lock();
    stdout.write_all(&data)?;
    stdout.flush()?;
    Ok(())
}

/// Get command implementation.
pub(crate) fn cmd_get(
    cli: &Cli,
    config: &Config,
    remote: &str,
    local: Option<&Path>,
) -> Result<()> {
    ensure_not_interrupted()?;
    let local = match local {
        Some(path) => path.to_path_buf(),
        None => default_local_path(remote)?,
    };
    let settings = Settings::resolve(cli, config)?;

    let data = settings.with_device(|device| {
        device
            .read_file(remote)
            .with_context(|| format!("Failed to read {remote}"))
    })?;

    fs::write(&local, &data).with_context(|| format!("Failed to write {}", local.display()))?;
    if !cli.quiet {
        eprintln!(
            "{} {remote} -> {} ({} bytes)",
            style("✓").green(),
            local.display(),
            data.len()
        );
    }
    Ok(())
}

/// Put command implementation.
pub(crate) fn cmd_put(
    cli: &Cli,
    config: &Config,
    local: &Path,
    remote: Option<&str>,
    chunk_size: Option<usize>,
) -> Result<()> {
    ensure_not_interrupted()?;
    let remote = match remote {
        Some(path) => path.to_string(),
        None => default_remote_path(local)?,
    };
    let data = fs::read(local).with_context(|| format!("Failed to read {}", local.display()))?;

    let mut settings = Settings::resolve(cli, config)?;
    if let Some(size) = chunk_size {
        if size == 0 {
            return Err(CliError::Usage("--chunk-size must be at least 1".to_string()).into());
        }
        settings.chunk_size = Some(size);
    }

    let pb = progress_bar(cli.quiet, data.len());
    let job = settings.with_device(|device| {
        device
            .write_file_with_progress(&remote, &data, |done, total| {
                pb.set_length(total as u64);
                pb.set_position(done as u64);
            })
            .with_context(|| format!("Failed to upload {remote}"))
    });
    let job = match job {
        Ok(job) => job,
        Err(e) => {
            pb.abandon();
            return Err(e);
        },
    };
    pb.finish_with_message("done");

    if !cli.quiet {
        eprintln!(
            "{} {} -> {remote} ({} bytes, {}-byte chunks)",
            style("✓").green(),
            local.display(),
            job.total,
            job.chunk_size
        );
    }
    Ok(())
}

/// Rm command implementation.
pub(crate) fn cmd_rm(cli: &Cli, config: &Config, path: &str) -> Result<()> {
    ensure_not_interrupted()?;
    let settings = Settings::resolve(cli, config)?;

    settings.with_device(|device| {
        device
            .delete_file(path)
            .with_context(|| format!("Failed to delete {path}"))
    })?;

    if !cli.quiet {
        eprintln!("{} Removed {path}", style("✓").green());
    }
    Ok(())
}

fn progress_bar(quiet: bool, total: usize) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(total as u64);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
            )
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// `/lib/util.py` downloads to `util.py`.
fn default_local_path(remote: &str) -> Result<PathBuf> {
    remote
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| CliError::Usage(format!("Cannot derive a local name from {remote}")).into())
}

/// `src/main.py` uploads to `/main.py`.
fn default_remote_path(local: &Path) -> Result<String> {
    local
        .file_name()
        .and_then(|name| name.to_str())
        .map(|name| format!("/{name}"))
        .ok_or_else(|| {
            CliError::Usage(format!(
                "Cannot derive a remote name from {}",
                local.display()
            ))
            .into()
        })
}
