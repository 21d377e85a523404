//! Chunked file transfer with per-chunk retry.
//!
//! A file is split into chunks no larger than both the configured chunk size
//! and what the target can carry for that path. Chunks go out strictly in
//! order: the first truncates the remote file, the rest append.
//!
//! ```text
//! data: |---- chunk 0 ----|---- chunk 1 ----|-- chunk 2 --|
//!        WRITE(truncate)   WRITE(append)     WRITE(append)
//!              |                 |                 |
//!          progress(256)     progress(512)     progress(total)
//! ```
//!
//! Failed chunks are retried; nothing already written is rolled back.

use {
    crate::error::{Error, Result},
    log::{debug, warn},
    std::{
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        thread,
        time::Duration,
    },
};

/// Default bytes per chunk for targets without a preference of their own.
pub const DEFAULT_CHUNK_SIZE: usize = 256;

/// Default attempts per chunk.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// How a chunk is applied to the remote file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Replace the file contents.
    Truncate,
    /// Add to the end of the file.
    Append,
}

/// Something files can be written to and read from in pieces.
///
/// Both protocol modes implement this; the transfer logic is shared.
pub trait TransferTarget {
    /// Chunk size used when the caller does not pick one.
    fn preferred_chunk_len(&self) -> usize {
        DEFAULT_CHUNK_SIZE
    }

    /// Largest chunk the target can carry for `path`, if it has a limit.
    fn max_chunk_len(&self, path: &str) -> Option<usize> {
        let _ = path;
        None
    }

    /// Write one chunk.
    fn write_chunk(&self, path: &str, chunk: &[u8], mode: WriteMode) -> Result<()>;

    /// Read a whole file, `chunk_size` bytes per round trip where the target
    /// reads in pieces.
    fn read_file(&self, path: &str, chunk_size: usize) -> Result<Vec<u8>>;
}

/// Tuning for a transfer.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Upper bound on bytes per chunk; `None` uses the target's preference.
    pub chunk_size: Option<usize>,
    /// Attempts per chunk before the transfer fails.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub retry_delay: Duration,
    /// Set to abort between chunks.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: Duration::from_millis(200),
            cancel: None,
        }
    }
}

impl TransferOptions {
    fn interrupted(&self) -> bool {
        crate::is_interrupted_requested()
            || self
                .cancel
                .as_ref()
                .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

/// Progress of one upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferJob {
    /// Remote path.
    pub path: String,
    /// Total bytes to send.
    pub total: usize,
    /// Effective bytes per chunk.
    pub chunk_size: usize,
    /// Bytes the device has acknowledged. Never decreases.
    pub acknowledged: usize,
    /// Attempts made on the current chunk.
    pub attempts: u32,
}

impl TransferJob {
    fn new(path: &str, total: usize, chunk_size: usize) -> Self {
        Self {
            path: path.to_string(),
            total,
            chunk_size,
            acknowledged: 0,
            attempts: 0,
        }
    }

    /// Whether every byte was acknowledged.
    pub fn is_complete(&self) -> bool {
        self.acknowledged == self.total
    }
}

/// Chunk size actually used for `path` on `target`.
pub fn effective_chunk_size<T>(target: &T, path: &str, options: &TransferOptions) -> Result<usize>
where
    T: TransferTarget + ?Sized,
{
    let requested = options
        .chunk_size
        .unwrap_or_else(|| target.preferred_chunk_len());
    if requested == 0 {
        return Err(Error::Config("chunk size must be at least 1 byte".into()));
    }
    let limit = target.max_chunk_len(path).unwrap_or(usize::MAX);
    let size = requested.min(limit);
    if size == 0 {
        return Err(Error::PayloadTooLarge {
            size: requested,
            max: limit,
        });
    }
    Ok(size)
}

/// Write `data` to `path`, reporting `(acknowledged, total)` after each chunk.
pub fn upload<T, F>(
    target: &T,
    path: &str,
    data: &[u8],
    options: &TransferOptions,
    mut progress: F,
) -> Result<TransferJob>
where
    T: TransferTarget + ?Sized,
    F: FnMut(usize, usize),
{
    let chunk_size = effective_chunk_size(target, path, options)?;
    let mut job = TransferJob::new(path, data.len(), chunk_size);
    debug!(
        "Uploading {path}: {} bytes in chunks of {chunk_size}",
        data.len()
    );

    if data.is_empty() {
        send_chunk(target, &mut job, &[], WriteMode::Truncate, options)?;
        progress(0, 0);
        return Ok(job);
    }

    for (index, chunk) in data.chunks(chunk_size).enumerate() {
        if options.interrupted() {
            return Err(Error::Interrupted);
        }

        let mode = if index == 0 {
            WriteMode::Truncate
        } else {
            WriteMode::Append
        };
        send_chunk(target, &mut job, chunk, mode, options)?;

        job.acknowledged += chunk.len();
        progress(job.acknowledged, job.total);
    }

    debug!("Upload of {path} complete");
    Ok(job)
}

fn send_chunk<T>(
    target: &T,
    job: &mut TransferJob,
    chunk: &[u8],
    mode: WriteMode,
    options: &TransferOptions,
) -> Result<()>
where
    T: TransferTarget + ?Sized,
{
    let max_attempts = options.max_attempts.max(1);
    job.attempts = 0;

    loop {
        job.attempts += 1;
        match target.write_chunk(&job.path, chunk, mode) {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && job.attempts < max_attempts => {
                warn!(
                    "Chunk at offset {} of {} failed (attempt {}/{max_attempts}): {e}",
                    job.acknowledged, job.path, job.attempts
                );
                thread::sleep(options.retry_delay);
            },
            Err(e) if e.is_retryable() => {
                return Err(Error::Transfer {
                    path: job.path.clone(),
                    offset: job.acknowledged,
                    attempts: job.attempts,
                    source: Box::new(e),
                });
            },
            Err(e) => return Err(e),
        }
    }
}

/// Read `path` back from `target`.
pub fn download<T>(target: &T, path: &str, options: &TransferOptions) -> Result<Vec<u8>>
where
    T: TransferTarget + ?Sized,
{
    let chunk_size = effective_chunk_size(target, path, options)?;
    let max_attempts = options.max_attempts.max(1);
    let mut attempts = 0;

    loop {
        attempts += 1;
        match target.read_file(path, chunk_size) {
            Ok(data) => {
                debug!("Downloaded {path}: {} bytes", data.len());
                return Ok(data);
            },
            Err(e) if e.is_retryable() && attempts < max_attempts => {
                warn!("Reading {path} failed (attempt {attempts}/{max_attempts}): {e}");
                thread::sleep(options.retry_delay);
            },
            Err(e) if e.is_retryable() => {
                return Err(Error::Transfer {
                    path: path.to_string(),
                    offset: 0,
                    attempts,
                    source: Box::new(e),
                });
            },
            Err(e) => return Err(e),
        }
    }
}
