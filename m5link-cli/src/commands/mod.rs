//! Command implementations.
//!
//! Each group of subcommands lives in its own module.

pub(crate) mod completions;
pub(crate) mod device;
pub(crate) mod files;
pub(crate) mod ports;

use {
    crate::{CliError, was_interrupted},
    anyhow::Result,
};

/// Stop before touching the device when Ctrl-C already arrived.
pub(crate) fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Interrupted".to_string()).into())
    } else {
        Ok(())
    }
}
