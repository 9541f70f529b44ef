//! Logging helpers
//!
//! The library only emits `tracing` events. Wire dumps are opt-in through
//! [`UpdaterConfig::verbose`](crate::config::UpdaterConfig::verbose) and are
//! handed to each component explicitly.

use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::error::{Result, UpdateError};

const DUMP_BYTES_PER_LINE: usize = 32;

/// Hex-dump `data` at debug level when `enabled`
pub fn dump_bytes(enabled: bool, title: &str, data: &[u8]) {
    if !enabled {
        return;
    }
    debug!("{} ({} bytes)", title, data.len());
    for (i, line) in data.chunks(DUMP_BYTES_PER_LINE).enumerate() {
        let offset = i.saturating_mul(DUMP_BYTES_PER_LINE);
        debug!("  {:06x}: {}", offset, hex::encode(line));
    }
}

/// Install a formatting subscriber for host tooling
///
/// `filter` uses `EnvFilter` syntax, e.g. `mm_firmware_update=debug`.
pub fn init(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(filter)
        .map_err(|e| UpdateError::Config(format!("invalid log filter {filter:?}: {e}")))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| UpdateError::Config(format!("failed to install log subscriber: {e}")))
}
