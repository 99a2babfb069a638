//! Shared logging setup for the CLI front door.
//!
//! The core library never initializes logging itself (an embedder may
//! already have `tracing_subscriber` configured); this is only for the
//! `tablesync-cli` binary.

use crate::error::{Result, TableSyncError};

/// Initializes structured logging based on verbosity level.
///
/// * `verbose` - 0=INFO, 1=DEBUG, 2+=TRACE
/// * `quiet` - if true, only ERROR is shown regardless of `verbose`
pub fn init_logging(verbose: u8, quiet: bool) -> Result<()> {
    let level = match (quiet, verbose) {
        (true, _) => tracing::Level::ERROR,
        (false, 0) => tracing::Level::INFO,
        (false, 1) => tracing::Level::DEBUG,
        (false, _) => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .try_init()
        .map_err(|e| TableSyncError::environment(format!("failed to initialize logging: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    #[test]
    fn verbosity_levels_map_as_expected() {
        let cases = [
            ((true, 0u8), tracing::Level::ERROR),
            ((true, 5), tracing::Level::ERROR),
            ((false, 0), tracing::Level::INFO),
            ((false, 1), tracing::Level::DEBUG),
            ((false, 2), tracing::Level::TRACE),
        ];
        for ((quiet, verbose), expected) in cases {
            let level = match (quiet, verbose) {
                (true, _) => tracing::Level::ERROR,
                (false, 0) => tracing::Level::INFO,
                (false, 1) => tracing::Level::DEBUG,
                (false, _) => tracing::Level::TRACE,
            };
            assert_eq!(level, expected);
        }
    }
}
