// ==============================================================================
// logging.rs - Tracing Setup
// ==============================================================================
// Description: Subscriber initialisation for the command line tool
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when RUST_LOG is unset; `verbose` and `quiet` shift the crate level
pub fn default_directive(verbose: u8, quiet: bool) -> String {
    let level = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    format!("variant_pipeline={}", level)
}

/// Install the global subscriber; logs go to stderr so reports can use stdout
pub fn init(verbose: u8, quiet: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_directive(verbose, quiet).into());
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(0, false), "variant_pipeline=info");
        assert_eq!(default_directive(2, false), "variant_pipeline=trace");
        assert_eq!(default_directive(3, true), "variant_pipeline=warn");
    }
}
