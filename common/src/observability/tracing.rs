//! Tracing initialization.

use crate::ColorWhen;
use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global fmt subscriber.
///
/// - Filter comes from `RUST_LOG`, falling back to `info` for the gateway
///   crates and `warn` for everything else.
/// - Logs go to stderr so SDP printed on stdout stays machine-readable.
/// - ANSI color controlled by `ColorWhen`.
pub fn init_tracing(color: ColorWhen) -> Result<()> {
    // ---
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,mgw_common=info,mgw_rtp=info,mgw_connection=info,gateway=info"));

    fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(color.should_color_stderr())
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(())
}
