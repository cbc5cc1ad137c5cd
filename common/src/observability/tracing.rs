//! Tracing initialization.
//!
//! The engine only emits `tracing` events; the host decides whether and how
//! they are printed by calling [`init_tracing`] once at startup.

use crate::ColorWhen;
use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// - Respects `RUST_LOG` via `EnvFilter` (defaults to `info`).
/// - ANSI color controlled by `ColorWhen`.
///
/// # Errors
///
/// Returns an error if a global subscriber has already been installed.
pub fn init_tracing(color: ColorWhen) -> Result<()> {
    // ---
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(env_filter)
        .with_ansi(color.should_color_stderr())
        .with_thread_names(true)
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(())
}
