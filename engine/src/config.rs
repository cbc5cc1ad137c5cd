//! Session configuration.
//!
//! Every field has a default, so an empty TOML document (or no file at all)
//! yields a working configuration:
//!
//! ```toml
//! controller = 0
//! max_connections = 5
//! accept_intern = true
//!
//! [reconnect]
//! max_retries = 5
//! initial_backoff_ms = 100
//! ```

use anyhow::{Context, Result};
use capi_phone_common::ColorWhen;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Connection Table capacity of the classic engine.
pub const DEFAULT_MAX_CONNECTIONS: usize = 5;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    // ---
    /// Controller to listen on: 0 = all controllers, n = only controller n.
    pub controller: u32,

    /// Connection Table capacity.
    pub max_connections: usize,

    /// Bounded wait of the dispatch loop for the next message.
    pub wait_timeout_ms: u64,

    /// Admit internal (`**`-prefixed) callers even with an unsupported service.
    pub accept_intern: bool,

    /// Reject callers that do not present a number.
    pub reject_anonymous: bool,

    /// Re-registration policy after a transient receive failure.
    pub reconnect: ReconnectConfig,

    /// Bounded wait for the audio input thread to acknowledge a stop.
    pub audio_stop_timeout_ms: u64,

    /// Recorder flush cadence of the audio input thread.
    pub record_flush_interval_ms: u64,

    /// Time allowed for remote disconnects after the shutdown hang-up sweep.
    pub shutdown_grace_ms: u64,

    /// Colour policy for log output, applied by [`SessionConfig::init_tracing`].
    pub color: ColorWhen,
}

/// Exponential backoff for re-registration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectConfig {
    // ---
    /// Attempts before the dispatch loop gives up.
    pub max_retries: u32,

    pub initial_backoff_ms: u64,

    pub max_backoff_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        // ---
        Self {
            controller: 0,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            wait_timeout_ms: 1000,
            accept_intern: true,
            reject_anonymous: false,
            reconnect: ReconnectConfig::default(),
            audio_stop_timeout_ms: 500,
            record_flush_interval_ms: 1000,
            shutdown_grace_ms: 200,
            color: ColorWhen::Auto,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        // ---
        Self {
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 5000,
        }
    }
}

impl SessionConfig {
    // ---
    /// Parses and validates a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        // ---
        let config: Self = toml::from_str(text).context("failed to parse session config")?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        // ---
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        Self::from_toml_str(&text).with_context(|| format!("invalid config file: {}", path.display()))
    }

    /// Installs the global log subscriber with this config's colour policy.
    ///
    /// Optional: the engine only emits `tracing` events, so a host with its
    /// own subscriber skips this.
    pub fn init_tracing(&self) -> Result<()> {
        capi_phone_common::init_tracing(self.color)
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        // ---
        if self.max_connections == 0 {
            anyhow::bail!("max_connections must be at least 1");
        }
        if self.wait_timeout_ms == 0 {
            anyhow::bail!("wait_timeout_ms must be positive");
        }
        if self.reconnect.initial_backoff_ms > self.reconnect.max_backoff_ms {
            anyhow::bail!(
                "reconnect.initial_backoff_ms ({}) exceeds reconnect.max_backoff_ms ({})",
                self.reconnect.initial_backoff_ms,
                self.reconnect.max_backoff_ms
            );
        }
        Ok(())
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn audio_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.audio_stop_timeout_ms)
    }

    pub fn record_flush_interval(&self) -> Duration {
        Duration::from_millis(self.record_flush_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl ReconnectConfig {
    // ---
    /// Delay before re-registration attempt `attempt` (0-based), doubling
    /// from the initial backoff up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        // ---
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}
