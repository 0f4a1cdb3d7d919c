//! Configuration management for the live-data engine.
//!
//! Hierarchical loading in three layers:
//! 1. Default values from code
//! 2. Configuration file specified by `CONFIG_PATH` (optional)
//! 3. Well-known environment variables (highest priority)

use std::env;

use config::Config;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Polling driver parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PollingConfig {
    /// Minimum spacing between polls triggered by invalidations, in
    /// milliseconds (leading + trailing throttle).
    pub throttle_ms: u64,
    /// Forced poll interval in milliseconds, covering writes the
    /// crossbar never sees.
    pub interval_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            throttle_ms: 50,
            interval_ms: 10_000,
        }
    }
}

/// Session heartbeat parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Milliseconds of client silence before the server sends a `ping`.
    /// Zero disables the heartbeat entirely.
    pub interval_ms: u64,
    /// Milliseconds after a server `ping` with no inbound traffic before
    /// the session is closed.
    pub timeout_ms: u64,
    /// Whether the server answers client `ping` with `pong`.
    pub respond_to_pings: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 15_000,
            timeout_ms: 15_000,
            respond_to_pings: true,
        }
    }
}

/// Transport-boundary parameters, consumed by the connection layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransportConfig {
    /// Number of trusted proxies; governs client-IP derivation from
    /// `x-forwarded-for`. Zero trusts the socket peer address.
    pub forwarded_count: u32,
    /// Serve long-poll only; the WebSocket upgrade path is disabled.
    pub disable_websockets: bool,
    /// Emit a session-affinity cookie.
    pub use_jsessionid: bool,
}

/// Main configuration container for the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub polling: PollingConfig,
    pub heartbeat: HeartbeatConfig,
    pub transport: TransportConfig,
}

impl EngineConfig {
    /// Load configuration: defaults, then the optional `CONFIG_PATH`
    /// file, then environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder();
        if let Ok(path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&path));
        }
        let loaded = builder.build()?;
        let mut cfg: EngineConfig = loaded.try_deserialize()?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply the well-known environment overrides.
    fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_u64("METEOR_POLLING_THROTTLE_MS")? {
            self.polling.throttle_ms = v;
        }
        if let Some(v) = env_u64("METEOR_POLLING_INTERVAL_MS")? {
            self.polling.interval_ms = v;
        }
        if let Some(v) = env_u64("HTTP_FORWARDED_COUNT")? {
            self.transport.forwarded_count = v as u32;
        }
        if env::var_os("DISABLE_WEBSOCKETS").is_some() {
            self.transport.disable_websockets = true;
        }
        if env::var_os("USE_JSESSIONID").is_some() {
            self.transport.use_jsessionid = true;
        }
        Ok(())
    }

    /// Component-wise validation.
    pub fn validate(&self) -> Result<()> {
        if self.polling.interval_ms == 0 {
            return Err(Error::Fatal("polling.interval_ms must be positive".to_string()));
        }
        if self.polling.interval_ms < self.polling.throttle_ms {
            return Err(Error::Fatal(
                "polling.interval_ms must be at least polling.throttle_ms".to_string(),
            ));
        }
        if self.heartbeat.interval_ms > 0 && self.heartbeat.timeout_ms == 0 {
            return Err(Error::Fatal(
                "heartbeat.timeout_ms must be positive when the heartbeat is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    match env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|_| Error::Fatal(format!("{name} must be a non-negative integer, got '{raw}'"))),
        Err(_) => Ok(None),
    }
}
