//! src/config.rs
//!
//! Defines the strongly-typed `Config` struct for all runtime parameters,
//! loaded from files and environment variables via `figment`.

use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// The capability key of the public main network.
pub const DEFAULT_CAPS: &str = "1KHLiKZvAvjbY1ziZEHMXawbCEIM6qwjCDm3VYRan/s=";

/// Top-level struct holding all application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Secret handshake capability key handed to every puppet.
    pub caps: String,
    /// Default hop limit for puppets and for expectation generation.
    pub hops: usize,
    pub base_port: u16,
    /// Root of a spliced fixtures folder, if the run is fixture-backed.
    pub fixtures: Option<PathBuf>,
    /// Path of the test script (read by `run`, written by `generate`).
    pub spec: PathBuf,
    pub out: PathBuf,
    /// Echo puppet output on stdout in addition to their log files.
    pub verbose: bool,
    /// Implementation folders, each containing a `sim-shim.sh`.
    pub implementations: Vec<PathBuf>,
    pub timing: Timing,
    pub wait_until: RetryConfig,
    pub generate: GenerateConfig,
}

/// Fixed delays and bounds used by the execution engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timing {
    pub start_settle_ms: u64,
    pub connect_settle_ms: u64,
    pub stop_grace_ms: u64,
    pub history_timeout_ms: u64,
    pub port_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

/// Parameters for `netsim generate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateConfig {
    /// Implementation name written into every generated `start` line.
    pub sbot: String,
    pub focused: usize,
    pub seed: u64,
    pub replicate_blocked: bool,
    /// Number of full edge sweeps before the final assertions.
    pub passes: usize,
    /// Pause emitted after every generated `connect`; zero emits none.
    pub wait_ms: u64,
    /// Directory receiving `expectations.json` and the generated script.
    pub out: PathBuf,
}

impl Config {
    /// Loads configuration from `netsim.toml` and `NETSIM_`-prefixed
    /// environment variables. Nested keys use `__`, e.g.
    /// `NETSIM_TIMING__START_SETTLE_MS`.
    pub fn load() -> Result<Self, figment::Error> {
        Self::figment().extract()
    }

    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file("netsim.toml"))
            .merge(Env::prefixed("NETSIM_").split("__"))
    }

    /// Rejects settings that would make every run fail.
    pub fn validate(&self) -> Result<()> {
        validate_caps(&self.caps)
    }
}

impl Timing {
    pub fn start_settle(&self) -> Duration {
        Duration::from_millis(self.start_settle_ms)
    }

    pub fn connect_settle(&self) -> Duration {
        Duration::from_millis(self.connect_settle_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn history_timeout(&self) -> Duration {
        Duration::from_millis(self.history_timeout_ms)
    }
}

/// Capability keys travel as base64; anything else is a configuration error.
pub fn validate_caps(caps: &str) -> Result<()> {
    STANDARD
        .decode(caps)
        .map(|_| ())
        .map_err(|_| Error::InvalidCaps(caps.to_string()))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            caps: DEFAULT_CAPS.to_string(),
            hops: 2,
            base_port: 18888,
            fixtures: None,
            spec: PathBuf::from("netsim-test.txt"),
            out: PathBuf::from("./puppets"),
            verbose: false,
            implementations: Vec::new(),
            timing: Timing::default(),
            wait_until: RetryConfig::default(),
            generate: GenerateConfig::default(),
        }
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            start_settle_ms: 1000,
            connect_settle_ms: 500,
            stop_grace_ms: 2000,
            history_timeout_ms: 15000,
            port_attempts: 50,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff_ms: 1000,
        }
    }
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            sbot: "ssb-server".to_string(),
            focused: 2,
            seed: 0,
            replicate_blocked: false,
            passes: 2,
            wait_ms: 0,
            out: PathBuf::from("."),
        }
    }
}
