//! Configuration system for Hive.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $HIVE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/hive/config.toml
//!   3. ~/.config/hive/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::wire::{FRAGMENT_HEADROOM, MAX_CHANNEL_MESSAGE};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HiveConfig {
    pub network: NetworkConfig,
    pub transport: TransportConfig,
    pub scheduler: SchedulerConfig,
    pub compute: ComputeSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// WebSocket URL of the rendezvous server.
    pub signaling_url: String,
    /// Local HTTP API port.
    pub api_port: u16,
    /// STUN/TURN URLs handed to every peer connection.
    pub ice_servers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Serialized messages strictly larger than this are split into chunks.
    /// Capped so one fragment frame fits in a data channel message.
    pub chunk_size: usize,
    /// Sending stalls while the channel has more than this many bytes buffered.
    pub low_water: usize,
    /// Reassembly buffers with no new chunk for this long are evicted.
    pub transfer_timeout_secs: u64,
    /// EWMA factor applied to new throughput samples. 1.0 = no smoothing.
    pub speed_smoothing: f64,
    /// Largest serialized message a peer may announce in fragments.
    pub max_message_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Weight of the connection-speed deviation.
    pub speed_weight: f64,
    /// Weight of the benchmark deviation.
    pub benchmark_weight: f64,
    /// `k` in `thresh = round(k * d + k)`.
    pub backlog_factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeSettings {
    /// Program run once per task. Payload on stdin, result on stdout.
    pub command: String,
    pub args: Vec<String>,
    pub work_dir: PathBuf,
    /// Sample input for the self-benchmark. None = generated sample.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub benchmark_file: Option<PathBuf>,
    /// Max concurrent tasks. 0 = num_cpus.
    pub max_concurrent_tasks: u32,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://localhost:2512".to_string(),
            api_port: 9101,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            chunk_size: 48 * 1024,
            low_water: 1024 * 1024,
            transfer_timeout_secs: 60,
            speed_smoothing: 0.5,
            max_message_bytes: 512 * 1024 * 1024,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            speed_weight: 0.8,
            benchmark_weight: 0.2,
            backlog_factor: 2.0,
        }
    }
}

impl Default for ComputeSettings {
    fn default() -> Self {
        Self {
            command: "cat".to_string(),
            args: Vec::new(),
            work_dir: PathBuf::from("/tmp/hive-compute"),
            benchmark_file: None,
            max_concurrent_tasks: 0,
        }
    }
}

impl TransportConfig {
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    /// `chunk_size` clamped to what a data channel can carry per fragment.
    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.clamp(1, MAX_CHANNEL_MESSAGE - FRAGMENT_HEADROOM)
    }

    /// Most fragments a transfer of `max_message_bytes` can need.
    pub fn max_fragments(&self) -> u32 {
        let n = self.max_message_bytes.div_ceil(self.effective_chunk_size());
        u32::try_from(n).unwrap_or(u32::MAX)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("hive")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl HiveConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            HiveConfig::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("HIVE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&HiveConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply HIVE_* overrides. `lookup` is `std::env::var` outside tests.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("HIVE_NETWORK__SIGNALING_URL") {
            self.network.signaling_url = v;
        }
        if let Some(p) = lookup("HIVE_NETWORK__API_PORT").and_then(|v| v.parse().ok()) {
            self.network.api_port = p;
        }
        if let Some(n) = lookup("HIVE_TRANSPORT__CHUNK_SIZE").and_then(|v| v.parse().ok()) {
            self.transport.chunk_size = n;
        }
        if let Some(n) = lookup("HIVE_TRANSPORT__LOW_WATER").and_then(|v| v.parse().ok()) {
            self.transport.low_water = n;
        }
        if let Some(w) = lookup("HIVE_SCHEDULER__SPEED_WEIGHT").and_then(|v| v.parse().ok()) {
            self.scheduler.speed_weight = w;
        }
        if let Some(w) = lookup("HIVE_SCHEDULER__BENCHMARK_WEIGHT").and_then(|v| v.parse().ok()) {
            self.scheduler.benchmark_weight = w;
        }
        if let Some(k) = lookup("HIVE_SCHEDULER__BACKLOG_FACTOR").and_then(|v| v.parse().ok()) {
            self.scheduler.backlog_factor = k;
        }
        if let Some(v) = lookup("HIVE_COMPUTE__COMMAND") {
            self.compute.command = v;
        }
    }
}
