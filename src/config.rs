//! Server and fleet configuration.
//!
//! A fleet is declared as a TOML table of server entries, each naming a
//! transport (a local process to spawn, or a remote HTTP endpoint) plus
//! timeout and retry tuning.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

const DEFAULT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;

/// How to reach a single MCP server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Spawn a local process and speak JSON-RPC over its stdio.
    Process {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// POST JSON-RPC messages to a streamable HTTP endpoint.
    Remote {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl TransportConfig {
    /// Checks the transport is actually reachable as written. Run before
    /// every connection attempt, since entries can be edited between
    /// retries.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            TransportConfig::Process { command, .. } => {
                if command.trim().is_empty() {
                    return Err("transport command must not be empty".to_string());
                }
                Ok(())
            }
            TransportConfig::Remote { url, .. } => {
                let parsed = reqwest::Url::parse(url)
                    .map_err(|e| format!("invalid server URL '{url}': {e}"))?;
                match parsed.scheme() {
                    "http" | "https" => Ok(()),
                    other => Err(format!("unsupported URL scheme '{other}' in '{url}'")),
                }
            }
        }
    }
}

/// Per-server connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    #[serde(flatten)]
    pub transport: TransportConfig,
    /// Deadline in milliseconds for a single connection attempt or tool call.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Additional connection attempts after the first one fails.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay between attempts; doubles on each retry.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Human-readable name used in logs and user-facing messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}

impl ClientConfig {
    pub fn new(transport: TransportConfig) -> Self {
        ClientConfig {
            transport,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            display_name: None,
        }
    }

    pub fn display_name_or<'a>(&'a self, server_id: &'a str) -> &'a str {
        self.display_name.as_deref().unwrap_or(server_id)
    }
}

/// On-disk fleet declaration: one `[servers.<id>]` table per server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub servers: HashMap<String, ClientConfig>,
}

impl FleetConfig {
    pub fn load() -> Result<FleetConfig, Box<dyn std::error::Error>> {
        let config_path = Self::get_config_path();
        Self::load_from_path(&config_path)
    }

    pub fn load_from_path(config_path: &PathBuf) -> Result<FleetConfig, Box<dyn std::error::Error>> {
        if config_path.exists() {
            let contents = fs::read_to_string(config_path)?;
            let config: FleetConfig = toml::from_str(&contents)?;
            Ok(config)
        } else {
            Ok(FleetConfig::default())
        }
    }

    pub fn save(&self) -> Result<(), Box<dyn std::error::Error>> {
        let config_path = Self::get_config_path();
        self.save_to_path(&config_path)
    }

    pub fn save_to_path(&self, config_path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        fs::write(config_path, contents)?;
        Ok(())
    }

    fn get_config_path() -> PathBuf {
        let proj_dirs = ProjectDirs::from("org", "permacommons", "toolfleet")
            .expect("Failed to determine config directory");
        proj_dirs.config_dir().join("servers.toml")
    }
}
