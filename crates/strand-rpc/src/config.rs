//! Engine configuration.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::net::RpcChannel;
use crate::task::TaskTuning;

/// Client network configuration for one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientNetConfig {
    /// Network factory name (`"tcp"`, `"sim"`, or a registered custom one).
    pub factory: String,
    /// Receive buffer block size hint in bytes.
    pub buffer_block_size: usize,
}

impl Default for ClientNetConfig {
    fn default() -> Self {
        ClientNetConfig {
            factory: String::from("tcp"),
            buffer_block_size: 65536,
        }
    }
}

/// Server network configuration for one listening port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerNetConfig {
    /// Listening port.
    pub port: u16,
    /// Channel served on this port.
    #[serde(default = "default_channel")]
    pub channel: RpcChannel,
    /// Network factory name.
    #[serde(default = "default_factory")]
    pub factory: String,
    /// Receive buffer block size hint in bytes.
    #[serde(default = "default_block_size")]
    pub buffer_block_size: usize,
}

fn default_channel() -> RpcChannel {
    RpcChannel::Tcp
}

fn default_factory() -> String {
    String::from("tcp")
}

fn default_block_size() -> usize {
    65536
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Application id; doubles as the primary-address port for pure
    /// clients that configure no listening port.
    pub app_id: u16,
    /// Node name used in log records.
    pub node_name: String,
    /// Listening ports; the first one becomes the primary-address port.
    pub ports: Vec<u16>,
    /// Worker count of the request-execution pool.
    pub worker_count: usize,
    /// Ordered aspect names wrapped around every network instance.
    pub aspects: Vec<String>,
    /// Client network per channel.
    pub client: HashMap<RpcChannel, ClientNetConfig>,
    /// Server networks, one per listening port.
    pub server: Vec<ServerNetConfig>,
    /// Per-code tuning applied at engine start, keyed by task-code name.
    pub tasks: HashMap<String, TaskTuning>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut client = HashMap::new();
        client.insert(RpcChannel::Tcp, ClientNetConfig::default());
        EngineConfig {
            app_id: 1,
            node_name: String::from("strand"),
            ports: Vec::new(),
            worker_count: 4,
            aspects: Vec::new(),
            client,
            server: Vec::new(),
            tasks: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Load a configuration from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: EngineConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: EngineConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }
}
