use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{IndexerError, IndexerResult};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub agora: AgoraConfig,
    pub database: DatabaseConfig,
    pub consensus: ConsensusConfig,
    pub governance: GovernanceConfig,
    #[serde(default = "default_queue_warn_depth")]
    pub queue_warn_depth: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    pub address: IpAddr,
    /// Public read API port.
    pub port: u16,
    /// Private intake API port; only the consensus node should reach it.
    pub private_port: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgoraConfig {
    pub endpoint: String,
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Unix timestamp of block 0.
    pub genesis_timestamp: u64,
    pub block_interval_seconds: u64,
    /// Enrollment cycle length in blocks (20 for test nets, 1008 for mainnet).
    pub validator_cycle: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GovernanceConfig {
    pub enabled: bool,
    #[serde(default)]
    pub metadata_endpoint: Option<String>,
    /// Blocks to wait after the voting window before tallying, leaving room
    /// for late pre-image publication.
    #[serde(default = "default_grace_blocks")]
    pub grace_blocks: u64,
}

fn default_queue_warn_depth() -> usize {
    256
}

fn default_fetch_timeout_ms() -> u64 {
    5_000
}

fn default_grace_blocks() -> u64 {
    7
}

impl Config {
    pub fn load(path: &Path) -> IndexerResult<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|err| IndexerError::Config(format!("unable to parse config: {err}")))
    }

    pub fn save(&self, path: &Path) -> IndexerResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| IndexerError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> IndexerResult<()> {
        fs::create_dir_all(&self.database.path)?;
        Ok(())
    }

    pub fn public_listen(&self) -> SocketAddr {
        SocketAddr::new(self.server.address, self.server.port)
    }

    pub fn private_listen(&self) -> SocketAddr {
        SocketAddr::new(self.server.address, self.server.private_port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                address: "127.0.0.1".parse().expect("valid listen address"),
                port: 3836,
                private_port: 3837,
            },
            agora: AgoraConfig {
                endpoint: "http://127.0.0.1:2826".to_string(),
                fetch_timeout_ms: default_fetch_timeout_ms(),
            },
            database: DatabaseConfig {
                path: PathBuf::from("./data/index"),
            },
            consensus: ConsensusConfig {
                genesis_timestamp: 1_609_459_200,
                block_interval_seconds: 600,
                validator_cycle: 20,
            },
            governance: GovernanceConfig {
                enabled: true,
                metadata_endpoint: None,
                grace_blocks: default_grace_blocks(),
            },
            queue_warn_depth: default_queue_warn_depth(),
        }
    }
}
