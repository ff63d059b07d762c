use anyhow::{Context, Result};
use common::NodeIdentity;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_LOCK_FILE: &str = "/var/run/rkm-slave";
pub const DEFAULT_ADDRESS_FILE: &str = "/var/run/rkm-address";
pub const DEFAULT_STORAGE_DIR: &str = "/var/lib/rkm/storage";
pub const DEFAULT_LOG_DIR: &str = "/var/log/rkm";

/// Name of the daemon log inside the log directory.
pub const DAEMON_LOG_NAME: &str = "rkm.log";

/// Well-known locations used by a slave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePaths {
    // holds the daemon lock and the identity payload
    pub lock_file: PathBuf,
    // atomically replaced identity + log sink record
    pub address_file: PathBuf,
    pub storage_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for NodePaths {
    fn default() -> Self {
        NodePaths {
            lock_file: DEFAULT_LOCK_FILE.into(),
            address_file: DEFAULT_ADDRESS_FILE.into(),
            storage_dir: DEFAULT_STORAGE_DIR.into(),
            log_dir: DEFAULT_LOG_DIR.into(),
        }
    }
}

impl NodePaths {
    /// All paths rooted under `dir`, keeping the default file names.
    pub fn under(dir: &Path) -> Self {
        NodePaths {
            lock_file: dir.join("rkm-slave"),
            address_file: dir.join("rkm-address"),
            storage_dir: dir.join("storage"),
            log_dir: dir.join("log"),
        }
    }

    pub fn daemon_log(&self) -> PathBuf {
        self.log_dir.join(DAEMON_LOG_NAME)
    }
}

/// Master configuration: which machines to turn into what.
#[derive(Debug, Deserialize)]
pub struct MasterConfig {
    pub storage: NodeIdentity,
    #[serde(default)]
    pub workers: Vec<NodeIdentity>,
}

pub fn load_master_config(path: &Path) -> Result<MasterConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let cfg: MasterConfig =
        serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    Ok(cfg)
}
