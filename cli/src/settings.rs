//! CLI configuration — explicit, no hidden process-wide state.
//!
//! Loaded from `--config`, or the platform config dir, or defaults. The
//! data directory additionally honors `CHAINSCAN_DATA`.

use std::path::{Path, PathBuf};

use anyhow::Context;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Daemon JSON-RPC endpoint.
    pub rpc_url: String,
    pub rpc_user: Option<String>,
    pub rpc_password: Option<String>,
    /// Namespaces the snapshot file, so networks never share cached state.
    pub network: String,
    pub data_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rpc_url: "http://localhost:9902".into(),
            rpc_user: None,
            rpc_password: None,
            network: "mainnet".into(),
            data_dir: None,
        }
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "chainfoundry", "chainscan")
}

impl Settings {
    /// Load settings. An explicit `--config` path must exist; the default
    /// location falls back to defaults when absent.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let Some(dirs) = project_dirs() else {
                    return Ok(Self::default());
                };
                let default = dirs.config_dir().join("chainscan.toml");
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Resolved data directory: `CHAINSCAN_DATA` env, then the config's
    /// `data_dir`, then the platform data dir.
    pub fn data_dir(&self) -> PathBuf {
        if let Ok(dir) = std::env::var("CHAINSCAN_DATA") {
            return PathBuf::from(dir);
        }
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        match project_dirs() {
            Some(dirs) => dirs.data_local_dir().to_path_buf(),
            None => PathBuf::from(".").join(".chainscan"),
        }
    }

    /// The snapshot file holding locators and checkpoints for this network.
    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir().join(&self.network).join("chainscan.json")
    }
}
