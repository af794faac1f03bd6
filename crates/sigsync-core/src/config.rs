use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Global configuration loaded from `~/.config/sigsync/config.toml`.
///
/// Passed explicitly into the engine's constructors (cache, transfer client,
/// sync pass); nothing in the core reads ambient global state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Local content root. Every relative path in the engine resolves
    /// against this directory.
    pub library_path: PathBuf,
    /// Base URL of the server's file-transfer endpoint.
    pub endpoint: String,
    /// Server key identifying the CMS instance.
    pub server_key: String,
    /// Hardware key identifying this display.
    pub hardware_key: String,
    /// Capacity of the download gate: maximum simultaneous file transfers.
    pub max_concurrent_downloads: usize,
    /// Digest-mismatch quarantine threshold: after this many failed
    /// verifications an entry is skipped until a fresh manifest arrives.
    #[serde(default = "default_max_verify_failures")]
    pub max_verify_failures: u32,
    /// Connect timeout for transfer calls, in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Hard wall-clock cap on a single transfer call, in seconds.
    #[serde(default = "default_transfer_timeout_secs")]
    pub transfer_timeout_secs: u64,
}

fn default_max_verify_failures() -> u32 {
    3
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_transfer_timeout_secs() -> u64 {
    3600
}

fn default_library_path() -> PathBuf {
    xdg::BaseDirectories::with_prefix("sigsync")
        .map(|d| d.get_data_home().join("library"))
        .unwrap_or_else(|_| PathBuf::from("library"))
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            library_path: default_library_path(),
            endpoint: "http://localhost/xmds".to_string(),
            server_key: String::new(),
            hardware_key: String::new(),
            max_concurrent_downloads: 2,
            max_verify_failures: default_max_verify_failures(),
            connect_timeout_secs: default_connect_timeout_secs(),
            transfer_timeout_secs: default_transfer_timeout_secs(),
        }
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("sigsync")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<PlayerConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = PlayerConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: PlayerConfig = toml::from_str(&data)?;
    Ok(cfg)
}
