use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_METADATA_FILE: &str = ".modsync_meta";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,
    pub mods_root: PathBuf,
    #[serde(default)]
    pub search_roots: Vec<PathBuf>,
    #[serde(default = "default_search_depth")]
    pub search_depth: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_metadata_file")]
    pub metadata_file: String,
}

impl LauncherConfig {
    pub fn new(data_dir: PathBuf, mods_root: PathBuf) -> Self {
        Self {
            data_dir,
            mods_root,
            search_roots: Vec::new(),
            search_depth: default_search_depth(),
            poll_interval_ms: default_poll_interval_ms(),
            metadata_file: default_metadata_file(),
        }
    }

    pub fn load_or_create() -> Result<Self> {
        let data_dir = base_data_dir()?;
        Self::load_or_create_in(&data_dir)
    }

    pub fn load_or_create_in(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir).context("create app data dir")?;
        let path = data_dir.join("config.json");
        if path.exists() {
            let raw = fs::read_to_string(&path).context("read config")?;
            let mut config: LauncherConfig = serde_json::from_str(&raw).context("parse config")?;
            config.data_dir = data_dir.to_path_buf();
            if config.metadata_file.trim().is_empty() {
                config.metadata_file = default_metadata_file();
                config.save()?;
            }
            return Ok(config);
        }

        let config = LauncherConfig::new(data_dir.to_path_buf(), data_dir.join("mods"));
        config.save()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir).context("create app data dir")?;
        let path = self.data_dir.join("config.json");
        let raw = serde_json::to_string_pretty(self).context("serialize config")?;
        fs::write(path, raw).context("write config")?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn whitelisted_files(&self) -> Vec<String> {
        vec![
            self.metadata_file.clone(),
            format!("{}.tmp", self.metadata_file),
        ]
    }
}

fn default_search_depth() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_metadata_file() -> String {
    DEFAULT_METADATA_FILE.to_string()
}

fn base_data_dir() -> Result<PathBuf> {
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join("modsync"))
}
