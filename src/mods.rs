use crate::{config::LauncherConfig, manifest::ReferenceManifest};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModRecord {
    pub foldername: String,
    pub torrent_url: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub parent_location: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mod {
    pub foldername: String,
    pub parent_location: PathBuf,
    pub torrent_url: String,
    pub version: String,
    pub optional: bool,
    pub selected: bool,
    pub up_to_date: bool,
    #[serde(default)]
    pub linked_to: Option<PathBuf>,
    #[serde(skip)]
    pub reference: Option<ReferenceManifest>,
}

impl Mod {
    pub fn from_record(record: ModRecord, config: &LauncherConfig) -> Self {
        Self {
            parent_location: record
                .parent_location
                .unwrap_or_else(|| config.mods_root.clone()),
            foldername: record.foldername,
            torrent_url: record.torrent_url,
            version: record.version,
            optional: record.optional,
            selected: !record.optional,
            up_to_date: false,
            linked_to: None,
            reference: None,
        }
    }

    pub fn full_path(&self) -> PathBuf {
        self.parent_location.join(&self.foldername)
    }

    pub fn is_wanted(&self) -> bool {
        !self.optional || self.selected
    }
}

pub fn load_mod_records(path: &Path) -> Result<Vec<ModRecord>> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {:?}", path))?;
    let records = serde_json::from_str(&raw).context("parse mod list")?;
    Ok(records)
}
