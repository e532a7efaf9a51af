use crate::{
    config::LauncherConfig,
    error::{SyncError, SyncResult},
    manifest::ReferenceManifest,
};
use base64::prelude::{Engine as _, BASE64_STANDARD};
use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// Installation state persisted next to each mod. A dirty record means an
/// install or update started and was never confirmed, so the directory is
/// not installed whatever else is on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub dirty: bool,
    #[serde(default)]
    pub torrent_url: String,
    #[serde(default, with = "base64_bytes")]
    pub torrent_resume_data: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl MetadataRecord {
    pub fn path(mod_dir: &Path, config: &LauncherConfig) -> PathBuf {
        mod_dir.join(&config.metadata_file)
    }

    pub fn load(mod_dir: &Path, config: &LauncherConfig) -> SyncResult<Option<Self>> {
        let path = Self::path(mod_dir, config);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(SyncError::from_io(&path, "read", err)),
        };
        let record = serde_json::from_slice(&raw)
            .map_err(|err| SyncError::format("metadata record", err))?;
        Ok(Some(record))
    }

    pub fn save(&self, mod_dir: &Path, config: &LauncherConfig) -> SyncResult<()> {
        let path = Self::path(mod_dir, config);
        let raw = serde_json::to_vec_pretty(self)
            .map_err(|err| SyncError::format("metadata record", err))?;
        write_atomic(&path, &raw)
    }

    pub fn reference_manifest(&self) -> SyncResult<ReferenceManifest> {
        if self.torrent_resume_data.is_empty() {
            return Err(SyncError::format(
                "metadata record",
                "no resume data stored",
            ));
        }
        ReferenceManifest::from_resume_data(&self.torrent_resume_data)
    }

    fn touch(&mut self) {
        self.updated_at = OffsetDateTime::now_utc().format(&Rfc3339).ok();
    }
}

pub fn mark_dirty(mod_dir: &Path, url: &str, config: &LauncherConfig) -> SyncResult<MetadataRecord> {
    let mut record = match MetadataRecord::load(mod_dir, config) {
        Ok(Some(record)) => record,
        Ok(None) | Err(SyncError::Format { .. }) => MetadataRecord::default(),
        Err(err) => return Err(err),
    };
    record.dirty = true;
    record.torrent_url = url.to_string();
    record.touch();
    fs::create_dir_all(mod_dir).map_err(|err| SyncError::from_io(mod_dir, "create directory", err))?;
    record.save(mod_dir, config)?;
    Ok(record)
}

pub fn mark_clean(
    mod_dir: &Path,
    version: &str,
    url: &str,
    resume_data: Vec<u8>,
    config: &LauncherConfig,
) -> SyncResult<MetadataRecord> {
    let mut record = MetadataRecord {
        version: version.to_string(),
        dirty: false,
        torrent_url: url.to_string(),
        torrent_resume_data: resume_data,
        updated_at: None,
    };
    record.touch();
    record.save(mod_dir, config)?;
    Ok(record)
}

pub fn write_atomic(path: &Path, contents: &[u8]) -> SyncResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| SyncError::format("path", format!("{:?} has no parent", path)))?;
    fs::create_dir_all(parent).map_err(|err| SyncError::from_io(parent, "create directory", err))?;
    let file_name = path
        .file_name()
        .ok_or_else(|| SyncError::format("path", format!("{:?} has no file name", path)))?;
    let mut temp_name = std::ffi::OsString::from(file_name);
    temp_name.push(".tmp");
    let temp_path = parent.join(temp_name);

    fs::write(&temp_path, contents).map_err(|err| SyncError::from_io(&temp_path, "write", err))?;
    if let Err(err) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(SyncError::from_io(path, "replace", err));
    }
    Ok(())
}

mod base64_bytes {
    use super::*;
    use serde::de::Error;

    pub fn serialize<S: serde::Serializer>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        BASE64_STANDARD.decode(s.trim().as_bytes()).map_err(D::Error::custom)
    }
}
