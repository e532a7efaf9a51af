use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeData {
    pub info: ManifestInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<ManifestFileRaw>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1: Option<ByteBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFileRaw {
    pub path: Vec<String>,
    pub length: u64,
    #[serde(default)]
    pub mtime: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1: Option<ByteBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offsets: Option<BTreeMap<String, u64>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestFile {
    pub path: String,
    pub size: u64,
    pub mtime: i64,
    pub hash: Option<Vec<u8>>,
    pub offsets: Option<BTreeMap<String, u64>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceManifest {
    pub name: String,
    pub files: Vec<ManifestFile>,
}

impl ReferenceManifest {
    pub fn from_resume_data(bytes: &[u8]) -> SyncResult<Self> {
        let resume: ResumeData = serde_bencode::from_bytes(bytes)
            .map_err(|err| SyncError::format("reference manifest", err))?;
        Self::from_info(resume.info)
    }

    pub fn from_info(info: ManifestInfo) -> SyncResult<Self> {
        if info.name.is_empty() || !is_safe_component(&info.name) {
            return Err(SyncError::format(
                "reference manifest",
                format!("bad root name {:?}", info.name),
            ));
        }

        let files = match (info.files, info.length) {
            (Some(raw_files), _) => {
                let mut files = Vec::with_capacity(raw_files.len());
                for raw in raw_files {
                    if raw.path.is_empty() || !raw.path.iter().all(|part| is_safe_component(part))
                    {
                        return Err(SyncError::format(
                            "reference manifest",
                            format!("bad file path {:?}", raw.path),
                        ));
                    }
                    files.push(ManifestFile {
                        path: format!("{}/{}", info.name, raw.path.join("/")),
                        size: raw.length,
                        mtime: raw.mtime,
                        hash: raw.sha1.map(ByteBuf::into_vec),
                        offsets: raw.offsets,
                    });
                }
                files
            }
            (None, Some(length)) => vec![ManifestFile {
                path: info.name.clone(),
                size: length,
                mtime: info.mtime.unwrap_or_default(),
                hash: info.sha1.map(ByteBuf::into_vec),
                offsets: None,
            }],
            (None, None) => {
                return Err(SyncError::format(
                    "reference manifest",
                    "neither files nor length present",
                ))
            }
        };

        Ok(Self {
            name: info.name,
            files,
        })
    }

    pub fn layout(&self) -> ManifestLayout {
        ManifestLayout::from_manifest(self)
    }

    pub fn archives(&self) -> impl Iterator<Item = (&ManifestFile, &BTreeMap<String, u64>)> {
        self.files
            .iter()
            .filter_map(|file| file.offsets.as_ref().map(|offsets| (file, offsets)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestLayout {
    pub top_dirs: BTreeSet<String>,
    pub dirs: BTreeSet<String>,
    pub files: BTreeSet<String>,
}

impl ManifestLayout {
    pub fn from_manifest(manifest: &ReferenceManifest) -> Self {
        Self::from_paths(manifest.files.iter().map(|file| file.path.as_str()))
    }

    pub fn from_paths<'a>(paths: impl IntoIterator<Item = &'a str>) -> Self {
        let mut layout = ManifestLayout::default();
        for path in paths {
            let parts: Vec<&str> = path.split('/').filter(|part| !part.is_empty()).collect();
            if parts.is_empty() {
                continue;
            }
            if parts.len() > 1 {
                layout.top_dirs.insert(parts[0].to_string());
            }
            for depth in 1..parts.len() {
                layout.dirs.insert(parts[..depth].join("/"));
            }
            layout.files.insert(parts.join("/"));
        }
        layout
    }
}

fn is_safe_component(part: &str) -> bool {
    !part.is_empty() && part != "." && part != ".." && !part.contains(['/', '\\'])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(path: &[&str], length: u64) -> ManifestFileRaw {
        ManifestFileRaw {
            path: path.iter().map(|s| s.to_string()).collect(),
            length,
            mtime: 1_600_000_000,
            sha1: None,
            offsets: None,
        }
    }

    #[test]
    fn decodes_multi_file_manifest_from_bencode() {
        let mut offsets = BTreeMap::new();
        offsets.insert("config.bin".to_string(), 120);
        let mut archive = raw(&["addons", "main.pbo"], 400);
        archive.offsets = Some(offsets);
        let resume = ResumeData {
            info: ManifestInfo {
                name: "@CBA_A3".to_string(),
                files: Some(vec![raw(&["mod.cpp"], 10), archive]),
                length: None,
                mtime: None,
                sha1: None,
            },
        };
        let bytes = serde_bencode::to_bytes(&resume).unwrap();
        let manifest = ReferenceManifest::from_resume_data(&bytes).unwrap();

        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.files[0].path, "@CBA_A3/mod.cpp");
        assert_eq!(manifest.files[1].path, "@CBA_A3/addons/main.pbo");
        let (file, offsets) = manifest.archives().next().unwrap();
        assert_eq!(file.size, 400);
        assert_eq!(offsets["config.bin"], 120);
    }

    #[test]
    fn ignores_unknown_resume_keys() {
        let bytes = b"d11:file-format22:libtorrent resume file4:infod6:lengthi5e5:mtimei7e4:name5:a.txtee";
        let manifest = ReferenceManifest::from_resume_data(bytes).unwrap();
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(manifest.files[0].path, "a.txt");
        assert_eq!(manifest.files[0].mtime, 7);
    }

    #[test]
    fn rejects_garbage_and_traversal() {
        assert!(ReferenceManifest::from_resume_data(b"not bencode").is_err());

        let info = ManifestInfo {
            name: "@mod".to_string(),
            files: Some(vec![raw(&["..", "escape"], 1)]),
            length: None,
            mtime: None,
            sha1: None,
        };
        assert!(matches!(
            ReferenceManifest::from_info(info),
            Err(SyncError::Format { .. })
        ));
    }

    #[test]
    fn layout_collects_every_ancestor_directory() {
        let layout = ManifestLayout::from_paths(["a/f1", "a/b/c/f2", "top.txt"]);
        assert_eq!(layout.top_dirs, BTreeSet::from(["a".to_string()]));
        assert_eq!(
            layout.dirs,
            BTreeSet::from(["a".to_string(), "a/b".to_string(), "a/b/c".to_string()])
        );
        assert!(layout.files.contains("a/b/c/f2"));
        assert!(layout.files.contains("top.txt"));
    }
}
