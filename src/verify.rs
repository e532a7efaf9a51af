use crate::{
    config::LauncherConfig,
    error::{SyncError, SyncResult},
    manifest::{ManifestFile, ReferenceManifest},
    metadata::MetadataRecord,
    mods::Mod,
    policing::{self, PolicingMode},
    task::{self, TaskHandle},
};
use filetime::FileTime;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

const NANOS_PER_SEC: i128 = 1_000_000_000;
pub const MTIME_NEWER_TOLERANCE_SECS: i128 = 5 * 60;
pub const MTIME_OLDER_TOLERANCE_SECS: i128 = 1;

pub trait CompletionHook: Send {
    fn is_complete(&self, mod_name: &str, files: &BTreeSet<String>) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoHook;

impl CompletionHook for NoHook {
    fn is_complete(&self, _mod_name: &str, _files: &BTreeSet<String>) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct ExternalFilesHook {
    pub mod_name: String,
    pub install_root: PathBuf,
    pub prefix: String,
    pub target_dir: PathBuf,
}

impl CompletionHook for ExternalFilesHook {
    fn is_complete(&self, mod_name: &str, files: &BTreeSet<String>) -> bool {
        if mod_name != self.mod_name {
            return true;
        }
        let prefix = format!("{}/{}/", mod_name, self.prefix.trim_matches('/'));
        for file in files {
            let Some(rest) = file.strip_prefix(&prefix) else {
                continue;
            };
            let source_len = fs::metadata(self.install_root.join(file))
                .map(|meta| meta.len())
                .unwrap_or(0);
            match fs::metadata(self.target_dir.join(rest)) {
                Ok(meta) if meta.len() >= source_len => {}
                _ => {
                    tracing::info!(file = %rest, "companion file missing outside mod directory");
                    return false;
                }
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum Incomplete {
    NoMetadata,
    BadMetadata(String),
    Dirty,
    UrlMismatch,
    FileMismatch(String),
    Superfluous,
    Vetoed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Complete,
    Incomplete(Incomplete),
}

impl Verdict {
    pub fn is_complete(&self) -> bool {
        *self == Verdict::Complete
    }
}

pub struct Verifier<'a> {
    config: &'a LauncherConfig,
    hook: &'a dyn CompletionHook,
}

impl<'a> Verifier<'a> {
    pub fn new(config: &'a LauncherConfig, hook: &'a dyn CompletionHook) -> Self {
        Self { config, hook }
    }

    pub fn check(&self, mod_entry: &Mod) -> SyncResult<Verdict> {
        let mod_dir = mod_entry.full_path();

        let record = match MetadataRecord::load(&mod_dir, self.config) {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(Verdict::Incomplete(Incomplete::NoMetadata)),
            Err(err) => return Ok(Verdict::Incomplete(Incomplete::BadMetadata(err.to_string()))),
        };
        if record.dirty {
            return Ok(Verdict::Incomplete(Incomplete::Dirty));
        }
        if record.torrent_url != mod_entry.torrent_url {
            return Ok(Verdict::Incomplete(Incomplete::UrlMismatch));
        }

        let manifest = match record.reference_manifest() {
            Ok(manifest) => manifest,
            Err(err) => return Ok(Verdict::Incomplete(Incomplete::BadMetadata(err.to_string()))),
        };
        let base = &mod_entry.parent_location;
        if let Some(path) = first_mismatched_file(&manifest, base) {
            return Ok(Verdict::Incomplete(Incomplete::FileMismatch(path)));
        }

        let layout = manifest.layout();
        let whitelist = self.config.whitelisted_files();
        match policing::check_mod_directories(&layout, base, &whitelist, PolicingMode::Warn) {
            Ok(true) => {}
            Ok(false) => return Ok(Verdict::Incomplete(Incomplete::Superfluous)),
            Err(err @ SyncError::SafetyViolation { .. }) => return Err(err),
            Err(err) => {
                tracing::warn!(error = %err, "directory check failed");
                return Ok(Verdict::Incomplete(Incomplete::Superfluous));
            }
        }

        if !self.hook.is_complete(&mod_entry.foldername, &layout.files) {
            return Ok(Verdict::Incomplete(Incomplete::Vetoed));
        }
        Ok(Verdict::Complete)
    }

    pub fn is_complete_quick(&self, mod_entry: &Mod) -> SyncResult<bool> {
        let verdict = self.check(mod_entry)?;
        if let Verdict::Incomplete(reason) = &verdict {
            tracing::info!(mod_name = %mod_entry.foldername, ?reason, "mod is not up to date");
        }
        Ok(verdict.is_complete())
    }
}

fn first_mismatched_file(manifest: &ReferenceManifest, base: &Path) -> Option<String> {
    manifest
        .files
        .iter()
        .find(|file| !file_matches(file, base))
        .map(|file| file.path.clone())
}

fn file_matches(file: &ManifestFile, base: &Path) -> bool {
    let Ok(meta) = fs::metadata(base.join(&file.path)) else {
        return false;
    };
    if !meta.is_file() || meta.len() < file.size {
        return false;
    }
    mtime_within_tolerance(FileTime::from_last_modification_time(&meta), file.mtime)
}

pub fn mtime_within_tolerance(actual: FileTime, declared_secs: i64) -> bool {
    let actual = i128::from(actual.unix_seconds()) * NANOS_PER_SEC + i128::from(actual.nanoseconds());
    let declared = i128::from(declared_secs) * NANOS_PER_SEC;
    let diff = actual - declared;
    diff >= -MTIME_OLDER_TOLERANCE_SECS * NANOS_PER_SEC
        && diff <= MTIME_NEWER_TOLERANCE_SECS * NANOS_PER_SEC
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModChecked {
    pub name: String,
    pub up_to_date: bool,
}

pub fn spawn_check_mods(
    config: LauncherConfig,
    mut mods: Vec<Mod>,
    hook: Box<dyn CompletionHook>,
) -> std::io::Result<TaskHandle<ModChecked, Vec<Mod>>> {
    task::spawn_task("check-mods", move |ctx| {
        let verifier = Verifier::new(&config, hook.as_ref());
        let total = mods.len().max(1);
        for (index, mod_entry) in mods.iter_mut().enumerate() {
            ctx.checkpoint()?;
            mod_entry.up_to_date = verifier.is_complete_quick(mod_entry)?;
            ctx.progress(
                ModChecked {
                    name: mod_entry.foldername.clone(),
                    up_to_date: mod_entry.up_to_date,
                },
                (index + 1) as f32 / total as f32,
            );
        }
        Ok(mods)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        manifest::{ManifestFileRaw, ManifestInfo, ResumeData},
        metadata::{self, MetadataRecord},
        task::drive,
    };
    use std::time::Duration;
    use tempfile::TempDir;

    const T: i64 = 1_650_000_000;
    const URL: &str = "https://mods.example.org/@m.torrent";

    struct Fixture {
        _dir: TempDir,
        config: LauncherConfig,
        mod_entry: Mod,
    }

    fn resume_blob(files: &[(&str, u64)]) -> Vec<u8> {
        let resume = ResumeData {
            info: ManifestInfo {
                name: "@m".to_string(),
                files: Some(
                    files
                        .iter()
                        .map(|(path, len)| ManifestFileRaw {
                            path: path.split('/').map(str::to_string).collect(),
                            length: *len,
                            mtime: T,
                            sha1: None,
                            offsets: None,
                        })
                        .collect(),
                ),
                length: None,
                mtime: None,
                sha1: None,
            },
        };
        serde_bencode::to_bytes(&resume).unwrap()
    }

    fn write_file(path: &Path, len: u64, mtime: i64) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, vec![7u8; len as usize]).unwrap();
        filetime::set_file_mtime(path, FileTime::from_unix_time(mtime, 0)).unwrap();
    }

    fn installed() -> Fixture {
        let dir = TempDir::new().unwrap();
        let mods_root = dir.path().join("mods");
        let config = LauncherConfig::new(dir.path().join("data"), mods_root.clone());
        let mod_dir = mods_root.join("@m");
        write_file(&mod_dir.join("a/f1"), 10, T);
        write_file(&mod_dir.join("a/f2"), 20, T);
        metadata::mark_clean(&mod_dir, "1", URL, resume_blob(&[("a/f1", 10), ("a/f2", 20)]), &config)
            .unwrap();
        let mod_entry = Mod::from_record(
            crate::mods::ModRecord {
                foldername: "@m".to_string(),
                torrent_url: URL.to_string(),
                version: "1".to_string(),
                optional: false,
                parent_location: None,
            },
            &config,
        );
        Fixture {
            _dir: dir,
            config,
            mod_entry,
        }
    }

    fn verdict(fixture: &Fixture) -> Verdict {
        Verifier::new(&fixture.config, &NoHook)
            .check(&fixture.mod_entry)
            .unwrap()
    }

    #[test]
    fn exact_install_is_complete() {
        let fixture = installed();
        assert_eq!(verdict(&fixture), Verdict::Complete);
    }

    #[test]
    fn dirty_record_is_never_complete() {
        let fixture = installed();
        let mod_dir = fixture.mod_entry.full_path();
        let mut record = MetadataRecord::load(&mod_dir, &fixture.config).unwrap().unwrap();
        record.dirty = true;
        record.save(&mod_dir, &fixture.config).unwrap();
        assert_eq!(verdict(&fixture), Verdict::Incomplete(Incomplete::Dirty));
    }

    #[test]
    fn missing_or_unreadable_record() {
        let fixture = installed();
        let path = MetadataRecord::path(&fixture.mod_entry.full_path(), &fixture.config);
        fs::write(&path, "garbage").unwrap();
        assert!(matches!(
            verdict(&fixture),
            Verdict::Incomplete(Incomplete::BadMetadata(_))
        ));
        fs::remove_file(&path).unwrap();
        assert_eq!(verdict(&fixture), Verdict::Incomplete(Incomplete::NoMetadata));
    }

    #[test]
    fn changed_upstream_url_is_incomplete() {
        let mut fixture = installed();
        fixture.mod_entry.torrent_url = "https://mods.example.org/@m-v2.torrent".to_string();
        assert_eq!(verdict(&fixture), Verdict::Incomplete(Incomplete::UrlMismatch));
    }

    #[test]
    fn mtime_window_is_minus_one_second_to_plus_five_minutes() {
        let fixture = installed();
        let f1 = fixture.mod_entry.full_path().join("a/f1");

        for (offset, complete) in [(300, true), (-1, true), (301, false), (-2, false)] {
            filetime::set_file_mtime(&f1, FileTime::from_unix_time(T + offset, 0)).unwrap();
            assert_eq!(verdict(&fixture).is_complete(), complete, "offset {offset}");
        }
    }

    #[test]
    fn short_or_missing_file_is_incomplete_but_longer_is_accepted() {
        let fixture = installed();
        let f2 = fixture.mod_entry.full_path().join("a/f2");

        write_file(&f2, 25, T);
        assert!(verdict(&fixture).is_complete());

        write_file(&f2, 19, T);
        assert_eq!(
            verdict(&fixture),
            Verdict::Incomplete(Incomplete::FileMismatch("@m/a/f2".to_string()))
        );

        fs::remove_file(&f2).unwrap();
        assert!(!verdict(&fixture).is_complete());
    }

    #[test]
    fn superfluous_file_fails_last_stage() {
        let fixture = installed();
        write_file(&fixture.mod_entry.full_path().join("a/extra.txt"), 1, T);
        assert_eq!(verdict(&fixture), Verdict::Incomplete(Incomplete::Superfluous));
    }

    #[test]
    fn hook_can_veto_an_otherwise_complete_mod() {
        let fixture = installed();
        let plugins = fixture._dir.path().join("teamspeak/plugins");
        let hook = ExternalFilesHook {
            mod_name: "@m".to_string(),
            install_root: fixture.config.mods_root.clone(),
            prefix: "a".to_string(),
            target_dir: plugins.clone(),
        };
        let verifier = Verifier::new(&fixture.config, &hook);
        assert_eq!(
            verifier.check(&fixture.mod_entry).unwrap(),
            Verdict::Incomplete(Incomplete::Vetoed)
        );

        write_file(&plugins.join("f1"), 10, T);
        write_file(&plugins.join("f2"), 20, T);
        assert!(verifier.check(&fixture.mod_entry).unwrap().is_complete());
    }

    #[test]
    fn sweep_reports_each_mod_and_resolves_with_flags() {
        let fixture = installed();
        let mut missing = fixture.mod_entry.clone();
        missing.foldername = "@absent".to_string();
        let mods = vec![fixture.mod_entry.clone(), missing];

        let handle = spawn_check_mods(fixture.config.clone(), mods, Box::new(NoHook)).unwrap();
        let mut progress = Vec::new();
        let result = drive(handle, Duration::from_millis(20), |data, fraction| {
            progress.push((data, fraction))
        })
        .unwrap();

        assert_eq!(progress.len(), 2);
        assert_eq!(progress[1].1, 1.0);
        assert!(result[0].up_to_date);
        assert!(!result[1].up_to_date);
    }
}
