use crate::{
    archive::{self, ArchiveEntry, ArchiveLayout},
    error::{SyncError, SyncResult},
    manifest::ReferenceManifest,
    task::{self, CancelToken, TaskHandle},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairReport {
    pub relocated: Vec<String>,
    pub absent: Vec<String>,
}

impl RepairReport {
    pub fn changed(&self) -> bool {
        !self.relocated.is_empty()
    }
}

pub fn find_mismatches<'a>(
    layout: &'a ArchiveLayout,
    reference: &BTreeMap<String, u64>,
) -> (Vec<(&'a ArchiveEntry, u64)>, Vec<String>) {
    let mut mismatched = Vec::new();
    let mut absent = Vec::new();
    for (name, &expected) in reference {
        match layout.entry(name) {
            Some(entry) if entry.offset != expected => mismatched.push((entry, expected)),
            Some(_) => {}
            None => absent.push(name.clone()),
        }
    }
    mismatched.sort_by_key(|(_, expected)| *expected);
    (mismatched, absent)
}

pub fn repair_archive(path: &Path, reference: &BTreeMap<String, u64>) -> SyncResult<RepairReport> {
    let layout = archive::read_archive(path)?;
    let (mismatched, absent) = find_mismatches(&layout, reference);
    for name in &absent {
        tracing::debug!(archive = ?path, subfile = %name, "reference subfile not in archive");
    }
    if mismatched.is_empty() {
        return Ok(RepairReport {
            relocated: Vec::new(),
            absent,
        });
    }

    for (entry, expected) in &mismatched {
        if *expected < layout.header_end || u32::try_from(*expected).is_err() {
            return Err(SyncError::format(
                format!("reference offsets for {:?}", path),
                format!("{} cannot live at {}", entry.name, expected),
            ));
        }
    }

    if let Some((left, right)) = first_overlap(&layout, &mismatched) {
        return Err(SyncError::format(
            format!("reference offsets for {:?}", path),
            format!("{left} would overlap {right}"),
        ));
    }

    let scratch = scratch_path(path)?;
    let result = rewrite(path, &scratch, &layout, &mismatched);
    if let Err(err) = result {
        let _ = fs::remove_file(&scratch);
        return Err(err);
    }
    fs::rename(&scratch, path).map_err(|err| {
        let _ = fs::remove_file(&scratch);
        SyncError::from_io(path, "replace", err)
    })?;

    let relocated: Vec<String> = mismatched
        .iter()
        .map(|(entry, _)| entry.name.clone())
        .collect();
    tracing::info!(archive = ?path, count = relocated.len(), "relocated subfiles");
    Ok(RepairReport { relocated, absent })
}

fn first_overlap(
    layout: &ArchiveLayout,
    mismatched: &[(&ArchiveEntry, u64)],
) -> Option<(String, String)> {
    let mut extents: Vec<(u64, u64, &str)> = layout
        .entries
        .iter()
        .filter(|entry| !mismatched.iter().any(|(moved, _)| moved.name == entry.name))
        .map(|entry| (entry.offset, u64::from(entry.data_size), entry.name.as_str()))
        .chain(
            mismatched
                .iter()
                .map(|(entry, target)| (*target, u64::from(entry.data_size), entry.name.as_str())),
        )
        .filter(|(_, size, _)| *size > 0)
        .collect();
    extents.sort();
    extents.windows(2).find_map(|pair| {
        let (start, size, left) = pair[0];
        let (next, _, right) = pair[1];
        (start + size > next).then(|| (left.to_string(), right.to_string()))
    })
}

fn rewrite(
    original: &Path,
    scratch: &Path,
    layout: &ArchiveLayout,
    mismatched: &[(&ArchiveEntry, u64)],
) -> SyncResult<()> {
    let scratch_err = |err: io::Error| SyncError::from_io(scratch, "write", err);

    fs::copy(original, scratch).map_err(|err| SyncError::from_io(scratch, "copy", err))?;
    let mut source = File::open(original).map_err(|err| SyncError::from_io(original, "open", err))?;
    let mut out = File::options()
        .read(true)
        .write(true)
        .open(scratch)
        .map_err(scratch_err)?;

    // The trailer is recomputed once every subfile is in place.
    out.set_len(layout.content_end).map_err(scratch_err)?;

    for (entry, expected) in mismatched {
        let len = out.metadata().map_err(scratch_err)?.len();
        if len < *expected {
            out.set_len(*expected).map_err(scratch_err)?;
        }
        out.seek(SeekFrom::Start(*expected)).map_err(scratch_err)?;
        source
            .seek(SeekFrom::Start(entry.offset))
            .map_err(|err| SyncError::from_io(original, "read", err))?;
        let copied = io::copy(&mut (&mut source).take(u64::from(entry.data_size)), &mut out)
            .map_err(scratch_err)?;
        if copied != u64::from(entry.data_size) {
            return Err(SyncError::format(
                format!("archive {:?}", original),
                format!("{} is truncated", entry.name),
            ));
        }

        out.seek(SeekFrom::Start(entry.reserved_pos))
            .map_err(scratch_err)?;
        let offset_field = *expected as u32;
        out.write_all(&offset_field.to_le_bytes())
            .map_err(scratch_err)?;
    }

    archive::append_trailer(&mut out).map_err(scratch_err)?;
    out.sync_all().map_err(scratch_err)
}

fn scratch_path(path: &Path) -> SyncResult<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| SyncError::format("archive path", format!("{:?}", path)))?;
    let mut scratch = name.to_os_string();
    scratch.push(".repair");
    Ok(path.with_file_name(scratch))
}

/// Repairs every archive of `manifest` installed under `base`. Cancellation
/// is honoured between archives only; an archive rewrite always runs to the
/// end.
pub fn repair_manifest_archives(
    manifest: &ReferenceManifest,
    base: &Path,
    cancel: &CancelToken,
) -> SyncResult<BTreeMap<String, RepairReport>> {
    let mut reports = BTreeMap::new();
    for (file, offsets) in manifest.archives() {
        cancel.check()?;
        let path = base.join(&file.path);
        if !path.is_file() {
            tracing::debug!(archive = ?path, "archive not on disk, skipping repair");
            continue;
        }
        let report = repair_archive(&path, offsets)?;
        reports.insert(file.path.clone(), report);
    }
    Ok(reports)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRepaired {
    pub path: String,
    pub report: RepairReport,
}

pub fn spawn_repair(
    manifest: ReferenceManifest,
    base: PathBuf,
) -> io::Result<TaskHandle<ArchiveRepaired, BTreeMap<String, RepairReport>>> {
    task::spawn_task("repair", move |ctx| {
        let archives: Vec<_> = manifest.archives().collect();
        let total = archives.len().max(1);
        let mut reports = BTreeMap::new();
        for (index, (file, offsets)) in archives.into_iter().enumerate() {
            ctx.checkpoint()?;
            let path = base.join(&file.path);
            if !path.is_file() {
                tracing::debug!(archive = ?path, "archive not on disk, skipping repair");
                continue;
            }
            let report = repair_archive(&path, offsets)?;
            ctx.progress(
                ArchiveRepaired {
                    path: file.path.clone(),
                    report: report.clone(),
                },
                (index + 1) as f32 / total as f32,
            );
            reports.insert(file.path.clone(), report);
        }
        Ok(reports)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{read_archive, verify_checksum, ArchiveBuilder};
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn sample(path: &Path) -> ArchiveLayout {
        ArchiveBuilder::new()
            .extension("prefix", "z\\ui")
            .file("a.paa", vec![0xAAu8; 40], 1)
            .file("b.sqf", vec![0xBBu8; 25], 2)
            .file("c.bin", vec![0xCCu8; 10], 3)
            .write(path)
            .unwrap();
        read_archive(path).unwrap()
    }

    fn payload(path: &Path, name: &str) -> Vec<u8> {
        let layout = read_archive(path).unwrap();
        let entry = layout.entry(name).unwrap();
        let raw = fs::read(path).unwrap();
        let start = entry.offset as usize;
        raw[start..start + entry.data_size as usize].to_vec()
    }

    #[test]
    fn relocates_to_reference_offsets_and_keeps_others() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ui.pbo");
        let before = sample(&path);
        let c_before = before.entry("c.bin").unwrap().offset;
        let target = before.content_end + 100;

        let reference = BTreeMap::from([
            ("b.sqf".to_string(), target),
            ("a.paa".to_string(), before.entry("a.paa").unwrap().offset),
            ("gone.txt".to_string(), 5000),
        ]);
        let report = repair_archive(&path, &reference).unwrap();
        assert_eq!(report.relocated, vec!["b.sqf".to_string()]);
        assert_eq!(report.absent, vec!["gone.txt".to_string()]);

        let after = read_archive(&path).unwrap();
        assert_eq!(after.entry("b.sqf").unwrap().offset, target);
        assert_eq!(after.entry("c.bin").unwrap().offset, c_before);
        assert_eq!(payload(&path, "b.sqf"), vec![0xBB; 25]);
        assert_eq!(payload(&path, "c.bin"), vec![0xCC; 10]);
        assert_eq!(after.content_end, target + 25);
        assert!(verify_checksum(&path).unwrap());
        assert!(!dir.path().join("ui.pbo.repair").exists());
    }

    #[test]
    fn second_run_leaves_bytes_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ui.pbo");
        let before = sample(&path);
        let reference = BTreeMap::from([
            ("a.paa".to_string(), before.content_end + 7),
            ("c.bin".to_string(), before.content_end + 64),
        ]);

        assert!(repair_archive(&path, &reference).unwrap().changed());
        let once = fs::read(&path).unwrap();
        assert!(!repair_archive(&path, &reference).unwrap().changed());
        assert_eq!(fs::read(&path).unwrap(), once);
    }

    #[test]
    fn offsets_inside_the_header_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ui.pbo");
        sample(&path);
        let original = fs::read(&path).unwrap();
        let reference = BTreeMap::from([("a.paa".to_string(), 3)]);
        assert!(matches!(
            repair_archive(&path, &reference),
            Err(SyncError::Format { .. })
        ));
        assert_eq!(fs::read(&path).unwrap(), original);
    }

    #[test]
    fn target_on_top_of_a_staying_subfile_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ui.pbo");
        let before = sample(&path);
        let original = fs::read(&path).unwrap();
        let reference = BTreeMap::from([(
            "b.sqf".to_string(),
            before.entry("c.bin").unwrap().offset,
        )]);

        assert!(matches!(
            repair_archive(&path, &reference),
            Err(SyncError::Format { .. })
        ));
        assert_eq!(fs::read(&path).unwrap(), original);
        assert_eq!(payload(&path, "c.bin"), vec![0xCC; 10]);
        assert!(!dir.path().join("ui.pbo.repair").exists());
    }

    #[test]
    fn moved_subfiles_may_not_collide_with_each_other() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ui.pbo");
        let before = sample(&path);
        let reference = BTreeMap::from([
            ("a.paa".to_string(), before.content_end + 10),
            ("c.bin".to_string(), before.content_end + 20),
        ]);
        assert!(matches!(
            repair_archive(&path, &reference),
            Err(SyncError::Format { .. })
        ));
    }

    #[test]
    fn cancelled_batch_stops_before_the_next_archive() {
        let dir = TempDir::new().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let manifest = ReferenceManifest {
            name: "@m".to_string(),
            files: vec![crate::manifest::ManifestFile {
                path: "@m/addons/ui.pbo".to_string(),
                size: 0,
                mtime: 0,
                hash: None,
                offsets: Some(BTreeMap::new()),
            }],
        };
        assert!(matches!(
            repair_manifest_archives(&manifest, dir.path(), &cancel),
            Err(SyncError::Terminated)
        ));
    }

    #[test]
    fn repair_worker_reports_each_archive() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("@m/addons")).unwrap();
        let path = dir.path().join("@m/addons/ui.pbo");
        let before = sample(&path);
        let manifest = ReferenceManifest {
            name: "@m".to_string(),
            files: vec![crate::manifest::ManifestFile {
                path: "@m/addons/ui.pbo".to_string(),
                size: 0,
                mtime: 0,
                hash: None,
                offsets: Some(BTreeMap::from([(
                    "c.bin".to_string(),
                    before.content_end + 3,
                )])),
            }],
        };

        let handle = spawn_repair(manifest, dir.path().to_path_buf()).unwrap();
        let mut seen = Vec::new();
        let tick = std::time::Duration::from_millis(20);
        let reports = crate::task::drive(handle, tick, |event: ArchiveRepaired, _| {
            seen.push(event.path)
        })
        .unwrap();
        assert_eq!(seen, vec!["@m/addons/ui.pbo".to_string()]);
        assert_eq!(reports["@m/addons/ui.pbo"].relocated, vec!["c.bin".to_string()]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn repair_is_idempotent_and_places_every_subfile(
            gap_a in 0u64..300,
            gap_c in 0u64..300,
            move_a in any::<bool>(),
        ) {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("p.pbo");
            let before = sample(&path);
            let mut reference = BTreeMap::new();
            let a_target = before.content_end + gap_a;
            let c_target = a_target + 40 + gap_c;
            if move_a {
                reference.insert("a.paa".to_string(), a_target);
            }
            reference.insert("c.bin".to_string(), c_target);

            repair_archive(&path, &reference).unwrap();
            let once = fs::read(&path).unwrap();
            repair_archive(&path, &reference).unwrap();
            prop_assert_eq!(fs::read(&path).unwrap(), once);

            let after = read_archive(&path).unwrap();
            for (name, offset) in &reference {
                prop_assert_eq!(after.entry(name).unwrap().offset, *offset);
            }
            prop_assert_eq!(payload(&path, "a.paa"), vec![0xAA; 40]);
            prop_assert_eq!(payload(&path, "c.bin"), vec![0xCC; 10]);
            prop_assert!(verify_checksum(&path).unwrap());
        }
    }
}
