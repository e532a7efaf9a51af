use crate::{
    config::LauncherConfig,
    error::{SyncError, SyncResult},
    manifest::ReferenceManifest,
    metadata::{self, MetadataRecord},
    mods::Mod,
    policing::{self, PolicingMode},
    repair::{self, RepairReport},
    task::{self, CancelToken, TaskHandle},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub trait Transport: Send {
    fn fetch(&mut self, mod_entry: &Mod, cancel: &CancelToken) -> SyncResult<Vec<u8>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeReport {
    pub repaired: BTreeMap<String, RepairReport>,
    pub clean: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    Started,
    Downloaded,
    Finalized,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub mod_name: String,
    pub stage: SyncStage,
}

pub fn begin_sync(mod_entry: &Mod, config: &LauncherConfig) -> SyncResult<MetadataRecord> {
    tracing::info!(mod_name = %mod_entry.foldername, "sync starting");
    metadata::mark_dirty(&mod_entry.full_path(), &mod_entry.torrent_url, config)
}

pub fn finalize_mod(
    mod_entry: &Mod,
    resume_data: Vec<u8>,
    config: &LauncherConfig,
    cancel: &CancelToken,
) -> SyncResult<FinalizeReport> {
    let manifest = ReferenceManifest::from_resume_data(&resume_data)?;
    if manifest.name != mod_entry.foldername {
        return Err(SyncError::format(
            "reference manifest",
            format!(
                "describes {:?}, expected {:?}",
                manifest.name, mod_entry.foldername
            ),
        ));
    }
    let base = &mod_entry.parent_location;

    let repaired = repair::repair_manifest_archives(&manifest, base, cancel)?;
    cancel.check()?;

    let whitelist = config.whitelisted_files();
    let clean = policing::check_mod_directories(
        &manifest.layout(),
        base,
        &whitelist,
        PolicingMode::Remove,
    )?;
    cancel.check()?;

    metadata::mark_clean(
        &mod_entry.full_path(),
        &mod_entry.version,
        &mod_entry.torrent_url,
        resume_data,
        config,
    )?;
    tracing::info!(
        mod_name = %mod_entry.foldername,
        archives = repaired.values().filter(|report| report.changed()).count(),
        "mod finalized"
    );
    Ok(FinalizeReport {
        repaired,
        clean,
    })
}

pub fn spawn_sync(
    config: LauncherConfig,
    mut mod_entry: Mod,
    mut transport: Box<dyn Transport>,
) -> std::io::Result<TaskHandle<SyncProgress, Mod>> {
    task::spawn_task("sync", move |ctx| {
        let stage = |stage| SyncProgress {
            mod_name: mod_entry.foldername.clone(),
            stage,
        };
        begin_sync(&mod_entry, &config)?;
        ctx.progress(stage(SyncStage::Started), 0.0);

        let cancel = ctx.cancel_token();
        ctx.checkpoint()?;
        let resume_data = transport.fetch(&mod_entry, &cancel)?;
        ctx.checkpoint()?;
        ctx.progress(stage(SyncStage::Downloaded), 0.8);

        let manifest = ReferenceManifest::from_resume_data(&resume_data)?;
        finalize_mod(&mod_entry, resume_data, &config, &cancel)?;
        ctx.progress(stage(SyncStage::Finalized), 1.0);

        mod_entry.reference = Some(manifest);
        mod_entry.up_to_date = true;
        Ok(mod_entry)
    })
}
