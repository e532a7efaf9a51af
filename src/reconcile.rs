use crate::{
    config::LauncherConfig,
    error::{SyncError, SyncResult},
    finder, install,
    manifest::ReferenceManifest,
    metadata::MetadataRecord,
    mods::Mod,
    policing::{self, PolicingMode},
    task::{self, Command, TaskContext, TaskHandle},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs, io,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReuseAction {
    Use,
    Copy,
    Discard,
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchAction {
    Download,
    Search,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileState {
    Scanning,
    AwaitingDecisions,
    Resolved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReconcileEvent {
    MissingMods { mods: Vec<String> },
    ModFoundAction { mod_name: String, locations: Vec<PathBuf> },
    ModReused { mod_name: String, action: ReuseAction },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    pub mods: Vec<Mod>,
    pub decisions: BTreeMap<String, ReuseAction>,
    pub to_download: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Session {
    pub missing: BTreeSet<String>,
    pub awaiting: i32,
}

impl Session {
    pub fn is_done(&self) -> bool {
        self.missing.is_empty() && self.awaiting <= 0
    }

    /// Consumes one outstanding answer. False when nothing was asked.
    pub fn answer(&mut self) -> bool {
        if self.awaiting <= 0 {
            return false;
        }
        self.awaiting -= 1;
        true
    }
}

pub struct Reconciler<'a> {
    config: &'a LauncherConfig,
    mods: Vec<Mod>,
    session: Session,
    state: ReconcileState,
    decisions: BTreeMap<String, ReuseAction>,
    to_download: BTreeSet<String>,
}

impl<'a> Reconciler<'a> {
    pub fn new(config: &'a LauncherConfig, mods: Vec<Mod>) -> Self {
        Self {
            config,
            mods,
            session: Session::default(),
            state: ReconcileState::Scanning,
            decisions: BTreeMap::new(),
            to_download: BTreeSet::new(),
        }
    }

    pub fn state(&self) -> ReconcileState {
        self.state
    }

    pub fn run(
        mut self,
        ctx: &mut TaskContext<ReconcileEvent, ReconcileOutcome>,
    ) -> SyncResult<ReconcileOutcome> {
        match self.drive(ctx) {
            Ok(()) => {
                self.state = ReconcileState::Resolved;
                Ok(ReconcileOutcome {
                    mods: self.mods,
                    decisions: self.decisions,
                    to_download: self.to_download.into_iter().collect(),
                })
            }
            Err(err) => {
                self.state = ReconcileState::Rejected;
                Err(err)
            }
        }
    }

    fn drive(&mut self, ctx: &mut TaskContext<ReconcileEvent, ReconcileOutcome>) -> SyncResult<()> {
        self.scan(ctx)?;
        if self.session.missing.is_empty() {
            return Ok(());
        }

        self.state = ReconcileState::AwaitingDecisions;
        let locations = self.config.search_roots.clone();
        self.search(ctx, &locations);
        self.ask_missing(ctx);

        let wait = self.config.poll_interval();
        while !self.session.is_done() {
            let Some(command) = ctx.next_command(wait)? else {
                continue;
            };
            self.handle(ctx, command)?;
            if self.session.awaiting <= 0 && !self.session.missing.is_empty() {
                self.ask_missing(ctx);
            }
        }
        Ok(())
    }

    fn scan(&mut self, ctx: &mut TaskContext<ReconcileEvent, ReconcileOutcome>) -> SyncResult<()> {
        for mod_entry in &self.mods {
            ctx.checkpoint()?;
            if !mod_entry.is_wanted() {
                tracing::debug!(mod_name = %mod_entry.foldername, "optional mod not selected");
                continue;
            }
            let path = mod_entry.full_path();
            match fs::symlink_metadata(&path) {
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(SyncError::from_io(&path, "inspect", err)),
            }
            install::prepare_parent(&path)?;
            self.session.missing.insert(mod_entry.foldername.clone());
            self.to_download.insert(mod_entry.foldername.clone());
        }
        tracing::info!(missing = self.session.missing.len(), "scan finished");
        Ok(())
    }

    fn search(&mut self, ctx: &TaskContext<ReconcileEvent, ReconcileOutcome>, locations: &[PathBuf]) {
        let exclude: BTreeMap<String, PathBuf> = self
            .mods
            .iter()
            .filter(|mod_entry| self.session.missing.contains(&mod_entry.foldername))
            .map(|mod_entry| (mod_entry.foldername.clone(), mod_entry.full_path()))
            .collect();
        let found = finder::find_candidates(
            &self.session.missing,
            locations,
            self.config.search_depth,
            &exclude,
        );
        for (mod_name, locations) in found {
            self.session.awaiting += 1;
            ctx.progress(
                ReconcileEvent::ModFoundAction { mod_name, locations },
                self.fraction(),
            );
        }
    }

    fn ask_missing(&mut self, ctx: &TaskContext<ReconcileEvent, ReconcileOutcome>) {
        self.session.awaiting += 1;
        ctx.progress(
            ReconcileEvent::MissingMods {
                mods: self.session.missing.iter().cloned().collect(),
            },
            self.fraction(),
        );
    }

    fn handle(
        &mut self,
        ctx: &mut TaskContext<ReconcileEvent, ReconcileOutcome>,
        command: Command,
    ) -> SyncResult<()> {
        match command {
            Command::Terminate => Err(SyncError::Terminated),
            Command::ModReuse {
                mod_name,
                action,
                location,
            } => {
                if !self.session.answer() {
                    tracing::warn!(mod_name = %mod_name, "reuse decision nobody asked for");
                    return Ok(());
                }
                if !self.session.missing.contains(&mod_name) {
                    tracing::warn!(mod_name = %mod_name, "reuse decision for a mod that is not missing");
                    return Ok(());
                }
                self.apply_reuse(ctx, &mod_name, action, &location)
            }
            Command::ModSearch { action, location } => {
                if !self.session.answer() {
                    tracing::warn!("search decision nobody asked for");
                    return Ok(());
                }
                match action {
                    SearchAction::Download => {
                        tracing::info!(count = self.session.missing.len(), "remaining mods will be downloaded");
                        self.session.missing.clear();
                    }
                    SearchAction::Search => match location {
                        Some(location) => self.search(ctx, &[location]),
                        None => tracing::warn!("search requested without a location"),
                    },
                }
                Ok(())
            }
        }
    }

    fn apply_reuse(
        &mut self,
        ctx: &mut TaskContext<ReconcileEvent, ReconcileOutcome>,
        mod_name: &str,
        action: ReuseAction,
        location: &Path,
    ) -> SyncResult<()> {
        let Some(index) = self.mods.iter().position(|m| m.foldername == mod_name) else {
            return Ok(());
        };
        let dest = self.mods[index].full_path();
        match action {
            ReuseAction::Ignore => return Ok(()),
            ReuseAction::Discard => {}
            ReuseAction::Use => {
                install::link_existing(location, &dest)?;
                self.mods[index].linked_to = Some(location.to_path_buf());
                self.to_download.remove(mod_name);
            }
            ReuseAction::Copy => {
                install::copy_existing(location, &dest, &ctx.cancel_token())?;
                self.police_copy(index)?;
                self.to_download.remove(mod_name);
            }
        }
        self.session.missing.remove(mod_name);
        self.decisions.insert(mod_name.to_string(), action);
        ctx.progress(
            ReconcileEvent::ModReused {
                mod_name: mod_name.to_string(),
                action,
            },
            self.fraction(),
        );
        Ok(())
    }

    fn police_copy(&mut self, index: usize) -> SyncResult<()> {
        let mod_entry = &self.mods[index];
        let reference = match &mod_entry.reference {
            Some(reference) => reference.clone(),
            None => match self.copied_manifest(mod_entry)? {
                Some(reference) => reference,
                None => return Ok(()),
            },
        };
        let whitelist = self.config.whitelisted_files();
        policing::check_mod_directories(
            &reference.layout(),
            &mod_entry.parent_location,
            &whitelist,
            PolicingMode::Remove,
        )?;
        self.mods[index].reference = Some(reference);
        Ok(())
    }

    fn copied_manifest(&self, mod_entry: &Mod) -> SyncResult<Option<ReferenceManifest>> {
        let Some(record) = MetadataRecord::load(&mod_entry.full_path(), self.config)? else {
            tracing::info!(mod_name = %mod_entry.foldername, "copied tree has no metadata record, left as is");
            return Ok(None);
        };
        let manifest = match record.reference_manifest() {
            Ok(manifest) => manifest,
            Err(err) => {
                tracing::warn!(mod_name = %mod_entry.foldername, error = %err, "copied metadata record unusable");
                return Ok(None);
            }
        };
        if manifest.name != mod_entry.foldername {
            tracing::warn!(
                mod_name = %mod_entry.foldername,
                manifest = %manifest.name,
                "copied tree describes another mod"
            );
            return Ok(None);
        }
        Ok(Some(manifest))
    }

    fn fraction(&self) -> f32 {
        let wanted = self.to_download.len().max(1) + self.decisions.len();
        self.decisions.len() as f32 / wanted as f32
    }
}

pub fn spawn_reconcile(
    config: LauncherConfig,
    mods: Vec<Mod>,
) -> std::io::Result<TaskHandle<ReconcileEvent, ReconcileOutcome>> {
    task::spawn_task("reconcile", move |ctx| Reconciler::new(&config, mods).run(ctx))
}
