pub mod archive;
pub mod config;
pub mod error;
pub mod finalize;
pub mod finder;
pub mod install;
pub mod logging;
pub mod manifest;
pub mod metadata;
pub mod mods;
pub mod policing;
pub mod reconcile;
pub mod repair;
pub mod task;
pub mod verify;
