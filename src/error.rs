use serde::{Deserialize, Serialize};
use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub type SyncResult<T> = std::result::Result<T, SyncError>;

pub const TERMINATED_MESSAGE: &str = "Terminated by user request";

const ELEVATION_HINT: &str =
    "Re-run the launcher with administrator rights or pick a mods directory you own.";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("permission denied while trying to {action} {path:?}")]
    PermissionRequired { path: PathBuf, action: String },

    #[error("refusing to touch {target:?}: it is not inside {base:?}")]
    SafetyViolation { target: PathBuf, base: PathBuf },

    #[error("invalid {what}: {reason}")]
    Format { what: String, reason: String },

    #[error("i/o error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{}", TERMINATED_MESSAGE)]
    Terminated,
}

impl SyncError {
    pub fn format(what: impl Into<String>, reason: impl ToString) -> Self {
        SyncError::Format {
            what: what.into(),
            reason: reason.to_string(),
        }
    }

    pub fn from_io(path: &Path, action: &str, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::PermissionDenied {
            SyncError::PermissionRequired {
                path: path.to_path_buf(),
                action: action.to_string(),
            }
        } else {
            SyncError::Io {
                path: path.to_path_buf(),
                source: err,
            }
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, SyncError::Terminated)
    }

    pub fn failure(&self) -> TaskFailure {
        let kind = match self {
            SyncError::PermissionRequired { .. } => FailureKind::PermissionRequired,
            SyncError::SafetyViolation { .. } => FailureKind::SafetyViolation,
            SyncError::Format { .. } => FailureKind::Format,
            SyncError::Io { .. } => FailureKind::Io,
            SyncError::Terminated => FailureKind::Terminated,
        };
        let remediation = match self {
            SyncError::PermissionRequired { .. } => Some(ELEVATION_HINT.to_string()),
            _ => None,
        };
        TaskFailure {
            kind,
            message: self.to_string(),
            remediation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    PermissionRequired,
    SafetyViolation,
    Format,
    Io,
    Terminated,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl TaskFailure {
    pub fn terminated() -> Self {
        SyncError::Terminated.failure()
    }

    pub fn internal(message: impl Into<String>) -> Self {
        TaskFailure {
            kind: FailureKind::Internal,
            message: message.into(),
            remediation: None,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.kind == FailureKind::Terminated
    }
}

impl From<SyncError> for TaskFailure {
    fn from(err: SyncError) -> Self {
        err.failure()
    }
}
