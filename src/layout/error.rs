use std::io;
use std::path::PathBuf;

use super::LayoutMode;

/// Failures of resolution, locking and conversion.
#[derive(Debug, thiserror::Error)]
pub enum BoxError {
    #[error("No box found for {target}")]
    NotFound { target: String },

    #[error("{} is claimed by several boxes: {}", .dir.display(), .candidates.join(", "))]
    Ambiguous {
        dir: PathBuf,
        candidates: Vec<String>,
    },

    #[error("Corrupt box state at {}: {reason}", .path.display())]
    CorruptState { path: PathBuf, reason: String },

    #[error("A {layout} box named '{name}' already exists at {}", .path.display())]
    NameCollision {
        layout: LayoutMode,
        name: String,
        path: PathBuf,
    },

    #[error("Box state at {} is locked by another agentbox process", .state_root.display())]
    Busy {
        state_root: PathBuf,
        pid: Option<u32>,
    },

    #[error("Staging failed while {step}: {detail}")]
    StagingFailure { step: String, detail: String },

    #[error("Invalid box name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Lock held on {} does not cover {}", .held.display(), .expected.display())]
    LockMismatch { expected: PathBuf, held: PathBuf },

    #[error("I/O error at {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl BoxError {
    pub(crate) fn not_found(target: impl std::fmt::Display) -> Self {
        BoxError::NotFound {
            target: target.to_string(),
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        BoxError::CorruptState {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn staging(step: &str, detail: impl std::fmt::Display) -> Self {
        BoxError::StagingFailure {
            step: step.to_string(),
            detail: detail.to_string(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        BoxError::Io {
            path: path.into(),
            source,
        }
    }

    /// Process exit code reported for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            BoxError::NotFound { .. } => 3,
            BoxError::Ambiguous { .. } => 4,
            BoxError::NameCollision { .. } => 5,
            BoxError::Busy { .. } => 6,
            BoxError::CorruptState { .. } => 7,
            BoxError::StagingFailure { .. } => 8,
            BoxError::InvalidName { .. } => 2,
            BoxError::LockMismatch { .. } | BoxError::Io { .. } => 1,
        }
    }
}
