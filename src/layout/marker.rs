//! The `box.json` marker that makes a state directory self-describing.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::staging::write_atomic;
use super::{BoxError, BoxName, LayoutMode, MARKER_FILE, Project, StateDirectory};

pub const MARKER_VERSION: u32 = 1;

/// Identity of a box, without its location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxRef {
    pub layout: LayoutMode,
    pub name: BoxName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    pub version: u32,
    pub layout: LayoutMode,
    pub name: BoxName,
    pub source_root: PathBuf,
    pub created_at: u64,
    /// Box this one replaced; set until the replaced state is removed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<BoxRef>,
}

impl Marker {
    pub fn new(project: &Project, created_at: u64) -> Self {
        Self {
            version: MARKER_VERSION,
            layout: project.layout,
            name: project.name.clone(),
            source_root: project.source_root.clone(),
            created_at,
            supersedes: None,
        }
    }

    pub fn box_ref(&self) -> BoxRef {
        BoxRef {
            layout: self.layout,
            name: self.name.clone(),
        }
    }

    /// Load the marker in `state_root`, `None` when there is none.
    pub fn load(state_root: &Path) -> Result<Option<Self>, BoxError> {
        let path = StateDirectory::new(state_root).marker();
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BoxError::io(path, e)),
        };
        let marker: Marker = serde_json::from_str(&contents)
            .map_err(|e| BoxError::corrupt(&path, format!("unparsable marker: {}", e)))?;
        if marker.version > MARKER_VERSION {
            return Err(BoxError::corrupt(
                &path,
                format!("unsupported marker version {}", marker.version),
            ));
        }
        Ok(Some(marker))
    }

    /// Load the marker in `state_root`, treating a missing marker as corruption.
    pub fn read(state_root: &Path) -> Result<Self, BoxError> {
        Self::load(state_root)?.ok_or_else(|| {
            BoxError::corrupt(state_root.join(MARKER_FILE), "marker file is missing")
        })
    }

    pub fn write(&self, state_root: &Path) -> Result<(), BoxError> {
        let path = state_root.join(MARKER_FILE);
        let mut json = serde_json::to_string_pretty(self)
            .map_err(|e| BoxError::staging("serializing marker", e))?;
        json.push('\n');
        write_atomic(&path, json.as_bytes()).map_err(|e| BoxError::io(path, e))
    }

    /// The project this marker describes when found at `state_root`.
    pub fn project(&self, state_root: &Path) -> Project {
        Project {
            name: self.name.clone(),
            layout: self.layout,
            source_root: self.source_root.clone(),
            state_root: state_root.to_path_buf(),
        }
    }
}
