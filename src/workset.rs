//! Worksets group related boxes under one root in the store.
//!
//! The manifest only names and describes the workset; members are whatever
//! state directories with a valid marker live beneath it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::layout::{
    BoxError, LayoutMode, StorePaths, is_hidden_entry, now_secs, validate_segment, write_atomic,
};

pub const MANIFEST_FILE: &str = "workset.yaml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorksetManifest {
    pub name: String,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Workset {
    pub root: PathBuf,
    pub manifest: WorksetManifest,
}

impl Workset {
    pub fn create(
        store: &StorePaths,
        name: &str,
        description: Option<String>,
    ) -> Result<Self, BoxError> {
        validate_segment(name)?;
        let root = store.workset_root(name);
        if root.exists() {
            return Err(BoxError::NameCollision {
                layout: LayoutMode::Workset,
                name: name.to_string(),
                path: root,
            });
        }
        fs::create_dir_all(&root).map_err(|e| BoxError::io(&root, e))?;

        let manifest = WorksetManifest {
            name: name.to_string(),
            created_at: now_secs(),
            description,
        };
        let path = root.join(MANIFEST_FILE);
        let yaml = serde_yaml::to_string(&manifest)
            .map_err(|e| BoxError::corrupt(&path, e.to_string()))?;
        write_atomic(&path, yaml.as_bytes()).map_err(|e| BoxError::io(&path, e))?;
        info!(workset = name, root = %root.display(), "workset:created");
        Ok(Self { root, manifest })
    }

    pub fn load(store: &StorePaths, name: &str) -> Result<Self, BoxError> {
        let root = store.workset_root(name);
        if !root.is_dir() {
            return Err(BoxError::not_found(format!("workset '{}'", name)));
        }
        let manifest = read_manifest(&root.join(MANIFEST_FILE))?;
        if manifest.name != name {
            return Err(BoxError::corrupt(
                root.join(MANIFEST_FILE),
                format!("manifest names workset '{}'", manifest.name),
            ));
        }
        Ok(Self { root, manifest })
    }

    /// All worksets in the store, skipping ones with unreadable manifests.
    pub fn list(store: &StorePaths) -> Result<Vec<Self>, BoxError> {
        let dir = store.worksets_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BoxError::io(dir, e)),
        };
        let mut worksets = Vec::new();
        for entry in entries.flatten() {
            if is_hidden_entry(&entry.file_name()) || !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            match Self::load(store, &name) {
                Ok(ws) => worksets.push(ws),
                Err(e) => warn!(workset = name, error = %e, "workset:skipping unreadable"),
            }
        }
        worksets.sort_by(|a, b| a.manifest.name.cmp(&b.manifest.name));
        Ok(worksets)
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }
}

fn read_manifest(path: &Path) -> Result<WorksetManifest, BoxError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(BoxError::corrupt(path, "workset manifest is missing"));
        }
        Err(e) => return Err(BoxError::io(path, e)),
    };
    serde_yaml::from_str(&contents)
        .map_err(|e| BoxError::corrupt(path, format!("unparsable workset manifest: {}", e)))
}
