//! Running boxes in containers.

mod container;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::layout::{BoxName, write_atomic};

pub use container::CliRuntime;

/// Where the project source is mounted inside the container.
pub const WORKSPACE_DIR: &str = "/workspace";
/// Home directory of the agent user inside the container.
pub const AGENT_HOME: &str = "/home/agent";

/// A bind mount passed to the runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

/// Everything needed to start a box's container.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    pub mounts: Vec<Mount>,
    pub env: Vec<(String, String)>,
    pub workdir: String,
}

/// Container engine used to run boxes.
pub trait ContainerRuntime {
    fn image_exists(&self, image: &str) -> Result<bool>;
    fn pull(&self, image: &str) -> Result<()>;
    /// Start a detached container, returning its id.
    fn run(&self, spec: &RunSpec) -> Result<String>;
    /// Stop a container. Returns false if it was not running or is gone.
    fn stop(&self, id: &str) -> Result<bool>;
    /// Ids of running containers that belong to agentbox.
    fn list(&self) -> Result<Vec<String>>;
}

/// Container name for a box.
pub fn container_name(name: &BoxName) -> String {
    format!("agentbox-{}", name.flat())
}

/// Last container started for a box, stored as `container.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMeta {
    #[serde(default)]
    pub last_container_id: Option<String>,
    #[serde(default)]
    pub image_ref: Option<String>,
}

impl ContainerMeta {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse container metadata at {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        write_atomic(path, json.as_bytes())
            .with_context(|| format!("Failed to write {}", path.display()))
    }
}
