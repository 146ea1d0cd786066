//! Project layout model: where a box's state lives for each layout mode.
//!
//! A box's state root is always derived from `(layout, name, source_root)`
//! plus the store location, so it can be recomputed from disk at any time.

pub mod convert;
mod error;
pub mod lock;
pub mod marker;
pub mod resolve;
mod resources;
mod staging;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub use convert::{Conversion, Converter, DuplicateRequest, Outcome};
pub use error::BoxError;
pub use lock::LockGuard;
pub use marker::Marker;
pub use resolve::Resolver;
pub(crate) use staging::write_atomic;

/// Marker file identifying a state directory.
pub const MARKER_FILE: &str = "box.json";
/// Advisory lock file held while a box's state is being mutated.
pub const LOCK_FILE: &str = ".lock";
/// Per-box configuration.
pub const CONFIG_FILE: &str = "config.yaml";
/// Last container id and image reference.
pub const CONTAINER_FILE: &str = "container.json";
/// Persistent agent home directory.
pub const HOME_DIR: &str = "home";
/// Snapshot index and blobs.
pub const VAULT_DIR: &str = "vault";
/// Archive manifests and blobs.
pub const ARCHIVES_DIR: &str = "archives";
/// Name of the state directory inside a decentralized project.
pub const DECENTRALIZED_DIR: &str = ".agentbox";
/// Prefix of in-flight staging directories.
pub const STAGING_PREFIX: &str = ".agentbox-staging-";
/// Prefix of retired state directories awaiting deletion.
pub const TRASH_PREFIX: &str = ".agentbox-trash-";

const MAX_SEGMENT_LEN: usize = 64;

/// How a project's persistent state is organized on disk.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum LayoutMode {
    /// All boxes live under the shared store, keyed by name
    Centralized,
    /// State lives inside the project tree
    Decentralized,
    /// Related projects share a workset root, keyed by workset and member
    Workset,
}

impl LayoutMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayoutMode::Centralized => "centralized",
            LayoutMode::Decentralized => "decentralized",
            LayoutMode::Workset => "workset",
        }
    }
}

impl fmt::Display for LayoutMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated box name.
///
/// Workset members carry a qualified `workset/member` name; every other
/// layout uses a single segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BoxName {
    workset: Option<String>,
    base: String,
}

impl BoxName {
    /// A single-segment name.
    pub fn single(base: &str) -> Result<Self, BoxError> {
        validate_segment(base)?;
        Ok(Self {
            workset: None,
            base: base.to_string(),
        })
    }

    /// A workset member name.
    pub fn member(workset: &str, member: &str) -> Result<Self, BoxError> {
        validate_segment(workset)?;
        validate_segment(member)?;
        Ok(Self {
            workset: Some(workset.to_string()),
            base: member.to_string(),
        })
    }

    /// Derive a default name from a directory's basename.
    pub fn from_dir(dir: &Path) -> Self {
        let raw = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut slugged = slug::slugify(raw);
        slugged.truncate(MAX_SEGMENT_LEN);
        let base = if slugged.is_empty() {
            "box".to_string()
        } else {
            slugged
        };
        Self {
            workset: None,
            base,
        }
    }

    /// Workset part of a qualified name.
    pub fn workset(&self) -> Option<&str> {
        self.workset.as_deref()
    }

    /// Member name for worksets, the whole name otherwise.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Whether this name has the shape required by `layout`.
    pub fn fits(&self, layout: LayoutMode) -> bool {
        match layout {
            LayoutMode::Workset => self.workset.is_some(),
            LayoutMode::Centralized | LayoutMode::Decentralized => self.workset.is_none(),
        }
    }

    /// File-system friendly form, used for staging and container names.
    pub fn flat(&self) -> String {
        match &self.workset {
            Some(ws) => format!("{}--{}", ws, self.base),
            None => self.base.clone(),
        }
    }
}

impl fmt::Display for BoxName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.workset {
            Some(ws) => write!(f, "{}/{}", ws, self.base),
            None => f.write_str(&self.base),
        }
    }
}

impl FromStr for BoxName {
    type Err = BoxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ws, member)) => Self::member(ws, member),
            None => Self::single(s),
        }
    }
}

impl TryFrom<String> for BoxName {
    type Error = BoxError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BoxName> for String {
    fn from(name: BoxName) -> Self {
        name.to_string()
    }
}

pub(crate) fn validate_segment(segment: &str) -> Result<(), BoxError> {
    let invalid = |reason: &str| BoxError::InvalidName {
        name: segment.to_string(),
        reason: reason.to_string(),
    };
    if segment.is_empty() {
        return Err(invalid("name must not be empty"));
    }
    if segment.len() > MAX_SEGMENT_LEN {
        return Err(invalid("name is longer than 64 characters"));
    }
    if segment.starts_with('.') {
        return Err(invalid("name must not start with '.'"));
    }
    if !segment
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(invalid("only letters, digits, '.', '_' and '-' are allowed"));
    }
    Ok(())
}

/// Location of the shared store holding centralized boxes and worksets.
///
/// Built once from configuration and passed explicitly to the resolver and
/// converter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    root: PathBuf,
}

impl StorePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding centralized boxes.
    pub fn boxes_dir(&self) -> PathBuf {
        self.root.join("boxes")
    }

    /// Directory holding worksets.
    pub fn worksets_dir(&self) -> PathBuf {
        self.root.join("worksets")
    }

    pub fn workset_root(&self, workset: &str) -> PathBuf {
        self.worksets_dir().join(workset)
    }

    /// The state root rule shared by resolution and conversion.
    pub fn state_root(
        &self,
        layout: LayoutMode,
        name: &BoxName,
        source_root: &Path,
    ) -> Result<PathBuf, BoxError> {
        if !name.fits(layout) {
            return Err(BoxError::InvalidName {
                name: name.to_string(),
                reason: match layout {
                    LayoutMode::Workset => "workset boxes need a 'workset/member' name".to_string(),
                    _ => format!("{} boxes take a single-segment name", layout),
                },
            });
        }
        Ok(match (layout, name.workset()) {
            (LayoutMode::Decentralized, _) => source_root.join(DECENTRALIZED_DIR),
            (LayoutMode::Workset, Some(ws)) => self.workset_root(ws).join(name.base()),
            _ => self.boxes_dir().join(name.base()),
        })
    }

    /// State root of a store-held box, which does not depend on its source.
    pub fn stored_state_root(&self, name: &BoxName) -> PathBuf {
        match name.workset() {
            Some(ws) => self.workset_root(ws).join(name.base()),
            None => self.boxes_dir().join(name.base()),
        }
    }
}

/// A resolved box: identity, layout and both ends of its footprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub name: BoxName,
    pub layout: LayoutMode,
    pub source_root: PathBuf,
    pub state_root: PathBuf,
}

impl Project {
    pub fn new(
        store: &StorePaths,
        layout: LayoutMode,
        name: BoxName,
        source_root: PathBuf,
    ) -> Result<Self, BoxError> {
        let state_root = store.state_root(layout, &name, &source_root)?;
        Ok(Self {
            name,
            layout,
            source_root,
            state_root,
        })
    }

    pub fn state(&self) -> StateDirectory<'_> {
        StateDirectory::new(&self.state_root)
    }
}

impl fmt::Display for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.layout)
    }
}

/// Paths of the sub-resources inside one state root.
#[derive(Debug, Clone, Copy)]
pub struct StateDirectory<'a> {
    root: &'a Path,
}

impl<'a> StateDirectory<'a> {
    pub fn new(root: &'a Path) -> Self {
        Self { root }
    }

    pub fn marker(&self) -> PathBuf {
        self.root.join(MARKER_FILE)
    }

    pub fn lock(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn config(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn container(&self) -> PathBuf {
        self.root.join(CONTAINER_FILE)
    }

    pub fn home(&self) -> PathBuf {
        self.root.join(HOME_DIR)
    }

    pub fn vault(&self) -> PathBuf {
        self.root.join(VAULT_DIR)
    }

    pub fn archives(&self) -> PathBuf {
        self.root.join(ARCHIVES_DIR)
    }
}

/// Whether a directory entry is an internal artifact (staging, trash, dotfile)
/// that store scans must ignore.
pub(crate) fn is_hidden_entry(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
