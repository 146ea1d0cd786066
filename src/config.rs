use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use anyhow::{Context, Result};

use crate::layout::{LayoutMode, StorePaths, write_atomic};

const DEFAULT_IMAGE: &str = "ghcr.io/agentbox/base:latest";

/// Container runtime used to run boxes
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Docker (default)
    #[default]
    Docker,
    /// Podman
    Podman,
}

impl RuntimeKind {
    pub fn program(&self) -> &'static str {
        match self {
            RuntimeKind::Docker => "docker",
            RuntimeKind::Podman => "podman",
        }
    }
}

/// Container settings shared by every box
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct ContainerConfig {
    /// Container runtime. Default: docker
    #[serde(default)]
    pub runtime: Option<RuntimeKind>,

    /// Image used when a box does not pick its own. Default: ghcr.io/agentbox/base:latest
    #[serde(default)]
    pub image: Option<String>,
}

impl ContainerConfig {
    pub fn runtime(&self) -> RuntimeKind {
        self.runtime.unwrap_or_default()
    }

    pub fn resolved_image(&self) -> &str {
        self.image.as_deref().unwrap_or(DEFAULT_IMAGE)
    }
}

/// Global configuration from `~/.config/agentbox/config.yaml`
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Config {
    /// Store location. Default: $XDG_DATA_HOME/agentbox
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Layout for `box init` when none is given. Default: centralized
    #[serde(default)]
    pub default_layout: Option<LayoutMode>,

    #[serde(default)]
    pub container: ContainerConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        debug!("config:loading");
        let Some(path) = Self::config_path() else {
            return Ok(Self::default());
        };
        Ok(Self::load_from_path(&path)?.unwrap_or_default())
    }

    fn load_from_path(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        debug!(path = %path.display(), "config:reading file");
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse config at {}: {}", path.display(), e))?;
        Ok(Some(config))
    }

    pub fn config_path() -> Option<PathBuf> {
        xdg_dir("XDG_CONFIG_HOME", ".config").map(|dir| dir.join("agentbox").join("config.yaml"))
    }

    pub fn default_layout(&self) -> LayoutMode {
        self.default_layout.unwrap_or(LayoutMode::Centralized)
    }

    /// Where centralized boxes and worksets live.
    pub fn store_paths(&self) -> Result<StorePaths> {
        if let Some(dir) = &self.data_dir {
            return Ok(StorePaths::new(expand_home(dir)));
        }
        let dir = xdg_dir("XDG_DATA_HOME", ".local/share")
            .context("Could not determine a data directory; set data_dir in the config")?;
        Ok(StorePaths::new(dir.join("agentbox")))
    }
}

fn xdg_dir(var: &str, fallback: &str) -> Option<PathBuf> {
    if let Ok(value) = std::env::var(var)
        && !value.is_empty()
    {
        return Some(PathBuf::from(value));
    }
    home::home_dir().map(|home| home.join(fallback))
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~")
        && let Some(home) = home::home_dir()
    {
        return home.join(rest);
    }
    path.to_path_buf()
}

/// A bind mount requested by a box
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MountConfig {
    pub source: PathBuf,
    pub target: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
}

/// Per-box configuration stored as `config.yaml` in the state root.
///
/// Path-valued keys are relative to the source root for decentralized boxes
/// when they point inside the source tree, absolute otherwise. Keys this
/// version does not know are carried through untouched.
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct BoxConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<MountConfig>,

    /// Directory holding `share-ro` and `share-rw`. Default: `<source>/vault`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_dir: Option<PathBuf>,

    #[serde(flatten)]
    pub extra: serde_yaml::Mapping,
}

impl BoxConfig {
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse box config at {}", path.display()))?;
        Ok(Some(config))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = serde_yaml::to_string(self).context("Failed to serialize box config")?;
        write_atomic(path, contents.as_bytes())
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Rewrite path-valued keys for a box moving between layouts or sources.
    pub fn relocate(&mut self, from: (LayoutMode, &Path), to: (LayoutMode, &Path)) {
        let (_, from_root) = from;
        let (to_layout, to_root) = to;
        let relative = to_layout == LayoutMode::Decentralized;
        for mount in &mut self.mounts {
            mount.source = relocate_path(&mount.source, from_root, to_root, relative);
        }
        if let Some(dir) = &self.vault_dir {
            self.vault_dir = Some(relocate_path(dir, from_root, to_root, relative));
        }
    }

    /// Mounts with every source made absolute against `source_root`.
    pub fn resolved_mounts(&self, source_root: &Path) -> Vec<MountConfig> {
        self.mounts
            .iter()
            .map(|m| MountConfig {
                source: absolutize(&m.source, source_root),
                ..m.clone()
            })
            .collect()
    }

    pub fn resolved_vault_dir(&self, source_root: &Path) -> PathBuf {
        match &self.vault_dir {
            Some(dir) => absolutize(dir, source_root),
            None => source_root.join("vault"),
        }
    }
}

fn absolutize(path: &Path, root: &Path) -> PathBuf {
    if path.is_relative() {
        root.join(path)
    } else {
        path.to_path_buf()
    }
}

fn relocate_path(path: &Path, from_root: &Path, to_root: &Path, relative: bool) -> PathBuf {
    let absolute = absolutize(path, from_root);
    let Ok(rest) = absolute.strip_prefix(from_root) else {
        return absolute;
    };
    let rebased = if rest.as_os_str().is_empty() {
        to_root.to_path_buf()
    } else {
        to_root.join(rest)
    };
    if !relative {
        return rebased;
    }
    match pathdiff::diff_paths(&rebased, to_root) {
        Some(p) if p.as_os_str().is_empty() => PathBuf::from("."),
        Some(p) => p,
        None => rebased,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> BoxConfig {
        serde_yaml::from_str(
            r#"
image: custom:1
env:
  B: two
  A: one
mounts:
  - source: /work/demo/data
    target: /data
  - source: /opt/shared
    target: /shared
    read_only: true
agent_args: ["--fast"]
"#,
        )
        .unwrap()
    }

    #[test]
    fn container_defaults() {
        let config = Config::default();
        assert_eq!(config.container.runtime(), RuntimeKind::Docker);
        assert_eq!(config.container.resolved_image(), DEFAULT_IMAGE);
        assert_eq!(config.default_layout(), LayoutMode::Centralized);
    }

    #[test]
    fn parses_global_config() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        fs::write(
            &path,
            "data_dir: /srv/agentbox\ndefault_layout: workset\ncontainer:\n  runtime: podman\n",
        )
        .unwrap();
        let config = Config::load_from_path(&path).unwrap().unwrap();
        assert_eq!(config.default_layout(), LayoutMode::Workset);
        assert_eq!(config.container.runtime(), RuntimeKind::Podman);
        assert_eq!(
            config.store_paths().unwrap().root(),
            Path::new("/srv/agentbox")
        );
    }

    #[test]
    fn unknown_keys_survive_save() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        sample().save(&path).unwrap();

        let loaded = BoxConfig::load(&path).unwrap().unwrap();
        assert_eq!(loaded, sample());
        assert!(fs::read_to_string(&path).unwrap().contains("agent_args"));
    }

    #[test]
    fn relocate_to_decentralized_makes_inner_paths_relative() {
        let mut config = sample();
        config.relocate(
            (LayoutMode::Centralized, Path::new("/work/demo")),
            (LayoutMode::Decentralized, Path::new("/work/demo")),
        );
        assert_eq!(config.mounts[0].source, PathBuf::from("data"));
        assert_eq!(config.mounts[1].source, PathBuf::from("/opt/shared"));
    }

    #[test]
    fn relocate_back_restores_absolute_paths() {
        let mut config = sample();
        let src = Path::new("/work/demo");
        config.relocate(
            (LayoutMode::Centralized, src),
            (LayoutMode::Decentralized, src),
        );
        config.relocate(
            (LayoutMode::Decentralized, src),
            (LayoutMode::Centralized, src),
        );
        assert_eq!(config, sample());
    }

    #[test]
    fn relocate_rebases_onto_new_source() {
        let mut config = sample();
        config.vault_dir = Some(PathBuf::from("/work/demo/vault"));
        config.relocate(
            (LayoutMode::Centralized, Path::new("/work/demo")),
            (LayoutMode::Workset, Path::new("/work/copy")),
        );
        assert_eq!(config.mounts[0].source, PathBuf::from("/work/copy/data"));
        assert_eq!(config.vault_dir, Some(PathBuf::from("/work/copy/vault")));
    }

    #[test]
    fn resolved_paths_are_absolute() {
        let config = BoxConfig {
            mounts: vec![MountConfig {
                source: PathBuf::from("data"),
                target: "/data".to_string(),
                read_only: false,
            }],
            ..Default::default()
        };
        let root = Path::new("/work/demo");
        assert_eq!(
            config.resolved_mounts(root)[0].source,
            PathBuf::from("/work/demo/data")
        );
        assert_eq!(config.resolved_vault_dir(root), PathBuf::from("/work/demo/vault"));
    }
}
