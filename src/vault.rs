//! Vault snapshots and archives.
//!
//! A box's vault keeps tarballs of the project's shared `share-rw`
//! directory. `vault/index.json` lists the snapshots with their checksums;
//! archived snapshots are copied to `archives/` with a manifest each.
//! The bookkeeping here is also what conversions use to verify staged copies.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::cmd::Cmd;
use crate::layout::{ARCHIVES_DIR, VAULT_DIR, now_secs, write_atomic};

pub const INDEX_FILE: &str = "index.json";
pub const SNAPSHOTS_DIR: &str = "snapshots";
/// Read-only share inside the vault directory.
pub const SHARE_RO: &str = "share-ro";
/// Read-write share inside the vault directory; this is what gets snapshotted.
pub const SHARE_RW: &str = "share-rw";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub id: String,
    pub file: String,
    pub sha256: String,
    pub size: u64,
    pub created_at: u64,
}

/// Ordered list of snapshots stored in `vault/index.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotIndex {
    #[serde(default)]
    pub snapshots: Vec<SnapshotEntry>,
}

impl SnapshotIndex {
    /// Load the index from a vault directory; a missing index is empty.
    pub fn load(vault_dir: &Path) -> Result<Self> {
        let path = vault_dir.join(INDEX_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse snapshot index at {}", path.display()))
    }

    pub fn save(&self, vault_dir: &Path) -> Result<()> {
        let path = vault_dir.join(INDEX_FILE);
        let json = serde_json::to_string_pretty(self)?;
        write_atomic(&path, json.as_bytes())
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn find(&self, id: &str) -> Option<&SnapshotEntry> {
        self.snapshots.iter().find(|s| s.id == id)
    }

    /// Check every listed blob against its recorded size and checksum.
    pub fn verify(&self, vault_dir: &Path) -> Result<()> {
        let blobs = vault_dir.join(SNAPSHOTS_DIR);
        for entry in &self.snapshots {
            verify_blob(&blobs.join(&entry.file), &entry.sha256, entry.size)
                .with_context(|| format!("snapshot '{}'", entry.id))?;
        }
        Ok(())
    }

    fn next_id(&self) -> String {
        let base = format!("snap-{}", now_secs());
        let mut id = base.clone();
        let mut n = 1;
        while self.find(&id).is_some() {
            id = format!("{}-{}", base, n);
            n += 1;
        }
        id
    }
}

/// Manifest for one archived snapshot, stored as `archives/<id>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub id: String,
    pub snapshot: String,
    pub file: String,
    pub sha256: String,
    pub size: u64,
    pub created_at: u64,
    pub source_root: PathBuf,
}

impl ArchiveManifest {
    pub fn load_all(archives_dir: &Path) -> Result<Vec<Self>> {
        if !archives_dir.exists() {
            return Ok(Vec::new());
        }
        let mut manifests = Vec::new();
        for entry in fs::read_dir(archives_dir)? {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let manifest: ArchiveManifest = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse archive manifest {}", path.display()))?;
            manifests.push(manifest);
        }
        manifests.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(manifests)
    }

    pub fn save(&self, archives_dir: &Path) -> Result<()> {
        let path = archives_dir.join(format!("{}.json", self.id));
        let json = serde_json::to_string_pretty(self)?;
        write_atomic(&path, json.as_bytes())
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn verify(&self, archives_dir: &Path) -> Result<()> {
        verify_blob(&archives_dir.join(&self.file), &self.sha256, self.size)
            .with_context(|| format!("archive '{}'", self.id))
    }
}

/// Verify every snapshot and archive blob under a state root.
pub fn verify_state(state_root: &Path) -> Result<()> {
    let vault_dir = state_root.join(VAULT_DIR);
    SnapshotIndex::load(&vault_dir)?.verify(&vault_dir)?;
    let archives_dir = state_root.join(ARCHIVES_DIR);
    for manifest in ArchiveManifest::load_all(&archives_dir)? {
        manifest.verify(&archives_dir)?;
    }
    Ok(())
}

/// Stream a file through sha256, returning the hex digest and its size.
pub fn file_digest(path: &Path) -> io::Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let size = io::copy(&mut file, &mut hasher)?;
    Ok((format!("{:x}", hasher.finalize()), size))
}

fn verify_blob(path: &Path, sha256: &str, size: u64) -> Result<()> {
    let (digest, actual) =
        file_digest(path).with_context(|| format!("Failed to read {}", path.display()))?;
    if actual != size {
        bail!(
            "{} is {} bytes, expected {}",
            path.display(),
            actual,
            size
        );
    }
    if digest != sha256 {
        bail!("{} checksum mismatch", path.display());
    }
    Ok(())
}

/// Snapshot storage for a box's vault.
pub trait VaultStore {
    /// Snapshot `source` into the box at `state_root`, returning the new id.
    fn create(&self, state_root: &Path, source: &Path) -> Result<String>;
    /// Copy a snapshot into `archives/` and record its manifest.
    fn archive(&self, state_root: &Path, id: &str) -> Result<ArchiveManifest>;
    /// Unpack a snapshot into `dest`.
    fn restore(&self, state_root: &Path, id: &str, dest: &Path) -> Result<()>;
}

/// Vault backed by plain tar files created with the `tar` CLI.
pub struct TarVault;

impl VaultStore for TarVault {
    fn create(&self, state_root: &Path, source: &Path) -> Result<String> {
        if !source.is_dir() {
            bail!("Nothing to snapshot: {} does not exist", source.display());
        }
        let vault_dir = state_root.join(VAULT_DIR);
        let blobs = vault_dir.join(SNAPSHOTS_DIR);
        fs::create_dir_all(&blobs)
            .with_context(|| format!("Failed to create {}", blobs.display()))?;

        let mut index = SnapshotIndex::load(&vault_dir)?;
        let id = index.next_id();
        let file = format!("{}.tar", id);
        let blob = blobs.join(&file);
        let blob_str = path_str(&blob)?;
        let source_str = path_str(source)?;

        debug!(id, source = source_str, "vault:creating snapshot");
        if let Err(e) = Cmd::new("tar")
            .workdir(source)
            .args(&["-cf", blob_str])
            .arg(".")
            .run()
        {
            let _ = fs::remove_file(&blob);
            return Err(e.context("Failed to create snapshot archive"));
        }

        let (sha256, size) = file_digest(&blob)?;
        index.snapshots.push(SnapshotEntry {
            id: id.clone(),
            file,
            sha256,
            size,
            created_at: now_secs(),
        });
        index.save(&vault_dir)?;
        info!(id, size, "vault:snapshot created");
        Ok(id)
    }

    fn archive(&self, state_root: &Path, id: &str) -> Result<ArchiveManifest> {
        let vault_dir = state_root.join(VAULT_DIR);
        let index = SnapshotIndex::load(&vault_dir)?;
        let entry = index
            .find(id)
            .ok_or_else(|| anyhow!("No snapshot with id '{}'", id))?;
        let blob = vault_dir.join(SNAPSHOTS_DIR).join(&entry.file);
        verify_blob(&blob, &entry.sha256, entry.size)?;

        let archives_dir = state_root.join(ARCHIVES_DIR);
        fs::create_dir_all(&archives_dir)?;
        let archive_id = format!("{}-archive-{}", entry.id, now_secs());
        let file = format!("{}.tar", archive_id);
        fs::copy(&blob, archives_dir.join(&file))
            .with_context(|| format!("Failed to copy {}", blob.display()))?;

        let manifest = ArchiveManifest {
            id: archive_id,
            snapshot: entry.id.clone(),
            file,
            sha256: entry.sha256.clone(),
            size: entry.size,
            created_at: now_secs(),
            source_root: marker_source(state_root)?,
        };
        manifest.verify(&archives_dir)?;
        manifest.save(&archives_dir)?;
        info!(id = manifest.id, snapshot = id, "vault:archived");
        Ok(manifest)
    }

    fn restore(&self, state_root: &Path, id: &str, dest: &Path) -> Result<()> {
        let vault_dir = state_root.join(VAULT_DIR);
        let index = SnapshotIndex::load(&vault_dir)?;
        let entry = index
            .find(id)
            .ok_or_else(|| anyhow!("No snapshot with id '{}'", id))?;
        let blob = vault_dir.join(SNAPSHOTS_DIR).join(&entry.file);
        verify_blob(&blob, &entry.sha256, entry.size)?;

        fs::create_dir_all(dest)
            .with_context(|| format!("Failed to create {}", dest.display()))?;
        Cmd::new("tar")
            .args(&["-xf", path_str(&blob)?, "-C", path_str(dest)?])
            .run()
            .context("Failed to unpack snapshot")?;
        info!(id, dest = %dest.display(), "vault:restored");
        Ok(())
    }
}

fn marker_source(state_root: &Path) -> Result<PathBuf> {
    let marker = crate::layout::Marker::read(state_root)?;
    Ok(marker.source_root)
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("Path is not valid UTF-8: {}", path.display()))
}
