//! The pieces of a state directory and how each is carried across a
//! conversion.
//!
//! Structured entries are parsed and rewritten; opaque ones are copied and
//! checked by file count and byte total; anything unrecognised is carried
//! along as an extra so a conversion never drops data.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use super::staging::{copy_entry, tree_stats};
use super::{
    ARCHIVES_DIR, BoxError, CONFIG_FILE, CONTAINER_FILE, HOME_DIR, LOCK_FILE, LayoutMode,
    MARKER_FILE, Project, VAULT_DIR,
};
use crate::config::BoxConfig;
use crate::sandbox::ContainerMeta;
use crate::vault::{ArchiveManifest, SnapshotIndex};

/// Ignore file dropped into in-tree state directories.
pub(crate) const GITIGNORE_FILE: &str = ".gitignore";

/// What a conversion is staging.
pub(crate) struct StageContext<'a> {
    pub source: &'a Project,
    pub target: &'a Project,
    pub staging: &'a Path,
    /// The target is a new identity rather than the same box moved.
    pub clone: bool,
}

impl StageContext<'_> {
    fn from_source(&self, entry: &str) -> PathBuf {
        self.source.state_root.join(entry)
    }

    fn in_staging(&self, entry: &str) -> PathBuf {
        self.staging.join(entry)
    }
}

pub(crate) trait SubResource {
    fn name(&self) -> &'static str;
    /// Top-level entries of the state root this resource handles.
    fn entries(&self) -> Vec<OsString>;
    fn stage(&self, ctx: &StageContext) -> Result<(), BoxError>;
    fn validate(&self, ctx: &StageContext) -> Result<(), BoxError>;
}

/// The resources of a state directory, in staging order.
pub(crate) fn standard(credentials_dir: &Path) -> Vec<Box<dyn SubResource>> {
    let mut resources: Vec<Box<dyn SubResource>> = vec![
        Box::new(ConfigResource),
        Box::new(ContainerResource),
        Box::new(OpaqueTree::new("credentials", credentials_dir)),
        Box::new(OpaqueTree::new("home", Path::new(HOME_DIR))),
        Box::new(VaultResource),
        Box::new(ArchiveResource),
        Box::new(GitignoreResource),
    ];
    let mut claimed: Vec<OsString> = resources.iter().flat_map(|r| r.entries()).collect();
    claimed.push(MARKER_FILE.into());
    claimed.push(LOCK_FILE.into());
    resources.push(Box::new(Extras { claimed }));
    resources
}

pub(crate) fn staging_io(step: &'static str) -> impl Fn(std::io::Error) -> BoxError {
    move |e| BoxError::staging(step, e)
}

pub(crate) fn staging_any(step: &'static str) -> impl Fn(anyhow::Error) -> BoxError {
    move |e| BoxError::staging(step, format!("{:#}", e))
}

fn compare_trees(src: &Path, dst: &Path, what: &str) -> Result<(), BoxError> {
    let expected = tree_stats(src).map_err(staging_io("measuring source"))?;
    let actual = tree_stats(dst).map_err(staging_io("measuring staged copy"))?;
    if expected != actual {
        return Err(BoxError::staging(
            "validating staged copy",
            format!(
                "{}: expected {} files / {} bytes, found {} / {}",
                what, expected.files, expected.bytes, actual.files, actual.bytes
            ),
        ));
    }
    Ok(())
}

/// `config.yaml`: parse, rewrite paths for the target, serialize.
struct ConfigResource;

impl SubResource for ConfigResource {
    fn name(&self) -> &'static str {
        "config"
    }

    fn entries(&self) -> Vec<OsString> {
        vec![CONFIG_FILE.into()]
    }

    fn stage(&self, ctx: &StageContext) -> Result<(), BoxError> {
        let Some(mut config) =
            BoxConfig::load(&ctx.from_source(CONFIG_FILE)).map_err(staging_any("reading config"))?
        else {
            return Ok(());
        };
        config.relocate(
            (ctx.source.layout, &ctx.source.source_root),
            (ctx.target.layout, &ctx.target.source_root),
        );
        config
            .save(&ctx.in_staging(CONFIG_FILE))
            .map_err(staging_any("writing config"))
    }

    fn validate(&self, ctx: &StageContext) -> Result<(), BoxError> {
        let staged =
            BoxConfig::load(&ctx.in_staging(CONFIG_FILE)).map_err(staging_any("re-reading config"))?;
        if staged.is_some() != ctx.from_source(CONFIG_FILE).exists() {
            return Err(BoxError::staging(
                "validating staged copy",
                "config presence differs from source",
            ));
        }
        Ok(())
    }
}

/// `container.json`: the last container belongs to the source identity only.
struct ContainerResource;

impl SubResource for ContainerResource {
    fn name(&self) -> &'static str {
        "container"
    }

    fn entries(&self) -> Vec<OsString> {
        vec![CONTAINER_FILE.into()]
    }

    fn stage(&self, ctx: &StageContext) -> Result<(), BoxError> {
        let path = ctx.from_source(CONTAINER_FILE);
        if !path.exists() {
            return Ok(());
        }
        if !ctx.clone {
            return fs::copy(&path, ctx.in_staging(CONTAINER_FILE))
                .map(|_| ())
                .map_err(staging_io("copying container metadata"));
        }
        let mut meta = ContainerMeta::load(&path).map_err(staging_any("reading container metadata"))?;
        meta.last_container_id = None;
        meta.save(&ctx.in_staging(CONTAINER_FILE))
            .map_err(staging_any("writing container metadata"))
    }

    fn validate(&self, ctx: &StageContext) -> Result<(), BoxError> {
        let staged = ctx.in_staging(CONTAINER_FILE);
        if staged.exists() {
            let meta = ContainerMeta::load(&staged)
                .map_err(staging_any("re-reading container metadata"))?;
            if ctx.clone && meta.last_container_id.is_some() {
                return Err(BoxError::staging(
                    "validating staged copy",
                    "clone still references the source container",
                ));
            }
        }
        Ok(())
    }
}

/// A directory copied as-is.
struct OpaqueTree {
    label: &'static str,
    dir: PathBuf,
}

impl OpaqueTree {
    fn new(label: &'static str, dir: &Path) -> Self {
        Self {
            label,
            dir: dir.to_path_buf(),
        }
    }
}

impl SubResource for OpaqueTree {
    fn name(&self) -> &'static str {
        self.label
    }

    fn entries(&self) -> Vec<OsString> {
        // Only the top-level component is claimed
        self.dir
            .components()
            .next()
            .map(|c| vec![c.as_os_str().to_os_string()])
            .unwrap_or_default()
    }

    fn stage(&self, ctx: &StageContext) -> Result<(), BoxError> {
        let src = ctx.source.state_root.join(&self.dir);
        if !src.exists() {
            return Ok(());
        }
        copy_entry(&src, &ctx.staging.join(&self.dir)).map_err(staging_io("copying tree"))
    }

    fn validate(&self, ctx: &StageContext) -> Result<(), BoxError> {
        let src = ctx.source.state_root.join(&self.dir);
        if !src.exists() {
            return Ok(());
        }
        compare_trees(&src, &ctx.staging.join(&self.dir), self.label)
    }
}

/// `vault/`: copied, then every indexed blob is checksum-verified.
struct VaultResource;

impl SubResource for VaultResource {
    fn name(&self) -> &'static str {
        "vault"
    }

    fn entries(&self) -> Vec<OsString> {
        vec![VAULT_DIR.into()]
    }

    fn stage(&self, ctx: &StageContext) -> Result<(), BoxError> {
        let src = ctx.from_source(VAULT_DIR);
        if !src.exists() {
            return Ok(());
        }
        copy_entry(&src, &ctx.in_staging(VAULT_DIR)).map_err(staging_io("copying vault"))
    }

    fn validate(&self, ctx: &StageContext) -> Result<(), BoxError> {
        let src = ctx.from_source(VAULT_DIR);
        if !src.exists() {
            return Ok(());
        }
        let staged = ctx.in_staging(VAULT_DIR);
        SnapshotIndex::load(&staged)
            .and_then(|index| index.verify(&staged))
            .map_err(staging_any("verifying snapshots"))?;
        compare_trees(&src, &staged, "vault")
    }
}

/// `archives/`: copied, then every manifest's blob is checksum-verified.
struct ArchiveResource;

impl SubResource for ArchiveResource {
    fn name(&self) -> &'static str {
        "archives"
    }

    fn entries(&self) -> Vec<OsString> {
        vec![ARCHIVES_DIR.into()]
    }

    fn stage(&self, ctx: &StageContext) -> Result<(), BoxError> {
        let src = ctx.from_source(ARCHIVES_DIR);
        if !src.exists() {
            return Ok(());
        }
        copy_entry(&src, &ctx.in_staging(ARCHIVES_DIR)).map_err(staging_io("copying archives"))
    }

    fn validate(&self, ctx: &StageContext) -> Result<(), BoxError> {
        let src = ctx.from_source(ARCHIVES_DIR);
        if !src.exists() {
            return Ok(());
        }
        let staged = ctx.in_staging(ARCHIVES_DIR);
        let manifests =
            ArchiveManifest::load_all(&staged).map_err(staging_any("reading archive manifests"))?;
        for manifest in manifests {
            manifest
                .verify(&staged)
                .map_err(staging_any("verifying archives"))?;
        }
        compare_trees(&src, &staged, "archives")
    }
}

/// `.gitignore` belongs to the in-tree layout only, so it is regenerated
/// rather than copied.
struct GitignoreResource;

impl SubResource for GitignoreResource {
    fn name(&self) -> &'static str {
        "gitignore"
    }

    fn entries(&self) -> Vec<OsString> {
        vec![GITIGNORE_FILE.into()]
    }

    fn stage(&self, ctx: &StageContext) -> Result<(), BoxError> {
        if ctx.target.layout != LayoutMode::Decentralized {
            return Ok(());
        }
        write_gitignore(ctx.staging).map_err(staging_io("writing .gitignore"))
    }

    fn validate(&self, _ctx: &StageContext) -> Result<(), BoxError> {
        Ok(())
    }
}

pub(crate) fn write_gitignore(state_root: &Path) -> std::io::Result<()> {
    fs::write(state_root.join(GITIGNORE_FILE), "*\n")
}

/// Whatever else lives in the state root.
struct Extras {
    claimed: Vec<OsString>,
}

impl Extras {
    fn unclaimed(&self, root: &Path) -> Result<Vec<OsString>, BoxError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(root).map_err(staging_io("listing state directory"))? {
            let name = entry.map_err(staging_io("listing state directory"))?.file_name();
            if !self.claimed.contains(&name) {
                names.push(name);
            }
        }
        Ok(names)
    }
}

impl SubResource for Extras {
    fn name(&self) -> &'static str {
        "extras"
    }

    fn entries(&self) -> Vec<OsString> {
        Vec::new()
    }

    fn stage(&self, ctx: &StageContext) -> Result<(), BoxError> {
        for name in self.unclaimed(&ctx.source.state_root)? {
            copy_entry(&ctx.source.state_root.join(&name), &ctx.staging.join(&name))
                .map_err(staging_io("copying extra entry"))?;
        }
        Ok(())
    }

    fn validate(&self, ctx: &StageContext) -> Result<(), BoxError> {
        for name in self.unclaimed(&ctx.source.state_root)? {
            compare_trees(
                &ctx.source.state_root.join(&name),
                &ctx.staging.join(&name),
                &name.to_string_lossy(),
            )?;
        }
        Ok(())
    }
}
