//! Moving and cloning box state between layouts and identities.
//!
//! Every conversion follows the same path: build the full target tree in a
//! staging directory beside the target, validate it, rename it into place,
//! and only then remove the source. At any point at least one of the old
//! and new states is complete on disk.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::marker::{BoxRef, MARKER_VERSION};
use super::resources::{
    self, StageContext, SubResource, staging_any, staging_io, write_gitignore,
};
use super::staging::{discard, retire, staging_path, swap_into_place};
use super::{
    BoxError, BoxName, LayoutMode, LockGuard, Marker, Project, Resolver, StateDirectory,
    StorePaths, now_secs,
};
use crate::config::BoxConfig;
use crate::credentials::CredentialsManager;
use crate::sandbox::ContainerMeta;
use crate::vault::{SHARE_RO, SHARE_RW, SNAPSHOTS_DIR, SnapshotIndex};
use crate::workset::Workset;

/// Result of a conversion that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Converted,
    /// Nothing to do; the box already has the requested layout and name.
    Unchanged,
    /// The new state is in place but the old one could not be removed.
    CleanupWarning(String),
}

#[derive(Debug, Clone)]
pub struct Conversion {
    pub project: Project,
    pub outcome: Outcome,
}

/// Parameters of `duplicate`.
pub struct DuplicateRequest<'g> {
    pub name: BoxName,
    pub layout: Option<LayoutMode>,
    pub source_root: Option<PathBuf>,
    /// Remove the original after the copy is in place.
    pub delete_source: bool,
    /// Lock on an existing target that may be replaced.
    pub overwrite: Option<&'g LockGuard>,
}

/// Points at which tests can stop a conversion as if the process died.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CrashPoint {
    BeforeSwap,
    AfterSwap,
    /// Removing the source after the swap fails.
    Retire,
}

struct ConversionPlan {
    source: Project,
    target: Project,
    staging: PathBuf,
    created_at: u64,
    clone: bool,
    removes_source: bool,
    replace: bool,
}

impl ConversionPlan {
    /// What the target marker records while the source still exists. A box
    /// moved under its own identity never sits beside itself, so it records
    /// nothing.
    fn supersedes(&self) -> Option<BoxRef> {
        let source = BoxRef {
            layout: self.source.layout,
            name: self.source.name.clone(),
        };
        let own = BoxRef {
            layout: self.target.layout,
            name: self.target.name.clone(),
        };
        (self.removes_source && source != own).then_some(source)
    }
}

pub struct Converter<'a> {
    store: StorePaths,
    credentials: &'a dyn CredentialsManager,
    #[cfg(test)]
    crash_at: Option<CrashPoint>,
}

impl<'a> Converter<'a> {
    pub fn new(store: StorePaths, credentials: &'a dyn CredentialsManager) -> Self {
        Self {
            store,
            credentials,
            #[cfg(test)]
            crash_at: None,
        }
    }

    /// Create a fresh state directory for `project`.
    pub fn create(&self, project: &Project, config: &BoxConfig) -> Result<Project, BoxError> {
        if project.state_root.exists() {
            return Err(collision(project));
        }
        self.ensure_target_parent(project)?;
        if let Some(other) = self.claimant(project, None)? {
            return Err(collision_with(project, &other));
        }

        let staging = staging_path(&project.state_root, &project.name.flat())?;
        if let Err(e) = self.write_fresh(&staging, project, config) {
            discard(&staging);
            return Err(e);
        }
        if let Err(e) = swap_into_place(&staging, &project.state_root, false, || collision(project))
        {
            discard(&staging);
            return Err(e);
        }
        info!(name = %project.name, layout = %project.layout, "convert:created");
        Ok(project.clone())
    }

    /// Move a box to another layout, optionally renaming it.
    pub fn migrate(
        &self,
        guard: &LockGuard,
        project: &Project,
        layout: LayoutMode,
        name: Option<BoxName>,
    ) -> Result<Conversion, BoxError> {
        check_guard(guard, project)?;
        let name = match name {
            Some(name) => name,
            None => default_name(project, layout, None)?,
        };
        if layout == project.layout && name == project.name {
            return Ok(unchanged(project));
        }
        let target = Project::new(&self.store, layout, name, project.source_root.clone())?;
        if target.state_root == project.state_root {
            return self.rename_in_place(project, target);
        }
        self.ensure_target_parent(&target)?;
        let plan = self.plan(project, target, false, true, false)?;
        self.execute(plan)
    }

    /// Move a box to another layout, refusing up front if the target
    /// namespace already has a box for this source.
    pub fn convert(
        &self,
        guard: &LockGuard,
        project: &Project,
        layout: LayoutMode,
        workset: Option<&str>,
    ) -> Result<Conversion, BoxError> {
        check_guard(guard, project)?;
        let name = default_name(project, layout, workset)?;
        if layout == project.layout && name == project.name {
            return Ok(unchanged(project));
        }
        let target = Project::new(&self.store, layout, name, project.source_root.clone())?;
        if target.state_root.exists() {
            return Err(collision(&target));
        }
        if let Some(other) = self.claimant(&target, Some(&project.state_root))? {
            return Err(collision_with(&target, &other));
        }
        self.ensure_target_parent(&target)?;
        let plan = self.plan(project, target, false, true, false)?;
        self.execute(plan)
    }

    /// Point a box at the directory its project now lives in, keeping its
    /// layout and name.
    ///
    /// Store-held boxes keep their state root, so only the marker and the
    /// config's paths are rewritten. An in-tree box is moved with a full
    /// staged conversion.
    pub fn remap(
        &self,
        guard: &LockGuard,
        project: &Project,
        new_source: &Path,
    ) -> Result<Conversion, BoxError> {
        check_guard(guard, project)?;
        let new_source = new_source
            .canonicalize()
            .map_err(|_| BoxError::not_found(new_source.display()))?;
        if new_source == project.source_root {
            return Ok(unchanged(project));
        }
        let target = Project::new(&self.store, project.layout, project.name.clone(), new_source)?;
        if let Some(other) = self.claimant(&target, Some(&project.state_root))? {
            return Err(collision_with(&target, &other));
        }
        if target.state_root != project.state_root {
            self.ensure_target_parent(&target)?;
            let plan = self.plan(project, target, false, true, false)?;
            return self.execute(plan);
        }
        rebind_in_place(project, target)
    }

    /// Clone a box under a new identity.
    pub fn duplicate(
        &self,
        guard: &LockGuard,
        project: &Project,
        request: DuplicateRequest,
    ) -> Result<Conversion, BoxError> {
        check_guard(guard, project)?;
        let layout = request.layout.unwrap_or(project.layout);
        let source_root = match request.source_root {
            Some(dir) => dir
                .canonicalize()
                .map_err(|_| BoxError::not_found(dir.display()))?,
            None => project.source_root.clone(),
        };
        let target = Project::new(&self.store, layout, request.name, source_root)?;
        if target.state_root == project.state_root {
            // Same slot, new source: a move of a store-held box is a remap
            if request.delete_source && target.source_root != project.source_root {
                return self.remap(guard, project, &target.source_root);
            }
            return Err(collision(&target));
        }
        self.ensure_target_parent(&target)?;

        let replace = if target.state_root.exists() {
            match request.overwrite {
                Some(lock) if lock.covers(&target.state_root) => true,
                Some(lock) => {
                    return Err(BoxError::LockMismatch {
                        expected: target.state_root.clone(),
                        held: lock.state_root().to_path_buf(),
                    });
                }
                None => return Err(collision(&target)),
            }
        } else {
            false
        };

        let plan = self.plan(project, target, true, request.delete_source, replace)?;
        self.execute(plan)
    }

    /// Delete a box's state directory.
    pub fn remove(&self, guard: &LockGuard, project: &Project) -> Result<(), BoxError> {
        check_guard(guard, project)?;
        retire(&project.state_root).map_err(|e| BoxError::staging("removing state", e))?;
        info!(name = %project.name, layout = %project.layout, "convert:removed");
        Ok(())
    }

    fn plan(
        &self,
        source: &Project,
        target: Project,
        clone: bool,
        removes_source: bool,
        replace: bool,
    ) -> Result<ConversionPlan, BoxError> {
        let marker = Marker::read(&source.state_root)?;
        let staging = staging_path(&target.state_root, &target.name.flat())?;
        Ok(ConversionPlan {
            source: source.clone(),
            target,
            staging,
            created_at: if clone { now_secs() } else { marker.created_at },
            clone,
            removes_source,
            replace,
        })
    }

    fn execute(&self, plan: ConversionPlan) -> Result<Conversion, BoxError> {
        info!(
            from = %plan.source,
            to = %plan.target,
            staging = %plan.staging.display(),
            "convert:start"
        );
        let resources = resources::standard(self.credentials.cache_dir());
        let ctx = StageContext {
            source: &plan.source,
            target: &plan.target,
            staging: &plan.staging,
            clone: plan.clone,
        };

        // The caller's lock on a replaced target stays with the old tree once
        // it is moved aside, so the new tree is locked before it becomes visible.
        let staged = self
            .stage(&plan, &ctx, &resources)
            .and_then(|_| validate(&plan, &ctx, &resources))
            .and_then(|_| {
                plan.replace
                    .then(|| LockGuard::acquire(&plan.staging))
                    .transpose()
            });
        let mut target_guard = match staged {
            Ok(guard) => guard,
            Err(e) => {
                warn!(error = %e, "convert:staging failed");
                discard(&plan.staging);
                return Err(e);
            }
        };

        self.simulate_crash(CrashPoint::BeforeSwap)?;
        if let Err(e) = swap_into_place(&plan.staging, &plan.target.state_root, plan.replace, || {
            collision(&plan.target)
        }) {
            warn!(error = %e, "convert:swap failed");
            drop(target_guard);
            discard(&plan.staging);
            return Err(e);
        }
        if let Some(guard) = target_guard.as_mut() {
            guard.rebase(&plan.target.state_root);
        }
        self.simulate_crash(CrashPoint::AfterSwap)?;

        let outcome = if plan.removes_source {
            self.cleanup(&plan)
        } else {
            Outcome::Converted
        };
        info!(to = %plan.target, ?outcome, "convert:done");
        Ok(Conversion {
            project: plan.target,
            outcome,
        })
    }

    fn stage(
        &self,
        plan: &ConversionPlan,
        ctx: &StageContext,
        resources: &[Box<dyn SubResource>],
    ) -> Result<(), BoxError> {
        fs::create_dir(&plan.staging)
            .map_err(|e| BoxError::staging("creating staging directory", e))?;
        for resource in resources {
            debug!(resource = resource.name(), "convert:staging resource");
            resource.stage(ctx)?;
        }
        let marker = Marker {
            version: MARKER_VERSION,
            layout: plan.target.layout,
            name: plan.target.name.clone(),
            source_root: plan.target.source_root.clone(),
            created_at: plan.created_at,
            supersedes: plan.supersedes(),
        };
        marker
            .write(&plan.staging)
            .map_err(|e| BoxError::staging("writing marker", e))
    }

    fn rename_in_place(&self, project: &Project, target: Project) -> Result<Conversion, BoxError> {
        let mut marker = Marker::read(&project.state_root)?;
        marker.name = target.name.clone();
        marker.write(&project.state_root)?;
        info!(from = %project.name, to = %target.name, "convert:renamed in place");
        Ok(Conversion {
            project: target,
            outcome: Outcome::Converted,
        })
    }

    /// Make sure the directory that will hold the target exists.
    fn ensure_target_parent(&self, target: &Project) -> Result<(), BoxError> {
        match (target.layout, target.name.workset()) {
            (LayoutMode::Workset, Some(ws)) => Workset::load(&self.store, ws).map(|_| ()),
            (LayoutMode::Decentralized, _) => {
                if target.source_root.is_dir() {
                    Ok(())
                } else {
                    Err(BoxError::not_found(target.source_root.display()))
                }
            }
            _ => {
                let dir = self.store.boxes_dir();
                fs::create_dir_all(&dir).map_err(|e| BoxError::io(dir, e))
            }
        }
    }

    /// A box that already claims the target's source directory and would
    /// make resolution from it ambiguous. An in-tree box beside a workset
    /// member is not a conflict: the in-tree one wins.
    fn claimant(
        &self,
        target: &Project,
        ignore: Option<&Path>,
    ) -> Result<Option<Project>, BoxError> {
        let resolver = Resolver::new(self.store.clone());
        for layout in [
            LayoutMode::Decentralized,
            LayoutMode::Workset,
            LayoutMode::Centralized,
        ] {
            if matches!(
                (target.layout, layout),
                (LayoutMode::Decentralized, LayoutMode::Workset)
                    | (LayoutMode::Workset, LayoutMode::Decentralized)
            ) {
                continue;
            }
            let other = resolver
                .bound_to(layout, &target.source_root)?
                .into_iter()
                .find(|p| {
                    Some(p.state_root.as_path()) != ignore && p.state_root != target.state_root
                });
            if other.is_some() {
                return Ok(other);
            }
        }
        Ok(None)
    }

    /// Remove the source after a successful swap, then drop the `supersedes`
    /// note from the target since nothing is left to supersede.
    fn cleanup(&self, plan: &ConversionPlan) -> Outcome {
        let retired = self
            .simulate_crash(CrashPoint::Retire)
            .map_err(|e| e.to_string())
            .and_then(|_| retire(&plan.source.state_root));
        if let Err(msg) = retired {
            warn!(source = %plan.source, error = msg, "convert:cleanup failed");
            return Outcome::CleanupWarning(msg);
        }
        match Marker::read(&plan.target.state_root) {
            Ok(mut marker) => {
                marker.supersedes = None;
                if let Err(e) = marker.write(&plan.target.state_root) {
                    warn!(error = %e, "convert:could not clear supersedes");
                }
            }
            Err(e) => warn!(error = %e, "convert:could not re-read target marker"),
        }
        Outcome::Converted
    }

    fn write_fresh(
        &self,
        staging: &Path,
        project: &Project,
        config: &BoxConfig,
    ) -> Result<(), BoxError> {
        let state = StateDirectory::new(staging);
        fs::create_dir(staging).map_err(staging_io("creating staging directory"))?;
        let mut config = config.clone();
        config.relocate(
            (project.layout, &project.source_root),
            (project.layout, &project.source_root),
        );
        config.save(&state.config()).map_err(staging_any("writing config"))?;
        ContainerMeta::default()
            .save(&state.container())
            .map_err(staging_any("writing container metadata"))?;
        fs::create_dir_all(staging.join(self.credentials.cache_dir()))
            .map_err(staging_io("creating credentials cache"))?;
        bootstrap_home(&state.home(), &project.name).map_err(staging_io("bootstrapping home"))?;
        fs::create_dir_all(state.vault().join(SNAPSHOTS_DIR)).map_err(staging_io("creating vault"))?;
        SnapshotIndex::default()
            .save(&state.vault())
            .map_err(staging_any("writing snapshot index"))?;
        fs::create_dir_all(state.archives()).map_err(staging_io("creating archives"))?;
        if project.layout == LayoutMode::Decentralized {
            write_gitignore(staging).map_err(staging_io("writing .gitignore"))?;
        }
        ensure_vault_shares(&config.resolved_vault_dir(&project.source_root));
        Marker::new(project, now_secs())
            .write(staging)
            .map_err(|e| BoxError::staging("writing marker", e))
    }

    #[cfg(test)]
    fn simulate_crash(&self, point: CrashPoint) -> Result<(), BoxError> {
        if self.crash_at == Some(point) {
            return Err(BoxError::staging("simulated crash", format!("{:?}", point)));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn simulate_crash(&self, _point: CrashPoint) -> Result<(), BoxError> {
        Ok(())
    }
}

fn validate(
    plan: &ConversionPlan,
    ctx: &StageContext,
    resources: &[Box<dyn SubResource>],
) -> Result<(), BoxError> {
    for resource in resources {
        resource.validate(ctx)?;
    }
    let staged = Marker::read(&plan.staging)
        .map_err(|e| BoxError::staging("re-reading marker", e))?;
    if staged.layout != plan.target.layout || staged.name != plan.target.name {
        return Err(BoxError::staging(
            "validating staged copy",
            "staged marker does not describe the target",
        ));
    }
    Ok(())
}

/// Rewrite a store-held box's recorded source where it stands. The marker
/// is written last, so an interruption leaves the box bound to its old source.
fn rebind_in_place(project: &Project, target: Project) -> Result<Conversion, BoxError> {
    let config_path = project.state().config();
    let config = BoxConfig::load(&config_path).map_err(staging_any("reading config"))?;
    if let Some(mut config) = config {
        config.relocate(
            (project.layout, &project.source_root),
            (target.layout, &target.source_root),
        );
        config
            .save(&config_path)
            .map_err(staging_any("writing config"))?;
    }
    let mut marker = Marker::read(&project.state_root)?;
    marker.source_root = target.source_root.clone();
    marker.write(&project.state_root)?;
    info!(
        name = %project.name,
        from = %project.source_root.display(),
        to = %target.source_root.display(),
        "convert:rebound source"
    );
    Ok(Conversion {
        project: target,
        outcome: Outcome::Converted,
    })
}

fn check_guard(guard: &LockGuard, project: &Project) -> Result<(), BoxError> {
    if guard.covers(&project.state_root) {
        Ok(())
    } else {
        Err(BoxError::LockMismatch {
            expected: project.state_root.clone(),
            held: guard.state_root().to_path_buf(),
        })
    }
}

fn default_name(
    project: &Project,
    layout: LayoutMode,
    workset: Option<&str>,
) -> Result<BoxName, BoxError> {
    match layout {
        LayoutMode::Workset => {
            let ws = workset
                .or(project.name.workset())
                .ok_or_else(|| BoxError::InvalidName {
                    name: project.name.to_string(),
                    reason: "moving into a workset needs a workset name".to_string(),
                })?;
            BoxName::member(ws, project.name.base())
        }
        LayoutMode::Centralized | LayoutMode::Decentralized => {
            BoxName::single(project.name.base())
        }
    }
}

fn unchanged(project: &Project) -> Conversion {
    info!(name = %project.name, layout = %project.layout, "convert:unchanged");
    Conversion {
        project: project.clone(),
        outcome: Outcome::Unchanged,
    }
}

fn collision(target: &Project) -> BoxError {
    BoxError::NameCollision {
        layout: target.layout,
        name: target.name.to_string(),
        path: target.state_root.clone(),
    }
}

fn collision_with(target: &Project, other: &Project) -> BoxError {
    BoxError::NameCollision {
        layout: target.layout,
        name: other.name.to_string(),
        path: other.state_root.clone(),
    }
}

fn bootstrap_home(home: &Path, name: &BoxName) -> std::io::Result<()> {
    fs::create_dir_all(home)?;
    fs::write(
        home.join(".bashrc"),
        format!(
            "# agentbox shell environment\n\
             [ -f /etc/bashrc ] && . /etc/bashrc\n\
             export PS1=\"(agentbox:{}) \\u@\\h:\\w\\$ \"\n",
            name
        ),
    )?;
    fs::write(
        home.join(".profile"),
        "# agentbox login shell\n[ -f ~/.bashrc ] && . ~/.bashrc\n",
    )
}

/// Vault shares live in the project tree; create them if missing.
fn ensure_vault_shares(vault_dir: &Path) {
    for share in [SHARE_RO, SHARE_RW] {
        if let Err(e) = fs::create_dir_all(vault_dir.join(share)) {
            warn!(path = %vault_dir.display(), error = %e, "convert:could not create vault share");
            return;
        }
    }
    let gitignore = vault_dir.join(".gitignore");
    if !gitignore.exists()
        && let Err(e) = fs::write(&gitignore, format!("{}/\n", SHARE_RW))
    {
        warn!(path = %gitignore.display(), error = %e, "convert:could not write vault .gitignore");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::ClaudeCredentials;
    use crate::layout::resolve::tests::Fixture;
    use crate::layout::{
        ARCHIVES_DIR, CONFIG_FILE, CONTAINER_FILE, LOCK_FILE, STAGING_PREFIX, VAULT_DIR,
    };
    use crate::vault::tests::record_snapshot;
    use std::collections::BTreeMap;

    struct Env {
        fx: Fixture,
        creds: ClaudeCredentials,
    }

    impl Env {
        fn new() -> Self {
            let fx = Fixture::new();
            let creds = ClaudeCredentials::new(&fx.tmp.path().join("host-home"));
            Self { fx, creds }
        }

        fn converter(&self) -> Converter<'_> {
            Converter::new(self.fx.store.clone(), &self.creds)
        }

        /// A populated box with config, credentials, home, snapshot, archive and an extra file.
        fn populated(&self, layout: LayoutMode, name: &str, src: &Path) -> Project {
            let project = Project::new(
                &self.fx.store,
                layout,
                name.parse().unwrap(),
                src.to_path_buf(),
            )
            .unwrap();
            let config: BoxConfig = serde_yaml::from_str(&format!(
                "image: custom:1\nenv:\n  A: one\nmounts:\n  - source: {}/data\n    target: /data\n  - source: /opt/shared\n    target: /shared\n    read_only: true\nfuture_key: kept\n",
                src.display()
            ))
            .unwrap();
            self.converter().create(&project, &config).unwrap();

            let root = &project.state_root;
            fs::write(root.join("credentials/.credentials.json"), "{\"token\":\"t\"}").unwrap();
            fs::write(root.join("home/notes.txt"), "remember").unwrap();
            record_snapshot(root, "snap-1", b"snapshot bytes");
            fs::write(root.join(ARCHIVES_DIR).join("a.tar"), b"archived").unwrap();
            let (sha256, size) = crate::vault::file_digest(&root.join(ARCHIVES_DIR).join("a.tar")).unwrap();
            crate::vault::ArchiveManifest {
                id: "a".to_string(),
                snapshot: "snap-1".to_string(),
                file: "a.tar".to_string(),
                sha256,
                size,
                created_at: 2,
                source_root: src.to_path_buf(),
            }
            .save(&root.join(ARCHIVES_DIR))
            .unwrap();
            ContainerMeta {
                last_container_id: Some("c0ffee".to_string()),
                image_ref: Some("custom:1".to_string()),
            }
            .save(&root.join(CONTAINER_FILE))
            .unwrap();
            fs::write(root.join("agent-notes.md"), "extra").unwrap();
            project
        }
    }

    /// Relative path -> contents for every file under `root`.
    fn tree_bytes(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
        fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Vec<u8>>) {
            for entry in fs::read_dir(dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    walk(root, &path, out);
                } else {
                    let rel = path.strip_prefix(root).unwrap().to_path_buf();
                    out.insert(rel, fs::read(&path).unwrap());
                }
            }
        }
        let mut out = BTreeMap::new();
        walk(root, root, &mut out);
        out
    }

    fn staging_dirs(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| {
                p.file_name()
                    .unwrap()
                    .to_string_lossy()
                    .starts_with(STAGING_PREFIX)
            })
            .collect()
    }

    fn resolved_config(project: &Project) -> BoxConfig {
        let mut config = BoxConfig::load(&project.state_root.join(CONFIG_FILE))
            .unwrap()
            .unwrap();
        config.mounts = config.resolved_mounts(&project.source_root);
        config
    }

    #[test]
    fn create_lays_out_state_directory() {
        let env = Env::new();
        let src = env.fx.source("work/demo");
        let project = Project::new(
            &env.fx.store,
            LayoutMode::Decentralized,
            "demo".parse().unwrap(),
            src.clone(),
        )
        .unwrap();
        env.converter()
            .create(&project, &BoxConfig::default())
            .unwrap();

        let root = &project.state_root;
        assert!(root.join("box.json").is_file());
        assert!(root.join("home/.bashrc").is_file());
        assert!(root.join("home/.profile").is_file());
        assert!(root.join("credentials").is_dir());
        assert!(root.join(VAULT_DIR).join("index.json").is_file());
        assert!(root.join(".gitignore").is_file());
        assert!(src.join("vault/share-rw").is_dir());
        assert!(staging_dirs(&src).is_empty());

        let resolved = env.fx.resolver().resolve(&src, None).unwrap();
        assert_eq!(resolved, project);

        assert!(matches!(
            env.converter().create(&project, &BoxConfig::default()),
            Err(BoxError::NameCollision { .. })
        ));
    }

    #[test]
    fn migrate_then_resolve_yields_new_layout_with_same_config() {
        let env = Env::new();
        let src = env.fx.source("work/demo");
        let project = env.populated(LayoutMode::Centralized, "demo", &src);
        let before = resolved_config(&project);

        let guard = LockGuard::acquire(&project.state_root).unwrap();
        let result = env
            .converter()
            .migrate(&guard, &project, LayoutMode::Decentralized, None)
            .unwrap();
        drop(guard);
        assert_eq!(result.outcome, Outcome::Converted);

        let resolved = env.fx.resolver().resolve(&src, None).unwrap();
        assert_eq!(resolved.layout, LayoutMode::Decentralized);
        assert_eq!(resolved_config(&resolved), before);
        assert!(!project.state_root.exists());

        // Paths inside the tree are stored relative in the in-tree layout
        let raw = fs::read_to_string(resolved.state_root.join(CONFIG_FILE)).unwrap();
        assert!(raw.contains("source: data"));

        let marker = Marker::read(&resolved.state_root).unwrap();
        assert!(marker.supersedes.is_none());
        assert!(resolved.state_root.join(".gitignore").is_file());
    }

    #[test]
    fn migrate_to_same_layout_is_unchanged() {
        let env = Env::new();
        let src = env.fx.source("work/demo");
        let project = env.populated(LayoutMode::Centralized, "demo", &src);
        let before = tree_bytes(&project.state_root);

        let guard = LockGuard::acquire(&project.state_root).unwrap();
        let result = env
            .converter()
            .migrate(&guard, &project, LayoutMode::Centralized, None)
            .unwrap();
        drop(guard);

        assert_eq!(result.outcome, Outcome::Unchanged);
        assert_eq!(tree_bytes(&project.state_root), before);
    }

    #[test]
    fn duplicate_then_remove_leaves_source_identical() {
        let env = Env::new();
        let src = env.fx.source("work/demo");
        let project = env.populated(LayoutMode::Centralized, "demo", &src);
        let before = tree_bytes(&project.state_root);

        let guard = LockGuard::acquire(&project.state_root).unwrap();
        let copy = env
            .converter()
            .duplicate(
                &guard,
                &project,
                DuplicateRequest {
                    name: "copy".parse().unwrap(),
                    layout: None,
                    source_root: None,
                    delete_source: false,
                    overwrite: None,
                },
            )
            .unwrap();
        drop(guard);

        let meta = ContainerMeta::load(&copy.project.state_root.join(CONTAINER_FILE)).unwrap();
        assert_eq!(meta.last_container_id, None);
        assert_eq!(meta.image_ref.as_deref(), Some("custom:1"));
        assert!(copy.project.state_root.join("agent-notes.md").is_file());

        let copy_guard = LockGuard::acquire(&copy.project.state_root).unwrap();
        env.converter().remove(&copy_guard, &copy.project).unwrap();
        drop(copy_guard);

        assert!(!copy.project.state_root.exists());
        assert_eq!(tree_bytes(&project.state_root), before);
    }

    #[test]
    fn crash_before_swap_leaves_source_resolvable() {
        let env = Env::new();
        let src = env.fx.source("work/demo");
        let project = env.populated(LayoutMode::Centralized, "demo", &src);

        let mut converter = env.converter();
        converter.crash_at = Some(CrashPoint::BeforeSwap);
        let guard = LockGuard::acquire(&project.state_root).unwrap();
        assert!(
            converter
                .migrate(&guard, &project, LayoutMode::Decentralized, None)
                .is_err()
        );
        drop(guard);

        // The orphaned staging directory is hidden from resolution
        assert_eq!(staging_dirs(&src).len(), 1);
        let resolved = env.fx.resolver().resolve(&src, None).unwrap();
        assert_eq!(resolved, project);
    }

    #[test]
    fn crash_after_swap_resolves_to_target() {
        let env = Env::new();
        let src = env.fx.source("work/demo");
        let project = env.populated(LayoutMode::Centralized, "demo", &src);

        let mut converter = env.converter();
        converter.crash_at = Some(CrashPoint::AfterSwap);
        let guard = LockGuard::acquire(&project.state_root).unwrap();
        assert!(
            converter
                .migrate(&guard, &project, LayoutMode::Decentralized, None)
                .is_err()
        );
        drop(guard);

        assert!(project.state_root.exists());
        let resolved = env.fx.resolver().resolve(&src, None).unwrap();
        assert_eq!(resolved.layout, LayoutMode::Decentralized);
    }

    #[test]
    fn concurrent_mutation_is_busy() {
        let env = Env::new();
        let src = env.fx.source("work/demo");
        let project = env.populated(LayoutMode::Centralized, "demo", &src);

        let _held = LockGuard::acquire(&project.state_root).unwrap();
        assert!(matches!(
            LockGuard::acquire(&project.state_root),
            Err(BoxError::Busy { .. })
        ));
    }

    #[test]
    fn guard_for_another_box_is_rejected() {
        let env = Env::new();
        let a = env.populated(LayoutMode::Centralized, "a", &env.fx.source("work/a"));
        let b = env.populated(LayoutMode::Centralized, "b", &env.fx.source("work/b"));

        let guard = LockGuard::acquire(&a.state_root).unwrap();
        assert!(matches!(
            env.converter()
                .migrate(&guard, &b, LayoutMode::Decentralized, None),
            Err(BoxError::LockMismatch { .. })
        ));
    }

    #[test]
    fn convert_collision_fails_without_writes() {
        let env = Env::new();
        let src = env.fx.source("work/demo");
        let project = env.populated(LayoutMode::Decentralized, "demo", &src);
        // A centralized box already claims this source under another name
        let other = env.fx.plant(LayoutMode::Centralized, "other", &src);

        let store_before = tree_bytes(env.fx.store.root());
        let project_before = tree_bytes(&project.state_root);

        let guard = LockGuard::acquire(&project.state_root).unwrap();
        let err = env
            .converter()
            .convert(&guard, &project, LayoutMode::Centralized, None)
            .unwrap_err();
        drop(guard);

        match err {
            BoxError::NameCollision { path, .. } => assert_eq!(path, other.state_root),
            other => panic!("expected NameCollision, got {:?}", other),
        }
        assert_eq!(tree_bytes(env.fx.store.root()), store_before);
        assert_eq!(tree_bytes(&project.state_root), project_before);
        assert!(!env.fx.store.boxes_dir().join("demo").exists());
    }

    #[test]
    fn convert_into_occupied_slot_collides() {
        let env = Env::new();
        let src = env.fx.source("work/demo");
        let elsewhere = env.fx.source("work/elsewhere");
        let project = env.populated(LayoutMode::Decentralized, "demo", &src);
        env.fx.plant(LayoutMode::Centralized, "demo", &elsewhere);

        let guard = LockGuard::acquire(&project.state_root).unwrap();
        assert!(matches!(
            env.converter()
                .convert(&guard, &project, LayoutMode::Centralized, None),
            Err(BoxError::NameCollision { .. })
        ));
    }

    #[test]
    fn migrate_into_occupied_slot_discards_staging() {
        let env = Env::new();
        let src = env.fx.source("work/demo");
        let elsewhere = env.fx.source("work/elsewhere");
        let project = env.populated(LayoutMode::Decentralized, "demo", &src);
        let occupant = env.fx.plant(LayoutMode::Centralized, "demo", &elsewhere);
        let occupant_before = tree_bytes(&occupant.state_root);

        let guard = LockGuard::acquire(&project.state_root).unwrap();
        let err = env
            .converter()
            .migrate(&guard, &project, LayoutMode::Centralized, None)
            .unwrap_err();
        drop(guard);

        assert!(matches!(err, BoxError::NameCollision { .. }));
        assert_eq!(tree_bytes(&occupant.state_root), occupant_before);
        assert!(staging_dirs(&env.fx.store.boxes_dir()).is_empty());
        assert!(project.state_root.join("box.json").is_file());
    }

    #[test]
    fn round_trip_reproduces_state_bytes() {
        let env = Env::new();
        let src = env.fx.source("work/demo");
        let project = env.populated(LayoutMode::Centralized, "demo", &src);
        let config = fs::read(project.state_root.join(CONFIG_FILE)).unwrap();
        let creds = fs::read(project.state_root.join("credentials/.credentials.json")).unwrap();
        let index = fs::read(project.state_root.join("vault/index.json")).unwrap();

        let guard = LockGuard::acquire(&project.state_root).unwrap();
        let there = env
            .converter()
            .migrate(&guard, &project, LayoutMode::Decentralized, None)
            .unwrap()
            .project;
        drop(guard);

        let guard = LockGuard::acquire(&there.state_root).unwrap();
        let back = env
            .converter()
            .migrate(&guard, &there, LayoutMode::Centralized, None)
            .unwrap()
            .project;
        drop(guard);

        assert_eq!(back.state_root, project.state_root);
        assert_eq!(fs::read(back.state_root.join(CONFIG_FILE)).unwrap(), config);
        assert_eq!(
            fs::read(back.state_root.join("credentials/.credentials.json")).unwrap(),
            creds
        );
        assert_eq!(fs::read(back.state_root.join("vault/index.json")).unwrap(), index);
        assert!(!back.state_root.join(".gitignore").exists());
        assert!(!back.state_root.join(LOCK_FILE).exists());
    }

    #[test]
    fn corrupt_snapshot_fails_staging_and_keeps_source() {
        let env = Env::new();
        let src = env.fx.source("work/demo");
        let project = env.populated(LayoutMode::Centralized, "demo", &src);
        fs::write(
            project.state_root.join("vault/snapshots/snap-1.tar"),
            b"tampered bytes",
        )
        .unwrap();
        let before = tree_bytes(&project.state_root);

        let guard = LockGuard::acquire(&project.state_root).unwrap();
        let err = env
            .converter()
            .migrate(&guard, &project, LayoutMode::Decentralized, None)
            .unwrap_err();
        drop(guard);

        assert!(matches!(err, BoxError::StagingFailure { .. }));
        assert!(staging_dirs(&src).is_empty());
        assert!(!src.join(".agentbox").exists());
        assert_eq!(tree_bytes(&project.state_root), before);
    }

    #[test]
    fn migrate_into_workset_requires_workset() {
        let env = Env::new();
        let src = env.fx.source("work/demo");
        let project = env.populated(LayoutMode::Centralized, "demo", &src);

        let guard = LockGuard::acquire(&project.state_root).unwrap();
        let missing = env.converter().migrate(
            &guard,
            &project,
            LayoutMode::Workset,
            Some("team/demo".parse().unwrap()),
        );
        assert!(matches!(missing, Err(BoxError::NotFound { .. })));

        Workset::create(&env.fx.store, "team", None).unwrap();
        let moved = env
            .converter()
            .convert(&guard, &project, LayoutMode::Workset, Some("team"))
            .unwrap();
        drop(guard);

        assert_eq!(moved.project.name.to_string(), "team/demo");
        let resolved = env.fx.resolver().resolve(&src, None).unwrap();
        assert_eq!(resolved.layout, LayoutMode::Workset);
    }

    #[test]
    fn duplicate_with_delete_source_moves_identity() {
        let env = Env::new();
        let src = env.fx.source("work/demo");
        let dest = env.fx.source("work/fork");
        let project = env.populated(LayoutMode::Centralized, "demo", &src);

        let guard = LockGuard::acquire(&project.state_root).unwrap();
        let copy = env
            .converter()
            .duplicate(
                &guard,
                &project,
                DuplicateRequest {
                    name: "fork".parse().unwrap(),
                    layout: Some(LayoutMode::Decentralized),
                    source_root: Some(dest.clone()),
                    delete_source: true,
                    overwrite: None,
                },
            )
            .unwrap();
        drop(guard);

        assert_eq!(copy.outcome, Outcome::Converted);
        assert!(!project.state_root.exists());
        assert_eq!(copy.project.state_root, dest.join(".agentbox"));

        // Mounts inside the old tree now point into the new one
        let config = resolved_config(&copy.project);
        assert_eq!(config.mounts[0].source, dest.join("data"));
        assert_eq!(config.mounts[1].source, PathBuf::from("/opt/shared"));
    }

    #[test]
    fn duplicate_onto_existing_target_needs_its_lock() {
        let env = Env::new();
        let src = env.fx.source("work/demo");
        let project = env.populated(LayoutMode::Centralized, "demo", &src);
        let existing = env.populated(LayoutMode::Centralized, "copy", &env.fx.source("work/copy"));

        let guard = LockGuard::acquire(&project.state_root).unwrap();
        fn request(overwrite: Option<&LockGuard>) -> DuplicateRequest<'_> {
            DuplicateRequest {
                name: "copy".parse().unwrap(),
                layout: None,
                source_root: None,
                delete_source: false,
                overwrite,
            }
        }
        assert!(matches!(
            env.converter().duplicate(&guard, &project, request(None)),
            Err(BoxError::NameCollision { .. })
        ));

        let target_guard = LockGuard::acquire(&existing.state_root).unwrap();
        let replaced = env
            .converter()
            .duplicate(&guard, &project, request(Some(&target_guard)))
            .unwrap();
        drop(target_guard);
        drop(guard);

        let marker = Marker::read(&replaced.project.state_root).unwrap();
        assert_eq!(marker.source_root, src);
        assert!(staging_dirs(&env.fx.store.boxes_dir()).is_empty());
    }

    #[test]
    fn decentralized_rename_rewrites_marker() {
        let env = Env::new();
        let src = env.fx.source("work/demo");
        let project = env.populated(LayoutMode::Decentralized, "demo", &src);

        let guard = LockGuard::acquire(&project.state_root).unwrap();
        let renamed = env
            .converter()
            .migrate(
                &guard,
                &project,
                LayoutMode::Decentralized,
                Some("renamed".parse().unwrap()),
            )
            .unwrap();
        drop(guard);

        assert_eq!(renamed.project.state_root, project.state_root);
        let resolved = env.fx.resolver().resolve(&src, None).unwrap();
        assert_eq!(resolved.name.base(), "renamed");
    }

    #[test]
    fn create_refuses_source_claimed_by_another_layout() {
        let env = Env::new();
        let src = env.fx.source("work/demo");
        let existing = env.populated(LayoutMode::Centralized, "demo", &src);

        let in_tree = Project::new(
            &env.fx.store,
            LayoutMode::Decentralized,
            "demo".parse().unwrap(),
            src.clone(),
        )
        .unwrap();
        match env.converter().create(&in_tree, &BoxConfig::default()) {
            Err(BoxError::NameCollision { path, .. }) => assert_eq!(path, existing.state_root),
            other => panic!("expected NameCollision, got {:?}", other),
        }
        assert!(!in_tree.state_root.exists());
        assert_eq!(env.fx.resolver().resolve(&src, None).unwrap(), existing);
    }

    #[test]
    fn in_tree_box_may_join_workset_member() {
        let env = Env::new();
        let src = env.fx.source("work/api");
        Workset::create(&env.fx.store, "team", None).unwrap();
        env.populated(LayoutMode::Workset, "team/api", &src);

        let in_tree = Project::new(
            &env.fx.store,
            LayoutMode::Decentralized,
            "api".parse().unwrap(),
            src.clone(),
        )
        .unwrap();
        env.converter()
            .create(&in_tree, &BoxConfig::default())
            .unwrap();

        let resolved = env.fx.resolver().resolve(&src, None).unwrap();
        assert_eq!(resolved.layout, LayoutMode::Decentralized);
    }

    #[test]
    fn failed_source_removal_is_a_warning() {
        let env = Env::new();
        let src = env.fx.source("work/demo");
        let project = env.populated(LayoutMode::Centralized, "demo", &src);

        let mut converter = env.converter();
        converter.crash_at = Some(CrashPoint::Retire);
        let guard = LockGuard::acquire(&project.state_root).unwrap();
        let result = converter
            .migrate(&guard, &project, LayoutMode::Decentralized, None)
            .unwrap();
        drop(guard);

        assert!(matches!(result.outcome, Outcome::CleanupWarning(_)));
        assert!(project.state_root.join("box.json").is_file());

        let resolved = env.fx.resolver().resolve(&src, None).unwrap();
        assert_eq!(resolved, result.project);
        assert_eq!(resolved.layout, LayoutMode::Decentralized);

        let marker = Marker::read(&resolved.state_root).unwrap();
        assert_eq!(
            marker.supersedes,
            Some(BoxRef {
                layout: LayoutMode::Centralized,
                name: "demo".parse().unwrap(),
            })
        );
    }

    #[test]
    fn replaced_target_lock_does_not_outlive_the_swap() {
        let env = Env::new();
        let src = env.fx.source("work/demo");
        let project = env.populated(LayoutMode::Centralized, "demo", &src);
        let existing = env.populated(LayoutMode::Centralized, "copy", &env.fx.source("work/copy"));

        let guard = LockGuard::acquire(&project.state_root).unwrap();
        let old_target = LockGuard::acquire(&existing.state_root).unwrap();
        let replaced = env
            .converter()
            .duplicate(
                &guard,
                &project,
                DuplicateRequest {
                    name: "copy".parse().unwrap(),
                    layout: None,
                    source_root: None,
                    delete_source: false,
                    overwrite: Some(&old_target),
                },
            )
            .unwrap();
        drop(guard);
        assert!(!replaced.project.state_root.join(LOCK_FILE).exists());

        // A newer holder keeps its lock when the guard on the replaced tree goes away
        let holder = LockGuard::acquire(&replaced.project.state_root).unwrap();
        drop(old_target);
        assert!(replaced.project.state_root.join(LOCK_FILE).exists());
        assert!(matches!(
            LockGuard::acquire(&replaced.project.state_root),
            Err(BoxError::Busy { .. })
        ));
        drop(holder);
    }

    #[test]
    fn remap_follows_moved_project() {
        let env = Env::new();
        let src = env.fx.source("work/demo");
        let project = env.populated(LayoutMode::Centralized, "demo", &src);
        let created = Marker::read(&project.state_root).unwrap().created_at;

        fs::rename(&src, env.fx.tmp.path().join("work/renamed")).unwrap();
        let moved = env.fx.source("work/renamed");
        assert!(matches!(
            env.fx.resolver().resolve(&moved, None),
            Err(BoxError::NotFound { .. })
        ));

        let found = env.fx.resolver().recorded_at(&src).unwrap();
        assert_eq!(found, project);
        let guard = LockGuard::acquire(&found.state_root).unwrap();
        let result = env.converter().remap(&guard, &found, &moved).unwrap();
        drop(guard);

        assert_eq!(result.outcome, Outcome::Converted);
        assert_eq!(result.project.state_root, project.state_root);
        let resolved = env.fx.resolver().resolve(&moved, None).unwrap();
        assert_eq!(resolved, result.project);
        assert_eq!(resolved_config(&resolved).mounts[0].source, moved.join("data"));

        let marker = Marker::read(&resolved.state_root).unwrap();
        assert_eq!(marker.source_root, moved);
        assert_eq!(marker.created_at, created);
    }

    #[test]
    fn remap_onto_claimed_directory_collides() {
        let env = Env::new();
        let src = env.fx.source("work/demo");
        let dest = env.fx.source("work/other");
        let project = env.populated(LayoutMode::Centralized, "demo", &src);
        env.fx.plant(LayoutMode::Centralized, "other", &dest);

        let guard = LockGuard::acquire(&project.state_root).unwrap();
        assert!(matches!(
            env.converter().remap(&guard, &project, &dest),
            Err(BoxError::NameCollision { .. })
        ));
        assert_eq!(Marker::read(&project.state_root).unwrap().source_root, src);
    }

    #[test]
    fn same_name_duplicate_with_delete_source_rebinds() {
        let env = Env::new();
        let src = env.fx.source("work/demo");
        let dest = env.fx.source("work/renamed");
        let project = env.populated(LayoutMode::Centralized, "demo", &src);

        let guard = LockGuard::acquire(&project.state_root).unwrap();
        fn request(dest: &Path, delete_source: bool) -> DuplicateRequest<'static> {
            DuplicateRequest {
                name: "demo".parse().unwrap(),
                layout: None,
                source_root: Some(dest.to_path_buf()),
                delete_source,
                overwrite: None,
            }
        }
        assert!(matches!(
            env.converter()
                .duplicate(&guard, &project, request(&dest, false)),
            Err(BoxError::NameCollision { .. })
        ));
        let moved = env
            .converter()
            .duplicate(&guard, &project, request(&dest, true))
            .unwrap();
        drop(guard);

        assert_eq!(moved.project.state_root, project.state_root);
        assert_eq!(env.fx.resolver().resolve(&dest, None).unwrap(), moved.project);
    }

    #[test]
    fn remap_of_in_tree_box_moves_its_state() {
        let env = Env::new();
        let src = env.fx.source("work/demo");
        let dest = env.fx.source("work/fresh");
        let project = env.populated(LayoutMode::Decentralized, "demo", &src);

        let guard = LockGuard::acquire(&project.state_root).unwrap();
        let result = env.converter().remap(&guard, &project, &dest).unwrap();
        drop(guard);

        assert_eq!(result.project.state_root, dest.join(".agentbox"));
        assert!(!project.state_root.exists());
        let marker = Marker::read(&result.project.state_root).unwrap();
        assert!(marker.supersedes.is_none());
        assert_eq!(marker.source_root, dest);
    }

    #[test]
    fn box_with_vanished_source_can_be_removed() {
        let env = Env::new();
        let src = env.fx.source("work/demo");
        let project = env.populated(LayoutMode::Centralized, "demo", &src);
        fs::remove_dir_all(&src).unwrap();

        let found = env.fx.resolver().find(&"demo".parse().unwrap()).unwrap();
        let guard = LockGuard::acquire(&found.state_root).unwrap();
        env.converter().remove(&guard, &found).unwrap();
        drop(guard);
        assert!(!project.state_root.exists());
    }
}
