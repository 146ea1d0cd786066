//! `agentbox box ...`: create, inspect, move and run boxes.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Subcommand};
use console::style;
use tabled::{
    Table, Tabled,
    settings::{Padding, Style, object::Columns},
};
use tracing::{info, warn};

use super::{
    Env, Status, confirm, print_status, qualify_name, report_conversion, source_dir,
    sync_settings,
};
use crate::config::BoxConfig;
use crate::credentials::CredentialsManager;
use crate::layout::resolve::{EntryHealth, StoreEntry};
use crate::layout::{
    BoxError, BoxName, DuplicateRequest, LayoutMode, LockGuard, Marker, Outcome, Project,
};
use crate::sandbox::{
    AGENT_HOME, CliRuntime, ContainerMeta, ContainerRuntime, Mount, RunSpec, WORKSPACE_DIR,
    container_name,
};
use crate::vault::{SHARE_RO, SHARE_RW, SnapshotIndex};
use crate::workset::Workset;

#[derive(Debug, Args)]
pub struct BoxArgs {
    #[command(subcommand)]
    pub command: BoxCommand,
}

#[derive(Debug, Args)]
pub struct Target {
    /// Directory inside the project (defaults to the current directory)
    pub path: Option<PathBuf>,

    /// Look the box up by name instead of by directory
    #[arg(long)]
    pub name: Option<BoxName>,
}

impl Target {
    fn resolve(&self, env: &Env) -> Result<Project> {
        env.resolve(self.path.as_deref(), self.name.as_ref())
    }
}

#[derive(Debug, Subcommand)]
pub enum BoxCommand {
    /// Create a box for a project directory
    Init {
        /// Project directory (defaults to the current directory)
        path: Option<PathBuf>,

        /// Where to keep the box state (defaults to the configured layout)
        #[arg(long, value_enum)]
        layout: Option<LayoutMode>,

        /// Box name (defaults to the directory name)
        #[arg(long)]
        name: Option<BoxName>,

        /// Workset to join; implies --layout workset
        #[arg(long)]
        workset: Option<String>,
    },

    /// Show the box that owns a directory
    Info(Target),

    /// List boxes kept in the store
    #[command(visible_alias = "ls")]
    List,

    /// Move a box to another layout, optionally renaming it
    Migrate {
        /// Directory inside the project
        path: Option<PathBuf>,

        /// Target layout
        #[arg(long, value_enum)]
        to: LayoutMode,

        /// New name for the box
        #[arg(long)]
        name: Option<BoxName>,

        /// Workset to move into
        #[arg(long)]
        workset: Option<String>,
    },

    /// Move a box to another layout, refusing if the target already has one
    Convert {
        /// Directory inside the project
        path: Option<PathBuf>,

        /// Target layout
        #[arg(long, value_enum)]
        to: LayoutMode,

        /// Workset to move into
        #[arg(long)]
        workset: Option<String>,
    },

    /// Copy a box under a new name
    Duplicate {
        /// Directory inside the project
        path: Option<PathBuf>,

        /// Name of the copy
        #[arg(long = "as", value_name = "NAME")]
        name: BoxName,

        /// Layout of the copy (defaults to the original's)
        #[arg(long, value_enum)]
        to: Option<LayoutMode>,

        /// Project directory the copy belongs to
        #[arg(long = "source", value_name = "DIR")]
        source_root: Option<PathBuf>,

        /// Remove the original once the copy is in place
        #[arg(long)]
        delete_source: bool,

        /// Replace an existing box with the same name
        #[arg(short, long)]
        force: bool,
    },

    /// Point a box at the directory its project moved to
    Remap {
        /// Where the project lives now (defaults to the current directory)
        new_path: Option<PathBuf>,

        /// Where the project used to live
        #[arg(long = "from", value_name = "DIR", required_unless_present = "name")]
        old_path: Option<PathBuf>,

        /// Look the box up by name instead
        #[arg(long, conflicts_with = "old_path")]
        name: Option<BoxName>,
    },

    /// Delete a box and all of its state
    #[command(visible_alias = "rm")]
    Remove {
        #[command(flatten)]
        target: Target,

        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },

    /// Start the box's container
    Start(Target),

    /// Stop the box's container
    Stop(Target),

    /// Pull newer agent credentials from the host into the box
    RefreshCredentials(Target),
}

pub fn run(args: BoxArgs) -> Result<()> {
    let env = Env::load()?;
    match args.command {
        BoxCommand::Init {
            path,
            layout,
            name,
            workset,
        } => run_init(&env, path.as_deref(), layout, name, workset.as_deref()),
        BoxCommand::Info(target) => run_info(&env, &target),
        BoxCommand::List => run_list(&env),
        BoxCommand::Migrate {
            path,
            to,
            name,
            workset,
        } => run_migrate(&env, path.as_deref(), to, name, workset.as_deref()),
        BoxCommand::Convert { path, to, workset } => {
            run_convert(&env, path.as_deref(), to, workset.as_deref())
        }
        BoxCommand::Duplicate {
            path,
            name,
            to,
            source_root,
            delete_source,
            force,
        } => run_duplicate(
            &env,
            path.as_deref(),
            name,
            to,
            source_root,
            delete_source,
            force,
        ),
        BoxCommand::Remap {
            new_path,
            old_path,
            name,
        } => run_remap(&env, new_path.as_deref(), old_path.as_deref(), name.as_ref()),
        BoxCommand::Remove { target, force } => run_remove(&env, &target, force),
        BoxCommand::Start(target) => run_start(&env, &target),
        BoxCommand::Stop(target) => run_stop(&env, &target),
        BoxCommand::RefreshCredentials(target) => run_refresh(&env, &target),
    }
}

fn run_init(
    env: &Env,
    path: Option<&Path>,
    layout: Option<LayoutMode>,
    name: Option<BoxName>,
    workset: Option<&str>,
) -> Result<()> {
    let source_root = source_dir(path)?;
    let layout = match (layout, workset) {
        (Some(layout), _) => layout,
        (None, Some(_)) => LayoutMode::Workset,
        (None, None) => env.config.default_layout(),
    };
    check_workset_flag(layout, workset)?;
    let name = init_name(layout, name, workset, &source_root)?;
    let project = Project::new(&env.store, layout, name, source_root)?;

    let project = env
        .converter()
        .create(&project, &BoxConfig::default())
        .with_context(|| format!("Failed to create box {}", project))?;

    // A box without credentials still works; the agent asks to log in
    let guard = LockGuard::acquire(&project.state_root)?;
    if let Err(e) = env.credentials.refresh(&project.state_root) {
        warn!(error = %e, "box:could not copy host credentials");
    }
    drop(guard);

    print_status(Status::Ok, &project);
    println!(
        "{} Created {} for {}",
        style("✓").green(),
        style(&project).bold(),
        project.source_root.display()
    );
    println!("  state: {}", style(project.state_root.display()).dim());
    Ok(())
}

fn init_name(
    layout: LayoutMode,
    name: Option<BoxName>,
    workset: Option<&str>,
    source_root: &Path,
) -> Result<BoxName, BoxError> {
    let name = name.unwrap_or_else(|| BoxName::from_dir(source_root));
    if layout != LayoutMode::Workset || name.workset().is_some() {
        return Ok(name);
    }
    match workset {
        Some(ws) => BoxName::member(ws, name.base()),
        None => Err(BoxError::InvalidName {
            name: name.to_string(),
            reason: "a workset box needs --workset or a workset/member name".to_string(),
        }),
    }
}

fn run_info(env: &Env, target: &Target) -> Result<()> {
    let project = target.resolve(env)?;
    let state = project.state();
    let marker = Marker::read(&project.state_root)?;
    let config = BoxConfig::load(&state.config())?.unwrap_or_default();
    let snapshots = SnapshotIndex::load(&state.vault())?.snapshots.len();
    let container = ContainerMeta::load(&state.container())?;

    print_status(Status::Ok, &project);
    let label = |s: &str| style(format!("{:<10}", s)).bold();
    println!("{} {}", label("name"), project.name);
    println!("{} {}", label("layout"), project.layout);
    println!("{} {}", label("source"), project.source_root.display());
    println!("{} {}", label("state"), project.state_root.display());
    println!("{} {}", label("created"), marker.created_at);
    println!(
        "{} {}",
        label("image"),
        config
            .image
            .as_deref()
            .unwrap_or(env.config.container.resolved_image())
    );
    println!("{} {}", label("snapshots"), snapshots);
    println!(
        "{} {}",
        label("container"),
        container.last_container_id.as_deref().unwrap_or("-")
    );
    Ok(())
}

#[derive(Tabled)]
struct BoxRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "LAYOUT")]
    layout: String,
    #[tabled(rename = "SOURCE")]
    source: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "STATUS")]
    status: String,
}

impl From<StoreEntry> for BoxRow {
    fn from(entry: StoreEntry) -> Self {
        let status = match &entry.health {
            EntryHealth::Ok => "ok".to_string(),
            EntryHealth::MissingSource => "source missing".to_string(),
            EntryHealth::Corrupt(reason) => format!("corrupt: {}", reason),
        };
        Self {
            name: entry.name,
            layout: entry.layout.to_string(),
            source: entry
                .source_root
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".to_string()),
            state: entry.state_root.display().to_string(),
            status,
        }
    }
}

fn run_list(env: &Env) -> Result<()> {
    let resolver = env.resolver();
    let mut entries = resolver.list_centralized()?;
    for workset in Workset::list(&env.store)? {
        entries.extend(resolver.list_workset(workset.name())?);
    }

    if entries.is_empty() {
        println!("No boxes in {}", env.store.root().display());
        return Ok(());
    }

    let rows: Vec<BoxRow> = entries.into_iter().map(BoxRow::from).collect();
    let mut table = Table::new(rows);
    table
        .with(Style::blank())
        .modify(Columns::new(0..5), Padding::new(0, 1, 0, 0));
    println!("{table}");
    Ok(())
}

fn run_migrate(
    env: &Env,
    path: Option<&Path>,
    to: LayoutMode,
    name: Option<BoxName>,
    workset: Option<&str>,
) -> Result<()> {
    check_workset_flag(to, workset)?;
    let project = env.resolve(path, None)?;
    let name = match (name, workset) {
        (None, Some(_)) if to == LayoutMode::Workset => Some(BoxName::single(project.name.base())?),
        (name, _) => name,
    };
    let name = qualify_name(to, name, workset)?;

    let guard = LockGuard::acquire(&project.state_root)?;
    let conversion = env.converter().migrate(&guard, &project, to, name)?;
    drop(guard);

    report_conversion("Migrated", &project, &conversion);
    Ok(())
}

fn run_convert(
    env: &Env,
    path: Option<&Path>,
    to: LayoutMode,
    workset: Option<&str>,
) -> Result<()> {
    check_workset_flag(to, workset)?;
    let project = env.resolve(path, None)?;
    let guard = LockGuard::acquire(&project.state_root)?;
    let conversion = env.converter().convert(&guard, &project, to, workset)?;
    drop(guard);

    report_conversion("Converted", &project, &conversion);
    Ok(())
}

fn run_duplicate(
    env: &Env,
    path: Option<&Path>,
    name: BoxName,
    to: Option<LayoutMode>,
    source_root: Option<PathBuf>,
    delete_source: bool,
    force: bool,
) -> Result<()> {
    let project = env.resolve(path, None)?;
    let layout = to.unwrap_or(project.layout);
    let source_root = match source_root {
        Some(dir) => source_dir(Some(&dir))?,
        None => project.source_root.clone(),
    };

    let guard = LockGuard::acquire(&project.state_root)?;
    let existing = env.resolver().locate(layout, &name, &source_root)?;
    let overwrite = if force && existing.is_dir() && existing != project.state_root {
        info!(target = %existing.display(), "box:replacing existing box");
        Some(LockGuard::acquire(&existing)?)
    } else {
        None
    };

    let request = DuplicateRequest {
        name,
        layout: Some(layout),
        source_root: Some(source_root),
        delete_source,
        overwrite: overwrite.as_ref(),
    };
    let conversion = env.converter().duplicate(&guard, &project, request)?;
    drop(overwrite);
    drop(guard);

    report_conversion("Duplicated", &project, &conversion);
    Ok(())
}

fn run_remap(
    env: &Env,
    new_path: Option<&Path>,
    old_path: Option<&Path>,
    name: Option<&BoxName>,
) -> Result<()> {
    let new_source = source_dir(new_path)?;
    let resolver = env.resolver();
    let project = match (name, old_path) {
        (Some(name), _) => resolver.find(name)?,
        (None, Some(old)) => {
            // The old directory is usually gone, so it cannot be canonicalized
            let old = std::path::absolute(old)
                .with_context(|| format!("Failed to resolve {}", old.display()))?;
            resolver.recorded_at(&old)?
        }
        (None, None) => {
            bail!("Give the old project directory with --from, or the box with --name")
        }
    };

    let guard = LockGuard::acquire(&project.state_root)?;
    let conversion = env.converter().remap(&guard, &project, &new_source)?;
    drop(guard);

    if conversion.outcome == Outcome::Unchanged {
        print_status(Status::Unchanged, &project);
        println!(
            "{} already belongs to {}",
            style(&project).bold(),
            project.source_root.display()
        );
        return Ok(());
    }
    report_conversion("Remapped", &project, &conversion);
    Ok(())
}

fn run_remove(env: &Env, target: &Target, force: bool) -> Result<()> {
    // By name, a box whose project directory is gone can still be removed
    let project = match &target.name {
        Some(name) => env.resolver().find(name)?,
        None => target.resolve(env)?,
    };
    if !force
        && !confirm(&format!(
            "Remove {} and everything in {}?",
            project,
            project.state_root.display()
        ))?
    {
        println!("Aborted.");
        return Ok(());
    }

    let guard = LockGuard::acquire(&project.state_root)?;
    let meta = ContainerMeta::load(&project.state().container())?;
    if let Some(id) = &meta.last_container_id {
        match CliRuntime::new(env.config.container.runtime()) {
            Ok(runtime) => {
                if let Err(e) = runtime.stop(id) {
                    warn!(id, error = %e, "box:could not stop container before removal");
                }
            }
            Err(e) => warn!(error = %e, "box:no container runtime to stop container"),
        }
    }
    env.converter().remove(&guard, &project)?;
    drop(guard);

    print_status(Status::Ok, &project);
    println!("{} Removed {}", style("✓").green(), style(&project).bold());
    Ok(())
}

fn run_start(env: &Env, target: &Target) -> Result<()> {
    let project = target.resolve(env)?;
    let guard = LockGuard::acquire(&project.state_root)?;
    let state = project.state();
    let config = BoxConfig::load(&state.config())?.unwrap_or_default();
    let mut meta = ContainerMeta::load(&state.container())?;
    let runtime = CliRuntime::new(env.config.container.runtime())?;

    if let Some(id) = &meta.last_container_id
        && runtime.list()?.iter().any(|running| id.starts_with(running.as_str()))
    {
        print_status(Status::Unchanged, &project);
        println!("{} is already running ({})", style(&project).bold(), id);
        return Ok(());
    }

    let image = config
        .image
        .clone()
        .unwrap_or_else(|| env.config.container.resolved_image().to_string());
    if !runtime.image_exists(&image)? {
        runtime.pull(&image)?;
    }

    if let Err(e) = env.credentials.refresh(&project.state_root) {
        warn!(error = %e, "box:could not refresh credentials");
    }
    sync_settings(&env.credentials, &project.state_root)?;

    if let Some(old) = meta.last_container_id.take() {
        runtime.stop(&old)?;
    }
    let spec = run_spec(&project, &config, image.clone(), env.credentials.cache_dir());
    let id = runtime.run(&spec)?;
    meta.last_container_id = Some(id.clone());
    meta.image_ref = Some(image);
    meta.save(&state.container())?;
    drop(guard);

    print_status(Status::Ok, &project);
    println!(
        "{} Started {} in container {}",
        style("✓").green(),
        style(&project).bold(),
        style(&id).dim()
    );
    Ok(())
}

/// Container settings for a box: the project at `/workspace`, the box home,
/// its credentials and vault shares, plus any configured mounts.
fn run_spec(project: &Project, config: &BoxConfig, image: String, credentials: &Path) -> RunSpec {
    let state = project.state();
    let mut mounts = vec![
        Mount {
            source: project.source_root.clone(),
            target: WORKSPACE_DIR.to_string(),
            read_only: false,
        },
        Mount {
            source: state.home(),
            target: AGENT_HOME.to_string(),
            read_only: false,
        },
        Mount {
            source: project.state_root.join(credentials),
            target: format!("{}/.claude", AGENT_HOME),
            read_only: false,
        },
    ];

    let vault = config.resolved_vault_dir(&project.source_root);
    for (share, read_only) in [(SHARE_RO, true), (SHARE_RW, false)] {
        let dir = vault.join(share);
        if dir.is_dir() {
            mounts.push(Mount {
                source: dir,
                target: format!("{}/{}", AGENT_HOME, share),
                read_only,
            });
        }
    }

    mounts.extend(
        config
            .resolved_mounts(&project.source_root)
            .into_iter()
            .map(|m| Mount {
                source: m.source,
                target: m.target,
                read_only: m.read_only,
            }),
    );

    let mut env: Vec<(String, String)> = vec![
        ("HOME".to_string(), AGENT_HOME.to_string()),
        ("AGENTBOX_NAME".to_string(), project.name.to_string()),
        ("AGENTBOX_LAYOUT".to_string(), project.layout.to_string()),
    ];
    env.extend(config.env.iter().map(|(k, v)| (k.clone(), v.clone())));

    RunSpec {
        name: container_name(&project.name),
        image,
        mounts,
        env,
        workdir: WORKSPACE_DIR.to_string(),
    }
}

fn run_stop(env: &Env, target: &Target) -> Result<()> {
    let project = target.resolve(env)?;
    let guard = LockGuard::acquire(&project.state_root)?;
    let state = project.state();
    let mut meta = ContainerMeta::load(&state.container())?;

    let Some(id) = meta.last_container_id.take() else {
        print_status(Status::Unchanged, &project);
        println!("{} is not running", style(&project).bold());
        return Ok(());
    };

    let runtime = CliRuntime::new(env.config.container.runtime())?;
    let was_running = runtime.stop(&id)?;
    meta.save(&state.container())?;
    sync_settings(&env.credentials, &project.state_root)?;
    drop(guard);

    if was_running {
        print_status(Status::Ok, &project);
        println!("{} Stopped {}", style("✓").green(), style(&project).bold());
    } else {
        print_status(Status::Unchanged, &project);
        println!("{} was already stopped", style(&project).bold());
    }
    Ok(())
}

fn run_refresh(env: &Env, target: &Target) -> Result<()> {
    let project = target.resolve(env)?;
    let guard = LockGuard::acquire(&project.state_root)?;
    let changed = env.credentials.refresh(&project.state_root)?;
    sync_settings(&env.credentials, &project.state_root)?;
    drop(guard);

    if changed {
        print_status(Status::Ok, &project);
        println!(
            "{} Refreshed credentials for {}",
            style("✓").green(),
            style(&project).bold()
        );
    } else {
        print_status(Status::Unchanged, &project);
        println!("Credentials for {} are up to date", style(&project).bold());
    }
    Ok(())
}

/// Rejects `--workset` on layouts that have no use for it.
fn check_workset_flag(layout: LayoutMode, workset: Option<&str>) -> Result<()> {
    if workset.is_some() && layout != LayoutMode::Workset {
        bail!("--workset only applies to the workset layout, not {}", layout);
    }
    Ok(())
}
