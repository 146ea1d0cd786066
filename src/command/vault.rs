//! `agentbox vault ...`: snapshots of a box's read-write share.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use console::style;
use tabled::{
    Table, Tabled,
    settings::{Padding, Style, object::Columns},
};

use super::{Env, Status, print_status};
use crate::config::BoxConfig;
use crate::layout::{BoxName, LockGuard, Project};
use crate::vault::{self, ArchiveManifest, SHARE_RW, SnapshotIndex, TarVault, VaultStore};

#[derive(Debug, Args)]
pub struct VaultArgs {
    #[command(subcommand)]
    pub command: VaultCommand,

    /// Directory inside the project (defaults to the current directory)
    #[arg(long, global = true)]
    pub path: Option<PathBuf>,

    /// Look the box up by name instead of by directory
    #[arg(long, global = true)]
    pub name: Option<BoxName>,
}

#[derive(Debug, Subcommand)]
pub enum VaultCommand {
    /// Snapshot the box's read-write share
    Snapshot,

    /// List snapshots and archives
    #[command(visible_alias = "ls")]
    List {
        /// Check every snapshot and archive against its checksum
        #[arg(long)]
        verify: bool,
    },

    /// Keep a copy of a snapshot under archives/
    Archive {
        /// Snapshot id
        id: String,
    },

    /// Unpack a snapshot back into the read-write share
    Restore {
        /// Snapshot id
        id: String,
    },
}

pub fn run(args: VaultArgs) -> Result<()> {
    let env = Env::load()?;
    let project = env.resolve(args.path.as_deref(), args.name.as_ref())?;
    let store = TarVault;
    match args.command {
        VaultCommand::Snapshot => run_snapshot(&store, &project),
        VaultCommand::List { verify } => run_list(&project, verify),
        VaultCommand::Archive { id } => run_archive(&store, &project, &id),
        VaultCommand::Restore { id } => run_restore(&store, &project, &id),
    }
}

/// The read-write share of `project`'s vault.
fn share_rw(project: &Project) -> Result<PathBuf> {
    let config = BoxConfig::load(&project.state().config())?.unwrap_or_default();
    Ok(config.resolved_vault_dir(&project.source_root).join(SHARE_RW))
}

fn run_snapshot(store: &dyn VaultStore, project: &Project) -> Result<()> {
    let share = share_rw(project)?;
    let _guard = LockGuard::acquire(&project.state_root)?;
    let id = store
        .create(&project.state_root, &share)
        .with_context(|| format!("Failed to snapshot {}", share.display()))?;

    print_status(Status::Ok, project);
    println!("{} Snapshot {}", style("✓").green(), style(&id).bold());
    Ok(())
}

#[derive(Tabled)]
struct SnapshotRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "KIND")]
    kind: &'static str,
    #[tabled(rename = "SIZE")]
    size: u64,
    #[tabled(rename = "CREATED")]
    created_at: u64,
}

fn run_list(project: &Project, verify: bool) -> Result<()> {
    let state = project.state();
    if verify {
        vault::verify_state(&project.state_root)?;
    }
    let index = SnapshotIndex::load(&state.vault())?;
    let archives = ArchiveManifest::load_all(&state.archives())?;

    print_status(Status::Ok, project);
    if index.snapshots.is_empty() && archives.is_empty() {
        println!("No snapshots for {}", style(project).bold());
        return Ok(());
    }

    let rows = index
        .snapshots
        .into_iter()
        .map(|s| SnapshotRow {
            id: s.id,
            kind: "snapshot",
            size: s.size,
            created_at: s.created_at,
        })
        .chain(archives.into_iter().map(|a| SnapshotRow {
            id: a.id,
            kind: "archive",
            size: a.size,
            created_at: a.created_at,
        }));
    let mut table = Table::new(rows);
    table
        .with(Style::blank())
        .modify(Columns::new(0..4), Padding::new(0, 1, 0, 0));
    println!("{table}");
    if verify {
        println!("{} all checksums match", style("✓").green());
    }
    Ok(())
}

fn run_archive(store: &dyn VaultStore, project: &Project, id: &str) -> Result<()> {
    let _guard = LockGuard::acquire(&project.state_root)?;
    let manifest = store.archive(&project.state_root, id)?;

    print_status(Status::Ok, project);
    println!(
        "{} Archived {} as {}",
        style("✓").green(),
        id,
        style(&manifest.id).bold()
    );
    Ok(())
}

fn run_restore(store: &dyn VaultStore, project: &Project, id: &str) -> Result<()> {
    let share = share_rw(project)?;
    let _guard = LockGuard::acquire(&project.state_root)?;
    store.restore(&project.state_root, id, &share)?;

    print_status(Status::Ok, project);
    println!(
        "{} Restored {} into {}",
        style("✓").green(),
        style(id).bold(),
        share.display()
    );
    Ok(())
}
