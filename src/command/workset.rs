use anyhow::Result;
use clap::{Args, Subcommand};
use console::style;
use tabled::{
    Table, Tabled,
    settings::{Padding, Style, object::Columns},
};

use super::{Env, Status, StatusLine};
use crate::layout::LayoutMode;
use crate::workset::Workset;

#[derive(Debug, Args)]
pub struct WorksetArgs {
    #[command(subcommand)]
    pub command: WorksetCommand,
}

#[derive(Debug, Subcommand)]
pub enum WorksetCommand {
    /// Create an empty workset
    Create {
        /// Name of the workset
        name: String,

        /// Short description shown by `workset list`
        #[arg(long)]
        description: Option<String>,
    },

    /// List worksets and how many boxes each holds
    #[command(visible_alias = "ls")]
    List,
}

pub fn run(args: WorksetArgs) -> Result<()> {
    let env = Env::load()?;
    match args.command {
        WorksetCommand::Create { name, description } => run_create(&env, &name, description),
        WorksetCommand::List => run_list(&env),
    }
}

fn run_create(env: &Env, name: &str, description: Option<String>) -> Result<()> {
    let workset = Workset::create(&env.store, name, description)?;
    println!(
        "{}",
        StatusLine {
            status: Status::Ok,
            layout: LayoutMode::Workset,
            name: &workset.name(),
            state_root: &workset.root,
        }
    );
    println!(
        "{} Created workset {}",
        style("✓").green(),
        style(workset.name()).bold()
    );
    Ok(())
}

#[derive(Tabled)]
struct WorksetRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "BOXES")]
    boxes: usize,
    #[tabled(rename = "DESCRIPTION")]
    description: String,
}

fn run_list(env: &Env) -> Result<()> {
    let worksets = Workset::list(&env.store)?;
    if worksets.is_empty() {
        println!("No worksets in {}", env.store.worksets_dir().display());
        return Ok(());
    }

    let resolver = env.resolver();
    let mut rows = Vec::with_capacity(worksets.len());
    for workset in worksets {
        let boxes = resolver.list_workset(workset.name())?.len();
        rows.push(WorksetRow {
            name: workset.manifest.name,
            boxes,
            description: workset.manifest.description.unwrap_or_default(),
        });
    }

    let mut table = Table::new(rows);
    table
        .with(Style::blank())
        .modify(Columns::new(0..3), Padding::new(0, 1, 0, 0));
    println!("{table}");
    Ok(())
}
