use crate::command;
use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "agentbox")]
#[command(about = "Sandboxed agent environments whose state can move between layouts")]
pub struct Cli {
    /// Also print debug logs to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, inspect, convert and run boxes
    Box(command::box_cmd::BoxArgs),

    /// Group related boxes
    Workset(command::workset::WorksetArgs),

    /// Snapshot and restore a box's vault
    Vault(command::vault::VaultArgs),

    /// Generate shell completions
    Completions {
        /// The shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// --- Public Entry Point ---
pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Box(args) => command::box_cmd::run(args),
        Commands::Workset(args) => command::workset::run(args),
        Commands::Vault(args) => command::vault::run(args),
        Commands::Completions { shell } => {
            generate_completions(shell);
            Ok(())
        }
    }
}

fn generate_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut std::io::stdout());
}
