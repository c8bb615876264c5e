use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use rigger_engine::APPLY_OPERATION;

pub const DEFAULT_CONFIG_FILE: &str = "rigger.yaml";

#[derive(Parser, Debug)]
#[command(name = "rigger")]
#[command(version)]
#[command(about = "Declarative workstation bootstrapper", long_about = None)]
pub struct Cli {
    /// Specification document to load.
    #[arg(long, short = 'c', global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,
    /// Report what would change without touching the machine.
    #[arg(long, short = 'n', global = true)]
    pub dry_run: bool,
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
    /// Delete existing targets instead of moving them aside.
    #[arg(long, short = 'f', global = true)]
    pub force: bool,
    /// Profile overlay to apply instead of the detected one.
    #[arg(long, short = 'p', global = true)]
    pub profile: Option<String>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install packages, sync repositories, link dotfiles and run scripts.
    Apply,
    /// Remove symlinks created from the specification.
    Clean,
    /// Load and validate the specification without applying it.
    Validate,
    /// Archive every existing dotfile target.
    Backup,
    /// Extract a snapshot archive over the machine.
    Restore {
        /// Archive path, or a file name inside the backup directory.
        snapshot: String,
    },
    /// Undo the most recent recorded run.
    Rollback {
        #[arg(long, default_value = APPLY_OPERATION)]
        operation: String,
        /// Restore the latest snapshot instead of replaying the journal.
        #[arg(long)]
        from_backup: bool,
    },
    /// Compare the machine with the specification.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Show how applying would change each dotfile target.
    Diff,
    /// Push every cloned repository.
    Sync,
    /// Re-apply whenever the specification changes.
    Watch,
    /// Write a starter specification.
    Init {
        #[arg(default_value = DEFAULT_CONFIG_FILE)]
        path: PathBuf,
    },
    /// Run registered plugins, all of them when no names are given.
    Plugins { names: Vec<String> },
    /// Print the detected profile name.
    Detect,
    /// Print a shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum CliCompletionShell {
    Bash,
    Zsh,
    Fish,
    Powershell,
    Elvish,
}

impl From<CliCompletionShell> for Shell {
    fn from(value: CliCompletionShell) -> Self {
        match value {
            CliCompletionShell::Bash => Shell::Bash,
            CliCompletionShell::Zsh => Shell::Zsh,
            CliCompletionShell::Fish => Shell::Fish,
            CliCompletionShell::Powershell => Shell::PowerShell,
            CliCompletionShell::Elvish => Shell::Elvish,
        }
    }
}
