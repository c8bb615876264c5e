mod capabilities;
mod clean;
mod diff;
mod dotfiles;
mod git_ops;
mod installer;
mod outcome;
mod packages;
mod plugins;
mod process;
mod reconciler;
mod repositories;
mod scripts;
mod status;
mod sync;
mod template;
mod watch;

pub use capabilities::Capabilities;
pub use clean::{clean, CLEAN_STAGE};
pub use diff::{diff_dotfiles, DiffKind, DotfileDiff};
pub use dotfiles::{
    resolve_source, resolve_target, DotfileService, DEFAULT_TEMPLATE_EXTENSION, DOTFILES_STAGE,
};
pub use git_ops::{GitClient, SystemGit};
pub use installer::{
    PackageInstaller, PackageManager, SystemPackageInstaller, UnavailableInstaller,
};
pub use outcome::{ItemOutcome, ItemStatus, NoProgress, ProgressSink, RunOptions};
pub use packages::{PackageService, PACKAGES_STAGE};
pub use plugins::{InventoryPlugin, Plugin, PluginOutcome, PluginRegistry};
pub use process::{CommandOutput, CommandRunner, SystemCommandRunner};
pub use reconciler::{
    rollback_latest, ApplyError, ApplyOptions, ApplyReport, CancelToken, Reconciler, Stage,
    StageReport, APPLY_OPERATION,
};
pub use repositories::{RepositoryService, REPOSITORIES_STAGE};
pub use scripts::{ScriptService, SCRIPTS_STAGE};
pub use status::{
    collect_status, DotfileState, DotfileStatus, RepositoryState, RepositoryStatus, StatusReport,
};
pub use sync::{sync_repositories, SYNC_STAGE};
pub use template::{MiniJinjaRenderer, TemplateRenderer};
pub use watch::{is_relevant, watch_documents, Debouncer};

#[cfg(test)]
mod tests;
