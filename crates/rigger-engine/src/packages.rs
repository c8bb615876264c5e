use anyhow::Result;
use rigger_state::{ChangeAction, ChangeRecord, OperationTracker, STATUS_FAILED, STATUS_SUCCESS};
use tracing::{info, warn};

use crate::installer::PackageInstaller;
use crate::outcome::{journal, ItemOutcome, ProgressSink, RunOptions};

pub const PACKAGES_STAGE: &str = "packages";

pub struct PackageService<'a> {
    installer: &'a dyn PackageInstaller,
}

impl<'a> PackageService<'a> {
    pub fn new(installer: &'a dyn PackageInstaller) -> Self {
        Self { installer }
    }

    /// Installs each missing package in order. A failed install is recorded and
    /// the remaining packages are still attempted.
    pub fn reconcile(
        &self,
        packages: &[String],
        mut tracker: Option<&mut OperationTracker>,
        options: &RunOptions,
        progress: &dyn ProgressSink,
    ) -> Result<Vec<ItemOutcome>> {
        progress.stage_started(PACKAGES_STAGE, packages.len());
        let mut outcomes = Vec::with_capacity(packages.len());

        for package in packages {
            let outcome = if self.installer.is_installed(package) {
                ItemOutcome::skipped(package, "already installed")
            } else if options.dry_run {
                journal(
                    &mut tracker,
                    ChangeRecord::new(ChangeAction::WouldInstallPackage, package)
                        .with_detail("manager", self.installer.name()),
                );
                ItemOutcome::applied(package, "would install")
            } else {
                match self.installer.install(package) {
                    Ok(()) => {
                        info!(package = %package, manager = self.installer.name(), "installed package");
                        journal(
                            &mut tracker,
                            ChangeRecord::new(ChangeAction::InstalledPackage, package)
                                .with_detail("status", STATUS_SUCCESS)
                                .with_detail("manager", self.installer.name()),
                        );
                        ItemOutcome::applied(package, "installed")
                    }
                    Err(err) => {
                        warn!(package = %package, error = %format!("{err:#}"), "package install failed");
                        journal(
                            &mut tracker,
                            ChangeRecord::new(ChangeAction::InstalledPackage, package)
                                .with_detail("status", STATUS_FAILED)
                                .with_detail("manager", self.installer.name())
                                .with_detail("error", format!("{err:#}")),
                        );
                        ItemOutcome::failed(package, format!("{err:#}"))
                    }
                }
            };
            progress.item_finished(PACKAGES_STAGE, &outcome);
            outcomes.push(outcome);
        }

        progress.stage_finished(PACKAGES_STAGE);
        Ok(outcomes)
    }
}
