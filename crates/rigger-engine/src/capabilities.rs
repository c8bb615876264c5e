use std::time::Duration;

use rigger_core::RigSettings;
use tracing::warn;

use crate::dotfiles::DEFAULT_TEMPLATE_EXTENSION;
use crate::git_ops::{GitClient, SystemGit};
use crate::installer::{PackageInstaller, SystemPackageInstaller, UnavailableInstaller};
use crate::process::{CommandRunner, SystemCommandRunner};
use crate::template::{MiniJinjaRenderer, TemplateRenderer};

/// The external effects the engine relies on, bundled so callers can swap any of them.
pub struct Capabilities {
    pub installer: Box<dyn PackageInstaller>,
    pub git: Box<dyn GitClient>,
    pub renderer: Box<dyn TemplateRenderer>,
    pub runner: Box<dyn CommandRunner>,
    pub template_extension: String,
}

impl Capabilities {
    pub fn system(settings: &RigSettings) -> Self {
        let installer: Box<dyn PackageInstaller> = match SystemPackageInstaller::detect() {
            Some(installer) => Box::new(installer),
            None => {
                warn!("no supported package manager found; package installs will fail");
                Box::new(UnavailableInstaller)
            }
        };
        Self {
            installer,
            git: Box::new(SystemGit),
            renderer: Box::new(MiniJinjaRenderer),
            runner: Box::new(SystemCommandRunner::new(
                settings.command_timeout_secs.map(Duration::from_secs),
            )),
            template_extension: settings.template_extension.clone(),
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            installer: Box::new(UnavailableInstaller),
            git: Box::new(SystemGit),
            renderer: Box::new(MiniJinjaRenderer),
            runner: Box::new(SystemCommandRunner::default()),
            template_extension: DEFAULT_TEMPLATE_EXTENSION.to_string(),
        }
    }
}
