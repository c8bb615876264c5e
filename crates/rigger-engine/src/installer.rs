use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use tracing::debug;

/// Installs and queries system packages.
pub trait PackageInstaller: Send + Sync {
    fn name(&self) -> &str;

    fn is_installed(&self, package: &str) -> bool;

    fn install(&self, package: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Apt,
    Dnf,
    Yum,
    Zypper,
    Pacman,
    Xbps,
    Apk,
    Brew,
    MacPorts,
    Winget,
    Chocolatey,
    Scoop,
}

impl PackageManager {
    /// Probe order per platform; the first executable found on `PATH` wins.
    const CANDIDATES: [PackageManager; 12] = [
        PackageManager::Brew,
        PackageManager::MacPorts,
        PackageManager::Apt,
        PackageManager::Dnf,
        PackageManager::Yum,
        PackageManager::Zypper,
        PackageManager::Pacman,
        PackageManager::Xbps,
        PackageManager::Apk,
        PackageManager::Winget,
        PackageManager::Chocolatey,
        PackageManager::Scoop,
    ];

    pub fn detect() -> Option<Self> {
        Self::CANDIDATES
            .into_iter()
            .find(|manager| which::which(manager.executable()).is_ok())
    }

    pub fn executable(self) -> &'static str {
        match self {
            Self::Apt => "apt-get",
            Self::Dnf => "dnf",
            Self::Yum => "yum",
            Self::Zypper => "zypper",
            Self::Pacman => "pacman",
            Self::Xbps => "xbps-install",
            Self::Apk => "apk",
            Self::Brew => "brew",
            Self::MacPorts => "port",
            Self::Winget => "winget",
            Self::Chocolatey => "choco",
            Self::Scoop => "scoop",
        }
    }

    fn needs_privileges(self) -> bool {
        !matches!(
            self,
            Self::Brew | Self::Winget | Self::Chocolatey | Self::Scoop
        )
    }

    fn install_args(self, package: &str) -> Vec<String> {
        let args: &[&str] = match self {
            Self::Apt => &["install", "-y"],
            Self::Dnf | Self::Yum => &["install", "-y"],
            Self::Zypper => &["--non-interactive", "install"],
            Self::Pacman => &["-S", "--noconfirm", "--needed"],
            Self::Xbps => &["-y"],
            Self::Apk => &["add"],
            Self::Brew | Self::MacPorts | Self::Scoop => &["install"],
            Self::Winget => &["install", "-e", "--id"],
            Self::Chocolatey => &["install", "-y"],
        };
        args.iter()
            .map(|arg| arg.to_string())
            .chain(std::iter::once(package.to_string()))
            .collect()
    }

    fn query_command(self, package: &str) -> Option<(&'static str, Vec<String>)> {
        let (program, args): (&'static str, &[&str]) = match self {
            Self::Apt => ("dpkg", &["-s"]),
            Self::Dnf | Self::Yum | Self::Zypper => ("rpm", &["-q"]),
            Self::Pacman => ("pacman", &["-Q"]),
            Self::Xbps => ("xbps-query", &[]),
            Self::Apk => ("apk", &["info", "-e"]),
            Self::Brew => ("brew", &["list", "--versions"]),
            Self::MacPorts => ("port", &["-q", "installed"]),
            Self::Winget | Self::Chocolatey | Self::Scoop => return None,
        };
        let args = args
            .iter()
            .map(|arg| arg.to_string())
            .chain(std::iter::once(package.to_string()))
            .collect();
        Some((program, args))
    }
}

/// Installs through the platform package manager, elevating with `sudo` when
/// the manager needs it and the current user is not root.
#[derive(Debug, Clone)]
pub struct SystemPackageInstaller {
    manager: PackageManager,
    use_sudo: bool,
}

impl SystemPackageInstaller {
    pub fn new(manager: PackageManager) -> Self {
        let use_sudo = manager.needs_privileges()
            && !running_as_root()
            && which::which("sudo").is_ok();
        Self { manager, use_sudo }
    }

    pub fn detect() -> Option<Self> {
        PackageManager::detect().map(Self::new)
    }

    pub fn manager(&self) -> PackageManager {
        self.manager
    }
}

impl PackageInstaller for SystemPackageInstaller {
    fn name(&self) -> &str {
        self.manager.executable()
    }

    fn is_installed(&self, package: &str) -> bool {
        match self.manager.query_command(package) {
            Some((program, args)) => Command::new(program)
                .args(&args)
                .stdin(Stdio::null())
                .output()
                .map(|output| output.status.success() && !output.stdout.is_empty())
                .unwrap_or(false),
            None => which::which(package).is_ok(),
        }
    }

    fn install(&self, package: &str) -> Result<()> {
        let mut command = if self.use_sudo {
            let mut command = Command::new("sudo");
            command.arg(self.manager.executable());
            command
        } else {
            Command::new(self.manager.executable())
        };
        command
            .args(self.manager.install_args(package))
            .stdin(Stdio::null());
        debug!(manager = self.name(), package, "installing package");

        let output = command.output().with_context(|| {
            format!(
                "failed launching {} to install '{package}'",
                self.manager.executable()
            )
        })?;
        if !output.status.success() {
            anyhow::bail!(
                "{} failed to install '{package}': {}",
                self.manager.executable(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Stand-in used when no supported package manager exists on the machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableInstaller;

impl PackageInstaller for UnavailableInstaller {
    fn name(&self) -> &str {
        "none"
    }

    fn is_installed(&self, package: &str) -> bool {
        which::which(package).is_ok()
    }

    fn install(&self, package: &str) -> Result<()> {
        anyhow::bail!("no supported package manager found to install '{package}'")
    }
}

fn running_as_root() -> bool {
    if cfg!(windows) {
        return false;
    }
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .map(|user| user == "root")
        .unwrap_or(false)
}
