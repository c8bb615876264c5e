use std::path::Path;
use std::process::{Command, Output};

use anyhow::{Context, Result};

/// Git operations used by repository reconciliation and sync.
pub trait GitClient: Send + Sync {
    fn clone_repo(&self, url: &str, branch: &str, destination: &Path) -> Result<()>;

    fn pull(&self, repo_root: &Path) -> Result<()>;

    fn head(&self, repo_root: &Path) -> Result<String>;

    fn push(&self, repo_root: &Path) -> Result<()>;

    /// Output of `git status --porcelain`; empty when the worktree is clean.
    fn status_porcelain(&self, repo_root: &Path) -> Result<String>;
}

/// Drives the `git` executable found on `PATH`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemGit;

impl GitClient for SystemGit {
    fn clone_repo(&self, url: &str, branch: &str, destination: &Path) -> Result<()> {
        let output = base_git_command()
            .arg("clone")
            .arg("-b")
            .arg(branch)
            .arg("--")
            .arg(url)
            .arg(destination)
            .output()
            .with_context(|| format!("failed launching git clone for '{url}'"))?;
        ensure_success(&output, &format!("git clone of '{url}'"))
    }

    fn pull(&self, repo_root: &Path) -> Result<()> {
        run_git_command(repo_root, &["pull"]).map(|_| ())
    }

    fn head(&self, repo_root: &Path) -> Result<String> {
        let stdout = run_git_command(repo_root, &["rev-parse", "HEAD"])?;
        let head = stdout.trim();
        if head.is_empty() || !head.chars().all(|ch| ch.is_ascii_hexdigit()) {
            anyhow::bail!(
                "git rev-parse returned an invalid HEAD for {}: '{head}'",
                repo_root.display()
            );
        }
        Ok(head.to_string())
    }

    fn push(&self, repo_root: &Path) -> Result<()> {
        run_git_command(repo_root, &["push"]).map(|_| ())
    }

    fn status_porcelain(&self, repo_root: &Path) -> Result<String> {
        run_git_command(repo_root, &["status", "--porcelain"])
    }
}

pub(crate) fn base_git_command() -> Command {
    let mut command = Command::new("git");
    command
        .arg("-c")
        .arg("core.autocrlf=false")
        .arg("-c")
        .arg("core.eol=lf");
    if cfg!(windows) {
        command.arg("-c").arg("core.longpaths=true");
    }
    command
}

fn run_git_command(repo_root: &Path, args: &[&str]) -> Result<String> {
    let output = base_git_command()
        .args(args)
        .current_dir(repo_root)
        .output()
        .with_context(|| {
            format!(
                "failed launching git {} in {}",
                args.join(" "),
                repo_root.display()
            )
        })?;
    ensure_success(
        &output,
        &format!("git {} in {}", args.join(" "), repo_root.display()),
    )?;
    String::from_utf8(output.stdout)
        .with_context(|| format!("git {} produced non-UTF-8 output", args.join(" ")))
}

fn ensure_success(output: &Output, what: &str) -> Result<()> {
    if !output.status.success() {
        anyhow::bail!(
            "{what} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

pub(crate) fn is_checkout(path: &Path) -> bool {
    path.join(".git").exists()
}
