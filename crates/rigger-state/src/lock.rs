use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, warn};

use crate::StateLayout;

/// Exclusive claim on one specification, held for the lifetime of the value.
#[derive(Debug)]
pub struct SpecLock {
    path: PathBuf,
}

impl SpecLock {
    pub fn acquire(layout: &StateLayout, spec_name: &str) -> Result<Self> {
        let path = layout.lock_path(spec_name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        if !try_create(&path)? {
            let owner = read_owner(&path);
            if let Some(pid) = owner {
                if owner_process_alive(pid)? {
                    return Err(anyhow!(
                        "specification '{spec_name}' is locked by process {pid} ({})",
                        path.display()
                    ));
                }
            }

            warn!(path = %path.display(), owner = ?owner, "reclaiming stale lock");
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove stale lock: {}", path.display()))?;
            if !try_create(&path)? {
                return Err(anyhow!(
                    "specification '{spec_name}' was locked concurrently ({})",
                    path.display()
                ));
            }
        }

        debug!(path = %path.display(), "acquired specification lock");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SpecLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "failed to release lock");
            }
        }
    }
}

fn try_create(path: &Path) -> Result<bool> {
    let mut file = match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to claim lock file: {}", path.display()));
        }
    };
    file.write_all(format!("{}\n", std::process::id()).as_bytes())
        .with_context(|| format!("failed to write lock file: {}", path.display()))?;
    file.flush()
        .with_context(|| format!("failed to flush lock file: {}", path.display()))?;
    Ok(true)
}

fn read_owner(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn owner_process_alive(pid: u32) -> Result<bool> {
    if pid == std::process::id() {
        return Ok(true);
    }

    #[cfg(unix)]
    {
        let status = Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .with_context(|| format!("failed executing owner liveness probe for pid={pid}"))?;
        Ok(status.success())
    }

    #[cfg(windows)]
    {
        let output = Command::new("tasklist")
            .args(["/FI", &format!("PID eq {pid}"), "/FO", "CSV", "/NH"])
            .stderr(Stdio::null())
            .output()
            .with_context(|| format!("failed executing owner liveness probe for pid={pid}"))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.contains(&format!(",\"{pid}\"")))
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = pid;
        Ok(true)
    }
}
