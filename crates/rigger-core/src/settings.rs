use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const SETTINGS_FILE_NAME: &str = "settings.toml";

/// Tool-level settings read from `settings.toml` in the rigger home directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RigSettings {
    pub state_dir: Option<PathBuf>,
    pub backup_dir: Option<PathBuf>,
    pub command_timeout_secs: Option<u64>,
    pub template_extension: String,
    pub watch_debounce_ms: u64,
}

impl Default for RigSettings {
    fn default() -> Self {
        Self {
            state_dir: None,
            backup_dir: None,
            command_timeout_secs: None,
            template_extension: ".j2".to_string(),
            watch_debounce_ms: 1000,
        }
    }
}

impl RigSettings {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let settings: Self = toml::from_str(input).context("failed to parse rigger settings")?;
        if !settings.template_extension.starts_with('.') || settings.template_extension.len() < 2
        {
            anyhow::bail!(
                "template_extension must start with '.' and name an extension: '{}'",
                settings.template_extension
            );
        }
        Ok(settings)
    }

    pub fn load(home: &Path) -> Result<Self> {
        let path = home.join(SETTINGS_FILE_NAME);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read settings: {}", path.display()));
            }
        };
        Self::from_toml_str(&raw)
            .with_context(|| format!("failed parsing settings: {}", path.display()))
    }

    pub fn state_dir(&self, home: &Path) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| home.join("state"))
    }

    pub fn backup_dir(&self, home: &Path) -> PathBuf {
        self.backup_dir
            .clone()
            .unwrap_or_else(|| home.join("backups"))
    }
}

pub fn default_rigger_home() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("RIGGER_HOME") {
        if !home.trim().is_empty() {
            return Ok(PathBuf::from(home));
        }
    }

    if cfg!(windows) {
        let app_data = std::env::var("LOCALAPPDATA")
            .context("LOCALAPPDATA is not set; cannot resolve Windows rigger home")?;
        return Ok(PathBuf::from(app_data).join("Rigger"));
    }

    let home = dirs::home_dir().context("home directory is unknown; cannot resolve rigger home")?;
    Ok(home.join(".rigger"))
}
