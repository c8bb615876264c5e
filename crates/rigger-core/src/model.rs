use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Specification {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub variables: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    pub system: SystemSection,
    #[serde(default)]
    pub git: GitSection,
    #[serde(default)]
    pub dotfiles: Vec<Dotfile>,
    #[serde(default)]
    pub scripts: Vec<Script>,
    #[serde(default)]
    pub hooks: Hooks,
    #[serde(default)]
    pub profiles: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SystemSection {
    #[serde(default)]
    pub packages: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct GitSection {
    #[serde(default)]
    pub repositories: Vec<Repository>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Repository {
    pub url: String,
    pub path: String,
    #[serde(default = "default_branch")]
    pub branch: String,
}

fn default_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Dotfile {
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Script {
    pub command: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub when: ScriptWhen,
}

impl Script {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            description: None,
            cwd: None,
            when: ScriptWhen::default(),
        }
    }

    pub fn label(&self) -> &str {
        self.description.as_deref().unwrap_or(&self.command)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScriptWhen {
    Pre,
    #[default]
    Post,
    Both,
}

impl ScriptWhen {
    pub fn runs_in_pre_pass(self) -> bool {
        matches!(self, Self::Pre | Self::Both)
    }

    pub fn runs_in_post_pass(self) -> bool {
        matches!(self, Self::Post | Self::Both)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Hooks {
    #[serde(default)]
    pub pre_system: Vec<Script>,
    #[serde(default)]
    pub post_system: Vec<Script>,
    #[serde(default)]
    pub pre_git: Vec<Script>,
    #[serde(default)]
    pub post_git: Vec<Script>,
    #[serde(default)]
    pub pre_dotfiles: Vec<Script>,
    #[serde(default)]
    pub post_dotfiles: Vec<Script>,
    #[serde(default)]
    pub pre_scripts: Vec<Script>,
    #[serde(default)]
    pub post_scripts: Vec<Script>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    PreSystem,
    PostSystem,
    PreGit,
    PostGit,
    PreDotfiles,
    PostDotfiles,
    PreScripts,
    PostScripts,
}

impl HookPoint {
    pub const ALL: [HookPoint; 8] = [
        HookPoint::PreSystem,
        HookPoint::PostSystem,
        HookPoint::PreGit,
        HookPoint::PostGit,
        HookPoint::PreDotfiles,
        HookPoint::PostDotfiles,
        HookPoint::PreScripts,
        HookPoint::PostScripts,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreSystem => "pre_system",
            Self::PostSystem => "post_system",
            Self::PreGit => "pre_git",
            Self::PostGit => "post_git",
            Self::PreDotfiles => "pre_dotfiles",
            Self::PostDotfiles => "post_dotfiles",
            Self::PreScripts => "pre_scripts",
            Self::PostScripts => "post_scripts",
        }
    }
}

impl Hooks {
    pub fn list(&self, point: HookPoint) -> &[Script] {
        match point {
            HookPoint::PreSystem => &self.pre_system,
            HookPoint::PostSystem => &self.post_system,
            HookPoint::PreGit => &self.pre_git,
            HookPoint::PostGit => &self.post_git,
            HookPoint::PreDotfiles => &self.pre_dotfiles,
            HookPoint::PostDotfiles => &self.post_dotfiles,
            HookPoint::PreScripts => &self.pre_scripts,
            HookPoint::PostScripts => &self.post_scripts,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (HookPoint, &Script)> {
        HookPoint::ALL
            .into_iter()
            .flat_map(move |point| self.list(point).iter().map(move |script| (point, script)))
    }
}

/// A fully merged specification together with where it was loaded from.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveSpecification {
    pub spec: Specification,
    pub source_path: PathBuf,
    pub base_dir: PathBuf,
    pub profile: String,
}

impl EffectiveSpecification {
    pub fn new(spec: Specification, base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            spec,
            source_path: base_dir.join("rigger.yaml"),
            base_dir,
            profile: String::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}
