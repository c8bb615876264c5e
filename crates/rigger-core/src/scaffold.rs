use std::fs;
use std::io::{self, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};

pub const DEFAULT_SPECIFICATION: &str = r#"# rigger specification
name: my-machine

variables:
  editor: vim

system:
  packages:
    - git
    - curl

git:
  repositories: []
  # - url: https://github.com/example/dotfiles.git
  #   path: ~/src/dotfiles
  #   branch: main

dotfiles: []
  # - source: bashrc
  #   target: ~/.bashrc
  # - source: gitconfig.j2
  #   target: ~/.gitconfig

scripts: []
  # - command: ./setup.sh
  #   description: finish setup
  #   when: post

hooks:
  pre_system: []
  post_system: []
  pre_git: []
  post_git: []
  pre_dotfiles: []
  post_dotfiles: []
  pre_scripts: []
  post_scripts: []

profiles: {}
"#;

/// Writes the starter specification, refusing to replace an existing file.
pub fn write_default_specification(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut file = match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            return Err(anyhow!(
                "specification already exists: {}",
                path.display()
            ));
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to create specification: {}", path.display()));
        }
    };
    file.write_all(DEFAULT_SPECIFICATION.as_bytes())
        .with_context(|| format!("failed to write specification: {}", path.display()))?;
    Ok(())
}
