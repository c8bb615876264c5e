use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use rigger_security::{has_traversal, validate_command, CommandVerdict};
use url::Url;

use crate::{resolve_target_path, Script, SpecError, Specification};

const MAX_NAME_LEN: usize = 200;

static SCP_LIKE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._-]+@[A-Za-z0-9.-]+:[^\s:][^\s]*$")
        .expect("scp-like url pattern must compile")
});

impl Specification {
    /// Collects every problem instead of stopping at the first one.
    pub fn validate(&self) -> Result<(), SpecError> {
        let mut problems = Vec::new();

        if self.name.trim().is_empty() {
            problems.push("missing required field 'name'".to_string());
        } else if self.name.chars().count() > MAX_NAME_LEN {
            problems.push(format!("name exceeds {MAX_NAME_LEN} characters"));
        }

        for package in &self.system.packages {
            if package.trim().is_empty() {
                problems.push("package names must not be empty".to_string());
            }
        }

        for repo in &self.git.repositories {
            if !is_valid_repository_url(&repo.url) {
                problems.push(format!("malformed repository url '{}'", repo.url));
            }
            if repo.path.trim().is_empty() {
                problems.push(format!("repository '{}' has an empty path", repo.url));
            } else if has_traversal(&repo.path) {
                problems.push(format!("repository path '{}' contains '..'", repo.path));
            }
            if repo.branch.trim().is_empty() {
                problems.push(format!("repository '{}' has an empty branch", repo.url));
            }
        }

        let mut seen_targets = HashSet::new();
        for dotfile in &self.dotfiles {
            for (field, value) in [("source", &dotfile.source), ("target", &dotfile.target)] {
                if value.trim().is_empty() {
                    problems.push(format!("dotfile {field} must not be empty"));
                } else if has_traversal(value) {
                    problems.push(format!("dotfile {field} '{value}' contains '..'"));
                }
            }
            let key = resolve_target_path(&dotfile.target);
            if !dotfile.target.trim().is_empty() && !seen_targets.insert(key) {
                problems.push(format!("duplicate dotfile target '{}'", dotfile.target));
            }
        }

        for script in &self.scripts {
            check_script("script", script, &mut problems);
        }
        for (point, script) in self.hooks.iter() {
            check_script(&format!("{} hook", point.as_str()), script, &mut problems);
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(SpecError::Validation(problems))
        }
    }
}

fn check_script(kind: &str, script: &Script, problems: &mut Vec<String>) {
    if let CommandVerdict::Unsafe(reason) = validate_command(&script.command) {
        problems.push(format!("{kind} '{}' is unsafe: {reason}", script.command));
    }
    if let Some(cwd) = &script.cwd {
        if has_traversal(cwd) {
            problems.push(format!("{kind} cwd '{cwd}' contains '..'"));
        }
    }
}

fn is_valid_repository_url(raw: &str) -> bool {
    let raw = raw.trim();
    if raw.is_empty() {
        return false;
    }
    if let Ok(url) = Url::parse(raw) {
        return match url.scheme() {
            "file" => true,
            "http" | "https" | "ssh" | "git" => url.host_str().is_some_and(|h| !h.is_empty()),
            _ => false,
        };
    }
    SCP_LIKE_RE.is_match(raw) || Path::new(raw).is_absolute()
}

#[cfg(test)]
mod tests {
    use super::is_valid_repository_url;

    #[test]
    fn repository_url_forms() {
        assert!(is_valid_repository_url("https://github.com/acme/dots.git"));
        assert!(is_valid_repository_url("ssh://git@github.com/acme/dots.git"));
        assert!(is_valid_repository_url("git@github.com:acme/dots.git"));
        assert!(is_valid_repository_url("file:///srv/git/dots.git"));
        assert!(is_valid_repository_url("/srv/git/dots.git"));
        assert!(!is_valid_repository_url("not a url"));
        assert!(!is_valid_repository_url("ftp://example.test/dots.git"));
        assert!(!is_valid_repository_url("https://"));
        assert!(!is_valid_repository_url(""));
    }
}
