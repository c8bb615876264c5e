use std::path::PathBuf;
use std::sync::LazyLock;

use regex::{Captures, Regex};

static ENV_VAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
        .expect("env var pattern must compile")
});

/// Replaces `$NAME` and `${NAME}` with values from the process environment.
/// References to unset variables are left as written.
pub fn expand_env_vars(input: &str) -> String {
    ENV_VAR_RE
        .replace_all(input, |caps: &Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            std::env::var(name).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

/// Expands environment variables and a leading `~` in a user supplied path.
pub fn expand_user_path(raw: &str) -> PathBuf {
    let expanded = expand_env_vars(raw);
    if expanded == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(rest) = expanded
        .strip_prefix("~/")
        .or_else(|| expanded.strip_prefix("~\\"))
    {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(expanded)
}
