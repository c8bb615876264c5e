use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::path_rules::{validate_path, PathVerdict};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandVerdict {
    Ok,
    Unsafe(String),
}

impl CommandVerdict {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Ok => None,
            Self::Unsafe(reason) => Some(reason),
        }
    }
}

impl fmt::Display for CommandVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("ok"),
            Self::Unsafe(reason) => write!(f, "unsafe command: {reason}"),
        }
    }
}

struct DangerPattern {
    regex: Regex,
    reason: &'static str,
}

static DANGER_PATTERNS: LazyLock<Vec<DangerPattern>> = LazyLock::new(|| {
    [
        (r"\|\|", "command chaining with ||"),
        (r"&&", "command chaining with &&"),
        (r";", "command chaining with ;"),
        (r"`", "backtick substitution"),
        (r"\$\(\(", "arithmetic substitution"),
        (r"\$\(", "command substitution"),
        (r"\$\{", "environment variable injection"),
        (r"(^|\s)eval(\s|$)", "eval invocation"),
        (r"(^|\s)exec(\s|$)", "exec invocation"),
        (r"(^|\s)source(\s|$)", "source invocation"),
        (r"\b(bash|sh|zsh|dash|ksh)\s+-c\b", "shell -c invocation"),
        (r"\bpython[0-9.]*\b.*\s-c\b", "interpreter -c flag"),
        (r"\b(perl|ruby|node)\b.*\s-e\b", "interpreter -e flag"),
        (r"\brm\s+-(rf|fr)\b", "recursive forced removal"),
    ]
    .into_iter()
    .map(|(pattern, reason)| DangerPattern {
        regex: Regex::new(pattern).expect("danger pattern must compile"),
        reason,
    })
    .collect()
});

/// Classifies a shell command. Never fails on malformed input.
pub fn validate_command(cmd: &str) -> CommandVerdict {
    let lowered = cmd.to_lowercase();
    if lowered.trim().is_empty() {
        return CommandVerdict::Unsafe("empty command".to_string());
    }

    for pattern in DANGER_PATTERNS.iter() {
        if pattern.regex.is_match(&lowered) {
            return CommandVerdict::Unsafe(pattern.reason.to_string());
        }
    }

    for arg in cmd.split_whitespace().skip(1) {
        let arg = arg.trim_matches(|ch| ch == '"' || ch == '\'');
        if !(arg.starts_with('/') || arg.starts_with('~') || arg.starts_with('$')) {
            continue;
        }
        if let PathVerdict::Restricted(dir) = validate_path(arg) {
            return CommandVerdict::Unsafe(format!("argument under restricted directory {dir}"));
        }
    }

    CommandVerdict::Ok
}
