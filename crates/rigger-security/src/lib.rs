mod checksum;
mod command_rules;
mod expand;
mod path_rules;

pub use checksum::{sha256_file, sha256_hex};
pub use command_rules::{validate_command, CommandVerdict};
pub use expand::{expand_env_vars, expand_user_path};
pub use path_rules::{has_traversal, validate_archive_name, validate_path, PathVerdict};
