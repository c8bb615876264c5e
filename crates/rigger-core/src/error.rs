use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures that stop a run before anything on the machine is touched.
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("specification not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read specification {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse specification {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("invalid specification: {}", .0.join("; "))]
    Validation(Vec<String>),
}

impl SpecError {
    pub fn problems(&self) -> &[String] {
        match self {
            Self::Validation(problems) => problems,
            _ => &[],
        }
    }
}
