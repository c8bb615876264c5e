mod archive;
mod error;
mod manifest;

pub use archive::{DigestMismatch, RestoreItem, RestoreOutcome, SnapshotManager};
pub use error::SnapshotError;
pub use manifest::{archive_name_for, ManifestEntry, SnapshotManifest, MANIFEST_ENTRY};
