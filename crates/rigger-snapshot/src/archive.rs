use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rigger_core::{resolve_target_path, sanitize_name, EffectiveSpecification};
use rigger_security::{sha256_file, sha256_hex, validate_archive_name};
use tar::{Archive, Builder, EntryType, Header};
use tracing::{debug, info, warn};

use crate::{archive_name_for, ManifestEntry, SnapshotError, SnapshotManifest, MANIFEST_ENTRY};

const ARCHIVE_SUFFIX: &str = ".tar.gz";
const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored,
    NotFoundInArchive,
    Rejected(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreItem {
    pub target: String,
    pub outcome: RestoreOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestMismatch {
    pub target: String,
    pub expected: String,
    pub actual: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SnapshotManager {
    backup_dir: PathBuf,
    restore_root: PathBuf,
}

impl SnapshotManager {
    pub fn new(backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            restore_root: PathBuf::from("/"),
        }
    }

    /// Extract under `root` instead of the filesystem root.
    pub fn with_restore_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.restore_root = root.into();
        self
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn create_snapshot(&self, effective: &EffectiveSpecification) -> Result<PathBuf, SnapshotError> {
        fs::create_dir_all(&self.backup_dir)
            .with_context(|| format!("failed to create {}", self.backup_dir.display()))?;

        let timestamp = Utc::now().format("%Y%m%d-%H%M%S").to_string();
        let (path, partial, file) = self.claim_archive_file(effective.name(), &timestamp)?;
        info!(path = %path.display(), "creating snapshot");

        let written = write_archive(file, effective, timestamp, &partial).and_then(|files| {
            fs::rename(&partial, &path).with_context(|| {
                format!("failed to move {} into place", partial.display())
            })?;
            Ok(files)
        });
        match written {
            Ok(files) => {
                info!(path = %path.display(), files, "snapshot created");
                Ok(path)
            }
            Err(err) => {
                if let Err(cleanup) = fs::remove_file(&partial) {
                    if cleanup.kind() != io::ErrorKind::NotFound {
                        warn!(path = %partial.display(), error = %cleanup, "failed to remove partial snapshot");
                    }
                }
                Err(err)
            }
        }
    }

    /// Validates every entry name first, then extracts all entries except the manifest.
    pub fn restore_snapshot(&self, archive_path: &Path) -> Result<usize, SnapshotError> {
        for name in self.entry_names(archive_path)? {
            if name.contains("..") || name.starts_with('/') || name.starts_with('\\') {
                return Err(corrupt(archive_path, format!("unsafe entry name '{name}'")));
            }
        }

        let mut archive = open_archive(archive_path)?;
        let mut restored = 0;
        let mut links = RestoredLinks::default();
        for entry in archive
            .entries()
            .map_err(|err| corrupt(archive_path, err.to_string()))?
        {
            let mut entry = entry.map_err(|err| corrupt(archive_path, err.to_string()))?;
            let name = entry_name(&entry).map_err(|err| corrupt(archive_path, err))?;
            if name == MANIFEST_ENTRY {
                continue;
            }
            let destination = self.restore_root.join(&name);
            if links.covers(&destination) {
                warn!(entry = %name, "entry lies beneath a restored symlink, skipping");
                continue;
            }
            unpack_entry(&mut entry, &destination)?;
            links.note(&entry, destination);
            restored += 1;
        }

        info!(archive = %archive_path.display(), entries = restored, "snapshot restored");
        Ok(restored)
    }

    /// Restores only the targets listed in `manifest`, reporting each one.
    pub fn restore_from_manifest(
        &self,
        archive_path: &Path,
        manifest: &SnapshotManifest,
    ) -> Result<Vec<RestoreItem>, SnapshotError> {
        let mut wanted = BTreeMap::new();
        let mut items = Vec::new();
        for (index, item) in manifest.dotfiles.iter().enumerate() {
            match archive_name_for(&resolve_target_path(&item.target)) {
                Ok(name) => {
                    wanted.insert(name, index);
                    items.push(RestoreItem {
                        target: item.target.clone(),
                        outcome: RestoreOutcome::NotFoundInArchive,
                    });
                }
                Err(reason) => items.push(RestoreItem {
                    target: item.target.clone(),
                    outcome: RestoreOutcome::Rejected(reason),
                }),
            }
        }

        let mut archive = open_archive(archive_path)?;
        let mut links = RestoredLinks::default();
        for entry in archive
            .entries()
            .map_err(|err| corrupt(archive_path, err.to_string()))?
        {
            let mut entry = entry.map_err(|err| corrupt(archive_path, err.to_string()))?;
            let Ok(name) = entry_name(&entry) else {
                continue;
            };
            if validate_archive_name(&name).is_err() {
                continue;
            }
            let Some(index) = owning_target(&wanted, &name) else {
                continue;
            };
            if matches!(
                items[index].outcome,
                RestoreOutcome::Failed(_) | RestoreOutcome::Rejected(_)
            ) {
                continue;
            }

            let destination = self.restore_root.join(&name);
            if links.covers(&destination) {
                items[index].outcome =
                    RestoreOutcome::Rejected(format!("{name} lies beneath a restored symlink"));
                continue;
            }
            items[index].outcome = match unpack_entry(&mut entry, &destination) {
                Ok(()) => {
                    links.note(&entry, destination);
                    RestoreOutcome::Restored
                }
                Err(err) => RestoreOutcome::Failed(err.to_string()),
            };
        }

        for item in &items {
            if item.outcome == RestoreOutcome::NotFoundInArchive {
                warn!(target = %item.target, "target not found in snapshot");
            }
        }
        Ok(items)
    }

    pub fn read_manifest(&self, archive_path: &Path) -> Result<SnapshotManifest, SnapshotError> {
        let mut archive = open_archive(archive_path)?;
        for entry in archive
            .entries()
            .map_err(|err| corrupt(archive_path, err.to_string()))?
        {
            let mut entry = entry.map_err(|err| corrupt(archive_path, err.to_string()))?;
            if entry_name(&entry).ok().as_deref() != Some(MANIFEST_ENTRY) {
                continue;
            }
            let mut raw = String::new();
            entry
                .read_to_string(&mut raw)
                .map_err(|err| corrupt(archive_path, err.to_string()))?;
            return serde_json::from_str(&raw)
                .map_err(|err| corrupt(archive_path, format!("invalid manifest: {err}")));
        }
        Err(corrupt(archive_path, format!("missing {MANIFEST_ENTRY}")))
    }

    /// Compares archived file content with the digests recorded in the manifest.
    pub fn verify_snapshot(&self, archive_path: &Path) -> Result<Vec<DigestMismatch>, SnapshotError> {
        let manifest = self.read_manifest(archive_path)?;
        let mut expected = BTreeMap::new();
        for item in &manifest.dotfiles {
            if let Some(sha) = &item.sha256 {
                if let Ok(name) = archive_name_for(&resolve_target_path(&item.target)) {
                    expected.insert(name, (item.target.clone(), sha.clone()));
                }
            }
        }

        let mut actual = BTreeMap::new();
        let mut archive = open_archive(archive_path)?;
        for entry in archive
            .entries()
            .map_err(|err| corrupt(archive_path, err.to_string()))?
        {
            let mut entry = entry.map_err(|err| corrupt(archive_path, err.to_string()))?;
            let Ok(name) = entry_name(&entry) else {
                continue;
            };
            if !expected.contains_key(&name) {
                continue;
            }
            let mut content = Vec::new();
            entry
                .read_to_end(&mut content)
                .map_err(|err| corrupt(archive_path, err.to_string()))?;
            actual.insert(name, sha256_hex(&content));
        }

        Ok(expected
            .into_iter()
            .filter_map(|(name, (target, sha))| {
                let found = actual.remove(&name);
                (found.as_deref() != Some(sha.as_str())).then_some(DigestMismatch {
                    target,
                    expected: sha,
                    actual: found,
                })
            })
            .collect())
    }

    /// Snapshot archives in the backup directory, oldest first.
    pub fn list_snapshots(&self) -> Result<Vec<PathBuf>, SnapshotError> {
        let entries = match fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!(
                        "failed to read backup directory: {}",
                        self.backup_dir.display()
                    ))
                    .into());
            }
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| {
                format!("failed to iterate backup directory: {}", self.backup_dir.display())
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(ARCHIVE_SUFFIX) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names
            .into_iter()
            .map(|name| self.backup_dir.join(name))
            .collect())
    }

    pub fn latest_snapshot(&self) -> Result<Option<PathBuf>, SnapshotError> {
        Ok(self.list_snapshots()?.pop())
    }

    /// Reserves an unused archive name. Content goes to a `.partial` sibling
    /// that is renamed over the final name once complete.
    fn claim_archive_file(
        &self,
        spec_name: &str,
        timestamp: &str,
    ) -> Result<(PathBuf, PathBuf, File), SnapshotError> {
        let stem = format!("{}_{timestamp}", sanitize_name(spec_name));
        for attempt in 0..1000_u32 {
            let name = if attempt == 0 {
                format!("{stem}{ARCHIVE_SUFFIX}")
            } else {
                format!("{stem}_{attempt:03}{ARCHIVE_SUFFIX}")
            };
            let path = self.backup_dir.join(&name);
            if fs::symlink_metadata(&path).is_ok() {
                continue;
            }
            let partial = self.backup_dir.join(format!("{name}{PARTIAL_SUFFIX}"));
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&partial)
            {
                Ok(file) => return Ok((path, partial, file)),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(anyhow::Error::new(err)
                        .context(format!("failed to create snapshot: {}", partial.display()))
                        .into());
                }
            }
        }
        Err(anyhow::anyhow!("too many snapshots for '{spec_name}' in one second").into())
    }

    fn entry_names(&self, archive_path: &Path) -> Result<Vec<String>, SnapshotError> {
        let mut archive = open_archive(archive_path)?;
        let mut names = Vec::new();
        for entry in archive
            .entries()
            .map_err(|err| corrupt(archive_path, err.to_string()))?
        {
            let entry = entry.map_err(|err| corrupt(archive_path, err.to_string()))?;
            names.push(entry_name(&entry).map_err(|err| corrupt(archive_path, err))?);
        }
        Ok(names)
    }
}

/// Streams every existing target plus the manifest into `file`. Returns the
/// number of archived targets.
fn write_archive(
    file: File,
    effective: &EffectiveSpecification,
    timestamp: String,
    partial: &Path,
) -> Result<usize, SnapshotError> {
    let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(false);

    let mut manifest = SnapshotManifest {
        config_name: effective.name().to_string(),
        timestamp,
        backup_type: "full".to_string(),
        dotfiles: Vec::new(),
    };

    for dotfile in &effective.spec.dotfiles {
        let target = resolve_target_path(&dotfile.target);
        if !target.exists() {
            debug!(target = %target.display(), "target absent, not archived");
            continue;
        }
        let name = match archive_name_for(&target) {
            Ok(name) => name,
            Err(reason) => {
                warn!(target = %target.display(), reason = %reason, "skipping unsafe archive name");
                continue;
            }
        };

        let metadata = fs::symlink_metadata(&target)
            .with_context(|| format!("failed to inspect {}", target.display()))?;
        let is_symlink = metadata.file_type().is_symlink();
        if metadata.is_dir() {
            builder
                .append_dir_all(&name, &target)
                .with_context(|| format!("failed to archive {}", target.display()))?;
        } else {
            builder
                .append_path_with_name(&target, &name)
                .with_context(|| format!("failed to archive {}", target.display()))?;
        }

        let sha256 = if metadata.is_file() {
            Some(sha256_file(&target)?)
        } else {
            None
        };
        let original_path = if is_symlink {
            fs::canonicalize(&target).unwrap_or_else(|_| target.clone())
        } else {
            target.clone()
        };

        manifest.dotfiles.push(ManifestEntry {
            source: dotfile.source.clone(),
            target: dotfile.target.clone(),
            exists: true,
            is_symlink,
            original_path: original_path.to_string_lossy().into_owned(),
            sha256,
        });
    }

    let manifest_bytes =
        serde_json::to_vec_pretty(&manifest).context("failed to serialize snapshot manifest")?;
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(manifest_bytes.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(Utc::now().timestamp().max(0) as u64);
    header.set_cksum();
    builder
        .append_data(&mut header, MANIFEST_ENTRY, manifest_bytes.as_slice())
        .context("failed to append snapshot manifest")?;

    let encoder = builder
        .into_inner()
        .with_context(|| format!("failed to finish archive {}", partial.display()))?;
    encoder
        .finish()
        .with_context(|| format!("failed to finish compression {}", partial.display()))?;

    Ok(manifest.dotfiles.len())
}

fn open_archive(path: &Path) -> Result<Archive<GzDecoder<File>>, SnapshotError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(SnapshotError::NotFound(path.to_path_buf()));
        }
        Err(err) => {
            return Err(anyhow::Error::new(err)
                .context(format!("failed to open snapshot: {}", path.display()))
                .into());
        }
    };
    Ok(Archive::new(GzDecoder::new(file)))
}

fn entry_name<R: Read>(entry: &tar::Entry<'_, R>) -> Result<String, String> {
    let path = entry.path().map_err(|err| err.to_string())?;
    Ok(path
        .to_string_lossy()
        .replace('\\', "/")
        .trim_end_matches('/')
        .to_string())
}

fn owning_target(wanted: &BTreeMap<String, usize>, name: &str) -> Option<usize> {
    wanted.iter().find_map(|(target, index)| {
        let inside = name == target
            || name
                .strip_prefix(target.as_str())
                .is_some_and(|rest| rest.starts_with('/'));
        inside.then_some(*index)
    })
}

/// Symlinks extracted so far in one restore. Later entries beneath them would
/// be written through the link.
#[derive(Default)]
struct RestoredLinks(Vec<PathBuf>);

impl RestoredLinks {
    fn covers(&self, destination: &Path) -> bool {
        self.0
            .iter()
            .any(|link| destination != link && destination.starts_with(link))
    }

    fn note<R: Read>(&mut self, entry: &tar::Entry<'_, R>, destination: PathBuf) {
        if entry.header().entry_type().is_symlink() {
            self.0.push(destination);
        }
    }
}

/// Clears whatever sits at `destination` so the entry does not write through a link.
fn unpack_entry<R: Read>(entry: &mut tar::Entry<'_, R>, destination: &Path) -> anyhow::Result<()> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let entry_is_dir = entry.header().entry_type().is_dir();
    match fs::symlink_metadata(destination) {
        Ok(metadata) if metadata.is_dir() && !metadata.file_type().is_symlink() => {
            if !entry_is_dir {
                fs::remove_dir_all(destination)
                    .with_context(|| format!("failed to clear {}", destination.display()))?;
            }
        }
        Ok(_) => fs::remove_file(destination)
            .with_context(|| format!("failed to clear {}", destination.display()))?,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("failed to inspect {}", destination.display()));
        }
    }

    entry
        .unpack(destination)
        .with_context(|| format!("failed to extract {}", destination.display()))?;
    Ok(())
}

fn corrupt(path: &Path, reason: impl Into<String>) -> SnapshotError {
    SnapshotError::CorruptArchive {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}
