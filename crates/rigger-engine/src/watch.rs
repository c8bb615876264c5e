use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use notify::{Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use crate::reconciler::CancelToken;

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// Lets a run through only when at least `min_interval` has passed since the last one.
#[derive(Debug, Clone)]
pub struct Debouncer {
    min_interval: Duration,
    last_run: Option<Instant>,
}

impl Debouncer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_run: None,
        }
    }

    pub fn should_run(&mut self, now: Instant) -> bool {
        match self.last_run {
            Some(last) if now.saturating_duration_since(last) < self.min_interval => false,
            _ => {
                self.last_run = Some(now);
                true
            }
        }
    }
}

/// True for create or modify events touching one of `watched`.
pub fn is_relevant(event: &Event, watched: &[PathBuf]) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event.paths.iter().any(|path| watched.contains(path))
}

/// Polls the directories holding `documents` and calls `on_change` after each
/// debounced change to any of them, until `stop` is cancelled. An error from
/// `on_change` is logged and watching continues.
pub fn watch_documents(
    documents: &[PathBuf],
    debounce: Duration,
    stop: &CancelToken,
    mut on_change: impl FnMut() -> Result<()>,
) -> Result<()> {
    let watched: Vec<PathBuf> = documents.iter().map(|path| absolute_document(path)).collect();
    let directories: BTreeSet<PathBuf> = watched
        .iter()
        .filter_map(|path| path.parent().map(Path::to_path_buf))
        .collect();

    let (tx, rx) = mpsc::channel::<Event>();
    let mut watcher = PollWatcher::new(
        move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        },
        notify::Config::default().with_poll_interval(POLL_INTERVAL),
    )
    .context("failed to start file watcher")?;
    for directory in &directories {
        watcher
            .watch(directory, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", directory.display()))?;
        info!(path = %directory.display(), "watching for specification changes");
    }

    let mut debouncer = Debouncer::new(debounce);
    loop {
        if stop.is_cancelled() {
            return Ok(());
        }
        match rx.recv_timeout(STOP_CHECK_INTERVAL) {
            Ok(event) => {
                if !is_relevant(&event, &watched) {
                    continue;
                }
                if !debouncer.should_run(Instant::now()) {
                    debug!(paths = ?event.paths, "change ignored inside debounce window");
                    continue;
                }
                info!(paths = ?event.paths, "specification changed");
                if let Err(err) = on_change() {
                    warn!(error = %format!("{err:#}"), "run after change failed");
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => bail!("file watcher stopped unexpectedly"),
        }
    }
}

fn absolute_document(path: &Path) -> PathBuf {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let parent = fs::canonicalize(&parent).unwrap_or(parent);
    match path.file_name() {
        Some(name) => parent.join(name),
        None => parent,
    }
}
