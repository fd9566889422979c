//! Filesystem watching for scan folders. One recursive watcher feeds a
//! channel; the loading thread drains it once per cycle and classifies the
//! changes against the folders it currently cares about.

use std::path::{Path, PathBuf};

use crossbeam_channel::{Receiver, Sender};
use notify::event::{EventKind, Flag, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Deleted,
    Modified,
    Renamed,
}

/// One changed subpath under a watched folder.
#[derive(Debug)]
pub struct FolderChange {
    pub folder: PathBuf,
    /// Relative to `folder`; empty when the folder itself changed.
    pub subpath: PathBuf,
    pub kind: ChangeKind,
}

/// Everything one poll of the watcher produced.
#[derive(Debug, Default)]
pub struct WatchUpdate {
    pub changes: Vec<FolderChange>,
    /// Folders for which the backend lost track of deltas and a full
    /// rescan is the only safe response.
    pub rescan_folders: Vec<PathBuf>,
    pub errors: Vec<notify::Error>,
}

pub struct FolderWatcher {
    watcher: RecommendedWatcher,
    events: Receiver<Result<notify::Event, notify::Error>>,
    watched: Vec<PathBuf>,
}

impl FolderWatcher {
    pub fn new() -> Result<Self, notify::Error> {
        let (tx, rx): (Sender<_>, Receiver<_>) = crossbeam_channel::unbounded();
        let watcher = RecommendedWatcher::new(
            move |event| {
                let _ = tx.send(event);
            },
            notify::Config::default(),
        )?;
        Ok(Self {
            watcher,
            events: rx,
            watched: Vec::new(),
        })
    }

    /// Bring the watched set in line with `desired`. Folders that fail to
    /// watch are reported and simply left unwatched; the periodic wake
    /// timeout covers them via rescans elsewhere.
    pub fn sync_watched(&mut self, desired: &[PathBuf]) -> Vec<(PathBuf, notify::Error)> {
        let mut failures = Vec::new();

        let to_remove: Vec<PathBuf> = self
            .watched
            .iter()
            .filter(|w| !desired.contains(w))
            .cloned()
            .collect();
        for path in to_remove {
            let _ = self.watcher.unwatch(&path);
            self.watched.retain(|w| w != &path);
            tracing::debug!(path = %path.display(), "stopped watching folder");
        }

        for path in desired {
            if self.watched.contains(path) {
                continue;
            }
            match self.watcher.watch(path, RecursiveMode::Recursive) {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), "watching folder");
                    self.watched.push(path.clone());
                }
                Err(e) => failures.push((path.clone(), e)),
            }
        }
        failures
    }

    /// Drain queued backend events and attribute each path to its watched
    /// folder. Paths outside every watched folder (races around unwatch)
    /// are dropped.
    pub fn poll(&mut self) -> WatchUpdate {
        let mut update = WatchUpdate::default();
        while let Ok(event) = self.events.try_recv() {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    update.errors.push(e);
                    continue;
                }
            };
            if event.flag() == Some(Flag::Rescan) {
                update.rescan_folders.extend(self.watched.iter().cloned());
                continue;
            }
            let Some(kind) = classify(&event.kind) else {
                continue;
            };
            for path in &event.paths {
                if let Some(folder) = self.owning_folder(path) {
                    let subpath = path
                        .strip_prefix(&folder)
                        .map(Path::to_path_buf)
                        .unwrap_or_default();
                    update.changes.push(FolderChange {
                        folder,
                        subpath,
                        kind,
                    });
                }
            }
        }
        update
    }

    fn owning_folder(&self, path: &Path) -> Option<PathBuf> {
        // Longest matching prefix wins so nested watch roots attribute
        // correctly.
        self.watched
            .iter()
            .filter(|w| path.starts_with(w))
            .max_by_key(|w| w.components().count())
            .cloned()
    }
}

/// Map a backend event kind onto the four changes the rescan logic cares
/// about. Access/metadata noise maps to nothing.
pub fn classify(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Added),
        EventKind::Remove(_) => Some(ChangeKind::Deleted),
        EventKind::Modify(ModifyKind::Name(_)) => Some(ChangeKind::Renamed),
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(_) => Some(ChangeKind::Modified),
        EventKind::Access(_) => None,
        EventKind::Any | EventKind::Other => None,
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::{Duration, Instant};

    use notify::event::{AccessKind, CreateKind, DataChange, MetadataKind, RenameMode};

    use super::*;

    #[test]
    fn classification_covers_the_interesting_kinds() {
        assert_eq!(
            classify(&EventKind::Create(CreateKind::File)),
            Some(ChangeKind::Added)
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Data(DataChange::Content))),
            Some(ChangeKind::Modified)
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Name(RenameMode::Any))),
            Some(ChangeKind::Renamed)
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any))),
            None
        );
        assert_eq!(classify(&EventKind::Access(AccessKind::Any)), None);
    }

    #[test]
    fn watched_set_diffs_cleanly() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let mut watcher = FolderWatcher::new().unwrap();

        let failures =
            watcher.sync_watched(&[a.path().to_path_buf(), b.path().to_path_buf()]);
        assert!(failures.is_empty());
        assert_eq!(watcher.watched.len(), 2);

        let failures = watcher.sync_watched(&[b.path().to_path_buf()]);
        assert!(failures.is_empty());
        assert_eq!(watcher.watched, vec![b.path().to_path_buf()]);

        let missing = a.path().join("gone-subdir");
        let failures = watcher.sync_watched(&[missing]);
        assert_eq!(failures.len(), 1);
    }

    #[test]
    fn changes_arrive_for_watched_folders() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = FolderWatcher::new().unwrap();
        assert!(watcher.sync_watched(&[dir.path().to_path_buf()]).is_empty());

        fs::write(dir.path().join("new.mdata"), b"x").unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let update = watcher.poll();
            if update
                .changes
                .iter()
                .any(|c| c.subpath == Path::new("new.mdata"))
            {
                break;
            }
            assert!(Instant::now() < deadline, "no event for created file");
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}
