//! The library registry: every scanned library currently alive, the shared
//! name index other threads read through, and the deferred-deletion list
//! for libraries that were replaced or orphaned while still in use.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use resona_library::{builtin_library, Library, BUILTIN_LIBRARY_NAME};

use crate::instruments::InstrumentCache;
use crate::scan::{FolderState, ScanFolder};

pub struct ListedLibrary {
    pub library: Arc<Library>,
    /// Outstanding reader handles plus one per cached instrument. Nonzero
    /// keeps a retired library alive.
    pub reader_uses: Arc<AtomicU32>,
    /// Locked only by the loading thread; a plain mutex keeps the struct
    /// shareable through the name index.
    pub instruments: Mutex<InstrumentCache>,
}

impl ListedLibrary {
    fn new(library: Library) -> Arc<Self> {
        Arc::new(Self {
            library: Arc::new(library),
            reader_uses: Arc::new(AtomicU32::new(0)),
            instruments: Mutex::new(InstrumentCache::default()),
        })
    }

    pub fn in_use(&self) -> bool {
        self.reader_uses.load(Ordering::Acquire) > 0
    }
}

pub struct LibraryRegistry {
    active: Vec<Arc<ListedLibrary>>,
    /// Replaced or orphaned libraries waiting for their readers to finish.
    retired: Vec<Arc<ListedLibrary>>,
    /// Name index shared with client threads; rebuilt whenever the active
    /// set changes.
    by_name: Arc<Mutex<HashMap<String, Arc<ListedLibrary>>>>,
}

impl LibraryRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            active: Vec::new(),
            retired: Vec::new(),
            by_name: Arc::new(Mutex::new(HashMap::new())),
        };
        registry.install(builtin_library());
        registry
    }

    pub fn shared_index(&self) -> Arc<Mutex<HashMap<String, Arc<ListedLibrary>>>> {
        Arc::clone(&self.by_name)
    }

    /// Register a freshly-read library. Any active library with the same
    /// name or the same descriptor path is superseded (hot reload) and
    /// retired until its readers let go.
    pub fn install(&mut self, library: Library) -> Arc<ListedLibrary> {
        let (mut keep, replaced): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.active).into_iter().partition(|l| {
                l.library.name != library.name && l.library.path != library.path
            });
        for old in replaced {
            tracing::info!(name = %old.library.name, "retiring superseded library");
            self.retired.push(old);
        }
        let listed = ListedLibrary::new(library);
        keep.push(Arc::clone(&listed));
        self.active = keep;
        self.rebuild_index();
        listed
    }

    pub fn find(&self, name: &str) -> Option<&Arc<ListedLibrary>> {
        self.active.iter().find(|l| l.library.name == name)
    }

    pub fn active(&self) -> &[Arc<ListedLibrary>] {
        &self.active
    }

    pub fn active_hashes(&self) -> Vec<u64> {
        self.active.iter().map(|l| l.library.file_hash).collect()
    }

    /// Retire every library whose descriptor no longer sits under any
    /// current scan folder. The built-in library is never an orphan. Only
    /// folders that have actually completed a scan are considered: a folder
    /// mid-rescan must not orphan its own libraries.
    pub fn retire_orphans(&mut self, folders: &[ScanFolder]) {
        let any_unsettled = folders.iter().any(|f| {
            !matches!(
                f.state,
                FolderState::ScannedSuccessfully | FolderState::ScanFailed
            )
        });
        if any_unsettled {
            return;
        }
        let (keep, orphans): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.active).into_iter().partition(|l| {
                l.library.name == BUILTIN_LIBRARY_NAME
                    || folders.iter().any(|f| l.library.path.starts_with(&f.path))
            });
        let changed = !orphans.is_empty();
        for orphan in orphans {
            tracing::info!(name = %orphan.library.name, "retiring orphaned library");
            self.retired.push(orphan);
        }
        self.active = keep;
        if changed {
            self.rebuild_index();
        }
    }

    /// Drop retired libraries once nothing reads them any more.
    pub fn collect_garbage(&mut self) {
        for listed in &self.active {
            listed.instruments.lock().collect_garbage();
        }
        for listed in &self.retired {
            listed.instruments.lock().collect_garbage();
        }
        self.retired.retain(|l| {
            if l.in_use() {
                true
            } else {
                tracing::debug!(name = %l.library.name, "dropping retired library");
                false
            }
        });
    }

    pub fn num_retired(&self) -> usize {
        self.retired.len()
    }

    fn rebuild_index(&self) {
        let mut index = self.by_name.lock();
        index.clear();
        for listed in &self.active {
            index.insert(listed.library.name.clone(), Arc::clone(listed));
        }
    }
}

impl Default for LibraryRegistry {
    fn default() -> Self {
        Self::new()
    }
}
