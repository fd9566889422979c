//! The server: public client API plus the single loading thread that owns
//! every registry and cache. Client threads only push requests, pop
//! results, and take ref-counted handles; the loading thread does all the
//! mutation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use resona_library::{ImpulseResponse, Library};

use crate::channel::{
    AsyncCommsChannel, LoadOutcome, LoadRequest, LoadResult, LoadedInstrument, LoadedIr,
    RequestId, NUM_LAYERS,
};
use crate::error::LoadError;
use crate::instruments::ListedInstrument;
use crate::jobs::JobRunner;
use crate::notifications::{notification_id, ErrorNotifications, Notification};
use crate::pool::{JobCountdown, ThreadPoolContext};
use crate::refs::{Retained, WorkSignaller};
use crate::registry::{LibraryRegistry, ListedLibrary};
use crate::scan::{
    self, FolderSource, FolderState, JobOutcome, LibraryLocation, ReadResult, ScanFolder,
};
use crate::state::LoadingState;
use crate::store::{self, AudioStore, ListedAudioData};
use crate::watch::{ChangeKind, FolderWatcher};

const WAKE_TIMEOUT: Duration = Duration::from_millis(250);
const LOADING_THREAD_NAME: &str = "sample-lib-load";

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("failed to spawn loading thread: {0}")]
    Thread(#[from] std::io::Error),
}

pub struct ServerConfig {
    /// Folders scanned for the server's lifetime (the host's install
    /// locations). The user's extra folders come and go via
    /// [`Server::set_extra_scan_folders`].
    pub always_scanned_folders: Vec<PathBuf>,
    /// Sink for scan/read errors not tied to any one request.
    pub error_notifications: Arc<ErrorNotifications>,
    /// Worker threads for decode/scan/read jobs. `None` lets rayon decide.
    pub num_worker_threads: Option<usize>,
}

/// Point-in-time counters, readable from any thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub instruments_cached: u64,
    pub audio_entries: u64,
    pub audio_bytes: u64,
}

/// Structured answer to [`Server::state_snapshot`].
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub libraries: Vec<LibrarySnapshot>,
    pub folders: Vec<FolderSnapshot>,
    pub num_retired_libraries: usize,
    pub num_audio_entries: usize,
    pub num_pending_requests: usize,
    pub num_channels: usize,
    pub stats: Stats,
}

#[derive(Debug, Clone)]
pub struct LibrarySnapshot {
    pub name: String,
    pub path: PathBuf,
    pub file_hash: u64,
    pub num_instruments: usize,
    pub num_cached_instruments: usize,
    pub reader_uses: u32,
}

#[derive(Debug, Clone)]
pub struct FolderSnapshot {
    pub path: PathBuf,
    pub source: FolderSource,
    pub state: FolderState,
}

struct QueuedRequest {
    id: RequestId,
    channel: Arc<AsyncCommsChannel>,
    request: LoadRequest,
}

struct ServerShared {
    requests: SegQueue<QueuedRequest>,
    channels: Mutex<Vec<Arc<AsyncCommsChannel>>>,
    /// `Some` when the extra-folder set changed since the loading thread
    /// last looked.
    extra_folders: Mutex<Option<Vec<PathBuf>>>,
    libraries_by_name: Arc<Mutex<HashMap<String, Arc<ListedLibrary>>>>,
    snapshot_queries: SegQueue<crossbeam_channel::Sender<StateSnapshot>>,
    error_notifications: Arc<ErrorNotifications>,
    signaller: WorkSignaller,
    end: AtomicBool,
    next_request_id: AtomicU64,
    instruments_cached: AtomicU64,
    audio_entries: AtomicU64,
    audio_bytes: AtomicU64,
}

pub struct Server {
    shared: Arc<ServerShared>,
    thread: Option<JoinHandle<()>>,
}

impl Server {
    pub fn start(config: ServerConfig) -> Result<Self, StartError> {
        let mut pool = rayon::ThreadPoolBuilder::new().thread_name(|i| format!("sample-lib-{i}"));
        if let Some(n) = config.num_worker_threads {
            pool = pool.num_threads(n);
        }
        let ctx = ThreadPoolContext {
            pool: Arc::new(pool.build()?),
            jobs: Arc::new(JobCountdown::new()),
            signaller: WorkSignaller::new(),
        };

        let registry = LibraryRegistry::new();
        let shared = Arc::new(ServerShared {
            requests: SegQueue::new(),
            channels: Mutex::new(Vec::new()),
            extra_folders: Mutex::new(None),
            libraries_by_name: registry.shared_index(),
            snapshot_queries: SegQueue::new(),
            error_notifications: config.error_notifications,
            signaller: ctx.signaller.clone(),
            end: AtomicBool::new(false),
            next_request_id: AtomicU64::new(1),
            instruments_cached: AtomicU64::new(0),
            audio_entries: AtomicU64::new(0),
            audio_bytes: AtomicU64::new(0),
        });

        let folders = config
            .always_scanned_folders
            .into_iter()
            .map(|path| ScanFolder::new(path, FolderSource::AlwaysScanned))
            .collect();

        let mut thread_state = LoadingThread {
            shared: Arc::clone(&shared),
            ctx,
            registry,
            audio_store: AudioStore::default(),
            folders,
            jobs: JobRunner::new(),
            watcher: None,
            watcher_failed: false,
            pending: Vec::new(),
        };
        let thread = std::thread::Builder::new()
            .name(LOADING_THREAD_NAME.into())
            .spawn(move || thread_state.run())?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Open a channel for one client. `callback` runs on the loading thread
    /// whenever a result lands; treat it as an interrupt and do not block.
    pub fn open_async_comms_channel(
        &self,
        error_notifications: Arc<ErrorNotifications>,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Arc<AsyncCommsChannel> {
        let channel = AsyncCommsChannel::new(error_notifications, Box::new(callback));
        self.shared.channels.lock().push(Arc::clone(&channel));
        channel
    }

    /// Mark closed and drop everything queued. Outstanding requests on the
    /// channel resolve as cancelled; the channel object is reclaimed by the
    /// loading thread's next garbage-collection pass.
    pub fn close_async_comms_channel(&self, channel: &Arc<AsyncCommsChannel>) {
        channel.retire();
        self.shared.signaller.signal();
    }

    /// Queue a load and wake the loading thread. Never blocks.
    pub fn send_async_load_request(
        &self,
        channel: &Arc<AsyncCommsChannel>,
        request: LoadRequest,
    ) -> RequestId {
        if let LoadRequest::Instrument { layer, .. } = &request {
            assert!(*layer < NUM_LAYERS, "layer out of range");
        }
        let id = self.shared.next_request_id.fetch_add(1, Ordering::AcqRel);
        self.shared.requests.push(QueuedRequest {
            id,
            channel: Arc::clone(channel),
            request,
        });
        self.shared.signaller.signal();
        id
    }

    /// Replace the user's extra scan folders. Newly-listed folders are
    /// scanned shortly after; libraries from delisted folders are retired
    /// once unreferenced.
    pub fn set_extra_scan_folders(&self, folders: Vec<PathBuf>) {
        *self.shared.extra_folders.lock() = Some(folders);
        self.shared.signaller.signal();
    }

    /// Ref-counted handles to every currently-registered library.
    pub fn all_libraries_retained(&self) -> Vec<Retained<Library>> {
        let index = self.shared.libraries_by_name.lock();
        index.values().map(|l| self.retain_library(l)).collect()
    }

    pub fn find_library_retained(&self, name: &str) -> Option<Retained<Library>> {
        let index = self.shared.libraries_by_name.lock();
        index.get(name).map(|l| self.retain_library(l))
    }

    pub fn stats(&self) -> Stats {
        Stats {
            instruments_cached: self.shared.instruments_cached.load(Ordering::Acquire),
            audio_entries: self.shared.audio_entries.load(Ordering::Acquire),
            audio_bytes: self.shared.audio_bytes.load(Ordering::Acquire),
        }
    }

    /// Ask the loading thread for a structured view of its state. Blocks
    /// until the next orchestration pass answers; `None` only if the server
    /// is shutting down.
    pub fn state_snapshot(&self) -> Option<StateSnapshot> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.shared.snapshot_queries.push(tx);
        self.shared.signaller.signal();
        rx.recv().ok()
    }

    fn retain_library(&self, listed: &Arc<ListedLibrary>) -> Retained<Library> {
        Retained::retain(
            Arc::clone(&listed.library),
            Arc::clone(&listed.reader_uses),
            Some(self.shared.signaller.clone()),
        )
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shared.end.store(true, Ordering::Release);
        self.shared.signaller.signal();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

enum Phase {
    AwaitingLibrary,
    InstrumentLoading {
        library: Arc<Library>,
        instrument: Retained<ListedInstrument>,
        layer: usize,
    },
    IrLoading {
        ir: ImpulseResponse,
        audio: Retained<ListedAudioData>,
    },
}

struct PendingRequest {
    id: RequestId,
    channel: Arc<AsyncCommsChannel>,
    request: LoadRequest,
    phase: Phase,
}

struct LoadingThread {
    shared: Arc<ServerShared>,
    ctx: ThreadPoolContext,
    registry: LibraryRegistry,
    audio_store: AudioStore,
    folders: Vec<ScanFolder>,
    jobs: JobRunner<JobOutcome>,
    watcher: Option<FolderWatcher>,
    watcher_failed: bool,
    pending: Vec<PendingRequest>,
}

impl LoadingThread {
    fn run(&mut self) {
        tracing::debug!("loading thread started");
        loop {
            self.ctx.signaller.wait(WAKE_TIMEOUT);
            loop {
                self.drain_requests();
                self.update_folders_and_jobs();
                self.advance_pending();
                self.answer_snapshots();
                if self.settled() || self.shared.end.load(Ordering::Acquire) {
                    break;
                }
                self.ctx.signaller.wait(WAKE_TIMEOUT);
            }
            self.ctx.jobs.wait_until_zero();
            self.collect_garbage();
            if self.shared.end.load(Ordering::Acquire) {
                break;
            }
        }

        // Shutdown: cancel what we can, then drain so no job outlives the
        // stores it writes into.
        for request in std::mem::take(&mut self.pending) {
            if let Phase::InstrumentLoading { instrument, .. } = &request.phase {
                store::cancel_audio_if_unshared(&instrument.audio_data_set);
            }
        }
        self.ctx.jobs.wait_until_zero();
        self.collect_garbage();
        tracing::debug!("loading thread stopped");
    }

    /// True when there is nothing left for this burst: no pending request,
    /// no outstanding job, every folder settled.
    fn settled(&self) -> bool {
        self.pending.is_empty() && self.jobs.num_outstanding() == 0 && self.folders_settled()
    }

    /// NotScanned counts as settled: a folder no one has asked about yet is
    /// dormant, not in flight. Requests flip it before they are advanced.
    fn folders_settled(&self) -> bool {
        self.folders.iter().all(|f| {
            !matches!(
                f.state,
                FolderState::RescanRequested | FolderState::Scanning
            )
        })
    }

    fn drain_requests(&mut self) {
        let mut any = false;
        while let Some(queued) = self.shared.requests.pop() {
            any = true;
            self.pending.push(PendingRequest {
                id: queued.id,
                channel: queued.channel,
                request: queued.request,
                phase: Phase::AwaitingLibrary,
            });
        }
        if any {
            // The first interest in any library triggers the initial scans.
            for folder in &mut self.folders {
                if folder.state == FolderState::NotScanned {
                    folder.state = FolderState::RescanRequested;
                }
            }
        }
    }

    fn update_folders_and_jobs(&mut self) {
        self.sync_extra_folders();
        self.dispatch_requested_scans();
        self.handle_job_outcomes();
        self.poll_watcher();
        self.registry.retire_orphans(&self.folders);
    }

    fn sync_extra_folders(&mut self) {
        let Some(extra) = self.shared.extra_folders.lock().take() else {
            return;
        };
        self.folders.retain(|f| {
            f.source == FolderSource::AlwaysScanned || extra.contains(&f.path)
        });
        for path in extra {
            if !self.folders.iter().any(|f| f.path == path) {
                let mut folder = ScanFolder::new(path, FolderSource::ExtraFolder);
                folder.state = FolderState::RescanRequested;
                self.folders.push(folder);
            }
        }
    }

    fn dispatch_requested_scans(&mut self) {
        for folder in &mut self.folders {
            if folder.state != FolderState::RescanRequested {
                continue;
            }
            folder.state = FolderState::Scanning;
            let path = folder.path.clone();
            self.jobs.spawn(&self.ctx, move || {
                let result = scan::scan_folder(&path);
                JobOutcome::FolderScanned {
                    folder: path,
                    result,
                }
            });
        }
    }

    fn handle_job_outcomes(&mut self) {
        for outcome in self.jobs.drain_completed() {
            match outcome {
                JobOutcome::FolderScanned { folder, result } => {
                    self.handle_scan_outcome(folder, result)
                }
                JobOutcome::LibraryRead { location, result } => {
                    self.handle_read_outcome(location, result)
                }
            }
        }
    }

    fn handle_scan_outcome(
        &mut self,
        folder_path: PathBuf,
        result: std::io::Result<Vec<LibraryLocation>>,
    ) {
        let folder_text = folder_path.to_string_lossy().into_owned();
        let scan_error_id = notification_id("libs", &folder_text);
        match result {
            Ok(locations) => {
                if let Some(folder) = self.folders.iter_mut().find(|f| f.path == folder_path) {
                    folder.state = FolderState::ScannedSuccessfully;
                }
                self.shared.error_notifications.remove(scan_error_id);
                for location in locations {
                    self.dispatch_read(location);
                }
            }
            Err(e) => {
                tracing::warn!(folder = %folder_path.display(), error = %e, "folder scan failed");
                if let Some(folder) = self.folders.iter_mut().find(|f| f.path == folder_path) {
                    folder.state = FolderState::ScanFailed;
                }
                self.shared.error_notifications.add_or_update(Notification {
                    title: "Failed to scan sample library folder".into(),
                    message: folder_text,
                    error: Some(e.to_string()),
                    id: scan_error_id,
                });
            }
        }
    }

    fn dispatch_read(&mut self, location: LibraryLocation) {
        let known_hashes = self.registry.active_hashes();
        self.jobs
            .spawn(&self.ctx, move || scan::read_library_job(location, known_hashes));
    }

    fn handle_read_outcome(&mut self, location: LibraryLocation, result: ReadResult) {
        let path_text = location.path.to_string_lossy().into_owned();
        let read_error_id = notification_id("lib ", &path_text);
        match result {
            ReadResult::Loaded(library) => {
                self.shared.error_notifications.remove(read_error_id);
                self.registry.install(*library);
            }
            ReadResult::UnchangedHash(_) => {
                self.shared.error_notifications.remove(read_error_id);
            }
            ReadResult::Failed(e) => {
                // A vanished file is the watcher's business, not an error:
                // the following rescan drops the library.
                if e.is_path_missing() {
                    return;
                }
                tracing::warn!(path = %location.path.display(), error = %e, "library read failed");
                self.shared.error_notifications.add_or_update(Notification {
                    title: "Failed to read sample library".into(),
                    message: path_text,
                    error: Some(e.to_string()),
                    id: read_error_id,
                });
            }
        }
    }

    fn poll_watcher(&mut self) {
        if self.watcher.is_none() && !self.watcher_failed {
            match FolderWatcher::new() {
                Ok(watcher) => self.watcher = Some(watcher),
                Err(e) => {
                    self.watcher_failed = true;
                    tracing::warn!(error = %e, "folder watcher unavailable");
                    self.shared.error_notifications.add_or_update(Notification {
                        title: "Sample library folders will not auto-refresh".into(),
                        message: "Changes on disk are picked up after restart.".into(),
                        error: Some(e.to_string()),
                        id: notification_id("libw", "watcher"),
                    });
                }
            }
        }
        let Some(watcher) = &mut self.watcher else {
            return;
        };

        let watchable: Vec<PathBuf> = self
            .folders
            .iter()
            .filter(|f| f.state == FolderState::ScannedSuccessfully)
            .map(|f| f.path.clone())
            .collect();
        for (path, e) in watcher.sync_watched(&watchable) {
            tracing::warn!(path = %path.display(), error = %e, "failed to watch folder");
        }

        let update = watcher.poll();
        for e in update.errors {
            tracing::warn!(error = %e, "watcher error");
        }
        for folder_path in update.rescan_folders {
            self.request_rescan(&folder_path);
        }
        for change in update.changes {
            self.apply_folder_change(&change.folder, &change.subpath, change.kind);
        }
    }

    fn request_rescan(&mut self, folder_path: &std::path::Path) {
        if let Some(folder) = self.folders.iter_mut().find(|f| f.path == folder_path) {
            if folder.state == FolderState::ScannedSuccessfully
                || folder.state == FolderState::ScanFailed
            {
                folder.state = FolderState::RescanRequested;
            }
        }
    }

    /// Route one watched change: a touched library descriptor re-reads just
    /// that library, a change inside a scripted library's directory
    /// re-reads it too, anything else rescans the whole folder.
    fn apply_folder_change(
        &mut self,
        folder: &std::path::Path,
        subpath: &std::path::Path,
        kind: ChangeKind,
    ) {
        let full_path = folder.join(subpath);

        if kind == ChangeKind::Modified && subpath.components().count() == 1 {
            if let Some(listed) = self
                .registry
                .active()
                .iter()
                .find(|l| l.library.path == full_path)
            {
                let location = LibraryLocation {
                    path: full_path,
                    format: listed.library.format,
                };
                self.dispatch_read(location);
                return;
            }
        }

        if let Some(listed) = self.registry.active().iter().find(|l| {
            l.library
                .path
                .parent()
                .is_some_and(|dir| dir != folder && full_path.starts_with(dir))
        }) {
            let location = LibraryLocation {
                path: listed.library.path.clone(),
                format: listed.library.format,
            };
            self.dispatch_read(location);
            return;
        }

        self.request_rescan(folder);
    }

    fn advance_pending(&mut self) {
        let mut pending = std::mem::take(&mut self.pending);
        pending.retain_mut(|request| {
            let outcome = self.advance_one(request);
            match outcome {
                Some(outcome) => {
                    self.finish_request(request, outcome);
                    false
                }
                None => true,
            }
        });
        self.pending = pending;
    }

    fn advance_one(&mut self, request: &mut PendingRequest) -> Option<LoadOutcome> {
        if !request.channel.is_used() {
            if let Phase::InstrumentLoading { instrument, .. } = &request.phase {
                if !self.desired_by_any_channel(&instrument.shared()) {
                    store::cancel_audio_if_unshared(&instrument.audio_data_set);
                }
            }
            return Some(LoadOutcome::Cancelled);
        }
        match request.phase {
            Phase::AwaitingLibrary => self.advance_awaiting_library(request),
            Phase::InstrumentLoading { .. } => self.advance_instrument(request),
            Phase::IrLoading { .. } => self.advance_ir(request),
        }
    }

    fn advance_awaiting_library(&mut self, request: &mut PendingRequest) -> Option<LoadOutcome> {
        let library_name = match &request.request {
            LoadRequest::Instrument { library, .. } | LoadRequest::ImpulseResponse { library, .. } => {
                library.clone()
            }
        };
        let Some(listed) = self.registry.find(&library_name).cloned() else {
            // Still scanning or reading? Then the library may yet appear.
            // Undrained outcomes count too: a finished read job may install
            // this very library on the next drain.
            if self.jobs.num_outstanding() > 0 || !self.folders_settled() {
                return None;
            }
            return Some(LoadOutcome::Error(LoadError::LibraryNotFound(library_name)));
        };

        match &request.request {
            LoadRequest::Instrument { name, layer, .. } => {
                let created = listed.instruments.lock().fetch_or_create(
                    &listed.library,
                    &listed.reader_uses,
                    name,
                    &mut self.audio_store,
                    &self.ctx,
                );
                match created {
                    Ok(instrument) => {
                        self.assign_layer(&request.channel, *layer, &instrument);
                        request.channel.set_loading_percent(*layer, Some(0));
                        let refs = Arc::clone(&instrument.refs);
                        request.phase = Phase::InstrumentLoading {
                            library: Arc::clone(&listed.library),
                            instrument: Retained::retain(instrument, refs, None),
                            layer: *layer,
                        };
                        None
                    }
                    Err(e) => Some(LoadOutcome::Error(e)),
                }
            }
            LoadRequest::ImpulseResponse { name, .. } => {
                let Some(ir) = listed.library.irs_by_name.get(name).cloned() else {
                    return Some(LoadOutcome::Error(LoadError::IrNotFound(name.clone())));
                };
                let entry = self
                    .audio_store
                    .fetch_or_create(&listed.library, &ir.path, &self.ctx);
                let refs = Arc::clone(&entry.refs);
                request.phase = Phase::IrLoading {
                    ir,
                    audio: Retained::retain(entry, refs, None),
                };
                None
            }
        }
    }

    /// Publish the new desired instrument for a layer. The instrument the
    /// slot previously held gets its audio cancelled if nothing else wants
    /// it any more.
    fn assign_layer(
        &self,
        channel: &Arc<AsyncCommsChannel>,
        layer: usize,
        instrument: &Arc<ListedInstrument>,
    ) {
        let previous = {
            let mut slots = channel.desired_instruments.lock();
            std::mem::replace(&mut slots[layer], Some(Arc::downgrade(instrument)))
        };
        if let Some(previous) = previous.and_then(|w| w.upgrade()) {
            if !Arc::ptr_eq(&previous, instrument) && !self.desired_by_any_channel(&previous) {
                store::cancel_audio_if_unshared(&previous.audio_data_set);
            }
        }
    }

    fn desired_by_any_channel(&self, instrument: &Arc<ListedInstrument>) -> bool {
        let target = Arc::as_ptr(instrument);
        let channels = self.shared.channels.lock();
        channels.iter().filter(|c| c.is_used()).any(|channel| {
            channel
                .desired_instruments
                .lock()
                .iter()
                .flatten()
                .any(|slot| Weak::as_ptr(slot) == target)
        })
    }

    fn advance_instrument(&mut self, request: &mut PendingRequest) -> Option<LoadOutcome> {
        let Phase::InstrumentLoading {
            library,
            instrument,
            layer,
        } = &request.phase
        else {
            return None;
        };
        let layer = *layer;

        let still_desired = {
            let slots = request.channel.desired_instruments.lock();
            slots[layer]
                .as_ref()
                .is_some_and(|slot| Weak::as_ptr(slot) == Arc::as_ptr(&instrument.shared()))
        };
        if !still_desired {
            if !self.desired_by_any_channel(&instrument.shared()) {
                store::cancel_audio_if_unshared(&instrument.audio_data_set);
            }
            return Some(LoadOutcome::Cancelled);
        }

        let mut completed = 0usize;
        for entry in &instrument.audio_data_set {
            match entry.state.load() {
                LoadingState::CompletedSuccessfully => completed += 1,
                LoadingState::CompletedWithError => {
                    let error = entry
                        .error()
                        .cloned()
                        .unwrap_or_else(|| LoadError::InstrumentNotFound(String::new()));
                    store::cancel_audio_if_unshared(&instrument.audio_data_set);
                    return Some(LoadOutcome::Error(error));
                }
                LoadingState::PendingCancel
                | LoadingState::CompletedCancelled => {
                    // Still wanted; a racing supersede cancelled it.
                    store::trigger_reload_if_cancelled(entry, library, &self.ctx);
                }
                LoadingState::PendingLoad | LoadingState::Loading => {}
            }
        }

        let total = instrument.audio_data_set.len().max(1);
        if completed == instrument.audio_data_set.len() {
            let loaded = Self::materialize_instrument(instrument)?;
            return Some(LoadOutcome::Instrument(Retained::retain(
                Arc::new(loaded),
                Arc::clone(&instrument.refs),
                Some(self.shared.signaller.clone()),
            )));
        }
        let percent = (completed * 100 / total) as u32;
        request.channel.set_loading_percent(layer, Some(percent));
        None
    }

    fn materialize_instrument(listed: &Retained<ListedInstrument>) -> Option<LoadedInstrument> {
        let mut audio = Vec::with_capacity(listed.audio_by_region.len());
        for entry in &listed.audio_by_region {
            audio.push(Arc::clone(entry.audio()?));
        }
        let waveform = listed.instrument.waveform_path.as_ref().and_then(|wanted| {
            listed
                .instrument
                .regions
                .iter()
                .position(|r| &r.path == wanted)
                .map(|i| Arc::clone(&audio[i]))
        });
        Some(LoadedInstrument {
            instrument: Arc::clone(&listed.instrument),
            audio,
            waveform,
        })
    }

    fn advance_ir(&self, request: &mut PendingRequest) -> Option<LoadOutcome> {
        let Phase::IrLoading { ir, audio } = &request.phase else {
            return None;
        };
        match audio.state.load() {
            LoadingState::CompletedSuccessfully => {
                let decoded = Arc::clone(audio.audio()?);
                Some(LoadOutcome::ImpulseResponse(Retained::retain(
                    Arc::new(LoadedIr {
                        ir: ir.clone(),
                        audio: decoded,
                    }),
                    Arc::clone(&audio.refs),
                    Some(self.shared.signaller.clone()),
                )))
            }
            LoadingState::CompletedWithError => Some(LoadOutcome::Error(
                audio
                    .error()
                    .cloned()
                    .unwrap_or_else(|| LoadError::IrNotFound(ir.name.clone())),
            )),
            LoadingState::PendingCancel
            | LoadingState::CompletedCancelled => Some(LoadOutcome::Cancelled),
            LoadingState::PendingLoad | LoadingState::Loading => None,
        }
    }

    fn finish_request(&self, request: &PendingRequest, outcome: LoadOutcome) {
        if let LoadRequest::Instrument { layer, .. } = &request.request {
            request.channel.set_loading_percent(*layer, None);
        }
        match &outcome {
            LoadOutcome::Error(e) => {
                tracing::debug!(id = request.id, error = %e, "request failed");
                self.notify_request_error(request, e);
            }
            LoadOutcome::Cancelled => tracing::trace!(id = request.id, "request cancelled"),
            LoadOutcome::Instrument(_) | LoadOutcome::ImpulseResponse(_) => {
                self.clear_request_error(request);
                tracing::debug!(id = request.id, "request completed");
            }
        }
        if request.channel.is_used() {
            request.channel.push_result(LoadResult {
                id: request.id,
                outcome,
            });
        }
    }

    fn request_error_id(request: &PendingRequest, error: &LoadError) -> u64 {
        match error {
            LoadError::LibraryNotFound(name) => notification_id("lib ", name),
            LoadError::InstrumentNotFound(_) | LoadError::IrNotFound(_) => {
                let (category, name) = match &request.request {
                    LoadRequest::Instrument { name, .. } => ("inst", name),
                    LoadRequest::ImpulseResponse { name, .. } => ("ir  ", name),
                };
                notification_id(category, name)
            }
            LoadError::OpenAudio { path, .. } | LoadError::Decode { path, .. } => {
                notification_id("audi", path)
            }
        }
    }

    fn notify_request_error(&self, request: &PendingRequest, error: &LoadError) {
        request.channel.error_notifications.add_or_update(Notification {
            title: "Failed to load sound".into(),
            message: error.to_string(),
            error: None,
            id: Self::request_error_id(request, error),
        });
    }

    /// Success clears the standing errors that a previous attempt at the
    /// same names may have raised.
    fn clear_request_error(&self, request: &PendingRequest) {
        let sink = &request.channel.error_notifications;
        match &request.request {
            LoadRequest::Instrument { library, name, .. } => {
                sink.remove(notification_id("lib ", library));
                sink.remove(notification_id("inst", name));
            }
            LoadRequest::ImpulseResponse { library, name } => {
                sink.remove(notification_id("lib ", library));
                sink.remove(notification_id("ir  ", name));
            }
        }
    }

    fn answer_snapshots(&mut self) {
        while let Some(reply) = self.shared.snapshot_queries.pop() {
            let snapshot = self.build_snapshot();
            let _ = reply.send(snapshot);
        }
    }

    fn build_snapshot(&self) -> StateSnapshot {
        let libraries = self
            .registry
            .active()
            .iter()
            .map(|l| LibrarySnapshot {
                name: l.library.name.clone(),
                path: l.library.path.clone(),
                file_hash: l.library.file_hash,
                num_instruments: l.library.instruments_by_name.len(),
                num_cached_instruments: l.instruments.lock().len(),
                reader_uses: l.reader_uses.load(Ordering::Acquire),
            })
            .collect();
        let folders = self
            .folders
            .iter()
            .map(|f| FolderSnapshot {
                path: f.path.clone(),
                source: f.source,
                state: f.state,
            })
            .collect();
        StateSnapshot {
            libraries,
            folders,
            num_retired_libraries: self.registry.num_retired(),
            num_audio_entries: self.audio_store.len(),
            num_pending_requests: self.pending.len(),
            num_channels: self.shared.channels.lock().len(),
            stats: Stats {
                instruments_cached: self.shared.instruments_cached.load(Ordering::Acquire),
                audio_entries: self.shared.audio_entries.load(Ordering::Acquire),
                audio_bytes: self.shared.audio_bytes.load(Ordering::Acquire),
            },
        }
    }

    fn collect_garbage(&mut self) {
        self.shared.channels.lock().retain(|c| c.is_used());
        self.registry.collect_garbage();
        self.audio_store.collect_garbage();
        self.publish_stats();
    }

    fn publish_stats(&self) {
        let instruments: usize = self
            .registry
            .active()
            .iter()
            .map(|l| l.instruments.lock().len())
            .sum();
        let bytes: u64 = self
            .audio_store
            .iter()
            .filter_map(|e| e.audio())
            .map(|a| a.ram_usage_bytes())
            .sum();
        self.shared
            .instruments_cached
            .store(instruments as u64, Ordering::Release);
        self.shared
            .audio_entries
            .store(self.audio_store.len() as u64, Ordering::Release);
        self.shared.audio_bytes.store(bytes, Ordering::Release);
    }
}
