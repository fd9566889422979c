//! The audio data store: decoded sample buffers keyed by (library name,
//! file path), shared by every instrument that references the same file.
//! Entries are owned by the loading thread; decode jobs and clients interact
//! with them only through the atomic state machine and the ref count.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use resona_audio::AudioData;
use resona_library::{AudioSource, Library};

use crate::error::LoadError;
use crate::pool::ThreadPoolContext;
use crate::state::{AtomicLoadingState, LoadingState};

pub struct ListedAudioData {
    pub library_name: String,
    pub path: String,
    pub state: AtomicLoadingState,
    pub refs: Arc<AtomicU32>,
    /// Written exactly once, by the decode job, before the state moves to a
    /// completed-successfully/with-error state.
    result: OnceLock<Result<Arc<AudioData>, LoadError>>,
}

impl ListedAudioData {
    pub fn audio(&self) -> Option<&Arc<AudioData>> {
        self.result.get().and_then(|r| r.as_ref().ok())
    }

    pub fn error(&self) -> Option<&LoadError> {
        self.result.get().and_then(|r| r.as_ref().err())
    }
}

/// Owned by the loading thread; decode jobs hold `Arc`s to individual
/// entries but never touch the list itself.
#[derive(Default)]
pub struct AudioStore {
    entries: Vec<Arc<ListedAudioData>>,
}

impl AudioStore {
    /// Look up or create the entry for `path` within `library`. A cancelled
    /// or cancelling entry is revived; anything else in flight or complete
    /// is reused as-is. A miss allocates in `PendingLoad` and dispatches a
    /// decode job.
    pub fn fetch_or_create(
        &mut self,
        library: &Arc<Library>,
        path: &str,
        ctx: &ThreadPoolContext,
    ) -> Arc<ListedAudioData> {
        for entry in &self.entries {
            if entry.library_name == library.name && entry.path == path {
                trigger_reload_if_cancelled(entry, library, ctx);
                return Arc::clone(entry);
            }
        }

        let entry = Arc::new(ListedAudioData {
            library_name: library.name.clone(),
            path: path.to_owned(),
            state: AtomicLoadingState::new(LoadingState::PendingLoad),
            refs: Arc::new(AtomicU32::new(0)),
            result: OnceLock::new(),
        });
        self.entries.push(Arc::clone(&entry));
        spawn_decode(&entry, library, ctx);
        entry
    }

    /// Drop entries nobody references. Only safe after the pool countdown
    /// has drained: an in-flight decode holds its own `Arc`, but the point
    /// of the cycle-end GC is that nothing is in flight.
    pub fn collect_garbage(&mut self) {
        self.entries
            .retain(|entry| entry.refs.load(Ordering::Acquire) > 0);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ListedAudioData>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Dispatch the decode job for an entry in `PendingLoad` (or about to race
/// with a cancellation).
pub fn spawn_decode(entry: &Arc<ListedAudioData>, library: &Arc<Library>, ctx: &ThreadPoolContext) {
    let entry = Arc::clone(entry);
    let library = Arc::clone(library);
    ctx.spawn(move || {
        // Claim the entry. A racing cancellation turns the job into a no-op.
        let mut observed = entry.state.load();
        loop {
            let next = match observed {
                LoadingState::PendingLoad => LoadingState::Loading,
                LoadingState::PendingCancel => LoadingState::CompletedCancelled,
                other => {
                    debug_assert!(false, "decode job started in state {other:?}");
                    return;
                }
            };
            match entry.state.compare_exchange(observed, next) {
                Ok(()) => {
                    if next == LoadingState::CompletedCancelled {
                        tracing::debug!(path = %entry.path, "decode cancelled before start");
                        return;
                    }
                    break;
                }
                Err(actual) => observed = actual,
            }
        }

        let outcome = decode_entry_audio(&entry, &library);
        let final_state = match &outcome {
            Ok(_) => LoadingState::CompletedSuccessfully,
            Err(_) => LoadingState::CompletedWithError,
        };
        let _ = entry.result.set(outcome);
        entry.state.store(final_state);
    });
}

fn decode_entry_audio(
    entry: &ListedAudioData,
    library: &Library,
) -> Result<Arc<AudioData>, LoadError> {
    let source = library
        .open_audio(&entry.path)
        .map_err(|e| LoadError::OpenAudio {
            path: entry.path.clone(),
            source: Arc::new(e),
        })?;
    let decoded = match source {
        AudioSource::Memory(bytes) => {
            resona_audio::decode_bytes(bytes, Some(std::path::Path::new(&entry.path)))
        }
        AudioSource::File(path) => resona_audio::decode_path(&path),
    }
    .map_err(|e| LoadError::Decode {
        path: entry.path.clone(),
        source: Arc::new(e),
    })?;
    Ok(Arc::new(decoded))
}

/// If the entry was cancelled (or is about to be), bring it back to life.
/// `PendingCancel -> PendingLoad` needs no new job: the in-flight decode
/// will claim it. `CompletedCancelled -> PendingLoad` does, the old job is
/// gone.
pub fn trigger_reload_if_cancelled(
    entry: &Arc<ListedAudioData>,
    library: &Arc<Library>,
    ctx: &ThreadPoolContext,
) {
    if entry
        .state
        .compare_exchange(LoadingState::PendingCancel, LoadingState::PendingLoad)
        .is_ok()
    {
        tracing::trace!(path = %entry.path, "revived pending-cancel audio");
        return;
    }
    if entry.state.load() == LoadingState::CompletedCancelled {
        entry.state.store(LoadingState::PendingLoad);
        tracing::trace!(path = %entry.path, "reloading cancelled audio");
        spawn_decode(entry, library, ctx);
    }
}

/// Attempt to cancel every audio entry referenced solely by `audio_data_set`
/// (ref count of exactly one, i.e. only the abandoned instrument). Only a
/// not-yet-started decode can be prevented; anything further along runs to
/// completion.
pub fn cancel_audio_if_unshared(audio_data_set: &[Arc<ListedAudioData>]) {
    for entry in audio_data_set {
        if entry.refs.load(Ordering::Acquire) == 1 {
            let _ = entry
                .state
                .compare_exchange(LoadingState::PendingLoad, LoadingState::PendingCancel);
        }
    }
}
