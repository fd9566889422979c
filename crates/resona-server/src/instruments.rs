//! Per-library instrument cache: one entry per instrument a client has
//! asked for, each pinning the audio entries its regions decode from.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use resona_library::{Instrument, Library};

use crate::error::LoadError;
use crate::pool::ThreadPoolContext;
use crate::store::{self, AudioStore, ListedAudioData};

pub struct ListedInstrument {
    pub instrument: Arc<Instrument>,
    pub library_name: String,
    pub refs: Arc<AtomicU32>,
    /// One entry per region, in region order. Regions that share a file
    /// share the `Arc`.
    pub audio_by_region: Vec<Arc<ListedAudioData>>,
    /// Each distinct audio entry exactly once. The instrument holds one
    /// store reference per set entry, released on drop.
    pub audio_data_set: Vec<Arc<ListedAudioData>>,
    /// Reader-use count of the owning library; one use is held for as long
    /// as this instrument exists, so a retired library outlives its cached
    /// instruments.
    library_uses: Arc<AtomicU32>,
}

impl ListedInstrument {
    /// True once every referenced audio entry reached a terminal state.
    pub fn all_audio_terminal(&self) -> bool {
        self.audio_data_set
            .iter()
            .all(|entry| entry.state.load().is_terminal())
    }
}

impl Drop for ListedInstrument {
    fn drop(&mut self) {
        for entry in &self.audio_data_set {
            entry.refs.fetch_sub(1, Ordering::AcqRel);
        }
        self.library_uses.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Default)]
pub struct InstrumentCache {
    entries: Vec<Arc<ListedInstrument>>,
}

impl InstrumentCache {
    /// Look up or create the cache entry for the named instrument. A hit
    /// revives any cancelled audio; a miss resolves every region path
    /// through the audio store, dispatching decodes as needed.
    pub fn fetch_or_create(
        &mut self,
        library: &Arc<Library>,
        library_uses: &Arc<AtomicU32>,
        name: &str,
        audio_store: &mut AudioStore,
        ctx: &ThreadPoolContext,
    ) -> Result<Arc<ListedInstrument>, LoadError> {
        let instrument = library
            .instruments_by_name
            .get(name)
            .ok_or_else(|| LoadError::InstrumentNotFound(name.to_owned()))?;

        for entry in &self.entries {
            if Arc::ptr_eq(&entry.instrument, instrument) {
                for audio in &entry.audio_data_set {
                    store::trigger_reload_if_cancelled(audio, library, ctx);
                }
                return Ok(Arc::clone(entry));
            }
        }

        let mut audio_by_region = Vec::with_capacity(instrument.regions.len());
        let mut audio_data_set: Vec<Arc<ListedAudioData>> = Vec::new();
        for region in &instrument.regions {
            let audio = audio_store.fetch_or_create(library, &region.path, ctx);
            if !audio_data_set.iter().any(|e| Arc::ptr_eq(e, &audio)) {
                audio.refs.fetch_add(1, Ordering::AcqRel);
                audio_data_set.push(Arc::clone(&audio));
            }
            audio_by_region.push(audio);
        }

        library_uses.fetch_add(1, Ordering::AcqRel);
        let entry = Arc::new(ListedInstrument {
            instrument: Arc::clone(instrument),
            library_name: library.name.clone(),
            refs: Arc::new(AtomicU32::new(0)),
            audio_by_region,
            audio_data_set,
            library_uses: Arc::clone(library_uses),
        });
        self.entries.push(Arc::clone(&entry));
        Ok(entry)
    }

    /// Drop unreferenced entries. Their `Drop` releases the audio store
    /// references, so run this before the store's own GC.
    pub fn collect_garbage(&mut self) {
        self.entries
            .retain(|entry| entry.refs.load(Ordering::Acquire) > 0);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ListedInstrument>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;

    use resona_library::{FileFormat, FileSource, Region, MEMORY_PATH};

    use super::*;
    use crate::pool::JobCountdown;
    use crate::refs::WorkSignaller;
    use crate::state::LoadingState;

    fn test_ctx() -> ThreadPoolContext {
        ThreadPoolContext {
            pool: Arc::new(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(2)
                    .build()
                    .unwrap(),
            ),
            jobs: Arc::new(JobCountdown::new()),
            signaller: WorkSignaller::new(),
        }
    }

    /// Instrument with four regions over two files, like a sampled drum kit
    /// with round robins sharing recordings.
    fn two_file_library() -> Arc<Library> {
        let mut blobs: HashMap<String, Arc<[u8]>> = HashMap::new();
        blobs.insert("one.wav".into(), resona_audio::test_wav(16, 1, 44_100).into());
        blobs.insert("two.wav".into(), resona_audio::test_wav(24, 1, 44_100).into());

        let mut instrument = Instrument::new("Kit");
        instrument.regions = vec![
            Region::spanning("one.wav"),
            Region::spanning("one.wav"),
            Region::spanning("two.wav"),
            Region::spanning("two.wav"),
        ];

        let mut instruments_by_name = HashMap::new();
        instruments_by_name.insert("Kit".to_owned(), Arc::new(instrument));

        Arc::new(Library {
            name: "Mem".into(),
            tagline: String::new(),
            author: "Tests".into(),
            url: None,
            minor_version: 1,
            path: PathBuf::from(MEMORY_PATH),
            file_hash: 1,
            format: FileFormat::Script,
            instruments_by_name,
            irs_by_name: HashMap::new(),
            source: FileSource::Memory { blobs },
        })
    }

    #[test]
    fn shared_region_files_share_audio_entries() {
        let library = two_file_library();
        let ctx = test_ctx();
        let mut audio_store = AudioStore::default();
        let mut cache = InstrumentCache::default();
        let uses = Arc::new(AtomicU32::new(0));

        let inst = cache
            .fetch_or_create(&library, &uses, "Kit", &mut audio_store, &ctx)
            .unwrap();
        assert_eq!(inst.audio_by_region.len(), 4);
        assert_eq!(inst.audio_data_set.len(), 2);
        assert_eq!(audio_store.len(), 2);
        assert!(Arc::ptr_eq(
            &inst.audio_by_region[0],
            &inst.audio_by_region[1]
        ));
        assert!(!Arc::ptr_eq(
            &inst.audio_by_region[1],
            &inst.audio_by_region[2]
        ));

        ctx.jobs.wait_until_zero();
        assert!(inst.all_audio_terminal());
    }

    #[test]
    fn repeated_fetches_reuse_the_entry() {
        let library = two_file_library();
        let ctx = test_ctx();
        let mut audio_store = AudioStore::default();
        let mut cache = InstrumentCache::default();
        let uses = Arc::new(AtomicU32::new(0));

        let a = cache
            .fetch_or_create(&library, &uses, "Kit", &mut audio_store, &ctx)
            .unwrap();
        let b = cache
            .fetch_or_create(&library, &uses, "Kit", &mut audio_store, &ctx)
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
        // One store ref per distinct file, taken once despite two fetches.
        for audio in &a.audio_data_set {
            assert_eq!(audio.refs.load(Ordering::Acquire), 1);
        }
        ctx.jobs.wait_until_zero();
    }

    #[test]
    fn unknown_names_are_reported() {
        let library = two_file_library();
        let ctx = test_ctx();
        let mut audio_store = AudioStore::default();
        let mut cache = InstrumentCache::default();
        let uses = Arc::new(AtomicU32::new(0));
        let Err(err) = cache.fetch_or_create(&library, &uses, "Missing", &mut audio_store, &ctx)
        else {
            panic!("expected a lookup failure");
        };
        assert!(matches!(err, LoadError::InstrumentNotFound(_)));
        assert!(err.is_not_found());
    }

    #[test]
    fn dropping_the_instrument_releases_its_audio() {
        let library = two_file_library();
        let ctx = test_ctx();
        let mut audio_store = AudioStore::default();
        let mut cache = InstrumentCache::default();
        let uses = Arc::new(AtomicU32::new(0));

        let inst = cache
            .fetch_or_create(&library, &uses, "Kit", &mut audio_store, &ctx)
            .unwrap();
        ctx.jobs.wait_until_zero();

        assert_eq!(uses.load(Ordering::Acquire), 1);
        drop(inst);
        cache.collect_garbage();
        assert_eq!(cache.len(), 0);
        assert_eq!(uses.load(Ordering::Acquire), 0);
        audio_store.collect_garbage();
        assert_eq!(audio_store.len(), 0);
    }

    #[test]
    fn cache_hits_revive_cancelled_audio() {
        let library = two_file_library();
        let ctx = test_ctx();
        let mut audio_store = AudioStore::default();
        let mut cache = InstrumentCache::default();
        let uses = Arc::new(AtomicU32::new(0));

        let inst = cache
            .fetch_or_create(&library, &uses, "Kit", &mut audio_store, &ctx)
            .unwrap();
        ctx.jobs.wait_until_zero();
        inst.audio_data_set[0]
            .state
            .store(LoadingState::CompletedCancelled);

        let again = cache
            .fetch_or_create(&library, &uses, "Kit", &mut audio_store, &ctx)
            .unwrap();
        assert!(Arc::ptr_eq(&inst, &again));
        ctx.jobs.wait_until_zero();
        assert!(inst.all_audio_terminal());
        assert_eq!(
            inst.audio_data_set[0].state.load(),
            LoadingState::CompletedSuccessfully
        );
    }
}
