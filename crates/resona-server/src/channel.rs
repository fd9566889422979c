//! Per-client communication: load requests in, ref-counted results out.
//! Everything here is safe to touch from any thread; the realtime audio
//! thread only ever does atomic reads and lock-free queue pops.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use resona_audio::AudioData;
use resona_library::{ImpulseResponse, Instrument};

use crate::error::LoadError;
use crate::instruments::ListedInstrument;
use crate::notifications::ErrorNotifications;
use crate::refs::Retained;

/// Instrument slots per plugin instance.
pub const NUM_LAYERS: usize = 3;

pub type RequestId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadRequest {
    Instrument {
        library: String,
        name: String,
        /// Which of the instance's layers this instrument is destined for;
        /// a newer request for the same layer supersedes this one.
        layer: usize,
    },
    ImpulseResponse {
        library: String,
        name: String,
    },
}

/// A fully-loaded instrument: metadata plus one decoded buffer per region.
pub struct LoadedInstrument {
    pub instrument: Arc<Instrument>,
    /// In region order; regions sharing a file share the `Arc`.
    pub audio: Vec<Arc<AudioData>>,
    /// Decoded audio of the region named by the instrument's
    /// `waveform_path`, for GUI display.
    pub waveform: Option<Arc<AudioData>>,
}

pub struct LoadedIr {
    pub ir: ImpulseResponse,
    pub audio: Arc<AudioData>,
}

pub enum LoadOutcome {
    Instrument(Retained<LoadedInstrument>),
    ImpulseResponse(Retained<LoadedIr>),
    Error(LoadError),
    Cancelled,
}

pub struct LoadResult {
    pub id: RequestId,
    pub outcome: LoadOutcome,
}

/// One client's channel. Results queue up until the client pops them; the
/// completion callback fires from the loading thread and must not block.
pub struct AsyncCommsChannel {
    used: AtomicBool,
    results: SegQueue<LoadResult>,
    callback: Box<dyn Fn() + Send + Sync>,
    /// Percent complete per layer, -1 when that layer is not loading.
    instrument_loading_percents: [AtomicI32; NUM_LAYERS],
    /// The most recent instrument fielded per layer. Weak so a stale slot
    /// never keeps a reclaimed instrument alive; written only by the
    /// loading thread.
    pub(crate) desired_instruments: Mutex<[Option<Weak<ListedInstrument>>; NUM_LAYERS]>,
    pub error_notifications: Arc<ErrorNotifications>,
}

impl AsyncCommsChannel {
    pub(crate) fn new(
        error_notifications: Arc<ErrorNotifications>,
        callback: Box<dyn Fn() + Send + Sync>,
    ) -> Arc<Self> {
        Arc::new(Self {
            used: AtomicBool::new(true),
            results: SegQueue::new(),
            callback,
            instrument_loading_percents: std::array::from_fn(|_| AtomicI32::new(-1)),
            desired_instruments: Mutex::new(Default::default()),
            error_notifications,
        })
    }

    /// Pop the next completed result, if any. Non-blocking.
    pub fn pop_result(&self) -> Option<LoadResult> {
        self.results.pop()
    }

    /// Percent complete of the named layer's in-flight instrument load, or
    /// `None` when nothing is loading there.
    pub fn instrument_loading_percent(&self, layer: usize) -> Option<u32> {
        let percent = self.instrument_loading_percents[layer].load(Ordering::Acquire);
        u32::try_from(percent).ok()
    }

    pub fn is_used(&self) -> bool {
        self.used.load(Ordering::Acquire)
    }

    pub(crate) fn set_loading_percent(&self, layer: usize, percent: Option<u32>) {
        let value = percent.map_or(-1, |p| p as i32);
        self.instrument_loading_percents[layer].store(value, Ordering::Release);
    }

    /// Deliver a terminal result and wake the client. Results pushed after
    /// the channel closed are dropped by [`retire`](Self::retire).
    pub(crate) fn push_result(&self, result: LoadResult) {
        self.results.push(result);
        (self.callback)();
    }

    /// Mark closed and release everything queued. The channel object itself
    /// is reclaimed by the next garbage-collection pass.
    pub(crate) fn retire(&self) {
        self.used.store(false, Ordering::Release);
        while self.results.pop().is_some() {}
        *self.desired_instruments.lock() = Default::default();
        for layer in 0..NUM_LAYERS {
            self.set_loading_percent(layer, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    #[test]
    fn results_queue_until_popped_and_callback_fires() {
        let fired = Arc::new(AtomicU32::new(0));
        let fired_in_callback = Arc::clone(&fired);
        let channel = AsyncCommsChannel::new(
            Arc::new(ErrorNotifications::new()),
            Box::new(move || {
                fired_in_callback.fetch_add(1, Ordering::AcqRel);
            }),
        );

        assert!(channel.pop_result().is_none());
        channel.push_result(LoadResult {
            id: 1,
            outcome: LoadOutcome::Cancelled,
        });
        assert_eq!(fired.load(Ordering::Acquire), 1);
        assert_eq!(channel.pop_result().map(|r| r.id), Some(1));
        assert!(channel.pop_result().is_none());
    }

    #[test]
    fn percent_is_absent_when_idle() {
        let channel =
            AsyncCommsChannel::new(Arc::new(ErrorNotifications::new()), Box::new(|| {}));
        for layer in 0..NUM_LAYERS {
            assert_eq!(channel.instrument_loading_percent(layer), None);
        }
        channel.set_loading_percent(1, Some(40));
        assert_eq!(channel.instrument_loading_percent(1), Some(40));
        channel.set_loading_percent(1, None);
        assert_eq!(channel.instrument_loading_percent(1), None);
    }

    #[test]
    fn retire_drains_queued_results() {
        let channel =
            AsyncCommsChannel::new(Arc::new(ErrorNotifications::new()), Box::new(|| {}));
        channel.push_result(LoadResult {
            id: 1,
            outcome: LoadOutcome::Cancelled,
        });
        channel.retire();
        assert!(!channel.is_used());
        assert!(channel.pop_result().is_none());
    }
}
