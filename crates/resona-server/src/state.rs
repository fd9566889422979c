//! The per-audio-entry loading state machine. All transitions go through
//! atomic compare-exchange; there are no locks on the decode hot path.
//!
//! ```text
//! PendingLoad -> Loading -> CompletedSuccessfully | CompletedWithError
//! PendingLoad -> PendingCancel -> CompletedCancelled
//! CompletedCancelled -> PendingLoad        (reload on renewed interest)
//! ```

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LoadingState {
    PendingLoad = 0,
    Loading,
    PendingCancel,
    CompletedSuccessfully,
    CompletedWithError,
    CompletedCancelled,
}

impl LoadingState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LoadingState::PendingLoad,
            1 => LoadingState::Loading,
            2 => LoadingState::PendingCancel,
            3 => LoadingState::CompletedSuccessfully,
            4 => LoadingState::CompletedWithError,
            _ => LoadingState::CompletedCancelled,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LoadingState::CompletedSuccessfully
                | LoadingState::CompletedWithError
                | LoadingState::CompletedCancelled
        )
    }
}

#[derive(Debug)]
pub struct AtomicLoadingState(AtomicU8);

impl AtomicLoadingState {
    pub fn new(state: LoadingState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> LoadingState {
        LoadingState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: LoadingState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// On failure returns the actually-observed state.
    pub fn compare_exchange(
        &self,
        current: LoadingState,
        new: LoadingState,
    ) -> Result<(), LoadingState> {
        self.0
            .compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(LoadingState::from_u8)
    }
}
