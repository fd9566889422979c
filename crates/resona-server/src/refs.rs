//! Cross-thread sharing primitives: the coalescing work signaller that wakes
//! the loading thread, and `Retained<T>`, the ref-counted handle the server
//! gives out to arbitrary client threads.

use std::ops::Deref;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

/// Wakes the loading thread. Signals coalesce: signalling an already-woken
/// thread is a no-op, so any thread can signal freely.
#[derive(Clone)]
pub struct WorkSignaller {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl WorkSignaller {
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx, rx }
    }

    pub fn signal(&self) {
        let _ = self.tx.try_send(());
    }

    /// Returns on signal or after `timeout`, whichever comes first.
    pub fn wait(&self, timeout: Duration) {
        let _ = self.rx.recv_timeout(timeout);
    }
}

impl Default for WorkSignaller {
    fn default() -> Self {
        Self::new()
    }
}

/// A ref-counted view of a server-owned object. The loading thread never
/// frees an object whose count is non-zero; dropping the last `Retained`
/// wakes it so the next garbage-collection pass can reclaim the object.
pub struct Retained<T> {
    value: Arc<T>,
    refs: Arc<AtomicU32>,
    signaller: Option<WorkSignaller>,
}

impl<T> Retained<T> {
    /// Takes one reference on behalf of the new handle.
    pub(crate) fn retain(
        value: Arc<T>,
        refs: Arc<AtomicU32>,
        signaller: Option<WorkSignaller>,
    ) -> Self {
        refs.fetch_add(1, Ordering::AcqRel);
        Self {
            value,
            refs,
            signaller,
        }
    }

    pub fn shared(&self) -> Arc<T> {
        Arc::clone(&self.value)
    }
}

impl<T> Deref for Retained<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> Clone for Retained<T> {
    fn clone(&self) -> Self {
        self.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            value: Arc::clone(&self.value),
            refs: Arc::clone(&self.refs),
            signaller: self.signaller.clone(),
        }
    }
}

impl<T> Drop for Retained<T> {
    fn drop(&mut self) {
        self.refs.fetch_sub(1, Ordering::AcqRel);
        if let Some(signaller) = &self.signaller {
            signaller.signal();
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Retained<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retained").field("value", &self.value).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retain_and_release_track_the_count() {
        let refs = Arc::new(AtomicU32::new(0));
        let handle = Retained::retain(Arc::new(7u32), Arc::clone(&refs), None);
        assert_eq!(refs.load(Ordering::Acquire), 1);
        let clone = handle.clone();
        assert_eq!(refs.load(Ordering::Acquire), 2);
        assert_eq!(*clone, 7);
        drop(handle);
        drop(clone);
        assert_eq!(refs.load(Ordering::Acquire), 0);
    }

    #[test]
    fn release_signals_the_owner() {
        let signaller = WorkSignaller::new();
        let refs = Arc::new(AtomicU32::new(0));
        let handle = Retained::retain(Arc::new(()), refs, Some(signaller.clone()));
        drop(handle);
        // The signal is already queued, so this returns immediately.
        signaller.wait(Duration::from_secs(5));
    }

    #[test]
    fn signals_coalesce() {
        let signaller = WorkSignaller::new();
        signaller.signal();
        signaller.signal();
        signaller.signal();
        signaller.wait(Duration::from_secs(5));
        // Only one queued wake remains consumed; a second wait times out.
        let start = std::time::Instant::now();
        signaller.wait(Duration::from_millis(10));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}
