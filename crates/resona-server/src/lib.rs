//! Asynchronous sample-library server: resolves named instruments and
//! impulse responses from on-disk libraries into fully-decoded, ref-counted
//! audio buffers, without ever blocking the caller.
//!
//! One dedicated loading thread owns every registry and cache; decode, scan
//! and read work fans out to a shared worker pool. Clients talk to the
//! server through [`AsyncCommsChannel`]s: requests go in through a
//! lock-free queue, results come back the same way, and decoded audio is
//! shared across plugin instances through [`Retained`] handles. Library
//! folders are watched for changes and hot-reloaded while loaded instruments
//! stay alive for as long as anyone holds them.

pub mod channel;
pub mod error;
pub mod instruments;
pub mod jobs;
pub mod notifications;
pub mod pool;
pub mod refs;
pub mod registry;
pub mod scan;
pub mod server;
pub mod state;
pub mod store;
pub mod watch;

pub use channel::{
    AsyncCommsChannel, LoadOutcome, LoadRequest, LoadResult, LoadedInstrument, LoadedIr,
    RequestId, NUM_LAYERS,
};
pub use error::LoadError;
pub use notifications::{notification_id, ErrorNotifications, Notification};
pub use refs::Retained;
pub use scan::{FolderSource, FolderState};
pub use server::{
    FolderSnapshot, LibrarySnapshot, Server, ServerConfig, StartError, StateSnapshot, Stats,
};
