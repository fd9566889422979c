//! Sample-library metadata: the data model shared by the whole of Resona,
//! the two on-disk library formats, content hashing for identity dedup, and
//! the built-in library that ships inside the binary.
//!
//! A library is a named collection of instruments and impulse responses. It
//! is backed either by a single binary bundle (`.mdata`), by a directory
//! holding a `config.rhai` descriptor plus loose audio files, or by embedded
//! memory (the built-in library). Audio decoding itself lives in
//! `resona-audio`; this crate only resolves region paths to raw bytes.

pub mod builtin;
pub mod hash;
pub mod mdata;
pub mod model;
pub mod script;

pub use builtin::{builtin_library, BUILTIN_LIBRARY_NAME};
pub use hash::{hash_bytes, hash_library_file};
pub use mdata::MDATA_EXTENSION;
pub use model::{
    AudioSource, FileFormat, FileSource, ImpulseResponse, Instrument, KeyRange, Library,
    LibraryError, Loop, Region, ScriptError, MEMORY_PATH,
};
pub use script::SCRIPT_FILE_NAME;

use std::path::Path;

/// Parse a library file on disk. For [`FileFormat::Mdata`] `path` is the
/// bundle file itself; for [`FileFormat::Script`] it is the `config.rhai`
/// descriptor inside the library directory. The returned library's
/// `file_hash` is left at zero; callers that need identity dedup compute it
/// with [`hash_library_file`] first.
pub fn read_library(path: &Path, format: FileFormat) -> Result<Library, LibraryError> {
    match format {
        FileFormat::Mdata => mdata::read(path),
        FileFormat::Script => script::read(path),
    }
}
