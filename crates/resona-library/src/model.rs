use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

/// Sentinel path for libraries that are not backed by the filesystem.
pub const MEMORY_PATH: &str = ":memory:";

/// Half-open range over MIDI-style 0..=127 values. `end` is one past the
/// last included value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRange {
    pub start: u8,
    pub end: u8,
}

impl KeyRange {
    pub const fn new(start: u8, end: u8) -> Self {
        Self { start, end }
    }

    pub const fn full_keys() -> Self {
        Self { start: 0, end: 128 }
    }

    pub const fn full_velocities() -> Self {
        Self { start: 0, end: 100 }
    }

    pub fn contains(&self, value: u8) -> bool {
        value >= self.start && value < self.end
    }
}

/// Loop points for a region. Frames may be negative, meaning they index from
/// the end of the sample: -1 is `num_frames`, -2 is `num_frames - 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Loop {
    pub start_frame: i64,
    pub end_frame: i64,
    pub crossfade_frames: u32,
    pub ping_pong: bool,
}

/// One sample-file mapping within an instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    /// Library-relative audio path, resolved through the owning library's
    /// [`FileSource`].
    pub path: String,
    pub root_key: u8,
    pub key_range: KeyRange,
    pub velocity_range: KeyRange,
    pub loop_: Option<Loop>,
    pub round_robin: Option<u32>,
}

impl Region {
    /// A region spanning the whole keyboard, rooted at middle C.
    pub fn spanning(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            root_key: 60,
            key_range: KeyRange::full_keys(),
            velocity_range: KeyRange::full_velocities(),
            loop_: None,
            round_robin: None,
        }
    }
}

/// A set of sample regions playable as one sound source.
#[derive(Debug, Clone, PartialEq)]
pub struct Instrument {
    pub name: String,
    pub folders: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    /// The region path whose decoded audio the GUI shows as the waveform.
    pub waveform_path: Option<String>,
    pub regions: Vec<Region>,
}

impl Instrument {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            folders: None,
            description: None,
            tags: Vec::new(),
            waveform_path: None,
            regions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImpulseResponse {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileFormat {
    /// Single-file binary bundle with audio embedded in a data pool.
    Mdata,
    /// Directory with a `config.rhai` descriptor and loose audio files.
    Script,
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileFormat::Mdata => f.write_str("mdata"),
            FileFormat::Script => f.write_str("script"),
        }
    }
}

/// Where a library's audio bytes come from.
pub enum FileSource {
    /// Embedded in the bundle's data pool; entries are (offset, len) within
    /// the pool, which starts at `pool_offset` bytes into the backing.
    Pool {
        backing: PoolBacking,
        pool_offset: u64,
        entries: HashMap<String, (u64, u64)>,
    },
    /// Loose files relative to the library directory.
    Directory { root: PathBuf },
    /// Fully in-memory blobs (the built-in library).
    Memory { blobs: HashMap<String, Arc<[u8]>> },
}

pub enum PoolBacking {
    File(PathBuf),
    Memory(Arc<[u8]>),
}

impl fmt::Debug for FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileSource::Pool { entries, .. } => {
                write!(f, "FileSource::Pool({} entries)", entries.len())
            }
            FileSource::Directory { root } => write!(f, "FileSource::Directory({})", root.display()),
            FileSource::Memory { blobs } => write!(f, "FileSource::Memory({} blobs)", blobs.len()),
        }
    }
}

/// Resolved audio bytes, ready to hand to the decoder.
pub enum AudioSource {
    Memory(Arc<[u8]>),
    File(PathBuf),
}

/// A parsed library: instruments and impulse responses indexed by name, plus
/// everything needed to resolve their audio.
#[derive(Debug)]
pub struct Library {
    pub name: String,
    pub tagline: String,
    pub author: String,
    pub url: Option<String>,
    pub minor_version: u32,
    /// The `.mdata` file or the `config.rhai` descriptor; [`MEMORY_PATH`]
    /// for the built-in library.
    pub path: PathBuf,
    /// Content hash of the library file, used to dedup libraries that were
    /// moved or renamed on disk. Zero until computed.
    pub file_hash: u64,
    pub format: FileFormat,
    pub instruments_by_name: HashMap<String, Arc<Instrument>>,
    pub irs_by_name: HashMap<String, ImpulseResponse>,
    pub source: FileSource,
}

impl Library {
    /// Resolve a region/IR path to its audio bytes.
    pub fn open_audio(&self, path: &str) -> Result<AudioSource, LibraryError> {
        match &self.source {
            FileSource::Pool {
                backing,
                pool_offset,
                entries,
            } => {
                let &(offset, len) = entries
                    .get(path)
                    .ok_or_else(|| LibraryError::FileNotFound(path.to_owned()))?;
                match backing {
                    PoolBacking::File(bundle) => {
                        let mut file = fs::File::open(bundle)?;
                        file.seek(SeekFrom::Start(pool_offset + offset))?;
                        let mut bytes = vec![0u8; len as usize];
                        file.read_exact(&mut bytes)?;
                        Ok(AudioSource::Memory(bytes.into()))
                    }
                    PoolBacking::Memory(blob) => {
                        let start = (pool_offset + offset) as usize;
                        let end = start + len as usize;
                        let slice = blob
                            .get(start..end)
                            .ok_or_else(|| LibraryError::FileNotFound(path.to_owned()))?;
                        Ok(AudioSource::Memory(slice.to_vec().into()))
                    }
                }
            }
            FileSource::Directory { root } => Ok(AudioSource::File(root.join(path))),
            FileSource::Memory { blobs } => blobs
                .get(path)
                .map(|b| AudioSource::Memory(Arc::clone(b)))
                .ok_or_else(|| LibraryError::FileNotFound(path.to_owned())),
        }
    }
}

/// Errors raised by the scripted library format, mapped from the script
/// engine's failure modes.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScriptError {
    #[error("script syntax error: {0}")]
    Syntax(String),
    #[error("script runtime error: {0}")]
    Runtime(String),
    #[error("script exceeded its execution budget")]
    Timeout,
    #[error("script exceeded its data-size budget")]
    Memory,
}

#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid mdata bundle: {0}")]
    Mdata(String),
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error("file not found in library: {0}")]
    FileNotFound(String),
}

impl LibraryError {
    /// True when the underlying cause is simply a missing path, which scan
    /// and read jobs treat as "gone, not broken".
    pub fn is_path_missing(&self) -> bool {
        matches!(self, LibraryError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_range_is_half_open() {
        let range = KeyRange::new(60, 72);
        assert!(range.contains(60));
        assert!(range.contains(71));
        assert!(!range.contains(72));
    }

    #[test]
    fn memory_source_resolves_blobs() {
        let mut blobs = HashMap::new();
        blobs.insert("a.wav".to_owned(), Arc::from(vec![1u8, 2, 3].into_boxed_slice()));
        let lib = Library {
            name: "Mem".into(),
            tagline: String::new(),
            author: "Tests".into(),
            url: None,
            minor_version: 1,
            path: PathBuf::from(MEMORY_PATH),
            file_hash: 0,
            format: FileFormat::Script,
            instruments_by_name: HashMap::new(),
            irs_by_name: HashMap::new(),
            source: FileSource::Memory { blobs },
        };
        match lib.open_audio("a.wav").unwrap() {
            AudioSource::Memory(bytes) => assert_eq!(&bytes[..], &[1, 2, 3]),
            AudioSource::File(_) => panic!("expected memory source"),
        }
        assert!(matches!(
            lib.open_audio("missing.wav"),
            Err(LibraryError::FileNotFound(_))
        ));
    }
}
