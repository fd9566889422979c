//! Scan folders and the jobs that read libraries out of them. Folder state
//! lives on the loading thread only; scan and read bodies run on the pool
//! and report through the [`JobRunner`](crate::jobs::JobRunner).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use resona_library::{
    hash_library_file, read_library, FileFormat, Library, LibraryError, MDATA_EXTENSION,
    SCRIPT_FILE_NAME,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderState {
    NotScanned,
    RescanRequested,
    Scanning,
    ScannedSuccessfully,
    ScanFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderSource {
    /// Installed by the host application; scanned for the server's lifetime.
    AlwaysScanned,
    /// From the user's extra-folder set; removed when the set changes.
    ExtraFolder,
}

pub struct ScanFolder {
    pub path: PathBuf,
    pub source: FolderSource,
    pub state: FolderState,
}

impl ScanFolder {
    pub fn new(path: PathBuf, source: FolderSource) -> Self {
        Self {
            path,
            source,
            state: FolderState::NotScanned,
        }
    }
}

/// A library file discovered by a folder scan: the descriptor path (`.mdata`
/// bundle, or `config.rhai` inside a library directory) and its format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryLocation {
    pub path: PathBuf,
    pub format: FileFormat,
}

/// Outcome of one pool job, polled by the orchestrator.
pub enum JobOutcome {
    FolderScanned {
        folder: PathBuf,
        result: io::Result<Vec<LibraryLocation>>,
    },
    LibraryRead {
        location: LibraryLocation,
        result: ReadResult,
    },
}

pub enum ReadResult {
    Loaded(Box<Library>),
    /// Content hash matches an already-registered library; nothing to do.
    UnchangedHash(u64),
    Failed(LibraryError),
}

/// Enumerate `folder` non-recursively: `.mdata` files are bundle libraries,
/// subdirectories holding a `config.rhai` are scripted libraries.
pub fn scan_folder(folder: &Path) -> io::Result<Vec<LibraryLocation>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(folder)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_file() {
            if path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(MDATA_EXTENSION))
            {
                found.push(LibraryLocation {
                    path,
                    format: FileFormat::Mdata,
                });
            }
        } else if file_type.is_dir() {
            let config = path.join(SCRIPT_FILE_NAME);
            if config.is_file() {
                found.push(LibraryLocation {
                    path: config,
                    format: FileFormat::Script,
                });
            }
        }
    }
    tracing::debug!(folder = %folder.display(), libraries = found.len(), "scanned folder");
    Ok(found)
}

/// Body of a read job. The content hash is computed first so an unchanged
/// file (same bytes under a new name, or a redundant re-read) is skipped
/// without parsing.
pub fn read_library_job(location: LibraryLocation, known_hashes: Vec<u64>) -> JobOutcome {
    let result = match hash_library_file(&location.path) {
        Ok(hash) if known_hashes.contains(&hash) => ReadResult::UnchangedHash(hash),
        Ok(hash) => match read_library(&location.path, location.format) {
            Ok(mut library) => {
                library.file_hash = hash;
                tracing::info!(
                    name = %library.name,
                    path = %location.path.display(),
                    "read library"
                );
                ReadResult::Loaded(Box::new(library))
            }
            Err(e) => ReadResult::Failed(e),
        },
        Err(e) => ReadResult::Failed(e),
    };
    JobOutcome::LibraryRead { location, result }
}

#[cfg(test)]
mod tests {
    use resona_library::mdata::BundleBuilder;

    use super::*;

    fn write_bundle(dir: &Path, file_name: &str, library_name: &str) -> PathBuf {
        let path = dir.join(file_name);
        BundleBuilder::new(library_name, "Tests")
            .file("a.wav", resona_audio::test_wav(8, 1, 44_100))
            .write_to_file(&path)
            .unwrap();
        path
    }

    #[test]
    fn finds_bundles_and_script_directories() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "one.mdata", "One");
        fs::create_dir(dir.path().join("scripted")).unwrap();
        fs::write(
            dir.path().join("scripted").join(SCRIPT_FILE_NAME),
            "#{ name: \"Scripted\", author: \"Tests\" }",
        )
        .unwrap();
        // Neither of these is a library.
        fs::write(dir.path().join("notes.txt"), "x").unwrap();
        fs::create_dir(dir.path().join("empty")).unwrap();

        let mut found = scan_folder(dir.path()).unwrap();
        found.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].format, FileFormat::Mdata);
        assert_eq!(found[1].format, FileFormat::Script);
        assert!(found[1].path.ends_with(Path::new("scripted/config.rhai")));
    }

    #[test]
    fn scan_of_missing_folder_fails() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("nope");
        assert!(scan_folder(&gone).is_err());
    }

    #[test]
    fn known_hashes_skip_the_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bundle(dir.path(), "one.mdata", "One");
        let hash = hash_library_file(&path).unwrap();
        let location = LibraryLocation {
            path,
            format: FileFormat::Mdata,
        };

        match read_library_job(location.clone(), vec![hash]) {
            JobOutcome::LibraryRead {
                result: ReadResult::UnchangedHash(h),
                ..
            } => assert_eq!(h, hash),
            _ => panic!("expected unchanged-hash outcome"),
        }

        match read_library_job(location, Vec::new()) {
            JobOutcome::LibraryRead {
                result: ReadResult::Loaded(library),
                ..
            } => {
                assert_eq!(library.name, "One");
                assert_eq!(library.file_hash, hash);
            }
            _ => panic!("expected loaded outcome"),
        }
    }

    #[test]
    fn read_failures_carry_the_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.mdata");
        fs::write(&path, b"not a bundle").unwrap();
        match read_library_job(
            LibraryLocation {
                path,
                format: FileFormat::Mdata,
            },
            Vec::new(),
        ) {
            JobOutcome::LibraryRead {
                result: ReadResult::Failed(LibraryError::Mdata(_)),
                ..
            } => {}
            _ => panic!("expected mdata parse failure"),
        }
    }

    #[test]
    fn vanished_file_fails_as_path_missing() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("gone.mdata");
        match read_library_job(
            LibraryLocation {
                path: gone,
                format: FileFormat::Mdata,
            },
            Vec::new(),
        ) {
            JobOutcome::LibraryRead {
                result: ReadResult::Failed(e),
                ..
            } => assert!(e.is_path_missing()),
            _ => panic!("expected read failure"),
        }
    }
}
