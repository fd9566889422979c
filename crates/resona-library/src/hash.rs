//! Content hashing for library identity. Two library files with the same
//! hash are the same library, even if they were moved or renamed on disk.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::model::LibraryError;

/// Hash raw bytes to the u64 identity used throughout the registry.
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    u64::from_le_bytes(digest[..8].try_into().unwrap_or_default())
}

/// Hash the identity-bearing file of a library: the bundle itself for mdata,
/// the `config.rhai` descriptor for scripted libraries.
pub fn hash_library_file(path: &Path) -> Result<u64, LibraryError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    Ok(u64::from_le_bytes(digest[..8].try_into().unwrap_or_default()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_bytes_hash_equal() {
        assert_eq!(hash_bytes(b"abc"), hash_bytes(b"abc"));
        assert_ne!(hash_bytes(b"abc"), hash_bytes(b"abd"));
    }

    #[test]
    fn file_hash_matches_byte_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lib.mdata");
        std::fs::write(&path, b"library bytes").unwrap();
        assert_eq!(
            hash_library_file(&path).unwrap(),
            hash_bytes(b"library bytes")
        );
    }
}
