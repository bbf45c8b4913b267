//! Content-addressed blob storage.
//!
//! User comments, textures and channel descriptions are kept out of the
//! snapshot as blobs keyed by their hex SHA-1, fanned out over a two-char
//! directory prefix: `blobs/ab/cdef...`. Writes go through a temp file and
//! a rename so a crash never leaves a torn blob under a valid key.

use openssl::hash::hash;
use openssl::hash::MessageDigest;
use std::fs;
use std::io;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use tracing::debug;

/// A directory of blobs keyed by content digest.
#[derive(Clone, Debug)]
pub struct BlobStore {
    base: PathBuf,
}

impl BlobStore {
    /// Opens (creating if needed) the store rooted at `base`.
    pub fn open(base: &Path) -> io::Result<BlobStore> {
        fs::create_dir_all(base)?;
        Ok(BlobStore {
            base: base.to_owned(),
        })
    }

    fn path_for(&self, key: &str) -> Option<PathBuf> {
        if key.len() < 3 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(self.base.join(&key[..2]).join(&key[2..]))
    }

    /// Stores `data`, returning its key. Storing identical content twice
    /// is a no-op returning the same key.
    pub fn put(&self, data: &[u8]) -> io::Result<String> {
        let digest = hash(MessageDigest::sha1(), data)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let key = hex::encode(&digest);
        let path = self.path_for(&key).expect("digest keys are well-formed");

        if path.exists() {
            return Ok(key);
        }
        let dir = path.parent().expect("blob paths have a parent");
        fs::create_dir_all(dir)?;
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        temp.write_all(data)?;
        temp.persist(&path).map_err(|e| e.error)?;
        debug!(key = %key, bytes = data.len(), "blob stored");
        Ok(key)
    }

    /// Fetches the blob stored under `key`.
    pub fn get(&self, key: &str) -> io::Result<Vec<u8>> {
        let path = self
            .path_for(key)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "malformed blob key"))?;
        fs::read(path)
    }
}
