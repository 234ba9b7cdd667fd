use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::{Digest, Result};

/// Filesystem blob store keyed by [`Digest`], with git-style 2-char sharding.
///
/// Layout: `<root>/objects/<first 2 hex chars>/<remaining hex chars>`
///
/// Unlike a pure CAS the key is chosen by the caller, so `put` overwrites
/// atomically instead of skipping existing blobs.
#[derive(Debug, Clone)]
pub struct ShardedStore {
    objects_dir: PathBuf,
}

impl ShardedStore {
    /// Create a store rooted at `root`. Creates `root/objects/` if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let objects_dir = root.as_ref().join("objects");
        fs::create_dir_all(&objects_dir)?;
        Ok(Self { objects_dir })
    }

    fn blob_path(&self, key: &Digest) -> PathBuf {
        let hex = key.to_hex();
        self.objects_dir.join(&hex[..2]).join(&hex[2..])
    }

    /// Write `data` under `key`.
    ///
    /// Temp file in the shard directory, then rename: concurrent writers of
    /// the same key leave exactly one intact blob.
    pub fn put(&self, key: &Digest, data: &[u8]) -> Result<()> {
        let path = self.blob_path(key);
        let shard_dir = match path.parent() {
            Some(dir) => dir.to_path_buf(),
            None => self.objects_dir.clone(),
        };
        fs::create_dir_all(&shard_dir)?;

        let mut tmp = NamedTempFile::new_in(&shard_dir)?;
        tmp.write_all(data)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Read the blob stored under `key`, if any.
    pub fn get(&self, key: &Digest) -> Result<Option<Vec<u8>>> {
        match fs::read(self.blob_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the blob under `key`. Missing blobs are not an error.
    pub fn remove(&self, key: &Digest) -> Result<()> {
        match fs::remove_file(self.blob_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
