use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::traits::{BundleStore, BundleWriter, ReadSeek};

const SCRATCH_DIR: &str = ".scratch";

/// A [`BundleStore`] backed by a local directory tree.
///
/// Keys are placed under a 2/2-character pair-tree derived from the key's
/// own first four characters (`<a><b>/<c><d>/<key>`), so that bundles for
/// the same item land in the same directory without the directory entry
/// count for any single item growing unbounded across the whole store.
/// Writes land in a scratch subdirectory first and are `rename`d into place
/// on commit, so a reader can never observe a partially written key.
pub struct FilesystemStore {
    root: PathBuf,
}

impl FilesystemStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(SCRATCH_DIR))?;
        Ok(Self { root })
    }

    fn pair_tree_dir(&self, key: &str) -> PathBuf {
        let chars: Vec<char> = key.chars().collect();
        let get = |i: usize| chars.get(i).copied().unwrap_or('_');
        let ab: String = [get(0), get(1)].iter().collect();
        let cd: String = [get(2), get(3)].iter().collect();
        self.root.join(ab).join(cd)
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.pair_tree_dir(key).join(key)
    }
}

impl BundleStore for FilesystemStore {
    fn list(&self) -> Result<Box<dyn Iterator<Item = Result<String>> + Send>> {
        let mut keys = Vec::new();
        walk(&self.root, &self.root.join(SCRATCH_DIR), &mut keys)?;
        Ok(Box::new(keys.into_iter().map(Ok)))
    }

    fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.pair_tree_dir(prefix);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(prefix) {
                    found.push(name.to_string());
                }
            }
        }
        Ok(found)
    }

    fn open(&self, key: &str) -> Result<(Box<dyn ReadSeek>, u64)> {
        let path = self.path_for(key);
        let file = File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotExist(key.to_string())
            } else {
                Error::Io(e)
            }
        })?;
        let size = file.metadata()?.len();
        Ok((Box::new(file), size))
    }

    fn create(&self, key: &str) -> Result<Box<dyn BundleWriter>> {
        let dest = self.path_for(key);
        if dest.exists() {
            return Err(Error::KeyExists(key.to_string()));
        }
        let scratch_path = self.root.join(SCRATCH_DIR).join(uuid::Uuid::new_v4().to_string());
        let file = File::create(&scratch_path)?;
        Ok(Box::new(FsWriter {
            file: Some(file),
            scratch_path,
            dest,
            key: key.to_string(),
        }))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn walk(dir: &Path, scratch_dir: &Path, out: &mut Vec<String>) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path == scratch_dir {
            continue;
        }
        if path.is_dir() {
            walk(&path, scratch_dir, out)?;
        } else if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            out.push(name.to_string());
        }
    }
    Ok(())
}

struct FsWriter {
    file: Option<File>,
    scratch_path: PathBuf,
    dest: PathBuf,
    key: String,
}

impl std::io::Write for FsWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.as_mut().expect("writer used after close").write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.as_mut().expect("writer used after close").flush()
    }
}

impl std::io::Seek for FsWriter {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        use std::io::Seek as _;
        self.file.as_mut().expect("writer used after close").seek(pos)
    }
}

impl BundleWriter for FsWriter {
    fn commit(mut self: Box<Self>) -> Result<()> {
        if let Some(f) = self.file.take() {
            f.sync_all()?;
        }
        if self.dest.exists() {
            fs::remove_file(&self.scratch_path).ok();
            return Err(Error::KeyExists(self.key.clone()));
        }
        if let Some(parent) = self.dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&self.scratch_path, &self.dest)?;
        tracing::debug!(key = %self.key, path = %self.dest.display(), "bundle key committed");
        Ok(())
    }

    fn abort(mut self: Box<Self>) -> Result<()> {
        self.file.take();
        fs::remove_file(&self.scratch_path).ok();
        Ok(())
    }
}

impl Drop for FsWriter {
    fn drop(&mut self) {
        if self.file.is_some() {
            self.file.take();
            fs::remove_file(&self.scratch_path).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn write_then_read_roundtrips_through_pair_tree() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(dir.path()).unwrap();
        let mut w = store.create("it-001-0001").unwrap();
        w.write_all(b"hello").unwrap();
        w.commit().unwrap();

        assert!(dir.path().join("it").join("-0").join("it-001-0001").exists());

        let (mut r, size) = store.open("it-001-0001").unwrap();
        assert_eq!(size, 5);
        let mut buf = Vec::new();
        r.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello");
    }

    #[test]
    fn create_existing_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(dir.path()).unwrap();
        let w = store.create("it-001-0001").unwrap();
        w.commit().unwrap();
        assert!(matches!(
            store.create("it-001-0001").unwrap_err(),
            Error::KeyExists(_)
        ));
    }

    #[test]
    fn aborted_write_leaves_no_destination_or_scratch_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(dir.path()).unwrap();
        let w = store.create("it-001-0001").unwrap();
        w.abort().unwrap();
        assert!(store.open("it-001-0001").is_err());
        let scratch_entries: Vec<_> = fs::read_dir(dir.path().join(SCRATCH_DIR))
            .unwrap()
            .collect();
        assert!(scratch_entries.is_empty());
    }

    #[test]
    fn list_prefix_is_scoped_to_pair_tree_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(dir.path()).unwrap();
        for n in 1..=3 {
            let key = format!("it-001-{:04}", n);
            let w = store.create(&key).unwrap();
            w.commit().unwrap();
        }
        let w = store.create("it-002-0001").unwrap();
        w.commit().unwrap();

        let mut found = store.list_prefix("it-001-").unwrap();
        found.sort();
        assert_eq!(found, vec!["it-001-0001", "it-001-0002", "it-001-0003"]);
    }

    #[test]
    fn delete_missing_key_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(dir.path()).unwrap();
        store.delete("nope").unwrap();
    }
}
