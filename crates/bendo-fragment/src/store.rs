use std::fs::{self, File};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::reader::FragmentReader;

const SCRATCH_DIR: &str = ".scratch";
const META_FILE: &str = "meta.json";

#[derive(Debug, Serialize, Deserialize)]
struct Meta {
    created_at: DateTime<Utc>,
    creator: Option<String>,
    labels: Vec<String>,
}

/// Snapshot of one fragment file's bookkeeping (spec §4.6 `stat()`).
#[derive(Debug, Clone)]
pub struct FileStat {
    pub size: u64,
    pub fragment_count: u32,
    pub creator: Option<String>,
    pub labels: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Root of an append-only upload-buffer tree (spec §4.6, §9 "resumable
/// upload buffers ... modeled as append-only files with per-fragment
/// metadata persisted alongside"). Each id gets its own directory holding
/// zero-padded fragment files plus a `meta.json` sidecar.
pub struct FragmentStore {
    root: PathBuf,
}

impl FragmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn dir_for(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Creates a new, empty file for `id`. Idempotent: calling it again for
    /// an id that already exists just returns a handle to it, leaving any
    /// fragments already written untouched.
    pub fn new_file(&self, id: &str) -> Result<FragmentFile> {
        let dir = self.dir_for(id);
        fs::create_dir_all(dir.join(SCRATCH_DIR))?;
        let meta_path = dir.join(META_FILE);
        if !meta_path.exists() {
            write_meta(
                &meta_path,
                &Meta {
                    created_at: Utc::now(),
                    creator: None,
                    labels: Vec::new(),
                },
            )?;
        }
        Ok(FragmentFile {
            dir,
            id: id.to_string(),
        })
    }

    pub fn lookup(&self, id: &str) -> Result<Option<FragmentFile>> {
        let dir = self.dir_for(id);
        if !dir.join(META_FILE).exists() {
            return Ok(None);
        }
        Ok(Some(FragmentFile {
            dir,
            id: id.to_string(),
        }))
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        match fs::remove_dir_all(self.dir_for(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// One resumable upload buffer: an ordered sequence of fragments plus
/// labels and a creator attached before the transaction consumes it.
pub struct FragmentFile {
    dir: PathBuf,
    id: String,
}

impl FragmentFile {
    pub fn id(&self) -> &str {
        &self.id
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join(META_FILE)
    }

    fn read_meta(&self) -> Result<Meta> {
        let bytes = fs::read(self.meta_path())?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn fragment_paths(&self) -> Result<Vec<PathBuf>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name == META_FILE || name == SCRATCH_DIR {
                continue;
            }
            if name.chars().all(|c| c.is_ascii_digit()) {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names.into_iter().map(|n| self.dir.join(n)).collect())
    }

    /// Opens a writer for the next fragment in sequence. The fragment is
    /// written to a scratch file and only becomes part of the file's
    /// content once [`FragmentWriter::commit`] renames it into place.
    pub fn append(&self) -> Result<FragmentWriter> {
        let existing = self.fragment_paths()?;
        let next_n = existing.len() as u64 + 1;
        let scratch_path = self.dir.join(SCRATCH_DIR).join(uuid::Uuid::new_v4().to_string());
        let file = File::create(&scratch_path)?;
        Ok(FragmentWriter {
            file: Some(file),
            scratch_path,
            dest_path: self.dir.join(format!("{next_n:08}")),
        })
    }

    /// Opens a reader over every committed fragment, concatenated in
    /// write order.
    pub fn open(&self) -> Result<FragmentReader> {
        Ok(FragmentReader::new(self.fragment_paths()?))
    }

    pub fn stat(&self) -> Result<FileStat> {
        let meta = self.read_meta()?;
        let fragments = self.fragment_paths()?;
        let mut size = 0u64;
        for path in &fragments {
            size += fs::metadata(path)?.len();
        }
        Ok(FileStat {
            size,
            fragment_count: fragments.len() as u32,
            creator: meta.creator,
            labels: meta.labels,
            created_at: meta.created_at,
        })
    }

    /// Removes the most recently committed fragment.
    pub fn rollback(&self) -> Result<()> {
        let fragments = self.fragment_paths()?;
        let Some(last) = fragments.last() else {
            return Err(Error::NoFragments(self.id.clone()));
        };
        fs::remove_file(last)?;
        Ok(())
    }

    pub fn set_creator(&self, creator: impl Into<String>) -> Result<()> {
        let mut meta = self.read_meta()?;
        meta.creator = Some(creator.into());
        write_meta(&self.meta_path(), &meta)
    }

    pub fn set_labels(&self, labels: Vec<String>) -> Result<()> {
        let mut meta = self.read_meta()?;
        meta.labels = labels;
        write_meta(&self.meta_path(), &meta)
    }
}

fn write_meta(path: &Path, meta: &Meta) -> Result<()> {
    let bytes = serde_json::to_vec(meta)?;
    fs::write(path, bytes)?;
    Ok(())
}

/// An in-progress fragment append. Dropping without [`commit`](Self::commit)
/// discards it, leaving the file's prior content unchanged.
pub struct FragmentWriter {
    file: Option<File>,
    scratch_path: PathBuf,
    dest_path: PathBuf,
}

impl io::Write for FragmentWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.as_mut().expect("writer used after close").write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.as_mut().expect("writer used after close").flush()
    }
}

impl FragmentWriter {
    pub fn commit(mut self) -> Result<()> {
        if let Some(f) = self.file.take() {
            f.sync_all()?;
        }
        fs::rename(&self.scratch_path, &self.dest_path)?;
        tracing::debug!(path = %self.dest_path.display(), "fragment committed");
        Ok(())
    }

    pub fn abort(mut self) -> Result<()> {
        self.file.take();
        fs::remove_file(&self.scratch_path).ok();
        Ok(())
    }
}

impl Drop for FragmentWriter {
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

    #[test]
    fn append_then_open_concatenates_fragments() {
        let dir = tempfile::tempdir().unwrap();
        let store = FragmentStore::new(dir.path()).unwrap();
        let file = store.new_file("upload-1").unwrap();

        let mut w = file.append().unwrap();
        w.write_all(b"hello, ").unwrap();
        w.commit().unwrap();

        let mut w = file.append().unwrap();
        w.write_all(b"world!").unwrap();
        w.commit().unwrap();

        let mut buf = Vec::new();
        use std::io::Read;
        file.open().unwrap().read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello, world!");
        assert_eq!(file.stat().unwrap().fragment_count, 2);
        assert_eq!(file.stat().unwrap().size, 13);
    }

    #[test]
    fn rollback_removes_the_most_recent_fragment() {
        let dir = tempfile::tempdir().unwrap();
        let store = FragmentStore::new(dir.path()).unwrap();
        let file = store.new_file("upload-1").unwrap();

        let mut w = file.append().unwrap();
        w.write_all(b"keep").unwrap();
        w.commit().unwrap();

        let mut w = file.append().unwrap();
        w.write_all(b"drop-me").unwrap();
        w.commit().unwrap();

        file.rollback().unwrap();

        let mut buf = Vec::new();
        use std::io::Read;
        file.open().unwrap().read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"keep");
    }

    #[test]
    fn rollback_on_empty_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = FragmentStore::new(dir.path()).unwrap();
        let file = store.new_file("upload-1").unwrap();
        assert!(matches!(file.rollback(), Err(Error::NoFragments(_))));
    }

    #[test]
    fn dropped_writer_without_commit_leaves_file_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = FragmentStore::new(dir.path()).unwrap();
        let file = store.new_file("upload-1").unwrap();

        {
            let mut w = file.append().unwrap();
            w.write_all(b"abandoned").unwrap();
        }

        assert_eq!(file.stat().unwrap().fragment_count, 0);
    }

    #[test]
    fn labels_and_creator_round_trip_through_stat() {
        let dir = tempfile::tempdir().unwrap();
        let store = FragmentStore::new(dir.path()).unwrap();
        let file = store.new_file("upload-1").unwrap();
        file.set_creator("alice").unwrap();
        file.set_labels(vec!["a".to_string(), "b".to_string()]).unwrap();

        let stat = file.stat().unwrap();
        assert_eq!(stat.creator.as_deref(), Some("alice"));
        assert_eq!(stat.labels, vec!["a", "b"]);
    }

    #[test]
    fn lookup_of_unknown_id_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FragmentStore::new(dir.path()).unwrap();
        assert!(store.lookup("nope").unwrap().is_none());
    }

    #[test]
    fn delete_removes_the_file_and_lookup_then_misses() {
        let dir = tempfile::tempdir().unwrap();
        let store = FragmentStore::new(dir.path()).unwrap();
        store.new_file("upload-1").unwrap();
        store.delete("upload-1").unwrap();
        assert!(store.lookup("upload-1").unwrap().is_none());
    }
}
