use std::collections::HashMap;
use std::io::{Cursor, Seek, Write};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::traits::{BundleStore, BundleWriter};

/// An in-memory [`BundleStore`], used by unit and integration tests and as
/// a reference implementation for the store contract's conformance suite.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    // `None` marks a key reserved by an in-flight `create` that hasn't
    // committed yet, so a second `create` for the same key still fails
    // with `KeyExists` before either writer closes.
    entries: HashMap<String, Option<Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BundleStore for MemoryStore {
    fn list(&self) -> Result<Box<dyn Iterator<Item = Result<String>> + Send>> {
        let guard = self.inner.lock().unwrap();
        let keys: Vec<String> = guard
            .entries
            .iter()
            .filter_map(|(k, v)| v.as_ref().map(|_| k.clone()))
            .collect();
        Ok(Box::new(keys.into_iter().map(Ok)))
    }

    fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let guard = self.inner.lock().unwrap();
        Ok(guard
            .entries
            .iter()
            .filter(|(k, v)| v.is_some() && k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn open(&self, key: &str) -> Result<(Box<dyn crate::traits::ReadSeek>, u64)> {
        let guard = self.inner.lock().unwrap();
        match guard.entries.get(key) {
            Some(Some(bytes)) => {
                let len = bytes.len() as u64;
                Ok((Box::new(Cursor::new(bytes.clone())), len))
            }
            _ => Err(Error::NotExist(key.to_string())),
        }
    }

    fn create(&self, key: &str) -> Result<Box<dyn BundleWriter>> {
        let mut guard = self.inner.lock().unwrap();
        if guard.entries.contains_key(key) {
            return Err(Error::KeyExists(key.to_string()));
        }
        guard.entries.insert(key.to_string(), None);
        Ok(Box::new(MemoryWriter {
            store: self.inner.clone(),
            key: key.to_string(),
            buf: Cursor::new(Vec::new()),
            done: false,
        }))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        guard.entries.remove(key);
        Ok(())
    }
}

struct MemoryWriter {
    store: Arc<Mutex<Inner>>,
    key: String,
    buf: Cursor<Vec<u8>>,
    done: bool,
}

impl Write for MemoryWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.write(data)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.buf.flush()
    }
}

impl std::io::Seek for MemoryWriter {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        self.buf.seek(pos)
    }
}

impl BundleWriter for MemoryWriter {
    fn commit(mut self: Box<Self>) -> Result<()> {
        self.done = true;
        let mut guard = self.store.lock().unwrap();
        guard
            .entries
            .insert(self.key.clone(), Some(self.buf.get_ref().clone()));
        Ok(())
    }

    fn abort(mut self: Box<Self>) -> Result<()> {
        self.done = true;
        let mut guard = self.store.lock().unwrap();
        guard.entries.remove(&self.key);
        Ok(())
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        if !self.done {
            let mut guard = self.store.lock().unwrap();
            guard.entries.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;

    #[test]
    fn create_write_commit_then_open_roundtrips() {
        let store = MemoryStore::new();
        let mut w = store.create("a-0001").unwrap();
        w.write_all(b"hello").unwrap();
        w.commit().unwrap();

        let (mut r, size) = store.open("a-0001").unwrap();
        assert_eq!(size, 5);
        let mut buf = Vec::new();
        r.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello");
    }

    #[test]
    fn create_twice_fails_with_key_exists() {
        let store = MemoryStore::new();
        let w = store.create("a-0001").unwrap();
        w.commit().unwrap();
        let err = store.create("a-0001").unwrap_err();
        assert!(matches!(err, Error::KeyExists(_)));
    }

    #[test]
    fn open_missing_key_fails_with_not_exist() {
        let store = MemoryStore::new();
        let err = store.open("nope").unwrap_err();
        assert!(matches!(err, Error::NotExist(_)));
    }

    #[test]
    fn dropping_writer_without_commit_leaves_no_trace() {
        let store = MemoryStore::new();
        {
            let mut w = store.create("a-0001").unwrap();
            w.write_all(b"partial").unwrap();
        }
        assert!(store.open("a-0001").is_err());
        // and the key is free to be created again
        let w = store.create("a-0001").unwrap();
        w.commit().unwrap();
        assert!(store.open("a-0001").is_ok());
    }

    #[test]
    fn delete_missing_key_is_not_an_error() {
        let store = MemoryStore::new();
        store.delete("never-existed").unwrap();
    }

    #[test]
    fn list_prefix_filters_reserved_and_unrelated_keys() {
        let store = MemoryStore::new();
        for key in ["it-1-0001", "it-1-0002", "it-2-0001"] {
            let w = store.create(key).unwrap();
            w.commit().unwrap();
        }
        let _reserved = store.create("it-1-0003").unwrap(); // never committed
        let mut found = store.list_prefix("it-1-").unwrap();
        found.sort();
        assert_eq!(found, vec!["it-1-0001", "it-1-0002"]);
    }
}
