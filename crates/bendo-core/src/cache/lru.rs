use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use bendo_store::{BundleStore, BundleWriter};

use super::blob_cache::{BlobCache, BlobCacheStats, BlobCacheWriter};
use crate::error::{Error, Result};

struct LruState {
    /// Least-recently-used at the front, most-recently-used at the back.
    order: VecDeque<String>,
    sizes: HashMap<String, u64>,
    total_bytes: u64,
    /// Bytes promised to writers that haven't committed yet.
    reserved: u64,
    pending: HashSet<String>,
}

struct Shared {
    backing: Arc<dyn BundleStore>,
    capacity_bytes: u64,
    state: Mutex<LruState>,
}

impl Shared {
    /// Evicts from the LRU tail until `extra` more bytes would fit, or
    /// gives up (returns `false`) once there's nothing left to evict.
    /// Victim keys are decided under the structural lock, but the backing
    /// delete itself runs after the lock is released (spec §5: never hold
    /// a lock across a bundle store call).
    fn reserve(&self, extra: u64) -> bool {
        let mut victims = Vec::new();
        let admitted = {
            let mut state = self.state.lock().unwrap();
            loop {
                if state.total_bytes + state.reserved + extra <= self.capacity_bytes {
                    state.reserved += extra;
                    break true;
                }
                let Some(victim) = state.order.pop_front() else {
                    break false;
                };
                if let Some(size) = state.sizes.remove(&victim) {
                    state.total_bytes = state.total_bytes.saturating_sub(size);
                }
                victims.push(victim);
            }
        };
        for victim in victims {
            let _ = self.backing.delete(&victim);
        }
        admitted
    }
}

/// Fixed-byte-capacity blob cache (spec §4.4 policy 1). Backed by any
/// [`BundleStore`] used purely as fast cache storage.
#[derive(Clone)]
pub struct LruBlobCache(Arc<Shared>);

impl LruBlobCache {
    pub fn new(backing: Arc<dyn BundleStore>, capacity_bytes: u64) -> Self {
        Self(Arc::new(Shared {
            backing,
            capacity_bytes,
            state: Mutex::new(LruState {
                order: VecDeque::new(),
                sizes: HashMap::new(),
                total_bytes: 0,
                reserved: 0,
                pending: HashSet::new(),
            }),
        }))
    }

    /// Reconciles the in-memory LRU list with the backing store: entries
    /// present in the store but unknown to the list are adopted. Entries
    /// known to the list but missing from the store are left for `get`'s
    /// lazy miss-handling to drop (spec §4.4).
    pub fn scan(&self) -> Result<()> {
        let keys: Vec<String> = self
            .0
            .backing
            .list()?
            .filter_map(|res| match res {
                Ok(key) => Some(key),
                Err(e) => {
                    tracing::warn!(error = %e, "error scanning backing store during cache scan");
                    None
                }
            })
            .collect();
        for key in keys {
            let already_tracked = self.0.state.lock().unwrap().sizes.contains_key(&key);
            if already_tracked {
                continue;
            }
            let (_reader, size) = match self.0.backing.open(&key) {
                Ok(v) => v,
                Err(_) => continue,
            };
            let mut state = self.0.state.lock().unwrap();
            if state.sizes.contains_key(&key) {
                continue;
            }
            state.order.push_back(key.clone());
            state.sizes.insert(key, size);
            state.total_bytes += size;
        }
        Ok(())
    }
}

impl BlobCache for LruBlobCache {
    fn contains(&self, key: &str) -> bool {
        self.0.state.lock().unwrap().sizes.contains_key(key)
    }

    fn get(&self, key: &str) -> Result<Option<(Box<dyn bendo_store::ReadSeek>, u64)>> {
        match self.0.backing.open(key) {
            Ok((reader, size)) => {
                let mut state = self.0.state.lock().unwrap();
                state.order.retain(|k| k != key);
                state.order.push_back(key.to_string());
                if !state.sizes.contains_key(key) {
                    state.sizes.insert(key.to_string(), size);
                    state.total_bytes += size;
                }
                Ok(Some((reader, size)))
            }
            Err(bendo_store::Error::NotExist(_)) => {
                let mut state = self.0.state.lock().unwrap();
                state.order.retain(|k| k != key);
                if let Some(size) = state.sizes.remove(key) {
                    state.total_bytes = state.total_bytes.saturating_sub(size);
                }
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str) -> Result<Box<dyn BlobCacheWriter>> {
        {
            let mut state = self.0.state.lock().unwrap();
            if !state.pending.insert(key.to_string()) {
                return Err(Error::PutPending(key.to_string()));
            }
        }
        let _ = self.0.backing.delete(key);
        {
            let mut state = self.0.state.lock().unwrap();
            state.order.retain(|k| k != key);
            if let Some(size) = state.sizes.remove(key) {
                state.total_bytes = state.total_bytes.saturating_sub(size);
            }
        }
        let inner = match self.0.backing.create(key) {
            Ok(w) => w,
            Err(e) => {
                self.0.state.lock().unwrap().pending.remove(key);
                return Err(e.into());
            }
        };
        Ok(Box::new(LruCacheWriter {
            shared: self.0.clone(),
            key: key.to_string(),
            inner: Some(inner),
            running: 0,
            tainted: false,
        }))
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.0.backing.delete(key)?;
        let mut state = self.0.state.lock().unwrap();
        state.order.retain(|k| k != key);
        if let Some(size) = state.sizes.remove(key) {
            state.total_bytes = state.total_bytes.saturating_sub(size);
        }
        Ok(())
    }

    fn stats(&self) -> BlobCacheStats {
        let state = self.0.state.lock().unwrap();
        BlobCacheStats {
            entries: state.sizes.len() as u64,
            bytes: state.total_bytes,
            capacity_bytes: Some(self.0.capacity_bytes),
        }
    }
}

struct LruCacheWriter {
    shared: Arc<Shared>,
    key: String,
    inner: Option<Box<dyn bendo_store::BundleWriter>>,
    running: u64,
    tainted: bool,
}

impl Write for LruCacheWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.tainted {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, Error::CacheFull));
        }
        if !self.shared.reserve(buf.len() as u64) {
            self.tainted = true;
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, Error::CacheFull));
        }
        let n = self.inner.as_mut().unwrap().write(buf)?;
        self.running += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.as_mut().unwrap().flush()
    }
}

impl BlobCacheWriter for LruCacheWriter {
    fn commit(mut self: Box<Self>) -> Result<()> {
        self.shared.state.lock().unwrap().pending.remove(&self.key);
        if self.tainted {
            if let Some(inner) = self.inner.take() {
                let _ = inner.abort();
            }
            let mut state = self.shared.state.lock().unwrap();
            state.reserved = state.reserved.saturating_sub(self.running);
            return Err(Error::CacheFull);
        }
        self.inner.take().unwrap().commit()?;
        let mut state = self.shared.state.lock().unwrap();
        state.reserved = state.reserved.saturating_sub(self.running);
        state.total_bytes += self.running;
        state.sizes.insert(self.key.clone(), self.running);
        state.order.push_back(self.key.clone());
        Ok(())
    }

    fn abort(mut self: Box<Self>) -> Result<()> {
        self.shared.state.lock().unwrap().pending.remove(&self.key);
        if let Some(inner) = self.inner.take() {
            inner.abort()?;
        }
        let mut state = self.shared.state.lock().unwrap();
        state.reserved = state.reserved.saturating_sub(self.running);
        Ok(())
    }
}

impl Drop for LruCacheWriter {
    fn drop(&mut self) {
        self.shared.state.lock().unwrap().pending.remove(&self.key);
        if let Some(inner) = self.inner.take() {
            let _ = inner.abort();
        }
    }
}
