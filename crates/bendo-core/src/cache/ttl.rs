use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bendo_store::{BundleStore, BundleWriter};
use chrono::{DateTime, Utc};

use super::blob_cache::{BlobCache, BlobCacheStats, BlobCacheWriter};
use crate::error::{Error, Result};

struct TtlState {
    expires_at: HashMap<String, DateTime<Utc>>,
    pending: HashSet<String>,
}

struct Shared {
    backing: Arc<dyn BundleStore>,
    ttl: Duration,
    index_path: Option<PathBuf>,
    state: Mutex<TtlState>,
}

/// Time-based blob cache (spec §4.4 policy 2). Each entry carries an
/// expires-at timestamp refreshed on every `get`; a background sweeper
/// (see [`TtlBlobCache::sweep_once`]) walks the index and drops entries
/// whose expiry, re-checked, is still in the past. The on-disk index is
/// advisory: the backing store's contents are authoritative on
/// disagreement.
#[derive(Clone)]
pub struct TtlBlobCache(Arc<Shared>);

impl TtlBlobCache {
    pub fn new(backing: Arc<dyn BundleStore>, ttl: Duration, index_path: Option<PathBuf>) -> Self {
        let expires_at = index_path
            .as_deref()
            .and_then(|p| load_index(p).ok())
            .unwrap_or_default();
        Self(Arc::new(Shared {
            backing,
            ttl,
            index_path,
            state: Mutex::new(TtlState {
                expires_at,
                pending: HashSet::new(),
            }),
        }))
    }

    /// The interval a background sweeper should run at (spec §4.4:
    /// `min(ttl/4, 24h)`).
    pub fn sweep_interval(&self) -> Duration {
        (self.0.ttl / 4).min(Duration::from_secs(24 * 3600))
    }

    /// Removes every entry whose expiry, re-checked against the index, is
    /// still in the past. Persists the index afterward. Returns the
    /// number of entries removed.
    pub fn sweep_once(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<String> = {
            let state = self.0.state.lock().unwrap();
            state
                .expires_at
                .iter()
                .filter(|(_, exp)| **exp <= now)
                .map(|(k, _)| k.clone())
                .collect()
        };
        let mut removed = 0;
        for key in expired {
            let still_expired = {
                let state = self.0.state.lock().unwrap();
                state.expires_at.get(&key).map(|e| *e <= now).unwrap_or(false)
            };
            if !still_expired {
                continue;
            }
            let _ = self.0.backing.delete(&key);
            self.0.state.lock().unwrap().expires_at.remove(&key);
            removed += 1;
        }
        self.persist_index();
        removed
    }

    fn persist_index(&self) {
        let Some(path) = &self.0.index_path else {
            return;
        };
        let snapshot = self.0.state.lock().unwrap().expires_at.clone();
        if let Err(e) = save_index(path, &snapshot) {
            tracing::warn!(error = %e, "failed to persist blob-cache ttl index");
        }
    }

    /// Spawns a background task that calls [`Self::sweep_once`] on
    /// [`Self::sweep_interval`], stopping once `stop` is closed (spec §5:
    /// background workers honor a cooperative stop signal and drain
    /// before exit).
    pub fn spawn_sweeper(self, mut stop: tokio::sync::watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::task::spawn(async move {
            let mut interval = tokio::time::interval(self.sweep_interval());
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let cache = self.clone();
                        let removed = tokio::task::spawn_blocking(move || cache.sweep_once())
                            .await
                            .unwrap_or(0);
                        if removed > 0 {
                            tracing::debug!(removed, "ttl sweep removed expired blob-cache entries");
                        }
                    }
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

fn expiry_from(ttl: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero())
}

fn load_index(path: &Path) -> Result<HashMap<String, DateTime<Utc>>> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn save_index(path: &Path, index: &HashMap<String, DateTime<Utc>>) -> Result<()> {
    let bytes = serde_json::to_vec(index)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

impl BlobCache for TtlBlobCache {
    fn contains(&self, key: &str) -> bool {
        let state = self.0.state.lock().unwrap();
        state
            .expires_at
            .get(key)
            .map(|exp| *exp > Utc::now())
            .unwrap_or(false)
    }

    fn get(&self, key: &str) -> Result<Option<(Box<dyn bendo_store::ReadSeek>, u64)>> {
        let tracked_and_live = {
            let state = self.0.state.lock().unwrap();
            state.expires_at.get(key).map(|exp| *exp > Utc::now())
        };
        if tracked_and_live == Some(false) {
            self.0.state.lock().unwrap().expires_at.remove(key);
            return Ok(None);
        }
        if tracked_and_live.is_none() {
            return Ok(None);
        }
        match self.0.backing.open(key) {
            Ok((reader, size)) => {
                self.0
                    .state
                    .lock()
                    .unwrap()
                    .expires_at
                    .insert(key.to_string(), expiry_from(self.0.ttl));
                Ok(Some((reader, size)))
            }
            Err(bendo_store::Error::NotExist(_)) => {
                self.0.state.lock().unwrap().expires_at.remove(key);
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
        let inner = match self.0.backing.create(key) {
            Ok(w) => w,
            Err(e) => {
                self.0.state.lock().unwrap().pending.remove(key);
                return Err(e.into());
            }
        };
        Ok(Box::new(TtlCacheWriter {
            shared: self.0.clone(),
            key: key.to_string(),
            inner: Some(inner),
        }))
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.0.backing.delete(key)?;
        self.0.state.lock().unwrap().expires_at.remove(key);
        Ok(())
    }

    fn stats(&self) -> BlobCacheStats {
        let state = self.0.state.lock().unwrap();
        BlobCacheStats {
            entries: state.expires_at.len() as u64,
            bytes: 0,
            capacity_bytes: None,
        }
    }
}

struct TtlCacheWriter {
    shared: Arc<Shared>,
    key: String,
    inner: Option<Box<dyn bendo_store::BundleWriter>>,
}

impl Write for TtlCacheWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.as_mut().unwrap().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.as_mut().unwrap().flush()
    }
}

impl BlobCacheWriter for TtlCacheWriter {
    fn commit(mut self: Box<Self>) -> Result<()> {
        self.shared.state.lock().unwrap().pending.remove(&self.key);
        self.inner.take().unwrap().commit()?;
        self.shared
            .state
            .lock()
            .unwrap()
            .expires_at
            .insert(self.key.clone(), expiry_from(self.shared.ttl));
        Ok(())
    }

    fn abort(mut self: Box<Self>) -> Result<()> {
        self.shared.state.lock().unwrap().pending.remove(&self.key);
        if let Some(inner) = self.inner.take() {
            inner.abort()?;
        }
        Ok(())
    }
}

impl Drop for TtlCacheWriter {
    fn drop(&mut self) {
        self.shared.state.lock().unwrap().pending.remove(&self.key);
        if let Some(inner) = self.inner.take() {
            let _ = inner.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bendo_store::MemoryStore;

    fn cache(ttl: Duration) -> TtlBlobCache {
        TtlBlobCache::new(Arc::new(MemoryStore::new()), ttl, None)
    }

    #[test]
    fn put_then_get_roundtrips_and_refreshes_expiry() {
        let c = cache(Duration::from_secs(3600));
        let mut w = c.put("a").unwrap();
        w.write_all(b"hello").unwrap();
        w.commit().unwrap();

        assert!(c.contains("a"));
        let (mut r, size) = c.get("a").unwrap().unwrap();
        assert_eq!(size, 5);
        let mut buf = Vec::new();
        use std::io::Read;
        r.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello");
    }

    #[test]
    fn expired_entry_is_treated_as_a_miss_even_if_not_yet_swept() {
        let c = cache(Duration::from_secs(0));
        let mut w = c.put("a").unwrap();
        w.write_all(b"hello").unwrap();
        w.commit().unwrap();

        assert!(c.get("a").unwrap().is_none());
    }

    #[test]
    fn sweep_removes_expired_entries_and_leaves_live_ones() {
        let c = cache(Duration::from_secs(0));
        let mut w = c.put("stale").unwrap();
        w.write_all(b"old").unwrap();
        w.commit().unwrap();

        let removed = c.sweep_once();
        assert_eq!(removed, 1);
        assert!(!c.contains("stale"));
    }

    #[test]
    fn second_concurrent_put_for_same_key_fails_with_put_pending() {
        let c = cache(Duration::from_secs(60));
        let _w = c.put("a").unwrap();
        assert!(matches!(c.put("a"), Err(Error::PutPending(_))));
    }

    #[test]
    fn index_persists_and_reloads_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join("ttl-index.json");
        let backing = Arc::new(MemoryStore::new());

        let c1 = TtlBlobCache::new(backing.clone(), Duration::from_secs(3600), Some(index_path.clone()));
        let mut w = c1.put("a").unwrap();
        w.write_all(b"hello").unwrap();
        w.commit().unwrap();
        c1.sweep_once();

        let c2 = TtlBlobCache::new(backing, Duration::from_secs(3600), Some(index_path));
        assert!(c2.contains("a"));
    }
}
