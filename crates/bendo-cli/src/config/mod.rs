use std::path::PathBuf;

use serde::Deserialize;

mod app_env;

pub use app_env::app_env;

/// Top-level settings for the `bendo` binary, loaded by [`load_settings`].
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Settings {
    pub store: StoreSettings,
    pub cache: CacheSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store: StoreSettings::default(),
            cache: CacheSettings::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Filesystem,
}

impl Default for StoreBackend {
    fn default() -> Self {
        StoreBackend::Memory
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    /// Root directory for the `filesystem` backend; ignored by `memory`.
    pub path: Option<PathBuf>,
    /// Soft per-bundle size target the packer uses when ingesting new
    /// blobs (spec §4.5 step 2).
    pub ideal_bundle_size_bytes: i64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: None,
            ideal_bundle_size_bytes: bendo_core::transaction::IDEAL_BUNDLE_SIZE,
        }
    }
}

/// Which blob-byte eviction policy to wrap the store with, if any (spec
/// §4.4).
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum BlobCacheSettings {
    None,
    Lru { capacity_bytes: u64 },
    Ttl { ttl_seconds: u64, index_path: Option<PathBuf> },
}

impl Default for BlobCacheSettings {
    fn default() -> Self {
        BlobCacheSettings::None
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheSettings {
    pub blob_cache: BlobCacheSettings,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            blob_cache: BlobCacheSettings::default(),
        }
    }
}

/// Loads settings layered `base` + `<APP_ENV>` file + `BENDO_`-prefixed
/// environment variables, mirroring this codebase's own
/// `control::config::load_settings`. Unlike a long-running server, a CLI
/// invocation may reasonably have no config directory at all, so both
/// files are optional; every field falls back to its [`Default`].
pub fn load_settings(config_dir: &std::path::Path) -> Result<Settings, config::ConfigError> {
    let mut config = config::Config::default();
    config.merge(config::File::from(config_dir.join("base")).required(false))?;
    config.merge(config::File::from(config_dir.join(app_env().as_str())).required(false))?;
    config.merge(config::Environment::with_prefix("BENDO").separator("__"))?;
    config.try_into()
}
