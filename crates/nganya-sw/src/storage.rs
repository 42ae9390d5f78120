//! Cache generations and their storage backends.
//!
//! A generation is a named set of request key → [`CacheEntry`] pairs.
//! Writes happen only through [`CacheStore::put_all`], which commits a whole
//! batch at once, and [`CacheStore::delete`], which destroys a generation.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hashbrown::HashMap;
use nganya_net::Response;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Errors raised by a storage backend.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Corrupt cache file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ==================== Entry ====================

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request key.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers in wire order, values as raw bytes.
    #[serde(with = "headers_base64")]
    pub headers: Vec<(String, Vec<u8>)>,

    /// Response body.
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Capture a network response under the given request key.
    pub fn from_response(key: impl Into<String>, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect();

        Self {
            url: key.into(),
            method: "GET".to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body.to_vec(),
            cached_at: now_ms(),
        }
    }
}

mod body_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

mod headers_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        headers: &[(String, Vec<u8>)],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        headers
            .iter()
            .map(|(name, value)| (name.as_str(), STANDARD.encode(value)))
            .collect::<Vec<_>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<(String, Vec<u8>)>, D::Error> {
        Vec::<(String, String)>::deserialize(deserializer)?
            .into_iter()
            .map(|(name, value)| {
                STANDARD
                    .decode(value)
                    .map(|bytes| (name, bytes))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

// ==================== Cache ====================

/// One cache generation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cache {
    /// Generation name.
    pub name: String,

    /// Created at timestamp (ms since epoch).
    pub created_at: u64,

    /// Entries in insertion order.
    entries: Vec<CacheEntry>,

    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl Cache {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            created_at: now_ms(),
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Match a request key.
    pub fn match_request(&self, key: &str) -> Option<&CacheEntry> {
        self.index.get(key).map(|&i| &self.entries[i])
    }

    /// Store an entry, replacing any entry with the same key.
    pub fn put(&mut self, entry: CacheEntry) {
        match self.index.get(&entry.url) {
            Some(&i) => self.entries[i] = entry,
            None => {
                self.index.insert(entry.url.clone(), self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Request keys in insertion order.
    pub fn keys(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.url.as_str()).collect()
    }

    fn rebuild_index(&mut self) {
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.url.clone(), i))
            .collect();
    }
}

/// Generations in creation order.
#[derive(Debug, Default)]
struct Generations {
    caches: HashMap<String, Cache>,
    order: Vec<String>,
    /// Generation last recorded as serving.
    active: Option<String>,
}

impl Generations {
    fn keys(&self) -> Vec<String> {
        self.order.clone()
    }

    fn insert(&mut self, cache: Cache) {
        if !self.caches.contains_key(&cache.name) {
            self.order.push(cache.name.clone());
        }
        self.caches.insert(cache.name.clone(), cache);
    }

    fn remove(&mut self, name: &str) -> bool {
        self.order.retain(|n| n != name);
        self.caches.remove(name).is_some()
    }

    /// Recorded active generation, if it still exists.
    fn active(&self) -> Option<String> {
        self.active
            .as_ref()
            .filter(|name| self.caches.contains_key(name.as_str()))
            .cloned()
    }

    /// Copy of `name` with `entries` applied, created if missing.
    fn staged(&self, name: &str, entries: Vec<CacheEntry>) -> Cache {
        let mut cache = self
            .caches
            .get(name)
            .cloned()
            .unwrap_or_else(|| Cache::new(name));
        for entry in entries {
            cache.put(entry);
        }
        cache
    }

    fn entry_count(&self, name: &str) -> usize {
        self.caches.get(name).map_or(0, Cache::len)
    }

    fn match_request(&self, name: &str, key: &str) -> Option<CacheEntry> {
        self.caches.get(name)?.match_request(key).cloned()
    }
}

// ==================== Store ====================

/// Storage handle shared by the lifecycle and fetch handlers.
///
/// Implementations serialize concurrent access themselves.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Generation names in creation order.
    async fn keys(&self) -> Result<Vec<String>, StorageError>;

    async fn has(&self, name: &str) -> Result<bool, StorageError>;

    /// Commit `entries` into generation `name`, creating it if needed.
    /// Either every entry is stored or none is.
    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<(), StorageError>;

    async fn match_request(&self, name: &str, key: &str)
        -> Result<Option<CacheEntry>, StorageError>;

    /// Number of entries in `name`, zero if it does not exist.
    async fn entry_count(&self, name: &str) -> Result<usize, StorageError>;

    /// Destroy a generation. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool, StorageError>;

    /// Generation recorded by the last [`set_active`](Self::set_active),
    /// or `None` if it was never set or no longer exists.
    async fn active(&self) -> Result<Option<String>, StorageError>;

    /// Record the generation that serves fetches.
    async fn set_active(&self, name: &str) -> Result<(), StorageError>;
}

/// In-memory cache storage.
#[derive(Debug, Default)]
pub struct CacheStorage {
    generations: RwLock<Generations>,
}

impl CacheStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for CacheStorage {
    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.generations.read().await.keys())
    }

    async fn has(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.generations.read().await.caches.contains_key(name))
    }

    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<(), StorageError> {
        let mut generations = self.generations.write().await;
        let cache = generations.staged(name, entries);
        generations.insert(cache);
        Ok(())
    }

    async fn match_request(
        &self,
        name: &str,
        key: &str,
    ) -> Result<Option<CacheEntry>, StorageError> {
        Ok(self.generations.read().await.match_request(name, key))
    }

    async fn entry_count(&self, name: &str) -> Result<usize, StorageError> {
        Ok(self.generations.read().await.entry_count(name))
    }

    async fn delete(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.generations.write().await.remove(name))
    }

    async fn active(&self) -> Result<Option<String>, StorageError> {
        Ok(self.generations.read().await.active())
    }

    async fn set_active(&self, name: &str) -> Result<(), StorageError> {
        self.generations.write().await.active = Some(name.to_string());
        Ok(())
    }
}

/// Cache storage persisted as one JSON document per generation.
///
/// Documents are written to a temporary file and renamed into place, so a
/// reader never sees a partially written generation. The active generation
/// name is kept in a separate `ACTIVE` file.
#[derive(Debug)]
pub struct DiskCacheStorage {
    dir: PathBuf,
    generations: RwLock<Generations>,
}

const ACTIVE_FILE: &str = "ACTIVE";

impl DiskCacheStorage {
    /// Open the storage directory, loading every generation in it.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut loaded = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        while let Some(item) = read_dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            loaded.push(Self::read_generation(&path).await?);
        }
        loaded.sort_by_key(|c| c.created_at);

        let mut generations = Generations::default();
        for cache in loaded {
            generations.insert(cache);
        }
        generations.active = match tokio::fs::read_to_string(dir.join(ACTIVE_FILE)).await {
            Ok(name) => Some(name.trim_end().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        info!(
            dir = %dir.display(),
            generations = generations.order.len(),
            active = ?generations.active,
            "Opened cache storage"
        );

        Ok(Self {
            dir,
            generations: RwLock::new(generations),
        })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", URL_SAFE_NO_PAD.encode(name.as_bytes())))
    }

    async fn read_generation(path: &Path) -> Result<Cache, StorageError> {
        let bytes = tokio::fs::read(path).await?;
        let mut cache: Cache =
            serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        cache.rebuild_index();
        Ok(cache)
    }

    async fn write_generation(&self, cache: &Cache) -> Result<(), StorageError> {
        let path = self.path_for(&cache.name);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec(cache)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(cache = %cache.name, path = %path.display(), "Wrote generation");
        Ok(())
    }

    async fn write_active(&self, name: &str) -> Result<(), StorageError> {
        let path = self.dir.join(ACTIVE_FILE);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, name.as_bytes()).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl CacheStore for DiskCacheStorage {
    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.generations.read().await.keys())
    }

    async fn has(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.generations.read().await.caches.contains_key(name))
    }

    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<(), StorageError> {
        let mut generations = self.generations.write().await;
        let cache = generations.staged(name, entries);
        self.write_generation(&cache).await?;
        generations.insert(cache);
        Ok(())
    }

    async fn match_request(
        &self,
        name: &str,
        key: &str,
    ) -> Result<Option<CacheEntry>, StorageError> {
        Ok(self.generations.read().await.match_request(name, key))
    }

    async fn entry_count(&self, name: &str) -> Result<usize, StorageError> {
        Ok(self.generations.read().await.entry_count(name))
    }

    async fn delete(&self, name: &str) -> Result<bool, StorageError> {
        let mut generations = self.generations.write().await;
        match tokio::fs::remove_file(self.path_for(name)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(generations.remove(name))
    }

    async fn active(&self) -> Result<Option<String>, StorageError> {
        Ok(self.generations.read().await.active())
    }

    async fn set_active(&self, name: &str) -> Result<(), StorageError> {
        let mut generations = self.generations.write().await;
        self.write_active(name).await?;
        generations.active = Some(name.to_string());
        debug!(cache = %name, "Recorded active generation");
        Ok(())
    }
}
