//! Precache manifest and request keys.

use hashbrown::HashSet;
use url::Url;

use crate::CacheError;

/// Cache key for a request URL: the absolute URL without its fragment.
pub fn request_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

/// Ordered list of URLs fetched into a generation at install time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrecacheManifest {
    urls: Vec<Url>,
}

impl PrecacheManifest {
    /// Resolve manifest entries against the site origin.
    ///
    /// Root-relative entries join the origin; absolute entries are kept.
    /// Two entries with the same request key are rejected.
    pub fn resolve<S: AsRef<str>>(origin: &Url, entries: &[S]) -> Result<Self, CacheError> {
        let mut seen = HashSet::new();
        let mut urls = Vec::with_capacity(entries.len());

        for entry in entries {
            let entry = entry.as_ref();
            let url = origin
                .join(entry)
                .map_err(|e| CacheError::InvalidManifest(format!("{entry:?}: {e}")))?;
            if !seen.insert(request_key(&url)) {
                return Err(CacheError::InvalidManifest(format!(
                    "duplicate entry {url}"
                )));
            }
            urls.push(url);
        }

        Ok(Self { urls })
    }

    pub fn urls(&self) -> &[Url] {
        &self.urls
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}

/// A deployable worker version: a generation name and what it precaches.
///
/// Changing the name is the only way to invalidate previously cached assets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerVersion {
    pub cache_name: String,
    pub manifest: PrecacheManifest,
}

impl WorkerVersion {
    pub fn new(cache_name: impl Into<String>, manifest: PrecacheManifest) -> Self {
        Self {
            cache_name: cache_name.into(),
            manifest,
        }
    }
}
