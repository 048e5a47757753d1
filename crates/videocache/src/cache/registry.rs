//! Process-wide URL to [`FileCache`] mapping.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::file_cache::FileCache;

/// Directory under the cache root holding all cached media.
const CACHE_DIR_NAME: &str = "video-cache";

/// Owns every [`FileCache`], guaranteeing a single instance per URL.
pub struct CacheRegistry {
    cache_dir: PathBuf,
    entries: DashMap<String, Arc<FileCache>>,
}

impl CacheRegistry {
    /// Create the registry rooted at `<root>/video-cache`, creating the
    /// directory tree as needed.
    pub fn new(root: &Path) -> io::Result<Self> {
        let cache_dir = root.join(CACHE_DIR_NAME);
        std::fs::create_dir_all(&cache_dir)?;
        Ok(Self {
            cache_dir,
            entries: DashMap::new(),
        })
    }

    /// The existing cache for `url`, or an atomically inserted new one.
    pub fn get_file_cache(&self, url: &str) -> io::Result<Arc<FileCache>> {
        match self.entries.entry(url.to_owned()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let cache = Arc::new(FileCache::open(url, &self.cache_dir)?);
                entry.insert(cache.clone());
                Ok(cache)
            }
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Close and drop every entry. Cached bytes stay on disk.
    pub fn clear(&self) {
        for entry in self.entries.iter() {
            entry.value().close();
        }
        self.entries.clear();
    }
}
