use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::VideoCacheError;

/// Callbacks for the progressive proxy path, fanned out per URL by the
/// manager. Implementations must be cheap; they run on the connection task.
pub trait CacheEventListener: Send + Sync {
    /// Periodic download progress. `percents` is `total*100/len` when the
    /// origin advertised a length, otherwise a `total/8192` surrogate.
    fn on_cache_progress(&self, url: &str, percents: u32);

    /// The full resource is on disk.
    fn on_cache_available(&self, url: &str, file: &Path);

    /// The fetch failed after local retries were exhausted.
    fn on_cache_error(&self, url: &str, percents: u32, error: &VideoCacheError);
}

/// Callbacks emitted by an [`M3u8Cache`](crate::hls::M3u8Cache) run.
pub trait M3u8CacheListener: Send + Sync {
    fn on_progress(&self, completed: usize, total: usize, failed: usize);

    fn on_error(&self, error: &str);

    /// Fired once when every segment has resolved. `local_path` points at the
    /// rewritten playlist when at least one segment succeeded.
    fn on_complete(&self, success: bool, local_path: Option<&Path>);

    /// Fired once, as soon as enough segments are cached to start playback.
    fn on_ready_for_playback(&self, local_path: &Path);
}

/// URL-keyed listener registry. The proxy reports every event here; the hub
/// routes it to the listener registered for that URL, if any.
#[derive(Default)]
pub(crate) struct ListenerHub {
    listeners: DashMap<String, Arc<dyn CacheEventListener>>,
}

impl ListenerHub {
    pub fn register(&self, url: &str, listener: Arc<dyn CacheEventListener>) {
        self.listeners.insert(url.to_owned(), listener);
    }

    pub fn unregister(&self, url: &str) {
        self.listeners.remove(url);
    }

    pub fn clear(&self) {
        self.listeners.clear();
    }

    pub fn progress(&self, url: &str, percents: u32) {
        if let Some(listener) = self.listeners.get(url) {
            listener.on_cache_progress(url, percents);
        }
    }

    pub fn available(&self, url: &str, file: &Path) {
        if let Some(listener) = self.listeners.get(url) {
            listener.on_cache_available(url, file);
        }
    }

    pub fn error(&self, url: &str, percents: u32, error: &VideoCacheError) {
        if let Some(listener) = self.listeners.get(url) {
            listener.on_cache_error(url, percents, error);
        }
    }
}
