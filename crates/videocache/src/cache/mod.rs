//! Content-addressed file cache and its process-wide registry.

mod file_cache;
mod key;
mod registry;

pub use file_cache::FileCache;
pub use key::{cache_file_name, url_digest};
pub use registry::CacheRegistry;
