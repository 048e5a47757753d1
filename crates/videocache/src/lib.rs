//! Local caching proxy for video streams.
//!
//! Sits between a media player and remote origins on the same host. The
//! progressive path serves MP4/WebM through a loopback HTTP proxy that tees
//! origin bytes into a content-addressed file cache while answering range
//! requests; the HLS path prefetches TS segments in prioritized parallel and
//! rewrites the playlist so playback can start before the download finishes.

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod hls;
pub mod http;
pub mod manager;
pub mod origin;
mod proxy;

pub use cache::{CacheRegistry, FileCache};
pub use config::{DEFAULT_PORT, TrustPolicy, VideoCacheConfig};
pub use error::{Result, VideoCacheError};
pub use events::{CacheEventListener, M3u8CacheListener};
pub use hls::M3u8Cache;
pub use manager::VideoCacheManager;
