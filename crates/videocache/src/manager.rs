//! Process-facing facade: owns the proxy server, the cache registry, and the
//! per-URL listener routing.
//!
//! Lifecycle is explicit: [`VideoCacheManager::init`] binds the port and
//! starts serving, [`VideoCacheManager::release`] tears everything down.

use std::path::Path;
use std::sync::Arc;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use tracing::{debug, info};

use crate::cache::{CacheRegistry, FileCache};
use crate::config::VideoCacheConfig;
use crate::error::Result;
use crate::events::{CacheEventListener, ListenerHub};
use crate::hls::M3u8Cache;
use crate::origin::OriginClient;
use crate::proxy::{ProxyContext, ProxyServer};

/// Characters left alone when encoding a URL into a proxy path; everything
/// else, including `/` and `:`, is percent-encoded.
const PROXY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'!')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b'*');

pub struct VideoCacheManager {
    config: VideoCacheConfig,
    registry: Arc<CacheRegistry>,
    listeners: Arc<ListenerHub>,
    server: ProxyServer,
}

impl VideoCacheManager {
    /// Create the cache tree, bind the proxy (preferred port first, then an
    /// ephemeral one), and start accepting connections.
    pub async fn init(config: VideoCacheConfig) -> Result<Self> {
        let registry = Arc::new(CacheRegistry::new(&config.cache_root)?);
        let listeners = Arc::new(ListenerHub::default());
        let origin = Arc::new(OriginClient::new(&config)?);

        let ctx = Arc::new(ProxyContext {
            registry: Arc::clone(&registry),
            origin,
            listeners: Arc::clone(&listeners),
        });
        let server =
            ProxyServer::start(ctx, config.preferred_port, config.max_connections).await?;

        Ok(Self {
            config,
            registry,
            listeners,
            server,
        })
    }

    /// The port the proxy actually bound.
    pub fn port(&self) -> u16 {
        self.server.port()
    }

    /// Map an origin URL to its loopback proxy URL. The `https://` scheme is
    /// stripped (the handler restores it); other schemes stay explicit so
    /// they survive the round trip.
    pub fn get_proxy_url(&self, url: &str) -> String {
        proxy_url(self.server.port(), url)
    }

    pub fn register_cache_listener(&self, listener: Arc<dyn CacheEventListener>, url: &str) {
        self.listeners.register(url, listener);
    }

    pub fn unregister_cache_listener(&self, url: &str) {
        self.listeners.unregister(url);
    }

    pub fn unregister_all_cache_listeners(&self) {
        self.listeners.clear();
    }

    /// The cache entry for `url`, creating it on first use.
    pub fn get_file_cache(&self, url: &str) -> Result<Arc<FileCache>> {
        Ok(self.registry.get_file_cache(url)?)
    }

    pub fn cache_dir(&self) -> &Path {
        self.registry.cache_dir()
    }

    /// A prefetch engine rooted in this manager's cache tree.
    pub fn new_m3u8_cache(&self) -> Result<M3u8Cache> {
        M3u8Cache::new(self.registry.cache_dir(), &self.config)
    }

    /// Unregister listeners, stop the proxy, and drop all cache handles.
    /// Cached bytes stay on disk.
    pub async fn release(self) {
        self.listeners.clear();
        self.server.shutdown().await;
        self.registry.clear();
        info!("video cache manager released");
    }
}

fn proxy_url(port: u16, url: &str) -> String {
    if url.is_empty() {
        return url.to_owned();
    }
    let stripped = url.strip_prefix("https://").unwrap_or(url);
    let encoded = utf8_percent_encode(stripped, PROXY_ENCODE_SET);
    let proxy = format!("http://127.0.0.1:{port}/{encoded}");
    debug!(original = %url, proxy = %proxy, "mapped proxy URL");
    proxy
}
