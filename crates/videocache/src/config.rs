use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Preferred proxy listener port; an ephemeral port is used when taken.
pub const DEFAULT_PORT: u16 = 8080;

/// Block size for cache reads, tee loops, and segment downloads.
pub const BUFFER_SIZE: usize = 8192;

/// Certificate/hostname verification applied to upstream TLS connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TrustPolicy {
    /// Verify against the platform trust store (default).
    #[default]
    Platform,
    /// Accept any certificate and hostname. Only for local testing against
    /// self-signed origins.
    DangerAcceptAll,
}

/// Configurable options for the caching proxy.
#[derive(Debug, Clone)]
pub struct VideoCacheConfig {
    /// Root directory the `video-cache` tree is created under. Usually the
    /// host application's cache directory.
    pub cache_root: PathBuf,

    /// Port the proxy tries first before falling back to an ephemeral one.
    pub preferred_port: u16,

    /// User agent presented to origin servers on the progressive path.
    pub user_agent: String,

    /// Connection timeout for origin fetches.
    pub connect_timeout: Duration,

    /// Read timeout (maximum time between received chunks) for origin fetches.
    pub read_timeout: Duration,

    /// Connect/read timeout for playlist and TS segment downloads.
    pub segment_timeout: Duration,

    /// Timeout for HEAD validation of segment URLs.
    pub validate_timeout: Duration,

    /// Whether origin fetches follow redirects.
    pub follow_redirects: bool,

    /// Upstream TLS trust policy.
    pub trust: TrustPolicy,

    /// Maximum concurrently served proxy connections.
    pub max_connections: usize,

    /// Maximum concurrently downloading TS segments.
    pub download_concurrency: usize,

    /// Segments that must be on disk before playback readiness is signalled.
    pub min_segments_for_playback: usize,

    /// Segments kept downloaded ahead of the current playing segment.
    pub buffer_segments_ahead: usize,

    /// Attempts per TS segment before it counts as failed.
    pub max_segment_retries: u32,

    /// Delay between TS segment retry attempts.
    pub segment_retry_delay: Duration,

    /// Consecutive failed segments that abort the prefetch run.
    pub max_consecutive_failures: usize,

    /// Total failed segments that abort the prefetch run.
    pub max_total_failures: usize,
}

impl Default for VideoCacheConfig {
    fn default() -> Self {
        Self {
            cache_root: std::env::temp_dir(),
            preferred_port: DEFAULT_PORT,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            segment_timeout: Duration::from_secs(15),
            validate_timeout: Duration::from_secs(5),
            follow_redirects: true,
            trust: TrustPolicy::default(),
            max_connections: 64,
            download_concurrency: 8,
            min_segments_for_playback: 3,
            buffer_segments_ahead: 8,
            max_segment_retries: 3,
            segment_retry_delay: Duration::from_secs(1),
            max_consecutive_failures: 3,
            max_total_failures: 10,
        }
    }
}

impl VideoCacheConfig {
    pub fn with_cache_root(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = VideoCacheConfig::default();
        assert_eq!(config.preferred_port, 8080);
        assert_eq!(config.min_segments_for_playback, 3);
        assert_eq!(config.buffer_segments_ahead, 8);
        assert_eq!(config.max_consecutive_failures, 3);
        assert_eq!(config.max_total_failures, 10);
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.segment_timeout, Duration::from_secs(15));
        assert_eq!(config.validate_timeout, Duration::from_secs(5));
        assert_eq!(config.trust, TrustPolicy::Platform);
    }
}
