use reqwest::StatusCode;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, VideoCacheError>;

#[derive(Debug, thiserror::Error)]
pub enum VideoCacheError {
    #[error("empty request")]
    RequestEmpty,

    #[error("malformed request line: {line}")]
    RequestMalformed { line: String },

    #[error("requested range not satisfiable (total {total})")]
    RangeUnsatisfiable { total: u64 },

    #[error("upstream returned HTTP {status}: {message}")]
    UpstreamStatus { status: StatusCode, message: String },

    #[error("failed to connect to {url}: {reason}")]
    UpstreamConnect { url: String, reason: String },

    #[error("client disconnected")]
    ClientDisconnect,

    #[error("download incomplete: {actual} of {expected} bytes on disk")]
    IncompleteDownload { expected: u64, actual: u64 },

    #[error("segment fetch failed: {reason}")]
    SegmentFetch { reason: String },

    #[error("prefetch aborted: {reason}")]
    PrefetchAborted { reason: String },

    #[error("segments missing from cache: {files}")]
    MissingSegments { files: String },

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("playlist error: {reason}")]
    Playlist { reason: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },
}

impl VideoCacheError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn upstream_connect(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UpstreamConnect {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn segment_fetch(reason: impl Into<String>) -> Self {
        Self::SegmentFetch {
            reason: reason.into(),
        }
    }

    pub fn playlist(reason: impl Into<String>) -> Self {
        Self::Playlist {
            reason: reason.into(),
        }
    }

    /// Whether the failure is transient enough to retry at the call site.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RequestEmpty
            | Self::RequestMalformed { .. }
            | Self::RangeUnsatisfiable { .. }
            | Self::InvalidUrl { .. }
            | Self::MissingSegments { .. }
            | Self::PrefetchAborted { .. } => false,
            Self::UpstreamStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::UpstreamConnect { .. }
            | Self::ClientDisconnect
            | Self::IncompleteDownload { .. }
            | Self::SegmentFetch { .. }
            | Self::Playlist { .. }
            | Self::Io { .. }
            | Self::Network { .. } => true,
        }
    }
}
