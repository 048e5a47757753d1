//! Origin-facing HTTP client for the progressive proxy path.
//!
//! HTTPS origins are reached through a ladder of clients pinned to one TLS
//! version each, tried newest-first; the first successful connection wins.
//! Certificate verification defaults to the platform trust store and can be
//! relaxed with [`TrustPolicy::DangerAcceptAll`] for local testing.

use bytes::Bytes;
use futures::Stream;
use reqwest::header::{ACCEPT, ACCEPT_ENCODING, CONNECTION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE, USER_AGENT};
use reqwest::{Client, StatusCode, redirect, tls};
use tracing::{debug, warn};
use url::Url;

use crate::config::{TrustPolicy, VideoCacheConfig};
use crate::error::{Result, VideoCacheError};

/// TLS versions attempted for HTTPS origins, newest first.
const TLS_VERSIONS: [tls::Version; 4] = [
    tls::Version::TLS_1_3,
    tls::Version::TLS_1_2,
    tls::Version::TLS_1_1,
    tls::Version::TLS_1_0,
];

pub struct OriginClient {
    /// One client per entry of [`TLS_VERSIONS`].
    tls_clients: Vec<Client>,
    /// Client for plain-HTTP origins; no TLS pinning involved.
    plain_client: Client,
    /// Short-timeout client for HEAD validation probes.
    validate_client: Client,
    user_agent: String,
}

impl OriginClient {
    pub fn new(config: &VideoCacheConfig) -> Result<Self> {
        let tls_clients = TLS_VERSIONS
            .iter()
            .map(|version| build_client(config, Some(*version)))
            .collect::<Result<Vec<_>>>()?;
        let plain_client = build_client(config, None)?;
        let validate_client = Client::builder()
            .connect_timeout(config.validate_timeout)
            .timeout(config.validate_timeout)
            .danger_accept_invalid_certs(config.trust == TrustPolicy::DangerAcceptAll)
            .build()?;
        Ok(Self {
            tls_clients,
            plain_client,
            validate_client,
            user_agent: config.user_agent.clone(),
        })
    }

    /// GET `url`, forwarding `range` when given. HTTPS origins walk the TLS
    /// ladder; every version failing yields [`VideoCacheError::UpstreamConnect`].
    pub async fn fetch(&self, url: &str, range: Option<&str>) -> Result<OriginResponse> {
        let parsed =
            Url::parse(url).map_err(|e| VideoCacheError::invalid_url(url, e.to_string()))?;

        let clients: &[Client] = if parsed.scheme() == "http" {
            std::slice::from_ref(&self.plain_client)
        } else {
            &self.tls_clients
        };

        let mut last_error = None;
        for (attempt, client) in clients.iter().enumerate() {
            let mut request = client
                .get(parsed.clone())
                .header(USER_AGENT, &self.user_agent)
                .header(ACCEPT, "*/*")
                .header(ACCEPT_ENCODING, "identity")
                .header(CONNECTION, "keep-alive");
            if let Some(range) = range {
                request = request.header(RANGE, range);
            }
            match request.send().await {
                Ok(response) => {
                    debug!(url = %url, attempt, status = %response.status(), "origin connected");
                    return Ok(OriginResponse::new(response));
                }
                Err(e) => {
                    warn!(url = %url, attempt, error = %e, "origin connect attempt failed");
                    last_error = Some(e);
                }
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no TLS version succeeded".to_owned());
        Err(VideoCacheError::upstream_connect(url, reason))
    }

    /// HEAD probe used to validate segment URLs. True iff the origin answers
    /// `200 OK` within the validation timeout.
    pub async fn head_ok(&self, url: &str) -> bool {
        match self.validate_client.head(url).send().await {
            Ok(response) => response.status() == StatusCode::OK,
            Err(e) => {
                warn!(url = %url, error = %e, "HEAD validation failed");
                false
            }
        }
    }
}

fn build_client(config: &VideoCacheConfig, version: Option<tls::Version>) -> Result<Client> {
    let mut builder = Client::builder()
        .connect_timeout(config.connect_timeout)
        .read_timeout(config.read_timeout)
        .redirect(if config.follow_redirects {
            redirect::Policy::limited(10)
        } else {
            redirect::Policy::none()
        });
    if let Some(version) = version {
        builder = builder.min_tls_version(version).max_tls_version(version);
    }
    if config.trust == TrustPolicy::DangerAcceptAll {
        builder = builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);
    }
    Ok(builder.build()?)
}

/// A connected upstream response with the header fields the proxy cares
/// about pulled out, plus the live body stream.
pub struct OriginResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub content_range: Option<String>,
    response: reqwest::Response,
}

impl OriginResponse {
    fn new(response: reqwest::Response) -> Self {
        let headers = response.headers();
        let header_str = |name| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };
        let content_length = header_str(CONTENT_LENGTH)
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|len| *len > 0);
        Self {
            status: response.status(),
            content_type: header_str(CONTENT_TYPE),
            content_length,
            content_range: header_str(CONTENT_RANGE),
            response,
        }
    }

    pub fn status_reason(&self) -> &'static str {
        self.status.canonical_reason().unwrap_or("")
    }

    /// Consume the response as a chunk stream for the tee loop.
    pub fn bytes_stream(self) -> impl Stream<Item = reqwest::Result<Bytes>> + Unpin {
        self.response.bytes_stream()
    }

    /// Read the whole body, used to log upstream error payloads.
    pub async fn text(self) -> Result<String> {
        Ok(self.response.text().await?)
    }
}
