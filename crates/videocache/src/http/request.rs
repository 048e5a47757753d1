//! Proxy request reading and parsing.
//!
//! The proxy speaks just enough HTTP/1.1 to serve a media player: one
//! request per connection, `GET /<percent-encoded-url>` with an optional
//! `Range` header.

use percent_encoding::percent_decode_str;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::warn;

use crate::error::{Result, VideoCacheError};

/// Read CRLF-terminated header lines until the blank line. Fails with
/// [`VideoCacheError::RequestEmpty`] when the client sent nothing.
pub async fn read_request<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    let mut buf = String::new();
    loop {
        buf.clear();
        let read = reader.read_line(&mut buf).await?;
        if read == 0 {
            break;
        }
        let line = buf.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        lines.push(line.to_owned());
    }
    if lines.is_empty() {
        return Err(VideoCacheError::RequestEmpty);
    }
    Ok(lines)
}

/// A parsed proxy request: the request line plus raw header lines, kept for
/// case-insensitive lookups.
#[derive(Debug)]
pub struct Request {
    method: String,
    url: String,
    lines: Vec<String>,
}

impl Request {
    pub fn parse(lines: Vec<String>) -> Result<Self> {
        let request_line = lines.first().cloned().unwrap_or_default();
        let mut parts = request_line.split(' ');
        let method = parts.next().unwrap_or_default().to_owned();
        let target = parts.next().ok_or_else(|| VideoCacheError::RequestMalformed {
            line: request_line.clone(),
        })?;
        let url = restore_url(target.strip_prefix('/').unwrap_or(target));
        if url.is_empty() {
            return Err(VideoCacheError::RequestMalformed { line: request_line });
        }
        Ok(Self { method, url, lines })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// The decoded absolute origin URL this request maps to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Case-insensitive header lookup over the raw lines; the value is
    /// everything after the first `:`, trimmed.
    pub fn header(&self, name: &str) -> Option<&str> {
        let prefix = format!("{}:", name.to_ascii_lowercase());
        self.lines.iter().find_map(|line| {
            if line.to_ascii_lowercase().starts_with(&prefix) {
                line.split_once(':').map(|(_, value)| value.trim())
            } else {
                None
            }
        })
    }

    pub fn range(&self) -> Option<ByteRange> {
        self.header("Range").map(ByteRange::parse)
    }
}

/// Percent-decode an encoded target and restore the scheme that
/// [`get_proxy_url`](crate::manager::VideoCacheManager::get_proxy_url)
/// stripped. `https://` is assumed unless the URL already carries a scheme.
pub fn restore_url(encoded: &str) -> String {
    let decoded = percent_decode_str(encoded).decode_utf8_lossy();
    if decoded.is_empty() {
        return String::new();
    }
    if decoded.starts_with("http://") || decoded.starts_with("https://") {
        decoded.into_owned()
    } else {
        format!("https://{decoded}")
    }
}

/// A `Range: bytes=<start>[-<end>]` request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    /// Parse a range header value. Malformed input is logged and defaults to
    /// the full range rather than failing the request.
    pub fn parse(value: &str) -> Self {
        let full = Self {
            start: 0,
            end: None,
        };
        let Some(interval) = value.strip_prefix("bytes=") else {
            warn!(range = %value, "unsupported range unit, serving full range");
            return full;
        };
        let (start_str, end_str) = interval.split_once('-').unwrap_or((interval, ""));
        let start = if start_str.is_empty() {
            0
        } else {
            match start_str.trim().parse() {
                Ok(start) => start,
                Err(_) => {
                    warn!(range = %value, "unparseable range start, serving full range");
                    return full;
                }
            }
        };
        let end = if end_str.trim().is_empty() {
            None
        } else {
            end_str.trim().parse().ok()
        };
        Self { start, end }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(lines: &[&str]) -> Request {
        Request::parse(lines.iter().map(|s| s.to_string()).collect()).unwrap()
    }

    #[tokio::test]
    async fn reads_lines_until_blank() {
        let raw = b"GET /foo HTTP/1.1\r\nHost: localhost\r\n\r\nignored";
        let mut reader = tokio::io::BufReader::new(&raw[..]);
        let lines = read_request(&mut reader).await.unwrap();
        assert_eq!(lines, vec!["GET /foo HTTP/1.1", "Host: localhost"]);
    }

    #[tokio::test]
    async fn empty_stream_is_request_empty() {
        let mut reader = tokio::io::BufReader::new(&b""[..]);
        assert!(matches!(
            read_request(&mut reader).await,
            Err(VideoCacheError::RequestEmpty)
        ));
    }

    #[test]
    fn parses_method_and_decodes_target() {
        let req = request(&["GET /example.com%2Fv.mp4 HTTP/1.1"]);
        assert_eq!(req.method(), "GET");
        assert_eq!(req.url(), "https://example.com/v.mp4");
    }

    #[test]
    fn explicit_scheme_survives_decoding() {
        let req = request(&["GET /http%3A%2F%2Fexample.com%2Fv.mp4 HTTP/1.1"]);
        assert_eq!(req.url(), "http://example.com/v.mp4");
    }

    #[test]
    fn missing_target_is_malformed() {
        let result = Request::parse(vec!["GET".to_owned()]);
        assert!(matches!(
            result,
            Err(VideoCacheError::RequestMalformed { .. })
        ));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let req = request(&["GET /v HTTP/1.1", "rAnGe: bytes=0-99", "Host: x"]);
        assert_eq!(req.header("Range"), Some("bytes=0-99"));
        assert_eq!(req.header("host"), Some("x"));
        assert_eq!(req.header("Accept"), None);
    }

    #[test]
    fn range_forms() {
        assert_eq!(
            ByteRange::parse("bytes=100-199"),
            ByteRange {
                start: 100,
                end: Some(199)
            }
        );
        assert_eq!(
            ByteRange::parse("bytes=100-"),
            ByteRange {
                start: 100,
                end: None
            }
        );
        assert_eq!(
            ByteRange::parse("bytes=-500"),
            ByteRange {
                start: 0,
                end: Some(500)
            }
        );
    }

    #[test]
    fn malformed_range_defaults_to_full() {
        assert_eq!(
            ByteRange::parse("bytes=abc-"),
            ByteRange { start: 0, end: None }
        );
        assert_eq!(
            ByteRange::parse("items=0-1"),
            ByteRange { start: 0, end: None }
        );
    }
}
