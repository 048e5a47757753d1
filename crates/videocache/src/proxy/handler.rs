//! Per-connection proxy worker.
//!
//! Each accepted connection carries one request for one media URL. A URL
//! whose cache file already holds bytes is served straight from disk with
//! range support; anything else is fetched from origin and teed into the
//! cache and the client simultaneously so playback can start mid-download.
//!
//! WebM gets special treatment throughout: the upstream fetch never forwards
//! Range (players re-request ranges the cache cannot satisfy mid-download),
//! out-of-range requests fall back to the full file, and a lost client stops
//! the response but not the cache fill.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use reqwest::StatusCode;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::cache::{CacheRegistry, FileCache};
use crate::config::BUFFER_SIZE;
use crate::error::{Result, VideoCacheError};
use crate::events::ListenerHub;
use crate::http::request::{ByteRange, Request, read_request};
use crate::http::response;
use crate::origin::OriginClient;

const MIME_MP4: &str = "video/mp4";
const MIME_WEBM: &str = "video/webm";

/// Client write attempts before a connection counts as lost.
const CLIENT_WRITE_RETRIES: u32 = 3;

/// Most recent origin bytes kept around for a resend after a client hiccup.
const RETRY_BUFFER_CAPACITY: usize = BUFFER_SIZE * 2;

/// Shared state every connection worker needs.
pub(crate) struct ProxyContext {
    pub registry: Arc<CacheRegistry>,
    pub origin: Arc<OriginClient>,
    pub listeners: Arc<ListenerHub>,
}

pub(crate) async fn handle_connection(ctx: Arc<ProxyContext>, stream: TcpStream) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let request = match read_request(&mut reader).await.and_then(Request::parse) {
        Ok(request) => request,
        Err(e) => {
            // Empty and malformed requests are closed without a response.
            debug!(error = %e, "dropping connection");
            return;
        }
    };
    let url = request.url().to_owned();
    debug!(url = %url, method = request.method(), "received proxy request");

    let cache = match ctx.registry.get_file_cache(&url) {
        Ok(cache) => cache,
        Err(e) => {
            let _ = write_half
                .write_all(response::internal_error(&e.to_string()).as_bytes())
                .await;
            return;
        }
    };

    if cache.exists() && cache.length() > 0 {
        debug!(url = %url, length = cache.length(), "serving from cache");
        if let Err(e) = serve_cached(&request, &cache, &mut write_half).await {
            warn!(url = %url, error = %e, "error serving cached response");
            let _ = write_half
                .write_all(response::internal_error(&e.to_string()).as_bytes())
                .await;
        }
    } else {
        debug!(url = %url, "downloading and caching");
        let mut transferred = Transferred::default();
        if let Err(e) = fetch_and_cache(&ctx, &request, &cache, &mut write_half, &mut transferred).await
        {
            warn!(url = %url, error = %e, "error streaming from origin");
            ctx.listeners.error(&url, transferred.percent(), &e);
            let _ = write_half
                .write_all(response::internal_error(&e.to_string()).as_bytes())
                .await;
        }
    }

    let _ = write_half.shutdown().await;
}

/// Serve a range of the on-disk cache file. The length observed here is the
/// response's world; concurrent growth of the file is ignored.
async fn serve_cached(
    request: &Request,
    cache: &FileCache,
    writer: &mut OwnedWriteHalf,
) -> Result<()> {
    let total = cache.length();
    let content_type = content_type_for(cache.url(), None);

    let mut start = 0;
    let mut end = total - 1;
    if let Some(range) = request.range() {
        start = range.start;
        end = range.end.unwrap_or(total - 1);

        if start >= total {
            if content_type == MIME_WEBM {
                // Players probe WebM with ranges past what is cached; give
                // them the whole file instead of an error.
                warn!(start, total, "WebM range out of bounds, serving full file");
                start = 0;
                end = total - 1;
            } else {
                warn!(start, total, "requested range not satisfiable");
                writer
                    .write_all(response::range_not_satisfiable_head(total).as_bytes())
                    .await?;
                writer.flush().await?;
                return Ok(());
            }
        }
        start = start.min(total - 1);
        end = end.clamp(start, total - 1);
    }

    let content_length = end - start + 1;
    let content_range = response::content_range_value(start, end, total);
    let head = response::partial_head(&content_type, Some(content_length), Some(&content_range));
    writer.write_all(head.as_bytes()).await?;
    writer.flush().await?;

    let mut position = start;
    let mut remaining = content_length;
    let mut retries = 0;
    while remaining > 0 {
        let len = remaining.min(BUFFER_SIZE as u64) as usize;
        let block = cache.read(position, len)?;
        if block.is_empty() {
            warn!(position, "no data read from cache");
            break;
        }
        match write_block(writer, &block).await {
            Ok(()) => {
                position += block.len() as u64;
                remaining -= block.len() as u64;
                retries = 0;
            }
            Err(e) => {
                retries += 1;
                if retries >= CLIENT_WRITE_RETRIES {
                    warn!(error = %e, "client write retries exhausted");
                    break;
                }
                debug!(attempt = retries, "retrying cached send");
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
    debug!(sent = content_length - remaining, total = content_length, "cached send finished");
    Ok(())
}

/// Bytes accounted for by the tee loop; kept outside `fetch_and_cache` so
/// the caller can report progress even when the fetch fails.
#[derive(Default)]
struct Transferred {
    total_read: u64,
    content_length: Option<u64>,
}

impl Transferred {
    /// Percent complete, or a `total/8192` surrogate when the origin never
    /// said how long the resource is.
    fn percent(&self) -> u32 {
        match self.content_length {
            Some(len) if len > 0 => (self.total_read * 100 / len) as u32,
            _ => (self.total_read / BUFFER_SIZE as u64) as u32,
        }
    }
}

async fn fetch_and_cache(
    ctx: &ProxyContext,
    request: &Request,
    cache: &FileCache,
    writer: &mut OwnedWriteHalf,
    transferred: &mut Transferred,
) -> Result<()> {
    let url = request.url();
    let preliminary_type = content_type_for(url, None);
    let is_webm = preliminary_type == MIME_WEBM;

    // WebM is always fetched whole; the range logic happens client-side.
    let range_header = request.header("Range").map(str::to_owned);
    let upstream_range = if is_webm { None } else { range_header.as_deref() };

    let origin = ctx.origin.fetch(url, upstream_range).await?;

    if origin.status.as_u16() >= 400 {
        let status = origin.status;
        let head = response::status_head(status);
        let body = origin.text().await.unwrap_or_default();
        if !body.is_empty() {
            warn!(url = %url, status = %status, body = %body, "upstream error body");
        }
        writer.write_all(head.as_bytes()).await?;
        writer.write_all(body.as_bytes()).await?;
        writer.flush().await?;
        return Ok(());
    }

    let content_type = content_type_for(url, origin.content_type.as_deref());
    let content_length = origin.content_length;
    transferred.content_length = content_length;
    debug!(url = %url, content_type = %content_type, content_length = ?content_length, "origin response");

    // An existing WebM cache whose size disagrees with origin is stale.
    if is_webm && cache.exists() && content_length != Some(cache.length()) {
        warn!(url = %url, "inconsistent WebM cache found, resetting");
        cache.truncate()?;
    }

    let mut position = 0;
    let head = if !is_webm
        && origin.status == StatusCode::PARTIAL_CONTENT
        && let Some(range) = range_header.as_deref()
    {
        position = ByteRange::parse(range).start;
        let content_range = origin.content_range.clone().or_else(|| {
            content_length.map(|len| response::content_range_value(position, len - 1, len))
        });
        response::partial_head(&content_type, content_length, content_range.as_deref())
    } else {
        response::ok_head(&content_type, content_length)
    };
    writer.write_all(head.as_bytes()).await?;
    writer.flush().await?;

    let mut stream = origin.bytes_stream();
    let mut ring = RetryBuffer::new(RETRY_BUFFER_CAPACITY);
    let mut retry_count = 0;
    let mut client_gone = false;
    let started = Instant::now();
    let mut last_progress: Option<Instant> = None;

    while let Some(next) = stream.next().await {
        let chunk = next?;
        if chunk.is_empty() {
            continue;
        }

        cache.write(&chunk, position)?;

        if !client_gone {
            ring.push(&chunk);
            match write_block(writer, &chunk).await {
                Ok(()) => retry_count = 0,
                Err(e) => {
                    retry_count += 1;
                    let recovered = if retry_count <= CLIENT_WRITE_RETRIES {
                        warn!(url = %url, attempt = retry_count, error = %e, "client write failed, backing off");
                        sleep(Duration::from_secs(retry_count as u64)).await;
                        // Best effort: the ring holds the most recent bytes
                        // including this chunk.
                        write_block(writer, ring.as_slice()).await.is_ok()
                    } else {
                        false
                    };
                    if recovered {
                        debug!(bytes = ring.len(), "resent retry buffer");
                    } else if is_webm {
                        warn!(url = %url, "client lost, continuing to fill WebM cache");
                        client_gone = true;
                    } else {
                        return Err(VideoCacheError::ClientDisconnect);
                    }
                }
            }
        }

        position += chunk.len() as u64;
        transferred.total_read += chunk.len() as u64;

        if last_progress.is_none_or(|t| t.elapsed() >= Duration::from_secs(1)) {
            let percent = transferred.percent();
            let elapsed = started.elapsed().as_secs_f64().max(f64::EPSILON);
            debug!(
                url = %url,
                percent,
                total_read = transferred.total_read,
                speed_kbps = transferred.total_read as f64 / elapsed / 1024.0,
                "download progress"
            );
            ctx.listeners.progress(url, percent);
            last_progress = Some(Instant::now());
        }
    }

    if is_webm
        && cache.exists()
        && let Some(expected) = content_length
        && cache.length() != expected
    {
        let actual = cache.length();
        warn!(url = %url, actual, expected, "WebM download incomplete, discarding cache");
        cache.discard()?;
        return Err(VideoCacheError::IncompleteDownload { expected, actual });
    }

    if let Some(len) = content_length
        && transferred.total_read >= len
    {
        ctx.listeners.available(url, cache.cache_file());
    }

    Ok(())
}

async fn write_block(writer: &mut OwnedWriteHalf, data: &[u8]) -> std::io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}

/// Resolve the content type served to the client. The origin's value wins
/// when it names a known container; otherwise the URL extension decides,
/// defaulting to MP4.
fn content_type_for(url: &str, server_content_type: Option<&str>) -> String {
    if let Some(ct) = server_content_type
        && !ct.is_empty()
    {
        if ct.contains("webm") {
            return MIME_WEBM.to_owned();
        }
        if ct.contains("mp4") {
            return MIME_MP4.to_owned();
        }
        return ct.to_owned();
    }

    match url_extension(url) {
        Some(ext) if ext.eq_ignore_ascii_case("webm") => MIME_WEBM.to_owned(),
        _ => MIME_MP4.to_owned(),
    }
}

fn url_extension(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path.rsplit('/').next().unwrap_or(path);
    name.rsplit_once('.').map(|(_, ext)| ext)
}

/// Ring of the most recent origin bytes, resent to the client after a
/// transient write failure.
struct RetryBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl RetryBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        if chunk.len() >= self.capacity {
            self.data.clear();
            self.data
                .extend_from_slice(&chunk[chunk.len() - self.capacity..]);
            return;
        }
        self.data.extend_from_slice(chunk);
        if self.data.len() > self.capacity {
            let excess = self.data.len() - self.capacity;
            self.data.drain(..excess);
        }
    }

    fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}
