//! HLS prefetch engine.
//!
//! `cache()` resolves the playlist, validates reachability, and queues every
//! segment; a scheduler task drains the priority heap with bounded
//! concurrency while the rewritten local playlist tracks completed segments.
//! Failure gating stops a run that keeps hitting dead segments instead of
//! hammering the origin.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use reqwest::Client;
use reqwest::header::USER_AGENT;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::VideoCacheConfig;
use crate::error::{Result, VideoCacheError};
use crate::events::M3u8CacheListener;

use super::playlist::{self, DEFAULT_SEGMENT_DURATION, SegmentEntry};
use super::prefetch::{
    PRIORITY_IMMEDIATE, PRIORITY_NEXT_WINDOW, SegmentTask, priority_for, segment_index,
};
use super::rewrite;

/// Subdirectory of the cache tree holding segments and the local playlist.
const HLS_DIR_NAME: &str = "m3u8";

/// Longest pre-start delay applied to non-immediate downloads.
const MAX_START_DELAY: Duration = Duration::from_secs(1);

/// Prefetches one HLS stream into the local cache.
///
/// Create it inside a Tokio runtime; the scheduler task lives until the
/// engine is dropped or cancelled.
pub struct M3u8Cache {
    inner: Arc<Inner>,
    queue_tx: mpsc::UnboundedSender<SegmentTask>,
}

struct Inner {
    cache_dir: PathBuf,
    config: VideoCacheConfig,
    client: Client,
    validate_client: Client,
    base_url: Mutex<String>,
    fallback_base_urls: Mutex<Vec<String>>,
    segments: Mutex<Vec<SegmentEntry>>,
    /// File names that finished (either way) or were never reachable; a
    /// second submission of these must not download again.
    resolved: Mutex<HashSet<String>>,
    completed: AtomicUsize,
    failed: AtomicUsize,
    consecutive_failures: AtomicUsize,
    canceled: AtomicBool,
    downloading: AtomicBool,
    ready_notified: AtomicBool,
    finalized: AtomicBool,
    current_playing: AtomicUsize,
    next_seq: AtomicU64,
    listener: Mutex<Option<Arc<dyn M3u8CacheListener>>>,
    token: CancellationToken,
    rewrite_lock: tokio::sync::Mutex<()>,
}

impl M3u8Cache {
    /// Set up the working directory `<cache_dir>/m3u8` and start the
    /// scheduler task.
    pub fn new(cache_dir: &Path, config: &VideoCacheConfig) -> Result<Self> {
        let dir = cache_dir.join(HLS_DIR_NAME);
        std::fs::create_dir_all(&dir)?;

        let client = Client::builder()
            .connect_timeout(config.segment_timeout)
            .read_timeout(config.segment_timeout)
            .build()?;
        let validate_client = Client::builder()
            .connect_timeout(config.validate_timeout)
            .timeout(config.validate_timeout)
            .build()?;

        let inner = Arc::new(Inner {
            cache_dir: dir,
            config: config.clone(),
            client,
            validate_client,
            base_url: Mutex::new(String::new()),
            fallback_base_urls: Mutex::new(Vec::new()),
            segments: Mutex::new(Vec::new()),
            resolved: Mutex::new(HashSet::new()),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            consecutive_failures: AtomicUsize::new(0),
            canceled: AtomicBool::new(false),
            downloading: AtomicBool::new(false),
            ready_notified: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            current_playing: AtomicUsize::new(0),
            next_seq: AtomicU64::new(0),
            listener: Mutex::new(None),
            token: CancellationToken::new(),
            rewrite_lock: tokio::sync::Mutex::new(()),
        });

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        tokio::spawn(scheduler_loop(
            Arc::clone(&inner),
            queue_rx,
            config.download_concurrency,
        ));

        Ok(Self { inner, queue_tx })
    }

    pub fn set_cache_listener(&self, listener: Arc<dyn M3u8CacheListener>) {
        *self.inner.listener.lock().unwrap() = Some(listener);
    }

    pub fn add_fallback_base_url(&self, url: impl Into<String>) {
        let url = url.into();
        if !url.is_empty() {
            self.inner.fallback_base_urls.lock().unwrap().push(url);
        }
    }

    /// Bootstrap a caching run: download and resolve the playlist, validate
    /// the first segment, and queue everything for download. Returns once
    /// the queue is populated; completion is reported via the listener.
    pub async fn cache(&self, url: &str) -> Result<()> {
        let inner = &self.inner;
        inner.downloading.store(true, Ordering::SeqCst);
        info!(url = %url, "starting HLS cache run");

        let info = match playlist::load_media_playlist(&inner.client, &inner.config.user_agent, url)
            .await
        {
            Ok(info) => info,
            Err(e) => {
                inner.downloading.store(false, Ordering::SeqCst);
                inner.notify_error(&format!("failed to load playlist: {e}"));
                return Err(e);
            }
        };
        *inner.base_url.lock().unwrap() = info.base_url.clone();

        if info.segments.is_empty() {
            warn!(url = %url, "playlist contains no TS segments");
            inner.downloading.store(false, Ordering::SeqCst);
            inner.notify_complete(false, None);
            return Ok(());
        }

        // Probe the first segment; a reachable alternate base becomes a
        // fallback for every later download.
        let first = &info.segments[0];
        match inner
            .find_working_url(&first.url, &first.file_name)
            .await
        {
            Some(working) => {
                if working != first.url {
                    let new_base = playlist::base_url_of(&working);
                    info!(base = %new_base, "discovered working alternate base URL");
                    self.add_fallback_base_url(new_base);
                }
            }
            None => {
                let message =
                    "unable to access video segments, check the network connection or the stream URL";
                error!(url = %url, "{message}");
                inner.downloading.store(false, Ordering::SeqCst);
                inner.notify_error(message);
                return Err(VideoCacheError::segment_fetch(message));
            }
        }

        if let Err(e) = rewrite::ensure_empty_ts(&inner.cache_dir).await {
            warn!(error = %e, "failed to write placeholder segment");
        }
        *inner.segments.lock().unwrap() = info.segments.clone();

        let current = inner.current_playing.load(Ordering::SeqCst);
        for (position, segment) in info.segments.iter().enumerate() {
            if inner.canceled.load(Ordering::SeqCst) {
                break;
            }
            let priority = priority_for(
                position,
                current,
                inner.config.min_segments_for_playback,
                inner.config.buffer_segments_ahead,
            );
            let Some(working) = inner
                .find_working_url(&segment.url, &segment.file_name)
                .await
            else {
                warn!(segment = %segment.file_name, "segment unreachable on all hosts");
                inner.mark_resolved(&segment.file_name);
                inner.record_failure(&segment.file_name).await;
                continue;
            };
            self.submit(priority, working, segment.file_name.clone());
            if priority == PRIORITY_IMMEDIATE {
                // Bias dispatch order toward the startup window.
                sleep(Duration::from_millis(50)).await;
            }
        }

        info!(total = info.segments.len(), "queued segment downloads");
        Ok(())
    }

    /// Flip the cancel flag and wake everything that is sleeping on it.
    /// In-flight downloads delete their temp file at the next loop turn.
    pub fn cancel(&self) {
        info!("cancelling HLS cache run");
        self.inner.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    pub fn is_completed(&self) -> bool {
        let inner = &self.inner;
        if inner.downloading.load(Ordering::SeqCst) {
            return false;
        }
        let total = inner.segments.lock().unwrap().len();
        total > 0 && inner.completed.load(Ordering::SeqCst) == total
    }

    pub fn set_current_playing_segment(&self, index: usize) {
        self.inner.current_playing.store(index, Ordering::SeqCst);
    }

    /// Queue the window `[start, start + buffer_ahead]` at immediate
    /// priority and the window after it at next-window priority. Segments
    /// already on disk are skipped.
    pub async fn ensure_segments_cached(&self, start: usize, end: usize) {
        let inner = &self.inner;
        let segments: Vec<SegmentEntry> = inner.segments.lock().unwrap().clone();
        let total = segments.len();
        if total == 0 || start > end || end >= total {
            warn!(start, end, total, "invalid segment range");
            return;
        }

        let buffer_ahead = inner.config.buffer_segments_ahead;
        let end = (start + buffer_ahead).min(total - 1);
        for segment in &segments[start..=end] {
            if !file_exists_non_empty(&inner.cache_dir.join(&segment.file_name)).await {
                self.submit(
                    PRIORITY_IMMEDIATE,
                    segment.url.clone(),
                    segment.file_name.clone(),
                );
            }
        }

        let next_start = end + 1;
        if next_start < total {
            let next_end = (next_start + buffer_ahead).min(total - 1);
            for segment in &segments[next_start..=next_end] {
                if !file_exists_non_empty(&inner.cache_dir.join(&segment.file_name)).await {
                    self.submit(
                        PRIORITY_NEXT_WINDOW,
                        segment.url.clone(),
                        segment.file_name.clone(),
                    );
                }
            }
        }
    }

    /// Rewrite the local playlist on demand, once a run is live.
    pub async fn update_partial_m3u8(&self) {
        let inner = &self.inner;
        if inner.downloading.load(Ordering::SeqCst) && inner.ready_notified.load(Ordering::SeqCst)
            && let Err(e) = inner.save_local_m3u8_partial().await
        {
            warn!(error = %e, "failed to update local playlist");
        }
    }

    /// Path of the rewritten playlist, once it exists on disk.
    pub fn local_m3u8_path(&self) -> Option<PathBuf> {
        let path = self.inner.cache_dir.join(rewrite::LOCAL_PLAYLIST_NAME);
        path.exists().then_some(path)
    }

    pub fn total_segments(&self) -> usize {
        self.inner.segments.lock().unwrap().len()
    }

    pub fn segment_file_name(&self, index: usize) -> Option<String> {
        self.inner
            .segments
            .lock()
            .unwrap()
            .get(index)
            .map(|s| s.file_name.clone())
    }

    pub fn segment_duration(&self, file_name: &str) -> f32 {
        self.inner
            .segments
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.file_name == file_name)
            .map(|s| s.duration)
            .unwrap_or(DEFAULT_SEGMENT_DURATION)
    }

    /// Sum of durations of the segments before `index`.
    pub fn total_duration_up_to(&self, index: usize) -> f32 {
        self.inner
            .segments
            .lock()
            .unwrap()
            .iter()
            .take(index)
            .map(|s| s.duration)
            .sum()
    }

    pub fn cache_dir(&self) -> &Path {
        &self.inner.cache_dir
    }

    fn submit(&self, priority: u8, url: String, file_name: String) {
        let task = SegmentTask {
            priority,
            index: segment_index(&file_name),
            seq: self.inner.next_seq.fetch_add(1, Ordering::SeqCst),
            url,
            file_name,
        };
        if self.queue_tx.send(task).is_err() {
            warn!("segment scheduler is gone, dropping task");
        }
    }
}

impl Inner {
    fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        self.downloading.store(false, Ordering::SeqCst);
        self.token.cancel();
    }

    fn listener(&self) -> Option<Arc<dyn M3u8CacheListener>> {
        self.listener.lock().unwrap().clone()
    }

    fn notify_error(&self, message: &str) {
        if let Some(listener) = self.listener() {
            listener.on_error(message);
        }
    }

    fn notify_complete(&self, success: bool, path: Option<&Path>) {
        if let Some(listener) = self.listener() {
            listener.on_complete(success, path);
        }
    }

    fn notify_progress(&self) {
        if self.canceled.load(Ordering::SeqCst) {
            return;
        }
        if let Some(listener) = self.listener() {
            listener.on_progress(
                self.completed.load(Ordering::SeqCst),
                self.segments.lock().unwrap().len(),
                self.failed.load(Ordering::SeqCst),
            );
        }
    }

    fn mark_resolved(&self, file_name: &str) {
        self.resolved.lock().unwrap().insert(file_name.to_owned());
    }

    fn is_resolved(&self, file_name: &str) -> bool {
        self.resolved.lock().unwrap().contains(file_name)
    }

    /// The primary URL if it answers a HEAD, else the first fallback base
    /// that does.
    async fn find_working_url(&self, primary: &str, file_name: &str) -> Option<String> {
        if self.head_ok(primary).await {
            return Some(primary.to_owned());
        }
        let fallbacks: Vec<String> = self.fallback_base_urls.lock().unwrap().clone();
        for base in fallbacks {
            let candidate = format!("{base}{file_name}");
            if self.head_ok(&candidate).await {
                debug!(url = %candidate, "found working fallback URL");
                return Some(candidate);
            }
        }
        None
    }

    /// Re-validation during retries starts from the current base URL.
    async fn find_working_url_by_name(&self, file_name: &str) -> Option<String> {
        let primary = {
            let base = self.base_url.lock().unwrap();
            playlist::absolutize(file_name, &base)
        };
        self.find_working_url(&primary, file_name).await
    }

    async fn head_ok(&self, url: &str) -> bool {
        match self.validate_client.head(url).send().await {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(e) => {
                debug!(url = %url, error = %e, "HEAD probe failed");
                false
            }
        }
    }

    async fn record_success(&self, file_name: &str) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        debug!(segment = %file_name, "segment cached");
        if let Err(e) = self.save_local_m3u8_partial().await {
            warn!(error = %e, "failed to rewrite local playlist");
        }
        self.notify_progress();
        self.maybe_finalize().await;
    }

    async fn record_failure(&self, file_name: &str) {
        warn!(segment = %file_name, "segment failed permanently");
        let failed = self.failed.fetch_add(1, Ordering::SeqCst) + 1;
        let consecutive = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        self.notify_progress();

        if consecutive >= self.config.max_consecutive_failures {
            let message = format!(
                "continuous {} downloads failed, stop caching",
                self.config.max_consecutive_failures
            );
            error!("{message}");
            self.notify_error(&message);
            self.cancel();
            return;
        }
        if failed >= self.config.max_total_failures {
            let message = format!(
                "total failures exceeded {}, stop caching",
                self.config.max_total_failures
            );
            error!("{message}");
            self.notify_error(&message);
            self.cancel();
            return;
        }
        self.maybe_finalize().await;
    }

    /// Finish the run once every segment has resolved one way or the other.
    async fn maybe_finalize(&self) {
        let total = self.segments.lock().unwrap().len();
        if total == 0 || self.canceled.load(Ordering::SeqCst) {
            return;
        }
        let completed = self.completed.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        if completed + failed < total || self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        self.downloading.store(false, Ordering::SeqCst);
        info!(total, completed, failed, "HLS caching finished");

        if completed == 0 {
            self.notify_complete(false, None);
            return;
        }
        match self.save_local_m3u8_final().await {
            Ok(path) => self.notify_complete(true, Some(&path)),
            Err(e) => {
                error!(error = %e, "failed to write final playlist");
                self.notify_error(&e.to_string());
                self.notify_complete(false, None);
            }
        }
    }

    /// Rewrite `index.m3u8` over the full segment list, and fire the
    /// one-shot readiness callback once enough segments are down.
    async fn save_local_m3u8_partial(&self) -> Result<()> {
        let entries: Vec<(String, f32)> = self
            .segments
            .lock()
            .unwrap()
            .iter()
            .map(|s| (s.file_name.clone(), s.duration))
            .collect();
        if entries.is_empty() {
            return Ok(());
        }
        let content = rewrite::render_playlist(&entries);
        let path = {
            let _guard = self.rewrite_lock.lock().await;
            rewrite::write_local_playlist(&self.cache_dir, &content).await?
        };

        if self.completed.load(Ordering::SeqCst) >= self.config.min_segments_for_playback
            && !self.ready_notified.swap(true, Ordering::SeqCst)
        {
            info!(path = %path.display(), "enough segments cached, ready for playback");
            if let Some(listener) = self.listener() {
                listener.on_ready_for_playback(&path);
            }
        }
        Ok(())
    }

    /// Strict final rewrite: every segment must be on disk and non-empty,
    /// and the output is sorted by segment index.
    async fn save_local_m3u8_final(&self) -> Result<PathBuf> {
        let entries: Vec<(String, f32)> = self
            .segments
            .lock()
            .unwrap()
            .iter()
            .map(|s| (s.file_name.clone(), s.duration))
            .collect();

        let mut missing = Vec::new();
        for (file_name, _) in &entries {
            if !file_exists_non_empty(&self.cache_dir.join(file_name)).await {
                missing.push(file_name.clone());
            }
        }
        if !missing.is_empty() {
            return Err(VideoCacheError::MissingSegments {
                files: missing.join(", "),
            });
        }

        let mut sorted = entries;
        sorted.sort_by(|(a, _), (b, _)| segment_index(a).cmp(&segment_index(b)).then(a.cmp(b)));
        let content = rewrite::render_playlist(&sorted);
        let _guard = self.rewrite_lock.lock().await;
        rewrite::write_local_playlist(&self.cache_dir, &content).await
    }
}

async fn scheduler_loop(
    inner: Arc<Inner>,
    mut queue_rx: mpsc::UnboundedReceiver<SegmentTask>,
    concurrency: usize,
) {
    let mut heap: BinaryHeap<Reverse<SegmentTask>> = BinaryHeap::new();
    let mut in_flight = FuturesUnordered::new();
    let mut dispatched: HashSet<String> = HashSet::new();
    let mut closed = false;
    let mut draining = false;

    loop {
        // Fill free download slots in priority order. A segment already
        // dispatched or resolved only needed its priority bumped.
        if !draining {
            while in_flight.len() < concurrency
                && let Some(Reverse(task)) = heap.pop()
            {
                if dispatched.contains(&task.file_name) || inner.is_resolved(&task.file_name) {
                    continue;
                }
                dispatched.insert(task.file_name.clone());
                in_flight.push(download_segment(Arc::clone(&inner), task));
            }
        }

        if in_flight.is_empty() && (draining || (closed && heap.is_empty())) {
            break;
        }

        tokio::select! {
            biased;
            // Cancellation stops dispatching; in-flight downloads observe
            // the flag themselves, clean up, and finish.
            _ = inner.token.cancelled(), if !draining => {
                draining = true;
                heap.clear();
            }
            received = queue_rx.recv(), if !closed && !draining => match received {
                Some(task) => heap.push(Reverse(task)),
                None => closed = true,
            },
            Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
        }
    }
    debug!("segment scheduler finished");
}

async fn download_segment(inner: Arc<Inner>, task: SegmentTask) {
    if inner.canceled.load(Ordering::SeqCst) {
        return;
    }
    if task.priority > PRIORITY_IMMEDIATE {
        // Let the active window go first.
        let delay = Duration::from_millis(task.index.saturating_mul(10)).min(MAX_START_DELAY);
        sleep(delay).await;
        if inner.canceled.load(Ordering::SeqCst) {
            return;
        }
    }

    let file_path = inner.cache_dir.join(&task.file_name);
    if file_exists_non_empty(&file_path).await {
        debug!(segment = %task.file_name, "segment already on disk");
        inner.mark_resolved(&task.file_name);
        inner.record_success(&task.file_name).await;
        return;
    }

    let temp_path = inner.cache_dir.join(format!("{}.tmp", task.file_name));
    let mut url = task.url.clone();

    for attempt in 1..=inner.config.max_segment_retries {
        if inner.canceled.load(Ordering::SeqCst) {
            remove_quietly(&temp_path).await;
            return;
        }
        if attempt > 1 {
            debug!(segment = %task.file_name, attempt, "retrying segment download");
            sleep(inner.config.segment_retry_delay).await;
            if let Some(working) = inner.find_working_url_by_name(&task.file_name).await
                && working != url
            {
                debug!(url = %working, "switching to alternate segment URL");
                url = working;
            }
        }

        match try_download(&inner, &url, &file_path, &temp_path).await {
            Ok(DownloadOutcome::Done(bytes)) => {
                debug!(segment = %task.file_name, bytes, "segment downloaded");
                inner.mark_resolved(&task.file_name);
                inner.record_success(&task.file_name).await;
                return;
            }
            Ok(DownloadOutcome::Canceled) => {
                debug!(segment = %task.file_name, "download cancelled mid-stream");
                remove_quietly(&temp_path).await;
                return;
            }
            Err(e) => {
                warn!(segment = %task.file_name, attempt, error = %e, "segment download attempt failed");
            }
        }
    }

    remove_quietly(&temp_path).await;
    inner.mark_resolved(&task.file_name);
    inner.record_failure(&task.file_name).await;
}

enum DownloadOutcome {
    Done(u64),
    Canceled,
}

/// One download attempt: stream the body into `<name>.tmp` and rename into
/// place only when the stream ended and produced bytes.
async fn try_download(
    inner: &Inner,
    url: &str,
    file_path: &Path,
    temp_path: &Path,
) -> Result<DownloadOutcome> {
    let response = inner
        .client
        .get(url)
        .header(USER_AGENT, &inner.config.user_agent)
        .send()
        .await?;
    let status = response.status();
    if status != reqwest::StatusCode::OK {
        return Err(VideoCacheError::segment_fetch(format!(
            "HTTP {status} for {url}"
        )));
    }

    let mut file = fs::File::create(temp_path).await?;
    let mut stream = response.bytes_stream();
    let mut total: u64 = 0;
    while let Some(chunk) = stream.next().await {
        if inner.canceled.load(Ordering::SeqCst) {
            return Ok(DownloadOutcome::Canceled);
        }
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        total += chunk.len() as u64;
    }
    file.flush().await?;
    drop(file);

    if total == 0 {
        return Err(VideoCacheError::segment_fetch(format!(
            "empty segment body from {url}"
        )));
    }
    fs::rename(temp_path, file_path).await?;
    Ok(DownloadOutcome::Done(total))
}

async fn file_exists_non_empty(path: &Path) -> bool {
    fs::metadata(path).await.map(|m| m.len() > 0).unwrap_or(false)
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "failed to remove temp file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn fresh_engine_is_not_completed() {
        let dir = TempDir::new().unwrap();
        let cache = M3u8Cache::new(dir.path(), &VideoCacheConfig::default()).unwrap();
        assert!(!cache.is_completed());
        assert_eq!(cache.total_segments(), 0);
        assert!(cache.local_m3u8_path().is_none());
        assert_eq!(cache.segment_duration("unknown.ts"), DEFAULT_SEGMENT_DURATION);
    }

    #[tokio::test]
    async fn working_dir_is_the_m3u8_subdirectory() {
        let dir = TempDir::new().unwrap();
        let cache = M3u8Cache::new(dir.path(), &VideoCacheConfig::default()).unwrap();
        assert!(cache.cache_dir().ends_with("m3u8"));
        assert!(cache.cache_dir().is_dir());
    }
}
