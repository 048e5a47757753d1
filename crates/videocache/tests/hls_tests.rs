//! End-to-end tests for the HLS prefetch engine against an in-process
//! upstream.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::http::{Method, StatusCode};
use axum::routing::get;
use tempfile::TempDir;

use videocache::{M3u8Cache, M3u8CacheListener, VideoCacheConfig};

const SEGMENT_BYTES: usize = 188 * 5;

async fn spawn_upstream(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn test_config(root: &TempDir) -> VideoCacheConfig {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let mut config = VideoCacheConfig::with_cache_root(root.path());
    // Keep retry/backoff cheap so the failure paths finish quickly.
    config.segment_retry_delay = Duration::from_millis(10);
    config.segment_timeout = Duration::from_secs(5);
    config.validate_timeout = Duration::from_secs(2);
    config
}

fn media_playlist(count: usize, duration: f32) -> String {
    let mut playlist = String::from(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:7\n#EXT-X-MEDIA-SEQUENCE:0\n",
    );
    for i in 0..count {
        playlist.push_str(&format!("#EXTINF:{duration:.3},\nseg_{i:03}.ts\n"));
    }
    playlist.push_str("#EXT-X-ENDLIST\n");
    playlist
}

fn segment_body(index: usize) -> Vec<u8> {
    vec![0x47u8.wrapping_add(index as u8); SEGMENT_BYTES]
}

#[derive(Default)]
struct RecordingListener {
    progress: Mutex<Vec<(usize, usize, usize)>>,
    errors: Mutex<Vec<String>>,
    completes: Mutex<Vec<(bool, Option<PathBuf>)>>,
    ready: Mutex<Option<PathBuf>>,
}

impl M3u8CacheListener for RecordingListener {
    fn on_progress(&self, completed: usize, total: usize, failed: usize) {
        self.progress.lock().unwrap().push((completed, total, failed));
    }

    fn on_error(&self, error: &str) {
        self.errors.lock().unwrap().push(error.to_owned());
    }

    fn on_complete(&self, success: bool, local_path: Option<&Path>) {
        self.completes
            .lock()
            .unwrap()
            .push((success, local_path.map(Path::to_path_buf)));
    }

    fn on_ready_for_playback(&self, local_path: &Path) {
        *self.ready.lock().unwrap() = Some(local_path.to_path_buf());
    }
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn happy_path_downloads_everything_and_rewrites_the_playlist() {
    let playlist = media_playlist(10, 6.0);
    let mut app = Router::new().route(
        "/stream/index.m3u8",
        get(move || {
            let playlist = playlist.clone();
            async move { playlist }
        }),
    );
    for i in 0..10 {
        app = app.route(
            &format!("/stream/seg_{i:03}.ts"),
            get(move || async move { segment_body(i) }),
        );
    }
    let upstream = spawn_upstream(app).await;

    let root = TempDir::new().unwrap();
    let cache = M3u8Cache::new(root.path(), &test_config(&root)).unwrap();
    let listener = Arc::new(RecordingListener::default());
    cache.set_cache_listener(listener.clone());

    cache
        .cache(&format!("http://{upstream}/stream/index.m3u8"))
        .await
        .unwrap();
    assert_eq!(cache.total_segments(), 10);

    wait_until("run to complete", || {
        !listener.completes.lock().unwrap().is_empty()
    })
    .await;

    let completes = listener.completes.lock().unwrap().clone();
    assert_eq!(completes.len(), 1);
    let (success, path) = &completes[0];
    assert!(*success);
    let path = path.as_ref().unwrap();
    assert!(cache.is_completed());
    assert!(!cache.is_canceled());

    // Playback readiness fired before completion, pointing at the playlist.
    assert_eq!(listener.ready.lock().unwrap().as_deref(), Some(path.as_path()));

    // Final playlist: all ten segments in order, real durations, endlist.
    let content = tokio::fs::read_to_string(path).await.unwrap();
    assert!(content.starts_with("#EXTM3U\n"));
    assert!(content.contains("#EXT-X-TARGETDURATION:6\n"));
    assert!(content.contains("#EXT-X-PLAYLIST-TYPE:VOD\n"));
    assert!(content.ends_with("#EXT-X-ENDLIST\n"));
    let listed: Vec<&str> = content
        .lines()
        .filter(|l| l.ends_with(".ts"))
        .collect();
    let expected: Vec<String> = (0..10).map(|i| format!("seg_{i:03}.ts")).collect();
    assert_eq!(listed, expected);
    assert_eq!(content.matches("#EXTINF:6.000,").count(), 10);

    // Every listed segment is on disk and non-empty, plus the placeholder.
    for name in &expected {
        let meta = tokio::fs::metadata(cache.cache_dir().join(name)).await.unwrap();
        assert_eq!(meta.len() as usize, SEGMENT_BYTES);
    }
    let placeholder = tokio::fs::metadata(cache.cache_dir().join("empty.ts")).await.unwrap();
    assert_eq!(placeholder.len(), 188 * 1000);

    // No temp files left behind.
    let mut dir = tokio::fs::read_dir(cache.cache_dir()).await.unwrap();
    while let Some(entry) = dir.next_entry().await.unwrap() {
        let name = entry.file_name();
        assert!(
            !name.to_string_lossy().ends_with(".tmp"),
            "leftover temp file {name:?}"
        );
    }

    // Counters respected the invariant on the way through.
    for (completed, total, failed) in listener.progress.lock().unwrap().iter() {
        assert!(completed + failed <= *total);
    }
}

#[tokio::test]
async fn three_consecutive_failures_cancel_the_run() {
    let playlist = media_playlist(10, 6.0);
    let gets = Arc::new(AtomicUsize::new(0));
    let gets_for_handler = Arc::clone(&gets);

    // HEAD probes succeed so every segment is queued, but every GET 404s.
    let mut app = Router::new().route(
        "/stream/index.m3u8",
        get(move || {
            let playlist = playlist.clone();
            async move { playlist }
        }),
    );
    for i in 0..10 {
        let gets = Arc::clone(&gets_for_handler);
        app = app.route(
            &format!("/stream/seg_{i:03}.ts"),
            axum::routing::any(move |method: Method| {
                let gets = Arc::clone(&gets);
                async move {
                    if method == Method::HEAD {
                        StatusCode::OK
                    } else {
                        gets.fetch_add(1, Ordering::SeqCst);
                        StatusCode::NOT_FOUND
                    }
                }
            }),
        );
    }
    let upstream = spawn_upstream(app).await;

    let root = TempDir::new().unwrap();
    let cache = M3u8Cache::new(root.path(), &test_config(&root)).unwrap();
    let listener = Arc::new(RecordingListener::default());
    cache.set_cache_listener(listener.clone());

    let _ = cache
        .cache(&format!("http://{upstream}/stream/index.m3u8"))
        .await;

    wait_until("failure gate to fire", || {
        !listener.errors.lock().unwrap().is_empty()
    })
    .await;

    let errors = listener.errors.lock().unwrap().clone();
    assert!(
        errors[0].starts_with("continuous 3 downloads failed"),
        "unexpected error: {}",
        errors[0]
    );
    assert!(cache.is_canceled());
    assert!(!cache.is_completed());

    // Once cancellation settles, no further segment requests go out.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let settled = gets.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        gets.load(Ordering::SeqCst),
        settled,
        "requests kept flowing after cancellation"
    );
}

#[tokio::test]
async fn master_playlist_selects_the_highest_bandwidth_variant() {
    let master = "#EXTM3U\n\
        #EXT-X-STREAM-INF:BANDWIDTH=400000,RESOLUTION=640x360\n\
        low/index.m3u8\n\
        #EXT-X-STREAM-INF:BANDWIDTH=1200000,RESOLUTION=1920x1080\n\
        high/index.m3u8\n\
        #EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=1280x720\n\
        mid/index.m3u8\n"
        .to_owned();
    let high_hits = Arc::new(AtomicUsize::new(0));
    let high_hits_for_handler = Arc::clone(&high_hits);

    let playlist = media_playlist(4, 4.0);
    let mut app = Router::new()
        .route(
            "/vod/master.m3u8",
            get(move || {
                let master = master.clone();
                async move { master }
            }),
        )
        .route(
            "/vod/high/index.m3u8",
            get(move || {
                let playlist = playlist.clone();
                async move { playlist }
            }),
        );
    for i in 0..4 {
        let hits = Arc::clone(&high_hits_for_handler);
        app = app.route(
            &format!("/vod/high/seg_{i:03}.ts"),
            get(move |method: Method| {
                let hits = Arc::clone(&hits);
                async move {
                    if method == Method::GET {
                        hits.fetch_add(1, Ordering::SeqCst);
                    }
                    segment_body(i)
                }
            }),
        );
    }
    let upstream = spawn_upstream(app).await;

    let root = TempDir::new().unwrap();
    let cache = M3u8Cache::new(root.path(), &test_config(&root)).unwrap();
    let listener = Arc::new(RecordingListener::default());
    cache.set_cache_listener(listener.clone());

    cache
        .cache(&format!("http://{upstream}/vod/master.m3u8"))
        .await
        .unwrap();

    wait_until("run to complete", || {
        !listener.completes.lock().unwrap().is_empty()
    })
    .await;

    let completes = listener.completes.lock().unwrap().clone();
    assert!(completes[0].0, "expected a successful run");
    // Segment URLs resolved against the selected variant's directory.
    assert_eq!(high_hits.load(Ordering::SeqCst), 4);
    assert_eq!(cache.total_segments(), 4);
}

#[tokio::test]
async fn segments_already_on_disk_are_not_downloaded_again() {
    let playlist = media_playlist(3, 6.0);
    let gets = Arc::new(AtomicUsize::new(0));
    let gets_for_handler = Arc::clone(&gets);

    let mut app = Router::new().route(
        "/s/index.m3u8",
        get(move || {
            let playlist = playlist.clone();
            async move { playlist }
        }),
    );
    for i in 0..3 {
        let gets = Arc::clone(&gets_for_handler);
        app = app.route(
            &format!("/s/seg_{i:03}.ts"),
            get(move |method: Method| {
                let gets = Arc::clone(&gets);
                async move {
                    if method == Method::GET {
                        gets.fetch_add(1, Ordering::SeqCst);
                    }
                    segment_body(i)
                }
            }),
        );
    }
    let upstream = spawn_upstream(app).await;

    let root = TempDir::new().unwrap();
    let config = test_config(&root);
    let cache = M3u8Cache::new(root.path(), &config).unwrap();
    let listener = Arc::new(RecordingListener::default());
    cache.set_cache_listener(listener.clone());

    // Pre-seed one segment on disk.
    tokio::fs::write(cache.cache_dir().join("seg_001.ts"), segment_body(1))
        .await
        .unwrap();

    cache
        .cache(&format!("http://{upstream}/s/index.m3u8"))
        .await
        .unwrap();

    wait_until("run to complete", || {
        !listener.completes.lock().unwrap().is_empty()
    })
    .await;

    assert!(listener.completes.lock().unwrap()[0].0);
    assert!(cache.is_completed());
    // Only the two missing segments were fetched.
    assert_eq!(gets.load(Ordering::SeqCst), 2);
}
