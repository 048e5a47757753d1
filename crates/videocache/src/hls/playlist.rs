//! Playlist download and parsing.
//!
//! Master playlists resolve to their highest-bandwidth variant; media
//! playlists yield the ordered TS segment list with per-segment durations.

use reqwest::Client;
use reqwest::header::USER_AGENT;
use tracing::{debug, warn};

use crate::error::{Result, VideoCacheError};

/// Duration assumed for segments whose `#EXTINF` is missing or unusable.
pub(crate) const DEFAULT_SEGMENT_DURATION: f32 = 10.0;

/// One TS segment of a resolved media playlist, in playlist order.
#[derive(Debug, Clone)]
pub(crate) struct SegmentEntry {
    /// Absolute download URL.
    pub url: String,
    /// Basename used for the on-disk file and the rewritten playlist.
    pub file_name: String,
    pub duration: f32,
}

/// A media playlist resolved down to absolute segment URLs.
#[derive(Debug)]
pub(crate) struct MediaPlaylistInfo {
    /// Directory prefix segments resolve against; for master playlists this
    /// is the selected sub-playlist's directory.
    pub base_url: String,
    pub segments: Vec<SegmentEntry>,
    pub total_duration: f32,
}

/// Fetch and fully resolve the playlist at `url`, following one level of
/// master indirection.
pub(crate) async fn load_media_playlist(
    client: &Client,
    user_agent: &str,
    url: &str,
) -> Result<MediaPlaylistInfo> {
    let content = download_playlist(client, user_agent, url).await?;
    match m3u8_rs::parse_playlist_res(content.as_bytes()) {
        Ok(m3u8_rs::Playlist::MasterPlaylist(master)) => {
            let variant = select_variant(&master).ok_or_else(|| {
                VideoCacheError::playlist("master playlist has no usable variant")
            })?;
            debug!(bandwidth = variant.bandwidth, uri = %variant.uri, "selected variant");
            let sub_url = absolutize(&variant.uri, &base_url_of(url));
            let sub_content = download_playlist(client, user_agent, &sub_url).await?;
            match m3u8_rs::parse_playlist_res(sub_content.as_bytes()) {
                Ok(m3u8_rs::Playlist::MediaPlaylist(media)) => {
                    Ok(build_info(&media, base_url_of(&sub_url)))
                }
                Ok(m3u8_rs::Playlist::MasterPlaylist(_)) => Err(VideoCacheError::playlist(
                    "selected variant is itself a master playlist",
                )),
                Err(e) => Err(VideoCacheError::playlist(format!(
                    "failed to parse variant playlist {sub_url}: {e}"
                ))),
            }
        }
        Ok(m3u8_rs::Playlist::MediaPlaylist(media)) => Ok(build_info(&media, base_url_of(url))),
        Err(e) => Err(VideoCacheError::playlist(format!(
            "failed to parse playlist {url}: {e}"
        ))),
    }
}

async fn download_playlist(client: &Client, user_agent: &str, url: &str) -> Result<String> {
    debug!(url = %url, "downloading playlist");
    let response = client
        .get(url)
        .header(USER_AGENT, user_agent)
        .send()
        .await?;
    let status = response.status();
    if status != reqwest::StatusCode::OK {
        return Err(VideoCacheError::playlist(format!(
            "playlist download failed with HTTP {status} for {url}"
        )));
    }
    Ok(response.text().await?)
}

/// Highest-bandwidth variant of a master playlist.
fn select_variant(master: &m3u8_rs::MasterPlaylist) -> Option<&m3u8_rs::VariantStream> {
    master.variants.iter().max_by_key(|v| v.bandwidth)
}

fn build_info(media: &m3u8_rs::MediaPlaylist, base_url: String) -> MediaPlaylistInfo {
    let mut segments = Vec::new();
    let mut total_duration = 0.0;
    for segment in &media.segments {
        if !is_ts_uri(&segment.uri) {
            warn!(uri = %segment.uri, "skipping non-TS segment");
            continue;
        }
        let duration = if segment.duration > 0.0 {
            segment.duration
        } else {
            warn!(uri = %segment.uri, "segment has no usable duration, assuming default");
            DEFAULT_SEGMENT_DURATION
        };
        total_duration += duration;
        segments.push(SegmentEntry {
            url: absolutize(&segment.uri, &base_url),
            file_name: segment_file_name(&segment.uri),
            duration,
        });
    }
    debug!(
        segments = segments.len(),
        total_duration, "parsed media playlist"
    );
    MediaPlaylistInfo {
        base_url,
        segments,
        total_duration,
    }
}

fn is_ts_uri(uri: &str) -> bool {
    uri.split(['?', '#']).next().unwrap_or(uri).ends_with(".ts")
}

/// Everything through the last `/` of a URL, used to resolve relative
/// segment paths.
pub(crate) fn base_url_of(url: &str) -> String {
    match url.rfind('/') {
        Some(pos) if pos > 0 => url[..=pos].to_owned(),
        _ => url.to_owned(),
    }
}

/// Join a possibly-relative playlist URI to its base.
pub(crate) fn absolutize(uri: &str, base_url: &str) -> String {
    if uri.starts_with("http") {
        uri.to_owned()
    } else {
        format!("{base_url}{uri}")
    }
}

/// Basename of a segment URI, query string dropped.
pub(crate) fn segment_file_name(uri: &str) -> String {
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    path.rsplit('/').next().unwrap_or(path).to_owned()
}
