//! Local playlist emission.
//!
//! The rewritten `index.m3u8` always covers the full segment list so the
//! player sees the true total duration; entries flip from remote names to
//! locally cached ones simply by the files appearing on disk next to it.

use std::fmt::Write as _;
use std::path::Path;

use tokio::fs;

use crate::error::Result;

/// Name of the rewritten playlist inside the HLS working directory.
pub(crate) const LOCAL_PLAYLIST_NAME: &str = "index.m3u8";

/// Placeholder TS file emitted once per working directory.
pub(crate) const EMPTY_TS_NAME: &str = "empty.ts";

const TS_PACKET_LEN: usize = 188;
const EMPTY_TS_PACKETS: usize = 1000;

/// Render a VOD playlist over `entries` (`(file name, duration seconds)` in
/// playlist order). The target duration is the ceiling of the longest entry.
pub(crate) fn render_playlist(entries: &[(String, f32)]) -> String {
    let max_duration = entries.iter().map(|(_, d)| *d).fold(0.0f32, f32::max);
    let mut out = String::new();
    out.push_str("#EXTM3U\n");
    out.push_str("#EXT-X-VERSION:3\n");
    let _ = writeln!(out, "#EXT-X-TARGETDURATION:{}", max_duration.ceil() as u64);
    out.push_str("#EXT-X-MEDIA-SEQUENCE:0\n");
    out.push_str("#EXT-X-PLAYLIST-TYPE:VOD\n");
    for (file_name, duration) in entries {
        let _ = writeln!(out, "#EXTINF:{duration:.3},");
        out.push_str(file_name);
        out.push('\n');
    }
    out.push_str("#EXT-X-ENDLIST\n");
    out
}

/// Overwrite `index.m3u8` under `dir` with `content`. The write goes through
/// a sibling temp file and a rename, so readers only ever see a complete
/// playlist and the last writer wins.
pub(crate) async fn write_local_playlist(dir: &Path, content: &str) -> Result<std::path::PathBuf> {
    let path = dir.join(LOCAL_PLAYLIST_NAME);
    let temp_path = path.with_extension("m3u8.tmp");
    fs::write(&temp_path, content).await?;
    fs::rename(&temp_path, &path).await?;
    Ok(path)
}

/// 1000 null packets: sync byte 0x47, PID 0x1FFF, payload-only adaptation,
/// stuffing payload.
pub(crate) fn empty_ts_payload() -> Vec<u8> {
    let mut packet = [0xFFu8; TS_PACKET_LEN];
    packet[0] = 0x47;
    packet[1] = 0x1F;
    packet[2] = 0xFF;
    packet[3] = 0x10;
    let mut payload = Vec::with_capacity(TS_PACKET_LEN * EMPTY_TS_PACKETS);
    for _ in 0..EMPTY_TS_PACKETS {
        payload.extend_from_slice(&packet);
    }
    payload
}

/// Write the placeholder segment once; an existing copy is left alone.
pub(crate) async fn ensure_empty_ts(dir: &Path) -> Result<()> {
    let path = dir.join(EMPTY_TS_NAME);
    if fs::try_exists(&path).await.unwrap_or(false) {
        return Ok(());
    }
    fs::write(&path, empty_ts_payload()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(durations: &[f32]) -> Vec<(String, f32)> {
        durations
            .iter()
            .enumerate()
            .map(|(i, d)| (format!("seg_{i:03}.ts"), *d))
            .collect()
    }

    #[test]
    fn playlist_has_header_segments_and_endlist() {
        let playlist = render_playlist(&entries(&[6.0, 6.0, 6.0]));
        let lines: Vec<&str> = playlist.lines().collect();
        assert_eq!(lines[0], "#EXTM3U");
        assert_eq!(lines[1], "#EXT-X-VERSION:3");
        assert_eq!(lines[2], "#EXT-X-TARGETDURATION:6");
        assert_eq!(lines[3], "#EXT-X-MEDIA-SEQUENCE:0");
        assert_eq!(lines[4], "#EXT-X-PLAYLIST-TYPE:VOD");
        assert_eq!(lines[5], "#EXTINF:6.000,");
        assert_eq!(lines[6], "seg_000.ts");
        assert_eq!(*lines.last().unwrap(), "#EXT-X-ENDLIST");
    }

    #[test]
    fn target_duration_is_ceiling_of_longest() {
        let playlist = render_playlist(&entries(&[4.2, 6.8, 5.0]));
        assert!(playlist.contains("#EXT-X-TARGETDURATION:7\n"));
    }

    #[test]
    fn duration_sum_is_preserved_for_all_entries() {
        let durations = [6.0f32, 5.5, 4.25];
        let playlist = render_playlist(&entries(&durations));
        let sum: f32 = playlist
            .lines()
            .filter_map(|l| l.strip_prefix("#EXTINF:"))
            .map(|l| l.trim_end_matches(',').parse::<f32>().unwrap())
            .sum();
        let expected: f32 = durations.iter().sum();
        assert!((sum - expected).abs() < 0.001);
    }

    #[test]
    fn rendering_is_deterministic() {
        let e = entries(&[6.0, 6.0]);
        assert_eq!(render_playlist(&e), render_playlist(&e));
    }

    #[test]
    fn empty_ts_is_null_pid_packets() {
        let payload = empty_ts_payload();
        assert_eq!(payload.len(), 188 * 1000);
        for packet in payload.chunks(188) {
            assert_eq!(packet[0], 0x47);
            assert_eq!(((packet[1] as u16 & 0x1F) << 8) | packet[2] as u16, 0x1FFF);
        }
    }

    #[tokio::test]
    async fn local_playlist_write_is_a_full_overwrite() {
        let dir = tempfile::TempDir::new().unwrap();
        let long = render_playlist(&entries(&[6.0, 6.0, 6.0]));
        let short = render_playlist(&entries(&[6.0]));
        write_local_playlist(dir.path(), &long).await.unwrap();
        let path = write_local_playlist(dir.path(), &short).await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), short);
    }
}
