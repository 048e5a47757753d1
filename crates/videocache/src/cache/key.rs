//! Content-addressed cache file naming.
//!
//! A cache file is named by the MD5 digest of the full URL, keeping the last
//! path extension (when short enough to be one) so players and MIME sniffing
//! keep working against the on-disk file.

use md5::{Digest, Md5};

/// Longest suffix after the final `.` still treated as a file extension.
const MAX_EXTENSION_LEN: usize = 4;

/// File name for the cache entry of `url`: `<md5-hex>[.<ext>]`.
pub fn cache_file_name(url: &str) -> String {
    let digest = url_digest(url);
    match file_extension(url) {
        Some(ext) => format!("{digest}.{ext}"),
        None => digest,
    }
}

/// Lowercase 32-char hex MD5 of the URL.
pub fn url_digest(url: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(url.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// The URL's last path extension, ignoring the query string. Suffixes longer
/// than four characters or spanning a path separator do not count.
fn file_extension(url: &str) -> Option<&str> {
    let path = url.split('?').next().unwrap_or(url);
    let ext = path.rsplit_once('.')?.1;
    if ext.is_empty() || ext.len() > MAX_EXTENSION_LEN || ext.contains('/') {
        return None;
    }
    Some(ext)
}
