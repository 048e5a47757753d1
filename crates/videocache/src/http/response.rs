//! Response head construction.
//!
//! Heads are built as strings and written ahead of the body bytes. Every
//! success response advertises range support and permissive CORS so media
//! players and web views can seek freely.

use reqwest::StatusCode;

fn common_headers(content_type: &str, content_length: Option<u64>) -> String {
    let mut headers = format!("Content-Type: {content_type}\r\n");
    if let Some(length) = content_length {
        headers.push_str(&format!("Content-Length: {length}\r\n"));
    }
    headers.push_str(
        "Connection: keep-alive\r\n\
         Accept-Ranges: bytes\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Cache-Control: no-cache\r\n\
         \r\n",
    );
    headers
}

/// `200 OK` head for a full-body response. `content_length` is omitted when
/// the origin did not advertise one.
pub fn ok_head(content_type: &str, content_length: Option<u64>) -> String {
    format!(
        "HTTP/1.1 200 OK\r\n{}",
        common_headers(content_type, content_length)
    )
}

/// `206 Partial Content` head. `content_range` is omitted when unknown.
pub fn partial_head(
    content_type: &str,
    content_length: Option<u64>,
    content_range: Option<&str>,
) -> String {
    let mut head = String::from("HTTP/1.1 206 Partial Content\r\n");
    if let Some(range) = content_range
        && !range.trim().is_empty()
    {
        head.push_str(&format!("Content-Range: {range}\r\n"));
    }
    head.push_str(&common_headers(content_type, content_length));
    head
}

/// `416` head carrying the total resource size.
pub fn range_not_satisfiable_head(total: u64) -> String {
    format!(
        "HTTP/1.1 416 Requested Range Not Satisfiable\r\n\
         Content-Range: bytes */{total}\r\n\
         Content-Length: 0\r\n\
         \r\n"
    )
}

/// Bare status head used to forward upstream failures.
pub fn status_head(status: StatusCode) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
}

/// `500` head plus the error message as body.
pub fn internal_error(message: &str) -> String {
    format!("HTTP/1.1 500 Internal Server Error\r\n\r\n{message}")
}

/// `bytes <start>-<end>/<total>` Content-Range value.
pub fn content_range_value(start: u64, end: u64, total: u64) -> String {
    format!("bytes {start}-{end}/{total}")
}
