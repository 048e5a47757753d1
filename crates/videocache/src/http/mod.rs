//! Minimal HTTP/1.1 framing for the loopback proxy.

pub mod request;
pub mod response;

pub use request::{ByteRange, Request, read_request, restore_url};
