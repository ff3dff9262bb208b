//! Request/response message model over HTTP/2 streams.
//!
//! Incoming messages wrap one inbound stream as a readable body plus
//! validated metadata; outgoing messages buffer headers, body, and
//! trailers onto one outbound stream. Each concrete kind (request,
//! response, promise) composes the shared core with its own extracted
//! pseudo-headers.

pub mod incoming;
pub mod outgoing;

use crate::endpoint::Stream;
use crate::error::{Error, ErrorCode, Result};
use crate::headers::HeaderBlock;
use std::sync::Arc;

/// Protocol version a message travelled over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// HTTP/1.1 (fallback path)
    Http11,
    /// HTTP/2
    Http2,
}

impl Version {
    /// Version string as reported to users
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http11 => "1.1",
            Version::Http2 => "2.0",
        }
    }
}

/// Callback invoked for each pushed resource the peer promises
pub type PushHandler = Arc<dyn Fn(incoming::IncomingPromise) + Send + Sync>;

/// Extract a mandatory pseudo-header: present exactly once with a
/// non-empty value. On violation the stream (when given) is reset with
/// PROTOCOL_ERROR and the message is abandoned.
pub(crate) fn check_special_header(
    block: &HeaderBlock,
    name: &str,
    stream: Option<&Stream>,
) -> Result<String> {
    match (block.pseudo_count(name), block.pseudo(name)) {
        (1, Some(value)) if !value.is_empty() => Ok(value.to_string()),
        _ => {
            if let Some(stream) = stream {
                let _ = stream.reset(ErrorCode::ProtocolError);
            }
            Err(Error::Protocol(format!(
                "missing or malformed :{} pseudo-header",
                name
            )))
        }
    }
}
