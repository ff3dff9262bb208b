//! Header model and HTTP/2 header block validation.
//!
//! HTTP/2 header blocks are ordered lists of (name, value) pairs in
//! which names are lowercase and pseudo-headers (names beginning with
//! `:`) precede regular fields. The types here keep the two name
//! classes apart so a message's `headers()` map can never contain a
//! pseudo-header by construction.

use crate::error::ErrorCode;
use std::fmt;

/// Header names that must not appear in an HTTP/2 message.
///
/// These carry HTTP/1.1 connection-level semantics that HTTP/2 either
/// forbids (RFC 7540 Section 8.1.2.2) or replaces with pseudo-headers.
pub const FORBIDDEN_HEADERS: &[&str] = &[
    "connection",
    "host",
    "keep-alive",
    "proxy-connection",
    "te",
    "transfer-encoding",
    "upgrade",
];

/// Check whether a header name is on the forbidden list.
pub fn is_forbidden(name: &str) -> bool {
    FORBIDDEN_HEADERS
        .iter()
        .any(|f| f.eq_ignore_ascii_case(name))
}

/// Insertion-ordered header multimap with lowercase names.
///
/// Lookups are case-insensitive; names are normalized to lowercase on
/// insert, matching the wire form HPACK produces.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Create a new empty header map
    pub fn new() -> Self {
        Headers {
            entries: Vec::new(),
        }
    }

    /// Insert a header, keeping any existing values for the same name
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into().to_ascii_lowercase();
        self.entries.push((name, value.into()));
    }

    /// Get the first value for a header (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Get all values for a header (case-insensitive)
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Check if a header exists
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Remove all values for a header; returns how many were removed
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before - self.entries.len()
    }

    /// Number of header fields
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if there are no headers
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over all fields in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.entries {
            writeln!(f, "{}: {}", name, value)?;
        }
        Ok(())
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

/// A header name, tagged by class.
///
/// Pseudo names are stored without the leading `:`; `wire_name` adds it
/// back when the block is serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderName {
    /// HTTP/2 control metadata (`:method`, `:status`, ...)
    Pseudo(String),
    /// An ordinary header field
    Regular(String),
}

impl HeaderName {
    /// The name as it appears on the wire
    pub fn wire_name(&self) -> String {
        match self {
            HeaderName::Pseudo(n) => format!(":{}", n),
            HeaderName::Regular(n) => n.clone(),
        }
    }
}

/// An ordered HTTP/2 header block separating pseudo and regular fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderBlock {
    entries: Vec<(HeaderName, String)>,
}

impl HeaderBlock {
    /// Create an empty block
    pub fn new() -> Self {
        HeaderBlock {
            entries: Vec::new(),
        }
    }

    /// Append a pseudo-header (name given without the leading `:`)
    pub fn push_pseudo(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries
            .push((HeaderName::Pseudo(name.into()), value.into()));
    }

    /// Append a regular header (name normalized to lowercase)
    pub fn push_regular(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into().to_ascii_lowercase();
        self.entries.push((HeaderName::Regular(name), value.into()));
    }

    /// Get the first value of a pseudo-header (name without `:`)
    pub fn pseudo(&self, name: &str) -> Option<&str> {
        self.entries.iter().find_map(|(n, v)| match n {
            HeaderName::Pseudo(p) if p == name => Some(v.as_str()),
            _ => None,
        })
    }

    /// Count occurrences of a pseudo-header
    pub fn pseudo_count(&self, name: &str) -> usize {
        self.entries
            .iter()
            .filter(|(n, _)| matches!(n, HeaderName::Pseudo(p) if p == name))
            .count()
    }

    /// Copy the regular fields into a `Headers` map
    pub fn regular_headers(&self) -> Headers {
        let mut headers = Headers::new();
        for (name, value) in &self.entries {
            if let HeaderName::Regular(n) = name {
                headers.insert(n.clone(), value.clone());
            }
        }
        headers
    }

    /// True if the block contains any pseudo-header
    pub fn has_pseudo(&self) -> bool {
        self.entries
            .iter()
            .any(|(n, _)| matches!(n, HeaderName::Pseudo(_)))
    }

    /// Iterate over all entries in order
    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &str)> {
        self.entries.iter().map(|(n, v)| (n, v.as_str()))
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the block is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build a block from HPACK-decoded (name, value) pairs.
    ///
    /// Splits pseudo from regular fields and rejects blocks that are
    /// malformed at the framing level: non-UTF-8 names or values, empty
    /// names, or a pseudo-header appearing after a regular field
    /// (RFC 7540 Section 8.1.2.1).
    pub fn from_wire(
        decoded: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> std::result::Result<HeaderBlock, ErrorCode> {
        let mut block = HeaderBlock::new();
        let mut seen_regular = false;

        for (name, value) in decoded {
            let name = String::from_utf8(name).map_err(|_| ErrorCode::ProtocolError)?;
            let value = String::from_utf8(value).map_err(|_| ErrorCode::ProtocolError)?;

            if name.is_empty() {
                return Err(ErrorCode::ProtocolError);
            }

            if let Some(pseudo) = name.strip_prefix(':') {
                if seen_regular {
                    return Err(ErrorCode::ProtocolError);
                }
                block
                    .entries
                    .push((HeaderName::Pseudo(pseudo.to_string()), value));
            } else {
                seen_regular = true;
                block.entries.push((HeaderName::Regular(name), value));
            }
        }

        Ok(block)
    }

    /// Serialize to the wire form handed to the HPACK encoder,
    /// pseudo-headers first.
    pub fn to_wire(&self) -> Vec<(String, String)> {
        let mut wire = Vec::with_capacity(self.entries.len());
        for (name, value) in &self.entries {
            if matches!(name, HeaderName::Pseudo(_)) {
                wire.push((name.wire_name(), value.clone()));
            }
        }
        for (name, value) in &self.entries {
            if matches!(name, HeaderName::Regular(_)) {
                wire.push((name.wire_name(), value.clone()));
            }
        }
        wire
    }

    /// Validate an inbound header block against HTTP/2 conformance
    /// rules.
    ///
    /// On rejection the caller must reset the stream with the returned
    /// code; this function itself never panics and never touches the
    /// stream. Rules, applied in order:
    ///
    /// 1. no forbidden header name may be present,
    /// 2. every name is at least 2 characters long,
    /// 3. no name contains an uppercase ASCII letter.
    ///
    /// Pseudo-header presence requirements are checked by the message
    /// types, not here.
    pub fn validate(&self) -> std::result::Result<(), ErrorCode> {
        for (name, _) in &self.entries {
            if let HeaderName::Regular(n) = name {
                if is_forbidden(n) {
                    return Err(ErrorCode::ProtocolError);
                }
            }
        }
        for (name, _) in &self.entries {
            if name.wire_name().len() < 2 {
                return Err(ErrorCode::ProtocolError);
            }
        }
        for (name, _) in &self.entries {
            if name.wire_name().bytes().any(|b| b.is_ascii_uppercase()) {
                return Err(ErrorCode::ProtocolError);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "text/plain");
        headers.insert("content-length", "5");

        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.get("Content-Length"), Some("5"));
        assert_eq!(headers.get("missing"), None);
    }

    #[test]
    fn test_names_lowercased_on_insert() {
        let mut headers = Headers::new();
        headers.insert("X-Custom", "v");

        let collected: Vec<_> = headers.iter().collect();
        assert_eq!(collected, vec![("x-custom", "v")]);
    }

    #[test]
    fn test_multiple_values() {
        let mut headers = Headers::new();
        headers.insert("set-cookie", "a=1");
        headers.insert("set-cookie", "b=2");

        assert_eq!(headers.get("set-cookie"), Some("a=1"));
        assert_eq!(headers.get_all("set-cookie"), vec!["a=1", "b=2"]);
    }

    #[test]
    fn test_remove() {
        let mut headers = Headers::new();
        headers.insert("x-drop", "1");
        headers.insert("x-keep", "2");
        headers.insert("x-drop", "3");

        assert_eq!(headers.remove("X-Drop"), 2);
        assert!(!headers.contains("x-drop"));
        assert_eq!(headers.get("x-keep"), Some("2"));
    }

    #[test]
    fn test_block_partitions_pseudo_and_regular() {
        let decoded = vec![
            (b":method".to_vec(), b"GET".to_vec()),
            (b":path".to_vec(), b"/".to_vec()),
            (b"accept".to_vec(), b"*/*".to_vec()),
        ];
        let block = HeaderBlock::from_wire(decoded).unwrap();

        assert_eq!(block.pseudo("method"), Some("GET"));
        assert_eq!(block.pseudo("path"), Some("/"));
        let regular = block.regular_headers();
        assert_eq!(regular.len(), 1);
        assert_eq!(regular.get("accept"), Some("*/*"));
    }

    #[test]
    fn test_block_rejects_pseudo_after_regular() {
        let decoded = vec![
            (b"accept".to_vec(), b"*/*".to_vec()),
            (b":method".to_vec(), b"GET".to_vec()),
        ];
        assert_eq!(
            HeaderBlock::from_wire(decoded),
            Err(ErrorCode::ProtocolError)
        );
    }

    #[test]
    fn test_block_rejects_empty_name() {
        let decoded = vec![(b"".to_vec(), b"x".to_vec())];
        assert_eq!(
            HeaderBlock::from_wire(decoded),
            Err(ErrorCode::ProtocolError)
        );
    }

    #[test]
    fn test_validate_rejects_forbidden() {
        for name in FORBIDDEN_HEADERS {
            let mut block = HeaderBlock::new();
            block.push_regular(*name, "x");
            assert_eq!(block.validate(), Err(ErrorCode::ProtocolError), "{}", name);
        }
    }

    #[test]
    fn test_validate_rejects_short_names() {
        let mut block = HeaderBlock::new();
        block.push_regular("a", "x");
        assert_eq!(block.validate(), Err(ErrorCode::ProtocolError));
    }

    #[test]
    fn test_validate_rejects_uppercase() {
        let decoded = vec![(b"Content-Type".to_vec(), b"text/plain".to_vec())];
        let block = HeaderBlock::from_wire(decoded).unwrap();
        assert_eq!(block.validate(), Err(ErrorCode::ProtocolError));
    }

    #[test]
    fn test_validate_accepts_normal_block() {
        let mut block = HeaderBlock::new();
        block.push_pseudo("method", "GET");
        block.push_pseudo("path", "/");
        block.push_regular("content-type", "text/plain");
        assert!(block.validate().is_ok());
    }

    #[test]
    fn test_wire_order_pseudo_first() {
        let mut block = HeaderBlock::new();
        block.push_regular("accept", "*/*");
        block.push_pseudo("method", "GET");

        let wire = block.to_wire();
        assert_eq!(wire[0].0, ":method");
        assert_eq!(wire[1].0, "accept");
    }
}
