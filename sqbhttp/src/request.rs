//! Minimal request parsing for the per-track server.
//!
//! Renderers send small GET/HEAD requests; everything is collected into a
//! case-insensitive header map and the track index is lifted from the
//! `bridge-<n>` path component.

use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub http11: bool,
    headers: HashMap<String, String>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains_key(&name.to_ascii_lowercase())
    }

    /// Track index from `/<prefix>bridge-<n>.<ext>`, suffix ignored.
    pub fn track_index(&self) -> Option<u16> {
        let at = self.path.find("bridge-")?;
        let digits: String = self.path[at + "bridge-".len()..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        digits.parse().ok()
    }

    /// First byte of a `Range: bytes=<n>-` header.
    pub fn range_start(&self) -> Option<u64> {
        let range = self.header("range")?;
        let spec = range.trim().strip_prefix("bytes=")?;
        let start = spec.split('-').next()?;
        start.trim().parse().ok()
    }

    pub fn user_agent_contains(&self, needle: &str) -> bool {
        self.header("user-agent")
            .map(|ua| ua.to_ascii_lowercase().contains(&needle.to_ascii_lowercase()))
            .unwrap_or(false)
    }
}

/// Parses a full request block (through the blank line). Returns None when
/// the block is not yet complete or malformed.
pub fn parse_request(data: &[u8]) -> Option<HttpRequest> {
    let end = data.windows(4).position(|w| w == b"\r\n\r\n")?;
    let text = std::str::from_utf8(&data[..end]).ok()?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();
    let version = parts.next().unwrap_or("HTTP/1.0");

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    Some(HttpRequest {
        method,
        path,
        http11: version == "HTTP/1.1",
        headers,
    })
}

/// True once a full header block has arrived.
pub fn request_complete(data: &[u8]) -> bool {
    data.windows(4).any(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: &[u8] = b"GET /bridge-12.flac HTTP/1.1\r\nHost: 10.0.0.3:8070\r\nUser-Agent: Sonos/57.3\r\nRange: bytes=4096-\r\nIcy-Metadata: 1\r\n\r\n";

    #[test]
    fn parses_request_line_and_headers() {
        let request = parse_request(REQUEST).unwrap();
        assert_eq!(request.method, "GET");
        assert!(request.http11);
        assert_eq!(request.track_index(), Some(12));
        assert_eq!(request.range_start(), Some(4096));
        assert!(request.user_agent_contains("sonos"));
        assert_eq!(request.header("icy-metadata"), Some("1"));
        assert!(!request.has_header("transfermode.dlna.org"));
    }

    #[test]
    fn incomplete_request_returns_none() {
        assert!(parse_request(b"GET /bridge-1.mp3 HTTP/1.0\r\nHost: x\r\n").is_none());
        assert!(!request_complete(b"GET /"));
        assert!(request_complete(REQUEST));
    }

    #[test]
    fn index_extraction_ignores_suffix() {
        let request = parse_request(b"HEAD /prefix/bridge-7.mp3?x=1 HTTP/1.0\r\n\r\n").unwrap();
        assert_eq!(request.track_index(), Some(7));
        let request = parse_request(b"GET /nothing HTTP/1.0\r\n\r\n").unwrap();
        assert_eq!(request.track_index(), None);
    }
}
