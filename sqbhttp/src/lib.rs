//! Per-track ephemeral HTTP server: one listening socket per in-flight
//! track, ICY metadata injection, Range and chunked support, and a replay
//! cache so probing renderers can re-open finished resources.

pub mod request;
pub mod server;

pub use request::{parse_request, HttpRequest};
pub use server::{output_abort, output_flush, output_start, ICY_INTERVAL};

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sqbaudio::config::{PlayerConfig, HTTP_CHUNKED};
    use sqbaudio::pipeline::{OutputPhase, Pipeline};
    use sqbcache::{cache_create, CacheType};

    use crate::request::parse_request;
    use crate::server::handle_http;

    fn pipeline() -> Arc<Pipeline> {
        let config = PlayerConfig {
            stream_length: HTTP_CHUNKED,
            ..PlayerConfig::default()
        };
        let pipe = Arc::new(Pipeline::new(config, true));
        {
            let mut zone = pipe.output.lock().unwrap();
            zone.output.index = 3;
            zone.output.state = OutputPhase::Running;
            zone.output.mimetype = "audio/flac".to_string();
            zone.output.format = 'f';
            zone.output.length = HTTP_CHUNKED;
        }
        pipe
    }

    fn request(text: &str) -> crate::HttpRequest {
        parse_request(text.as_bytes()).expect("parseable request")
    }

    #[test]
    fn normal_get_is_chunked_http11() {
        let pipe = pipeline();
        let mut cache = cache_create(CacheType::Infinite, 0);
        let result = handle_http(
            &pipe,
            cache.as_mut(),
            false,
            3,
            &request("GET /bridge-3.flac HTTP/1.1\r\nHost: x\r\n\r\n"),
        );
        let response = String::from_utf8(result.response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Transfer-Encoding: chunked\r\n"));
        assert!(response.contains("Server: squeezebox-bridge\r\n"));
        assert!(response.contains("Accept-Ranges: bytes\r\n"));
        assert!(response.contains("Content-Type: audio/flac\r\n"));
        assert!(response.contains("Connection: close\r\n"));
        assert!(result.send_body);
        assert!(!result.use_cache);
    }

    #[test]
    fn http10_is_not_chunked() {
        let pipe = pipeline();
        let mut cache = cache_create(CacheType::Infinite, 0);
        let result = handle_http(
            &pipe,
            cache.as_mut(),
            false,
            3,
            &request("GET /bridge-3.flac HTTP/1.0\r\n\r\n"),
        );
        let response = String::from_utf8(result.response).unwrap();
        assert!(response.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(!response.contains("Transfer-Encoding"));
    }

    #[test]
    fn wrong_index_gets_410() {
        let pipe = pipeline();
        let mut cache = cache_create(CacheType::Infinite, 0);
        let result = handle_http(
            &pipe,
            cache.as_mut(),
            false,
            3,
            &request("GET /bridge-9.flac HTTP/1.1\r\n\r\n"),
        );
        let response = String::from_utf8(result.response).unwrap();
        assert!(response.starts_with("HTTP/1.0 410 Gone\r\n"));
        assert!(!result.send_body);
    }

    #[test]
    fn sonos_range_reopen_has_no_content_range() {
        let pipe = pipeline();
        let mut cache = cache_create(CacheType::Infinite, 0);
        cache.write(&vec![7u8; 10_000]);

        let result = handle_http(
            &pipe,
            cache.as_mut(),
            false,
            3,
            &request(
                "GET /bridge-3.flac HTTP/1.1\r\nUser-Agent: Linux UPnP/1.0 Sonos/57.3\r\nRange: bytes=4000-\r\n\r\n",
            ),
        );
        let response = String::from_utf8(result.response).unwrap();
        assert!(response.starts_with("HTTP/1.1 206 Partial Content\r\n"));
        assert!(!response.contains("Content-Range"));
        assert!(result.use_cache);

        // a generic renderer doing the same gets the Content-Range
        let result = handle_http(
            &pipe,
            cache.as_mut(),
            false,
            3,
            &request("GET /bridge-3.flac HTTP/1.1\r\nRange: bytes=4000-\r\n\r\n"),
        );
        let response = String::from_utf8(result.response).unwrap();
        assert!(response.contains("Content-Range: bytes 4000-9999/*\r\n"));
    }

    #[test]
    fn out_of_scope_range_after_linger_is_416() {
        let pipe = pipeline();
        let mut cache = cache_create(CacheType::Infinite, 0);
        cache.write(&[1u8; 100]);

        let result = handle_http(
            &pipe,
            cache.as_mut(),
            true,
            3,
            &request("GET /bridge-3.flac HTTP/1.1\r\nRange: bytes=5000-\r\n\r\n"),
        );
        let response = String::from_utf8(result.response).unwrap();
        assert!(response.starts_with("HTTP/1.0 416 Range Not Satisfiable\r\n"));
        assert!(response.contains("Content-Range: */100\r\n"));
        assert!(!result.send_body);
    }

    #[test]
    fn continuation_range_streams_live() {
        // offset == cache.total while not lingering: a plain 200 continues
        let pipe = pipeline();
        let mut cache = cache_create(CacheType::Infinite, 0);
        cache.write(&[1u8; 2048]);

        let result = handle_http(
            &pipe,
            cache.as_mut(),
            false,
            3,
            &request("GET /bridge-3.flac HTTP/1.1\r\nRange: bytes=2048-\r\n\r\n"),
        );
        let response = String::from_utf8(result.response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(!result.use_cache);
    }

    #[test]
    fn icy_negotiated_only_when_allowed() {
        let pipe = pipeline();
        {
            let mut zone = pipe.output.lock().unwrap();
            zone.output.icy.allowed = true;
        }
        let mut cache = cache_create(CacheType::Infinite, 0);
        let result = handle_http(
            &pipe,
            cache.as_mut(),
            false,
            3,
            &request("GET /bridge-3.flac HTTP/1.1\r\nIcy-Metadata: 1\r\n\r\n"),
        );
        let response = String::from_utf8(result.response).unwrap();
        assert!(response.contains("icy-metaint: 16384\r\n"));
        assert_eq!(pipe.output.lock().unwrap().output.icy.interval, 16384);

        // no Icy-Metadata header: interval disabled
        let result = handle_http(
            &pipe,
            cache.as_mut(),
            false,
            3,
            &request("GET /bridge-3.flac HTTP/1.1\r\n\r\n"),
        );
        assert!(!String::from_utf8(result.response)
            .unwrap()
            .contains("icy-metaint"));
        assert_eq!(pipe.output.lock().unwrap().output.icy.interval, 0);
    }

    #[test]
    fn dlna_headers_mirrored_and_computed() {
        let pipe = pipeline();
        let mut cache = cache_create(CacheType::Infinite, 0);
        let result = handle_http(
            &pipe,
            cache.as_mut(),
            false,
            3,
            &request(
                "GET /bridge-3.flac HTTP/1.1\r\ntransferMode.dlna.org: Streaming\r\ngetcontentFeatures.dlna.org: 1\r\n\r\n",
            ),
        );
        let response = String::from_utf8(result.response).unwrap();
        assert!(response.contains("transferMode.dlna.org: Streaming\r\n"));
        assert!(response.contains("contentFeatures.dlna.org: DLNA.ORG_OP=01;"));
    }

    #[test]
    fn head_requests_send_no_body() {
        let pipe = pipeline();
        let mut cache = cache_create(CacheType::Infinite, 0);
        let result = handle_http(
            &pipe,
            cache.as_mut(),
            false,
            3,
            &request("HEAD /bridge-3.flac HTTP/1.1\r\n\r\n"),
        );
        assert!(!result.send_body);
        let response = String::from_utf8(result.response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    }
}
