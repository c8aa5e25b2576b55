//! Streamer: pulls the LMS-selected origin into the stream buffer.
//!
//! Socket mode replays the request headers LMS supplied over a fresh HTTP
//! connection, forwards the response headers (and any in-band ICY
//! metadata) back toward LMS, and lands body bytes in the stream buffer.
//! File mode reads a local path. One task per stream; starting a new
//! stream cancels the previous task through its token.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pipeline::{DisconnectCode, Pipeline, StreamPhase, MAX_HEADER};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SPACE_POLL: Duration = Duration::from_millis(100);

/// Failures before the body starts flowing; once it does, problems are
/// reported through the stream state instead.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unparseable request header block")]
    BadHeader,
}

/// Parsed LMS-provided request block.
#[derive(Debug)]
struct OriginRequest {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    host: Option<String>,
}

fn parse_request_block(header: &[u8]) -> Option<OriginRequest> {
    let text = String::from_utf8_lossy(header);
    let mut lines = text.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let mut headers = Vec::new();
    let mut host = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim().to_string();
            let value = value.trim().to_string();
            if name.eq_ignore_ascii_case("host") {
                host = Some(value.split(':').next().unwrap_or("").to_string());
            }
            headers.push((name, value));
        }
    }

    Some(OriginRequest {
        method,
        path,
        headers,
        host,
    })
}

fn set_disconnect(pipe: &Pipeline, phase: StreamPhase, code: DisconnectCode) {
    let mut zone = pipe.stream.lock().expect("stream lock");
    zone.state.phase = phase;
    zone.state.disconnect = code;
    drop(zone);
    pipe.wake_controller();
}

/// Terminates the current stream; returns true when one was active.
pub fn stream_disconnect(pipe: &Pipeline) -> bool {
    pipe.stream_token.lock().expect("token lock").cancel();
    let mut zone = pipe.stream.lock().expect("stream lock");
    let active = zone.state.phase > StreamPhase::Stopped;
    zone.state.phase = StreamPhase::Stopped;
    active
}

fn arm_new_stream(pipe: &Pipeline, header: &[u8], threshold: u64, cont_wait: bool, phase: StreamPhase) -> CancellationToken {
    let token = CancellationToken::new();
    {
        let mut current = pipe.stream_token.lock().expect("token lock");
        current.cancel();
        *current = token.clone();
    }
    let mut zone = pipe.stream.lock().expect("stream lock");
    zone.buf.flush();
    zone.state.phase = phase;
    zone.state.header = header[..header.len().min(MAX_HEADER - 1)].to_vec();
    zone.state.sent_headers = false;
    zone.state.meta_send = false;
    zone.state.cont_wait = cont_wait;
    zone.state.bytes = 0;
    zone.state.threshold = threshold;
    zone.state.meta_interval = 0;
    zone.state.meta_next = 0;
    token
}

/// Starts streaming a local file; `header` carries the path.
pub fn stream_file(pipe: &Arc<Pipeline>, path: &str, threshold: u64) {
    let token = arm_new_stream(pipe, path.as_bytes(), threshold, false, StreamPhase::StreamingFile);
    info!("opening local file: {path}");

    let pipe = Arc::clone(pipe);
    let path = path.to_string();
    tokio::spawn(async move {
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) => {
                warn!("can't open file: {path}: {err}");
                set_disconnect(&pipe, StreamPhase::Disconnect, DisconnectCode::Unreachable);
                return;
            }
        };
        pump_file(&pipe, file, &token).await;
    });
}

/// Starts streaming from the origin server LMS pointed at.
pub fn stream_sock(
    pipe: &Arc<Pipeline>,
    ip: Ipv4Addr,
    port: u16,
    use_ssl: bool,
    header: &[u8],
    threshold: u64,
    cont_wait: bool,
) {
    let token = arm_new_stream(pipe, header, threshold, cont_wait, StreamPhase::SendHeaders);

    let Some(request) = parse_request_block(header) else {
        warn!("{}", StreamError::BadHeader);
        set_disconnect(pipe, StreamPhase::Disconnect, DisconnectCode::Unreachable);
        return;
    };

    info!("connecting to {ip}:{port}{}", request.path);

    let pipe = Arc::clone(pipe);
    tokio::spawn(async move {
        let https_first = use_ssl || port == 443;
        match fetch(&pipe, &request, ip, port, https_first, &token).await {
            Ok(()) => {}
            Err(err) if !https_first => {
                // plain origin refused us before any headers: some servers
                // only talk TLS on odd ports, retry once over https
                debug!("plain fetch failed ({err}), attempting with SSL");
                if let Err(err) = fetch(&pipe, &request, ip, port, true, &token).await {
                    warn!("unable to connect to server: {err}");
                    set_disconnect(&pipe, StreamPhase::Disconnect, DisconnectCode::Unreachable);
                }
            }
            Err(err) => {
                warn!("unable to connect to server: {err}");
                set_disconnect(&pipe, StreamPhase::Disconnect, DisconnectCode::Unreachable);
            }
        }
    });
}

async fn fetch(
    pipe: &Arc<Pipeline>,
    request: &OriginRequest,
    ip: Ipv4Addr,
    port: u16,
    https: bool,
    token: &CancellationToken,
) -> Result<(), StreamError> {
    let scheme = if https { "https" } else { "http" };
    // TLS needs the real name for SNI, plain goes straight to the address
    let authority = if https {
        request
            .host
            .clone()
            .unwrap_or_else(|| ip.to_string())
    } else {
        ip.to_string()
    };
    let url = format!("{scheme}://{authority}:{port}{}", request.path);

    let client = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .redirect(reqwest::redirect::Policy::limited(5))
        .build()?;

    let mut builder = match request.method.as_str() {
        "HEAD" => client.head(&url),
        _ => client.get(&url),
    };
    for (name, value) in &request.headers {
        builder = builder.header(name, value);
    }

    let response = tokio::select! {
        response = builder.send() => response?,
        _ = token.cancelled() => return Ok(()),
    };

    // rebuild a header block for the RESP message toward LMS
    let mut raw = format!(
        "{:?} {} {}\r\n",
        response.version(),
        response.status().as_u16(),
        response.status().canonical_reason().unwrap_or("")
    );
    for (name, value) in response.headers() {
        raw.push_str(&format!("{}: {}\r\n", name, value.to_str().unwrap_or("")));
    }
    raw.push_str("\r\n");
    info!("headers: len: {}\n{raw}", raw.len());

    {
        let mut zone = pipe.stream.lock().expect("stream lock");
        if zone.state.phase == StreamPhase::Stopped {
            return Ok(());
        }
        zone.state.header = raw.into_bytes();
        zone.state.header.truncate(MAX_HEADER - 1);
        zone.state.sent_headers = false;
        zone.state.phase = if zone.state.cont_wait {
            StreamPhase::StreamingWait
        } else {
            StreamPhase::StreamingBuffering
        };
    }
    pipe.wake_controller();

    pump_body(pipe, response, token).await;
    Ok(())
}

enum IcyPhase {
    Body,
    Length,
    Meta { left: usize, collected: Vec<u8> },
}

async fn pump_body(pipe: &Arc<Pipeline>, response: reqwest::Response, token: &CancellationToken) {
    let mut body = response.bytes_stream();
    let mut pending: Vec<u8> = Vec::new();
    let mut offset = 0usize;
    let mut icy = IcyPhase::Body;
    let mut store = open_store(pipe, "in");

    loop {
        if token.is_cancelled() || !pipe.running() {
            return;
        }

        if offset >= pending.len() {
            let chunk = tokio::select! {
                chunk = body.next() => chunk,
                _ = token.cancelled() => return,
            };
            match chunk {
                Some(Ok(chunk)) => {
                    pending = chunk.to_vec();
                    offset = 0;
                    if let Some(store) = store.as_mut() {
                        use std::io::Write;
                        let _ = store.write_all(&pending);
                    }
                }
                Some(Err(err)) => {
                    warn!("error reading: {err}");
                    set_disconnect(pipe, StreamPhase::Disconnect, DisconnectCode::RemoteDisconnect);
                    return;
                }
                None => {
                    let bytes = pipe.stream.lock().expect("stream lock").state.bytes;
                    info!("end of stream (t:{bytes})");
                    set_disconnect(pipe, StreamPhase::Disconnect, DisconnectCode::Ok);
                    return;
                }
            }
        }

        while offset < pending.len() {
            let advanced = feed_chunk(pipe, &pending[offset..], &mut icy);
            if advanced == 0 {
                // no buffer space, wait for the decoder to drain
                tokio::select! {
                    _ = tokio::time::sleep(SPACE_POLL) => {}
                    _ = token.cancelled() => return,
                }
                if token.is_cancelled() || !pipe.running() {
                    return;
                }
                continue;
            }
            offset += advanced;
        }
    }
}

/// Feeds bytes into the stream buffer, peeling ICY metadata frames off the
/// body. Returns how many input bytes were consumed (0 = buffer full).
fn feed_chunk(pipe: &Pipeline, chunk: &[u8], icy: &mut IcyPhase) -> usize {
    let mut zone = pipe.stream.lock().expect("stream lock");
    if zone.state.phase == StreamPhase::Stopped {
        // disconnect raced us, swallow the rest
        return chunk.len();
    }
    if zone.state.phase == StreamPhase::StreamingWait {
        // body bytes wait for the cont message (it carries the ICY interval)
        return 0;
    }

    match icy {
        IcyPhase::Length => {
            let length = usize::from(chunk[0]) * 16;
            *icy = if length == 0 {
                zone.state.meta_next = zone.state.meta_interval;
                IcyPhase::Body
            } else {
                IcyPhase::Meta {
                    left: length,
                    collected: Vec::with_capacity(length),
                }
            };
            1
        }
        IcyPhase::Meta { left, collected } => {
            let take = chunk.len().min(*left);
            collected.extend_from_slice(&chunk[..take]);
            *left -= take;
            if *left == 0 {
                // strip padding and forward to LMS as META
                let end = collected
                    .iter()
                    .rposition(|b| *b != 0)
                    .map_or(0, |p| p + 1);
                if end > 0 {
                    info!("icy meta: len: {end}");
                    zone.state.header = collected[..end].to_vec();
                    zone.state.meta_send = true;
                    drop(zone);
                    pipe.wake_controller();
                    zone = pipe.stream.lock().expect("stream lock");
                }
                zone.state.meta_next = zone.state.meta_interval;
                *icy = IcyPhase::Body;
            }
            take
        }
        IcyPhase::Body => {
            if zone.state.meta_interval > 0 && zone.state.meta_next == 0 {
                *icy = IcyPhase::Length;
                drop(zone);
                return feed_chunk(pipe, chunk, icy);
            }

            let mut space = zone.buf.space();
            if zone.state.meta_interval > 0 {
                space = space.min(zone.state.meta_next as usize);
            }
            let take = chunk.len().min(space);
            if take == 0 {
                return 0;
            }
            zone.buf.write_from(&chunk[..take]);
            zone.state.bytes += take as u64;
            if zone.state.meta_interval > 0 {
                zone.state.meta_next -= take as u32;
            }

            let threshold_hit = zone.state.phase == StreamPhase::StreamingBuffering
                && zone.state.bytes > zone.state.threshold;
            if threshold_hit {
                zone.state.phase = StreamPhase::StreamingHttp;
            }
            drop(zone);
            pipe.wake_output();
            if threshold_hit {
                pipe.wake_controller();
            }
            take
        }
    }
}

async fn pump_file(pipe: &Arc<Pipeline>, mut file: tokio::fs::File, token: &CancellationToken) {
    let mut buffer = vec![0u8; 32 * 1024];
    loop {
        if token.is_cancelled() || !pipe.running() {
            return;
        }

        let space = {
            let zone = pipe.stream.lock().expect("stream lock");
            zone.buf.space()
        };
        if space == 0 {
            tokio::time::sleep(SPACE_POLL).await;
            continue;
        }

        let want = space.min(buffer.len());
        match file.read(&mut buffer[..want]).await {
            Ok(0) => {
                info!("end of stream");
                set_disconnect(pipe, StreamPhase::Disconnect, DisconnectCode::Ok);
                return;
            }
            Ok(n) => {
                let mut zone = pipe.stream.lock().expect("stream lock");
                if zone.state.phase == StreamPhase::Stopped {
                    return;
                }
                zone.buf.write_from(&buffer[..n]);
                zone.state.bytes += n as u64;
                let threshold_hit = zone.state.phase == StreamPhase::StreamingBuffering
                    && zone.state.bytes > zone.state.threshold;
                if threshold_hit {
                    zone.state.phase = StreamPhase::StreamingHttp;
                }
                drop(zone);
                pipe.wake_output();
                if threshold_hit {
                    pipe.wake_controller();
                }
            }
            Err(err) => {
                warn!("error reading: {err}");
                set_disconnect(pipe, StreamPhase::Disconnect, DisconnectCode::RemoteDisconnect);
                return;
            }
        }
    }
}

fn open_store(pipe: &Pipeline, direction: &str) -> Option<std::fs::File> {
    if pipe.config.store_prefix.is_empty() {
        return None;
    }
    let index = pipe.output.lock().expect("output lock").output.index;
    let name = format!(
        "{}/bridge-{index}-{direction}.dump",
        pipe.config.store_prefix
    );
    std::fs::File::create(&name).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lms_request_block() {
        let block = b"GET /stream.mp3?player=aa HTTP/1.0\r\nHost: radio.example.com:8000\r\nIcy-MetaData: 1\r\nAccept: */*\r\n\r\n";
        let request = parse_request_block(block).unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/stream.mp3?player=aa");
        assert_eq!(request.host.as_deref(), Some("radio.example.com"));
        assert!(request
            .headers
            .iter()
            .any(|(n, v)| n == "Icy-MetaData" && v == "1"));
    }

    #[test]
    fn request_block_without_headers() {
        let request = parse_request_block(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(request.path, "/");
        assert!(request.headers.is_empty());
        assert!(request.host.is_none());
    }
}
