//! Per-track HTTP workers.
//!
//! Each track gets its own listening socket and worker task; two slots per
//! player allow the next track to start while the previous one lingers for
//! renderers that probe or re-open finished resources (Sonos). The worker
//! drives the output engine, writes produced bytes through the replay
//! cache to the connection, and injects ICY metadata at fixed intervals.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use sqbaudio::config::{CacheMode, HTTP_CHUNKED};
use sqbaudio::output::{build_icy_block, output_end_stream, output_fill, output_new_stream};
use sqbaudio::pipeline::{DecodePhase, OutputPhase, Pipeline};
use sqbbuffer::RingBuffer;
use sqbcache::{cache_create, CacheBuffer, CacheType};
use sqbmime::format_to_dlna;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::request::{parse_request, request_complete, HttpRequest};

const MAX_BLOCK: usize = 32 * 1024;
pub const ICY_INTERVAL: usize = 16384;
const TIMEOUT: Duration = Duration::from_millis(50);
const DRAIN_MAX: u32 = 5000 / 50;
/// Port slots scanned above the configured base port.
const MAX_PLAYER: u16 = 32;

/// Starts the worker for the track currently described by the output zone;
/// returns the bound port. The lowest lingering slot is recycled when no
/// idle one is left.
pub async fn output_start(pipe: &Arc<Pipeline>, base_port: u16) -> Option<u16> {
    let index = pipe.output.lock().expect("output lock").output.index;

    // pick a slot: idle first, else the lowest-index lingering one
    let (slot_idx, to_join) = {
        let mut slots = pipe.slots.lock().expect("slots lock");
        let mut pick = slots.iter().position(|s| !s.running);
        if pick.is_none() {
            pick = slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.lingering)
                .min_by_key(|(_, s)| s.index)
                .map(|(i, _)| i);
        }
        let slot_idx = pick?;
        let slot = &mut slots[slot_idx];
        let to_join = if slot.lingering {
            if let Some(token) = slot.token.take() {
                token.cancel();
            }
            slot.handle.take()
        } else {
            None
        };
        (slot_idx, to_join)
    };

    if let Some(handle) = to_join {
        info!("joining lingering slot {slot_idx}");
        let _ = handle.await;
    }

    // find a free port in the window
    let mut bound = None;
    for offset in 0..2 * MAX_PLAYER {
        let port = base_port.wrapping_add(offset);
        if let Ok(listener) = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            bound = Some((listener, port));
            break;
        }
    }
    let (listener, port) = bound?;

    let token = CancellationToken::new();
    let worker = tokio::spawn(http_worker(
        Arc::clone(pipe),
        slot_idx,
        listener,
        index,
        token.clone(),
    ));

    {
        let mut slots = pipe.slots.lock().expect("slots lock");
        let slot = &mut slots[slot_idx];
        slot.running = true;
        slot.lingering = false;
        slot.index = index;
        slot.token = Some(token);
        slot.handle = Some(worker);
    }
    pipe.output.lock().expect("output lock").output.port = port;

    info!("start slot {slot_idx} index:{index} listening on {port}");
    Some(port)
}

/// Cancels and joins the worker serving `index`, if any.
pub async fn output_abort(pipe: &Arc<Pipeline>, index: u16) -> bool {
    let handle = {
        let mut slots = pipe.slots.lock().expect("slots lock");
        let Some(slot) = slots.iter_mut().find(|s| s.running && s.index == index) else {
            return false;
        };
        if let Some(token) = slot.token.take() {
            token.cancel();
        }
        slot.handle.take()
    };
    if let Some(handle) = handle {
        let _ = handle.await;
    }
    true
}

/// Stops both workers and resets the output side, the renderer-facing half
/// of a flush.
pub async fn output_flush(pipe: &Arc<Pipeline>) {
    {
        let mut zone = pipe.output.lock().expect("output lock");
        zone.render.ms_played = 0;
        // whatever the renderer was doing, the next playback needs Stopped
        if zone.output.state != OutputPhase::Off {
            zone.output.state = OutputPhase::Stopped;
        }
    }

    let handles: Vec<_> = {
        let mut slots = pipe.slots.lock().expect("slots lock");
        slots
            .iter_mut()
            .filter(|s| s.running)
            .filter_map(|s| {
                if let Some(token) = s.token.take() {
                    token.cancel();
                }
                s.handle.take()
            })
            .collect()
    };
    for handle in handles {
        let _ = handle.await;
    }

    let mut zone = pipe.output.lock().expect("output lock");
    sqbaudio::output::output_reset(&mut zone);
    debug!("flush output buffer");
}

struct Connection {
    socket: TcpStream,
    request_buf: Vec<u8>,
    ready: bool,
}

async fn http_worker(
    pipe: Arc<Pipeline>,
    slot_idx: usize,
    listener: TcpListener,
    index: u16,
    token: CancellationToken,
) {
    let mut obuf = RingBuffer::new(128 * 1024);
    let (duration, mimetype) = {
        let zone = pipe.output.lock().expect("output lock");
        (zone.output.duration, zone.output.mimetype.clone())
    };

    let cache_type = match pipe.config.cache {
        CacheMode::Memory => CacheType::Ring,
        CacheMode::Disk if duration > 0 => CacheType::File,
        _ => CacheType::Infinite,
    };
    let mut cache = cache_create(cache_type, 0);
    let mut store = open_store(&pipe, index, &mimetype);

    info!("slot {slot_idx} index:{index} started (cache:{cache_type:?})");

    let mut connection: Option<Connection> = None;
    let mut acquired = false;
    let mut finished = false;
    let mut use_cache = false;
    let mut drain_count = DRAIN_MAX;

    'outer: while !token.is_cancelled() && pipe.running() {
        // phase 1: get a connection
        let Some(conn) = connection.as_mut() else {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted.ok(),
                _ = tokio::time::sleep(TIMEOUT) => None,
                _ = token.cancelled() => break 'outer,
            };
            if let Some((socket, peer)) = accepted {
                info!("got HTTP connection from {peer}");
                connection = Some(Connection {
                    socket,
                    request_buf: Vec::new(),
                    ready: false,
                });
            }
            continue;
        };

        // phase 2: the codec must be known before the response headers
        if !acquired {
            let waiting = {
                let zone = pipe.decode.lock().expect("decode lock");
                zone.ctrl.new_stream && zone.ctrl.phase != DecodePhase::Error
            };
            if waiting {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(25)) => continue,
                    _ = token.cancelled() => break 'outer,
                }
            }
            acquired = true;
            let mut zone = pipe.output.lock().expect("output lock");
            output_new_stream(&mut zone, &pipe.config);
            info!("got codec, starting fill");
        }

        // phase 3: request headers
        if !conn.ready {
            let mut chunk = [0u8; 2048];
            let read = tokio::select! {
                read = readable_read(&mut conn.socket, &mut chunk) => read,
                _ = tokio::time::sleep(TIMEOUT) => continue,
                _ = token.cancelled() => break 'outer,
            };
            match read {
                Ok(0) | Err(_) => {
                    info!("HTTP close before request (sent {})", cache.total());
                    let failed = close_failed_stream(&pipe, cache.as_ref());
                    connection = None;
                    if failed {
                        break 'outer;
                    }
                    continue;
                }
                Ok(n) => conn.request_buf.extend_from_slice(&chunk[..n]),
            }
            if !request_complete(&conn.request_buf) {
                if conn.request_buf.len() > 4096 {
                    warn!("oversized request, closing");
                    connection = None;
                }
                continue;
            }
            let Some(request) = parse_request(&conn.request_buf) else {
                warn!("http parsing error");
                connection = None;
                continue;
            };
            info!("received {} {}", request.method, request.path);

            let lingering = pipe.slots.lock().expect("slots lock")[slot_idx].lingering;
            let reply = handle_http(&pipe, cache.as_mut(), lingering, index, &request);
            use_cache = reply.use_cache;
            if conn.socket.write_all(&reply.response).await.is_err() || !reply.send_body {
                connection = None;
                continue;
            }
            conn.ready = true;
            conn.request_buf.clear();
        }

        // phase 4: produce and send audio
        let decode_phase = pipe.decode.lock().expect("decode lock").ctrl.phase;
        let mut out_bytes: Vec<u8> = Vec::new();
        let mut linger_now = false;
        {
            let needs_wait =
                pipe.output.lock().expect("output lock").output.state != OutputPhase::Running;
            if needs_wait {
                tokio::select! {
                    _ = tokio::time::sleep(TIMEOUT) => continue,
                    _ = token.cancelled() => break 'outer,
                }
            }

            let mut zone = pipe.output.lock().expect("output lock");

            if zone.output.encode.flow {
                // drain counting is round-based, close enough to time
                if !output_fill(&mut zone, &mut obuf, &pipe.config)
                    && decode_phase == DecodePhase::Stopped
                {
                    drain_count = drain_count.saturating_sub(1);
                } else {
                    drain_count = DRAIN_MAX;
                }
            } else if drain_count > 0
                && !output_fill(&mut zone, &mut obuf, &pipe.config)
                && decode_phase > DecodePhase::Running
            {
                // full track pulled from outputbuf, drain what remains
                output_end_stream(&mut zone, Some(&mut obuf));
                zone.output.completed = true;
                drain_count = 0;
                pipe.wake_controller();
                info!("draining ({} bytes)", cache.total());
            }

            // assemble at most one block for this round
            let chunk_limit = if zone.output.icy.interval > 0 {
                zone.output.icy.remain
            } else {
                MAX_BLOCK
            };

            let mut payload: Vec<u8> = Vec::new();
            if use_cache {
                match cache.read_inner(chunk_limit) {
                    Some(bytes) => payload.extend_from_slice(bytes),
                    None => use_cache = false,
                }
            }
            if payload.is_empty() && !use_cache && obuf.used() > 0 {
                let take = obuf.used().min(chunk_limit);
                payload.resize(take, 0);
                obuf.read_into(&mut payload);
                cache.write(&payload);
            }

            if !payload.is_empty() {
                out_bytes = frame_payload(&mut zone, &payload);
            } else if finished {
                linger_now = true;
            } else if drain_count == 0 {
                if zone.output.chunked {
                    out_bytes = b"0\r\n\r\n".to_vec();
                }
                finished = true;
                info!("full data sent ({})", cache.total());
            }
        }

        if !out_bytes.is_empty() {
            if let Some(store) = store.as_mut() {
                use std::io::Write;
                let _ = store.write_all(&out_bytes);
            }
            let written = tokio::select! {
                written = conn.socket.write_all(&out_bytes) => written,
                _ = token.cancelled() => break 'outer,
            };
            if written.is_err() {
                info!("HTTP close {} (bytes {})", slot_idx, cache.total());
                let failed = close_failed_stream(&pipe, cache.as_ref());
                connection = None;
                if failed {
                    break 'outer;
                }
            }
        } else if linger_now {
            info!("socket closed, now lingering");
            pipe.slots.lock().expect("slots lock")[slot_idx].lingering = true;
            if let Some(conn) = connection.take() {
                let _ = conn.socket.into_std().map(|s| s.shutdown(std::net::Shutdown::Write));
            }
        } else {
            tokio::select! {
                _ = tokio::time::sleep(TIMEOUT) => {}
                _ = token.cancelled() => break 'outer,
            }
        }
    }

    info!(
        "finishing slot {slot_idx} index:{index} - sent {} bytes",
        cache.total()
    );

    {
        let mut slots = pipe.slots.lock().expect("slots lock");
        slots[slot_idx].running = false;
        slots[slot_idx].lingering = false;
    }

    let mut zone = pipe.output.lock().expect("output lock");
    if zone.output.encode.flow {
        output_end_stream(&mut zone, None);
        // slimproto must move on in case of stream failure
        zone.output.completed = true;
    }
    drop(zone);

    info!("exited slot {slot_idx} index:{index}");
}

async fn readable_read(
    socket: &mut TcpStream,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    use tokio::io::AsyncReadExt;
    socket.read(buf).await
}

/// When the renderer closes a connection that never received a byte while
/// the decoder already finished, the track failed: flag completion so the
/// SlimProto round can report and move on. Returns true when that case
/// was detected and the worker should exit.
fn close_failed_stream(pipe: &Pipeline, cache: &dyn CacheBuffer) -> bool {
    if cache.total() != 0 {
        return false;
    }
    let complete = pipe.decode.lock().expect("decode lock").ctrl.phase >= DecodePhase::Complete;
    if complete {
        pipe.output.lock().expect("output lock").output.completed = true;
        warn!("streaming failed, exiting");
        pipe.wake_controller();
        return true;
    }
    false
}

/// Wraps one payload block with ICY metadata and chunked framing as the
/// response negotiated. Must be called with the output zone locked; the
/// payload never exceeds `icy.remain` when ICY is active.
fn frame_payload(zone: &mut sqbaudio::pipeline::OutputZone, payload: &[u8]) -> Vec<u8> {
    let out = &mut zone.output;
    let mut result = Vec::with_capacity(payload.len() + 64);

    append_chunk(out.chunked, &mut result, payload);

    if out.icy.interval > 0 {
        out.icy.remain -= payload.len();
        if out.icy.remain == 0 {
            let block = build_icy_block(&mut out.icy);
            append_chunk(out.chunked, &mut result, &block);
            out.icy.remain = out.icy.interval;
        }
    }

    result
}

fn append_chunk(chunked: bool, result: &mut Vec<u8>, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    if chunked {
        result.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
        result.extend_from_slice(data);
        result.extend_from_slice(b"\r\n");
    } else {
        result.extend_from_slice(data);
    }
}

pub(crate) struct HandleResult {
    pub response: Vec<u8>,
    pub send_body: bool,
    pub use_cache: bool,
}

#[derive(PartialEq)]
enum RendererKind {
    Any,
    Sonos,
    Chromecast,
}

/// Builds the response for one request: status selection, Range handling
/// against the cache, ICY negotiation and the DLNA headers.
pub(crate) fn handle_http(
    pipe: &Pipeline,
    cache: &mut dyn CacheBuffer,
    lingering: bool,
    index: u16,
    request: &HttpRequest,
) -> HandleResult {
    let mut zone = pipe.output.lock().expect("output lock");
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut head: Option<&'static str> = None;
    let mut send_body = request.method != "HEAD";
    let mut use_cache = false;

    let kind = if request.user_agent_contains("sonos") {
        info!("Sonos mode");
        RendererKind::Sonos
    } else if request.has_header("cast-device-capabilities") {
        info!("Chromecast mode");
        RendererKind::Chromecast
    } else {
        RendererKind::Any
    };

    zone.output.chunked = request.http11 && zone.output.length == HTTP_CHUNKED;

    // ICY only on live-eligible streams and only when asked for
    if zone.output.icy.allowed
        && request
            .header("icy-metadata")
            .and_then(|v| v.trim().parse::<u32>().ok())
            .unwrap_or(0)
            != 0
    {
        headers.push(("icy-metaint".into(), ICY_INTERVAL.to_string()));
        zone.output.icy.interval = ICY_INTERVAL;
        zone.output.icy.remain = ICY_INTERVAL;
        zone.output.icy.updated = true;
    } else {
        zone.output.icy.interval = 0;
    }

    // DLNA headers are mirrored or computed
    if let Some(mode) = request.header("transfermode.dlna.org") {
        headers.push(("transferMode.dlna.org".into(), mode.to_string()));
    }
    if request.has_header("getcontentfeatures.dlna.org") {
        let live = zone.output.duration == 0 && !zone.output.encode.flow;
        headers.push((
            "contentFeatures.dlna.org".into(),
            format_to_dlna(zone.output.format, cache.infinite(), live),
        ));
    }
    if request.has_header("getavailableseekrange.dlna.org") {
        headers.push((
            "availableSeekRange.dlna.org".into(),
            format!(
                "0 bytes={}-{}",
                cache.total() - cache.level(),
                cache.total().saturating_sub(1)
            ),
        ));
    }

    if request.track_index() != Some(index) {
        warn!("wrong file requested, refusing {:?} {index}", request.track_index());
        head = Some("HTTP/1.0 410 Gone");
        headers.clear();
        send_body = false;
    } else {
        use_cache = true;
        cache.set_offset(0);
        let mut length: i64 = zone.output.length;

        /* Sonos closes and re-opens the connection on resume, asks for the
         * whole file, then aborts around the byte count it already has. A
         * huge content-length on the re-open makes it issue a proper range
         * request instead, which must be answered 206 *without* a
         * Content-Range or it fails just the same. */

        let range_start = request.range_start();
        if let (Some(offset), true) = (range_start, cache.total() > 0) {
            if offset > 0 {
                if !lingering && cache.total() == offset {
                    // continuation of what was already sent: plain 200
                    use_cache = false;
                } else if cache.scope(offset) == 0 {
                    head = Some(if zone.output.chunked {
                        "HTTP/1.1 206 Partial Content"
                    } else {
                        "HTTP/1.0 206 Partial Content"
                    });
                    if kind != RendererKind::Sonos {
                        headers.push((
                            "Content-Range".into(),
                            format!("bytes {offset}-{}/*", cache.total() - 1),
                        ));
                    }
                    cache.set_offset(offset);
                    info!("serving partial content {offset}->{}", cache.total() - 1);
                    length = 0;
                } else if lingering && offset >= cache.total() {
                    send_body = false;
                    head = Some("HTTP/1.0 416 Range Not Satisfiable");
                    headers.clear();
                    headers.push(("Content-Range".into(), format!("*/{}", cache.total())));
                    info!("range cannot be satisfied {offset}->{}", cache.total());
                } else {
                    // probed toward the end of a resource we don't have yet
                    head = Some(if zone.output.chunked {
                        "HTTP/1.1 206 Partial Content"
                    } else {
                        "HTTP/1.0 206 Partial Content"
                    });
                    let avail = cache.total().min((length as u64).saturating_sub(offset));
                    cache.set_offset(cache.total() - avail);
                    headers.push((
                        "Content-Range".into(),
                        format!("bytes {offset}-{}/{length}", offset + avail.saturating_sub(1)),
                    ));
                    info!(
                        "being probed at {offset} but have {}/{length}",
                        cache.total()
                    );
                    length = 0;
                }
            }
        } else if cache.total() > 0 {
            // Sonos also re-opens to add ICY, not a resume
            if kind == RendererKind::Sonos && zone.output.icy.interval == 0 {
                length = i64::from(u32::MAX);
            }
            info!(
                "serving with cache from {} (cached:{})",
                cache.total() - cache.level(),
                cache.total()
            );
        } else {
            use_cache = false;
        }

        headers.push(("Server".into(), "squeezebox-bridge".into()));
        headers.push(("Accept-Ranges".into(), "bytes".into()));
        headers.push(("Content-Type".into(), zone.output.mimetype.clone()));
        headers.push(("Connection".into(), "close".into()));

        if send_body {
            if length > 0 {
                zone.output.chunked = false;
                headers.push(("Content-Length".into(), length.to_string()));
            } else if zone.output.chunked {
                headers.push(("Transfer-Encoding".into(), "chunked".into()));
            }
        }
    }

    let head = head.unwrap_or(if zone.output.chunked {
        "HTTP/1.1 200 OK"
    } else {
        "HTTP/1.0 200 OK"
    });

    let mut response = String::with_capacity(256);
    response.push_str(head);
    response.push_str("\r\n");
    for (name, value) in &headers {
        response.push_str(name);
        response.push_str(": ");
        response.push_str(value);
        response.push_str("\r\n");
    }
    response.push_str("\r\n");
    info!("responding:\n{response}");

    HandleResult {
        response: response.into_bytes(),
        send_body,
        use_cache,
    }
}

fn open_store(pipe: &Pipeline, index: u16, mimetype: &str) -> Option<std::fs::File> {
    if pipe.config.store_prefix.is_empty() {
        return None;
    }
    let name = format!(
        "{}/bridge-{index}-out.{}",
        pipe.config.store_prefix,
        sqbmime::mimetype_to_ext(mimetype)
    );
    std::fs::File::create(name).ok()
}
