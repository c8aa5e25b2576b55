//! Decoder stack: codec trait, registry and the decode loop.
//!
//! The loop runs on a dedicated blocking thread. Each iteration samples the
//! stream and output zones, then calls the current codec for exactly one
//! batch while holding the decode lock, the way the rest of the pipeline
//! expects codec transitions to be atomic.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::codecs;
use crate::output::{checkduration, checkfade};
use crate::pipeline::{DecodeCtrl, DecodePhase, FadeMode, Pipeline, BYTES_PER_FRAME};

/// One codec adapter. `decode` processes a single batch: it pulls from the
/// stream buffer and pushes 32-bit stereo frames (or pass-through bytes)
/// into the output buffer, locking stream then output.
pub trait Codec: Send {
    /// Raw bytes wanted in streambuf before decode is worth calling.
    fn min_read(&self) -> usize {
        4096
    }
    /// Free outputbuf bytes required before decode is called.
    fn min_space(&self) -> usize {
        16 * 1024
    }
    /// Pass-through codecs never interpret samples.
    fn is_thru(&self) -> bool {
        false
    }
    fn decode(&mut self, pipe: &Pipeline, ctrl: &mut DecodeCtrl) -> DecodePhase;
}

/// Static description of a registered codec for capability negotiation.
pub struct CodecInfo {
    pub id: char,
    /// LMS format names this codec serves, comma separated.
    pub types: &'static str,
    pub thru: bool,
}

/// Registry order matters: first match on id wins.
pub const CODECS: &[CodecInfo] = &[
    CodecInfo { id: 'l', types: "alc", thru: false },
    CodecInfo { id: 'm', types: "mp3", thru: false },
    CodecInfo { id: 'a', types: "aac", thru: false },
    CodecInfo { id: 'o', types: "ogg", thru: false },
    CodecInfo { id: 'u', types: "ops", thru: false },
    CodecInfo { id: 'p', types: "pcm,wav,aif", thru: false },
    CodecInfo { id: 'f', types: "flc", thru: false },
    CodecInfo { id: '4', types: "aac", thru: true },
    CodecInfo { id: 'c', types: "flc", thru: true },
    CodecInfo { id: '*', types: "*", thru: true },
];

/// Builds the codec list advertised in HELO: in full processing modes only
/// formats a real decoder exists for, in thru mode whatever is configured.
pub fn advertised_codecs(configured: &str, thru_mode: bool) -> String {
    if thru_mode {
        return configured.to_string();
    }
    let mut out = Vec::new();
    for item in configured.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if CODECS
            .iter()
            .any(|c| !c.thru && c.types.split(',').any(|t| t.eq_ignore_ascii_case(item)))
        {
            out.push(item);
        }
    }
    out.join(",")
}

fn instantiate(
    pipe: &Arc<Pipeline>,
    id: char,
    sample_size: u8,
    sample_rate: u32,
    channels: u8,
    big_endian: bool,
) -> Option<Box<dyn Codec>> {
    match id {
        'p' => Some(Box::new(codecs::pcm::PcmCodec::new(
            sample_size,
            sample_rate,
            channels,
            big_endian,
        ))),
        'f' => Some(Box::new(codecs::flac::FlacCodec::new(pipe))),
        'c' => Some(Box::new(codecs::flac_thru::FlacThruCodec::new())),
        'm' => Some(Box::new(codecs::mp3::Mp3Codec::new(pipe))),
        'o' => Some(Box::new(codecs::vorbis::VorbisCodec::new(pipe))),
        'u' => Some(Box::new(codecs::opus::OpusCodec::new(pipe))),
        'a' | 'l' => Some(Box::new(codecs::mp4::Mp4Codec::new(pipe, id))),
        '4' => Some(Box::new(codecs::m4a_thru::M4aThruCodec::new())),
        '*' => Some(Box::new(codecs::thru::ThruCodec::new())),
        _ => None,
    }
}

/// Opens (or re-opens) the codec for a new stream. Returns false when the
/// format has no adapter, which surfaces as STMn.
pub fn codec_open(
    pipe: &Arc<Pipeline>,
    id: char,
    sample_size: u8,
    sample_rate: u32,
    channels: u8,
    big_endian: bool,
) -> bool {
    debug!("codec open: '{id}'");

    let Some(codec) = instantiate(pipe, id, sample_size, sample_rate, channels, big_endian) else {
        warn!("codec not found: '{id}'");
        return false;
    };

    let min_space = codec.min_space();
    {
        let mut zone = pipe.decode.lock().expect("decode lock");
        zone.ctrl.new_stream = true;
        zone.ctrl.phase = DecodePhase::Ready;
        zone.ctrl.frames = 0;
        zone.codec = Some(codec);
    }
    pipe.output.lock().expect("output lock").output.codec_min_space = min_space;
    true
}

/// Stops any in-flight decoding, keeping the codec for a resume.
pub fn decode_flush(pipe: &Pipeline) {
    debug!("decode flush");
    let mut zone = pipe.decode.lock().expect("decode lock");
    zone.ctrl.phase = DecodePhase::Stopped;
}

/// Drops the codec at teardown.
pub fn decode_close(pipe: &Pipeline) {
    let mut zone = pipe.decode.lock().expect("decode lock");
    zone.codec = None;
    zone.ctrl.phase = DecodePhase::Stopped;
}

/// Negotiates the effective output sample rate against the player
/// capability list: positive entries are discrete supported rates in
/// descending order, a single negative entry caps at its absolute value.
///
/// Prefers the raw rate untouched when the player supports it directly or
/// a clean multiple of it, then the highest capability in an integer
/// ratio with the source, then the highest capability.
pub fn negotiate_rate(raw: u32, supported: &[i32]) -> u32 {
    let rates: Vec<i32> = supported.iter().copied().filter(|r| *r != 0).collect();
    if raw == 0 || rates.is_empty() {
        return raw;
    }

    if rates[0] < 0 {
        let cap = rates[0].unsigned_abs();
        return raw.min(cap);
    }

    // direct support, or the source divides a supported rate cleanly
    if rates.iter().any(|&r| r as u32 == raw) {
        return raw;
    }
    if rates.iter().any(|&r| r as u32 % raw == 0) {
        return raw;
    }

    // highest capability in an integer ratio (up or down)
    if let Some(&rate) = rates
        .iter()
        .find(|&&r| raw % r as u32 == 0 || r as u32 % raw == 0)
    {
        return rate as u32;
    }

    // else the highest capability
    rates[0] as u32
}

/// Shared new-stream bookkeeping for all decoders producing PCM: rate
/// negotiation, the track start marker and fade arming. Returns the
/// effective output rate. Caller holds neither zone lock.
pub fn decoder_new_stream(pipe: &Pipeline, raw_rate: u32) -> u32 {
    let mut zone = pipe.output.lock().expect("output lock");
    zone.output.direct_sample_rate = raw_rate;
    let rate = negotiate_rate(raw_rate, &zone.output.supported_rates);
    zone.output.sample_rate = rate;
    zone.output.track_start = Some(zone.buf.write_pos());
    if zone.output.fade_mode != FadeMode::None {
        checkfade(true, &mut zone);
    }
    info!("decoding with sample rate {rate} (source {raw_rate})");
    rate
}

/// Spawns the decode loop on a blocking thread; it exits when the pipeline
/// stops.
pub fn spawn_decode_loop(pipe: Arc<Pipeline>) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || decode_loop(&pipe))
}

fn decode_loop(pipe: &Pipeline) {
    while pipe.running() {
        let (bytes, ended) = {
            let zone = pipe.stream.lock().expect("stream lock");
            (zone.buf.used(), zone.state.phase.ended())
        };
        let space = pipe.output.lock().expect("output lock").buf.space();

        let mut ran = false;
        let mut finished: Option<u32> = None;
        {
            let mut zone = pipe.decode.lock().expect("decode lock");
            let crate::pipeline::DecodeZone { ctrl, codec } = &mut *zone;

            if ctrl.phase == DecodePhase::Running {
                if let Some(codec) = codec.as_mut() {
                    if space > codec.min_space() && (bytes > codec.min_read() || ended) {
                        ctrl.phase = codec.decode(pipe, ctrl);
                        ran = true;

                        if ctrl.phase != DecodePhase::Running {
                            info!(
                                "decode {}",
                                if ctrl.phase == DecodePhase::Complete {
                                    "complete"
                                } else {
                                    "error"
                                }
                            );
                            finished = Some(ctrl.frames);
                        }
                    }
                }
            }
        }

        if let Some(frames) = finished {
            let mut out = pipe.output.lock().expect("output lock");
            if out.output.fade_mode != FadeMode::None {
                checkfade(false, &mut out);
            }
            checkduration(frames, &mut out);
            drop(out);
            pipe.wake_controller();
        }

        if !ran {
            std::thread::sleep(Duration::from_millis(100));
        }
    }
}

/// Blocking reader over the stream buffer used by library decoders.
///
/// Returns EOF once the stream disconnected and the buffer drained; while
/// live it waits (briefly) for the streamer to produce more. Holds a weak
/// handle so a parked codec does not keep a deleted player alive.
pub struct StreamReader {
    pipe: std::sync::Weak<Pipeline>,
}

impl StreamReader {
    pub fn new(pipe: &Arc<Pipeline>) -> Self {
        Self {
            pipe: Arc::downgrade(pipe),
        }
    }
}

impl std::io::Read for StreamReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let Some(pipe) = self.pipe.upgrade() else {
                return Ok(0);
            };
            {
                let mut zone = pipe.stream.lock().expect("stream lock");
                let n = zone.buf.read_into(buf);
                if n > 0 {
                    return Ok(n);
                }
                if zone.state.phase.ended() {
                    return Ok(0);
                }
            }
            if !pipe.running() {
                return Ok(0);
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

/// Ogg-based readers ask for `Seek` although packet reading on a live
/// stream never seeks; this adapter satisfies the bound and refuses.
pub struct NoSeek<R>(pub R);

impl<R: std::io::Read> std::io::Read for NoSeek<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf)
    }
}

impl<R> std::io::Seek for NoSeek<R> {
    fn seek(&mut self, _pos: std::io::SeekFrom) -> std::io::Result<u64> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "live stream cannot seek",
        ))
    }
}

/// Pushes interleaved 32-bit stereo frames into the output buffer, waiting
/// for space while the HTTP side drains. Returns false when the pipeline
/// stopped underneath.
pub fn write_frames(pipe: &Pipeline, frames: &[i32], ctrl: &mut DecodeCtrl) -> bool {
    debug_assert!(frames.len() % 2 == 0);
    let mut written = 0;

    while written < frames.len() {
        {
            let mut zone = pipe.output.lock().expect("output lock");
            if ctrl.new_stream {
                // callers set the start marker through decoder_new_stream;
                // pass-through writers latch here instead
                zone.output.track_start = Some(zone.buf.write_pos());
                ctrl.new_stream = false;
            }
            let space = (zone.buf.space() / BYTES_PER_FRAME) * BYTES_PER_FRAME;
            let take = ((frames.len() - written) * 4).min(space) / 4;
            if take > 0 {
                let mut bytes = Vec::with_capacity(take * 4);
                for sample in &frames[written..written + take] {
                    bytes.extend_from_slice(&sample.to_ne_bytes());
                }
                zone.buf.write_from(&bytes);
                written += take;
                ctrl.frames += (take / 2) as u32;
            }
        }
        if written < frames.len() {
            if !pipe.running() {
                return false;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_negotiation_direct_and_factor() {
        // descending discrete list
        let caps = [192_000, 96_000, 48_000];
        assert_eq!(negotiate_rate(48_000, &caps), 48_000);
        // 44100 divides none of them, no integer ratio: highest wins
        assert_eq!(negotiate_rate(44_100, &caps), 192_000);
        // 24000 divides 48000/96000/192000: passthrough preferred
        assert_eq!(negotiate_rate(24_000, &caps), 24_000);
    }

    #[test]
    fn rate_negotiation_cap() {
        assert_eq!(negotiate_rate(192_000, &[-96_000]), 96_000);
        assert_eq!(negotiate_rate(44_100, &[-96_000]), 44_100);
    }

    #[test]
    fn rate_negotiation_integer_ratio() {
        // 88200 is twice 44100: the highest capability in integer ratio
        let caps = [48_000, 44_100];
        assert_eq!(negotiate_rate(88_200, &caps), 44_100);
    }

    #[test]
    fn rate_negotiation_empty_keeps_raw() {
        assert_eq!(negotiate_rate(44_100, &[0, 0]), 44_100);
        assert_eq!(negotiate_rate(0, &[48_000]), 0);
    }

    #[test]
    fn advertised_codecs_filters_thru_only_formats() {
        let list = advertised_codecs("aac,ogg,flc,mp3,wma", false);
        assert_eq!(list, "aac,ogg,flc,mp3");
        let thru = advertised_codecs("aac,ogg,flc,mp3,wma", true);
        assert_eq!(thru, "aac,ogg,flc,mp3,wma");
    }
}
