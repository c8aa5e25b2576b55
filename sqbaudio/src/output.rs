//! Output engine: pulls decoded frames from the output buffer, applies
//! replay-gain and fades, then packs or re-encodes them into the small HTTP
//! buffer a connection drains from.
//!
//! This is not a task of its own. The HTTP worker drives it once per round
//! while holding the output zone lock.

use sqbbuffer::RingBuffer;
use tracing::{debug, info, warn};

use crate::config::{PlayerConfig, HTTP_LARGE, HTTP_PCM_LENGTH};
use crate::flacenc::{FlacEncoder, FlacOptions};
use crate::mp3enc::{Mp3Encoder, MP3_SILENCE};
use crate::pcmfmt::{aiff_header, lpcm_pack, scale_and_pack, wave_header};
use crate::pipeline::{
    EncodeMode, FadeDir, FadeMode, FadePhase, IcyState, L24Carry, OutputState, OutputZone,
    RenderState, BYTES_PER_FRAME, ICY_LEN_MAX, OUTPUTBUF_IDLE_SIZE,
};
use crate::L24Format;

pub const FLAC_BLOCK_SIZE: u32 = 1024;
const FLAC_MAX_FRAMES: usize = 4096;
const FLAC_MIN_SPACE: usize = FLAC_MAX_FRAMES * BYTES_PER_FRAME;
const MP3_MIN_SPACE: usize = 16 * 1024;
/// At most a tenth of a second of frames per fill round.
const MAX_FRAMES_SEC: usize = 10;
const MAX_VAL32: i64 = 0x7fff_ffff_ffff;

/// Completes the encode parameters once the decoder knows the real stream
/// format, then prepares the per-track emission state (PCM headers, FLAC or
/// MP3 encoder). Called by the HTTP worker when the codec is acquired.
pub fn output_new_stream(zone: &mut OutputZone, config: &PlayerConfig) {
    let out = &mut zone.output;

    if out.encode.sample_rate == 0 {
        out.encode.sample_rate = out.sample_rate;
    }
    if out.encode.channels == 0 {
        out.encode.channels = out.channels;
    }
    if out.encode.sample_size == 0 {
        out.encode.sample_size =
            if config.l24_format == L24Format::Trunc16 && out.sample_size == 24 {
                16
            } else {
                out.sample_size
            };
    }

    match out.encode.mode {
        EncodeMode::Pcm => {
            let bytes_per_frame =
                u64::from(out.encode.channels) * u64::from(out.encode.sample_size) / 8;
            let byte_rate = u64::from(out.encode.sample_rate) * bytes_per_frame;

            // no real size when unknown, but advertised sizes must stay
            // consistent with the headers
            let mut length = if out.duration == 0 || out.encode.flow {
                let fake = if config.stream_length < 0 {
                    HTTP_LARGE as u64
                } else {
                    config.stream_length as u64
                };
                fake - fake % bytes_per_frame.max(1)
            } else {
                (u64::from(out.duration) * u64::from(out.encode.sample_rate) / 1000)
                    * bytes_per_frame
            };

            match out.format {
                'w' => {
                    let header = wave_header(
                        out.encode.channels,
                        out.encode.sample_size,
                        out.encode.sample_rate,
                        length,
                    );
                    length += header.len() as u64;
                    out.header_count = header.len();
                    out.header = Some(header);
                }
                'i' => {
                    let header = aiff_header(
                        out.encode.channels,
                        out.encode.sample_size,
                        out.encode.sample_rate,
                        length,
                    );
                    length += header.len() as u64;
                    out.header_count = header.len();
                    out.header = Some(header);
                }
                _ => {
                    out.header = None;
                    out.header_count = 0;
                    if out.encode.sample_size == 24
                        && config.l24_format == L24Format::PackedLpcm
                    {
                        out.encode.l24_carry = Some(L24Carry::default());
                    }
                    // raw mode matched on a wildcard, fill the real type in
                    if out.mimetype.starts_with('*') {
                        out.mimetype = format!(
                            "audio/L{};rate={};channels={}",
                            out.encode.sample_size, out.encode.sample_rate, out.encode.channels
                        );
                    }
                }
            }

            if config.stream_length > 0 || config.stream_length == HTTP_PCM_LENGTH {
                out.length = length as i64;
            }

            info!(
                "PCM encoding r:{} s:{} f:{}, estimated len {length}",
                out.encode.sample_rate, out.encode.sample_size, out.format
            );
        }
        EncodeMode::Flac => {
            let total_samples = if out.encode.flow || out.duration == 0 {
                None
            } else {
                Some(
                    (u64::from(out.encode.sample_rate) * u64::from(out.duration) + 10) / 1000,
                )
            };
            out.encode.flac = FlacEncoder::new(FlacOptions {
                compression_level: u32::from(out.encode.level),
                channels: out.encode.channels,
                sample_size: out.encode.sample_size,
                sample_rate: out.encode.sample_rate,
                block_size: FLAC_BLOCK_SIZE,
                total_samples,
            });
        }
        EncodeMode::Mp3 => {
            out.encode.mp3 =
                Mp3Encoder::new(out.encode.sample_rate, out.encode.channels, out.encode.level);
        }
        EncodeMode::Thru | EncodeMode::Null => {}
    }
}

/// Moves one batch of audio toward the HTTP buffer. Returns true while
/// there is (or may later be) more to do for the current track, false once
/// the track is fully pulled from the output buffer.
pub fn output_fill(zone: &mut OutputZone, obuf: &mut RingBuffer, _config: &PlayerConfig) -> bool {
    let OutputZone {
        buf: outputbuf,
        output: out,
        render,
    } = zone;

    if obuf.space() < BYTES_PER_FRAME {
        return true;
    }

    // pending container header goes out first
    if let Some(header) = &out.header {
        let start = header.len() - out.header_count;
        let written = obuf.write_from(&header[start..]);
        out.header_count -= written;
        if out.header_count == 0 {
            info!("PCM header sent ({} bytes)", header.len());
            out.header = None;
        }
        return true;
    }

    match out.encode.mode {
        EncodeMode::Thru => {
            // nothing to interpret, forward as-is
            let bytes = outputbuf.used().min(outputbuf.cont_read()).min(obuf.space());
            let readable = outputbuf.readable();
            let written = obuf.write_from(&readable[..bytes.min(readable.len())]);
            outputbuf.inc_readp(written);
            written != 0
        }
        EncodeMode::Null => {
            while (out.encode.count > 0 || out.duration == 0)
                && obuf.space() >= MP3_SILENCE.len()
            {
                obuf.write_from(&MP3_SILENCE);
                if out.encode.count > 0 {
                    out.encode.count -= 1;
                    if out.encode.count == 0 {
                        info!("finished sending mp3 silence frames");
                    }
                }
            }
            // the decoded audio itself is discarded
            let used = outputbuf.used();
            outputbuf.inc_readp(used);
            !(out.encode.count == 0 && out.duration > 0)
        }
        EncodeMode::Pcm => fill_pcm(outputbuf, out, render, obuf),
        EncodeMode::Flac => fill_flac(outputbuf, out, render, obuf),
        EncodeMode::Mp3 => fill_mp3(outputbuf, out, render, obuf),
    }
}

fn fill_pcm(
    outputbuf: &mut RingBuffer,
    out: &mut OutputState,
    render: &mut RenderState,
    obuf: &mut RingBuffer,
) -> bool {
    let bytes_per_frame =
        usize::from(out.encode.sample_size / 8) * usize::from(out.encode.channels);

    let in_bytes = outputbuf.used().min(outputbuf.cont_read());
    if in_bytes == 0 {
        return false;
    }
    if in_bytes < BYTES_PER_FRAME || obuf.space() < 2 * bytes_per_frame {
        return true;
    }

    let mut frames = (in_bytes / BYTES_PER_FRAME).min(obuf.space() / bytes_per_frame);
    frames = frames.min(out.encode.sample_rate as usize / MAX_FRAMES_SEC);

    let frames = gain_and_fade(frames, 0, out, outputbuf, render);
    if frames == 0 {
        // cross-fade needs more decoded input before it can proceed
        return true;
    }

    let region = outputbuf.slice(outputbuf.read_pos(), frames * BYTES_PER_FRAME);
    let mut packed = Vec::with_capacity(frames * bytes_per_frame + BYTES_PER_FRAME);

    if let Some(carry) = &mut out.encode.l24_carry {
        // the Sony LPCM layout interleaves sample pairs, keep a one-frame
        // carry so only even counts are ever packed
        let mut joined = std::mem::take(&mut carry.frame);
        joined.extend_from_slice(region);
        let pairs_bytes = (joined.len() / (2 * BYTES_PER_FRAME)) * 2 * BYTES_PER_FRAME;
        lpcm_pack(&mut packed, &joined[..pairs_bytes], out.encode.channels);
        carry.frame = joined[pairs_bytes..].to_vec();
    } else {
        scale_and_pack(
            &mut packed,
            region,
            frames,
            out.encode.channels,
            out.encode.sample_size,
            out.out_endian,
        );
    }

    obuf.write_from(&packed);
    outputbuf.inc_readp(frames * BYTES_PER_FRAME);
    true
}

fn fill_flac(
    outputbuf: &mut RingBuffer,
    out: &mut OutputState,
    render: &mut RenderState,
    obuf: &mut RingBuffer,
) -> bool {
    if out.encode.flac.is_none() {
        return false;
    }

    let in_bytes = outputbuf.used().min(outputbuf.cont_read());
    if in_bytes == 0 {
        return false;
    }
    if in_bytes < BYTES_PER_FRAME || obuf.space() < FLAC_MIN_SPACE {
        return true;
    }

    let mut frames = (in_bytes / BYTES_PER_FRAME).min(FLAC_MAX_FRAMES);
    frames = frames.min(out.encode.sample_rate as usize / MAX_FRAMES_SEC);

    let shift = 32 - out.encode.sample_size;
    let frames = gain_and_fade(frames, shift, out, outputbuf, render);
    if frames == 0 {
        return true;
    }

    let region = outputbuf.slice(outputbuf.read_pos(), frames * BYTES_PER_FRAME);
    let samples: Vec<i32> = if out.encode.channels == 1 {
        region
            .chunks_exact(4)
            .step_by(2)
            .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    } else {
        region
            .chunks_exact(4)
            .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    };

    let encoder = out.encode.flac.as_mut().expect("checked above");
    if !encoder.process_interleaved(&samples, frames as u32) {
        warn!("FLAC encode failed");
    }
    obuf.write_from(&encoder.take_pending());
    outputbuf.inc_readp(frames * BYTES_PER_FRAME);
    true
}

fn fill_mp3(
    outputbuf: &mut RingBuffer,
    out: &mut OutputState,
    render: &mut RenderState,
    obuf: &mut RingBuffer,
) -> bool {
    if out.encode.mp3.is_none() {
        return false;
    }

    let in_bytes = outputbuf.used().min(outputbuf.cont_read());
    if in_bytes == 0 {
        return false;
    }
    if in_bytes < BYTES_PER_FRAME || obuf.space() < MP3_MIN_SPACE {
        return true;
    }

    let to_block = out.encode.mp3.as_ref().expect("checked above").frames_to_block();
    let mut frames = (in_bytes / BYTES_PER_FRAME).min(to_block);
    frames = frames.min(out.encode.sample_rate as usize / MAX_FRAMES_SEC);

    let frames = gain_and_fade(frames, 0, out, outputbuf, render);
    if frames == 0 {
        return true;
    }

    let region = outputbuf.slice(outputbuf.read_pos(), frames * BYTES_PER_FRAME);
    let encoded = out
        .encode
        .mp3
        .as_mut()
        .expect("checked above")
        .push_frames(region);
    obuf.write_from(&encoded);
    outputbuf.inc_readp(frames * BYTES_PER_FRAME);
    true
}

/// Finalises the re-encoder for the current track. With `obuf` the trailing
/// encoder bytes are emitted; without it the encoder is just dropped.
/// `output_fill` must not run again for this track afterwards.
pub fn output_end_stream(zone: &mut OutputZone, mut obuf: Option<&mut RingBuffer>) {
    let out = &mut zone.output;

    if let Some(mut encoder) = out.encode.flac.take() {
        info!("finishing FLAC");
        if let Some(obuf) = obuf.as_deref_mut() {
            encoder.finish();
            obuf.write_from(&encoder.take_pending());
        }
    }

    if let Some(mut encoder) = out.encode.mp3.take() {
        info!("finishing MP3");
        if let Some(obuf) = obuf.as_deref_mut() {
            obuf.write_from(&encoder.finish());
        }
    }

    out.encode.l24_carry = None;
    out.encode.count = 0;
    out.fade_writep = None;
}

/// Resets the output side between tracks or at teardown. Slot shutdown is
/// the caller's business (it owns the task handles).
pub fn output_reset(zone: &mut OutputZone) {
    zone.render.ms_played = 0;
    if zone.output.state != crate::pipeline::OutputPhase::Off {
        zone.output.state = crate::pipeline::OutputPhase::Stopped;
    }
    zone.output.track_started = false;
    zone.output.track_start = None;
    zone.output.encode.flow = false;
    zone.output.header = None;
    zone.output.header_count = 0;
    free_icy(&mut zone.output);
    output_end_stream(zone, None);
    zone.render.index = -1;
    zone.buf.resize(OUTPUTBUF_IDLE_SIZE);
}

pub fn free_icy(out: &mut OutputState) {
    out.icy.artist = None;
    out.icy.title = None;
    out.icy.artwork = None;
}

/// Publishes new ICY text; `with_artwork` is false in text-only mode.
pub fn set_icy(out: &mut OutputState, metadata: &sqbmeta::TrackMetadata, with_artwork: bool) {
    out.icy.updated = true;
    out.icy.artist = metadata.artist.clone();
    out.icy.title = metadata.title.clone();
    out.icy.artwork = if with_artwork {
        metadata.artwork.clone()
    } else {
        None
    };
}

/// Builds the in-band metadata block due at an ICY boundary: one length
/// byte (in 16-byte units) then the padded payload. A plain zero byte when
/// nothing changed.
pub fn build_icy_block(icy: &mut IcyState) -> Vec<u8> {
    if !icy.updated {
        return vec![0];
    }
    icy.updated = false;

    let artist = icy.artist.as_deref().unwrap_or("");
    let title = icy.title.as_deref().unwrap_or("");
    let separator = if artist.is_empty() { "" } else { " - " };
    let mut payload = format!("StreamTitle='{artist}{separator}{title}';");
    if let Some(artwork) = icy.artwork.as_deref() {
        if !artwork.is_empty() {
            payload.push_str(&format!("StreamUrl='{artwork}';"));
        }
    }

    let mut payload = payload.into_bytes();
    payload.truncate(ICY_LEN_MAX - 1);
    let units = payload.len().div_ceil(16);
    payload.resize(units * 16, 0);

    let mut block = Vec::with_capacity(1 + payload.len());
    block.push(units as u8);
    block.extend_from_slice(&payload);
    block
}

/// Arms the fade engine at track start (`start == true`, called when the
/// decoder opens a stream) or track end (decode complete).
pub fn checkfade(start: bool, zone: &mut OutputZone) {
    let OutputZone {
        buf: outputbuf,
        output: out,
        ..
    } = zone;
    let size = outputbuf.size();

    info!(
        "fade mode: {:?} duration: {} {}",
        out.fade_mode,
        out.fade_secs,
        if start { "track-start" } else { "track-end" }
    );

    let rate = if out.encode.sample_rate != 0 {
        out.encode.sample_rate
    } else {
        out.sample_rate
    };
    let mut bytes = rate as usize * BYTES_PER_FRAME * out.fade_secs as usize;

    if out.fade_mode == FadeMode::FadeInOut {
        bytes = ((bytes / 2) / BYTES_PER_FRAME) * BYTES_PER_FRAME;
    }

    if start
        && (out.fade_mode == FadeMode::FadeIn
            || (out.fade_mode == FadeMode::FadeInOut && outputbuf.used() == 0))
    {
        // shorter than the full buffer, otherwise start and end align
        bytes = bytes.min(size - BYTES_PER_FRAME);
        info!("fade IN: {} frames", bytes / BYTES_PER_FRAME);
        out.fade = FadePhase::Due;
        out.fade_dir = FadeDir::Up;
        out.fade_start = outputbuf.write_pos();
        out.fade_end = (out.fade_start + bytes) % size;
    }

    if !start && (out.fade_mode == FadeMode::FadeOut || out.fade_mode == FadeMode::FadeInOut) {
        if out.fade == FadePhase::Inactive {
            bytes = bytes.min(outputbuf.used());
            info!(
                "fade {}: {} frames",
                if out.fade_mode == FadeMode::FadeInOut {
                    "IN-OUT"
                } else {
                    "OUT"
                },
                bytes / BYTES_PER_FRAME
            );
            out.fade = FadePhase::Due;
            out.fade_dir = FadeDir::Down;
            out.fade_end = outputbuf.write_pos();
            out.fade_start = (out.fade_end + size - bytes) % size;
        } else {
            // an in-fade still runs, queue the out-fade behind it
            out.fade_writep = Some(outputbuf.write_pos());
            info!("fade IN active -> delay OUT");
        }
    }

    if start && out.fade_mode == FadeMode::Crossfade {
        // residual audio only exists in flow mode
        if outputbuf.used() != 0 {
            bytes = bytes.min(outputbuf.used());
            // leave room for the decoder to append while crossing
            bytes = bytes.min(size.saturating_sub(out.codec_min_space + BYTES_PER_FRAME));
            bytes = bytes.min((9 * size) / 10);
            bytes = (bytes / BYTES_PER_FRAME) * BYTES_PER_FRAME;
            info!(
                "CROSSFADE: {} frames ({}ms)",
                bytes / BYTES_PER_FRAME,
                (bytes / BYTES_PER_FRAME) as u64 * 1000 / u64::from(rate.max(1))
            );
            out.fade = FadePhase::Due;
            out.fade_dir = FadeDir::Cross;
            out.fade_end = outputbuf.write_pos();
            out.fade_start = (out.fade_end + size - bytes) % size;
        }
    }
}

/// Recomputes the real duration from the decoded frame count when a track
/// finishes decoding, flow mode only: LMS's declared duration drifts when
/// crossfade consumed part of the stream.
pub fn checkduration(frames: u32, zone: &mut OutputZone) {
    let OutputZone { output: out, render, .. } = zone;

    if !out.encode.flow || out.direct_sample_rate == 0 {
        return;
    }

    let duration = (u64::from(frames) * 1000 / u64::from(out.direct_sample_rate)) as u32;
    let gap = if render.index >= 0 && out.index == render.index as u16 {
        let gap = i64::from(duration) - i64::from(render.duration);
        render.duration = duration;
        info!("adjust (playing) d:{} ({})", duration, gap);
        gap
    } else {
        let gap = i64::from(duration) - i64::from(out.duration);
        out.duration = duration;
        info!("adjust (next) d:{} ({})", duration, gap);
        gap
    };

    if gap.abs() > 1000 {
        warn!("gap too large d:{duration} g:{gap}");
    }
}

fn read_i32_wrapped(buf: &RingBuffer, pos: usize) -> i32 {
    i32::from_ne_bytes([
        buf.at(pos),
        buf.at(pos + 1),
        buf.at(pos + 2),
        buf.at(pos + 3),
    ])
}

/// Applies replay-gain and the fade envelope in place over the next
/// `frames` frames at the read cursor, possibly reducing the count so that
/// track and fade boundaries land on batch starts. Returns the frame count
/// actually processable; 0 means a cross-fade is starving and the caller
/// must retry once the decoder caught up.
pub fn gain_and_fade(
    frames: usize,
    shift: u8,
    out: &mut OutputState,
    outputbuf: &mut RingBuffer,
    render: &mut RenderState,
) -> usize {
    let size = outputbuf.size();
    // the processed region must stay contiguous at the read cursor
    let mut frames = frames.min(outputbuf.cont_read() / BYTES_PER_FRAME);
    let mut gain: u32 = 65536;
    let mut cross_ptr: Option<usize> = None;
    let readp = outputbuf.read_pos();

    // replay gain switches exactly at the track boundary
    if let Some(track_start) = out.track_start {
        if track_start == readp {
            info!(
                "track start rate:{} gain:{}",
                out.encode.sample_rate, out.next_replay_gain
            );
            if out.fade == FadePhase::Inactive || out.fade_mode != FadeMode::Crossfade {
                out.replay_gain = out.next_replay_gain;
            }
            out.track_start = None;
        } else {
            let ahead = (track_start + size - readp) % size;
            if ahead <= outputbuf.used() {
                frames = frames.min(ahead / BYTES_PER_FRAME);
            }
        }
    }

    if out.fade == FadePhase::Due {
        if out.fade_start == readp {
            info!("fade start reached");
            out.fade = FadePhase::Active;
        } else {
            let ahead = (out.fade_start + size - readp) % size;
            if ahead <= outputbuf.used() {
                frames = frames.min(ahead / BYTES_PER_FRAME);
            }
        }
    }

    if out.fade == FadePhase::Active {
        let mut cur_f = ((readp + size - out.fade_start) % size) / BYTES_PER_FRAME;
        let dur_f = ((out.fade_end + size - out.fade_start) % size) / BYTES_PER_FRAME;

        if dur_f == 0 || cur_f >= dur_f {
            if out.fade_mode == FadeMode::FadeInOut && out.fade_dir == FadeDir::Down {
                info!("fade down complete, start fade up");
                out.fade_dir = FadeDir::Up;
                out.fade_start = readp;
                out.fade_end = (readp + dur_f * BYTES_PER_FRAME) % size;
                cur_f = 0;
            } else if out.fade_mode == FadeMode::Crossfade {
                info!("crossfade complete");
                if outputbuf.used() >= dur_f * BYTES_PER_FRAME {
                    outputbuf.inc_readp(dur_f * BYTES_PER_FRAME);
                    // current track got shorter by the crossed window
                    let skipped =
                        (dur_f as u64 * 1000 / u64::from(out.encode.sample_rate.max(1))) as u32;
                    render.duration = render.duration.saturating_sub(skipped);
                    info!("skipped crossfaded start {skipped}ms");
                } else {
                    warn!("unable to skip crossfaded start");
                }
                out.fade = FadePhase::Inactive;
                out.replay_gain = out.next_replay_gain;
                return gain_and_fade(frames, shift, out, outputbuf, render);
            } else {
                info!("fade complete");
                out.fade = FadePhase::Inactive;
                if let Some(writep) = out.fade_writep {
                    let mut bytes =
                        (out.encode.sample_rate as usize * BYTES_PER_FRAME
                            * out.fade_secs as usize)
                            / 2;
                    bytes = ((bytes / BYTES_PER_FRAME) * BYTES_PER_FRAME).min(outputbuf.used());
                    info!("fade pending OUT: {} frames", bytes / BYTES_PER_FRAME);
                    out.fade_dir = FadeDir::Down;
                    out.fade_start = (writep + size - bytes) % size;
                    out.fade_end = writep;
                }
            }
        }

        if out.fade == FadePhase::Active {
            // don't overshoot the fade end
            let to_end = (out.fade_end + size - readp) % size;
            if to_end != 0 && to_end <= outputbuf.used() {
                frames = frames.min(to_end / BYTES_PER_FRAME);
            }

            match out.fade_dir {
                FadeDir::Up => {
                    gain = (((cur_f as u64) << 16) / dur_f.max(1) as u64) as u32;
                }
                FadeDir::Down => {
                    gain = ((((dur_f - cur_f) as u64) << 16) / dur_f.max(1) as u64) as u32;
                }
                FadeDir::Cross => {
                    if outputbuf.used() / BYTES_PER_FRAME > dur_f {
                        frames = frames.min(outputbuf.used() / BYTES_PER_FRAME - dur_f);
                        gain = (((cur_f as u64) << 16) / dur_f.max(1) as u64) as u32;
                        // back-pointer into the next track's head; wraps
                        // with the buffer
                        cross_ptr = Some((out.fade_end + cur_f * BYTES_PER_FRAME) % size);
                    } else {
                        // starving: retrying later beats a gap in the flow
                        debug!(
                            "need more frames for cross-fade {}",
                            dur_f - outputbuf.used() / BYTES_PER_FRAME
                        );
                        frames = 0;
                    }
                }
            }
        } else if out.fade_writep.take().is_some() {
            out.fade = FadePhase::Due;
        }
    }

    if frames > 0 {
        if let Some(cptr) = cross_ptr {
            apply_cross(
                outputbuf,
                cptr,
                gain,
                out.replay_gain,
                out.next_replay_gain,
                shift,
                frames,
            );
        } else {
            let readp = outputbuf.read_pos();
            let region = outputbuf.slice_mut(readp, frames * BYTES_PER_FRAME);
            apply_gain(region, gain, out.replay_gain, shift);
        }
    }

    frames
}

/// Applies `fade` (16.16) combined with replay gain over native i32
/// samples, shifting right to the target sample size. The accumulator is
/// clamped to ±(2^47−1) before the shift back.
fn apply_gain(region: &mut [u8], fade: u32, replay_gain: u32, shift: u8) {
    let gain = if replay_gain != 0 {
        ((u64::from(replay_gain) * u64::from(fade)) >> 16) as u32
    } else {
        fade
    };

    if gain == 65536 && shift == 0 {
        return;
    }

    for chunk in region.chunks_exact_mut(4) {
        let sample = i32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        let scaled = if gain == 65536 {
            sample >> shift
        } else {
            let acc = (i64::from(sample) * i64::from(gain)).clamp(-MAX_VAL32, MAX_VAL32);
            (acc >> (16 + shift)) as i32
        };
        chunk.copy_from_slice(&scaled.to_ne_bytes());
    }
}

/// Mixes the fading-out head of the next track (`cptr`, which follows the
/// buffer wrap) into the fading-in tail at the read cursor.
fn apply_cross(
    outputbuf: &mut RingBuffer,
    cptr: usize,
    fade: u32,
    gain_in: u32,
    gain_out: u32,
    shift: u8,
    frames: usize,
) {
    let size = outputbuf.size();
    let gain_in = if gain_in == 0 { 65536 } else { gain_in };
    let gain_out = if gain_out == 0 { 65536 } else { gain_out };
    let readp = outputbuf.read_pos();

    for i in 0..frames * 2 {
        let in_pos = (readp + i * 4) % size;
        let cross_pos = (cptr + i * 4) % size;
        let sample_in = read_i32_wrapped(outputbuf, in_pos);
        let sample_cross = read_i32_wrapped(outputbuf, cross_pos);

        let acc = ((i64::from(sample_in) * i64::from(gain_in)) >> 16) * (65536 - i64::from(fade))
            + ((i64::from(sample_cross) * i64::from(gain_out)) >> 16) * i64::from(fade);
        let acc = acc.clamp(-MAX_VAL32, MAX_VAL32);
        let mixed = (acc >> (16 + shift)) as i32;

        let bytes = mixed.to_ne_bytes();
        for (j, b) in bytes.iter().enumerate() {
            let pos = (in_pos + j) % size;
            outputbuf.slice_mut(pos, 1)[0] = *b;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{OutputPhase, OutputZone, RenderState};
    use sqbbuffer::RingBuffer;

    fn zone_with_buf(size: usize) -> OutputZone {
        OutputZone {
            buf: RingBuffer::new(size),
            output: OutputState::default(),
            render: RenderState::default(),
        }
    }

    fn push_frames(buf: &mut RingBuffer, value: i32, frames: usize) {
        for _ in 0..frames {
            buf.write_from(&value.to_ne_bytes());
            buf.write_from(&value.to_ne_bytes());
        }
    }

    fn drain_gained(zone: &mut OutputZone, batch: usize) -> Vec<u32> {
        // pulls everything through gain_and_fade, collecting the envelope
        let mut gains = Vec::new();
        let OutputZone { buf, output, render } = zone;
        loop {
            let frames = (buf.used() / BYTES_PER_FRAME).min(batch);
            if frames == 0 {
                break;
            }
            let done = gain_and_fade(frames, 0, output, buf, render);
            if done == 0 {
                break;
            }
            let region = buf.slice(buf.read_pos(), done * BYTES_PER_FRAME);
            for chunk in region.chunks_exact(BYTES_PER_FRAME) {
                let left = i32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                gains.push(left as u32);
            }
            buf.inc_readp(done * BYTES_PER_FRAME);
        }
        gains
    }

    #[test]
    fn fade_in_then_queued_fade_out() {
        let mut zone = zone_with_buf(64 * 1024);
        zone.output.fade_mode = FadeMode::FadeInOut;
        zone.output.fade_secs = 1;
        zone.output.encode.sample_rate = 256; // 128 frames per fade half
        zone.output.sample_rate = 256;

        // simulate decode of a full short track: arm in/out fades around it
        checkfade(true, &mut zone);
        push_frames(&mut zone.buf, 1 << 16, 1024);
        checkfade(false, &mut zone);
        assert!(zone.output.fade_writep.is_some(), "out-fade queued behind in-fade");

        // decode samples are 65536 so the output equals the fade gain
        let gains = drain_gained(&mut zone, 100);
        assert_eq!(gains.len(), 1024);
        assert_eq!(*gains.first().unwrap(), 0, "fade-in starts silent");
        assert_eq!(gains[500], 65536, "unity between the fades");
        assert!(*gains.last().unwrap() < 32768, "fade-out engaged at the tail");
        assert!(gains[994] >= gains[1020]);
    }

    #[test]
    fn in_out_envelope_is_zero_at_the_boundary() {
        // the true IN-OUT shape appears at a flow-mode track boundary: the
        // down-fade completes and flips straight into an up-fade
        let mut zone = zone_with_buf(64 * 1024);
        zone.output.fade_mode = FadeMode::FadeInOut;
        zone.output.fade_secs = 1;
        zone.output.encode.sample_rate = 256;
        zone.output.sample_rate = 256;
        push_frames(&mut zone.buf, 1 << 16, 256);
        zone.output.fade = FadePhase::Due;
        zone.output.fade_dir = FadeDir::Down;
        zone.output.fade_start = 0;
        zone.output.fade_end = 128 * BYTES_PER_FRAME;

        let gains = drain_gained(&mut zone, 16);
        assert_eq!(gains.len(), 256);
        assert_eq!(gains[0], 65536, "envelope starts at unity");
        assert_eq!(gains[128], 0, "envelope is zero at the boundary");
        assert_eq!(zone.output.fade_dir, FadeDir::Up);
        assert!(gains[255] > 40000, "envelope rises back toward unity");
    }

    #[test]
    fn crossfade_mixes_and_skips_next_track_head() {
        let mut zone = zone_with_buf(8 * 1024);
        zone.output.fade_mode = FadeMode::Crossfade;
        zone.output.fade_secs = 1;
        zone.output.encode.sample_rate = 64;
        zone.output.sample_rate = 64;
        zone.output.encode.flow = true;
        zone.render.duration = 10_000;
        zone.output.codec_min_space = 256;

        // tail of the previous track
        push_frames(&mut zone.buf, 1000 << 16, 64);
        // new track starts: crossfade arms over the residual audio
        checkfade(true, &mut zone);
        assert_eq!(zone.output.fade, FadePhase::Due);
        // decoder appends the next track (twice the window so it can cross)
        push_frames(&mut zone.buf, 2000 << 16, 128);

        let before = zone.render.duration;
        let gains = drain_gained(&mut zone, 16);
        // the crossed window was consumed once, not twice
        assert_eq!(gains.len(), 64 + (128 - 64));
        assert!(zone.render.duration < before, "duration shortened by cross");
        // first crossed sample is dominated by the old track, last by the new
        assert!(gains[0] >= 1000 << 16 && gains[0] < 1500 << 16);
    }

    #[test]
    fn cross_pointer_wraps() {
        // regression for the back-pointer wrap: arm a cross window that
        // straddles the ring boundary and check no sample explodes
        let mut zone = zone_with_buf(1024);
        zone.output.fade_mode = FadeMode::Crossfade;
        zone.output.fade_secs = 1;
        zone.output.encode.sample_rate = 8;
        zone.output.sample_rate = 8;
        zone.output.codec_min_space = 64;

        // wind the cursors close to the end of the ring
        let mut sink = [0u8; 8];
        for _ in 0..120 {
            zone.buf.write_from(&[0u8; 8]);
            zone.buf.read_into(&mut sink);
        }

        push_frames(&mut zone.buf, 1 << 20, 8);
        checkfade(true, &mut zone);
        push_frames(&mut zone.buf, 1 << 20, 16);

        let gains = drain_gained(&mut zone, 4);
        assert!(!gains.is_empty());
        for g in gains {
            assert!((g as i32).unsigned_abs() <= 1 << 21);
        }
    }

    #[test]
    fn gain_clamps_in_accumulator() {
        let mut region: Vec<u8> = i32::MAX.to_ne_bytes().to_vec();
        apply_gain(&mut region, 65536, 4 << 16, 0);
        let out = i32::from_ne_bytes([region[0], region[1], region[2], region[3]]);
        assert_eq!(out, (MAX_VAL32 >> 16) as i32);
    }

    #[test]
    fn null_mode_emits_silence_frames() {
        let mut zone = zone_with_buf(4096);
        zone.output.encode.mode = EncodeMode::Null;
        zone.output.duration = 1000;
        zone.output.encode.count = 3;
        let mut obuf = RingBuffer::new(4096);

        let config = PlayerConfig::default();
        let more = output_fill(&mut zone, &mut obuf, &config);
        assert!(!more, "all silence blocks sent");
        assert_eq!(obuf.used(), 3 * MP3_SILENCE.len());
        let mut first = vec![0u8; MP3_SILENCE.len()];
        obuf.read_into(&mut first);
        assert_eq!(&first[..], &MP3_SILENCE[..]);
    }

    #[test]
    fn wav_header_emitted_before_audio() {
        let mut zone = zone_with_buf(4096);
        zone.output.state = OutputPhase::Running;
        zone.output.encode.mode = EncodeMode::Pcm;
        zone.output.format = 'w';
        zone.output.sample_rate = 44100;
        zone.output.sample_size = 16;
        zone.output.channels = 2;
        zone.output.duration = 1000;
        zone.output.out_endian = true;

        let config = PlayerConfig::default();
        output_new_stream(&mut zone, &config);
        assert_eq!(zone.output.header_count, 44);

        let mut obuf = RingBuffer::new(4096);
        assert!(output_fill(&mut zone, &mut obuf, &config));
        assert_eq!(obuf.used(), 44);
        let mut header = vec![0u8; 44];
        obuf.read_into(&mut header);
        assert_eq!(&header[0..4], b"RIFF");
        assert!(zone.output.header.is_none());
    }

    #[test]
    fn icy_block_layout() {
        let mut icy = IcyState {
            updated: true,
            artist: Some("Artist".into()),
            title: Some("Title".into()),
            artwork: Some("http://server/cover.jpg".into()),
            ..IcyState::default()
        };
        let block = build_icy_block(&mut icy);
        let units = block[0] as usize;
        assert_eq!(block.len(), units * 16 + 1);
        let text = String::from_utf8_lossy(&block[1..]);
        assert!(text.starts_with("StreamTitle='Artist - Title';StreamUrl='http://server/cover.jpg';"));
        assert!(block[block.len() - 1] == 0 || (block.len() - 1) % 16 == 0);
        assert!(!icy.updated);

        // no update -> a single zero byte
        let empty = build_icy_block(&mut icy);
        assert_eq!(empty, vec![0]);
    }
}
