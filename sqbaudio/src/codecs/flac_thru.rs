//! FLAC pass-through with STREAMINFO synthesis.
//!
//! LMS sometimes serves a bare FLAC frame stream (radio transcodes). Most
//! renderers refuse those, so when the stream does not start with `fLaC`
//! the first frame header is parsed and a metadata block is fabricated in
//! front of the body.

use tracing::{error, info, warn};

use crate::config::FlacHeaderMode;
use crate::decode::Codec;
use crate::pipeline::{DecodeCtrl, DecodePhase, Pipeline};

const FLAC_CODED_RATES: [u32; 16] = [
    0, 88200, 176400, 192000, 8000, 16000, 22050, 24000, 32000, 44100, 48000, 96000, 0, 0, 0, 0,
];
const FLAC_CODED_CHANNELS: [u8; 16] = [1, 2, 3, 4, 5, 6, 7, 8, 2, 2, 2, 0, 0, 0, 0, 0];
const FLAC_CODED_SAMPLE_SIZE: [u8; 8] = [0, 8, 12, 0, 16, 20, 24, 0];
const FLAC_MAX_SAMPLES: u64 = 0xf_ffff_ffff;

pub struct FlacThruCodec {
    header_done: bool,
}

impl FlacThruCodec {
    pub fn new() -> Self {
        Self { header_done: false }
    }
}

impl Default for FlacThruCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn coded_block_size(code: u8) -> u16 {
    match code {
        0x01 => 192,
        0x02..=0x05 => 576 * (1 << (code - 2)),
        // 0x06/0x07 take the size from the frame end, variable for us
        0x08..=0x0f => 256 * (1 << (code - 8)),
        _ => 0,
    }
}

/// UTF-8-style coded frame/sample number at the start of a frame body.
fn read_utf8_u64(buf: &[u8]) -> Option<u64> {
    let first = *buf.first()?;
    let (mut value, extra) = match first.leading_ones() {
        0 => (u64::from(first), 0usize),
        2 => (u64::from(first & 0x1f), 1),
        3 => (u64::from(first & 0x0f), 2),
        4 => (u64::from(first & 0x07), 3),
        5 => (u64::from(first & 0x03), 4),
        6 => (u64::from(first & 0x01), 5),
        _ => return None,
    };
    for i in 0..extra {
        let byte = *buf.get(1 + i)?;
        if byte & 0xc0 != 0x80 {
            return None;
        }
        value = (value << 6) | u64::from(byte & 0x3f);
    }
    Some(value)
}

/// Builds `fLaC` + a 34-byte STREAMINFO from the first frame header.
/// Returns None when the bytes are not a FLAC frame.
pub fn synthesize_streaminfo(
    mode: FlacHeaderMode,
    frame: &[u8],
    duration_ms: u32,
) -> Option<(Vec<u8>, u32)> {
    if frame.len() < 16 {
        return None;
    }
    // sync code 11111111 111110, then reserved must be 0
    if frame[0] != 0xff || frame[1] & 0xfc != 0xf8 {
        error!("flac no header and not a frame");
        return None;
    }
    if frame[1] & 0x02 != 0 {
        error!("flac reserved bit set, cannot add header");
        return None;
    }
    let variable_blocks = frame[1] & 0x01 != 0;

    let rate = FLAC_CODED_RATES[usize::from(frame[2] & 0x0f)];
    let block_code = frame[2] >> 4;
    let channels = FLAC_CODED_CHANNELS[usize::from(frame[3] >> 4)];
    let sample_size = FLAC_CODED_SAMPLE_SIZE[usize::from((frame[3] >> 1) & 0x07)];

    let mut block_size = 0u16;
    if !variable_blocks {
        block_size = coded_block_size(block_code);
        if block_size == 0 {
            warn!("flac unhandled blocksize {block_code:#x}, using variable");
        }
    }

    let mut sample_count = 0u64;
    if mode == FlacHeaderMode::Adjust {
        sample_count = read_utf8_u64(&frame[4..]).unwrap_or(u64::from(u32::MAX));
    }
    if sample_count == u64::from(u32::MAX) || mode == FlacHeaderMode::Max {
        sample_count = FLAC_MAX_SAMPLES;
    } else if sample_count != 0 {
        // frame number times block size, plus the remaining duration
        sample_count =
            sample_count * u64::from(block_size) + u64::from(rate) * u64::from(duration_ms) / 1000;
    }

    if rate == 0 || sample_size == 0 || channels == 0 {
        error!("flac wrong header {rate} {channels} {sample_size}");
    }

    let mut out = Vec::with_capacity(4 + 4 + 34);
    out.extend_from_slice(b"fLaC");
    // last-metadata-block flag + type 0 (STREAMINFO), length 34
    out.extend_from_slice(&[0x80, 0, 0, 34]);

    // min/max block size, min/max frame size (unknown)
    if block_size != 0 {
        out.extend_from_slice(&block_size.to_be_bytes());
        out.extend_from_slice(&block_size.to_be_bytes());
    } else {
        out.extend_from_slice(&[0x00, 0x10, 0xff, 0xff]);
    }
    out.extend_from_slice(&[0, 0, 0, 0, 0, 0]);

    // 20 bits rate | 3 bits channels-1 | 5 bits size-1 | 36 bits count
    let combo: u64 = (u64::from(rate) << 44)
        | ((u64::from(channels) - 1) & 0x07) << 41
        | ((u64::from(sample_size) - 1) & 0x1f) << 36
        | (sample_count & 0xf_ffff_ffff);
    out.extend_from_slice(&combo.to_be_bytes());

    // MD5 unknown
    out.extend_from_slice(&[0u8; 16]);

    info!(
        "flac header ch:{channels} s:{sample_size} r:{rate} b:{block_size} cnt:{sample_count}"
    );
    Some((out, rate))
}

impl Codec for FlacThruCodec {
    fn min_read(&self) -> usize {
        4096
    }

    fn is_thru(&self) -> bool {
        true
    }

    fn decode(&mut self, pipe: &Pipeline, ctrl: &mut DecodeCtrl) -> DecodePhase {
        let mut stream = pipe.stream.lock().expect("stream lock");
        let mut output = pipe.output.lock().expect("output lock");

        let avail = stream.buf.used().min(stream.buf.cont_read());
        if stream.state.phase.ended() && avail == 0 {
            return DecodePhase::Complete;
        }

        if ctrl.new_stream {
            info!("setting track_start");
            output.output.track_start = Some(output.buf.write_pos());
            ctrl.new_stream = false;

            if pipe.config.flac_header != FlacHeaderMode::No && !self.header_done {
                let used = stream.buf.used();
                stream.buf.unwrap_to(16.min(used));
                let head = stream.buf.readable();
                if head.len() >= 4 && &head[0..4] != b"fLaC" {
                    if let Some((header, _rate)) = synthesize_streaminfo(
                        pipe.config.flac_header,
                        head,
                        output.output.duration,
                    ) {
                        output.buf.write_from(&header);
                        info!("FLAC header added");
                    }
                }
            }
            self.header_done = true;
        }

        let out = avail.min(output.buf.space());
        let readable = stream.buf.readable();
        let written = output.buf.write_from(&readable[..out.min(readable.len())]);
        stream.buf.inc_readp(written);

        DecodePhase::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // fixed 4096-sample blocks, 44.1 kHz, stereo, 16 bits, frame number 0
    fn frame_header() -> Vec<u8> {
        let mut f = vec![0xff, 0xf8];
        f.push(0xc9); // block size code 0xc (4096), rate code 9 (44100)
        f.push(0x18); // channels 1 (stereo pair), sample size 4 (16 bits)
        f.push(0x00); // frame number 0
        f.extend_from_slice(&[0u8; 16]);
        f
    }

    #[test]
    fn synthesizes_streaminfo_from_frame() {
        let (header, rate) =
            synthesize_streaminfo(FlacHeaderMode::Default, &frame_header(), 0).unwrap();
        assert_eq!(rate, 44100);
        assert_eq!(&header[0..4], b"fLaC");
        assert_eq!(header[4], 0x80);
        assert_eq!(header.len(), 4 + 4 + 34);

        // block size 4096 in min/max
        assert_eq!(&header[8..10], &4096u16.to_be_bytes());
        // rate 44100 sits in the top 20 bits of the combo
        let combo = u64::from_be_bytes(header[18..26].try_into().unwrap());
        assert_eq!((combo >> 44) as u32, 44100);
        assert_eq!(((combo >> 41) & 0x07) as u8 + 1, 2);
        assert_eq!(((combo >> 36) & 0x1f) as u8 + 1, 16);
    }

    #[test]
    fn adjust_mode_accounts_for_duration() {
        let (header, _) =
            synthesize_streaminfo(FlacHeaderMode::Adjust, &frame_header(), 10_000).unwrap();
        let combo = u64::from_be_bytes(header[18..26].try_into().unwrap());
        // frame 0: count is the remaining duration only
        assert_eq!(combo & 0xf_ffff_ffff, 0);

        let mut later = frame_header();
        later[4] = 0x02; // frame number 2
        let (header, _) =
            synthesize_streaminfo(FlacHeaderMode::Adjust, &later, 10_000).unwrap();
        let combo = u64::from_be_bytes(header[18..26].try_into().unwrap());
        assert_eq!(combo & 0xf_ffff_ffff, 2 * 4096 + 441_000);
    }

    #[test]
    fn max_mode_uses_unbounded_count() {
        let (header, _) =
            synthesize_streaminfo(FlacHeaderMode::Max, &frame_header(), 0).unwrap();
        let combo = u64::from_be_bytes(header[18..26].try_into().unwrap());
        assert_eq!(combo & 0xf_ffff_ffff, FLAC_MAX_SAMPLES);
    }

    #[test]
    fn rejects_non_frame_bytes() {
        assert!(synthesize_streaminfo(FlacHeaderMode::Default, &[0u8; 20], 0).is_none());
    }
}
