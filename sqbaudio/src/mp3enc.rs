//! MP3 re-encoder over the LAME binding.
//!
//! Frames are aggregated into fixed 1152-frame blocks before each encode
//! call, so the produced stream has a stable frame cadence regardless of
//! how the output engine batches its input.

use lame::Lame;
use tracing::{info, warn};

/// Samples per MPEG1 layer III granule pair.
pub const MP3_BLOCK_FRAMES: usize = 1152;

pub struct Mp3Encoder {
    lame: Lame,
    left: Vec<i16>,
    right: Vec<i16>,
    channels: u8,
}

// the encoder is only driven from the owning output engine
unsafe impl Send for Mp3Encoder {}

impl Mp3Encoder {
    pub fn new(sample_rate: u32, channels: u8, bitrate: u16) -> Option<Self> {
        let mut lame = Lame::new()?;

        // LAME only supports the MPEG rate families
        let rate = nearest_mp3_rate(sample_rate);
        if rate != sample_rate {
            warn!("MP3 cannot encode at {sample_rate} Hz, using {rate}");
        }

        if lame.set_sample_rate(rate).is_err()
            || lame.set_channels(channels.clamp(1, 2)).is_err()
            || lame.set_kilobitrate(i32::from(bitrate)).is_err()
            || lame.set_quality(5).is_err()
            || lame.init_params().is_err()
        {
            warn!("failed initializing MP3-{bitrate} r:{sample_rate} c:{channels}");
            return None;
        }

        info!("MP3-{bitrate} encoding r:{rate}");
        Some(Self {
            lame,
            left: Vec::with_capacity(MP3_BLOCK_FRAMES),
            right: Vec::with_capacity(MP3_BLOCK_FRAMES),
            channels: channels.clamp(1, 2),
        })
    }

    /// Frames still missing before a full block can be encoded.
    pub fn frames_to_block(&self) -> usize {
        MP3_BLOCK_FRAMES - self.left.len()
    }

    pub fn buffered(&self) -> usize {
        self.left.len()
    }

    /// Aggregates 32-bit stereo frames; encodes and returns MP3 bytes once
    /// a full block is complete, an empty vector otherwise.
    pub fn push_frames(&mut self, src: &[u8]) -> Vec<u8> {
        for frame in src.chunks_exact(8) {
            let l = i32::from_ne_bytes([frame[0], frame[1], frame[2], frame[3]]);
            let r = i32::from_ne_bytes([frame[4], frame[5], frame[6], frame[7]]);
            self.left.push((l >> 16) as i16);
            if self.channels == 2 {
                self.right.push((r >> 16) as i16);
            } else {
                self.right.push((l >> 16) as i16);
            }
        }

        if self.left.len() >= MP3_BLOCK_FRAMES {
            self.encode_block()
        } else {
            Vec::new()
        }
    }

    fn encode_block(&mut self) -> Vec<u8> {
        // worst case per LAME docs: 1.25 * samples + 7200
        let mut out = vec![0u8; MP3_BLOCK_FRAMES * 5 / 4 + 7200];
        let produced = match self.lame.encode(&self.left, &self.right, &mut out) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("MP3 encode failed: {err:?}");
                0
            }
        };
        self.left.clear();
        self.right.clear();
        out.truncate(produced);
        out
    }

    /// Pads and encodes the residual frames, then drains the encoder with a
    /// silent block (the binding exposes no flush call).
    pub fn finish(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        if !self.left.is_empty() {
            self.left.resize(MP3_BLOCK_FRAMES, 0);
            self.right.resize(MP3_BLOCK_FRAMES, 0);
            out.extend_from_slice(&self.encode_block());
        }
        self.left.resize(MP3_BLOCK_FRAMES, 0);
        self.right.resize(MP3_BLOCK_FRAMES, 0);
        out.extend_from_slice(&self.encode_block());
        out
    }
}

/// Clamps to the nearest rate the MPEG audio families support.
pub fn nearest_mp3_rate(rate: u32) -> u32 {
    const RATES: [u32; 9] = [8000, 11025, 12000, 16000, 22050, 24000, 32000, 44100, 48000];
    if RATES.contains(&rate) {
        return rate;
    }
    let mut best = RATES[0];
    for candidate in RATES {
        if candidate <= rate {
            best = candidate;
        }
    }
    best
}

/// Canonical 209-byte silent MP3 frame (44.1 kHz stereo) used by the Null
/// output mode keepalive stream.
pub const MP3_SILENCE: [u8; 209] = {
    let mut frame = [0x55u8; 209];
    frame[0] = 0xFF;
    frame[1] = 0xFB;
    frame[2] = 0x52;
    frame[3] = 0xC4;
    frame[4] = 0x5D;
    frame[5] = 0x83;
    frame[6] = 0xC0;
    frame[7] = 0x00;
    frame[8] = 0x01;
    frame[9] = 0xA4;
    frame[10] = 0x00;
    frame[11] = 0x00;
    frame[12] = 0x00;
    frame[13] = 0x20;
    frame[14] = 0x00;
    frame[15] = 0x00;
    frame[16] = 0x34;
    frame[17] = 0x80;
    frame[18] = 0x00;
    frame[19] = 0x00;
    frame[20] = 0x04;
    frame
};

/// Milliseconds of audio per silence frame (576×2 samples at 44.1 kHz,
/// rounded down so blocks slightly overlap rather than gap).
pub const MP3_SILENCE_DURATION: u32 = 26;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_frame_shape() {
        assert_eq!(MP3_SILENCE.len(), 209);
        assert_eq!(MP3_SILENCE[0], 0xFF);
        assert_eq!(MP3_SILENCE[1], 0xFB);
        assert_eq!(MP3_SILENCE[21], 0x55);
    }

    #[test]
    fn rate_clamping() {
        assert_eq!(nearest_mp3_rate(44100), 44100);
        assert_eq!(nearest_mp3_rate(96000), 48000);
        assert_eq!(nearest_mp3_rate(44000), 32000);
    }

    #[test]
    fn block_aggregation() {
        let Some(mut enc) = Mp3Encoder::new(44100, 2, 128) else {
            // LAME not available in this environment
            return;
        };
        let frames = vec![0u8; (MP3_BLOCK_FRAMES - 1) * 8];
        assert!(enc.push_frames(&frames).is_empty());
        assert_eq!(enc.frames_to_block(), 1);
        let out = enc.push_frames(&[0u8; 8]);
        // first block may stay buffered inside LAME, finish must drain
        let tail = enc.finish();
        assert!(!out.is_empty() || !tail.is_empty());
    }
}
