//! Raw PCM, WAV and AIFF input.
//!
//! The first buffer is sniffed for a RIFF or FORM container whose values
//! override whatever LMS declared; samples are then unpacked into 32-bit
//! left-justified stereo frames. Mono input is duplicated to both channels.

use tracing::{info, warn};

use crate::decode::{decoder_new_stream, Codec};
use crate::pcmfmt::sniff_container;
use crate::pipeline::{DecodeCtrl, DecodePhase, Pipeline, BYTES_PER_FRAME};

const MAX_DECODE_FRAMES: usize = 4096;
const MIN_READ: usize = 4096;
const MIN_SPACE: usize = 16 * 1024;

pub struct PcmCodec {
    sample_size: u8,
    sample_rate: u32,
    channels: u8,
    big_endian: bool,
    bytes_per_frame: usize,
}

impl PcmCodec {
    pub fn new(sample_size: u8, sample_rate: u32, channels: u8, big_endian: bool) -> Self {
        Self {
            sample_size,
            sample_rate,
            channels,
            big_endian,
            bytes_per_frame: BYTES_PER_FRAME,
        }
    }

    fn unpack_sample(&self, bytes: &[u8]) -> i32 {
        match (self.sample_size, self.big_endian) {
            (8, false) => i32::from((bytes[0] ^ 0x80) as i8) << 24,
            (8, true) => i32::from(bytes[0] as i8) << 24,
            (16, false) => i32::from(i16::from_le_bytes([bytes[0], bytes[1]])) << 16,
            (16, true) => i32::from(i16::from_be_bytes([bytes[0], bytes[1]])) << 16,
            (24, false) => {
                (i32::from(bytes[2] as i8) << 24)
                    | (i32::from(bytes[1]) << 16)
                    | (i32::from(bytes[0]) << 8)
            }
            (24, true) => {
                (i32::from(bytes[0] as i8) << 24)
                    | (i32::from(bytes[1]) << 16)
                    | (i32::from(bytes[2]) << 8)
            }
            (32, false) => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            (_, _) => i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        }
    }
}

impl Codec for PcmCodec {
    fn min_read(&self) -> usize {
        MIN_READ
    }

    fn min_space(&self) -> usize {
        MIN_SPACE
    }

    fn decode(&mut self, pipe: &Pipeline, ctrl: &mut DecodeCtrl) -> DecodePhase {
        if ctrl.new_stream {
            // sniff the container with the stream lock only, the shared
            // new-stream path takes the output lock afterwards
            {
                let mut stream = pipe.stream.lock().expect("stream lock");
                let used = stream.buf.used();
                stream.buf.unwrap_to(MIN_READ.min(used));
                let sniffed = sniff_container(stream.buf.readable());
                if let Some(sniffed) = sniffed {
                    info!(
                        "container: size:{} rate:{} chan:{} little:{}",
                        sniffed.sample_size,
                        sniffed.sample_rate,
                        sniffed.channels,
                        sniffed.little_endian
                    );
                    self.sample_size = sniffed.sample_size;
                    self.sample_rate = sniffed.sample_rate;
                    self.channels = sniffed.channels;
                    self.big_endian = !sniffed.little_endian;
                    let skip = sniffed.audio_offset.min(stream.buf.used());
                    stream.buf.inc_readp(skip);
                } else {
                    info!("no container header, using declared format");
                }
            }

            decoder_new_stream(pipe, self.sample_rate);
            {
                let mut output = pipe.output.lock().expect("output lock");
                output.output.sample_size = self.sample_size;
                output.output.channels = self.channels;
                output.output.in_endian = !self.big_endian;
            }
            ctrl.new_stream = false;
            self.bytes_per_frame =
                usize::from(self.sample_size) / 8 * usize::from(self.channels.max(1));
            if self.channels == 0 || self.sample_size == 0 {
                warn!("unusable pcm format");
                return DecodePhase::Error;
            }
        }

        let mut stream = pipe.stream.lock().expect("stream lock");
        let mut output = pipe.output.lock().expect("output lock");

        if stream.state.phase.ended() && stream.buf.used() < self.bytes_per_frame {
            return DecodePhase::Complete;
        }

        let out_frames = output.buf.space().min(output.buf.cont_write()) / BYTES_PER_FRAME;
        let avail = stream.buf.used().min(stream.buf.cont_read());
        let in_frames = avail / self.bytes_per_frame;
        if in_frames == 0 {
            // a frame straddles the wrap, make it contiguous
            if stream.buf.used() >= self.bytes_per_frame {
                stream.buf.unwrap_to(self.bytes_per_frame);
            }
            return DecodePhase::Running;
        }

        let frames = in_frames.min(out_frames).min(MAX_DECODE_FRAMES);
        let mut unpacked = Vec::with_capacity(frames * BYTES_PER_FRAME);
        {
            let readable = stream.buf.readable();
            for frame in readable[..frames * self.bytes_per_frame].chunks_exact(self.bytes_per_frame) {
                let left = self.unpack_sample(&frame[..usize::from(self.sample_size) / 8]);
                let right = if self.channels == 2 {
                    self.unpack_sample(&frame[usize::from(self.sample_size) / 8..])
                } else {
                    left
                };
                unpacked.extend_from_slice(&left.to_ne_bytes());
                unpacked.extend_from_slice(&right.to_ne_bytes());
            }
        }

        output.buf.write_from(&unpacked);
        stream.buf.inc_readp(frames * self.bytes_per_frame);
        ctrl.frames += frames as u32;

        DecodePhase::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpack_16_bit_both_endians() {
        let le = PcmCodec::new(16, 44100, 2, false);
        assert_eq!(le.unpack_sample(&[0x34, 0x12]), 0x1234 << 16);
        let be = PcmCodec::new(16, 44100, 2, true);
        assert_eq!(be.unpack_sample(&[0x12, 0x34]), 0x1234 << 16);
    }

    #[test]
    fn unpack_24_bit_sign_extends() {
        let be = PcmCodec::new(24, 96000, 2, true);
        assert_eq!(be.unpack_sample(&[0xff, 0x00, 0x00]), -0x0100_0000);
        let le = PcmCodec::new(24, 96000, 2, false);
        assert_eq!(le.unpack_sample(&[0x00, 0x00, 0xff]), -0x0100_0000);
    }

    #[test]
    fn unpack_8_bit_offset_binary() {
        let le = PcmCodec::new(8, 8000, 1, false);
        // 0x80 is the midpoint in unsigned 8-bit audio
        assert_eq!(le.unpack_sample(&[0x80]), 0);
        assert_eq!(le.unpack_sample(&[0xff]), 0x7f << 24);
    }
}
