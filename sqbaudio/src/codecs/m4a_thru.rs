//! MP4 to ADTS repackaging.
//!
//! Renderers that accept AAC usually want ADTS framing, while LMS serves
//! the original MP4. The walker consumes the box tree ahead of `mdat`,
//! lifting the AudioSpecificConfig from `esds` and the per-sample sizes
//! from `stsz`, then re-emits each raw AAC frame behind a reconstructed
//! 7-byte ADTS header.

use tracing::{debug, error, info};

use crate::decode::Codec;
use crate::pipeline::{DecodeCtrl, DecodePhase, Pipeline, StreamZone};

const WRAPBUF_LEN: usize = 2048;
const ADTS_LEN: usize = 7;

pub struct M4aThruCodec {
    /// Bytes of an oversized box still to discard.
    consume: u64,
    frames: Vec<u32>,
    frame_size: u32,
    frame_index: usize,
    freq_index: u8,
    audio_object_type: u8,
    channel_config: u8,
    trak: u32,
    play: u32,
}

impl M4aThruCodec {
    pub fn new() -> Self {
        Self {
            consume: 0,
            frames: Vec::new(),
            frame_size: 0,
            frame_index: 0,
            freq_index: 0,
            audio_object_type: 0,
            channel_config: 0,
            trak: 0,
            play: 0,
        }
    }

    /// Builds the ADTS header for one raw frame.
    fn adts_header(&self, frame_size: usize) -> [u8; ADTS_LEN] {
        let full = frame_size + ADTS_LEN;
        [
            0xff,
            0xf1,
            ((self.audio_object_type & 0x03).wrapping_sub(1) << 6)
                | (self.freq_index << 2)
                | (self.channel_config >> 2),
            ((self.channel_config & 0x03) << 6) | ((full >> 11) as u8 & 0x03),
            ((full & 0x7ff) >> 3) as u8,
            (((full & 0x07) << 5) as u8) | 0x1f,
            0xfc,
        ]
    }

    /// Walks boxes until `mdat`. 1 = audio reached, 0 = needs more bytes,
    /// -1 = unusable stream.
    fn read_mp4_header(&mut self, zone: &mut StreamZone) -> i32 {
        loop {
            let avail = zone.buf.used().min(zone.buf.cont_read());
            if avail < 8 {
                return 0;
            }
            let head = zone.buf.readable();
            let len = u32::from_be_bytes([head[0], head[1], head[2], head[3]]) as u64;
            let kind: [u8; 4] = [head[4], head[5], head[6], head[7]];

            match &kind {
                b"moov" => {
                    self.trak = 0;
                    self.play = 0;
                }
                b"trak" => self.trak += 1,
                b"esds" if (avail as u64) > len && len >= 16 => {
                    if !self.parse_esds(&head[12..len as usize]) {
                        return -1;
                    }
                    debug!("playable aac track: {}", self.trak);
                    self.play = self.trak;
                }
                b"stsz" if (avail as u64) > len && len >= 20 => {
                    self.frame_size = u32::from_be_bytes([head[12], head[13], head[14], head[15]]);
                    if self.frame_size == 0 {
                        let entries =
                            (u32::from_be_bytes([head[16], head[17], head[18], head[19]]) as usize)
                                .min((len as usize - 20) / 4);
                        info!("frame table of {entries} entries");
                        self.frames = head[20..20 + entries * 4]
                            .chunks_exact(4)
                            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                            .collect();
                        self.frame_index = 0;
                    }
                }
                b"mdat" => {
                    zone.buf.inc_readp(8);
                    if self.play != 0 {
                        debug!("type: mdat len: {len}");
                        return 1;
                    }
                    // mdat before moov cannot be handled without seeking
                    error!("type: mdat len: {len}, no playable track found");
                    return -1;
                }
                _ => {}
            }

            // containers are entered, leaves are consumed whole
            let consume: u64 = match &kind {
                b"moov" | b"trak" | b"mdia" | b"minf" | b"stbl" | b"udta" | b"ilst" => 8,
                b"stsd" => 16,
                b"mp4a" => 36,
                b"meta" => 12,
                _ => len,
            };

            if (avail as u64) >= consume {
                zone.buf.inc_readp(consume as usize);
            } else if !(kind == *b"esds" || kind == *b"stsz") {
                // partially buffered leaf nobody parses: discard across calls
                zone.buf.inc_readp(avail);
                self.consume = consume - avail as u64;
                return 0;
            } else if len >= zone.buf.size() as u64 {
                error!("atom {} too large for buffer {len}", String::from_utf8_lossy(&kind));
                return -1;
            } else {
                // rotate so the parsed atom becomes contiguous
                zone.buf.unwrap_to(len as usize);
                if zone.buf.cont_read() < len as usize {
                    return 0;
                }
            }
        }
    }

    fn parse_esds(&mut self, body: &[u8]) -> bool {
        let mut pos = 0usize;
        let mut expect = |tag: u8, skip: usize, body: &[u8], pos: &mut usize| -> bool {
            if body.get(*pos) != Some(&tag) {
                return false;
            }
            *pos += 1;
            // optional 3-byte extended tag
            if matches!(body.get(*pos), Some(0x80) | Some(0x81) | Some(0xfe)) {
                *pos += 3;
            }
            *pos += skip;
            true
        };

        if !expect(0x03, 4, body, &mut pos) {
            return false;
        }
        if !expect(0x04, 14, body, &mut pos) {
            return false;
        }
        if !expect(0x05, 1, body, &mut pos) {
            return false;
        }
        let Some(config) = body.get(pos..pos + 4) else {
            return false;
        };
        let audio_config = u32::from_be_bytes([config[0], config[1], config[2], config[3]]);
        self.audio_object_type = (audio_config >> 27) as u8;
        self.freq_index = ((audio_config >> 23) & 0x0f) as u8;
        self.channel_config = ((audio_config >> 19) & 0x0f) as u8;
        true
    }
}

impl Default for M4aThruCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for M4aThruCodec {
    fn min_read(&self) -> usize {
        WRAPBUF_LEN
    }

    fn min_space(&self) -> usize {
        20 * 1024
    }

    fn is_thru(&self) -> bool {
        true
    }

    fn decode(&mut self, pipe: &Pipeline, ctrl: &mut DecodeCtrl) -> DecodePhase {
        let mut stream = pipe.stream.lock().expect("stream lock");

        if self.consume > 0 {
            let discard = (self.consume as usize)
                .min(stream.buf.used().min(stream.buf.cont_read()));
            debug!("consume: {discard} of {}", self.consume);
            stream.buf.inc_readp(discard);
            self.consume -= discard as u64;
            return DecodePhase::Running;
        }

        if ctrl.new_stream {
            match self.read_mp4_header(&mut stream) {
                1 => {
                    info!("setting track_start");
                    let mut output = pipe.output.lock().expect("output lock");
                    output.output.track_start = Some(output.buf.write_pos());
                    ctrl.new_stream = false;
                }
                -1 => {
                    error!("error reading stream header");
                    return DecodePhase::Error;
                }
                _ => return DecodePhase::Running,
            }
        }

        loop {
            let used = stream.buf.used();
            if stream.state.phase.ended() && used == 0 {
                return DecodePhase::Complete;
            }

            let frame_size = if self.frame_size != 0 {
                self.frame_size as usize
            } else {
                match self.frames.get(self.frame_index) {
                    Some(size) => *size as usize,
                    // table exhausted: remaining bytes are trailing boxes
                    None => {
                        stream.buf.inc_readp(used);
                        return DecodePhase::Running;
                    }
                }
            };
            if frame_size == 0 {
                self.frame_index += 1;
                continue;
            }

            let mut output = pipe.output.lock().expect("output lock");
            if used < frame_size || output.buf.space() < frame_size + ADTS_LEN {
                return DecodePhase::Running;
            }

            self.frame_index += 1;

            let header = self.adts_header(frame_size);
            output.buf.write_from(&header);

            // copy handling the stream buffer wrap
            let cont = stream.buf.cont_read().min(frame_size);
            let mut frame = Vec::with_capacity(frame_size);
            frame.extend_from_slice(&stream.buf.readable()[..cont]);
            if cont < frame_size {
                frame.extend_from_slice(&stream.buf.slice(0, frame_size - cont));
            }
            output.buf.write_from(&frame);
            stream.buf.inc_readp(frame_size);

            debug!("write {} bytes", frame_size + ADTS_LEN);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adts_header_reconstruction() {
        let mut codec = M4aThruCodec::new();
        codec.audio_object_type = 2; // AAC-LC
        codec.freq_index = 4; // 44100
        codec.channel_config = 2;

        let header = codec.adts_header(512);
        assert_eq!(header[0], 0xff);
        assert_eq!(header[1], 0xf1);
        // profile bits: (aot-1) << 6
        assert_eq!(header[2] >> 6, 1);
        assert_eq!((header[2] >> 2) & 0x0f, 4);
        // channel config straddles bytes 2/3
        let channels = ((header[2] & 0x01) << 2) | (header[3] >> 6);
        assert_eq!(channels, 2);
        // 13-bit frame length includes the header itself
        let len = (usize::from(header[3] & 0x03) << 11)
            | (usize::from(header[4]) << 3)
            | (usize::from(header[5]) >> 5);
        assert_eq!(len, 512 + ADTS_LEN);
        assert_eq!(header[6], 0xfc);
    }

    #[test]
    fn esds_config_extraction() {
        let mut codec = M4aThruCodec::new();
        // tag 3 (+4 skip), tag 4 (+14 skip), tag 5 (+1), then config
        let mut body = vec![0x03];
        body.extend_from_slice(&[0; 4]);
        body.push(0x04);
        body.extend_from_slice(&[0; 14]);
        body.push(0x05);
        body.push(0x02); // descriptor length
        // AudioSpecificConfig: AOT=2, freq=4, channels=2
        let config: u32 = (2 << 27) | (4 << 23) | (2 << 19);
        body.extend_from_slice(&config.to_be_bytes());

        assert!(codec.parse_esds(&body));
        assert_eq!(codec.audio_object_type, 2);
        assert_eq!(codec.freq_index, 4);
        assert_eq!(codec.channel_config, 2);
    }

    #[test]
    fn esds_rejects_malformed_tags() {
        let mut codec = M4aThruCodec::new();
        assert!(!codec.parse_esds(&[0x07, 0, 0, 0]));
    }
}
