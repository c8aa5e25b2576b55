//! Ogg/Opus decoding: ogg page/packet framing plus the opus decoder,
//! always producing 48 kHz as the codec mandates.

use std::sync::Arc;

use tracing::{info, warn};

use crate::decode::{decoder_new_stream, write_frames, Codec, NoSeek, StreamReader};
use crate::pipeline::{DecodeCtrl, DecodePhase, Pipeline};

/// 120 ms at 48 kHz, the largest opus frame.
const MAX_FRAME_SAMPLES: usize = 5760;

pub struct OpusCodec {
    pipe: Arc<Pipeline>,
    reader: Option<ogg::PacketReader<NoSeek<StreamReader>>>,
    decoder: Option<opus::Decoder>,
    channels: u8,
    pre_skip: u16,
    to_skip: usize,
}

impl OpusCodec {
    pub fn new(pipe: &Arc<Pipeline>) -> Self {
        Self {
            pipe: Arc::clone(pipe),
            reader: None,
            decoder: None,
            channels: 2,
            pre_skip: 0,
            to_skip: 0,
        }
    }

    fn open_headers(&mut self) -> Result<(), String> {
        let mut reader = ogg::PacketReader::new(NoSeek(StreamReader::new(&self.pipe)));

        // OpusHead: magic(8) version(1) channels(1) pre-skip(2 LE) ...
        let head = reader
            .read_packet_expected()
            .map_err(|e| format!("ogg error: {e}"))?;
        if head.data.len() < 19 || &head.data[0..8] != b"OpusHead" {
            return Err("missing OpusHead".into());
        }
        self.channels = head.data[9];
        self.pre_skip = u16::from_le_bytes([head.data[10], head.data[11]]);
        self.to_skip = usize::from(self.pre_skip);

        // OpusTags is mandatory, discard it
        let tags = reader
            .read_packet_expected()
            .map_err(|e| format!("ogg error: {e}"))?;
        if tags.data.len() < 8 || &tags.data[0..8] != b"OpusTags" {
            return Err("missing OpusTags".into());
        }

        let channels = if self.channels >= 2 {
            opus::Channels::Stereo
        } else {
            opus::Channels::Mono
        };
        self.decoder =
            Some(opus::Decoder::new(48_000, channels).map_err(|e| format!("opus error: {e}"))?);
        self.reader = Some(reader);
        info!("opus: c:{} pre-skip:{}", self.channels, self.pre_skip);
        Ok(())
    }
}

impl Codec for OpusCodec {
    fn min_space(&self) -> usize {
        // one 120 ms frame of 32-bit stereo plus headroom
        64 * 1024
    }

    fn decode(&mut self, pipe: &Pipeline, ctrl: &mut DecodeCtrl) -> DecodePhase {
        if self.reader.is_none() {
            if let Err(err) = self.open_headers() {
                warn!("{err}");
                return DecodePhase::Error;
            }
            decoder_new_stream(pipe, 48_000);
            {
                let mut zone = pipe.output.lock().expect("output lock");
                zone.output.sample_size = 16;
                zone.output.channels = self.channels.min(2);
            }
            ctrl.new_stream = false;
        }

        let reader = self.reader.as_mut().expect("created above");
        let packet = match reader.read_packet() {
            Ok(Some(packet)) => packet,
            Ok(None) => return DecodePhase::Complete,
            Err(err) => {
                warn!("ogg read error: {err}");
                return if ctrl.frames == 0 {
                    DecodePhase::Error
                } else {
                    DecodePhase::Complete
                };
            }
        };

        let decoder = self.decoder.as_mut().expect("created above");
        let channels = usize::from(self.channels.clamp(1, 2));
        let mut pcm = vec![0i16; MAX_FRAME_SAMPLES * channels];
        let samples = match decoder.decode(&packet.data, &mut pcm, false) {
            Ok(samples) => samples,
            Err(err) => {
                warn!("opus decode error: {err}");
                return if ctrl.frames == 0 {
                    DecodePhase::Error
                } else {
                    DecodePhase::Complete
                };
            }
        };

        // encoder delay at the head of the stream is not audio
        let skip = self.to_skip.min(samples);
        self.to_skip -= skip;

        let mut interleaved = Vec::with_capacity((samples - skip) * 2);
        for frame in pcm[skip * channels..samples * channels].chunks_exact(channels) {
            let left = i32::from(frame[0]) << 16;
            let right = if channels == 2 {
                i32::from(frame[1]) << 16
            } else {
                left
            };
            interleaved.push(left);
            interleaved.push(right);
        }
        if !write_frames(pipe, &interleaved, ctrl) {
            return DecodePhase::Stopped;
        }

        DecodePhase::Running
    }
}
