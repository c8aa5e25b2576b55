//! Ogg/Vorbis decoding through lewton.

use std::sync::Arc;

use lewton::inside_ogg::OggStreamReader;
use tracing::warn;

use crate::decode::{decoder_new_stream, write_frames, Codec, NoSeek, StreamReader};
use crate::pipeline::{DecodeCtrl, DecodePhase, Pipeline};

pub struct VorbisCodec {
    pipe: Arc<Pipeline>,
    reader: Option<OggStreamReader<NoSeek<StreamReader>>>,
}

impl VorbisCodec {
    pub fn new(pipe: &Arc<Pipeline>) -> Self {
        Self {
            pipe: Arc::clone(pipe),
            reader: None,
        }
    }
}

impl Codec for VorbisCodec {
    fn min_space(&self) -> usize {
        // long vorbis blocks reach 8192 frames of 32-bit stereo
        128 * 1024
    }

    fn decode(&mut self, pipe: &Pipeline, ctrl: &mut DecodeCtrl) -> DecodePhase {
        if self.reader.is_none() {
            let reader = match OggStreamReader::new(NoSeek(StreamReader::new(&self.pipe))) {
                Ok(reader) => reader,
                Err(err) => {
                    warn!("vorbis header error: {err}");
                    return DecodePhase::Error;
                }
            };
            decoder_new_stream(pipe, reader.ident_hdr.audio_sample_rate);
            {
                let mut zone = pipe.output.lock().expect("output lock");
                zone.output.sample_size = 16;
                zone.output.channels = reader.ident_hdr.audio_channels.min(2);
            }
            ctrl.new_stream = false;
            self.reader = Some(reader);
        }

        let reader = self.reader.as_mut().expect("created above");
        let channels = usize::from(reader.ident_hdr.audio_channels.max(1));
        match reader.read_dec_packet_itl() {
            Ok(Some(packet)) => {
                let mut interleaved = Vec::with_capacity(packet.len() / channels * 2);
                if channels >= 2 {
                    for pair in packet.chunks_exact(channels) {
                        interleaved.push(i32::from(pair[0]) << 16);
                        interleaved.push(i32::from(pair[1]) << 16);
                    }
                } else {
                    for sample in packet {
                        let wide = i32::from(sample) << 16;
                        interleaved.push(wide);
                        interleaved.push(wide);
                    }
                }
                if !write_frames(pipe, &interleaved, ctrl) {
                    return DecodePhase::Stopped;
                }
                DecodePhase::Running
            }
            Ok(None) => DecodePhase::Complete,
            Err(err) => {
                warn!("vorbis decode error: {err}");
                if ctrl.frames == 0 {
                    DecodePhase::Error
                } else {
                    DecodePhase::Complete
                }
            }
        }
    }
}
