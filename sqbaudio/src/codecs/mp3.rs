//! MP3 decoding through minimp3.

use std::sync::Arc;

use minimp3::{Decoder, Error, Frame};
use tracing::warn;

use crate::decode::{decoder_new_stream, write_frames, Codec, StreamReader};
use crate::pipeline::{DecodeCtrl, DecodePhase, Pipeline};

pub struct Mp3Codec {
    pipe: Arc<Pipeline>,
    decoder: Option<Decoder<StreamReader>>,
}

impl Mp3Codec {
    pub fn new(pipe: &Arc<Pipeline>) -> Self {
        Self {
            pipe: Arc::clone(pipe),
            decoder: None,
        }
    }

    fn push(&self, pipe: &Pipeline, ctrl: &mut DecodeCtrl, frame: &Frame) -> bool {
        let mut interleaved = Vec::with_capacity(frame.data.len() / frame.channels.max(1) * 2);
        if frame.channels >= 2 {
            for pair in frame.data.chunks_exact(frame.channels) {
                interleaved.push(i32::from(pair[0]) << 16);
                interleaved.push(i32::from(pair[1]) << 16);
            }
        } else {
            for sample in &frame.data {
                let wide = i32::from(*sample) << 16;
                interleaved.push(wide);
                interleaved.push(wide);
            }
        }
        write_frames(pipe, &interleaved, ctrl)
    }
}

impl Codec for Mp3Codec {
    fn decode(&mut self, pipe: &Pipeline, ctrl: &mut DecodeCtrl) -> DecodePhase {
        if self.decoder.is_none() {
            self.decoder = Some(Decoder::new(StreamReader::new(&self.pipe)));
        }

        let decoder = self.decoder.as_mut().expect("created above");
        match decoder.next_frame() {
            Ok(frame) => {
                if ctrl.new_stream {
                    decoder_new_stream(pipe, frame.sample_rate as u32);
                    let mut zone = pipe.output.lock().expect("output lock");
                    zone.output.sample_size = 16;
                    zone.output.channels = frame.channels.min(2) as u8;
                    drop(zone);
                    ctrl.new_stream = false;
                }
                if !self.push(pipe, ctrl, &frame) {
                    return DecodePhase::Stopped;
                }
                DecodePhase::Running
            }
            Err(Error::Eof) => DecodePhase::Complete,
            Err(err) => {
                warn!("mp3 decode error: {err:?}");
                if ctrl.frames == 0 {
                    DecodePhase::Error
                } else {
                    DecodePhase::Complete
                }
            }
        }
    }
}
