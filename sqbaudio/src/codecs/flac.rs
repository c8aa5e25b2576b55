//! FLAC decoding through claxon.

use std::sync::Arc;

use tracing::{info, warn};

use crate::decode::{decoder_new_stream, write_frames, Codec, StreamReader};
use crate::pipeline::{DecodeCtrl, DecodePhase, Pipeline};

pub struct FlacCodec {
    pipe: Arc<Pipeline>,
    reader: Option<claxon::FlacReader<StreamReader>>,
    scratch: Vec<i32>,
    bits_per_sample: u32,
    channels: u32,
}

impl FlacCodec {
    pub fn new(pipe: &Arc<Pipeline>) -> Self {
        Self {
            pipe: Arc::clone(pipe),
            reader: None,
            scratch: Vec::new(),
            bits_per_sample: 16,
            channels: 2,
        }
    }
}

impl Codec for FlacCodec {
    fn min_space(&self) -> usize {
        // must cover one whole decoded block so the frame writer never
        // has to wait while the decode lock is held
        128 * 1024
    }

    fn decode(&mut self, pipe: &Pipeline, ctrl: &mut DecodeCtrl) -> DecodePhase {
        if self.reader.is_none() {
            let source = StreamReader::new(&self.pipe);
            let reader = match claxon::FlacReader::new(source) {
                Ok(reader) => reader,
                Err(err) => {
                    warn!("flac header error: {err}");
                    return DecodePhase::Error;
                }
            };
            let streaminfo = reader.streaminfo();
            info!(
                "flac: r:{} s:{} c:{}",
                streaminfo.sample_rate, streaminfo.bits_per_sample, streaminfo.channels
            );
            self.bits_per_sample = streaminfo.bits_per_sample;
            self.channels = streaminfo.channels;

            decoder_new_stream(pipe, streaminfo.sample_rate);
            {
                let mut zone = pipe.output.lock().expect("output lock");
                zone.output.sample_size = streaminfo.bits_per_sample as u8;
                zone.output.channels = streaminfo.channels as u8;
            }
            ctrl.new_stream = false;
            self.reader = Some(reader);
        }

        let reader = self.reader.as_mut().expect("created above");
        let mut blocks = reader.blocks();
        match blocks.read_next_or_eof(std::mem::take(&mut self.scratch)) {
            Ok(Some(block)) => {
                let shift = 32 - self.bits_per_sample;
                let duration = block.duration() as usize;
                let mut interleaved = Vec::with_capacity(duration * 2);
                for i in 0..duration as u32 {
                    let left = block.sample(0, i) << shift;
                    let right = if self.channels > 1 {
                        block.sample(1, i) << shift
                    } else {
                        left
                    };
                    interleaved.push(left);
                    interleaved.push(right);
                }
                self.scratch = block.into_buffer();
                if !write_frames(pipe, &interleaved, ctrl) {
                    return DecodePhase::Stopped;
                }
                DecodePhase::Running
            }
            Ok(None) => DecodePhase::Complete,
            Err(err) => {
                warn!("flac decode error: {err}");
                if ctrl.frames == 0 {
                    DecodePhase::Error
                } else {
                    DecodePhase::Complete
                }
            }
        }
    }
}
