//! AAC and ALAC in MP4 containers, demuxed and decoded by symphonia.
//!
//! Covers codec ids 'a' (AAC) and 'l' (ALAC). The stream cannot seek, so
//! files carrying `mdat` before `moov` fail like any non-streamable MP4.

use std::sync::Arc;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::{MediaSourceStream, ReadOnlySource};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{info, warn};

use crate::decode::{decoder_new_stream, write_frames, Codec, StreamReader};
use crate::pipeline::{DecodeCtrl, DecodePhase, Pipeline};

pub struct Mp4Codec {
    pipe: Arc<Pipeline>,
    id: char,
    format: Option<Box<dyn FormatReader>>,
    decoder: Option<Box<dyn Decoder>>,
    track_id: u32,
    sample_size: u8,
}

impl Mp4Codec {
    pub fn new(pipe: &Arc<Pipeline>, id: char) -> Self {
        Self {
            pipe: Arc::clone(pipe),
            id,
            format: None,
            decoder: None,
            track_id: 0,
            sample_size: 16,
        }
    }

    fn open(&mut self) -> Result<u32, String> {
        let source = ReadOnlySource::new(StreamReader::new(&self.pipe));
        let mss = MediaSourceStream::new(Box::new(source), Default::default());

        let mut hint = Hint::new();
        hint.mime_type("audio/mp4");

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| format!("mp4 probe failed: {e}"))?;

        let format = probed.format;
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| "no playable track found".to_string())?;

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| format!("no decoder for track: {e}"))?;

        let sample_rate = track.codec_params.sample_rate.unwrap_or(44_100);
        self.sample_size = track
            .codec_params
            .bits_per_sample
            .map(|b| b.min(32) as u8)
            .unwrap_or(16);
        self.track_id = track.id;
        info!(
            "mp4 ({}) r:{} s:{}",
            self.id, sample_rate, self.sample_size
        );

        self.format = Some(format);
        self.decoder = Some(decoder);
        Ok(sample_rate)
    }
}

impl Codec for Mp4Codec {
    fn min_read(&self) -> usize {
        // enough for the moov of typical files before the probe starts
        8192
    }

    fn min_space(&self) -> usize {
        64 * 1024
    }

    fn decode(&mut self, pipe: &Pipeline, ctrl: &mut DecodeCtrl) -> DecodePhase {
        if self.format.is_none() {
            let sample_rate = match self.open() {
                Ok(rate) => rate,
                Err(err) => {
                    warn!("{err}");
                    return DecodePhase::Error;
                }
            };
            decoder_new_stream(pipe, sample_rate);
            {
                let mut zone = pipe.output.lock().expect("output lock");
                zone.output.sample_size = self.sample_size;
            }
            ctrl.new_stream = false;
        }

        let format = self.format.as_mut().expect("opened above");
        let decoder = self.decoder.as_mut().expect("opened above");

        let packet = loop {
            match format.next_packet() {
                Ok(packet) if packet.track_id() == self.track_id => break packet,
                Ok(_) => continue,
                Err(SymphoniaError::IoError(err))
                    if err.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return DecodePhase::Complete;
                }
                Err(SymphoniaError::ResetRequired) => {
                    decoder.reset();
                    continue;
                }
                Err(err) => {
                    warn!("mp4 read error: {err}");
                    return if ctrl.frames == 0 {
                        DecodePhase::Error
                    } else {
                        DecodePhase::Complete
                    };
                }
            }
        };

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                let channels = spec.channels.count().max(1);
                let mut buffer = SampleBuffer::<i32>::new(decoded.capacity() as u64, spec);
                buffer.copy_interleaved_ref(decoded);

                let samples = buffer.samples();
                let mut interleaved = Vec::with_capacity(samples.len() / channels * 2);
                for frame in samples.chunks_exact(channels) {
                    let left = frame[0];
                    let right = if channels >= 2 { frame[1] } else { left };
                    interleaved.push(left);
                    interleaved.push(right);
                }
                {
                    let mut zone = pipe.output.lock().expect("output lock");
                    zone.output.channels = channels.min(2) as u8;
                }
                if !write_frames(pipe, &interleaved, ctrl) {
                    return DecodePhase::Stopped;
                }
                DecodePhase::Running
            }
            Err(SymphoniaError::DecodeError(err)) => {
                // a corrupt packet is skippable, a broken stream is not
                warn!("mp4 decode error: {err}");
                DecodePhase::Running
            }
            Err(err) => {
                warn!("mp4 fatal decode error: {err}");
                if ctrl.frames == 0 {
                    DecodePhase::Error
                } else {
                    DecodePhase::Complete
                }
            }
        }
    }
}
