//! Pass-through: origin bytes are never interpreted, just moved from the
//! stream buffer to the output buffer.

use crate::decode::Codec;
use crate::pipeline::{DecodeCtrl, DecodePhase, Pipeline};

pub struct ThruCodec;

impl ThruCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ThruCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for ThruCodec {
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
            tracing::info!("setting track_start");
            output.output.track_start = Some(output.buf.write_pos());
            ctrl.new_stream = false;
        }

        let out = avail.min(output.buf.space());
        let readable = stream.buf.readable();
        let written = output.buf.write_from(&readable[..out.min(readable.len())]);
        stream.buf.inc_readp(written);

        DecodePhase::Running
    }
}
