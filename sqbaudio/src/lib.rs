//! Per-player audio pipeline: streamer, decoder stack and output engine.
//!
//! Data flows `origin → streambuf → decoder → outputbuf → output engine`,
//! with the HTTP layer (sqbhttp) pulling from the output engine. The three
//! shared zones (stream, output, decode) each pair a ring buffer or codec
//! slot with its companion state under one mutex, so a state inspection and
//! a cursor move stay atomic.

pub mod codecs;
pub mod config;
pub mod decode;
pub mod flacenc;
pub mod mp3enc;
pub mod output;
pub mod pcmfmt;
pub mod pipeline;
pub mod stream;

pub use config::{CacheMode, FlacHeaderMode, IcyMode, L24Format, PlayerConfig};
pub use decode::{codec_open, decode_flush, negotiate_rate, spawn_decode_loop};
pub use pipeline::{
    DecodePhase, DisconnectCode, FadeDir, FadeMode, FadePhase, OutputPhase, Pipeline, RenderPhase,
    StreamPhase, BYTES_PER_FRAME, MAX_HEADER, OUTPUTBUF_IDLE_SIZE,
};
pub use stream::{stream_disconnect, stream_file, stream_sock};
