//! Shared state of one player pipeline.
//!
//! Lock order is decode → stream → output → cli. The decode loop holds the
//! decode mutex for the whole of one codec call (which takes stream then
//! output); the SlimProto round samples each zone briefly and never takes a
//! later lock while holding an earlier one out of order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use sqbbuffer::RingBuffer;
use sqbmeta::TrackMetadata;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::PlayerConfig;
use crate::flacenc::FlacEncoder;
use crate::mp3enc::Mp3Encoder;

/// Decoded frames are 32-bit stereo.
pub const BYTES_PER_FRAME: usize = 8;
/// Output buffer size between tracks.
pub const OUTPUTBUF_IDLE_SIZE: usize = 256 * 1024;
/// Request/response/ICY header scratch cap (ICY max is 255·16+1).
pub const MAX_HEADER: usize = 4096;
pub const ICY_LEN_MAX: usize = 255 * 16 + 1;
/// Live metadata refresh period (ms).
pub const METADATA_UPDATE_TIME: u32 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StreamPhase {
    Stopped,
    Disconnect,
    StreamingWait,
    StreamingBuffering,
    StreamingFile,
    StreamingHttp,
    SendHeaders,
    RecvHeaders,
}

impl StreamPhase {
    /// True once the stream has ended (stopped or pending disconnect).
    pub fn ended(self) -> bool {
        self <= StreamPhase::Disconnect
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisconnectCode {
    #[default]
    Ok = 0,
    LocalDisconnect = 1,
    RemoteDisconnect = 2,
    Unreachable = 3,
    Timeout = 4,
}

/// Streamer state, guarded together with the stream buffer.
#[derive(Debug)]
pub struct StreamState {
    pub phase: StreamPhase,
    pub disconnect: DisconnectCode,
    /// Response headers or latest ICY metadata block, forwarded to LMS.
    pub header: Vec<u8>,
    pub sent_headers: bool,
    pub meta_send: bool,
    pub cont_wait: bool,
    pub bytes: u64,
    pub threshold: u64,
    pub meta_interval: u32,
    pub meta_next: u32,
}

impl Default for StreamState {
    fn default() -> Self {
        Self {
            phase: StreamPhase::Stopped,
            disconnect: DisconnectCode::Ok,
            header: Vec::new(),
            sent_headers: false,
            meta_send: false,
            cont_wait: false,
            bytes: 0,
            threshold: 0,
            meta_interval: 0,
            meta_next: 0,
        }
    }
}

/// Stream buffer + streamer state under one lock.
#[derive(Debug)]
pub struct StreamZone {
    pub buf: RingBuffer,
    pub state: StreamState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DecodePhase {
    Stopped,
    Ready,
    Running,
    Complete,
    Error,
}

/// Decode bookkeeping mutated by the codec while it runs.
#[derive(Debug)]
pub struct DecodeCtrl {
    pub phase: DecodePhase,
    /// Latched until the first decoded output of a track is produced.
    pub new_stream: bool,
    pub frames: u32,
}

impl Default for DecodeCtrl {
    fn default() -> Self {
        Self {
            phase: DecodePhase::Stopped,
            new_stream: true,
            frames: 0,
        }
    }
}

pub struct DecodeZone {
    pub ctrl: DecodeCtrl,
    pub codec: Option<Box<dyn crate::decode::Codec>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OutputPhase {
    Off,
    Stopped,
    Waiting,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncodeMode {
    #[default]
    Thru,
    Null,
    Pcm,
    Flac,
    Mp3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FadePhase {
    #[default]
    Inactive,
    Due,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeDir {
    Up,
    Down,
    Cross,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FadeMode {
    #[default]
    None,
    Crossfade,
    FadeIn,
    FadeOut,
    FadeInOut,
}

impl FadeMode {
    pub fn from_transition_type(byte: u8) -> Self {
        match byte {
            b'1' => FadeMode::Crossfade,
            b'2' => FadeMode::FadeIn,
            b'3' => FadeMode::FadeOut,
            b'4' => FadeMode::FadeInOut,
            _ => FadeMode::None,
        }
    }
}

/// ICY injection substate.
#[derive(Debug, Default)]
pub struct IcyState {
    pub allowed: bool,
    pub interval: usize,
    pub remain: usize,
    pub artist: Option<String>,
    pub title: Option<String>,
    pub artwork: Option<String>,
    pub updated: bool,
}

/// Odd-frame remainder of the Sony L24 LPCM pairing.
#[derive(Debug, Default)]
pub struct L24Carry {
    pub frame: Vec<u8>,
}

/// Re-encoding substate of the track being sent.
#[derive(Default)]
pub struct EncodeState {
    pub sample_rate: u32,
    pub sample_size: u8,
    pub channels: u8,
    pub mode: EncodeMode,
    /// Encoder survives track ends (gapless re-encode).
    pub flow: bool,
    /// FLAC compression level or MP3 bitrate.
    pub level: u16,
    pub flac: Option<FlacEncoder>,
    pub mp3: Option<Mp3Encoder>,
    pub l24_carry: Option<L24Carry>,
    /// Silence blocks left to send in Null mode.
    pub count: usize,
}

/// State of the track being sent to the renderer (not of playback).
pub struct OutputState {
    pub state: OutputPhase,
    /// Whole track has been pulled from outputbuf.
    pub completed: bool,
    /// Output format char: p/w/i/f/m…
    pub format: char,
    pub sample_size: u8,
    pub channels: u8,
    pub codec: u8,
    pub sample_rate: u32,
    pub direct_sample_rate: u32,
    /// true = little endian source / output.
    pub in_endian: bool,
    pub out_endian: bool,
    pub duration: u32,
    /// Time offset of the current track in flow mode (ms).
    pub offset: u32,
    pub bitrate: u32,
    /// HTTP content length strategy (see config::HTTP_*).
    pub length: i64,
    pub index: u16,
    pub port: u16,
    pub chunked: bool,
    pub mimetype: String,
    /// Trigger (not a state): playback of the current index confirmed.
    pub track_started: bool,
    /// Offset in outputbuf where the current track starts.
    pub track_start: Option<usize>,
    pub supported_rates: [i32; 2],
    pub metadata: TrackMetadata,
    pub live_metadata: LiveMetadata,
    pub icy: IcyState,
    /// Pending WAV/AIFF header bytes (already sized) and remaining count.
    pub header: Option<Vec<u8>>,
    pub header_count: usize,
    pub fade: FadePhase,
    pub fade_mode: FadeMode,
    pub fade_secs: u32,
    pub fade_dir: FadeDir,
    pub fade_start: usize,
    pub fade_end: usize,
    /// Out-fade queued while an in-fade is still active.
    pub fade_writep: Option<usize>,
    pub replay_gain: u32,
    pub next_replay_gain: u32,
    pub start_at: u32,
    /// Free space the current codec wants before decoding, kept around for
    /// the crossfade window sizing.
    pub codec_min_space: usize,
    pub encode: EncodeState,
}

#[derive(Debug, Default)]
pub struct LiveMetadata {
    pub hash: u32,
    pub last: u32,
    pub enabled: bool,
}

impl Default for OutputState {
    fn default() -> Self {
        Self {
            state: OutputPhase::Stopped,
            completed: false,
            format: '\0',
            sample_size: 0,
            channels: 0,
            codec: 0,
            sample_rate: 0,
            direct_sample_rate: 0,
            in_endian: true,
            out_endian: false,
            duration: 0,
            offset: 0,
            bitrate: 0,
            length: crate::config::HTTP_CHUNKED,
            index: 0,
            port: 0,
            chunked: false,
            mimetype: String::new(),
            track_started: false,
            track_start: None,
            supported_rates: [0; 2],
            metadata: TrackMetadata::new(),
            live_metadata: LiveMetadata::default(),
            icy: IcyState::default(),
            header: None,
            header_count: 0,
            fade: FadePhase::Inactive,
            fade_mode: FadeMode::None,
            fade_secs: 0,
            fade_dir: FadeDir::Up,
            fade_start: 0,
            fade_end: 0,
            fade_writep: None,
            replay_gain: 0,
            next_replay_gain: 0,
            start_at: 0,
            codec_min_space: 16 * 1024,
            encode: EncodeState::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderPhase {
    Transition,
    Stopped,
    Playing,
    Paused,
}

/// What the renderer last reported it is doing.
#[derive(Debug)]
pub struct RenderState {
    pub state: RenderPhase,
    pub ms_played: u32,
    pub ms_paused: u32,
    pub duration: u32,
    pub track_pause_time: u32,
    pub track_start_time: u32,
    /// Current track index at the renderer, -1 when unknown.
    pub index: i32,
}

impl Default for RenderState {
    fn default() -> Self {
        Self {
            state: RenderPhase::Stopped,
            ms_played: 0,
            ms_paused: 0,
            duration: 0,
            track_pause_time: 0,
            track_start_time: 0,
            index: -1,
        }
    }
}

/// Output buffer + output + render state under one lock.
pub struct OutputZone {
    pub buf: RingBuffer,
    pub output: OutputState,
    pub render: RenderState,
}

/// Per-slot HTTP worker bookkeeping (two slots for gapless handoff).
#[derive(Debug, Default)]
pub struct OutputSlot {
    pub running: bool,
    pub lingering: bool,
    pub index: u16,
    pub token: Option<CancellationToken>,
    pub handle: Option<tokio::task::JoinHandle<()>>,
}

/// The shared heart of one player.
pub struct Pipeline {
    pub config: PlayerConfig,
    pub stream: Mutex<StreamZone>,
    pub output: Mutex<OutputZone>,
    pub decode: Mutex<DecodeZone>,
    pub slots: Mutex<[OutputSlot; 2]>,
    /// Wakes the SlimProto round.
    pub controller: Notify,
    /// Wakes the HTTP workers when fresh audio arrives.
    pub output_wake: Notify,
    /// Token of the current streamer task.
    pub stream_token: Mutex<CancellationToken>,
    running: AtomicBool,
    on: AtomicBool,
}

impl Pipeline {
    pub fn new(config: PlayerConfig, on: bool) -> Self {
        let streambuf_size =
            (config.streambuf_size / (BYTES_PER_FRAME * 3)) * (BYTES_PER_FRAME * 3);
        Self {
            stream: Mutex::new(StreamZone {
                buf: RingBuffer::new(streambuf_size.max(BYTES_PER_FRAME * 3)),
                state: StreamState::default(),
            }),
            output: Mutex::new(OutputZone {
                buf: RingBuffer::new(OUTPUTBUF_IDLE_SIZE),
                output: OutputState::default(),
                render: RenderState::default(),
            }),
            decode: Mutex::new(DecodeZone {
                ctrl: DecodeCtrl::default(),
                codec: None,
            }),
            slots: Mutex::new([OutputSlot::default(), OutputSlot::default()]),
            controller: Notify::new(),
            output_wake: Notify::new(),
            stream_token: Mutex::new(CancellationToken::new()),
            running: AtomicBool::new(true),
            on: AtomicBool::new(on),
            config,
        }
    }

    #[inline]
    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.controller.notify_waiters();
        self.output_wake.notify_waiters();
    }

    #[inline]
    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::Acquire)
    }

    pub fn set_on(&self, on: bool) {
        self.on.store(on, Ordering::Release);
    }

    pub fn wake_controller(&self) {
        self.controller.notify_one();
    }

    pub fn wake_output(&self) {
        self.output_wake.notify_one();
    }
}
