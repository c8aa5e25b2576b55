//! Per-player parameter bundle handed over by the surrounding daemon.
//!
//! File parsing stays outside the core; the types derive `Deserialize` so
//! the host can map its own configuration onto them.

use serde::{Deserialize, Serialize};

/// Content-length strategies for the HTTP response. Positive values are a
/// fake fixed length.
pub const HTTP_NO_LENGTH: i64 = -1;
pub const HTTP_PCM_LENGTH: i64 = -2;
pub const HTTP_CHUNKED: i64 = -3;
pub const HTTP_LARGE: i64 = (u32::MAX - 8192) as i64;

/// 24-bit sample handling toward the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum L24Format {
    #[default]
    Packed,
    PackedLpcm,
    Trunc16,
    Trunc16Pcm,
    UnpackedHigh,
    UnpackedLow,
}

/// STREAMINFO synthesis policy of the FLAC pass-through codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlacHeaderMode {
    No,
    #[default]
    Default,
    Max,
    Adjust,
}

/// ICY metadata injection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IcyMode {
    #[default]
    None,
    Full,
    Text,
}

/// HTTP replay cache backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    #[default]
    Infinite,
    Memory,
    Disk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// HTTP content-length strategy, see the `HTTP_*` constants.
    pub stream_length: i64,
    pub streambuf_size: usize,
    pub outputbuf_size: usize,
    /// Codecs advertised to LMS, comma separated (e.g. "aac,ogg,flc,mp3").
    pub codecs: String,
    /// Output mode string: substring match on "thru"/"pcm"/"flc"/"mp3"/
    /// "null", "flow" for a track-spanning encoder, "r:<rate>", "s:<size>",
    /// "flc:<level>", "mp3:<bitrate>".
    pub mode: String,
    /// Seconds before track end under which STMd is allowed (0 = always).
    pub next_delay: u32,
    /// Accepted raw PCM containers in preference order ("raw,wav,aif").
    pub raw_audio_format: String,
    /// LMS address "host[:port]" or "?" for discovery.
    pub server: String,
    /// Maximum sample rate declared to LMS.
    pub sample_rate: u32,
    pub l24_format: L24Format,
    pub flac_header: FlacHeaderMode,
    pub name: String,
    pub mac: [u8; 6],
    /// Accepted but unused: resampling is not part of this pipeline.
    pub resample_options: String,
    /// Debug dump directory for raw in/out streams, empty to disable.
    pub store_prefix: String,
    /// Cover-art variant suffix appended to artwork URLs.
    pub coverart: String,
    pub cache: CacheMode,
    // runtime-only knobs, set by the host rather than read from its config
    pub use_cli: bool,
    pub set_server: String,
    pub send_icy: IcyMode,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            stream_length: HTTP_CHUNKED,
            streambuf_size: 1024 * 1024,
            outputbuf_size: 4 * 1024 * 1024,
            codecs: "aac,ogg,ops,flc,alc,aif,pcm,mp3".to_string(),
            mode: "thru".to_string(),
            next_delay: 15,
            raw_audio_format: "raw,wav,aif".to_string(),
            server: "?".to_string(),
            sample_rate: 192_000,
            l24_format: L24Format::default(),
            flac_header: FlacHeaderMode::default(),
            name: "SqueezeBridge".to_string(),
            mac: [0x00, 0x04, 0x20, 0x12, 0x34, 0x56],
            resample_options: String::new(),
            store_prefix: String::new(),
            coverart: String::new(),
            cache: CacheMode::default(),
            use_cli: true,
            set_server: String::new(),
            send_icy: IcyMode::None,
        }
    }
}

impl PlayerConfig {
    pub fn mac_string(&self) -> String {
        self.mac
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_formatting() {
        let config = PlayerConfig {
            mac: [0xaa, 0x00, 0x01, 0x02, 0x03, 0xff],
            ..PlayerConfig::default()
        };
        assert_eq!(config.mac_string(), "aa:00:01:02:03:ff");
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: PlayerConfig = serde_json::from_str(r#"{"mode": "flc:5,flow"}"#).unwrap();
        assert_eq!(config.mode, "flc:5,flow");
        assert_eq!(config.streambuf_size, 1024 * 1024);
    }
}
