//! Codec adapters, one module per format family.

pub mod flac;
pub mod flac_thru;
pub mod m4a_thru;
pub mod mp3;
pub mod mp4;
pub mod opus;
pub mod pcm;
pub mod thru;
pub mod vorbis;
