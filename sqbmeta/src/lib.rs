//! Track metadata as assembled from the LMS CLI `status` reply.

use serde::{Deserialize, Serialize};

/// Metadata for one playlist entry. Durations are milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub artist: Option<String>,
    pub album: Option<String>,
    pub title: Option<String>,
    pub remote_title: Option<String>,
    pub artwork: Option<String>,
    pub genre: Option<String>,
    pub track: u32,
    pub index: u32,
    pub duration: u32,
    pub live_duration: u32,
    pub size: u32,
    pub sample_rate: u32,
    pub sample_size: u8,
    pub channels: u8,
    pub bitrate: u32,
    pub remote: bool,
    /// Period of a repeating live stream in ms, -1 when not repeating.
    pub repeating: i32,
}

impl TrackMetadata {
    pub fn new() -> Self {
        Self {
            repeating: -1,
            ..Self::default()
        }
    }

    /// Fills the display fields a renderer always expects.
    pub fn apply_defaults(&mut self) {
        if self.title.as_deref().unwrap_or("").is_empty() {
            self.title = Some("[LMS to UPnP]".to_string());
        }
        if self.album.as_deref().unwrap_or("").is_empty() {
            self.album = Some("[no album]".to_string());
        }
        if self.artist.as_deref().unwrap_or("").is_empty() {
            self.artist = Some("[no artist]".to_string());
        }
        if self.genre.as_deref().unwrap_or("").is_empty() {
            self.genre = Some("[no genre]".to_string());
        }
    }

    pub fn artist_or_empty(&self) -> &str {
        self.artist.as_deref().unwrap_or("")
    }

    pub fn title_or_empty(&self) -> &str {
        self.title.as_deref().unwrap_or("")
    }

    pub fn artwork_or_empty(&self) -> &str {
        self.artwork.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_empty_fields_only() {
        let mut meta = TrackMetadata::new();
        meta.title = Some("Song".to_string());
        meta.apply_defaults();
        assert_eq!(meta.title.as_deref(), Some("Song"));
        assert_eq!(meta.artist.as_deref(), Some("[no artist]"));
        assert_eq!(meta.repeating, -1);
    }
}
