//! Track metadata assembly over the CLI side-channel.
//!
//! SlimProto itself carries no artist/title/artwork; those come from a
//! `status` query whose reply is a flat percent-encoded tag list.

use sqbmeta::TrackMetadata;
use sqbslim::cli_find_tag;
use sqbutils::hash32;
use tracing::{debug, warn};

/// Tags requested from LMS, same set the legacy bridge asks for.
pub const STATUS_TAGS: &str = "tags:xcfldatgrKNoITH";

/// Hash over the displayable fields, used to detect live-stream updates.
pub fn metadata_hash(metadata: &TrackMetadata) -> u32 {
    hash32(metadata.artist.as_deref())
        ^ hash32(metadata.title.as_deref())
        ^ hash32(metadata.artwork.as_deref())
}

/// Parses the `status` reply into metadata for the track `offset` entries
/// after the current one. `server` ("ip:port") expands relative artwork.
pub fn parse_status_reply(
    reply: &str,
    offset: i32,
    server: &str,
    coverart: &str,
) -> TrackMetadata {
    let mut metadata = TrackMetadata::new();
    let mut offset = offset;
    let seeking = offset == 0;

    // repeating webradio segments report their period as a duration
    if let Some(repeating) = cli_find_tag(reply, "repeating_stream") {
        offset = 0;
        metadata.repeating = repeating.parse::<i32>().unwrap_or(0) * 1000;
        metadata.duration = metadata.repeating.max(0) as u32;
    }

    if let Some(index) = cli_find_tag(reply, "playlist_cur_index") {
        metadata.index = (index.parse::<i32>().unwrap_or(0) + offset).max(0) as u32;
    }
    if let Some(tracks) = cli_find_tag(reply, "playlist_tracks") {
        if let Ok(count) = tracks.parse::<u32>() {
            if count > 0 {
                metadata.index %= count;
            }
        }
    }

    // narrow the reply down to the entry of the wanted playlist index
    let marker = format!("playlist%20index%3a{} ", metadata.index);
    let Some(at) = reply.to_ascii_lowercase().find(&marker.to_ascii_lowercase()) else {
        warn!("track not found {}", metadata.index);
        metadata.apply_defaults();
        return metadata;
    };
    let entry = &reply[at..];

    metadata.title = cli_find_tag(entry, "title");
    metadata.artist = cli_find_tag(entry, "artist");
    metadata.album = cli_find_tag(entry, "album");
    metadata.genre = cli_find_tag(entry, "genre");
    metadata.remote_title = cli_find_tag(entry, "remote_title");
    metadata.artwork = cli_find_tag(entry, "artwork_url");

    if metadata.duration == 0 {
        if let Some(duration) = cli_find_tag(entry, "duration") {
            metadata.duration = (duration.parse::<f64>().unwrap_or(0.0) * 1000.0) as u32;
        }
    }

    // when the query describes the playing track, report what remains
    if seeking && metadata.duration != 0 {
        if let Some(time) = cli_find_tag(reply, "time") {
            let played = (time.parse::<f64>().unwrap_or(0.0) * 1000.0) as u32;
            metadata.duration = metadata.duration.saturating_sub(played);
        }
    }
    metadata.live_duration = metadata.duration;

    if let Some(bitrate) = cli_find_tag(entry, "bitrate") {
        metadata.bitrate = bitrate
            .split_whitespace()
            .next()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
    }
    if let Some(size) = cli_find_tag(entry, "samplesize") {
        metadata.sample_size = size.parse().unwrap_or(0);
    } else if let Some(kind) = cli_find_tag(entry, "type") {
        if kind.eq_ignore_ascii_case("mp3") {
            metadata.sample_size = 16;
        }
    }
    if let Some(rate) = cli_find_tag(entry, "samplerate") {
        metadata.sample_rate = rate.parse().unwrap_or(0);
    }
    if let Some(channels) = cli_find_tag(entry, "channels") {
        metadata.channels = channels.parse().unwrap_or(0);
    }
    if let Some(track) = cli_find_tag(entry, "tracknum") {
        metadata.track = track.parse().unwrap_or(0);
    }
    if let Some(remote) = cli_find_tag(entry, "remote") {
        metadata.remote = remote == "1";
    }

    // remote_title without repetition means webradio: no finite duration
    if metadata.remote_title.is_some() && metadata.repeating == -1 {
        metadata.duration = 0;
    }

    if metadata.artwork.as_deref().unwrap_or("").is_empty() {
        metadata.artwork = cli_find_tag(entry, "coverid").map(|coverid| {
            format!("http://{server}/music/{coverid}/cover_{coverart}.jpg")
        });
    }

    // relative artwork paths become absolute on the LMS web port
    if let Some(artwork) = metadata.artwork.clone() {
        if !artwork.starts_with("http") {
            let trimmed = artwork.strip_prefix('/').unwrap_or(&artwork);
            metadata.artwork = Some(format!("http://{server}/{trimmed}"));
        }
    }

    metadata.apply_defaults();
    debug!(
        "idx {} artist:{:?} title:{:?} duration:{}",
        metadata.index, metadata.artist, metadata.title, metadata.duration
    );
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPLY: &str = "aa%3abb status - 1 tags%3axcfldatgrKNoITH \
        player_name%3aKitchen playlist_cur_index%3a2 playlist_tracks%3a10 time%3a12.5 \
        playlist%20index%3a2 title%3aBlue%20Train artist%3aJohn%20Coltrane album%3aBlue%20Train \
        genre%3aJazz duration%3a643.2 bitrate%3a850 samplesize%3a16 samplerate%3a44100 \
        channels%3a2 tracknum%3a1 coverid%3a1a2b3c \
        playlist%20index%3a3 title%3aMoment%27s%20Notice artist%3aJohn%20Coltrane";

    #[test]
    fn parses_current_track() {
        let metadata = parse_status_reply(REPLY, 0, "10.0.0.2:9000", "");
        assert_eq!(metadata.index, 2);
        assert_eq!(metadata.title.as_deref(), Some("Blue Train"));
        assert_eq!(metadata.artist.as_deref(), Some("John Coltrane"));
        assert_eq!(metadata.genre.as_deref(), Some("Jazz"));
        // 643.2s declared minus 12.5s played
        assert_eq!(metadata.duration, 643_200 - 12_500);
        assert_eq!(metadata.sample_rate, 44100);
        assert_eq!(metadata.sample_size, 16);
        assert_eq!(metadata.bitrate, 850);
        assert_eq!(
            metadata.artwork.as_deref(),
            Some("http://10.0.0.2:9000/music/1a2b3c/cover_.jpg")
        );
    }

    #[test]
    fn parses_next_track_with_offset() {
        let metadata = parse_status_reply(REPLY, 1, "10.0.0.2:9000", "");
        assert_eq!(metadata.index, 3);
        assert_eq!(metadata.title.as_deref(), Some("Moment's Notice"));
        // next track keeps its full (unknown here) duration
        assert_eq!(metadata.duration, 0);
    }

    #[test]
    fn missing_track_falls_back_to_defaults() {
        let metadata = parse_status_reply("playlist_cur_index%3a9", 0, "server", "");
        assert_eq!(metadata.title.as_deref(), Some("[LMS to UPnP]"));
        assert_eq!(metadata.artist.as_deref(), Some("[no artist]"));
    }

    #[test]
    fn hash_tracks_display_fields() {
        let a = parse_status_reply(REPLY, 0, "server", "");
        let b = parse_status_reply(REPLY, 1, "server", "");
        assert_ne!(metadata_hash(&a), metadata_hash(&b));
        assert_eq!(metadata_hash(&a), metadata_hash(&a));
    }
}
