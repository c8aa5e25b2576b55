//! Mapping between SlimProto codec ids, renderer MIME capabilities, URL
//! extensions and DLNA `contentFeatures` strings.
//!
//! The renderer declares what it accepts as a list of MIME strings (its
//! `ProtocolInfo`); the bridge picks the first acceptable MIME for the codec
//! it is about to emit. A `*` entry on the renderer side accepts anything.

/// Options refining a codec → MIME lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecVariant {
    #[default]
    Plain,
    /// AAC carried in an MP4 container (rather than ADTS).
    AacMp4,
    /// FLAC carried in Ogg.
    FlacOgg,
    /// DSD flavours.
    Dsf,
    Dff,
    Dsd,
    /// Raw PCM with an accepted container list, e.g. "wav,aif".
    PcmContainers(&'static str),
}

fn lookup(mimetypes: &[String], details: Option<&str>, candidates: &[&str]) -> Option<String> {
    for candidate in candidates {
        for mime in mimetypes {
            if mime == "*" || mime.to_ascii_lowercase().contains(&candidate.to_ascii_lowercase()) {
                return Some(match details {
                    Some(details) => format!("{candidate};{details}"),
                    None => (*candidate).to_string(),
                });
            }
        }
    }
    None
}

/// Finds a MIME type the renderer accepts for a codec id.
pub fn mimetype_from_codec(
    codec: char,
    mimetypes: &[String],
    variant: CodecVariant,
) -> Option<String> {
    match codec {
        'm' => lookup(mimetypes, None, &["audio/mp3", "audio/mpeg", "audio/mpeg3"]),
        'w' => lookup(mimetypes, None, &["audio/wma", "audio/x-wma"]),
        'o' => lookup(
            mimetypes,
            Some("codecs=vorbis"),
            &["audio/ogg", "audio/x-ogg", "application/ogg"],
        ),
        'u' => lookup(
            mimetypes,
            Some("codecs=opus"),
            &["audio/ogg", "audio/x-ogg", "application/ogg"],
        ),
        'l' => lookup(mimetypes, None, &["audio/mp4", "audio/m4a"]),
        'a' => {
            if variant == CodecVariant::AacMp4 {
                lookup(mimetypes, None, &["audio/mp4", "audio/m4a", "audio/aac", "audio/x-aac"])
            } else {
                lookup(mimetypes, None, &["audio/aac", "audio/x-aac", "audio/mp4", "audio/m4a"])
            }
        }
        'f' | 'F' => {
            if variant == CodecVariant::FlacOgg {
                lookup(
                    mimetypes,
                    Some("codecs=flac"),
                    &["audio/ogg", "audio/x-ogg", "application/ogg"],
                )
            } else {
                lookup(mimetypes, None, &["audio/flac", "audio/x-flac"])
            }
        }
        'd' => match variant {
            CodecVariant::Dsf => lookup(mimetypes, None, &["audio/dsf", "audio/x-dsf"]),
            CodecVariant::Dff => lookup(mimetypes, None, &["audio/dff", "audio/x-dff"]),
            _ => lookup(mimetypes, None, &["audio/dsd", "audio/x-dsd"]),
        },
        'p' => {
            let containers = match variant {
                CodecVariant::PcmContainers(c) => c,
                _ => "wav,aif",
            };
            for fmt in containers.split(',') {
                let found = if fmt.contains("wav") {
                    lookup(mimetypes, None, &["audio/wav", "audio/x-wav", "audio/wave"])
                } else if fmt.contains("aif") {
                    lookup(
                        mimetypes,
                        None,
                        &["audio/aiff", "audio/x-aiff", "audio/aif", "audio/x-aif"],
                    )
                } else {
                    None
                };
                if found.is_some() {
                    return found;
                }
            }
            None
        }
        _ => None,
    }
}

/// Finds a MIME type for raw PCM with explicit parameters, trying
/// `audio/L<n>;rate=<r>;channels=<c>` first, then the container formats
/// listed in `raw_audio_format` ("raw,wav,aif" order is honoured).
///
/// Returns the MIME and the (possibly truncated) sample size.
pub fn mimetype_from_pcm(
    sample_size: u8,
    truncable: bool,
    sample_rate: u32,
    channels: u8,
    mimetypes: &[String],
    raw_audio_format: &str,
) -> Option<(String, u8)> {
    for fmt in raw_audio_format.split(',') {
        if fmt.contains("raw") {
            let mut size = sample_size;
            loop {
                let family = format!("audio/L{size}");
                let rate = format!("rate={sample_rate}");
                let chan = format!("channels={channels}");
                for mime in mimetypes {
                    if mime == "*"
                        || (mime.contains(&family)
                            && (!mime.contains("rate=") || mime.contains(&rate))
                            && (!mime.contains("channels=") || mime.contains(&chan)))
                    {
                        return Some((format!("{family};{rate};{chan}"), size));
                    }
                }
                if size == 24 && truncable {
                    size = 16;
                } else {
                    break;
                }
            }
        } else if fmt.contains("wav") {
            if let Some(mime) =
                lookup(mimetypes, None, &["audio/wav", "audio/x-wav", "audio/wave"])
            {
                return Some((mime, sample_size));
            }
        } else if fmt.contains("aif") {
            if let Some(mime) = lookup(
                mimetypes,
                None,
                &["audio/aiff", "audio/x-aiff", "audio/aif", "audio/x-aif"],
            ) {
                return Some((mime, sample_size));
            }
        }
    }
    None
}

/// Collapses a MIME type into the output format char used by the output
/// engine: 'w'av, 'i' aiff, 'p'cm, 'f'lac, 'm'p3, 'o'gg, 'a'ac, '4' mp4,
/// 'd'sd.
pub fn mimetype_to_format(mimetype: &str) -> char {
    let tail = mimetype
        .strip_prefix("audio/x-")
        .or_else(|| mimetype.strip_prefix("audio/"))
        .or_else(|| mimetype.strip_prefix("application/"))
        .unwrap_or(mimetype);

    if tail.contains("wav") {
        'w'
    } else if tail.contains("aif") {
        'i'
    } else if tail.starts_with('L') || tail.starts_with('*') {
        'p'
    } else if tail.contains("flac") || tail.contains("flc") {
        'f'
    } else if tail.contains("mp3") || tail.contains("mpeg") {
        'm'
    } else if tail.contains("ogg") {
        'o'
    } else if tail.contains("aac") {
        'a'
    } else if tail.contains("mp4") || tail.contains("m4a") {
        '4'
    } else if tail.contains("dsd") || tail.contains("dsf") || tail.contains("dff") {
        'd'
    } else {
        '\0'
    }
}

/// URL extension for the bridge resource, derived from the MIME type.
pub fn mimetype_to_ext(mimetype: &str) -> &'static str {
    if mimetype.starts_with('*') || mimetype.starts_with("audio/L") {
        return "pcm";
    }
    let tail = match mimetype
        .strip_prefix("audio/x-")
        .or_else(|| mimetype.strip_prefix("audio/"))
        .or_else(|| mimetype.strip_prefix("application/"))
    {
        Some(tail) => tail,
        None => return "",
    };

    if tail.starts_with("wav") {
        "wav"
    } else if tail.starts_with("flac") {
        "flac"
    } else if tail.starts_with("flc") {
        "flc"
    } else if tail.starts_with("mp3") || tail.starts_with("mpeg") {
        "mp3"
    } else if tail.starts_with("ogg") {
        if mimetype.contains("codecs=opus") {
            "ops"
        } else {
            "ogg"
        }
    } else if tail.starts_with("aif") {
        "aif"
    } else if tail.starts_with("aac") {
        "aac"
    } else if tail.starts_with("mp4") {
        "mp4"
    } else if tail.starts_with("m4a") {
        "m4a"
    } else if tail.starts_with("dsd") {
        "dsd"
    } else if tail.starts_with("dsf") {
        "dsf"
    } else if tail.starts_with("dff") {
        "dff"
    } else {
        "nil"
    }
}

const FLAG_S0_INCREASE: u32 = 1 << 27;
const FLAG_SN_INCREASE: u32 = 1 << 26;
const FLAG_STREAMING_TRANSFER: u32 = 1 << 24;
const FLAG_BACKGROUND_TRANSFER: u32 = 1 << 22;
const FLAG_CONNECTION_STALL: u32 = 1 << 21;
const FLAG_DLNA_V15: u32 = 1 << 20;
const FLAG_BYTE_BASED_SEEK: u32 = 1 << 29;

/// Builds the `contentFeatures.dlna.org` value for a given output format.
///
/// `full_cache` advertises random access (OP=01) over the whole resource;
/// without it only limited byte-based seek (FLAGS b29) is claimed. `live`
/// adds S0-increase because the head of a live stream is lost.
pub fn format_to_dlna(format: char, full_cache: bool, live: bool) -> String {
    let pn = match format {
        'm' => "DLNA.ORG_PN=MP3;",
        'a' | 'A' => "DLNA.ORG_PN=AAC_ADTS;",
        'p' => "DLNA.ORG_PN=LPCM;",
        _ => "",
    };

    let op = if full_cache { 1 } else { 0 };
    let mut flags = FLAG_STREAMING_TRANSFER
        | FLAG_BACKGROUND_TRANSFER
        | FLAG_CONNECTION_STALL
        | FLAG_DLNA_V15
        | FLAG_SN_INCREASE;
    if live {
        flags |= FLAG_S0_INCREASE;
    }
    if !full_cache {
        flags |= FLAG_BYTE_BASED_SEEK;
    }

    format!("{pn}DLNA.ORG_OP={op:02};DLNA.ORG_CI=0;DLNA.ORG_FLAGS={flags:08x}000000000000000000000000")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn codec_lookup_prefers_order() {
        let mimetypes = caps(&["audio/mpeg", "audio/flac"]);
        assert_eq!(
            mimetype_from_codec('m', &mimetypes, CodecVariant::Plain).as_deref(),
            Some("audio/mpeg")
        );
        assert_eq!(
            mimetype_from_codec('f', &mimetypes, CodecVariant::Plain).as_deref(),
            Some("audio/flac")
        );
        assert!(mimetype_from_codec('o', &mimetypes, CodecVariant::Plain).is_none());
    }

    #[test]
    fn wildcard_accepts_anything() {
        let mimetypes = caps(&["*"]);
        assert_eq!(
            mimetype_from_codec('u', &mimetypes, CodecVariant::Plain).as_deref(),
            Some("audio/ogg;codecs=opus")
        );
    }

    #[test]
    fn pcm_raw_match_and_truncation() {
        let mimetypes = caps(&["audio/L16;rate=44100;channels=2"]);
        let (mime, size) =
            mimetype_from_pcm(24, true, 44100, 2, &mimetypes, "raw,wav").unwrap();
        assert_eq!(mime, "audio/L16;rate=44100;channels=2");
        assert_eq!(size, 16);

        let mimetypes = caps(&["audio/wav"]);
        let (mime, size) =
            mimetype_from_pcm(24, true, 44100, 2, &mimetypes, "raw,wav").unwrap();
        assert_eq!(mime, "audio/wav");
        assert_eq!(size, 24);
    }

    #[test]
    fn format_and_ext_mapping() {
        assert_eq!(mimetype_to_format("audio/wav"), 'w');
        assert_eq!(mimetype_to_format("audio/x-aiff"), 'i');
        assert_eq!(mimetype_to_format("audio/L24;rate=96000;channels=2"), 'p');
        assert_eq!(mimetype_to_format("audio/flac"), 'f');
        assert_eq!(mimetype_to_format("audio/mpeg"), 'm');
        assert_eq!(mimetype_to_ext("audio/ogg;codecs=opus"), "ops");
        assert_eq!(mimetype_to_ext("audio/x-flac"), "flac");
        assert_eq!(mimetype_to_ext("audio/L16;rate=44100;channels=2"), "pcm");
        assert_eq!(mimetype_to_ext("video/avi"), "");
    }

    #[test]
    fn dlna_features_shape() {
        let features = format_to_dlna('m', true, false);
        assert!(features.starts_with("DLNA.ORG_PN=MP3;DLNA.ORG_OP=01;DLNA.ORG_CI=0;"));
        assert!(features.contains("DLNA.ORG_FLAGS=0570"));

        let features = format_to_dlna('f', false, true);
        assert!(features.contains("DLNA.ORG_OP=00"));
        // byte-based seek + S0 increase
        assert!(features.contains("DLNA.ORG_FLAGS=2d70"));
    }
}
