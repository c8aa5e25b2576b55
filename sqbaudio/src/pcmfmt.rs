//! PCM container plumbing: WAV/AIFF header synthesis, the 80-bit extended
//! sample-rate field, sample scaling/packing and the Sony L24 LPCM layout.

use crate::pipeline::BYTES_PER_FRAME;

/// Encodes a sample rate into the AIFF 80-bit extended float field:
/// exponent in the top 16 bits, mantissa below with the leading bit set.
pub fn extended_rate_encode(rate: u32) -> [u8; 10] {
    let mut out = [0u8; 10];
    if rate == 0 {
        return out;
    }
    let lz = rate.leading_zeros();
    let exponent = 16383 + 31 - lz as u16;
    let mantissa = (u64::from(rate)) << (32 + lz);
    out[0..2].copy_from_slice(&exponent.to_be_bytes());
    out[2..10].copy_from_slice(&mantissa.to_be_bytes());
    out
}

/// Decodes the 80-bit extended field using only the top 32 mantissa bits,
/// the same simplification the stream parser applies.
pub fn extended_rate_decode(field: &[u8]) -> u32 {
    let exponent =
        i32::from((u16::from(field[0] & 0x7f) << 8) | u16::from(field[1])) - 16383 - 31;
    let mut rate = u32::from_be_bytes([field[2], field[3], field[4], field[5]]);
    let mut exponent = exponent;
    while exponent < 0 {
        rate >>= 1;
        exponent += 1;
    }
    while exponent > 0 {
        rate <<= 1;
        exponent -= 1;
    }
    rate
}

/// 44-byte canonical WAV header.
pub fn wave_header(channels: u8, sample_size: u8, sample_rate: u32, data_len: u64) -> Vec<u8> {
    let mut h = Vec::with_capacity(44);
    let byte_rate = sample_rate * u32::from(channels) * u32::from(sample_size) / 8;
    let block_align = u16::from(channels) * u16::from(sample_size) / 8;
    h.extend_from_slice(b"RIFF");
    h.extend_from_slice(&((36 + data_len) as u32).to_le_bytes());
    h.extend_from_slice(b"WAVE");
    h.extend_from_slice(b"fmt ");
    h.extend_from_slice(&16u32.to_le_bytes());
    h.extend_from_slice(&1u16.to_le_bytes());
    h.extend_from_slice(&u16::from(channels).to_le_bytes());
    h.extend_from_slice(&sample_rate.to_le_bytes());
    h.extend_from_slice(&byte_rate.to_le_bytes());
    h.extend_from_slice(&block_align.to_le_bytes());
    h.extend_from_slice(&u16::from(sample_size).to_le_bytes());
    h.extend_from_slice(b"data");
    h.extend_from_slice(&(data_len as u32).to_le_bytes());
    h
}

/// 54-byte AIFF header: FORM + COMM(18) + SSND with zero offset/blocksize.
pub fn aiff_header(channels: u8, sample_size: u8, sample_rate: u32, data_len: u64) -> Vec<u8> {
    let mut h = Vec::with_capacity(54);
    let frames = data_len / (u64::from(channels) * u64::from(sample_size) / 8);
    h.extend_from_slice(b"FORM");
    h.extend_from_slice(&((data_len + 8 + 8 + 18 + 8 + 4) as u32).to_be_bytes());
    h.extend_from_slice(b"AIFF");
    h.extend_from_slice(b"COMM");
    h.extend_from_slice(&18u32.to_be_bytes());
    h.extend_from_slice(&u16::from(channels).to_be_bytes());
    h.extend_from_slice(&(frames as u32).to_be_bytes());
    h.extend_from_slice(&u16::from(sample_size).to_be_bytes());
    h.extend_from_slice(&extended_rate_encode(sample_rate));
    h.extend_from_slice(b"SSND");
    h.extend_from_slice(&((data_len + 8) as u32).to_be_bytes());
    h.extend_from_slice(&0u32.to_be_bytes());
    h.extend_from_slice(&0u32.to_be_bytes());
    h
}

/// Scales 32-bit left-justified frames down to the target sample size and
/// endianness. `src` holds native-endian i32 stereo frames; mono collapses
/// to the left channel.
pub fn scale_and_pack(
    dst: &mut Vec<u8>,
    src: &[u8],
    frames: usize,
    channels: u8,
    sample_size: u8,
    little: bool,
) {
    let step = if channels == 1 { 2 } else { 1 };
    let mut samples = src
        .chunks_exact(4)
        .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .step_by(step)
        .take(frames * usize::from(channels));

    match sample_size {
        8 => {
            for _ in 0..frames * usize::from(channels) {
                let s = samples.next().unwrap_or(0);
                let b = (s >> 24) as u8;
                dst.push(if little { b ^ 0x80 } else { b });
            }
        }
        16 => {
            for _ in 0..frames * usize::from(channels) {
                let s = samples.next().unwrap_or(0);
                let v = (s >> 16) as i16;
                if little {
                    dst.extend_from_slice(&v.to_le_bytes());
                } else {
                    dst.extend_from_slice(&v.to_be_bytes());
                }
            }
        }
        24 => {
            for _ in 0..frames * usize::from(channels) {
                let s = samples.next().unwrap_or(0);
                let b = s.to_be_bytes();
                if little {
                    dst.extend_from_slice(&[b[2], b[1], b[0]]);
                } else {
                    dst.extend_from_slice(&[b[0], b[1], b[2]]);
                }
            }
        }
        _ => {
            for _ in 0..frames * usize::from(channels) {
                let s = samples.next().unwrap_or(0);
                if little {
                    dst.extend_from_slice(&s.to_le_bytes());
                } else {
                    dst.extend_from_slice(&s.to_be_bytes());
                }
            }
        }
    }
}

/// Re-interleaves two 24-bit stereo frames into the Sony LPCM byte order:
/// L0T L0M R0T R0M L1T L1M R1T R1M L0B R0B L1B R1B. `src` must hold an even
/// number of 32-bit stereo frames.
pub fn lpcm_pack(dst: &mut Vec<u8>, src: &[u8], channels: u8) {
    debug_assert_eq!(src.len() % (2 * BYTES_PER_FRAME), 0);

    // samples are native-endian i32, most significant 24 bits are audio
    let sample = |i: usize| -> [u8; 4] {
        let c = &src[i * 4..i * 4 + 4];
        i32::from_ne_bytes([c[0], c[1], c[2], c[3]]).to_be_bytes()
    };

    if channels == 2 {
        for pair in 0..src.len() / (2 * BYTES_PER_FRAME) {
            let base = pair * 4;
            let (l0, r0, l1, r1) = (sample(base), sample(base + 1), sample(base + 2), sample(base + 3));
            dst.extend_from_slice(&[l0[0], l0[1], r0[0], r0[1]]);
            dst.extend_from_slice(&[l1[0], l1[1], r1[0], r1[1]]);
            dst.extend_from_slice(&[l0[2], r0[2], l1[2], r1[2]]);
        }
    } else {
        for pair in 0..src.len() / (2 * BYTES_PER_FRAME) {
            let base = pair * 4;
            let (c0, c1) = (sample(base), sample(base + 2));
            dst.extend_from_slice(&[c0[0], c0[1], c1[0], c1[1]]);
            dst.extend_from_slice(&[c0[2], c1[2]]);
        }
    }
}

/// Parsed `fmt `/COMM information lifted from a sniffed WAV/AIFF header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SniffedPcm {
    pub channels: u8,
    pub sample_size: u8,
    pub sample_rate: u32,
    pub little_endian: bool,
    /// Bytes to consume before audio data starts.
    pub audio_offset: usize,
}

/// Sniffs the first bytes of a PCM stream for a RIFF/WAVE or FORM/AIFF
/// container and returns the real format, overriding what LMS declared.
pub fn sniff_container(data: &[u8]) -> Option<SniffedPcm> {
    if data.len() >= 40 && &data[0..4] == b"RIFF" && &data[8..12] == b"WAVE" && &data[12..16] == b"fmt " {
        let fmt_len = u32::from_le_bytes([data[16], data[17], data[18], data[19]]) as usize;
        return Some(SniffedPcm {
            channels: u16::from_le_bytes([data[22], data[23]]) as u8,
            sample_rate: u32::from_le_bytes([data[24], data[25], data[26], data[27]]),
            sample_size: u16::from_le_bytes([data[34], data[35]]) as u8,
            little_endian: true,
            audio_offset: 12 + 8 + fmt_len + 8,
        });
    }

    if data.len() >= 12
        && &data[0..4] == b"FORM"
        && (&data[8..12] == b"AIFF" || &data[8..12] == b"AIFC")
    {
        let mut pos = 12;
        let mut sniffed = SniffedPcm {
            channels: 0,
            sample_size: 0,
            sample_rate: 0,
            little_endian: false,
            audio_offset: 0,
        };
        // chunk headers are 8 bytes, COMM needs 18 more
        while pos + 26 <= data.len() {
            let id = &data[pos..pos + 4];
            let len =
                u32::from_be_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]])
                    as usize;
            if id == b"COMM" {
                sniffed.channels = u16::from_be_bytes([data[pos + 8], data[pos + 9]]) as u8;
                sniffed.sample_size = u16::from_be_bytes([data[pos + 14], data[pos + 15]]) as u8;
                sniffed.sample_rate = extended_rate_decode(&data[pos + 16..pos + 26]);
            }
            if id == b"SSND" {
                let offset =
                    u32::from_be_bytes([data[pos + 8], data[pos + 9], data[pos + 10], data[pos + 11]])
                        as usize;
                sniffed.audio_offset = pos + 8 + 8 + offset;
                return Some(sniffed);
            }
            pos += len + 8;
        }
        return None;
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_rate_round_trip() {
        for rate in [
            8000u32, 11025, 22050, 32000, 44100, 48000, 88200, 96000, 176400, 192000,
        ] {
            let field = extended_rate_encode(rate);
            assert_eq!(extended_rate_decode(&field), rate, "rate {rate}");
        }
    }

    #[test]
    fn wave_header_round_trip() {
        let header = wave_header(2, 16, 44100, 4 * 44100 * 2 * 2);
        assert_eq!(header.len(), 44);
        assert_eq!(&header[0..4], b"RIFF");
        let chunk_size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        assert_eq!(chunk_size as u64, 36 + 4 * 44100 * 2 * 2);

        let sniffed = sniff_container(&header).expect("own header must parse");
        assert_eq!(sniffed.channels, 2);
        assert_eq!(sniffed.sample_size, 16);
        assert_eq!(sniffed.sample_rate, 44100);
        assert_eq!(sniffed.audio_offset, 44);
        assert!(sniffed.little_endian);
    }

    #[test]
    fn aiff_header_round_trip() {
        let data_len = 2 * 3 * 96000;
        let header = aiff_header(2, 24, 96000, data_len);
        assert_eq!(header.len(), 54);

        let mut padded = header.clone();
        padded.extend_from_slice(&[0; 16]);
        let sniffed = sniff_container(&padded).expect("own header must parse");
        assert_eq!(sniffed.channels, 2);
        assert_eq!(sniffed.sample_size, 24);
        assert_eq!(sniffed.sample_rate, 96000);
        assert_eq!(sniffed.audio_offset, 54);
        assert!(!sniffed.little_endian);
    }

    #[test]
    fn scale_16_little_endian() {
        let frames: Vec<u8> = [0x12345678i32, -0x12345678i32, 0x7fffffff, -0x80000000]
            .iter()
            .flat_map(|s| s.to_ne_bytes())
            .collect();
        let mut out = Vec::new();
        scale_and_pack(&mut out, &frames, 2, 2, 16, true);
        assert_eq!(out.len(), 8);
        assert_eq!(&out[0..2], &0x1234i16.to_le_bytes());
        assert_eq!(&out[2..4], &(-0x1235i16).to_le_bytes());
    }

    #[test]
    fn scale_24_big_endian_keeps_top_bytes() {
        let frames: Vec<u8> = [0x11223344i32, 0x55667788u32 as i32]
            .iter()
            .flat_map(|s| s.to_ne_bytes())
            .collect();
        let mut out = Vec::new();
        scale_and_pack(&mut out, &frames, 1, 2, 24, false);
        assert_eq!(out, vec![0x11, 0x22, 0x33, 0x55, 0x66, 0x77]);
    }

    #[test]
    fn lpcm_pack_layout() {
        // L0 R0 L1 R1 with recognisable top/mid/bottom bytes
        let samples: [i32; 4] = [
            0x10203000, // L0: T=10 M=20 B=30
            0x40506000, // R0
            0x70809000u32 as i32, // L1
            0xa0b0c000u32 as i32, // R1
        ];
        let src: Vec<u8> = samples.iter().flat_map(|s| s.to_ne_bytes()).collect();
        let mut out = Vec::new();
        lpcm_pack(&mut out, &src, 2);
        assert_eq!(
            out,
            vec![0x10, 0x20, 0x40, 0x50, 0x70, 0x80, 0xa0, 0xb0, 0x30, 0x60, 0x90, 0xc0]
        );
    }
}
