//! SlimProto message layouts.
//!
//! Server→client messages come framed as a 16-bit big-endian length, a
//! 4-byte ASCII opcode and an opcode-specific body. Client→server packets
//! carry the opcode first and a 32-bit big-endian length instead; the
//! field layouts match the legacy Slim hardware players bit for bit.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::warn;

/// Largest accepted control message, headers included.
pub const MAX_MESSAGE: usize = 4096;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("slimproto packet too big: {0}")]
    Oversized(usize),
    #[error("truncated {0} message")]
    Truncated(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrmCommand {
    Start,
    Pause,
    Unpause,
    Stop,
    Flush,
    Status,
    Skip,
    Unknown(u8),
}

impl From<u8> for StrmCommand {
    fn from(byte: u8) -> Self {
        match byte {
            b's' => StrmCommand::Start,
            b'p' => StrmCommand::Pause,
            b'u' => StrmCommand::Unpause,
            b'q' => StrmCommand::Stop,
            b'f' => StrmCommand::Flush,
            b't' => StrmCommand::Status,
            b'a' => StrmCommand::Skip,
            other => StrmCommand::Unknown(other),
        }
    }
}

/// `strm` body: the playback command plus the stream description and the
/// HTTP request headers to replay at the origin.
#[derive(Debug, Clone)]
pub struct StrmMessage {
    pub command: StrmCommand,
    pub autostart: u8,
    pub format: u8,
    pub pcm_sample_size: u8,
    pub pcm_sample_rate: u8,
    pub pcm_channels: u8,
    pub pcm_endianness: u8,
    /// KBytes of input before playback may start.
    pub threshold: u8,
    pub spdif_enable: u8,
    /// Fade duration in seconds.
    pub transition_period: u8,
    /// Fade type char ('0'..'4').
    pub transition_type: u8,
    /// Bit 0x20 requests TLS toward the origin.
    pub flags: u8,
    pub output_threshold: u8,
    /// Replay gain 16.16, or a timestamp for 't'/'p'/'u' commands.
    pub replay_gain: u32,
    pub server_port: u16,
    /// 0.0.0.0 means "stream from the control server".
    pub server_ip: Ipv4Addr,
    pub header: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum ServerMessage {
    Strm(StrmMessage),
    /// Metadata interval follow-up for autostart 2/3 streams.
    Cont { metaint: u32 },
    /// Late codec declaration after a `strm s` with format '?'.
    Codc {
        format: u8,
        pcm_sample_size: u8,
        pcm_sample_rate: u8,
        pcm_channels: u8,
        pcm_endianness: u8,
    },
    Aude { enable_playback: bool, enable_spdif: bool },
    Audg { gain_left: u32, gain_right: u32, adjust: bool },
    /// `setd` id 0 with no payload: the server asks for our name.
    QueryName,
    /// `setd` id 0 with payload: the server renames us.
    SetName(String),
    Serv { server_ip: Ipv4Addr, sync_group: Option<String> },
    Ledc,
    Vers(String),
    Unknown([u8; 4]),
}

/// Reads one framed message from the control socket.
pub async fn read_message<R: AsyncRead + Unpin>(socket: &mut R) -> Result<ServerMessage, ProtoError> {
    let length = socket.read_u16().await? as usize;
    if length > MAX_MESSAGE {
        return Err(ProtoError::Oversized(length));
    }
    let mut body = vec![0u8; length];
    socket.read_exact(&mut body).await?;
    Ok(parse_message(&body))
}

/// Parses an unframed message (opcode + body).
pub fn parse_message(body: &[u8]) -> ServerMessage {
    if body.len() < 4 {
        return ServerMessage::Unknown(*b"????");
    }
    let opcode: [u8; 4] = [body[0], body[1], body[2], body[3]];
    let payload = &body[4..];

    match &opcode {
        b"strm" => parse_strm(payload),
        b"cont" => {
            let metaint = if payload.len() >= 4 {
                u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
            } else {
                0
            };
            ServerMessage::Cont { metaint }
        }
        b"codc" => {
            if payload.len() < 5 {
                return ServerMessage::Unknown(opcode);
            }
            ServerMessage::Codc {
                format: payload[0],
                pcm_sample_size: payload[1],
                pcm_sample_rate: payload[2],
                pcm_channels: payload[3],
                pcm_endianness: payload[4],
            }
        }
        b"aude" => ServerMessage::Aude {
            enable_playback: payload.first().copied().unwrap_or(0) != 0,
            enable_spdif: payload.get(1).copied().unwrap_or(0) != 0,
        },
        b"audg" => {
            if payload.len() < 9 {
                return ServerMessage::Unknown(opcode);
            }
            ServerMessage::Audg {
                gain_left: u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
                gain_right: u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
                adjust: payload[8] != 0,
            }
        }
        b"setd" => {
            match payload.first() {
                // id 0 is the player name
                Some(0) if payload.len() == 1 => ServerMessage::QueryName,
                Some(0) => {
                    let name = payload[1..]
                        .split(|b| *b == 0)
                        .next()
                        .unwrap_or(&[]);
                    ServerMessage::SetName(String::from_utf8_lossy(name).into_owned())
                }
                _ => ServerMessage::Unknown(opcode),
            }
        }
        b"serv" => {
            if payload.len() < 4 {
                return ServerMessage::Unknown(opcode);
            }
            let server_ip = Ipv4Addr::new(payload[0], payload[1], payload[2], payload[3]);
            let sync_group = if payload.len() >= 14 {
                Some(String::from_utf8_lossy(&payload[4..14]).into_owned())
            } else {
                None
            };
            ServerMessage::Serv { server_ip, sync_group }
        }
        b"ledc" => ServerMessage::Ledc,
        b"vers" => ServerMessage::Vers(String::from_utf8_lossy(payload).into_owned()),
        _ => {
            warn!("unhandled opcode {}", String::from_utf8_lossy(&opcode));
            ServerMessage::Unknown(opcode)
        }
    }
}

fn parse_strm(payload: &[u8]) -> ServerMessage {
    if payload.len() < 24 {
        return ServerMessage::Unknown(*b"strm");
    }
    ServerMessage::Strm(StrmMessage {
        command: StrmCommand::from(payload[0]),
        autostart: payload[1],
        format: payload[2],
        pcm_sample_size: payload[3],
        pcm_sample_rate: payload[4],
        pcm_channels: payload[5],
        pcm_endianness: payload[6],
        threshold: payload[7],
        spdif_enable: payload[8],
        transition_period: payload[9],
        transition_type: payload[10],
        flags: payload[11],
        output_threshold: payload[12],
        replay_gain: u32::from_be_bytes([payload[14], payload[15], payload[16], payload[17]]),
        server_port: u16::from_be_bytes([payload[18], payload[19]]),
        server_ip: Ipv4Addr::new(payload[20], payload[21], payload[22], payload[23]),
        header: payload[24..].to_vec(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatEvent {
    /// Timestamp echo reply.
    Timer,
    /// Codec connected.
    Connect,
    Flushed,
    /// Buffer threshold reached, ready to play.
    BufferReady,
    TrackStarted,
    /// Decoder drained, the next track may be pushed.
    DecodeReady,
    /// Output underrun, the track ended.
    Underrun,
    Overrun,
    NotSupported,
    Paused,
    Resumed,
}

impl StatEvent {
    pub fn code(self) -> &'static [u8; 4] {
        match self {
            StatEvent::Timer => b"STMt",
            StatEvent::Connect => b"STMc",
            StatEvent::Flushed => b"STMf",
            StatEvent::BufferReady => b"STMl",
            StatEvent::TrackStarted => b"STMs",
            StatEvent::DecodeReady => b"STMd",
            StatEvent::Underrun => b"STMu",
            StatEvent::Overrun => b"STMo",
            StatEvent::NotSupported => b"STMn",
            StatEvent::Paused => b"STMp",
            StatEvent::Resumed => b"STMr",
        }
    }
}

/// Status snapshot carried by every STAT heartbeat.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatData {
    pub stream_buffer_size: u32,
    pub stream_buffer_fullness: u32,
    pub bytes_received: u64,
    pub jiffies: u32,
    pub output_buffer_size: u32,
    pub output_buffer_fullness: u32,
    pub elapsed_seconds: u32,
    pub elapsed_milliseconds: u32,
    pub voltage: u16,
    /// Echoed in server byte order, never reinterpreted.
    pub server_timestamp: u32,
}

/// Builders for client→server packets.
pub struct ClientPacket;

impl ClientPacket {
    fn frame(opcode: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut out = BytesMut::with_capacity(8 + body.len());
        out.put_slice(opcode);
        out.put_u32(body.len() as u32);
        out.put_slice(body);
        out.to_vec()
    }

    /// HELO: deviceid 12 (squeezeplay), revision 0, the reconnect bit in
    /// the wlan channel list and the capability string as trailing data.
    pub fn helo(mac: [u8; 6], reconnect: bool, bytes_received: u64, capabilities: &str) -> Vec<u8> {
        let mut body = BytesMut::with_capacity(36 + capabilities.len());
        body.put_u8(12);
        body.put_u8(0);
        body.put_slice(&mac);
        body.put_slice(&[0u8; 16]); // uuid
        body.put_u16(if reconnect { 0x4000 } else { 0x0000 });
        body.put_u64(bytes_received);
        body.put_slice(b"EN"); // language
        body.put_slice(capabilities.as_bytes());
        Self::frame(b"HELO", &body)
    }

    pub fn stat(event: StatEvent, data: &StatData) -> Vec<u8> {
        let mut body = BytesMut::with_capacity(53);
        body.put_slice(event.code());
        body.put_u8(0); // num_crlf
        body.put_u8(0); // mas_initialized
        body.put_u8(0); // mas_mode
        body.put_u32(data.stream_buffer_size);
        body.put_u32(data.stream_buffer_fullness);
        body.put_u64(data.bytes_received);
        body.put_u16(0xffff); // signal strength
        body.put_u32(data.jiffies);
        body.put_u32(data.output_buffer_size);
        body.put_u32(data.output_buffer_fullness);
        body.put_u32(data.elapsed_seconds);
        body.put_u16(data.voltage);
        body.put_u32(data.elapsed_milliseconds);
        body.put_u32(data.server_timestamp);
        body.put_u16(0); // error code
        Self::frame(b"STAT", &body)
    }

    pub fn dsco(reason: u8) -> Vec<u8> {
        Self::frame(b"DSCO", &[reason])
    }

    /// Origin response headers forwarded to LMS.
    pub fn resp(headers: &[u8]) -> Vec<u8> {
        Self::frame(b"RESP", headers)
    }

    /// In-band ICY metadata forwarded to LMS.
    pub fn meta(metadata: &[u8]) -> Vec<u8> {
        Self::frame(b"META", metadata)
    }

    /// Player name echo/confirmation (SETD id 0).
    pub fn setd_name(name: &str) -> Vec<u8> {
        let mut body = BytesMut::with_capacity(1 + name.len() + 1);
        body.put_u8(0);
        body.put_slice(name.as_bytes());
        body.put_u8(0);
        Self::frame(b"SETD", &body)
    }
}

/// Parses a framed message out of an in-memory buffer (length prefix
/// included); used by tests and the reconnect path.
pub fn split_frame(buf: &mut BytesMut) -> Option<ServerMessage> {
    if buf.len() < 2 {
        return None;
    }
    let length = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if buf.len() < 2 + length {
        return None;
    }
    buf.advance(2);
    let body = buf.split_to(length);
    Some(parse_message(&body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strm_body(command: u8, header: &[u8]) -> Vec<u8> {
        let mut body = b"strm".to_vec();
        body.push(command);
        body.push(b'1'); // autostart
        body.push(b'f'); // format
        body.extend_from_slice(&[b'1', b'3', b'2', b'1']); // pcm params
        body.push(10); // threshold (KB)
        body.push(0); // spdif
        body.push(5); // transition period
        body.push(b'1'); // transition type: crossfade
        body.push(0x20); // flags: TLS
        body.push(0); // output threshold
        body.push(0); // reserved
        body.extend_from_slice(&0x0001_0000u32.to_be_bytes()); // replay gain
        body.extend_from_slice(&9000u16.to_be_bytes()); // server port
        body.extend_from_slice(&[192, 168, 1, 10]); // server ip
        body.extend_from_slice(header);
        body
    }

    #[test]
    fn parses_strm_start() {
        let header = b"GET /stream.mp3 HTTP/1.0\r\n\r\n";
        let message = parse_message(&strm_body(b's', header));
        let ServerMessage::Strm(strm) = message else {
            panic!("expected strm");
        };
        assert_eq!(strm.command, StrmCommand::Start);
        assert_eq!(strm.autostart, b'1');
        assert_eq!(strm.format, b'f');
        assert_eq!(strm.pcm_sample_rate, b'3');
        assert_eq!(strm.threshold, 10);
        assert_eq!(strm.transition_period, 5);
        assert_eq!(strm.transition_type, b'1');
        assert_eq!(strm.flags & 0x20, 0x20);
        assert_eq!(strm.replay_gain, 0x0001_0000);
        assert_eq!(strm.server_port, 9000);
        assert_eq!(strm.server_ip, Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(strm.header, header);
    }

    #[test]
    fn parses_setd_name_round_trip() {
        let mut body = b"setd".to_vec();
        body.push(0);
        assert!(matches!(parse_message(&body), ServerMessage::QueryName));

        body.extend_from_slice(b"Kitchen\0");
        let ServerMessage::SetName(name) = parse_message(&body) else {
            panic!("expected SetName");
        };
        assert_eq!(name, "Kitchen");
    }

    #[test]
    fn parses_serv_with_sync_group() {
        let mut body = b"serv".to_vec();
        body.extend_from_slice(&[10, 0, 0, 2]);
        body.extend_from_slice(b"0123456789");
        let ServerMessage::Serv { server_ip, sync_group } = parse_message(&body) else {
            panic!("expected serv");
        };
        assert_eq!(server_ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(sync_group.as_deref(), Some("0123456789"));
    }

    #[test]
    fn helo_layout() {
        let packet = ClientPacket::helo([1, 2, 3, 4, 5, 6], true, 0x1_0000_0001, "Model=squeezelite");
        assert_eq!(&packet[0..4], b"HELO");
        let length = u32::from_be_bytes(packet[4..8].try_into().unwrap()) as usize;
        assert_eq!(length, packet.len() - 8);
        assert_eq!(packet[8], 12); // deviceid
        assert_eq!(packet[9], 0); // revision
        assert_eq!(&packet[10..16], &[1, 2, 3, 4, 5, 6]);
        // reconnect flag in the wlan channel list
        assert_eq!(&packet[32..34], &[0x40, 0x00]);
        assert_eq!(
            u64::from_be_bytes(packet[34..42].try_into().unwrap()),
            0x1_0000_0001
        );
        assert!(packet.ends_with(b"Model=squeezelite"));
    }

    #[test]
    fn stat_layout() {
        let data = StatData {
            stream_buffer_size: 0x100,
            stream_buffer_fullness: 0x80,
            bytes_received: 0x12345678,
            jiffies: 1000,
            output_buffer_size: 0x200,
            output_buffer_fullness: 0x40,
            elapsed_seconds: 3,
            elapsed_milliseconds: 3200,
            voltage: 0,
            server_timestamp: 0xdeadbeef,
        };
        let packet = ClientPacket::stat(StatEvent::TrackStarted, &data);
        assert_eq!(&packet[0..4], b"STAT");
        let length = u32::from_be_bytes(packet[4..8].try_into().unwrap()) as usize;
        assert_eq!(length, 53);
        assert_eq!(packet.len(), 8 + 53);
        assert_eq!(&packet[8..12], b"STMs");
        // stream buffer size at body offset 7
        assert_eq!(
            u32::from_be_bytes(packet[15..19].try_into().unwrap()),
            0x100
        );
        // elapsed ms at body offset 43
        assert_eq!(
            u32::from_be_bytes(packet[51..55].try_into().unwrap()),
            3200
        );
    }

    #[test]
    fn frame_splitting() {
        let mut buf = BytesMut::new();
        let body = strm_body(b't', &[]);
        buf.put_u16(body.len() as u16);
        buf.put_slice(&body);
        buf.put_u16(9999); // trailing partial frame

        let message = split_frame(&mut buf).expect("one full frame");
        assert!(matches!(
            message,
            ServerMessage::Strm(StrmMessage {
                command: StrmCommand::Status,
                ..
            })
        ));
        assert!(split_frame(&mut buf).is_none());
    }
}
