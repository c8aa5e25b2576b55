//! One virtual player: the SlimProto session toward LMS wired to the
//! audio pipeline, plus the renderer notification entry points.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use sqbaudio::config::PlayerConfig;
use sqbaudio::output::set_icy;
use sqbaudio::pipeline::{
    DecodePhase, DisconnectCode, FadeMode, OutputPhase, Pipeline, RenderPhase, StreamPhase,
    MAX_HEADER, METADATA_UPDATE_TIME,
};
use sqbaudio::{codec_open, decode_flush, stream_disconnect, stream_file, stream_sock};
use sqbhttp::{output_abort, output_flush, output_start};
use sqbmeta::TrackMetadata;
use sqbmime::{mimetype_from_codec, mimetype_from_pcm, mimetype_to_ext, mimetype_to_format, CodecVariant};
use sqbslim::proto::{
    split_frame, ClientPacket, ServerMessage, StatData, StatEvent, StrmCommand, StrmMessage,
};
use sqbslim::{discover_once, CliClient, DiscoveredServer, SLIM_PORT};
use sqbutils::now_ms;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::events::{RendererEvents, SqEvent, SqNotify, TrackInfo};
use crate::metadata::{metadata_hash, parse_status_reply, STATUS_TAGS};

const SHORT_TRACK_MS: u32 = 2 * 1000;
const PCM_SAMPLE_SIZES: [u8; 4] = [8, 16, 24, 32];
const PCM_SAMPLE_RATES: [u32; 15] = [
    11025, 22050, 32000, 44100, 48000, 8000, 12000, 16000, 24000, 96000, 88200, 176400, 192000,
    352800, 384000,
];

#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub http_port: u16,
    pub cli_port: u16,
    pub version: String,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            ip: Ipv4Addr::UNSPECIFIED,
            port: SLIM_PORT,
            http_port: 9000,
            cli_port: 9090,
            version: String::new(),
        }
    }
}

pub struct Player {
    pub(crate) pipe: Arc<Pipeline>,
    pub(crate) events: Arc<dyn RendererEvents>,
    mimetypes: Vec<String>,
    cli: CliClient,
    cli_id: String,
    name: StdMutex<String>,
    server: StdMutex<ServerInfo>,
    new_server: StdMutex<Option<Ipv4Addr>>,
    new_server_cap: StdMutex<Option<String>>,
    voltage: AtomicU16,
    host: Ipv4Addr,
    base_port: u16,
    model_name: String,
    tasks: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Player {
    pub(crate) fn new(
        config: PlayerConfig,
        on: bool,
        mimetypes: Vec<String>,
        events: Arc<dyn RendererEvents>,
        host: Ipv4Addr,
        base_port: u16,
        model_name: String,
    ) -> Arc<Self> {
        let cli_id = config.mac_string();
        let name = config.name.clone();
        Arc::new(Self {
            pipe: Arc::new(Pipeline::new(config, on)),
            events,
            mimetypes,
            cli: CliClient::new(),
            cli_id,
            name: StdMutex::new(name),
            server: StdMutex::new(ServerInfo::default()),
            new_server: StdMutex::new(None),
            new_server_cap: StdMutex::new(None),
            voltage: AtomicU16::new(0),
            host,
            base_port,
            model_name,
            tasks: StdMutex::new(Vec::new()),
        })
    }

    /// Starts the decode loop and the SlimProto session.
    pub(crate) fn start(self: &Arc<Self>) {
        let decode = sqbaudio::spawn_decode_loop(Arc::clone(&self.pipe));
        let slim = tokio::spawn(slimproto_task(Arc::clone(self)));
        let mut tasks = self.tasks.lock().expect("tasks lock");
        tasks.push(decode);
        tasks.push(slim);
    }

    /// Tears the player down: all tasks exit, buffers are dropped.
    pub(crate) async fn shutdown(&self) {
        let name = self.name.lock().expect("name lock").clone();
        info!("slimproto stop for {name}");
        self.pipe.stop();
        stream_disconnect(&self.pipe);
        output_flush(&self.pipe).await;
        sqbaudio::decode::decode_close(&self.pipe);
        self.cli.close().await;

        let tasks: Vec<_> = self.tasks.lock().expect("tasks lock").drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    fn server(&self) -> ServerInfo {
        self.server.lock().expect("server lock").clone()
    }

    fn web_server(&self) -> String {
        let server = self.server();
        format!("{}:{}", server.ip, server.http_port)
    }

    async fn cli_command(&self, command: &str, request: bool, decode: bool) -> Option<String> {
        if !self.pipe.config.use_cli {
            return None;
        }
        let server = self.server();
        self.cli
            .send_command(server.ip, server.cli_port, command, request, decode)
            .await
    }

    /// Metadata for the track `offset` entries after the playing one
    /// (-1 = the playing one), with the change-detection hash.
    pub async fn get_metadata(&self, offset: i32) -> (TrackMetadata, u32) {
        let offset = offset.max(0);
        let command = format!("{} status - {} {STATUS_TAGS}", self.cli_id, offset + 1);
        let Some(reply) = self.cli_command(&command, false, false).await else {
            let mut metadata = TrackMetadata::new();
            metadata.apply_defaults();
            warn!("cannot get metadata");
            let hash = metadata_hash(&metadata);
            return (metadata, hash);
        };
        let metadata = parse_status_reply(
            &reply,
            offset,
            &self.web_server(),
            &self.pipe.config.coverart,
        );
        let hash = metadata_hash(&metadata);
        (metadata, hash)
    }

    /// Playback position as reported by LMS.
    pub async fn get_time(&self) -> u32 {
        let command = format!("{} time", self.cli_id);
        match self.cli_command(&command, true, true).await {
            Some(reply) if !reply.is_empty() => (reply.parse::<f64>().unwrap_or(0.0) * 1000.0) as u32,
            _ => 0,
        }
    }

    /// Seeks LMS to a position ("123.5" seconds).
    pub async fn set_time(&self, position: &str) -> bool {
        let command = format!("{} time {position}", self.cli_id);
        self.cli_command(&command, false, true).await.is_some()
    }

    /// Play time derived from our own start/pause markers, for renderers
    /// that do not report time.
    pub fn self_time(&self) -> u32 {
        let zone = self.pipe.output.lock().expect("output lock");
        if zone.render.index == -1 || zone.render.state == RenderPhase::Stopped {
            return 0;
        }
        let now = now_ms();
        let mut time = now
            .wrapping_sub(zone.render.track_start_time)
            .wrapping_sub(zone.render.ms_paused);
        if zone.render.state == RenderPhase::Paused {
            time = time.wrapping_sub(now.wrapping_sub(zone.render.track_pause_time));
        }
        time
    }

    /// Renderer-side notification entry point.
    pub async fn notify(&self, event: SqNotify) {
        // notifications racing with shutdown or a powered-off player
        if !self.pipe.running() || !self.pipe.is_on() {
            return;
        }
        debug!("notify {event:?}");

        match event {
            SqNotify::Transition => {
                let mut zone = self.pipe.output.lock().expect("output lock");
                zone.render.state = RenderPhase::Transition;
            }
            SqNotify::Play { unsolicited } => {
                {
                    let mut zone = self.pipe.output.lock().expect("output lock");
                    if zone.render.state == RenderPhase::Paused {
                        zone.render.ms_paused = zone
                            .render
                            .ms_paused
                            .wrapping_add(now_ms().wrapping_sub(zone.render.track_pause_time));
                        zone.render.state = RenderPhase::Playing;
                        info!("resume notification (paused time {})", zone.render.ms_paused);
                    } else if zone.render.state != RenderPhase::Playing {
                        zone.render.state = RenderPhase::Playing;
                        // the play event can precede the index capture
                        if zone.render.index >= 0 && zone.render.index as u16 == zone.output.index {
                            zone.output.track_started = true;
                            zone.render.track_start_time = now_ms();
                            info!("track {} started by play", zone.render.index);
                        }
                        drop(zone);
                        self.pipe.wake_controller();
                    }
                }
                if unsolicited {
                    warn!("unsolicited play");
                    let command = format!("{} play", self.cli_id);
                    self.cli_command(&command, false, true).await;
                }
            }
            SqNotify::Pause { unsolicited } => {
                {
                    let mut zone = self.pipe.output.lock().expect("output lock");
                    zone.render.state = RenderPhase::Paused;
                    zone.render.track_pause_time = now_ms();
                    info!("track paused at {}", zone.render.track_pause_time);
                }
                if unsolicited {
                    warn!("unsolicited pause");
                    let command = format!("{} pause", self.cli_id);
                    self.cli_command(&command, false, true).await;
                }
            }
            SqNotify::Stop { forced } => {
                if forced {
                    info!("forced STOP");
                    let command = format!("{} stop", self.cli_id);
                    self.cli_command(&command, false, true).await;
                } else {
                    let mut zone = self.pipe.output.lock().expect("output lock");
                    zone.render.state = RenderPhase::Stopped;
                    drop(zone);
                    info!("notify STOP");
                    self.pipe.wake_controller();
                }
            }
            SqNotify::Time(time) => {
                let mut zone = self.pipe.output.lock().expect("output lock");
                if zone.render.index == -1 {
                    zone.render.ms_played = 0;
                    return;
                }
                let now = now_ms();
                if time == 0 {
                    // renderer does not report, estimate from our markers
                    if now.wrapping_sub(zone.render.track_start_time) > 3000 {
                        let mut played = now
                            .wrapping_sub(zone.render.track_start_time)
                            .wrapping_sub(zone.render.ms_paused);
                        if zone.render.state == RenderPhase::Paused {
                            played =
                                played.wrapping_sub(now.wrapping_sub(zone.render.track_pause_time));
                        }
                        zone.render.ms_played = played;
                    } else {
                        zone.render.ms_played = 0;
                    }
                } else {
                    zone.render.ms_played = time.saturating_sub(zone.output.offset);
                }

                // flow mode: time spans the playlist, roll into next track
                if zone.output.encode.flow
                    && zone.render.duration != 0
                    && zone.render.ms_played > zone.render.duration
                {
                    zone.output.offset += zone.render.duration;
                    zone.render.ms_played -= zone.render.duration;
                    zone.render.duration = zone.output.duration;
                    zone.render.index = i32::from(zone.output.index);
                    zone.output.track_started = true;
                    zone.render.track_start_time = now;
                    zone.render.ms_paused = 0;
                    zone.render.track_pause_time = 0;
                    info!(
                        "flow track started at {} for {}",
                        zone.render.track_start_time, zone.render.duration
                    );
                    drop(zone);
                    self.pipe.wake_controller();
                }
            }
            SqNotify::TrackInfo(uri) => {
                let Some(at) = uri.find("bridge-") else {
                    return;
                };
                let digits: String = uri[at + "bridge-".len()..]
                    .chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect();
                let Ok(index) = digits.parse::<u16>() else {
                    return;
                };
                let mut zone = self.pipe.output.lock().expect("output lock");
                if zone.output.state > OutputPhase::Stopped
                    && zone.render.index != i32::from(index)
                    && zone.output.index == index
                {
                    zone.render.index = i32::from(index);
                    zone.render.ms_paused = 0;
                    zone.render.ms_played = 0;
                    zone.render.duration = zone.output.duration;
                    if zone.render.state == RenderPhase::Playing {
                        zone.output.track_started = true;
                        zone.render.track_start_time = now_ms();
                        info!("track {index} started by info");
                        drop(zone);
                        self.pipe.wake_controller();
                    }
                }
            }
            SqNotify::Battery(voltage) => {
                if self.voltage.swap(voltage, Ordering::AcqRel) != voltage {
                    info!("battery {voltage:#x}");
                }
            }
            SqNotify::SetName(name) => {
                let command = format!("{} name {name}", self.cli_id);
                self.cli_command(&command, false, false).await;
            }
            SqNotify::Volume(volume) => {
                let command = format!("{} mixer volume {volume}", self.cli_id);
                self.cli_command(&command, false, true).await;
            }
            SqNotify::Mute(mute) => {
                let command = format!("{} mixer muting {}", self.cli_id, u8::from(mute));
                self.cli_command(&command, false, true).await;
            }
            SqNotify::NextFailed => {
                let command = format!("{} playlist index +1", self.cli_id);
                self.cli_command(&command, false, false).await;
            }
        }
    }
}

/// Per-session bookkeeping of the SlimProto state machine.
struct Session {
    autostart: u8,
    last_command: StrmCommand,
    sent_stmu: bool,
    sent_stmo: bool,
    sent_stml: bool,
    defer_stmd: bool,
    can_stmdu: bool,
    /// Last periodic STMt send.
    stmt_last: u32,
    /// Last status round.
    round_last: u32,
    metadata_last: u32,
}

impl Session {
    fn new() -> Self {
        Self {
            autostart: 0,
            last_command: StrmCommand::Unknown(0),
            sent_stmu: false,
            sent_stmo: false,
            sent_stml: false,
            defer_stmd: false,
            can_stmdu: false,
            stmt_last: now_ms(),
            round_last: now_ms(),
            metadata_last: now_ms(),
        }
    }
}

async fn send_packet(writer: &mut OwnedWriteHalf, packet: &[u8]) {
    if let Err(err) = writer.write_all(packet).await {
        warn!("failed writing to socket: {err}");
    }
}

fn stat_snapshot(player: &Player, server_timestamp: u32) -> StatData {
    let (stream_full, stream_size, bytes) = {
        let zone = player.pipe.stream.lock().expect("stream lock");
        (zone.buf.used() as u32, zone.buf.size() as u32, zone.state.bytes)
    };
    let zone = player.pipe.output.lock().expect("output lock");
    StatData {
        stream_buffer_size: stream_size,
        stream_buffer_fullness: stream_full,
        bytes_received: bytes,
        jiffies: now_ms(),
        output_buffer_size: zone.buf.size() as u32,
        output_buffer_fullness: (zone.buf.size() / 2) as u32,
        elapsed_seconds: zone.render.ms_played / 1000,
        elapsed_milliseconds: zone.render.ms_played,
        voltage: player.voltage.load(Ordering::Acquire),
        server_timestamp,
    }
}

async fn send_stat(player: &Player, writer: &mut OwnedWriteHalf, event: StatEvent, timestamp: u32) {
    if event != StatEvent::Timer {
        info!("STAT: {:?}", event);
    }
    let data = stat_snapshot(player, timestamp);
    send_packet(writer, &ClientPacket::stat(event, &data)).await;
}

/// Discovery loop: repeats every 5 s until the server answers or the
/// player is deleted.
async fn resolve_server(player: &Player, pinned: Option<Ipv4Addr>) -> Option<DiscoveredServer> {
    while player.pipe.running() {
        if let Some(found) = discover_once(player.host, pinned, Duration::from_secs(5)).await {
            return Some(found);
        }
    }
    None
}

fn parse_pinned_server(config: &PlayerConfig) -> Option<(Ipv4Addr, u16)> {
    let server = if !config.set_server.is_empty() {
        config.set_server.as_str()
    } else {
        config.server.as_str()
    };
    if server == "?" || server.is_empty() {
        return None;
    }
    match server.split_once(':') {
        Some((host, port)) => Some((host.parse().ok()?, port.parse().unwrap_or(SLIM_PORT))),
        None => Some((server.parse().ok()?, SLIM_PORT)),
    }
}

fn capabilities(player: &Player) -> String {
    let config = &player.pipe.config;
    let thru_mode = config.mode.to_ascii_lowercase().contains("thru");
    let codecs = sqbaudio::decode::advertised_codecs(&config.codecs, thru_mode);
    let mut caps = format!(
        "Model=squeezelite,ModelName={},AccuratePlayPoints=0,HasDigitalOut=1,MaxSampleRate={},{}",
        player.model_name, config.sample_rate, codecs
    );
    if let Some(extra) = player.new_server_cap.lock().expect("cap lock").take() {
        caps.push_str(&extra);
    }
    caps
}

pub(crate) async fn slimproto_task(player: Arc<Player>) {
    let pinned = parse_pinned_server(&player.pipe.config);

    // initial resolution: always run discovery so the CLI/web ports are
    // known, directed at the pinned address when one is configured
    let Some(found) = resolve_server(&player, pinned.map(|(ip, _)| ip)).await else {
        return;
    };
    {
        let mut server = player.server.lock().expect("server lock");
        server.ip = found.ip;
        server.port = pinned.map(|(_, port)| port).unwrap_or(found.port);
        server.http_port = found.http_port;
        server.cli_port = found.cli_port;
        server.version = found.version;
    }

    let mut reconnect = false;
    let mut failed_connect = 0u32;

    while player.pipe.running() {
        let new_ip = player.new_server.lock().expect("new server lock").take();
        if let Some(new_ip) = new_ip {
            reconnect = false;
            if let Some(found) =
                resolve_server(&player, Some(new_ip)).await
            {
                let mut server = player.server.lock().expect("server lock");
                server.ip = found.ip;
                server.port = found.port;
                server.http_port = found.http_port;
                server.cli_port = found.cli_port;
                server.version = found.version;
                info!("switching server to {}:{}", found.ip, found.port);
            }
        }

        let address = {
            let server = player.server.lock().expect("server lock");
            (server.ip, server.port)
        };
        info!("connecting to {}:{}", address.0, address.1);

        let connect = tokio::time::timeout(Duration::from_secs(5), TcpStream::connect(address));
        let socket = match connect.await {
            Ok(Ok(socket)) => socket,
            _ => {
                failed_connect += 1;
                warn!("unable to connect to server {failed_connect}");
                tokio::time::sleep(Duration::from_secs(5)).await;
                // rediscover when the server was not pinned at startup
                if pinned.is_none() && failed_connect > 5 {
                    if let Some(found) = resolve_server(&player, None).await {
                        let mut server = player.server.lock().expect("server lock");
                        server.ip = found.ip;
                        server.port = found.port;
                        server.http_port = found.http_port;
                        server.cli_port = found.cli_port;
                    }
                }
                continue;
            }
        };

        info!("connected");
        failed_connect = 0;

        let (mut reader, mut writer) = socket.into_split();
        let bytes = player.pipe.stream.lock().expect("stream lock").state.bytes;
        let helo = ClientPacket::helo(
            player.pipe.config.mac,
            reconnect,
            bytes,
            &capabilities(&player),
        );
        send_packet(&mut writer, &helo).await;

        run_session(&player, &mut reader, &mut writer).await;
        reconnect = true;

        player.cli.close().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn run_session(player: &Arc<Player>, reader: &mut OwnedReadHalf, writer: &mut OwnedWriteHalf) {
    use tokio::io::AsyncReadExt;

    let mut session = Session::new();
    let mut timeouts = 0u32;
    let mut incoming = bytes::BytesMut::with_capacity(8192);

    while player.pipe.running() {
        if player.new_server.lock().expect("new server lock").is_some() {
            return;
        }

        // drain complete frames first; read_buf below is cancel-safe
        while let Some(message) = split_frame(&mut incoming) {
            handle_message(player, &mut session, writer, message).await;
        }
        if incoming.len() > 2 * MAX_HEADER {
            warn!("slimproto packet too big: {}", incoming.len());
            return;
        }

        let mut wake = false;
        tokio::select! {
            read = reader.read_buf(&mut incoming) => {
                timeouts = 0;
                match read {
                    Ok(0) => {
                        warn!("error reading from socket: closed");
                        return;
                    }
                    Err(err) => {
                        warn!("error reading from socket: {err}");
                        return;
                    }
                    Ok(_) => {}
                }
            }
            _ = player.pipe.controller.notified() => {
                wake = true;
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                timeouts += 1;
                // LMS talks at least every 30 s (mysb.com), 35 is dead
                if timeouts > 35 {
                    warn!("no messages from server - connection dead");
                    return;
                }
            }
        }

        player.cli.close_when_idle().await;
        live_metadata_round(player, &mut session).await;

        let now = now_ms();
        if wake || now.wrapping_sub(session.round_last) > 100 {
            session.round_last = now;
            status_round(player, &mut session, writer).await;
        }
    }
}

/// Periodic CLI refresh of live-stream metadata; feeds ICY or the renderer
/// metadata event when the displayable fields changed.
async fn live_metadata_round(player: &Arc<Player>, session: &mut Session) {
    let now = now_ms();
    let (running, enabled, icy_active, flow, track_started) = {
        let zone = player.pipe.output.lock().expect("output lock");
        (
            zone.output.state == OutputPhase::Running,
            zone.output.live_metadata.enabled,
            zone.output.icy.interval > 0,
            zone.output.encode.flow,
            zone.output.track_started,
        )
    };
    if !running {
        return;
    }

    let mut updated = false;
    if enabled && now.wrapping_sub(session.metadata_last) >= METADATA_UPDATE_TIME {
        session.metadata_last = now;
        let (live, hash) = player.get_metadata(-1).await;
        let mut zone = player.pipe.output.lock().expect("output lock");
        if zone.output.live_metadata.hash != hash {
            updated = true;
            zone.output.live_metadata.hash = hash;
            zone.output.metadata = live;
        }
    }

    if icy_active {
        if updated {
            let mut zone = player.pipe.output.lock().expect("output lock");
            let metadata = zone.output.metadata.clone();
            let with_artwork = player.pipe.config.send_icy != sqbaudio::IcyMode::Text;
            set_icy(&mut zone.output, &metadata, with_artwork);
        }
    } else if (flow && track_started) || updated {
        let metadata = player.pipe.output.lock().expect("output lock").output.metadata.clone();
        player.events.on_event(SqEvent::NewMetadata(metadata));
    }
}

async fn handle_message(
    player: &Arc<Player>,
    session: &mut Session,
    writer: &mut OwnedWriteHalf,
    message: ServerMessage,
) {
    match message {
        ServerMessage::Strm(strm) => handle_strm(player, session, writer, strm).await,
        ServerMessage::Cont { metaint } => {
            debug!("cont metaint: {metaint}");
            if session.autostart > 1 {
                session.autostart -= 2;
                let mut zone = player.pipe.stream.lock().expect("stream lock");
                if zone.state.phase == StreamPhase::StreamingWait {
                    zone.state.phase = StreamPhase::StreamingBuffering;
                    zone.state.meta_interval = metaint;
                    zone.state.meta_next = metaint;
                }
                drop(zone);
                player.pipe.wake_controller();
            }
        }
        ServerMessage::Codc {
            format,
            pcm_sample_size,
            pcm_sample_rate,
            pcm_channels,
            pcm_endianness,
        } => {
            if !process_start(
                player,
                session,
                format,
                pcm_sample_rate,
                pcm_sample_size,
                pcm_channels,
                pcm_endianness,
            )
            .await
            {
                warn!("codc error {}", format as char);
                send_stat(player, writer, StatEvent::NotSupported, 0).await;
            }
        }
        ServerMessage::Aude { enable_spdif, .. } => {
            player.pipe.set_on(enable_spdif);
            debug!("on/off using aude {}", enable_spdif);
            player.events.on_event(SqEvent::OnOff(enable_spdif));
        }
        ServerMessage::Audg {
            gain_left,
            gain_right,
            adjust,
        } => {
            debug!("audg gainL: {gain_left} gainR: {gain_right}");
            if adjust {
                let gain = ((u64::from(gain_left) + u64::from(gain_right)) / 2) as u32;
                player.events.on_event(SqEvent::Volume(gain));
            }
        }
        ServerMessage::QueryName => {
            info!("name query from server");
            let name = player.name.lock().expect("name lock").clone();
            if !name.is_empty() {
                send_packet(writer, &ClientPacket::setd_name(&name)).await;
            }
        }
        ServerMessage::SetName(name) => {
            debug!("set name: {name}");
            *player.name.lock().expect("name lock") = name.clone();
            send_packet(writer, &ClientPacket::setd_name(&name)).await;
            player.events.on_event(SqEvent::SetName(name));
        }
        ServerMessage::Serv {
            server_ip,
            sync_group,
        } => {
            info!("switch server");
            *player.new_server.lock().expect("new server lock") = Some(server_ip);
            *player.new_server_cap.lock().expect("cap lock") =
                sync_group.map(|group| format!(",SyncgroupID={group}"));
            player.events.on_event(SqEvent::SetServer(server_ip));
        }
        ServerMessage::Ledc => debug!("ledc"),
        ServerMessage::Vers(version) => debug!("version {version}"),
        ServerMessage::Unknown(opcode) => {
            warn!("unhandled {}", String::from_utf8_lossy(&opcode));
        }
    }
}

async fn handle_strm(
    player: &Arc<Player>,
    session: &mut Session,
    writer: &mut OwnedWriteHalf,
    strm: StrmMessage,
) {
    debug!("strm command {:?}", strm.command);
    let pipe = &player.pipe;

    match strm.command {
        StrmCommand::Status => {
            // the timestamp is no longer used for latency but is echoed
            send_stat(player, writer, StatEvent::Timer, strm.replay_gain).await;
        }
        StrmCommand::Flush => {
            // disconnect first: it releases a decoder starved for input
            stream_disconnect(pipe);
            decode_flush(pipe);
            output_flush(pipe).await;
            send_stat(player, writer, StatEvent::Flushed, 0).await;
            pipe.stream.lock().expect("stream lock").buf.flush();
        }
        StrmCommand::Stop => {
            let disconnected = stream_disconnect(pipe);
            decode_flush(pipe);
            output_flush(pipe).await;
            if disconnected {
                send_stat(player, writer, StatEvent::Flushed, 0).await;
            }
            pipe.stream.lock().expect("stream lock").buf.flush();
            if session.last_command != StrmCommand::Stop {
                player.events.on_event(SqEvent::Stop);
            }
        }
        StrmCommand::Pause => {
            let interval = strm.replay_gain;
            info!("pause (interval:{interval})");
            if interval == 0 {
                pipe.output.lock().expect("output lock").output.state = OutputPhase::Waiting;
                player.events.on_event(SqEvent::Pause);
                send_stat(player, writer, StatEvent::Paused, 0).await;
            }
        }
        StrmCommand::Skip => {
            info!("skip ahead interval (ignored): {}", strm.replay_gain);
        }
        StrmCommand::Unpause => {
            info!("unpause at: {} now: {}", strm.replay_gain, now_ms());
            player.events.on_event(SqEvent::Unpause);
            {
                let mut zone = pipe.output.lock().expect("output lock");
                zone.output.state = OutputPhase::Running;
                zone.output.start_at = strm.replay_gain;
            }
            send_stat(player, writer, StatEvent::Resumed, 0).await;
        }
        StrmCommand::Start => {
            info!(
                "strm s autostart: {} transition period: {} type: {} codec: {}",
                strm.autostart as char,
                strm.transition_period,
                strm.transition_type as char,
                strm.format as char
            );
            session.autostart = strm.autostart.wrapping_sub(b'0');

            send_stat(player, writer, StatEvent::Flushed, 0).await;

            if strm.header.len() > MAX_HEADER - 1 {
                warn!("header too long: {}", strm.header.len());
                return;
            }

            // a starved decoder must be released before the codec switch
            stream_disconnect(pipe);

            {
                let mut zone = pipe.output.lock().expect("output lock");
                zone.output.next_replay_gain = strm.replay_gain;
                zone.output.fade_mode = FadeMode::from_transition_type(strm.transition_type);
                zone.output.fade_secs = u32::from(strm.transition_period);
                debug!("set fade mode: {:?}", zone.output.fade_mode);
            }

            let mut send_stmn = false;
            if strm.format != b'?' {
                send_stmn = !process_start(
                    player,
                    session,
                    strm.format,
                    strm.pcm_sample_rate,
                    strm.pcm_sample_size,
                    strm.pcm_channels,
                    strm.pcm_endianness,
                )
                .await;
            } else if session.autostart >= 2 {
                // server will detect the codec from the response headers
                // and send it back in a codc message
                info!("waiting for codc message");
            } else {
                warn!("unknown codec requires autostart >= 2");
                return;
            }

            let ip = if strm.server_ip.is_unspecified() {
                player.server().ip
            } else {
                strm.server_ip
            };

            if strm.server_port == 0 {
                // port 0 marks a local file, the header carries its path
                let path = String::from_utf8_lossy(&strm.header).into_owned();
                stream_file(pipe, &path, u64::from(strm.threshold) * 1024);
            } else {
                stream_sock(
                    pipe,
                    ip,
                    strm.server_port,
                    strm.flags & 0x20 != 0,
                    &strm.header,
                    u64::from(strm.threshold) * 1024,
                    session.autostart >= 2,
                );
            }

            send_stat(player, writer, StatEvent::Connect, 0).await;
            session.can_stmdu = false;
            session.sent_stmu = false;
            session.sent_stmo = false;
            session.sent_stml = false;
            session.defer_stmd = false;

            if send_stmn {
                warn!("no matching codec");
                send_stat(player, writer, StatEvent::NotSupported, 0).await;
            }
        }
        StrmCommand::Unknown(other) => {
            warn!("unhandled strm {}", other as char);
        }
    }

    session.last_command = strm.command;
}

/// One 100 ms status round: samples the three zones, derives the STM*
/// events due and sends them after all locks are released.
async fn status_round(player: &Arc<Player>, session: &mut Session, writer: &mut OwnedWriteHalf) {
    let pipe = &player.pipe;
    let now = now_ms();

    let mut send_dsco: Option<DisconnectCode> = None;
    let mut send_resp: Option<Vec<u8>> = None;
    let mut send_meta: Option<Vec<u8>> = None;
    let mut send_stms = false;
    let mut send_stmd = false;
    let mut send_stmt = false;
    let mut send_stml = false;
    let mut send_stmu = false;
    let mut send_stmo = false;
    let mut send_stmn = false;
    let mut do_disconnect = false;

    let (stream_state, stream_bytes, disconnect_code) = {
        let mut zone = pipe.stream.lock().expect("stream lock");
        let state = zone.state.phase;
        let code = zone.state.disconnect;

        if state == StreamPhase::Disconnect {
            zone.state.phase = StreamPhase::Stopped;
            send_dsco = Some(code);
        }

        if !zone.state.sent_headers
            && matches!(
                state,
                StreamPhase::StreamingHttp
                    | StreamPhase::StreamingWait
                    | StreamPhase::StreamingBuffering
            )
        {
            send_resp = Some(zone.state.header.clone());
            zone.state.sent_headers = true;
        }
        if zone.state.meta_send {
            send_meta = Some(zone.state.header.clone());
            zone.state.meta_send = false;
        }

        (state, zone.state.bytes, code)
    };

    let (duration, ms_played, output_ready) = {
        let mut zone = pipe.output.lock().expect("output lock");
        let output_ready = zone.output.completed || zone.output.encode.flow;

        // streaming properly started
        if zone.output.track_started {
            send_stms = true;
            session.can_stmdu = true;
            zone.output.track_started = false;
        }

        // streaming failed: wait till the worker ends, then move on
        if stream_bytes == 0
            && zone.output.completed
            && zone.output.state == OutputPhase::Running
        {
            warn!("nothing received");
            zone.render.state = RenderPhase::Stopped;
            session.can_stmdu = true;
            send_stmn = true;
        }

        // normal end of track with underrun
        if zone.output.state == OutputPhase::Running
            && !session.sent_stmu
            && output_ready
            && stream_state.ended()
            && zone.render.state == RenderPhase::Stopped
            && session.can_stmdu
        {
            send_stmu = true;
            session.sent_stmu = true;
            zone.output.encode.flow = false;
            zone.output.state = OutputPhase::Stopped;
        }

        // data left but the renderer stopped: report an overrun
        if zone.output.state == OutputPhase::Running
            && !session.sent_stmo
            && stream_state == StreamPhase::StreamingHttp
            && zone.render.state == RenderPhase::Stopped
            && session.can_stmdu
        {
            send_stmo = true;
            session.sent_stmo = true;
            zone.output.state = OutputPhase::Stopped;
        }

        (zone.render.duration, zone.render.ms_played, output_ready)
    };

    {
        let mut zone = pipe.decode.lock().expect("decode lock");

        if zone.ctrl.phase == DecodePhase::Running && now.wrapping_sub(session.stmt_last) > 1000 {
            send_stmt = true;
            session.stmt_last = now;
        }

        let streaming_or_done = matches!(
            stream_state,
            StreamPhase::StreamingHttp | StreamPhase::StreamingFile
        ) || (stream_state == StreamPhase::Disconnect
            && disconnect_code == DisconnectCode::Ok);

        if streaming_or_done && !session.sent_stml && zone.ctrl.phase == DecodePhase::Ready {
            if session.autostart == 0 {
                zone.ctrl.phase = DecodePhase::Running;
                send_stml = true;
                session.sent_stml = true;
            } else if session.autostart == 1 {
                zone.ctrl.phase = DecodePhase::Running;
                // release the output worker now that we are decoding
                pipe.output.lock().expect("output lock").output.state = OutputPhase::Running;
            }
            player.events.on_event(SqEvent::Play);
            // autostart 2 and 3 require a cont first
        }

        /* Unless flow mode is used, wait for the whole output to be sent
         * before asking for the next track; for short tracks the worker
         * can finish before playback started and STMd must never beat
         * STMs. Streaming services close idle connections (~30 s), so
         * with a known duration STMd also waits until the end is close. */
        let next_delay_ok = {
            let flow = pipe.output.lock().expect("output lock").output.encode.flow;
            flow || send_stmu
                || pipe.config.next_delay == 0
                || duration == 0
                || duration.saturating_sub(ms_played) < pipe.config.next_delay * 1000
        };

        if zone.ctrl.phase == DecodePhase::Error
            || (zone.ctrl.phase == DecodePhase::Complete
                && session.can_stmdu
                && output_ready
                && next_delay_ok)
        {
            if zone.ctrl.phase == DecodePhase::Complete {
                send_stmd = true;
            } else {
                send_stmn = true;
            }
            zone.ctrl.phase = DecodePhase::Stopped;
            if matches!(
                stream_state,
                StreamPhase::StreamingHttp | StreamPhase::StreamingFile
            ) {
                do_disconnect = true;
            }
            if send_stmu {
                warn!("track shorter than expected ({ms_played}/{duration})");
            }
        }
    }

    if do_disconnect {
        stream_disconnect(pipe);
    }

    // send once all locks are released, packet writes can block
    if let Some(code) = send_dsco {
        debug!("DSCO: {:?}", code);
        send_packet(writer, &ClientPacket::dsco(code as u8)).await;
    }
    if send_stmt {
        send_stat(player, writer, StatEvent::Timer, 0).await;
    }
    if send_stml {
        send_stat(player, writer, StatEvent::BufferReady, 0).await;
    }
    // STMs and STMd never coincide: STMd defers one round
    if send_stms {
        send_stat(player, writer, StatEvent::TrackStarted, 0).await;
        if send_stmd {
            session.defer_stmd = true;
        }
    } else if send_stmd || session.defer_stmd {
        send_stat(player, writer, StatEvent::DecodeReady, 0).await;
        session.defer_stmd = false;
    }
    if send_stmu {
        send_stat(player, writer, StatEvent::Underrun, 0).await;
    }
    if send_stmo {
        send_stat(player, writer, StatEvent::Overrun, 0).await;
    }
    if send_stmn {
        send_stat(player, writer, StatEvent::NotSupported, 0).await;
    }
    if let Some(header) = send_resp {
        send_packet(writer, &ClientPacket::resp(&header)).await;
    }
    if let Some(meta) = send_meta {
        send_packet(writer, &ClientPacket::meta(&meta)).await;
    }
}

/// Prepares everything for a new track: metadata, encode mode, MIME
/// negotiation, codec and the HTTP worker; fires SetTrack at the renderer.
async fn process_start(
    player: &Arc<Player>,
    _session: &mut Session,
    format: u8,
    rate: u8,
    size: u8,
    channels: u8,
    endianness: u8,
) -> bool {
    let pipe = &player.pipe;
    let config = &pipe.config;

    let (index, offset) = {
        let mut zone = pipe.output.lock().expect("output lock");
        zone.output.index = zone.output.index.wrapping_add(1);
        let offset = if zone.render.index != -1 {
            i32::from(zone.output.index) - zone.render.index
        } else {
            0
        };
        zone.buf.resize(config.outputbuf_size);
        (zone.output.index, offset)
    };

    let (metadata, hash) = player.get_metadata(offset).await;

    // jumping over a gapless next track that is too short never works
    if offset != 0 && metadata.duration > 0 && metadata.duration < SHORT_TRACK_MS {
        warn!("track too short ({})", metadata.duration);
        return false;
    }

    let now = now_ms();
    let flow_active = {
        let mut zone = pipe.output.lock().expect("output lock");
        let out = &mut zone.output;
        out.metadata = metadata.clone();
        out.completed = false;
        out.duration = metadata.duration;
        out.bitrate = metadata.bitrate;
        out.icy.allowed = false;
        out.live_metadata.enabled = out.duration == 0 || metadata.repeating != -1;
        out.live_metadata.last = now;
        out.live_metadata.hash = if out.live_metadata.enabled { 0 } else { hash };

        // read source parameters
        out.sample_size = if size == b'?' {
            0
        } else if format == b'a' || format == b'd' || format == b'f' {
            size
        } else {
            PCM_SAMPLE_SIZES
                .get(usize::from(size.wrapping_sub(b'0')))
                .copied()
                .unwrap_or(0)
        };
        out.sample_rate = if rate == b'?' {
            0
        } else {
            PCM_SAMPLE_RATES
                .get(usize::from(rate.wrapping_sub(b'0')))
                .copied()
                .unwrap_or(0)
        };
        if out.sample_rate > config.sample_rate {
            warn!(
                "sample rate {} error suspected, forcing to {}",
                out.sample_rate, config.sample_rate
            );
            out.sample_rate = config.sample_rate;
        }
        out.channels = if channels == b'?' {
            0
        } else {
            channels.wrapping_sub(b'0').clamp(0, 2)
        };
        out.in_endian = endianness != b'0';
        out.codec = format;
        out.encode.flow
    };

    // in flow mode everything is already set up, just switch the codec
    if flow_active {
        {
            let mut zone = pipe.output.lock().expect("output lock");
            if zone.output.icy.interval > 0 {
                let with_artwork = config.send_icy != sqbaudio::IcyMode::Text;
                set_icy(&mut zone.output, &metadata, with_artwork);
            }
        }
        let (codec, sample_size, sample_rate, chans, little) = {
            let zone = pipe.output.lock().expect("output lock");
            (
                zone.output.codec,
                zone.output.sample_size,
                zone.output.sample_rate,
                zone.output.channels,
                zone.output.in_endian,
            )
        };
        return codec_open(pipe, codec as char, sample_size, sample_rate, chans, !little);
    }

    let mode = config.mode.to_ascii_lowercase();
    let started = start_encoder(player, &metadata, &mode, index, offset.max(0) as u32).await;

    if !started {
        info!("something went wrong starting process {index}");
        output_abort(pipe, index).await;
    }
    started
}

fn parse_mode_number(mode: &str, key: &str) -> Option<i64> {
    let at = mode.find(key)?;
    let digits: String = mode[at + key.len()..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '-')
        .collect();
    digits.parse().ok()
}

/// The encode-mode half of track setup: negotiates the MIME type with the
/// renderer, opens the codec and spawns the HTTP worker.
async fn start_encoder(
    player: &Arc<Player>,
    metadata: &TrackMetadata,
    mode: &str,
    index: u16,
    offset: u32,
) -> bool {
    use sqbaudio::pipeline::EncodeMode;

    let pipe = &player.pipe;
    let config = &pipe.config;

    let mut mimetype: Option<String> = None;
    {
        let mut zone = pipe.output.lock().expect("output lock");
        let sqbaudio::pipeline::OutputZone { buf, output: out, .. } = &mut *zone;

        out.encode.mode = if mode.contains("pcm") {
            EncodeMode::Pcm
        } else if mode.contains("flc") {
            EncodeMode::Flac
        } else if mode.contains("mp3") {
            EncodeMode::Mp3
        } else if mode.contains("null") {
            EncodeMode::Null
        } else {
            EncodeMode::Thru
        };

        let rate_override = parse_mode_number(mode, "r:").unwrap_or(0);
        out.encode.sample_size = parse_mode_number(mode, "s:").unwrap_or(0).clamp(0, 32) as u8;
        out.encode.channels = 0;
        out.offset = 0;

        // flow needs every parameter pinned before the first track
        if mode.contains("flow") && out.encode.mode != EncodeMode::Thru {
            out.icy.allowed = config.send_icy != sqbaudio::IcyMode::None;
            if out.icy.allowed {
                set_icy(out, metadata, config.send_icy != sqbaudio::IcyMode::Text);
            }
            out.encode.flow = true;
            out.encode.channels = 2;
            if out.encode.sample_size == 0 {
                out.encode.sample_size = 16;
            }
        } else if config.send_icy != sqbaudio::IcyMode::None && out.live_metadata.enabled {
            out.icy.allowed = true;
            set_icy(out, metadata, config.send_icy != sqbaudio::IcyMode::Text);
        }

        let flow_rate = if out.encode.flow && rate_override <= 0 {
            44_100
        } else {
            0
        };

        // effective re-encode rate: fixed, capped, or the source rate
        out.supported_rates[0] = if flow_rate != 0 {
            flow_rate
        } else if rate_override > 0 {
            rate_override as i32
        } else if rate_override < 0 {
            if out.sample_rate != 0 {
                out.sample_rate.min(rate_override.unsigned_abs() as u32) as i32
            } else {
                rate_override as i32
            }
        } else {
            out.sample_rate as i32
        };
        out.encode.sample_rate = if out.supported_rates[0] > 0 {
            out.supported_rates[0] as u32
        } else {
            0
        };

        let was_thru = out.encode.mode == EncodeMode::Thru;
        match out.encode.mode {
            EncodeMode::Thru | EncodeMode::Pcm if out.codec == b'p' => {
                // pass-through alignment is not guaranteed, start clean
                if was_thru && !buf.reset() {
                    warn!("buffer should be empty");
                }
                if out.encode.sample_size == 0 {
                    out.encode.sample_size =
                        if out.sample_size == 24 && config.l24_format == sqbaudio::L24Format::Trunc16 {
                            16
                        } else {
                            out.sample_size
                        };
                }
                if let Some((mime, real_size)) = mimetype_from_pcm(
                    out.encode.sample_size,
                    config.l24_format == sqbaudio::L24Format::Trunc16Pcm,
                    out.encode.sample_rate,
                    out.channels.max(1),
                    &player.mimetypes,
                    &config.raw_audio_format,
                ) {
                    out.encode.sample_size = real_size;
                    mimetype = Some(mime);
                }
                out.encode.mode = EncodeMode::Pcm;
            }
            EncodeMode::Thru => {
                // pass-through needs a frame-aligned, empty buffer
                if !buf.reset() {
                    warn!("buffer should be empty");
                }
                let variant = match out.codec {
                    b'd' => match out.sample_size {
                        b'0' => CodecVariant::Dsf,
                        b'1' => CodecVariant::Dff,
                        _ => CodecVariant::Dsd,
                    },
                    b'f' if out.sample_size == b'o' => CodecVariant::FlacOgg,
                    b'a' if out.sample_size == b'5' => CodecVariant::AacMp4,
                    _ => CodecVariant::Plain,
                };
                mimetype = mimetype_from_codec(out.codec as char, &player.mimetypes, variant);

                if out.codec == b'a'
                    && out.sample_size == b'5'
                    && mimetype.as_deref().map(|m| m.contains("aac")).unwrap_or(false)
                {
                    // renderer only takes ADTS, repackage the MP4
                    out.codec = b'4';
                } else if out.codec == b'f' && out.sample_size != b'o' {
                    out.codec = b'c';
                } else {
                    out.codec = b'*';
                }
            }
            EncodeMode::Pcm => {
                if out.encode.sample_rate != 0 && out.encode.sample_size != 0 {
                    if let Some((mime, real_size)) = mimetype_from_pcm(
                        out.encode.sample_size,
                        config.l24_format == sqbaudio::L24Format::Trunc16Pcm,
                        out.encode.sample_rate,
                        2,
                        &player.mimetypes,
                        &config.raw_audio_format,
                    ) {
                        out.encode.sample_size = real_size;
                        mimetype = Some(mime);
                    }
                } else if (metadata.sample_size != 0 || out.encode.sample_size != 0)
                    && (metadata.sample_rate != 0
                        || out.encode.sample_rate != 0
                        || out.supported_rates[0] != 0)
                {
                    let sample_size = if out.encode.sample_size != 0 {
                        out.encode.sample_size
                    } else {
                        metadata.sample_size
                    };
                    let sample_rate = if out.encode.sample_rate != 0 {
                        out.encode.sample_rate
                    } else if out.supported_rates[0] < 0 {
                        out.supported_rates[0].unsigned_abs()
                    } else {
                        metadata.sample_rate
                    };
                    if let Some((mime, _)) = mimetype_from_pcm(
                        sample_size,
                        config.l24_format == sqbaudio::L24Format::Trunc16Pcm,
                        sample_rate,
                        2,
                        &player.mimetypes,
                        &config.raw_audio_format,
                    ) {
                        // generic marker: the real parameters are known at
                        // stream open only
                        mimetype = Some(if mime.starts_with("audio/L") {
                            "*".to_string()
                        } else {
                            mime
                        });
                    }
                } else {
                    let containers: String = config
                        .raw_audio_format
                        .split(',')
                        .filter(|fmt| fmt.contains("wav") || fmt.contains("aif"))
                        .collect::<Vec<_>>()
                        .join(",");
                    let variant = if containers.contains("wav") {
                        CodecVariant::PcmContainers("wav,aif")
                    } else {
                        CodecVariant::PcmContainers("aif")
                    };
                    mimetype = mimetype_from_codec('p', &player.mimetypes, variant);
                }
            }
            EncodeMode::Flac => {
                mimetype = mimetype_from_codec('f', &player.mimetypes, CodecVariant::Plain);
                if out.sample_size > 24 {
                    out.encode.sample_size = 24;
                }
                let level = parse_mode_number(mode, "flc:").unwrap_or(0);
                out.encode.level = if (0..=9).contains(&level) { level as u16 } else { 0 };
            }
            EncodeMode::Mp3 => {
                mimetype = mimetype_from_codec('m', &player.mimetypes, CodecVariant::Plain);
                out.encode.sample_size = 16;
                // MPEG rates top out at 48 kHz
                if out.supported_rates[0] == 0 || out.supported_rates[0] < -48_000 {
                    out.supported_rates[0] = -48_000;
                } else if out.supported_rates[0] > 48_000 {
                    out.supported_rates[0] = 48_000;
                    out.encode.sample_rate = 48_000;
                }
                out.encode.level = parse_mode_number(mode, "mp3:")
                    .unwrap_or(128)
                    .clamp(8, 320) as u16;
            }
            EncodeMode::Null => {
                mimetype = Some("audio/mpeg".to_string());
                out.codec = b'*';
                out.encode.count =
                    (out.duration / sqbaudio::mp3enc::MP3_SILENCE_DURATION) as usize;
                info!("will send {} mp3 silence blocks", out.encode.count);
            }
        }
    }

    let Some(mimetype) = mimetype else {
        return false;
    };

    let (codec, sample_size, sample_rate, channels, little, encode_rate, encode_size) = {
        let mut zone = pipe.output.lock().expect("output lock");
        let out = &mut zone.output;
        out.mimetype = mimetype.clone();
        out.format = mimetype_to_format(&mimetype);
        out.out_endian = out.format == 'w';
        out.length = config.stream_length;
        (
            out.codec,
            out.sample_size,
            out.sample_rate,
            out.channels,
            out.in_endian,
            out.encode.sample_rate,
            out.encode.sample_size,
        )
    };

    if !codec_open(pipe, codec as char, sample_size, sample_rate, channels, !little) {
        return false;
    }
    let Some(port) = output_start(pipe, player.base_port).await else {
        return false;
    };

    let uri = format!(
        "http://{}:{}/bridge-{}.{}",
        player.host,
        port,
        index,
        mimetype_to_ext(&mimetype)
    );
    info!("codec:{} ch:{channels} s:{sample_size} r:{sample_rate} -> {uri}", codec as char);

    let mut info = TrackInfo {
        offset,
        metadata: metadata.clone(),
        uri,
        mimetype,
    };
    // in thru/pcm these are known from the source; encoded ones are fixed
    info.metadata.sample_rate = encode_rate;
    info.metadata.sample_size = encode_size;
    if channels != 0 {
        info.metadata.channels = channels;
    }

    player.events.on_event(SqEvent::SetTrack(info))
}
