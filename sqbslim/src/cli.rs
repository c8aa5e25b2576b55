//! CLI side-channel toward LMS (default port 9090).
//!
//! Line protocol, percent-encoded both ways. The socket stays open between
//! commands, closes after 15 minutes idle and reopens on demand. A mutex
//! serialises round trips so replies stay matched to their command.

use std::net::Ipv4Addr;
use std::time::Duration;

use sqbutils::{cli_decode, cli_encode, now_ms};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const CLI_PORT_DEFAULT: u16 = 9090;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(250);
const RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);
const KEEP_DURATION_MS: u32 = 15 * 60 * 1000;

struct CliInner {
    socket: Option<TcpStream>,
    /// Deadline after which the idle socket is dropped.
    timeout_at: u32,
}

pub struct CliClient {
    inner: Mutex<CliInner>,
}

impl CliClient {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CliInner {
                socket: None,
                timeout_at: 0,
            }),
        }
    }

    /// Drops the connection; the next command reopens it.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.socket = None;
    }

    /// Closes the socket when it sat idle past the keep duration. Called
    /// from the SlimProto round so the check does not need its own timer.
    pub async fn close_when_idle(&self) {
        // do not stall the control loop behind an in-flight command
        if let Ok(mut inner) = self.inner.try_lock() {
            if inner.socket.is_some() && now_ms().wrapping_sub(inner.timeout_at) < 0x8000_0000 {
                info!("closing idle CLI socket");
                inner.socket = None;
            }
        }
    }

    /// Sends one command and returns the reply payload (the echoed command
    /// stripped), percent-decoded when `decode` is set. `request` appends
    /// the " ?" query marker.
    pub async fn send_command(
        &self,
        ip: Ipv4Addr,
        port: u16,
        command: &str,
        request: bool,
        decode: bool,
    ) -> Option<String> {
        let mut inner = self.inner.lock().await;
        inner.timeout_at = now_ms().wrapping_add(KEEP_DURATION_MS);

        if inner.socket.is_none() {
            let connect = TcpStream::connect((ip, port));
            match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
                Ok(Ok(socket)) => {
                    info!("opened CLI socket to {ip}:{port}");
                    inner.socket = Some(socket);
                }
                _ => {
                    warn!("unable to connect to server with cli");
                    return None;
                }
            }
        }

        let encoded = cli_encode(command);
        let line = if request {
            format!("{encoded} ?\n")
        } else {
            format!("{encoded}\n")
        };
        debug!("cmd {line:?}");

        let socket = inner.socket.as_mut().expect("opened above");
        if socket.write_all(line.as_bytes()).await.is_err() {
            inner.socket = None;
            return None;
        }

        let mut response = Vec::with_capacity(4096);
        let mut chunk = [0u8; 4096];
        let reply = loop {
            let read = tokio::time::timeout(RESPONSE_TIMEOUT, socket.read(&mut chunk)).await;
            match read {
                Ok(Ok(0)) | Ok(Err(_)) => {
                    inner.socket = None;
                    return None;
                }
                Ok(Ok(n)) => {
                    response.extend_from_slice(&chunk[..n]);
                    let text = String::from_utf8_lossy(&response);
                    if text.contains('\n') && contains_ignore_case(&text, &encoded) {
                        break text.into_owned();
                    }
                }
                Err(_) => {
                    warn!("timeout waiting for CLI response ({command})");
                    return None;
                }
            }
        };

        // strip everything up to and including the echoed command
        let lower = reply.to_ascii_lowercase();
        let at = lower.find(&encoded.to_ascii_lowercase())?;
        let mut payload = &reply[at + encoded.len()..];
        payload = payload.trim_start_matches(' ');
        let payload = payload.split('\n').next().unwrap_or("").trim_end_matches('\r');

        Some(if decode {
            cli_decode(payload)
        } else {
            payload.to_string()
        })
    }
}

impl Default for CliClient {
    fn default() -> Self {
        Self::new()
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_ascii_lowercase().contains(&needle.to_ascii_lowercase())
}

/// Extracts a `tag:value` field from a CLI reply; tags arrive as
/// `tag%3avalue` with the value percent-encoded.
pub fn cli_find_tag(response: &str, tag: &str) -> Option<String> {
    let marker = format!("{tag}%3a").to_ascii_lowercase();
    let lower = response.to_ascii_lowercase();
    let at = lower.find(&marker)?;
    let rest = &response[at + marker.len()..];
    let end = rest
        .find([' ', '\n'])
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    Some(cli_decode(&rest[..end]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_and_decodes_tags() {
        let reply = "playlist%20index%3a2 title%3aBlue%20Train artist%3aJohn%20Coltrane duration%3a324.2";
        assert_eq!(cli_find_tag(reply, "title").as_deref(), Some("Blue Train"));
        assert_eq!(
            cli_find_tag(reply, "artist").as_deref(),
            Some("John Coltrane")
        );
        assert_eq!(cli_find_tag(reply, "duration").as_deref(), Some("324.2"));
        assert!(cli_find_tag(reply, "album").is_none());
    }

    #[test]
    fn tag_lookup_is_case_insensitive() {
        let reply = "Title%3aSong";
        assert_eq!(cli_find_tag(reply, "title").as_deref(), Some("Song"));
    }

    #[tokio::test]
    async fn command_round_trip_against_stub_server() {
        use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let n = socket.read(&mut buf).await.unwrap();
            let line = String::from_utf8_lossy(&buf[..n]).into_owned();
            assert_eq!(line, "aa%3abb%3acc%3add%3aee%3aff time ?\n");
            socket
                .write_all(b"aa%3abb%3acc%3add%3aee%3aff time 42.5\n")
                .await
                .unwrap();
        });

        let client = CliClient::new();
        let reply = client
            .send_command(
                Ipv4Addr::LOCALHOST,
                port,
                "aa:bb:cc:dd:ee:ff time",
                true,
                true,
            )
            .await
            .expect("reply");
        assert_eq!(reply, "42.5");
    }
}
