//! Minimal host: reserves one player, runs it against a discovered LMS and
//! logs the actions the bridge would fire at a renderer.
//!
//! Run with `RUST_LOG=info cargo run --example headless_bridge`. Without a
//! real renderer the SetTrack URL is printed so any HTTP client (a
//! browser, curl) can play the part and pull the audio.

use std::sync::Arc;

use sqbridge::{Bridge, PlayerConfig, RendererEvents, SqEvent};

struct LoggingRenderer;

impl RendererEvents for LoggingRenderer {
    fn on_event(&self, event: SqEvent) -> bool {
        match event {
            SqEvent::SetTrack(info) => {
                println!("track ready: {} ({})", info.uri, info.mimetype);
                println!(
                    "  {} - {}",
                    info.metadata.artist_or_empty(),
                    info.metadata.title_or_empty()
                );
            }
            other => println!("event: {other:?}"),
        }
        true
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let bridge = Bridge::with_local_host(8700, "SqueezeBridge");

    let mimetypes: Vec<String> = ["audio/flac", "audio/mpeg", "audio/wav", "*"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    let handle = bridge
        .reserve(true, &mimetypes, Arc::new(LoggingRenderer))
        .expect("a free player slot");

    let config = PlayerConfig {
        name: "Bridge Demo".to_string(),
        mac: [0x00, 0x04, 0x20, 0x1a, 0x4d, 0x01],
        ..PlayerConfig::default()
    };
    bridge.run(handle, config);

    tokio::signal::ctrl_c().await.ok();
    bridge.stop().await;
}
