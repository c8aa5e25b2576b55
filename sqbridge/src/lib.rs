//! SlimProto ⇄ UPnP HTTP bridge core.
//!
//! The `Bridge` impersonates a fleet of Squeezebox players toward LMS and
//! re-exposes each as an HTTP audio endpoint a UPnP renderer pulls from.
//! The surrounding layer reserves one player per discovered renderer,
//! runs it with a parameter bundle, forwards renderer notifications in and
//! receives `SqEvent` actions out. UPnP discovery and SOAP stay outside.

pub mod events;
pub mod metadata;
pub mod player;

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

pub use events::{RendererEvents, SqEvent, SqNotify, TrackInfo};
pub use player::Player;
pub use sqbaudio::config::{CacheMode, FlacHeaderMode, IcyMode, L24Format, PlayerConfig};
pub use sqbmeta::TrackMetadata;

const MAX_PLAYER: usize = 32;

/// 1-based handle to a reserved player slot.
pub type PlayerHandle = usize;

struct Reservation {
    on: bool,
    mimetypes: Vec<String>,
    events: Arc<dyn RendererEvents>,
    player: Option<Arc<Player>>,
}

/// Owns the player slots and the identity shared by all of them.
pub struct Bridge {
    host: Ipv4Addr,
    base_port: u16,
    model_name: String,
    slots: Mutex<Vec<Option<Reservation>>>,
}

impl Bridge {
    /// `host` is the local address renderers can reach, `base_port` the
    /// start of the per-track HTTP port window.
    pub fn new(host: Ipv4Addr, base_port: u16, model_name: &str) -> Self {
        let mut slots = Vec::with_capacity(MAX_PLAYER);
        slots.resize_with(MAX_PLAYER, || None);
        Self {
            host,
            base_port,
            model_name: model_name.to_string(),
            slots: Mutex::new(slots),
        }
    }

    /// Convenience constructor picking the local address automatically.
    pub fn with_local_host(base_port: u16, model_name: &str) -> Self {
        Self::new(sqbutils::local_ipv4(), base_port, model_name)
    }

    /// Reserves a slot for a renderer. `mimetypes` is its accepted-MIME
    /// list (from ProtocolInfo); `events` receives the bridge's actions.
    pub fn reserve(
        &self,
        on: bool,
        mimetypes: &[String],
        events: Arc<dyn RendererEvents>,
    ) -> Option<PlayerHandle> {
        let mut slots = self.slots.lock().expect("slots lock");
        let index = slots.iter().position(Option::is_none)?;
        slots[index] = Some(Reservation {
            on,
            mimetypes: mimetypes.to_vec(),
            events,
            player: None,
        });
        Some(index + 1)
    }

    /// Releases a reservation that was never run (or already deleted).
    pub fn release(&self, handle: PlayerHandle) {
        if handle == 0 || handle > MAX_PLAYER {
            return;
        }
        let mut slots = self.slots.lock().expect("slots lock");
        slots[handle - 1] = None;
    }

    /// Starts the player: decode loop and SlimProto session spawn here.
    pub fn run(&self, handle: PlayerHandle, config: PlayerConfig) -> bool {
        if handle == 0 || handle > MAX_PLAYER {
            return false;
        }
        let mut slots = self.slots.lock().expect("slots lock");
        let Some(reservation) = slots[handle - 1].as_mut() else {
            warn!("run on unreserved handle {handle}");
            return false;
        };
        if reservation.player.is_some() {
            warn!("player {handle} already running");
            return false;
        }

        let player = Player::new(
            config,
            reservation.on,
            reservation.mimetypes.clone(),
            Arc::clone(&reservation.events),
            self.host,
            self.base_port,
            self.model_name.clone(),
        );
        player.start();
        info!("player {handle} running");
        reservation.player = Some(player);
        true
    }

    /// Stops and removes a player; joins all its tasks.
    pub async fn delete(&self, handle: PlayerHandle) {
        if handle == 0 || handle > MAX_PLAYER {
            return;
        }
        let player = {
            let mut slots = self.slots.lock().expect("slots lock");
            match slots[handle - 1].take() {
                Some(reservation) => reservation.player,
                None => None,
            }
        };
        if let Some(player) = player {
            player.shutdown().await;
        }
    }

    /// Stops every player, for daemon teardown.
    pub async fn stop(&self) {
        for handle in 1..=MAX_PLAYER {
            self.delete(handle).await;
        }
    }

    fn player(&self, handle: PlayerHandle) -> Option<Arc<Player>> {
        if handle == 0 || handle > MAX_PLAYER {
            return None;
        }
        self.slots.lock().expect("slots lock")[handle - 1]
            .as_ref()
            .and_then(|r| r.player.clone())
    }

    /// Renderer-side notification entry point.
    pub async fn notify(&self, handle: PlayerHandle, event: SqNotify) {
        if let Some(player) = self.player(handle) {
            player.notify(event).await;
        }
    }

    /// Current LMS playback position in ms (CLI query).
    pub async fn get_time(&self, handle: PlayerHandle) -> u32 {
        match self.player(handle) {
            Some(player) => player.get_time().await,
            None => 0,
        }
    }

    /// Seeks LMS, position in "seconds[.fraction]" form.
    pub async fn set_time(&self, handle: PlayerHandle, position: &str) -> bool {
        match self.player(handle) {
            Some(player) => player.set_time(position).await,
            None => false,
        }
    }

    /// Elapsed play time from the bridge's own markers.
    pub fn self_time(&self, handle: PlayerHandle) -> u32 {
        self.player(handle).map(|p| p.self_time()).unwrap_or(0)
    }

    /// Metadata for the playing track (-1) or a following one.
    pub async fn get_metadata(&self, handle: PlayerHandle, offset: i32) -> Option<TrackMetadata> {
        match self.player(handle) {
            Some(player) => Some(player.get_metadata(offset).await.0),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullEvents;
    impl RendererEvents for NullEvents {
        fn on_event(&self, _event: SqEvent) -> bool {
            true
        }
    }

    #[test]
    fn reserve_and_release_slots() {
        let bridge = Bridge::new(Ipv4Addr::LOCALHOST, 8700, "UPnPBridge");
        let events: Arc<dyn RendererEvents> = Arc::new(NullEvents);

        let first = bridge.reserve(true, &["audio/flac".into()], Arc::clone(&events));
        let second = bridge.reserve(true, &[], Arc::clone(&events));
        assert_eq!(first, Some(1));
        assert_eq!(second, Some(2));

        bridge.release(1);
        let third = bridge.reserve(false, &[], events);
        assert_eq!(third, Some(1));
    }

    #[test]
    fn all_slots_exhaust() {
        let bridge = Bridge::new(Ipv4Addr::LOCALHOST, 8700, "UPnPBridge");
        let events: Arc<dyn RendererEvents> = Arc::new(NullEvents);
        for _ in 0..MAX_PLAYER {
            assert!(bridge.reserve(true, &[], Arc::clone(&events)).is_some());
        }
        assert!(bridge.reserve(true, &[], events).is_none());
    }

    #[tokio::test]
    async fn delete_unrun_reservation_is_clean() {
        let bridge = Bridge::new(Ipv4Addr::LOCALHOST, 8700, "UPnPBridge");
        let events: Arc<dyn RendererEvents> = Arc::new(NullEvents);
        let handle = bridge.reserve(true, &[], events).unwrap();
        bridge.delete(handle).await;
        assert!(bridge.player(handle).is_none());
    }
}
