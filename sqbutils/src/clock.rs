use std::time::Instant;

use once_cell::sync::Lazy;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds since process start, wrapping at u32 like SlimProto jiffies.
pub fn now_ms() -> u32 {
    EPOCH.elapsed().as_millis() as u32
}
