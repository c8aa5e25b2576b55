//! Small shared helpers: local interface selection, the process millisecond
//! clock used for SlimProto jiffies, the LMS CLI percent-encoding and the
//! 32-bit hash used to detect metadata changes.

mod clock;
mod cliproto;
mod ip;

pub use clock::now_ms;
pub use cliproto::{cli_decode, cli_encode, hash32};
pub use ip::local_ipv4;
