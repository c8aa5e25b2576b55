//! SlimProto plumbing: wire codec for the LMS control channel, UDP server
//! discovery and the CLI side-channel client.

pub mod cli;
pub mod discovery;
pub mod proto;

pub use cli::{cli_find_tag, CliClient, CLI_PORT_DEFAULT};
pub use discovery::{discover_once, DiscoveredServer, SLIM_PORT};
pub use proto::{
    read_message, ClientPacket, ServerMessage, StatData, StatEvent, StrmCommand, StrmMessage,
};
