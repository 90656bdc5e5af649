//! deskline - Connection layer for a remote desktop client
//!
//! Resolves a peer through a rendezvous server, opens a direct or relayed
//! WebSocket channel to it, negotiates an encrypted session and carries
//! session messages and pixel frames over that channel.

pub mod config;
pub mod network;
pub mod protocol;

pub use config::{ClientConfig, ServerEndpoint};
pub use network::{Connection, ConnectionContext, NetworkError};
pub use protocol::Message;
