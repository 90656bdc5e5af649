//! Control-plane messages exchanged with the rendezvous server

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use super::WireMessage;

/// Purpose of the requested session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnType {
    #[default]
    DefaultConn,
    FileTransfer,
    PortForward,
    Rdp,
}

/// NAT classification declared by the client (never measured)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NatType {
    #[default]
    UnknownNat,
    Asymmetric,
    Symmetric,
}

/// Coded lookup failures reported in a punch-hole response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PunchHoleFailure {
    IdNotExist,
    Offline,
    LicenseMismatch,
    LicenseOveruse,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunchHoleRequest {
    pub id: String,
    pub licence_key: String,
    pub conn_type: ConnType,
    pub nat_type: NatType,
}

/// Server reply to a punch-hole request
///
/// `failure` is `None` on success; the zero value is never used as a
/// success marker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunchHoleResponse {
    pub socket_addr: Option<SocketAddr>,
    pub pk: Option<Vec<u8>>,
    pub failure: Option<PunchHoleFailure>,
    pub relay_server: String,
    pub nat_type: Option<NatType>,
    pub is_local: Option<bool>,
    pub other_failure: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRelay {
    pub id: String,
    pub uuid: String,
    pub licence_key: String,
}

/// Relay assignment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayResponse {
    pub socket_addr: Option<SocketAddr>,
    pub uuid: String,
    pub relay_server: String,
    pub id: Option<String>,
    pub pk: Option<Vec<u8>>,
    pub refuse_reason: String,
    pub version: String,
}

/// A control-plane message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RendezvousMessage {
    PunchHoleRequest(PunchHoleRequest),
    PunchHoleResponse(PunchHoleResponse),
    RequestRelay(RequestRelay),
    RelayResponse(RelayResponse),
}

impl WireMessage for RendezvousMessage {}
